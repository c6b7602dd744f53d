use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::{image_data_url, ChatMessage, ChatRequest, ChatResponse, OcrError};

/// The OCR model is fixed and prompt-less; it is not a configuration knob.
const OCR_MODEL_ID: &str = "lightonai/LightOnOCR-2-1B";
const OCR_MAX_TOKENS: u32 = 4096;
pub const OCR_TIMEOUT: Duration = Duration::from_secs(120);
pub const CORRECTION_TIMEOUT: Duration = Duration::from_secs(180);

const MAX_ATTEMPTS: u32 = 4;
const BACKOFF_BASE_MS: u64 = 500;
const BACKOFF_CAP_MS: u64 = 8_000;

/// Client for one OpenAI-compatible chat-completions endpoint.
///
/// Retries transient failures (network errors, 5xx) with exponential backoff;
/// a 4xx is final and surfaces as `OcrError::Upstream`.
pub struct ChatClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
}

impl ChatClient {
    pub fn new(base_url: &str, model: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }

    pub async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        max_tokens: u32,
        temperature: f64,
        timeout: Duration,
    ) -> Result<String, OcrError> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages,
            max_tokens: Some(max_tokens),
            temperature: Some(temperature),
            stream: false,
        };

        let url = format!("{}/chat/completions", self.base_url);
        let mut last_err: Option<OcrError> = None;

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                let backoff = (BACKOFF_BASE_MS * 2u64.pow(attempt - 1)).min(BACKOFF_CAP_MS);
                warn!("chat completion retry {attempt}/{} after {backoff}ms", MAX_ATTEMPTS - 1);
                sleep(Duration::from_millis(backoff)).await;
            }

            let resp = match self
                .http
                .post(&url)
                .timeout(timeout)
                .json(&request)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    last_err = Some(OcrError::Network(e.to_string()));
                    continue;
                }
            };

            let status = resp.status();
            if status.is_client_error() {
                let body = resp.text().await.unwrap_or_default();
                return Err(OcrError::Upstream(format!("{status}: {body}")));
            }
            if status.is_server_error() {
                let body = resp.text().await.unwrap_or_default();
                last_err = Some(OcrError::Upstream(format!("{status}: {body}")));
                continue;
            }

            let parsed: ChatResponse = resp
                .json()
                .await
                .map_err(|e| OcrError::Upstream(format!("malformed completion response: {e}")))?;

            return Ok(parsed
                .choices
                .first()
                .and_then(|c| c.message.content.clone())
                .unwrap_or_default());
        }

        Err(match last_err {
            Some(OcrError::Network(e)) => OcrError::Network(e),
            Some(other) => other,
            None => OcrError::Upstream("retries exhausted".to_string()),
        })
    }
}

/// Client for the external OCR model.
///
/// A single instance is shared process-wide; the semaphore is a soft cap on
/// concurrent in-flight OCR requests independent of the ingest pool size.
pub struct OcrClient {
    chat: ChatClient,
    limiter: Arc<Semaphore>,
}

impl OcrClient {
    pub fn new(server_url: &str, concurrency: usize) -> Self {
        Self {
            chat: ChatClient::new(server_url, OCR_MODEL_ID),
            limiter: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// OCR one page image to markdown.
    ///
    /// The model is prompt-less: a single user message carrying only the
    /// image part.
    pub async fn ocr(&self, image: &[u8], mime: &str) -> Result<String, OcrError> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|e| OcrError::Upstream(format!("semaphore closed: {e}")))?;

        let message = ChatMessage::user_with_image("", image_data_url(image, mime));
        let raw = self
            .chat
            .complete(vec![message], OCR_MAX_TOKENS, 0.0, OCR_TIMEOUT)
            .await?;

        debug!("OCR produced {} bytes of markdown", raw.len());
        Ok(clean_ocr_output(&raw))
    }
}

/// Strip chat-role marker lines that some serving stacks leak into the
/// completion text.
fn clean_ocr_output(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    text.lines()
        .filter(|line| {
            let lower = line.trim().to_lowercase();
            !matches!(lower.as_str(), "system" | "user" | "assistant")
        })
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_ocr_output_strips_role_markers() {
        let raw = "assistant\n# Page 1\n\nuser\n<table></table>\n";
        assert_eq!(clean_ocr_output(raw), "# Page 1\n\n<table></table>");
    }

    #[test]
    fn test_clean_ocr_output_keeps_normal_text() {
        let raw = "# Heading\nSome user guide text.";
        assert_eq!(clean_ocr_output(raw), raw);
    }

    #[test]
    fn test_clean_ocr_output_empty() {
        assert_eq!(clean_ocr_output(""), "");
    }

    #[test]
    fn test_backoff_sequence_capped() {
        let delays: Vec<u64> = (1..MAX_ATTEMPTS)
            .map(|a| (BACKOFF_BASE_MS * 2u64.pow(a - 1)).min(BACKOFF_CAP_MS))
            .collect();
        assert_eq!(delays, vec![500, 1000, 2000]);
        assert!((BACKOFF_BASE_MS * 2u64.pow(10)).min(BACKOFF_CAP_MS) == BACKOFF_CAP_MS);
    }
}
