use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::api::ExtractionConfig;

/// Ingest state of an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestState {
    Queued,
    Rendering,
    Parsing,
    Done,
    Error,
    Interrupted,
}

impl IngestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestState::Queued => "queued",
            IngestState::Rendering => "rendering",
            IngestState::Parsing => "parsing",
            IngestState::Done => "done",
            IngestState::Error => "error",
            IngestState::Interrupted => "interrupted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(IngestState::Queued),
            "rendering" => Some(IngestState::Rendering),
            "parsing" => Some(IngestState::Parsing),
            "done" => Some(IngestState::Done),
            "error" => Some(IngestState::Error),
            "interrupted" => Some(IngestState::Interrupted),
            _ => None,
        }
    }

    /// Terminal states end the ingest run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IngestState::Done | IngestState::Error | IngestState::Interrupted
        )
    }
}

/// OCR state of a single page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageState {
    Pending,
    Running,
    Done,
    Error,
}

impl PageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PageState::Pending => "pending",
            PageState::Running => "running",
            PageState::Done => "done",
            PageState::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PageState::Pending),
            "running" => Some(PageState::Running),
            "done" => Some(PageState::Done),
            "error" => Some(PageState::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PageState::Done | PageState::Error)
    }
}

/// Auto-extraction state of an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractState {
    None,
    Running,
    Done,
    Error,
    NoConfig,
}

impl ExtractState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractState::None => "none",
            ExtractState::Running => "running",
            ExtractState::Done => "done",
            ExtractState::Error => "error",
            ExtractState::NoConfig => "no_config",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(ExtractState::None),
            "running" => Some(ExtractState::Running),
            "done" => Some(ExtractState::Done),
            "error" => Some(ExtractState::Error),
            "no_config" => Some(ExtractState::NoConfig),
            _ => None,
        }
    }
}

/// Source document type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocType {
    Pdf,
    Image,
}

impl DocType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::Pdf => "pdf",
            DocType::Image => "image",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pdf" => Some(DocType::Pdf),
            "image" => Some(DocType::Image),
            _ => None,
        }
    }
}

/// A workspace-scoped pricelist upload.
#[derive(Debug, Clone, Serialize)]
pub struct Upload {
    pub id: String,
    pub workspace_id: String,
    pub filename: String,
    pub company: String,
    pub year: Option<i32>,
    pub month: Option<i32>,
    pub doc_type: DocType,
    pub state: IngestState,
    pub message: String,
    pub total_pages: i32,
    pub current_page: i32,
    pub extract_state: ExtractState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Upload {
    /// Object-store key of the original document in the `pdfs` bucket.
    pub fn original_key(&self) -> String {
        let ext = match self.doc_type {
            DocType::Pdf => "pdf",
            DocType::Image => {
                if self.filename.to_lowercase().ends_with(".jpg")
                    || self.filename.to_lowercase().ends_with(".jpeg")
                {
                    "jpg"
                } else {
                    "png"
                }
            }
        };
        format!("{}/original.{ext}", self.id)
    }
}

/// One OCR'd page of an upload.
#[derive(Debug, Clone, Serialize)]
pub struct Page {
    pub upload_id: String,
    pub page_num: i32,
    pub markdown: Option<String>,
    pub state: PageState,
    pub error: Option<String>,
}

/// A named, persisted extraction config for a (workspace, company).
#[derive(Debug, Clone, Serialize)]
pub struct Schema {
    pub id: String,
    pub workspace_id: String,
    pub company: String,
    pub name: String,
    pub config: ExtractionConfig,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
}

/// Object-store key of a page raster in the `pages` bucket.
pub fn page_key(upload_id: &str, page_num: i32) -> String {
    format!("{upload_id}/page_{page_num:03}.png")
}

/// Object-store key of the cached extraction CSV in the `output` bucket.
pub fn csv_key(upload_id: &str) -> String {
    format!("{upload_id}.csv")
}

/// Short upload/schema identifier (12 hex chars of a v4 UUID).
pub fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for s in [
            IngestState::Queued,
            IngestState::Rendering,
            IngestState::Parsing,
            IngestState::Done,
            IngestState::Error,
            IngestState::Interrupted,
        ] {
            assert_eq!(IngestState::parse(s.as_str()), Some(s));
        }
        assert_eq!(IngestState::parse("bogus"), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(IngestState::Done.is_terminal());
        assert!(IngestState::Error.is_terminal());
        assert!(IngestState::Interrupted.is_terminal());
        assert!(!IngestState::Parsing.is_terminal());
        assert!(PageState::Done.is_terminal());
        assert!(PageState::Error.is_terminal());
        assert!(!PageState::Running.is_terminal());
    }

    #[test]
    fn test_extract_state_snake_case() {
        assert_eq!(ExtractState::NoConfig.as_str(), "no_config");
        assert_eq!(ExtractState::parse("no_config"), Some(ExtractState::NoConfig));
        let json = serde_json::to_string(&ExtractState::NoConfig).unwrap();
        assert_eq!(json, "\"no_config\"");
    }

    #[test]
    fn test_page_key_zero_padded() {
        assert_eq!(page_key("abc123", 7), "abc123/page_007.png");
        assert_eq!(page_key("abc123", 123), "abc123/page_123.png");
    }

    #[test]
    fn test_short_id_length() {
        let id = short_id();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
