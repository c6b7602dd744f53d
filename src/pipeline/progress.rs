use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::upload::{ExtractState, IngestState, Upload};

/// One state-update record streamed to SSE subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressUpdate {
    pub state: IngestState,
    pub current_page: i32,
    pub total_pages: i32,
    pub message: String,
    pub extract_state: ExtractState,
}

impl ProgressUpdate {
    pub fn from_upload(upload: &Upload) -> Self {
        Self {
            state: upload.state,
            current_page: upload.current_page,
            total_pages: upload.total_pages,
            message: upload.message.clone(),
            extract_state: upload.extract_state,
        }
    }

    /// The channel closes once ingest has ended and no extraction is
    /// in flight.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal() && self.extract_state != ExtractState::Running
    }
}

const CHANNEL_CAPACITY: usize = 64;

struct ProgressChannel {
    tx: broadcast::Sender<ProgressUpdate>,
    latest: RwLock<Option<ProgressUpdate>>,
}

/// Per-upload single-producer / many-consumer progress broadcast.
///
/// Publishing is wait-free for the producer; a slow subscriber lags and
/// skips records instead of blocking anyone. Subscribers connecting late
/// receive the latest record immediately. The terminal record is sent before
/// the channel is torn down, so connected subscribers always see it.
pub struct ProgressRegistry {
    channels: Mutex<HashMap<String, Arc<ProgressChannel>>>,
}

impl Default for ProgressRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressRegistry {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn channel(&self, upload_id: &str) -> Arc<ProgressChannel> {
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(upload_id.to_string())
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
                Arc::new(ProgressChannel {
                    tx,
                    latest: RwLock::new(None),
                })
            })
            .clone()
    }

    pub fn publish(&self, upload_id: &str, update: ProgressUpdate) {
        let channel = self.channel(upload_id);
        *channel.latest.write().unwrap() = Some(update.clone());
        let terminal = update.is_terminal();
        let _ = channel.tx.send(update);

        if terminal {
            // Dropping the registry's sender handle closes the stream for
            // every subscriber after they drain what was already sent.
            self.channels.lock().unwrap().remove(upload_id);
        }
    }

    /// Subscribe to an active upload: the latest record (if any) plus a
    /// receiver for everything published afterwards. `None` when no ingest
    /// or extraction is currently running for the upload.
    pub fn subscribe(
        &self,
        upload_id: &str,
    ) -> Option<(Option<ProgressUpdate>, broadcast::Receiver<ProgressUpdate>)> {
        let channels = self.channels.lock().unwrap();
        let channel = channels.get(upload_id)?;
        let result = (
            channel.latest.read().unwrap().clone(),
            channel.tx.subscribe(),
        );
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(state: IngestState, current: i32) -> ProgressUpdate {
        ProgressUpdate {
            state,
            current_page: current,
            total_pages: 10,
            message: format!("page {current}"),
            extract_state: ExtractState::None,
        }
    }

    #[tokio::test]
    async fn test_subscriber_receives_published_updates() {
        let registry = ProgressRegistry::new();
        registry.publish("up1", update(IngestState::Parsing, 1));

        let (latest, mut rx) = registry.subscribe("up1").unwrap();
        assert_eq!(latest.unwrap().current_page, 1);

        registry.publish("up1", update(IngestState::Parsing, 2));
        let got = rx.recv().await.unwrap();
        assert_eq!(got.current_page, 2);
    }

    #[tokio::test]
    async fn test_terminal_update_closes_channel() {
        let registry = ProgressRegistry::new();
        registry.publish("up1", update(IngestState::Parsing, 9));
        let (_, mut rx) = registry.subscribe("up1").unwrap();

        registry.publish("up1", update(IngestState::Done, 10));

        // The terminal record arrives, then the stream ends.
        let got = rx.recv().await.unwrap();
        assert!(got.is_terminal());
        assert!(rx.recv().await.is_err());

        // The channel is gone for new subscribers.
        assert!(registry.subscribe("up1").is_none());
    }

    #[tokio::test]
    async fn test_done_with_running_extraction_stays_open() {
        let registry = ProgressRegistry::new();
        let mut done = update(IngestState::Done, 10);
        done.extract_state = ExtractState::Running;
        assert!(!done.is_terminal());

        registry.publish("up1", done);
        assert!(registry.subscribe("up1").is_some());

        let mut finished = update(IngestState::Done, 10);
        finished.extract_state = ExtractState::Done;
        assert!(finished.is_terminal());
        registry.publish("up1", finished);
        assert!(registry.subscribe("up1").is_none());
    }

    #[test]
    fn test_subscribe_unknown_upload() {
        let registry = ProgressRegistry::new();
        assert!(registry.subscribe("nope").is_none());
    }
}
