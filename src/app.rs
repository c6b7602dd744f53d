use std::sync::Arc;

use crate::blacklist::TokenBlacklist;
use crate::ocr::client::ChatClient;
use crate::pipeline::PipelineContext;

/// Shared application state passed to all route handlers.
pub struct AppState {
    pub ctx: PipelineContext,
    pub vlm: Arc<ChatClient>,
    pub llm: Arc<ChatClient>,
    pub blacklist: Arc<TokenBlacklist>,
}
