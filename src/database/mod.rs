pub mod postgres;

use async_trait::async_trait;

use crate::models::api::ExtractionConfig;
use crate::models::upload::{ExtractState, IngestState, Page, PageState, Schema, Upload};

/// Abstract relational store for uploads, pages and schemas.
///
/// Reads are workspace-scoped unless the method says otherwise; the pipeline
/// uses the unscoped getters because background jobs carry only upload ids.
#[async_trait]
pub trait Database: Send + Sync {
    /// Create tables and indexes.
    async fn initialize(&self) -> anyhow::Result<()>;

    // ── Uploads ──────────────────────────────────────────────────────────

    async fn create_upload(&self, upload: &Upload) -> anyhow::Result<()>;

    async fn get_upload(&self, id: &str, workspace_id: &str) -> anyhow::Result<Option<Upload>>;

    async fn get_upload_unscoped(&self, id: &str) -> anyhow::Result<Option<Upload>>;

    async fn list_uploads(&self, workspace_id: &str) -> anyhow::Result<Vec<Upload>>;

    async fn update_upload_meta(
        &self,
        id: &str,
        workspace_id: &str,
        company: Option<&str>,
        year: Option<i32>,
        month: Option<i32>,
    ) -> anyhow::Result<bool>;

    /// Delete the upload row; pages cascade.
    async fn delete_upload(&self, id: &str) -> anyhow::Result<bool>;

    async fn set_state(&self, id: &str, state: IngestState, message: &str) -> anyhow::Result<()>;

    /// Optimistic compare-and-swap on the ingest state. Returns false when
    /// the upload was not in any of the expected states.
    async fn try_transition(
        &self,
        id: &str,
        from: &[IngestState],
        to: IngestState,
        message: &str,
    ) -> anyhow::Result<bool>;

    async fn set_total_pages(&self, id: &str, total_pages: i32) -> anyhow::Result<()>;

    /// Monotonic: never decreases the persisted counter.
    async fn advance_current_page(&self, id: &str, current_page: i32) -> anyhow::Result<()>;

    /// Start a fresh ingest run (reparse): zero the page counter.
    async fn reset_current_page(&self, id: &str) -> anyhow::Result<()>;

    async fn set_extract_state(&self, id: &str, state: ExtractState) -> anyhow::Result<()>;

    /// Other `done`-extracted uploads of the same workspace and company.
    async fn comparable_uploads(
        &self,
        workspace_id: &str,
        company: &str,
        exclude_id: &str,
    ) -> anyhow::Result<Vec<Upload>>;

    /// Done uploads of a company whose auto-extraction never produced output.
    async fn uploads_needing_reextract(
        &self,
        workspace_id: &str,
        company: &str,
    ) -> anyhow::Result<Vec<String>>;

    // ── Pages ────────────────────────────────────────────────────────────

    async fn upsert_page_pending(&self, upload_id: &str, page_num: i32) -> anyhow::Result<()>;

    async fn get_page(&self, upload_id: &str, page_num: i32) -> anyhow::Result<Option<Page>>;

    async fn page_states(&self, upload_id: &str) -> anyhow::Result<Vec<(i32, PageState)>>;

    /// Page numbers awaiting OCR, ascending. `include_errors` re-queues
    /// failed pages as well (fresh parse and reparse, not resume).
    async fn pages_to_parse(
        &self,
        upload_id: &str,
        include_errors: bool,
    ) -> anyhow::Result<Vec<i32>>;

    async fn set_page_running(&self, upload_id: &str, page_num: i32) -> anyhow::Result<()>;

    async fn set_page_done(
        &self,
        upload_id: &str,
        page_num: i32,
        markdown: &str,
    ) -> anyhow::Result<()>;

    async fn set_page_error(
        &self,
        upload_id: &str,
        page_num: i32,
        error: &str,
    ) -> anyhow::Result<()>;

    /// Overwrite stored markdown (table correction), leaving state untouched.
    async fn set_page_markdown(
        &self,
        upload_id: &str,
        page_num: i32,
        markdown: &str,
    ) -> anyhow::Result<()>;

    /// Reset every page to `pending` and clear markdown/errors.
    async fn reset_pages_for_reparse(&self, upload_id: &str) -> anyhow::Result<()>;

    async fn count_terminal_pages(&self, upload_id: &str) -> anyhow::Result<i64>;

    async fn count_pages_in_state(
        &self,
        upload_id: &str,
        state: PageState,
    ) -> anyhow::Result<i64>;

    /// Markdown of `done` pages, ordered by page number.
    async fn done_page_markdown(&self, upload_id: &str) -> anyhow::Result<Vec<(i32, String)>>;

    // ── Schemas ──────────────────────────────────────────────────────────

    async fn create_schema(&self, schema: &Schema) -> anyhow::Result<()>;

    async fn get_schema(&self, id: &str, workspace_id: &str) -> anyhow::Result<Option<Schema>>;

    async fn list_schemas(
        &self,
        workspace_id: &str,
        company: Option<&str>,
    ) -> anyhow::Result<Vec<Schema>>;

    async fn update_schema(
        &self,
        id: &str,
        workspace_id: &str,
        company: Option<&str>,
        name: Option<&str>,
        config: Option<&ExtractionConfig>,
    ) -> anyhow::Result<bool>;

    async fn delete_schema(&self, id: &str, workspace_id: &str) -> anyhow::Result<bool>;

    /// Make one schema the default for its (workspace, company), clearing
    /// any previous default in the same transaction.
    async fn set_default_schema(&self, id: &str, workspace_id: &str) -> anyhow::Result<bool>;

    async fn get_default_schema(
        &self,
        workspace_id: &str,
        company: &str,
    ) -> anyhow::Result<Option<Schema>>;

    // ── Crash recovery ───────────────────────────────────────────────────

    /// Startup pass: revert `running` pages to `pending` and mark uploads
    /// that died mid-ingest as `interrupted`.
    async fn recover_interrupted(&self) -> anyhow::Result<()>;
}
