pub mod progress;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::csv_out;
use crate::database::Database;
use crate::extract::engine::run_extraction;
use crate::extract::resolver::{count_usable_tables, SynonymTable};
use crate::models::api::{ExtractionConfig, ExtractionResult};
use crate::models::upload::{csv_key, page_key, ExtractState, IngestState, PageState};
use crate::ocr::client::OcrClient;
use crate::render::Renderer;
use crate::storage::{ObjectStore, BUCKET_OUTPUT, BUCKET_PAGES, BUCKET_PDFS};
use crate::tables::parser::parse_page;
use crate::tables::PageTables;

use progress::{ProgressRegistry, ProgressUpdate};

/// Per-upload async locks serializing state mutations.
#[derive(Default)]
pub struct UploadLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl UploadLocks {
    pub async fn acquire(&self, upload_id: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap();
            locks
                .entry(upload_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    pub fn remove(&self, upload_id: &str) {
        self.locks.lock().unwrap().remove(upload_id);
    }
}

/// Delete tombstones. Workers observe them at page boundaries and exit
/// without mutating state.
#[derive(Default)]
pub struct CancelRegistry {
    cancelled: Mutex<HashSet<String>>,
}

impl CancelRegistry {
    pub fn mark(&self, upload_id: &str) {
        self.cancelled.lock().unwrap().insert(upload_id.to_string());
    }

    pub fn is_cancelled(&self, upload_id: &str) -> bool {
        self.cancelled.lock().unwrap().contains(upload_id)
    }

    pub fn clear(&self, upload_id: &str) {
        self.cancelled.lock().unwrap().remove(upload_id);
    }
}

/// Per-upload cache of the last extraction, keyed by the config that
/// produced it. Invalidated whenever page markdown changes.
#[derive(Default)]
pub struct ExtractionCache {
    entries: Mutex<HashMap<String, (ExtractionConfig, Arc<ExtractionResult>)>>,
}

impl ExtractionCache {
    pub fn get(&self, upload_id: &str, config: &ExtractionConfig) -> Option<Arc<ExtractionResult>> {
        let entries = self.entries.lock().unwrap();
        entries
            .get(upload_id)
            .filter(|(cached_config, _)| cached_config == config)
            .map(|(_, result)| result.clone())
    }

    pub fn put(&self, upload_id: &str, config: ExtractionConfig, result: Arc<ExtractionResult>) {
        self.entries
            .lock()
            .unwrap()
            .insert(upload_id.to_string(), (config, result));
    }

    pub fn invalidate(&self, upload_id: &str) {
        self.entries.lock().unwrap().remove(upload_id);
    }
}

/// Everything a background job needs, threaded explicitly — no ambient
/// globals.
#[derive(Clone)]
pub struct PipelineContext {
    pub settings: Arc<Settings>,
    pub db: Arc<dyn Database>,
    pub store: Arc<dyn ObjectStore>,
    pub ocr: Arc<OcrClient>,
    pub renderer: Renderer,
    /// Process-wide page-level worker pool.
    pub workers: Arc<Semaphore>,
    pub progress: Arc<ProgressRegistry>,
    pub cancellations: Arc<CancelRegistry>,
    pub locks: Arc<UploadLocks>,
    pub cache: Arc<ExtractionCache>,
    pub synonyms: Arc<SynonymTable>,
}

impl PipelineContext {
    async fn publish_from_db(&self, upload_id: &str) {
        match self.db.get_upload_unscoped(upload_id).await {
            Ok(Some(upload)) => self
                .progress
                .publish(upload_id, ProgressUpdate::from_upload(&upload)),
            Ok(None) => {}
            Err(e) => warn!("progress publish failed for {upload_id}: {e}"),
        }
    }

    async fn set_state_and_publish(&self, upload_id: &str, state: IngestState, message: &str) {
        if let Err(e) = self.db.set_state(upload_id, state, message).await {
            error!("state update failed for {upload_id}: {e}");
        }
        self.publish_from_db(upload_id).await;
    }
}

/// Kick off ingest for a freshly created or resumed upload.
pub fn spawn_ingest(ctx: PipelineContext, upload_id: String) {
    tokio::spawn(async move {
        run_ingest(&ctx, &upload_id).await;
    });
}

pub fn spawn_resume(ctx: PipelineContext, upload_id: String) {
    tokio::spawn(async move {
        run_resume(&ctx, &upload_id).await;
    });
}

pub fn spawn_reparse(ctx: PipelineContext, upload_id: String) {
    tokio::spawn(async move {
        run_reparse(&ctx, &upload_id).await;
    });
}

async fn run_ingest(ctx: &PipelineContext, upload_id: &str) {
    if let Err(e) = ingest_inner(ctx, upload_id).await {
        error!("ingest failed for {upload_id}: {e:#}");
        ctx.set_state_and_publish(upload_id, IngestState::Error, &format!("Ingest failed: {e}"))
            .await;
    }
}

async fn ingest_inner(ctx: &PipelineContext, upload_id: &str) -> anyhow::Result<()> {
    let Some(upload) = ctx.db.get_upload_unscoped(upload_id).await? else {
        return Ok(());
    };

    // CAS guards against a concurrent worker picking up the same upload.
    let claimed = ctx
        .db
        .try_transition(
            upload_id,
            &[IngestState::Queued, IngestState::Interrupted],
            IngestState::Rendering,
            "Rendering pages...",
        )
        .await?;
    if !claimed {
        warn!("upload {upload_id} already claimed, skipping");
        return Ok(());
    }
    ctx.publish_from_db(upload_id).await;

    let original = ctx.store.get(BUCKET_PDFS, &upload.original_key()).await?;

    let pngs = match upload.doc_type {
        crate::models::upload::DocType::Pdf => ctx.renderer.render_pdf(original).await,
        crate::models::upload::DocType::Image => ctx.renderer.render_image(original).await,
    };
    let pngs = match pngs {
        Ok(pngs) => pngs,
        Err(e) => {
            ctx.set_state_and_publish(upload_id, IngestState::Error, &format!("Render failed: {e}"))
                .await;
            return Ok(());
        }
    };

    let total = pngs.len() as i32;
    for (i, png) in pngs.iter().enumerate() {
        ctx.store
            .put(
                BUCKET_PAGES,
                &page_key(upload_id, i as i32 + 1),
                png,
                "image/png",
            )
            .await?;
    }

    ctx.db.set_total_pages(upload_id, total).await?;
    for i in 1..=total {
        ctx.db.upsert_page_pending(upload_id, i).await?;
    }
    info!("upload {upload_id}: rendered {total} pages");

    ctx.set_state_and_publish(
        upload_id,
        IngestState::Parsing,
        &format!("Starting OCR ({} workers)...", ctx.settings.ocr_worker_count),
    )
    .await;

    parse_pages(ctx, upload_id, true).await?;
    finish_parse(ctx, upload_id).await
}

/// Resume after a crash: pages already terminal are left alone; the rest are
/// re-queued. Re-renders from scratch when the render step never finished.
async fn run_resume(ctx: &PipelineContext, upload_id: &str) {
    let result = async {
        let Some(upload) = ctx.db.get_upload_unscoped(upload_id).await? else {
            return Ok(());
        };

        if upload.total_pages == 0 {
            // Interrupted before rendering finished; start over.
            return ingest_inner(ctx, upload_id).await;
        }

        let claimed = ctx
            .db
            .try_transition(
                upload_id,
                &[IngestState::Interrupted],
                IngestState::Parsing,
                "Resuming OCR...",
            )
            .await?;
        if !claimed {
            return Ok(());
        }
        ctx.publish_from_db(upload_id).await;

        parse_pages(ctx, upload_id, false).await?;
        finish_parse(ctx, upload_id).await
    }
    .await;

    if let Err(e) = result {
        error!("resume failed for {upload_id}: {e:#}");
        ctx.set_state_and_publish(upload_id, IngestState::Error, &format!("Resume failed: {e}"))
            .await;
    }
}

/// Reparse: reset every page, drop cached extraction output, OCR again.
async fn run_reparse(ctx: &PipelineContext, upload_id: &str) {
    let result = async {
        let claimed = ctx
            .db
            .try_transition(
                upload_id,
                &[IngestState::Done],
                IngestState::Parsing,
                "Reparsing all pages...",
            )
            .await?;
        if !claimed {
            return Ok(());
        }

        ctx.db.reset_pages_for_reparse(upload_id).await?;
        ctx.db.reset_current_page(upload_id).await?;
        ctx.db
            .set_extract_state(upload_id, ExtractState::None)
            .await?;
        ctx.cache.invalidate(upload_id);
        ctx.store
            .delete_prefix(BUCKET_OUTPUT, &csv_key(upload_id))
            .await?;
        ctx.publish_from_db(upload_id).await;

        parse_pages(ctx, upload_id, true).await?;
        finish_parse(ctx, upload_id).await
    }
    .await;

    if let Err(e) = result {
        error!("reparse failed for {upload_id}: {e:#}");
        ctx.set_state_and_publish(upload_id, IngestState::Error, &format!("Reparse failed: {e}"))
            .await;
    }
}

/// OCR every queued page through the shared worker pool. Page writes may
/// complete out of order; the progress counter counts terminal pages and
/// only moves forward.
async fn parse_pages(
    ctx: &PipelineContext,
    upload_id: &str,
    include_errors: bool,
) -> anyhow::Result<()> {
    let page_nums = ctx.db.pages_to_parse(upload_id, include_errors).await?;
    if page_nums.is_empty() {
        return Ok(());
    }

    let total_pages = ctx
        .db
        .get_upload_unscoped(upload_id)
        .await?
        .map(|u| u.total_pages)
        .unwrap_or(0);

    let mut tasks = JoinSet::new();
    for page_num in page_nums {
        let ctx = ctx.clone();
        let upload_id = upload_id.to_string();
        tasks.spawn(async move {
            let Ok(_permit) = ctx.workers.clone().acquire_owned().await else {
                return;
            };
            ocr_one_page(&ctx, &upload_id, page_num, total_pages).await;
        });
    }
    while tasks.join_next().await.is_some() {}

    Ok(())
}

async fn ocr_one_page(ctx: &PipelineContext, upload_id: &str, page_num: i32, total_pages: i32) {
    // Tombstone check at the page boundary.
    if ctx.cancellations.is_cancelled(upload_id) {
        return;
    }

    if let Err(e) = ctx.db.set_page_running(upload_id, page_num).await {
        error!("page {upload_id}/{page_num}: state update failed: {e}");
        return;
    }

    let outcome = async {
        let png = ctx
            .store
            .get(BUCKET_PAGES, &page_key(upload_id, page_num))
            .await
            .map_err(|e| format!("page image missing: {e}"))?;
        ctx.ocr
            .ocr(&png, "image/png")
            .await
            .map_err(|e| format!("{e}"))
    }
    .await;

    if ctx.cancellations.is_cancelled(upload_id) {
        return;
    }

    let persisted = match &outcome {
        Ok(markdown) => ctx.db.set_page_done(upload_id, page_num, markdown).await,
        Err(message) => {
            warn!("page {upload_id}/{page_num} failed: {message}");
            ctx.db.set_page_error(upload_id, page_num, message).await
        }
    };
    if let Err(e) = persisted {
        error!("page {upload_id}/{page_num}: persist failed: {e}");
        return;
    }

    // Serialize the counter update per upload; the count of terminal pages
    // is authoritative and monotonic.
    let _guard = ctx.locks.acquire(upload_id).await;
    let current = match ctx.db.count_terminal_pages(upload_id).await {
        Ok(n) => n as i32,
        Err(e) => {
            error!("page count failed for {upload_id}: {e}");
            return;
        }
    };
    if let Err(e) = ctx.db.advance_current_page(upload_id, current).await {
        error!("progress update failed for {upload_id}: {e}");
    }
    if let Err(e) = ctx
        .db
        .set_state(
            upload_id,
            IngestState::Parsing,
            &format!("Parsed {current}/{total_pages}"),
        )
        .await
    {
        error!("message update failed for {upload_id}: {e}");
    }
    ctx.publish_from_db(upload_id).await;
}

/// All pages terminal: close out the run and fire auto-extraction.
async fn finish_parse(ctx: &PipelineContext, upload_id: &str) -> anyhow::Result<()> {
    if ctx.cancellations.is_cancelled(upload_id) {
        ctx.cancellations.clear(upload_id);
        return Ok(());
    }

    let Some(upload) = ctx.db.get_upload_unscoped(upload_id).await? else {
        return Ok(());
    };

    let total = upload.total_pages as i64;
    let errors = ctx
        .db
        .count_pages_in_state(upload_id, PageState::Error)
        .await?;

    if total > 0 && errors >= total {
        ctx.set_state_and_publish(upload_id, IngestState::Error, "Every page failed OCR")
            .await;
        return Ok(());
    }

    let terminal = ctx.db.count_terminal_pages(upload_id).await? as i32;
    ctx.db.advance_current_page(upload_id, terminal).await?;
    ctx.db
        .set_state(
            upload_id,
            IngestState::Done,
            &format!("Done — {total} pages parsed"),
        )
        .await?;
    ctx.publish_from_db(upload_id).await;

    run_auto_extract(ctx, upload_id).await;
    Ok(())
}

/// Auto-extraction with the workspace-default schema for the upload's
/// company. Failures never poison the upload: manual extraction stays
/// available.
pub async fn run_auto_extract(ctx: &PipelineContext, upload_id: &str) {
    let result = auto_extract_inner(ctx, upload_id).await;
    if let Err(e) = result {
        warn!("auto-extract failed for {upload_id}: {e:#}");
        if let Err(e) = ctx
            .db
            .set_extract_state(upload_id, ExtractState::Error)
            .await
        {
            error!("extract state update failed for {upload_id}: {e}");
        }
        ctx.publish_from_db(upload_id).await;
    }
}

async fn auto_extract_inner(ctx: &PipelineContext, upload_id: &str) -> anyhow::Result<()> {
    let Some(upload) = ctx.db.get_upload_unscoped(upload_id).await? else {
        return Ok(());
    };

    let schema = ctx
        .db
        .get_default_schema(&upload.workspace_id, &upload.company)
        .await?;
    let Some(schema) = schema else {
        ctx.db
            .set_extract_state(upload_id, ExtractState::NoConfig)
            .await?;
        ctx.publish_from_db(upload_id).await;
        return Ok(());
    };
    if schema.config.validate().is_err() {
        ctx.db
            .set_extract_state(upload_id, ExtractState::NoConfig)
            .await?;
        ctx.publish_from_db(upload_id).await;
        return Ok(());
    }

    ctx.db
        .set_extract_state(upload_id, ExtractState::Running)
        .await?;
    ctx.publish_from_db(upload_id).await;

    let pages = load_parsed_pages(ctx, upload_id).await?;
    if count_usable_tables(&pages, &schema.config, &ctx.synonyms) == 0 {
        anyhow::bail!("no table resolves the configured anchors");
    }

    let result = Arc::new(run_extraction(&pages, &schema.config, &ctx.synonyms));

    let csv = csv_out::write_csv(&result.columns, &result.rows);
    ctx.store
        .put(
            BUCKET_OUTPUT,
            &csv_key(upload_id),
            csv.as_bytes(),
            "text/csv",
        )
        .await?;

    ctx.cache.put(upload_id, schema.config.clone(), result);
    ctx.db
        .set_extract_state(upload_id, ExtractState::Done)
        .await?;
    ctx.publish_from_db(upload_id).await;
    info!("auto-extract finished for {upload_id}");
    Ok(())
}

/// Parse the stored markdown of every `done` page.
pub async fn load_parsed_pages(
    ctx: &PipelineContext,
    upload_id: &str,
) -> anyhow::Result<Vec<PageTables>> {
    Ok(ctx
        .db
        .done_page_markdown(upload_id)
        .await?
        .iter()
        .map(|(page_num, markdown)| parse_page(*page_num, markdown))
        .collect())
}

/// Cascade delete: tombstone for active workers, blobs under all three
/// bucket prefixes, then the rows.
pub async fn delete_upload(ctx: &PipelineContext, upload_id: &str) -> anyhow::Result<()> {
    ctx.cancellations.mark(upload_id);
    ctx.cache.invalidate(upload_id);

    ctx.store
        .delete_prefix(BUCKET_PDFS, &format!("{upload_id}/"))
        .await?;
    ctx.store
        .delete_prefix(BUCKET_PAGES, &format!("{upload_id}/"))
        .await?;
    ctx.store
        .delete_prefix(BUCKET_OUTPUT, &csv_key(upload_id))
        .await?;

    ctx.db.delete_upload(upload_id).await?;
    ctx.locks.remove(upload_id);
    Ok(())
}
