use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::app::AppState;
use crate::correction;
use crate::csv_out;
use crate::error::ApiError;
use crate::models::api::{
    ApplyCorrectionRequest, CorrectionMethod, ValidateTableRequest, ValidateTableResponse,
};
use crate::models::upload::{page_key, Page};
use crate::pipeline;
use crate::routes::require_workspace;
use crate::routes::uploads::fetch_upload;
use crate::storage::BUCKET_PAGES;
use crate::tables::parser::{parse_page, replace_table_block, table_blocks};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/uploads/{id}/page/{page_num}", get(page_detail))
        .route("/uploads/{id}/page/{page_num}/tables", get(page_tables))
        .route(
            "/uploads/{id}/page/{page_num}/tables/csv",
            get(page_table_csv),
        )
        .route(
            "/uploads/{id}/page/{page_num}/table-regions",
            get(table_regions),
        )
        .route(
            "/uploads/{id}/page/{page_num}/validate-table",
            post(validate_table),
        )
        .route(
            "/uploads/{id}/page/{page_num}/apply-correction",
            post(apply_correction),
        )
}

async fn fetch_page(
    state: &AppState,
    upload_id: &str,
    workspace_id: &str,
    page_num: i32,
) -> Result<Page, ApiError> {
    fetch_upload(state, upload_id, workspace_id).await?;
    state
        .ctx
        .db
        .get_page(upload_id, page_num)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("page {page_num} not found")))
}

/// GET /uploads/{id}/page/{n} — stored markdown plus OCR state.
async fn page_detail(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((id, page_num)): Path<(String, i32)>,
) -> Result<Json<Page>, ApiError> {
    let auth = require_workspace(&state, &headers, None).await?;
    let page = fetch_page(&state, &id, &auth.workspace_id, page_num).await?;
    Ok(Json(page))
}

#[derive(Debug, Serialize)]
struct TableView {
    index: usize,
    heading: Option<String>,
    display_columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct PageTablesResponse {
    page_num: i32,
    headings: Vec<String>,
    tables: Vec<TableView>,
}

fn table_views(page_num: i32, markdown: &str) -> PageTablesResponse {
    let parsed = parse_page(page_num, markdown);
    PageTablesResponse {
        page_num,
        headings: parsed.headings,
        tables: parsed
            .tables
            .iter()
            .map(|t| TableView {
                index: t.index,
                heading: t.heading.clone(),
                display_columns: t.columns.iter().map(|c| c.display()).collect(),
                rows: t
                    .rows
                    .iter()
                    .map(|row| row.iter().map(|c| c.text.clone()).collect())
                    .collect(),
            })
            .collect(),
    }
}

/// GET /uploads/{id}/page/{n}/tables — parsed tables plus headings.
async fn page_tables(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((id, page_num)): Path<(String, i32)>,
) -> Result<Json<PageTablesResponse>, ApiError> {
    let auth = require_workspace(&state, &headers, None).await?;
    let page = fetch_page(&state, &id, &auth.workspace_id, page_num).await?;
    let markdown = page.markdown.unwrap_or_default();
    Ok(Json(table_views(page_num, &markdown)))
}

#[derive(Debug, Deserialize)]
struct TableCsvQuery {
    #[serde(default)]
    table: usize,
}

/// GET /uploads/{id}/page/{n}/tables/csv?table=K — one table as CSV.
async fn page_table_csv(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((id, page_num)): Path<(String, i32)>,
    Query(query): Query<TableCsvQuery>,
) -> Result<Response, ApiError> {
    let auth = require_workspace(&state, &headers, None).await?;
    let page = fetch_page(&state, &id, &auth.workspace_id, page_num).await?;
    let markdown = page.markdown.unwrap_or_default();

    let views = table_views(page_num, &markdown);
    let table = views
        .tables
        .get(query.table)
        .ok_or_else(|| ApiError::NotFound(format!("table index {} out of range", query.table)))?;

    let csv = csv_out::write_csv(&table.display_columns, &table.rows);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/csv")
        .header(
            header::CONTENT_DISPOSITION,
            format!(
                "attachment; filename=\"page{page_num}_table{}.csv\"",
                query.table + 1
            ),
        )
        .body(csv.into())
        .map_err(|e| ApiError::Internal(format!("response build failed: {e}")))
}

#[derive(Debug, Serialize, PartialEq)]
struct TableRegion {
    index: usize,
    top: f64,
    height: f64,
}

/// Estimate each table's vertical band on the page from markdown structure:
/// table blocks weigh their row count, text weighs its line count.
fn estimate_table_regions(markdown: &str) -> Vec<TableRegion> {
    let blocks = table_blocks(markdown);

    let mut segments: Vec<(Option<usize>, usize)> = Vec::new();
    let mut cursor = 0;
    for (idx, &(start, end)) in blocks.iter().enumerate() {
        let before = &markdown[cursor..start];
        let text_lines = before.lines().filter(|l| !l.trim().is_empty()).count();
        if text_lines > 0 {
            segments.push((None, text_lines));
        }
        let rows = markdown[start..end].to_lowercase().matches("<tr").count();
        segments.push((Some(idx), rows.max(1)));
        cursor = end;
    }
    let tail_lines = markdown[cursor..]
        .lines()
        .filter(|l| !l.trim().is_empty())
        .count();
    if tail_lines > 0 {
        segments.push((None, tail_lines));
    }

    let total: usize = segments.iter().map(|(_, w)| w).sum();
    if total == 0 {
        return Vec::new();
    }

    let mut regions = Vec::new();
    let mut position = 0usize;
    for (table_idx, weight) in segments {
        if let Some(index) = table_idx {
            regions.push(TableRegion {
                index,
                top: position as f64 / total as f64,
                height: weight as f64 / total as f64,
            });
        }
        position += weight;
    }
    regions
}

/// GET /uploads/{id}/page/{n}/table-regions
async fn table_regions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((id, page_num)): Path<(String, i32)>,
) -> Result<Json<Vec<TableRegion>>, ApiError> {
    let auth = require_workspace(&state, &headers, None).await?;
    let page = fetch_page(&state, &id, &auth.workspace_id, page_num).await?;
    Ok(Json(estimate_table_regions(
        &page.markdown.unwrap_or_default(),
    )))
}

/// POST /uploads/{id}/page/{n}/validate-table — VLM or LLM round-trip for
/// one table; nothing is persisted.
async fn validate_table(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((id, page_num)): Path<(String, i32)>,
    Json(req): Json<ValidateTableRequest>,
) -> Result<Json<ValidateTableResponse>, ApiError> {
    let auth = require_workspace(&state, &headers, None).await?;
    let page = fetch_page(&state, &id, &auth.workspace_id, page_num).await?;
    let markdown = page.markdown.unwrap_or_default();

    let outcome = match req.method {
        CorrectionMethod::Vlm => {
            let png = state
                .ctx
                .store
                .get(BUCKET_PAGES, &page_key(&id, page_num))
                .await?;
            correction::validate_vlm(&state.vlm, &png, &markdown, req.table_index).await?
        }
        CorrectionMethod::Llm => {
            correction::validate_llm(&state.llm, &markdown, req.table_index).await?
        }
    };

    Ok(Json(ValidateTableResponse {
        original: outcome.original,
        corrected: outcome.corrected,
        changed: outcome.changed,
    }))
}

/// POST /uploads/{id}/page/{n}/apply-correction — surgically replace the
/// N-th table, invalidate caches and re-run extraction.
async fn apply_correction(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((id, page_num)): Path<(String, i32)>,
    Json(req): Json<ApplyCorrectionRequest>,
) -> Result<StatusCode, ApiError> {
    let auth = require_workspace(&state, &headers, None).await?;
    let page = fetch_page(&state, &id, &auth.workspace_id, page_num).await?;
    let markdown = page.markdown.unwrap_or_default();

    let corrected = req.corrected_table.trim();
    if table_blocks(corrected).len() != 1 {
        return Err(ApiError::Validation(
            "corrected_table must contain exactly one <table> block".into(),
        ));
    }

    let new_markdown = replace_table_block(&markdown, req.table_index, corrected)
        .ok_or_else(|| ApiError::NotFound(format!("table index {} out of range", req.table_index)))?;

    state
        .ctx
        .db
        .set_page_markdown(&id, page_num, &new_markdown)
        .await?;
    state.ctx.cache.invalidate(&id);

    let ctx = state.ctx.clone();
    tokio::spawn(async move {
        pipeline::run_auto_extract(&ctx, &id).await;
    });

    Ok(StatusCode::NO_CONTENT)
}
