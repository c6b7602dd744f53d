use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::app::AppState;
use crate::csv_out;
use crate::error::ApiError;
use crate::extract::engine::run_extraction;
use crate::extract::resolver::scan_columns;
use crate::models::api::{
    CreateSchemaRequest, ExtractionConfig, ExtractionResult, ScanRequest, ScanResponse,
    UpdateSchemaRequest,
};
use crate::models::upload::{short_id, Schema};
use crate::pipeline::{self, PipelineContext};
use crate::routes::require_workspace;
use crate::routes::uploads::fetch_upload;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/uploads/{id}/scan-columns", post(scan_upload_columns))
        .route("/uploads/{id}/extract", post(extract_json))
        .route("/uploads/{id}/extract/csv", post(extract_csv))
        .route("/schemas", get(list_schemas).post(create_schema))
        .route(
            "/schemas/{id}",
            get(get_schema).put(update_schema).delete(delete_schema),
        )
        .route("/schemas/{id}/set-default", post(set_default_schema))
}

/// Run (or reuse) an extraction for an upload. The per-upload cache is keyed
/// by config and invalidated on any markdown change.
pub(crate) async fn compute_extraction(
    ctx: &PipelineContext,
    upload_id: &str,
    config: &ExtractionConfig,
) -> Result<Arc<ExtractionResult>, ApiError> {
    if let Some(cached) = ctx.cache.get(upload_id, config) {
        return Ok(cached);
    }

    let pages = pipeline::load_parsed_pages(ctx, upload_id).await?;
    let result = Arc::new(run_extraction(&pages, config, &ctx.synonyms));
    ctx.cache
        .put(upload_id, config.clone(), Arc::clone(&result));
    Ok(result)
}

pub(crate) fn validated_config(config: ExtractionConfig) -> Result<ExtractionConfig, ApiError> {
    config.validate().map_err(ApiError::Validation)?;
    Ok(config)
}

/// POST /uploads/{id}/scan-columns — anchor-driven column discovery.
async fn scan_upload_columns(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<ScanRequest>,
) -> Result<Json<ScanResponse>, ApiError> {
    let auth = require_workspace(&state, &headers, None).await?;
    fetch_upload(&state, &id, &auth.workspace_id).await?;

    let row_anchor = req.row_anchor.trim();
    let value_anchor = req.value_anchor.trim();
    if row_anchor.is_empty() || value_anchor.is_empty() {
        return Err(ApiError::Validation(
            "both row_anchor and value_anchor are required".into(),
        ));
    }

    let pages = pipeline::load_parsed_pages(&state.ctx, &id).await?;
    Ok(Json(scan_columns(
        &pages,
        row_anchor,
        value_anchor,
        &state.ctx.synonyms,
    )))
}

/// POST /uploads/{id}/extract — run a config, return the result as JSON.
async fn extract_json(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(config): Json<ExtractionConfig>,
) -> Result<Json<Arc<ExtractionResult>>, ApiError> {
    let auth = require_workspace(&state, &headers, None).await?;
    fetch_upload(&state, &id, &auth.workspace_id).await?;

    let config = validated_config(config)?;
    let result = compute_extraction(&state.ctx, &id, &config).await?;
    Ok(Json(result))
}

/// POST /uploads/{id}/extract/csv — same input, `text/csv` out.
async fn extract_csv(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(config): Json<ExtractionConfig>,
) -> Result<Response, ApiError> {
    let auth = require_workspace(&state, &headers, None).await?;
    let upload = fetch_upload(&state, &id, &auth.workspace_id).await?;

    let config = validated_config(config)?;
    let result = compute_extraction(&state.ctx, &id, &config).await?;
    let csv = csv_out::write_csv(&result.columns, &result.rows);

    let basename = upload
        .filename
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(&id);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/csv")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{basename}_extract.csv\""),
        )
        .body(csv.into())
        .map_err(|e| ApiError::Internal(format!("response build failed: {e}")))
}

// ──────────────────────────── Schemas ────────────────────────────

#[derive(Debug, Deserialize)]
struct ListSchemasQuery {
    #[serde(default)]
    company: Option<String>,
}

async fn list_schemas(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListSchemasQuery>,
) -> Result<Json<Vec<Schema>>, ApiError> {
    let auth = require_workspace(&state, &headers, None).await?;
    let schemas = state
        .ctx
        .db
        .list_schemas(&auth.workspace_id, query.company.as_deref())
        .await?;
    Ok(Json(schemas))
}

async fn create_schema(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateSchemaRequest>,
) -> Result<(StatusCode, Json<Schema>), ApiError> {
    let auth = require_workspace(&state, &headers, None).await?;

    if req.company.trim().is_empty() || req.name.trim().is_empty() {
        return Err(ApiError::Validation("company and name are required".into()));
    }
    let config = validated_config(req.config)?;

    let schema = Schema {
        id: short_id(),
        workspace_id: auth.workspace_id,
        company: req.company.trim().to_lowercase(),
        name: req.name.trim().to_string(),
        config,
        is_default: false,
        created_at: chrono::Utc::now(),
    };
    state.ctx.db.create_schema(&schema).await?;
    Ok((StatusCode::CREATED, Json(schema)))
}

async fn fetch_schema(state: &AppState, id: &str, workspace_id: &str) -> Result<Schema, ApiError> {
    state
        .ctx
        .db
        .get_schema(id, workspace_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("schema {id} not found")))
}

async fn get_schema(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Schema>, ApiError> {
    let auth = require_workspace(&state, &headers, None).await?;
    Ok(Json(fetch_schema(&state, &id, &auth.workspace_id).await?))
}

async fn update_schema(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<UpdateSchemaRequest>,
) -> Result<Json<Schema>, ApiError> {
    let auth = require_workspace(&state, &headers, None).await?;

    let config = req.config.map(validated_config).transpose()?;
    let updated = state
        .ctx
        .db
        .update_schema(
            &id,
            &auth.workspace_id,
            req.company.as_deref().map(str::trim),
            req.name.as_deref().map(str::trim),
            config.as_ref(),
        )
        .await?;
    if !updated {
        return Err(ApiError::NotFound(format!("schema {id} not found")));
    }

    Ok(Json(fetch_schema(&state, &id, &auth.workspace_id).await?))
}

async fn delete_schema(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let auth = require_workspace(&state, &headers, None).await?;
    let deleted = state.ctx.db.delete_schema(&id, &auth.workspace_id).await?;
    if !deleted {
        return Err(ApiError::NotFound(format!("schema {id} not found")));
    }
    Ok(Json(json!({ "ok": true })))
}

/// POST /schemas/{id}/set-default — flip the default for the company and
/// re-run auto-extraction for uploads that never got one.
async fn set_default_schema(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let auth = require_workspace(&state, &headers, None).await?;
    let schema = fetch_schema(&state, &id, &auth.workspace_id).await?;

    state
        .ctx
        .db
        .set_default_schema(&id, &auth.workspace_id)
        .await?;

    let pending = state
        .ctx
        .db
        .uploads_needing_reextract(&auth.workspace_id, &schema.company)
        .await?;
    info!(
        "schema {id} set default for {}; re-extracting {} uploads",
        schema.company,
        pending.len()
    );
    for upload_id in pending {
        let ctx = state.ctx.clone();
        tokio::spawn(async move {
            pipeline::run_auto_extract(&ctx, &upload_id).await;
        });
    }

    Ok(Json(json!({ "ok": true })))
}
