use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;

use crate::app::AppState;
use crate::compare::{compare_extractions, ComparisonResult};
use crate::csv_out;
use crate::error::ApiError;
use crate::models::api::{CompareRequest, ExtractionConfig};
use crate::models::upload::{IngestState, Upload};
use crate::routes::extract::{compute_extraction, validated_config};
use crate::routes::require_workspace;
use crate::routes::uploads::fetch_upload;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/compare", post(compare_json))
        .route("/compare/csv", post(compare_csv))
}

#[derive(Debug, Serialize)]
struct UploadBrief {
    id: String,
    filename: String,
    company: String,
    year: Option<i32>,
    month: Option<i32>,
}

impl From<&Upload> for UploadBrief {
    fn from(u: &Upload) -> Self {
        Self {
            id: u.id.clone(),
            filename: u.filename.clone(),
            company: u.company.clone(),
            year: u.year,
            month: u.month,
        }
    }
}

#[derive(Debug, Serialize)]
struct CompareResponse {
    base_upload: UploadBrief,
    target_upload: UploadBrief,
    config: ExtractionConfig,
    #[serde(flatten)]
    result: ComparisonResult,
}

async fn run_comparison(
    state: &AppState,
    headers: &HeaderMap,
    req: CompareRequest,
) -> Result<(Upload, Upload, ExtractionConfig, ComparisonResult), ApiError> {
    let auth = require_workspace(state, headers, None).await?;

    let base = fetch_upload(state, &req.base_upload_id, &auth.workspace_id).await?;
    let target = fetch_upload(state, &req.target_upload_id, &auth.workspace_id).await?;

    for upload in [&base, &target] {
        if upload.state != IngestState::Done {
            return Err(ApiError::Conflict(format!(
                "upload {} is not parsed yet (state {})",
                upload.id,
                upload.state.as_str()
            )));
        }
    }

    let config = match req.config {
        Some(config) => validated_config(config)?,
        None => {
            let schema = state
                .ctx
                .db
                .get_default_schema(&auth.workspace_id, &base.company)
                .await?
                .ok_or_else(|| {
                    ApiError::Validation("no extraction config available".to_string())
                })?;
            validated_config(schema.config)?
        }
    };

    let base_result = compute_extraction(&state.ctx, &base.id, &config).await?;
    let target_result = compute_extraction(&state.ctx, &target.id, &config).await?;

    let result = compare_extractions(&base_result, &target_result);
    Ok((base, target, config, result))
}

/// POST /compare — classify every reference across two uploads.
async fn compare_json(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CompareRequest>,
) -> Result<Json<CompareResponse>, ApiError> {
    let (base, target, config, result) = run_comparison(&state, &headers, req).await?;
    Ok(Json(CompareResponse {
        base_upload: UploadBrief::from(&base),
        target_upload: UploadBrief::from(&target),
        config,
        result,
    }))
}

/// POST /compare/csv — the same comparison as a CSV download.
async fn compare_csv(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CompareRequest>,
) -> Result<Response, ApiError> {
    let (base, target, _, result) = run_comparison(&state, &headers, req).await?;

    let csv = csv_out::write_csv(&result.columns, &result.rows);
    let stem = |u: &Upload| {
        u.filename
            .rsplit_once('.')
            .map(|(s, _)| s.to_string())
            .unwrap_or_else(|| u.id.clone())
    };
    let filename = format!("{}_vs_{}_comparison.csv", stem(&base), stem(&target));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/csv")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        )
        .body(csv.into())
        .map_err(|e| ApiError::Internal(format!("response build failed: {e}")))
}
