use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::Stream;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;

use crate::app::AppState;
use crate::error::ApiError;
use crate::models::api::{PageStateEntry, UpdateUploadRequest, UploadCreated};
use crate::models::upload::{
    csv_key, short_id, DocType, ExtractState, IngestState, Upload,
};
use crate::pipeline;
use crate::pipeline::progress::ProgressUpdate;
use crate::routes::require_workspace;
use crate::storage::{detect_file_extension, BUCKET_OUTPUT, BUCKET_PAGES, BUCKET_PDFS};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/upload", post(create_upload))
        .route("/uploads", get(list_uploads))
        .route(
            "/uploads/{id}",
            get(get_upload).put(update_upload).delete(delete_upload),
        )
        .route("/uploads/{id}/resume", post(resume_upload))
        .route("/uploads/{id}/reparse", post(reparse_upload))
        .route("/uploads/{id}/status", get(upload_status))
        .route("/uploads/{id}/pages", get(list_page_images))
        .route("/uploads/{id}/page-states", get(page_states))
        .route("/uploads/{id}/markdown", get(combined_markdown))
        .route("/uploads/{id}/extract/download", get(download_extract_csv))
        .route("/uploads/{id}/comparable", get(comparable_uploads))
}

/// POST /upload — multipart: `file` (pdf/png/jpg), `company`, optional
/// `year`/`month`.
async fn create_upload(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<UploadCreated>, ApiError> {
    let auth = require_workspace(&state, &headers, None).await?;

    let mut file_bytes: Option<Vec<u8>> = None;
    let mut filename = String::new();
    let mut company = String::new();
    let mut year: Option<i32> = None;
    let mut month: Option<i32> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::Validation(format!("failed to read multipart field: {e}")))?
    {
        let field_name = field.name().unwrap_or("").to_string();
        match field_name.as_str() {
            "file" => {
                filename = field.file_name().unwrap_or("upload").to_string();
                file_bytes = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| ApiError::Validation(format!("failed to read file: {e}")))?
                        .to_vec(),
                );
            }
            "company" => {
                company = field
                    .text()
                    .await
                    .map_err(|e| ApiError::Validation(format!("failed to read company: {e}")))?
                    .trim()
                    .to_lowercase();
            }
            "year" => {
                let text = field.text().await.unwrap_or_default();
                year = text.trim().parse().ok();
            }
            "month" => {
                let text = field.text().await.unwrap_or_default();
                month = text.trim().parse().ok();
            }
            _ => {}
        }
    }

    let file_bytes = file_bytes.ok_or_else(|| ApiError::Validation("no file provided".into()))?;
    if company.is_empty() {
        return Err(ApiError::Validation("company is required".into()));
    }

    let ext = detect_file_extension(&file_bytes)
        .ok_or_else(|| ApiError::Validation("file must be a PDF, PNG or JPEG".into()))?;
    let doc_type = if ext == "pdf" {
        DocType::Pdf
    } else {
        DocType::Image
    };

    let id = short_id();
    let now = chrono::Utc::now();
    let upload = Upload {
        id: id.clone(),
        workspace_id: auth.workspace_id,
        filename,
        company,
        year,
        month,
        doc_type,
        state: IngestState::Queued,
        message: "Queued".to_string(),
        total_pages: 0,
        current_page: 0,
        extract_state: ExtractState::None,
        created_at: now,
        updated_at: now,
    };

    let content_type = match ext {
        "pdf" => "application/pdf",
        "png" => "image/png",
        _ => "image/jpeg",
    };
    state
        .ctx
        .store
        .put(
            BUCKET_PDFS,
            &upload.original_key(),
            &file_bytes,
            content_type,
        )
        .await?;
    state.ctx.db.create_upload(&upload).await?;

    info!("upload {id} created ({} bytes, {ext})", file_bytes.len());
    pipeline::spawn_ingest(state.ctx.clone(), id.clone());

    Ok(Json(UploadCreated { id }))
}

async fn list_uploads(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<Upload>>, ApiError> {
    let auth = require_workspace(&state, &headers, None).await?;
    Ok(Json(state.ctx.db.list_uploads(&auth.workspace_id).await?))
}

pub(crate) async fn fetch_upload(
    state: &AppState,
    id: &str,
    workspace_id: &str,
) -> Result<Upload, ApiError> {
    state
        .ctx
        .db
        .get_upload(id, workspace_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("upload {id} not found")))
}

async fn get_upload(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Upload>, ApiError> {
    let auth = require_workspace(&state, &headers, None).await?;
    Ok(Json(fetch_upload(&state, &id, &auth.workspace_id).await?))
}

async fn update_upload(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<UpdateUploadRequest>,
) -> Result<Json<Upload>, ApiError> {
    let auth = require_workspace(&state, &headers, None).await?;

    if let Some(company) = &req.company {
        if company.trim().is_empty() {
            return Err(ApiError::Validation("company must not be empty".into()));
        }
    }

    let updated = state
        .ctx
        .db
        .update_upload_meta(
            &id,
            &auth.workspace_id,
            req.company.as_deref().map(str::trim),
            req.year,
            req.month,
        )
        .await?;
    if !updated {
        return Err(ApiError::NotFound(format!("upload {id} not found")));
    }

    Ok(Json(fetch_upload(&state, &id, &auth.workspace_id).await?))
}

async fn delete_upload(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let auth = require_workspace(&state, &headers, None).await?;
    fetch_upload(&state, &id, &auth.workspace_id).await?;

    pipeline::delete_upload(&state.ctx, &id).await?;
    info!("upload {id} deleted");
    Ok(Json(json!({ "ok": true })))
}

/// POST /uploads/{id}/resume — re-enter parsing after an interrupt.
/// Resuming a `done` upload is a no-op.
async fn resume_upload(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let auth = require_workspace(&state, &headers, None).await?;
    let upload = fetch_upload(&state, &id, &auth.workspace_id).await?;

    match upload.state {
        IngestState::Done => Ok(Json(json!({ "ok": true, "noop": true }))),
        IngestState::Interrupted => {
            pipeline::spawn_resume(state.ctx.clone(), id);
            Ok(Json(json!({ "ok": true })))
        }
        other => Err(ApiError::Conflict(format!(
            "cannot resume an upload in state {}",
            other.as_str()
        ))),
    }
}

/// POST /uploads/{id}/reparse — reset all pages and OCR again.
async fn reparse_upload(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let auth = require_workspace(&state, &headers, None).await?;
    let upload = fetch_upload(&state, &id, &auth.workspace_id).await?;

    if upload.state != IngestState::Done {
        return Err(ApiError::Conflict(format!(
            "cannot reparse an upload in state {}",
            upload.state.as_str()
        )));
    }

    pipeline::spawn_reparse(state.ctx.clone(), id);
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    /// SSE clients cannot set headers; the token rides the query string.
    #[serde(default)]
    token: Option<String>,
}

/// GET /uploads/{id}/status — SSE stream of progress records, closing after
/// the terminal record.
async fn upload_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<StatusQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let auth = require_workspace(&state, &headers, query.token.as_deref()).await?;
    let upload = fetch_upload(&state, &id, &auth.workspace_id).await?;

    let (tx, rx) = tokio::sync::mpsc::channel::<ProgressUpdate>(32);

    match state.ctx.progress.subscribe(&id) {
        Some((latest, mut updates)) => {
            tokio::spawn(async move {
                if let Some(latest) = latest {
                    let terminal = latest.is_terminal();
                    if tx.send(latest).await.is_err() || terminal {
                        return;
                    }
                }
                loop {
                    match updates.recv().await {
                        Ok(update) => {
                            let terminal = update.is_terminal();
                            if tx.send(update).await.is_err() || terminal {
                                break;
                            }
                        }
                        // A lagged subscriber skips records but never sees
                        // the counter decrease.
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
        }
        None => {
            // No active ingest: a single snapshot, then close.
            let _ = tx.send(ProgressUpdate::from_upload(&upload)).await;
        }
    }

    let stream = ReceiverStream::new(rx).map(|update| {
        let data = serde_json::to_string(&update).unwrap_or_else(|_| "{}".to_string());
        Ok(Event::default().data(data))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// GET /uploads/{id}/pages — ordered page raster filenames.
async fn list_page_images(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Vec<String>>, ApiError> {
    let auth = require_workspace(&state, &headers, None).await?;
    fetch_upload(&state, &id, &auth.workspace_id).await?;

    let keys = state
        .ctx
        .store
        .list_prefix(BUCKET_PAGES, &format!("{id}/"))
        .await?;
    let names = keys
        .iter()
        .filter(|k| k.ends_with(".png"))
        .filter_map(|k| k.rsplit('/').next())
        .map(String::from)
        .collect();
    Ok(Json(names))
}

async fn page_states(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Vec<PageStateEntry>>, ApiError> {
    let auth = require_workspace(&state, &headers, None).await?;
    fetch_upload(&state, &id, &auth.workspace_id).await?;

    let states = state
        .ctx
        .db
        .page_states(&id)
        .await?
        .into_iter()
        .map(|(page_num, state)| PageStateEntry { page_num, state })
        .collect();
    Ok(Json(states))
}

/// GET /uploads/{id}/markdown — all parsed pages joined into one document.
async fn combined_markdown(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let auth = require_workspace(&state, &headers, None).await?;
    let upload = fetch_upload(&state, &id, &auth.workspace_id).await?;

    let parts: Vec<String> = state
        .ctx
        .db
        .done_page_markdown(&id)
        .await?
        .into_iter()
        .map(|(page_num, markdown)| format!("<!-- Page {page_num} -->\n\n{markdown}"))
        .collect();
    let combined = parts.join("\n\n---\n\n");

    let basename = upload
        .filename
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(&id);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/markdown; charset=utf-8")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{basename}.md\""),
        )
        .body(combined.into())
        .map_err(|e| ApiError::Internal(format!("response build failed: {e}")))
}

/// GET /uploads/{id}/extract/download — the cached auto-extraction CSV.
async fn download_extract_csv(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let auth = require_workspace(&state, &headers, None).await?;
    let upload = fetch_upload(&state, &id, &auth.workspace_id).await?;

    if upload.extract_state != ExtractState::Done {
        return Err(ApiError::NotFound("no extraction available".into()));
    }

    let csv = state.ctx.store.get(BUCKET_OUTPUT, &csv_key(&id)).await?;
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

/// GET /uploads/{id}/comparable — other extracted uploads of this company.
async fn comparable_uploads(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Vec<Upload>>, ApiError> {
    let auth = require_workspace(&state, &headers, None).await?;
    let upload = fetch_upload(&state, &id, &auth.workspace_id).await?;

    if upload.extract_state != ExtractState::Done {
        return Err(ApiError::Conflict("upload has no extraction results".into()));
    }

    let others = state
        .ctx
        .db
        .comparable_uploads(&auth.workspace_id, &upload.company, &id)
        .await?;
    Ok(Json(others))
}
