mod app;
mod auth;
mod blacklist;
mod compare;
mod config;
mod correction;
mod csv_out;
mod database;
mod error;
mod extract;
mod models;
mod ocr;
mod pipeline;
mod render;
mod routes;
mod storage;
mod tables;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use app::AppState;
use blacklist::TokenBlacklist;
use config::load_settings;
use database::postgres::PostgresDatabase;
use database::Database;
use extract::resolver::SynonymTable;
use ocr::client::{ChatClient, OcrClient};
use pipeline::progress::ProgressRegistry;
use pipeline::PipelineContext;
use render::Renderer;
use storage::local::LocalStore;
use storage::s3::S3Store;

const DB_POOL_SIZE: u32 = 10;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting pricewatch server...");

    let settings = load_settings()?;
    info!(
        "Configuration loaded: host={}, port={}, storage={}, workers={}",
        settings.host, settings.port, settings.storage_provider, settings.ocr_worker_count
    );

    // Database.
    let database = Arc::new(PostgresDatabase::new(&settings.database_url, DB_POOL_SIZE).await?);
    database.initialize().await?;
    // Pages left running by a crash revert to pending; their uploads resume
    // from the interrupted state.
    database.recover_interrupted().await?;
    info!("Database initialized");

    // Object store.
    let store: Arc<dyn storage::ObjectStore> = match settings.storage_provider.as_str() {
        "local" => Arc::new(LocalStore::new(&settings.storage_path)),
        _ => Arc::new(S3Store::new(
            &settings.minio_endpoint,
            &settings.minio_access_key,
            &settings.minio_secret_key,
            settings.minio_secure,
        )),
    };
    store.ensure_buckets().await?;
    info!("Object store initialized: {}", settings.storage_provider);

    // Token blacklist cache.
    let blacklist = Arc::new(TokenBlacklist::connect(&settings.redis_url).await?);
    info!("Token blacklist connected");

    // External models.
    let ocr = Arc::new(OcrClient::new(&settings.ocr_server_url, 16));
    let vlm = Arc::new(ChatClient::new(
        &settings.vlm_server_url,
        &settings.vlm_model,
    ));
    let llm = Arc::new(ChatClient::new(
        &settings.llm_server_url,
        &settings.llm_model,
    ));
    info!("Model clients initialized (OCR at {})", settings.ocr_server_url);

    let renderer = Renderer::new(settings.render_dpi, settings.render_long_edge_px);
    let worker_count = settings.ocr_worker_count;

    let host = settings.host.clone();
    let port = settings.port;

    let ctx = PipelineContext {
        settings: Arc::new(settings),
        db: database,
        store,
        ocr,
        renderer,
        workers: Arc::new(Semaphore::new(worker_count)),
        progress: Arc::new(ProgressRegistry::new()),
        cancellations: Arc::default(),
        locks: Arc::default(),
        cache: Arc::default(),
        synonyms: Arc::new(SynonymTable::default()),
    };

    let state = Arc::new(AppState {
        ctx: ctx.clone(),
        vlm,
        llm,
        blacklist,
    });

    let app = routes::build_router(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    info!("Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain in-flight pages; whatever does not finish reverts to pending on
    // the next start.
    info!("Draining OCR workers (grace {}s)...", SHUTDOWN_GRACE.as_secs());
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while ctx.workers.available_permits() < worker_count {
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    })
    .await;
    if drained.is_err() {
        info!("Grace period elapsed with pages still in flight");
    }

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
}
