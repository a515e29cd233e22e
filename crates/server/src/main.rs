use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use server_api::CatalogService;
use shared::{
    error::{ApiError, ErrorCode},
    protocol::{ActionBatch, MultiResponse},
};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod app_state;
mod config;

use app_state::AppState;
use config::load_settings;

pub const MULTI_REQUEST_ROUTE: &str = "/service/multirequest";
const MAX_ACTIONS_PER_BATCH: usize = 50;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings = load_settings();
    let catalog = CatalogService::new();
    if settings.seed_demo_data {
        catalog.seed_demo_data().await.map_err(|error| {
            error!(%error, "failed to seed demo catalogue");
            anyhow::anyhow!("demo seed failed: {error}")
        })?;
        info!("demo catalogue seeded");
    }

    let app = build_router(Arc::new(AppState { catalog }), settings.max_batch_bytes);

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>, max_batch_bytes: usize) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(MULTI_REQUEST_ROUTE, post(multi_request))
        .layer(RequestBodyLimitLayer::new(max_batch_bytes))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn multi_request(
    State(state): State<Arc<AppState>>,
    Json(batch): Json<ActionBatch>,
) -> Result<Json<MultiResponse>, (StatusCode, Json<ApiError>)> {
    if batch.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ApiError::new(ErrorCode::Validation, "batch cannot be empty")),
        ));
    }
    if batch.len() > MAX_ACTIONS_PER_BATCH {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ApiError::new(
                ErrorCode::Validation,
                format!("batch exceeds {MAX_ACTIONS_PER_BATCH} actions"),
            )),
        ));
    }

    let response = state.catalog.execute(&batch).await;
    info!(
        actions = batch.len(),
        failed = response.errors().len(),
        "multirequest served"
    );
    Ok(Json(response))
}
