// Employee Sync - Web Server
// REST API with Axum: CSV uploads, job status, notification sweeps

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use employee_sync::{logging, DispatchReport, ImportStatus, Pipeline, PipelineConfig, Uploads};

#[derive(Parser)]
#[command(name = "employee-sync-server", version)]
struct Args {
    /// TOML configuration file (falls back to $EMPLOYEE_SYNC_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long, env = "EMPLOYEE_SYNC_ADDR", default_value = "0.0.0.0:3000")]
    addr: String,
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    pipeline: Arc<Pipeline>,
    uploads: Arc<Uploads>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

fn failure(status: StatusCode, message: impl Into<String>) -> Response {
    let body: ApiResponse<()> = ApiResponse {
        success: false,
        data: None,
        error: Some(message.into()),
    };
    (status, Json(body)).into_response()
}

#[derive(Deserialize)]
struct ImportParams {
    owner_id: i64,
}

#[derive(Deserialize)]
struct SweepParams {
    owner_id: Option<i64>,
}

#[derive(Serialize)]
struct ImportAccepted {
    job_id: String,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// POST /api/imports?owner_id= - Upload a CSV body, returns the job id
async fn create_import(
    State(state): State<AppState>,
    Query(params): Query<ImportParams>,
    body: Bytes,
) -> Response {
    if body.is_empty() {
        return failure(StatusCode::BAD_REQUEST, "empty CSV body");
    }

    let uploads = state.uploads.clone();
    let accepted = tokio::task::spawn_blocking(move || uploads.accept(body.as_ref(), params.owner_id)).await;

    match accepted {
        Ok(Ok(job_id)) => {
            info!(job_id = %job_id, owner_id = params.owner_id, "import accepted");
            (StatusCode::ACCEPTED, Json(ApiResponse::ok(ImportAccepted { job_id }))).into_response()
        }
        Ok(Err(e)) => {
            error!(error = %e, "import not accepted");
            failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// GET /api/imports/:job_id - Status query
async fn get_import(State(state): State<AppState>, Path(job_id): Path<String>) -> Response {
    match state.pipeline.jobs.status(&job_id) {
        Ok(Some(status)) => (StatusCode::OK, Json(ApiResponse::<ImportStatus>::ok(status))).into_response(),
        Ok(None) => failure(StatusCode::NOT_FOUND, format!("unknown job {}", job_id)),
        Err(e) => {
            error!(job_id = %job_id, error = %e, "status query failed");
            failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// POST /api/notifications/sweep - Routine sweep; nothing dirty is a success
async fn sweep_notifications(State(state): State<AppState>, Query(params): Query<SweepParams>) -> Response {
    let pipeline = state.pipeline.clone();
    let swept = tokio::task::spawn_blocking(move || {
        let window = pipeline.config.notifications.dirty_window();
        pipeline.dispatcher.sweep(params.owner_id, window)
    })
    .await;

    match swept {
        Ok(Ok(report)) => (StatusCode::OK, Json(ApiResponse::<DispatchReport>::ok(report))).into_response(),
        Ok(Err(e)) => {
            error!(error = %e, "notification sweep failed");
            failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

fn router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/imports", post(create_import))
        .route("/imports/:job_id", get(get_import))
        .route("/notifications/sweep", post(sweep_notifications))
        .with_state(state);

    Router::new().nest("/api", api_routes).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()),
    )
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = PipelineConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    logging::init(&config.log_level);

    let pipeline = Arc::new(Pipeline::open(config).context("Failed to open pipeline storage")?);
    info!(database = %pipeline.config.database_path.display(), "database opened");

    let queue = pipeline.queue().context("Failed to start job workers")?;
    let state = AppState {
        uploads: Arc::new(pipeline.uploads(queue)),
        pipeline,
    };

    let listener = tokio::net::TcpListener::bind(&args.addr)
        .await
        .with_context(|| format!("Failed to bind to {}", args.addr))?;

    info!(addr = %args.addr, "server running");

    axum::serve(listener, router(state))
        .await
        .context("Server stopped")?;

    Ok(())
}
