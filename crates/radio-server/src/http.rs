//! HTTP server and API endpoints for the broker.

use crate::{
    config::ServerConfig,
    error::{ServerError, ServerResult},
    state::{spawn_cleanup_task, AppState, StateStats},
};
use axum::{
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use radio_core::{
    decoder::media_type,
    protocol::constants::{IDEMPOTENCY_KEY_HEADER, JOB_ID_HEADER},
    Acknowledgement, Broker, DispatchMode, Envelope, JobView, OutboundMessage,
};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info};
use uuid::Uuid;

const CONTENT_TYPE_HEADER: &str = "content-type";

/// Shared application state
#[derive(Debug, Clone)]
pub struct SharedState {
    pub app_state: Arc<AppState>,
}

impl SharedState {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self {
            app_state: Arc::new(AppState::new(broker)),
        }
    }

    fn broker(&self) -> &Broker {
        &self.app_state.broker
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub dispatch_mode: DispatchMode,
    #[serde(flatten)]
    pub stats: StateStats,
}

/// Query parameters for `GET /jobs`
#[derive(Debug, Deserialize)]
pub struct JobsQuery {
    pub state: Option<String>,
}

/// Job listing response
#[derive(Debug, Serialize)]
pub struct JobsResponse {
    pub count: usize,
    pub jobs: Vec<JobView>,
}

/// Create the HTTP router with all endpoints
pub fn create_router(state: SharedState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/offers", post(submit_offer))
        .route("/results", post(submit_result))
        .route("/results/:id", get(get_job))
        .route("/results/:id/audio", get(get_audio))
        .route("/jobs", get(list_jobs))
        .route("/jobs/:id", get(get_job))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(DefaultBodyLimit::max(max_body_bytes)),
        )
        .with_state(state)
}

/// Root endpoint - provides basic information
async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": "Radio Broker",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "POST /offers": "Submit a signed service offer (or an audio result)",
            "POST /results": "Submit a JSON or binary result for a job",
            "GET /jobs/:id": "Job state and result",
            "GET /results/:id/audio": "Stored audio file of a binary result",
            "GET /jobs?state=pending": "Jobs still waiting for a result",
            "GET /health": "Health check",
        }
    }))
}

/// Health check endpoint
async fn health(State(state): State<SharedState>) -> ServerResult<Json<HealthResponse>> {
    let stats = state.app_state.get_stats().await?;

    let response = HealthResponse {
        status: "healthy".to_string(),
        dispatch_mode: state.broker().dispatch_mode(),
        stats,
    };

    debug!("Health check completed: {:?}", response);
    Ok(Json(response))
}

/// Offer ingress; audio results are accepted here too
async fn submit_offer(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> ServerResult<Json<OutboundMessage>> {
    let envelope = envelope_from_headers(&headers)?;
    debug!("Inbound payload of {} bytes", body.len());

    let outbound = state.broker().handle_inbound(&body, &envelope).await?;
    Ok(Json(outbound))
}

/// Result ingress for JSON and binary results
async fn submit_result(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> ServerResult<Json<Acknowledgement>> {
    let envelope = envelope_from_headers(&headers)?;
    debug!("Result payload of {} bytes", body.len());

    let ack = state.broker().handle_result(&body, &envelope).await?;
    Ok(Json(ack))
}

/// Poll a job by id
async fn get_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ServerResult<Json<JobView>> {
    let job_id = Uuid::parse_str(&id).map_err(|_| ServerError::InvalidJobId(id))?;
    let view = state.broker().get_job(job_id).await?;
    Ok(Json(view))
}

/// Serve the audio file stored for a binary result
async fn get_audio(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ServerResult<Response> {
    let job_id = Uuid::parse_str(&id).map_err(|_| ServerError::InvalidJobId(id))?;
    let (bytes, extension) = state
        .broker()
        .fetch_binary_result(job_id)
        .await?
        .ok_or(ServerError::NoAudioFile(job_id))?;

    debug!("Serving {} byte {} file for job {}", bytes.len(), extension, job_id);
    Ok(([(header::CONTENT_TYPE, media_type(&extension))], bytes).into_response())
}

/// List jobs still waiting for a result
async fn list_jobs(
    State(state): State<SharedState>,
    Query(query): Query<JobsQuery>,
) -> ServerResult<Json<JobsResponse>> {
    match query.state.as_deref() {
        None | Some("pending") => {}
        Some(other) => return Err(ServerError::UnsupportedFilter(other.to_string())),
    }

    let jobs = state.broker().list_pending().await?;
    Ok(Json(JobsResponse {
        count: jobs.len(),
        jobs,
    }))
}

fn envelope_from_headers(headers: &HeaderMap) -> ServerResult<Envelope> {
    let mut envelope = Envelope::default();

    if let Some(content_type) = header_str(headers, CONTENT_TYPE_HEADER)? {
        envelope = envelope.with_content_type(content_type);
    }

    if let Some(job_id) = header_str(headers, JOB_ID_HEADER)? {
        let job_id = Uuid::parse_str(job_id.trim()).map_err(|e| ServerError::InvalidHeader {
            header: JOB_ID_HEADER,
            reason: e.to_string(),
        })?;
        envelope = envelope.with_job_id(job_id);
    }

    if let Some(key) = header_str(headers, IDEMPOTENCY_KEY_HEADER)? {
        envelope = envelope.with_idempotency_key(key);
    }

    Ok(envelope)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &'static str) -> ServerResult<Option<&'a str>> {
    headers
        .get(name)
        .map(|value| {
            value.to_str().map_err(|e| ServerError::InvalidHeader {
                header: name,
                reason: e.to_string(),
            })
        })
        .transpose()
}

/// Start the HTTP server
pub async fn start_server(config: &ServerConfig) -> ServerResult<()> {
    info!("Starting broker server...");

    let broker = Arc::new(Broker::from_config(&config.broker)?);
    let shared_state = SharedState::new(broker);

    let sweep_interval = Duration::from_secs(config.broker.retention.sweep_interval_secs);
    if config.broker.retention.completed_ttl_secs.is_some() {
        spawn_cleanup_task(shared_state.app_state.clone(), sweep_interval);
    } else {
        info!("No retention TTL configured; finished jobs are kept");
    }

    let app = create_router(shared_state, config.http.max_body_bytes);

    let bind_addr = format!("{}:{}", config.http.bind_address, config.http.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| ServerError::Internal(anyhow::anyhow!("Failed to bind to {}: {}", bind_addr, e)))?;

    info!("Broker server listening on {}", bind_addr);
    info!("Endpoints:");
    info!("  GET  /            - Server information");
    info!("  GET  /health      - Health check");
    info!("  POST /offers      - Submit a signed service offer");
    info!("  POST /results     - Submit a job result");
    info!("  GET  /jobs/:id    - Poll a job");
    info!("  GET  /results/:id/audio - Download a stored audio file");
    info!("  GET  /jobs        - List pending jobs");

    axum::serve(listener, app)
        .await
        .map_err(|e| ServerError::Internal(anyhow::anyhow!("Server error: {}", e)))?;

    Ok(())
}
