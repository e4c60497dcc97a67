use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use scroll_vault_api::{ScrollVaultApi, VaultInfo, API_CONTRACT_VERSION};
use scroll_vault_core::wire::{
    CyclePayload, CycleView, IngestResponse, PatchPayload, ProvenanceView,
};
use scroll_vault_core::{
    CycleDraft, CycleFilter, CyclePatch, CycleStats, IngestOrigin, VaultError, WindowAggregate,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

#[derive(Debug, Clone)]
struct ServiceState {
    api: ScrollVaultApi,
    heartbeat: Duration,
    stream_clients: Arc<AtomicUsize>,
}

impl ServiceState {
    fn new(api: ScrollVaultApi, heartbeat: Duration) -> Self {
        Self { api, heartbeat, stream_clients: Arc::new(AtomicUsize::new(0)) }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    kind: &'static str,
    error: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct PatchResponse {
    status: &'static str,
    signifier: String,
}

#[derive(Debug, Clone, Serialize)]
struct StreamGreeting {
    status: &'static str,
    message: &'static str,
    connected_clients: usize,
}

#[derive(Debug, Clone, Serialize)]
struct StreamHeartbeat {
    heartbeat: &'static str,
    connected_clients: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct LimitParams {
    limit: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct AggregateParams {
    window: Option<i64>,
    limit: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SearchParams {
    #[serde(default)]
    keyword: String,
    limit: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct IngestParams {
    node_id: Option<String>,
}

#[derive(Debug, Parser)]
#[command(name = "scroll-vault-service")]
#[command(about = "HTTP service for the Scroll Vault memory store")]
struct Args {
    #[arg(long, env = "SCROLL_VAULT_DB", default_value = "./scroll_vault.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "SCROLL_VAULT_BIND", default_value = "127.0.0.1:4010")]
    bind: SocketAddr,
    /// Seconds between heartbeats on `/memory/stream`.
    #[arg(
        long,
        env = "SCROLL_VAULT_HEARTBEAT_SECS",
        default_value_t = 10,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    heartbeat_secs: u64,
    /// Used when `RUST_LOG` is unset.
    #[arg(long, env = "SCROLL_VAULT_LOG", default_value = "info")]
    log_level: String,
}

impl ServiceError {
    fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            kind,
            error: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation", message)
    }
}

impl From<VaultError> for ServiceError {
    fn from(err: VaultError) -> Self {
        let status = match &err {
            VaultError::Validation(_) => StatusCode::BAD_REQUEST,
            VaultError::UniquenessViolation { .. } => StatusCode::CONFLICT,
            VaultError::NotFound(_) => StatusCode::NOT_FOUND,
            VaultError::StoreUnavailable(message) => {
                tracing::error!(error = %message, "request failed: store unavailable");
                StatusCode::SERVICE_UNAVAILABLE
            }
        };
        Self::new(status, err.kind(), err.to_string())
    }
}

impl From<JsonRejection> for ServiceError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for ServiceError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

/// Run a store call off the async workers.
async fn blocking<T, F>(state: &ServiceState, work: F) -> Result<T, ServiceError>
where
    T: Send + 'static,
    F: FnOnce(&ScrollVaultApi) -> Result<T, VaultError> + Send + 'static,
{
    let api = state.api.clone();
    tokio::task::spawn_blocking(move || work(&api))
        .await
        .map_err(|err| {
            let message = format!("join error: {err}");
            ServiceError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
        })?
        .map_err(ServiceError::from)
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/v1/health", get(health))
        .route("/memory", get(list_cycles).post(create_cycle))
        .route("/memory/bulk", post(create_cycles))
        .route("/memory/latest", get(latest_cycle))
        .route("/memory/stats", get(cycle_stats))
        .route("/memory/query", post(query_cycles))
        .route("/memory/query/aggregate", get(aggregate_cycles))
        .route("/memory/search", get(search_cycles))
        .route("/memory/archive", get(export_archive))
        .route("/memory/ingest", post(ingest_cycle))
        .route("/memory/provenance", get(list_provenance))
        .route("/memory/stream", get(stream))
        .route("/memory/hash/:cycle_hash", get(cycle_by_hash))
        .route("/memory/:signifier", get(cycle_by_signifier).patch(patch_cycle))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn init_tracing(log_level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let heartbeat = Duration::from_secs(args.heartbeat_secs);
    let state = ServiceState::new(ScrollVaultApi::new(args.db.clone()), heartbeat);
    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    tracing::info!(bind = %args.bind, db = %args.db.display(), "scroll vault service listening");

    axum::serve(listener, app(state).into_make_service_with_connect_info::<SocketAddr>())
        .await
        .context("service terminated")?;
    Ok(())
}

async fn root() -> Json<ServiceEnvelope<VaultInfo>> {
    Json(envelope(ScrollVaultApi::info()))
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn create_cycle(
    State(state): State<ServiceState>,
    payload: Result<Json<CyclePayload>, JsonRejection>,
) -> Result<(StatusCode, Json<ServiceEnvelope<CycleView>>), ServiceError> {
    let Json(payload) = payload?;
    let draft = CycleDraft::from(payload);
    let cycle = blocking(&state, move |api| api.create_cycle(&draft)).await?;
    Ok((StatusCode::CREATED, Json(envelope(CycleView::from(&cycle)))))
}

async fn create_cycles(
    State(state): State<ServiceState>,
    payload: Result<Json<Vec<CyclePayload>>, JsonRejection>,
) -> Result<(StatusCode, Json<ServiceEnvelope<Vec<CycleView>>>), ServiceError> {
    let Json(payloads) = payload?;
    let drafts = payloads.into_iter().map(CycleDraft::from).collect::<Vec<_>>();
    let cycles = blocking(&state, move |api| api.create_cycles(&drafts)).await?;
    Ok((StatusCode::CREATED, Json(envelope(cycles.iter().map(CycleView::from).collect()))))
}

async fn list_cycles(
    State(state): State<ServiceState>,
    params: Result<Query<LimitParams>, QueryRejection>,
) -> Result<Json<ServiceEnvelope<Vec<CycleView>>>, ServiceError> {
    let Query(params) = params?;
    let cycles = blocking(&state, move |api| api.list(params.limit)).await?;
    Ok(Json(envelope(cycles.iter().map(CycleView::from).collect())))
}

async fn latest_cycle(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<CycleView>>, ServiceError> {
    let cycle = blocking(&state, ScrollVaultApi::latest).await?;
    Ok(Json(envelope(CycleView::from(&cycle))))
}

async fn cycle_stats(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<CycleStats>>, ServiceError> {
    let stats = blocking(&state, ScrollVaultApi::stats).await?;
    Ok(Json(envelope(stats)))
}

async fn cycle_by_hash(
    State(state): State<ServiceState>,
    Path(cycle_hash): Path<String>,
) -> Result<Json<ServiceEnvelope<CycleView>>, ServiceError> {
    let cycle = blocking(&state, move |api| api.get_by_hash(&cycle_hash)).await?;
    Ok(Json(envelope(CycleView::from(&cycle))))
}

async fn cycle_by_signifier(
    State(state): State<ServiceState>,
    Path(signifier): Path<String>,
) -> Result<Json<ServiceEnvelope<CycleView>>, ServiceError> {
    let cycle = blocking(&state, move |api| api.get_by_signifier(&signifier)).await?;
    Ok(Json(envelope(CycleView::from(&cycle))))
}

async fn patch_cycle(
    State(state): State<ServiceState>,
    Path(signifier): Path<String>,
    payload: Result<Json<PatchPayload>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<PatchResponse>>, ServiceError> {
    let Json(payload) = payload?;
    let patch = CyclePatch::from(payload);
    let patched = blocking(&state, move |api| api.patch(&signifier, &patch)).await?;
    Ok(Json(envelope(PatchResponse { status: "updated", signifier: patched.signifier })))
}

async fn query_cycles(
    State(state): State<ServiceState>,
    filter: Result<Json<CycleFilter>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<Vec<CycleView>>>, ServiceError> {
    let Json(filter) = filter?;
    let cycles = blocking(&state, move |api| api.query(&filter)).await?;
    Ok(Json(envelope(cycles.iter().map(CycleView::from).collect())))
}

async fn aggregate_cycles(
    State(state): State<ServiceState>,
    params: Result<Query<AggregateParams>, QueryRejection>,
) -> Result<Json<ServiceEnvelope<Vec<WindowAggregate>>>, ServiceError> {
    let Query(params) = params?;
    let windows = blocking(&state, move |api| api.aggregate(params.window, params.limit)).await?;
    Ok(Json(envelope(windows)))
}

async fn search_cycles(
    State(state): State<ServiceState>,
    params: Result<Query<SearchParams>, QueryRejection>,
) -> Result<Json<ServiceEnvelope<Vec<CycleView>>>, ServiceError> {
    let Query(params) = params?;
    let cycles = blocking(&state, move |api| api.search(&params.keyword, params.limit)).await?;
    Ok(Json(envelope(cycles.iter().map(CycleView::from).collect())))
}

async fn export_archive(State(state): State<ServiceState>) -> Result<Response, ServiceError> {
    let export = blocking(&state, ScrollVaultApi::export_archive).await?;
    let disposition = format!("attachment; filename=\"{}\"", export.file_name);
    Ok((
        [
            (header::CONTENT_TYPE, "application/gzip".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        export.bytes,
    )
        .into_response())
}

async fn ingest_cycle(
    State(state): State<ServiceState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    params: Result<Query<IngestParams>, QueryRejection>,
    payload: Result<Json<CyclePayload>, JsonRejection>,
) -> Result<(StatusCode, Json<ServiceEnvelope<IngestResponse>>), ServiceError> {
    let Query(params) = params?;
    let Json(payload) = payload?;
    let draft = CycleDraft::from(payload);
    let origin = IngestOrigin::new(peer.ip().to_string(), params.node_id);
    let receipt = blocking(&state, move |api| api.ingest(&draft, &origin)).await?;
    Ok((StatusCode::CREATED, Json(envelope(IngestResponse::from(&receipt)))))
}

async fn list_provenance(
    State(state): State<ServiceState>,
    params: Result<Query<LimitParams>, QueryRejection>,
) -> Result<Json<ServiceEnvelope<Vec<ProvenanceView>>>, ServiceError> {
    let Query(params) = params?;
    let entries = blocking(&state, move |api| api.provenance(params.limit)).await?;
    Ok(Json(envelope(entries.iter().map(ProvenanceView::from).collect())))
}

async fn stream(State(state): State<ServiceState>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |socket| {
        stream_heartbeats(socket, state.stream_clients, state.heartbeat)
    })
}

/// Greet the client, then send a heartbeat every `period` until it goes away.
async fn stream_heartbeats(mut socket: WebSocket, clients: Arc<AtomicUsize>, period: Duration) {
    let connected = clients.fetch_add(1, Ordering::SeqCst) + 1;
    tracing::info!(connected_clients = connected, "stream client connected");

    let greeting = StreamGreeting {
        status: "connected",
        message: "Scroll Vault stream online",
        connected_clients: connected,
    };
    if send_json(&mut socket, &greeting).await {
        let mut ticker = tokio::time::interval(period);
        // The first tick fires immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let beat = StreamHeartbeat {
                        heartbeat: "alive",
                        connected_clients: clients.load(Ordering::SeqCst),
                    };
                    if !send_json(&mut socket, &beat).await {
                        break;
                    }
                }
                incoming = socket.recv() => match incoming {
                    Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    let remaining = clients.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
    tracing::info!(connected_clients = remaining, "stream client disconnected");
}

async fn send_json<T: Serialize>(socket: &mut WebSocket, message: &T) -> bool {
    match serde_json::to_string(message) {
        Ok(text) => socket.send(Message::Text(text)).await.is_ok(),
        Err(err) => {
            tracing::warn!(error = %err, "failed to encode stream message");
            false
        }
    }
}
