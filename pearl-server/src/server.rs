use crate::config::{Config, LedgerBackend};
use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use bytes::Bytes;
use pearl_core::operations::{
    AcceptChunkBatchOperation, AcceptChunkBatchOperationRequest, ChunkUpload,
    CheckPaymentStatusOperation, CheckPaymentStatusOperationRequest, ClaimChunkWorkOperation,
    ClaimChunkWorkOperationRequest, CompleteChunkWorkOperation, CompleteChunkWorkOperationRequest,
    IngestionQueue, StartPairedSessionOperation, StartPairedSessionOperationRequest,
    StartSecondarySessionOperation,
};
use pearl_core::{
    AppendLedger, ContentStoreBuilder, CredentialSealer, EntityStore,
    HttpAppendLedger, HttpPeerBroker, HttpValueLedger, Ledgers, MemoryAppendLedger,
    MemoryValueLedger, PearlError, PeerBroker, Result, SECONDARY_SESSION_PATH, Scheduler,
    SecondarySessionRequest, ValueLedger,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub struct ServerState {
    pub ingestion: Arc<IngestionQueue>,
    pub start_paired: StartPairedSessionOperation,
    pub start_secondary: StartSecondarySessionOperation,
    pub accept_chunks: AcceptChunkBatchOperation,
    pub payment_status: CheckPaymentStatusOperation,
    pub claim_chunk_work: ClaimChunkWorkOperation,
    pub complete_chunk_work: CompleteChunkWorkOperation,
    pub scheduler: Option<Arc<Scheduler>>,
    pub config: Config,
}

#[derive(Debug, Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StartSessionBody {
    file_identifier: String,
    file_size_bytes: u64,
    chunk_count: u64,
    storage_years: u32,
    #[serde(default)]
    peer_address: Option<String>,
    #[serde(default)]
    reward_seed: String,
}

#[derive(Debug, Serialize)]
struct StartSessionResponse {
    session_id: String,
    file_identifier: String,
    chunk_count: u64,
    cost: u64,
    escrow_address: String,
    secondary_session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkBatchBody {
    chunks: Vec<ChunkBody>,
}

#[derive(Debug, Deserialize)]
struct ChunkBody {
    index: u64,
    /// Hex-encoded payload.
    data: String,
    tag: String,
}

#[derive(Debug, Serialize)]
struct AcceptedChunkResponse {
    index: u64,
    physical_index: u64,
    hash: String,
}

#[derive(Debug, Serialize)]
struct PaymentStatusResponse {
    session_id: String,
    payment_status: &'static str,
    balance: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ClaimChunkWorkBody {
    #[serde(default)]
    exclude: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ChunkWorkResponse {
    chunk_id: i64,
    file_identifier: String,
    index: u64,
    address: String,
    message: Option<String>,
    branch: String,
    trunk: String,
}

#[derive(Debug, Deserialize)]
struct CompleteChunkWorkBody {
    raw_transaction: String,
}

impl ServerState {
    pub async fn build(config: Config) -> Result<Self> {
        let options = Arc::new(config.broker_options()?);

        let store = Arc::new(EntityStore::new(&config.database.path)?);

        let content_store = ContentStoreBuilder::new()
            .backend(config.content_store.backend.name())
            .namespace(config.content_store.namespace_or_default())
            .redis_url(
                config
                    .content_store
                    .redis
                    .as_ref()
                    .map(|redis| redis.url.clone())
                    .unwrap_or_default(),
            )
            .build()
            .await?;

        let client = reqwest::Client::new();
        let ledgers = build_ledgers(&config, &client)?;
        let sealer = Arc::new(CredentialSealer::new(&config.credential_secret)?);
        let peer: Arc<dyn PeerBroker> =
            Arc::new(HttpPeerBroker::new(client, config.peer_timeout()));

        let ingestion = Arc::new(IngestionQueue::start(
            store.clone(),
            content_store.clone(),
            options.content_ttl,
            options.ingest_queue_depth,
        ));

        let scheduler = config.scheduler.enabled.then(|| {
            Arc::new(Scheduler::new(
                store.clone(),
                ledgers.clone(),
                content_store.clone(),
                sealer.clone(),
                &options,
                config.scheduler_options(),
            ))
        });

        Ok(Self {
            start_paired: StartPairedSessionOperation::new(
                store.clone(),
                ledgers.clone(),
                peer,
                sealer.clone(),
                options.clone(),
            ),
            start_secondary: StartSecondarySessionOperation::new(
                store.clone(),
                ledgers.clone(),
                sealer.clone(),
                options.clone(),
            ),
            accept_chunks: AcceptChunkBatchOperation::new(
                store.clone(),
                ingestion.clone(),
                options.clone(),
            ),
            payment_status: CheckPaymentStatusOperation::new(
                store.clone(),
                ledgers.clone(),
                sealer,
            ),
            claim_chunk_work: ClaimChunkWorkOperation::new(
                store.clone(),
                ledgers.clone(),
                content_store.clone(),
                options,
            ),
            complete_chunk_work: CompleteChunkWorkOperation::new(
                store.clone(),
                ledgers,
                content_store,
            ),
            ingestion,
            scheduler,
            config,
        })
    }
}

fn build_ledgers(config: &Config, client: &reqwest::Client) -> Result<Ledgers> {
    let (append, value): (Arc<dyn AppendLedger>, Arc<dyn ValueLedger>) = match config.ledger.backend
    {
        LedgerBackend::Http => {
            let append_url = config.ledger.append_url.as_deref().ok_or_else(|| {
                PearlError::Config("ledger.append_url is required for http backend".to_string())
            })?;
            let value_url = config.ledger.value_url.as_deref().ok_or_else(|| {
                PearlError::Config("ledger.value_url is required for http backend".to_string())
            })?;
            let append: Arc<dyn AppendLedger> =
                Arc::new(HttpAppendLedger::new(client.clone(), append_url));
            let value: Arc<dyn ValueLedger> =
                Arc::new(HttpValueLedger::new(client.clone(), value_url));
            (append, value)
        }
        LedgerBackend::Memory => {
            tracing::warn!("Using in-memory ledgers; balances and records are not durable");
            let append: Arc<dyn AppendLedger> = Arc::new(MemoryAppendLedger::new());
            let value: Arc<dyn ValueLedger> = Arc::new(MemoryValueLedger::new());
            (append, value)
        }
    };

    Ok(Ledgers::new(append, value, config.call_timeout()))
}

pub fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/v2/upload-sessions", post(start_session))
        .route(SECONDARY_SESSION_PATH, post(start_secondary_session))
        .route(
            "/api/v2/upload-sessions/:id",
            put(accept_chunks).get(payment_status),
        )
        .route("/api/v2/chunk-work", post(claim_chunk_work))
        .route("/api/v2/chunk-work/:id", put(complete_chunk_work))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(config: Config) -> Result<()> {
    let bind_addr = config.node.bind_addr.clone();
    let state = Arc::new(ServerState::build(config).await?);

    let scheduler_tasks = match state.scheduler.as_ref() {
        Some(scheduler) => {
            tracing::info!("Lifecycle scheduler enabled on node {}", state.config.node.node_id);
            scheduler.spawn()
        }
        None => Vec::new(),
    };

    let app = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("Server listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for task in scheduler_tasks {
        task.abort();
    }
    state.ingestion.close().await;
    tracing::info!("Server stopped; ingestion queue drained");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {}", error);
        std::future::pending::<()>().await;
    }
}

fn status_for(error: &PearlError) -> StatusCode {
    match error {
        PearlError::InvalidInput(_) | PearlError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        PearlError::SessionNotFound(_) | PearlError::ChunkNotFound(_) => StatusCode::NOT_FOUND,
        PearlError::NoneAvailable => StatusCode::FORBIDDEN,
        error if error.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: PearlError) -> Response {
    let status = status_for(&error);
    if status.is_server_error() {
        tracing::warn!("Request failed: {}", error);
    }
    let resp = ApiResponse::<()> {
        success: false,
        data: None,
        error: Some(error.to_string()),
    };
    (status, axum::Json(resp)).into_response()
}

fn data_response<T: Serialize>(status: StatusCode, data: T) -> Response {
    let resp = ApiResponse {
        success: true,
        data: Some(data),
        error: None,
    };
    (status, axum::Json(resp)).into_response()
}

async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let response = serde_json::json!({
        "node_id": state.config.node.node_id,
        "scheduler": state.scheduler.is_some(),
        "ingestion": state.ingestion.stats(),
        "time": chrono::Utc::now().to_rfc3339(),
    });

    (StatusCode::OK, axum::Json(response))
}

async fn start_session(
    State(state): State<Arc<ServerState>>,
    axum::Json(body): axum::Json<StartSessionBody>,
) -> Response {
    let request = StartPairedSessionOperationRequest {
        file_identifier: body.file_identifier,
        file_size_bytes: body.file_size_bytes,
        chunk_count: body.chunk_count,
        storage_years: body.storage_years,
        peer_address: body.peer_address,
        reward_seed: body.reward_seed,
    };

    match state.start_paired.run(request).await {
        Ok(result) => data_response(
            StatusCode::CREATED,
            StartSessionResponse {
                session_id: result.session.id,
                file_identifier: result.session.file_identifier,
                chunk_count: result.session.chunk_count,
                cost: result.invoice.cost,
                escrow_address: result.invoice.escrow_address,
                secondary_session_id: result.secondary.map(|secondary| secondary.session_id),
            },
        ),
        Err(error) => error_response(error),
    }
}

async fn start_secondary_session(
    State(state): State<Arc<ServerState>>,
    axum::Json(request): axum::Json<SecondarySessionRequest>,
) -> Response {
    match state.start_secondary.run(request).await {
        Ok(reply) => data_response(StatusCode::CREATED, reply),
        Err(error) => error_response(error),
    }
}

fn decode_chunks(chunks: Vec<ChunkBody>) -> Result<Vec<ChunkUpload>> {
    chunks
        .into_iter()
        .map(|chunk| {
            let payload = hex::decode(&chunk.data).map_err(|e| {
                PearlError::InvalidRequest(format!("chunk {} is not hex: {}", chunk.index, e))
            })?;
            Ok(ChunkUpload {
                logical_index: chunk.index,
                payload: Bytes::from(payload),
                integrity_tag: chunk.tag,
            })
        })
        .collect()
}

async fn accept_chunks(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
    axum::Json(body): axum::Json<ChunkBatchBody>,
) -> Response {
    let chunks = match decode_chunks(body.chunks) {
        Ok(chunks) => chunks,
        Err(error) => return error_response(error),
    };

    let request = AcceptChunkBatchOperationRequest { session_id, chunks };
    match state.accept_chunks.run(request).await {
        Ok(result) => {
            let accepted: Vec<AcceptedChunkResponse> = result
                .accepted
                .into_iter()
                .map(|chunk| AcceptedChunkResponse {
                    index: chunk.logical_index,
                    physical_index: chunk.physical_index,
                    hash: chunk.payload_hash,
                })
                .collect();
            data_response(StatusCode::ACCEPTED, accepted)
        }
        Err(error) => error_response(error),
    }
}

async fn payment_status(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
) -> Response {
    let request = CheckPaymentStatusOperationRequest {
        session_id: session_id.clone(),
    };

    match state.payment_status.run(request).await {
        Ok(result) => data_response(
            StatusCode::OK,
            PaymentStatusResponse {
                session_id,
                payment_status: result.payment_status.name(),
                balance: result.balance,
            },
        ),
        Err(error) => error_response(error),
    }
}

async fn claim_chunk_work(
    State(state): State<Arc<ServerState>>,
    body: Option<axum::Json<ClaimChunkWorkBody>>,
) -> Response {
    let exclude = body.map(|axum::Json(body)| body.exclude).unwrap_or_default();

    match state
        .claim_chunk_work
        .run(ClaimChunkWorkOperationRequest { exclude })
        .await
    {
        Ok(result) => data_response(
            StatusCode::OK,
            ChunkWorkResponse {
                chunk_id: result.chunk_id,
                file_identifier: result.file_identifier,
                index: result.physical_index,
                address: result.address,
                message: result.message,
                branch: result.branch,
                trunk: result.trunk,
            },
        ),
        Err(error) => error_response(error),
    }
}

async fn complete_chunk_work(
    State(state): State<Arc<ServerState>>,
    Path(chunk_id): Path<i64>,
    axum::Json(body): axum::Json<CompleteChunkWorkBody>,
) -> Response {
    let request = CompleteChunkWorkOperationRequest {
        chunk_id,
        raw_transaction: body.raw_transaction,
    };

    match state.complete_chunk_work.run(request).await {
        Ok(()) => data_response(
            StatusCode::OK,
            serde_json::json!({ "chunk_id": chunk_id, "status": "complete" }),
        ),
        Err(error) => error_response(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        ContentBackend, ContentStoreConfig, DatabaseConfig, LedgerConfig, NodeConfig,
        PlacementConfig,
    };
    use axum::body::Body;
    use axum::http::Request;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn test_config(dir: &TempDir) -> Config {
        Config {
            node: NodeConfig {
                node_id: "alpha".to_string(),
                bind_addr: "127.0.0.1:0".to_string(),
            },
            database: DatabaseConfig {
                path: dir.path().join("db").join("pearl.db"),
            },
            content_store: ContentStoreConfig {
                backend: ContentBackend::Memory,
                namespace: None,
                redis: None,
                ttl_secs: 60,
            },
            ledger: LedgerConfig {
                backend: LedgerBackend::Memory,
                append_url: None,
                value_url: None,
                call_timeout_ms: 1_000,
            },
            funding: None,
            placement: PlacementConfig {
                chunk_size_bytes: 1,
                sector_chunk_capacity: 10,
                bury_rewards: true,
            },
            limits: Default::default(),
            pricing: Default::default(),
            credential_secret: "test-secret".to_string(),
            peer: Default::default(),
            scheduler: Default::default(),
        }
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        body: serde_json::Value,
    ) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&PearlError::InvalidRequest("x".to_string())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&PearlError::SessionNotFound("x".to_string())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(status_for(&PearlError::NoneAvailable), StatusCode::FORBIDDEN);
        assert_eq!(
            status_for(&PearlError::Busy("queue".to_string())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&PearlError::Crypto("x".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_session_upload_flow() {
        let dir = TempDir::new().unwrap();
        let state = Arc::new(ServerState::build(test_config(&dir)).await.unwrap());
        let app = build_router(state.clone());

        let (status, _) = call(
            &app,
            "POST",
            "/api/v2/upload-sessions",
            serde_json::json!({
                "file_identifier": "genesis",
                "file_size_bytes": 4,
                "chunk_count": 4,
                "storage_years": 1,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(
            &app,
            "POST",
            "/api/v2/upload-sessions",
            serde_json::json!({
                "file_identifier": "genesis",
                "file_size_bytes": 4,
                "chunk_count": 4,
                "storage_years": 1,
                "reward_seed": "uploader-seed",
            }),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["cost"], 4);
        let session_id = body["data"]["session_id"].as_str().unwrap().to_string();
        let uri = format!("/api/v2/upload-sessions/{}", session_id);

        let (status, body) = call(
            &app,
            "PUT",
            &uri,
            serde_json::json!({
                "chunks": [{ "index": 0, "data": "cafe", "tag": "genesis" }],
            }),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["data"].as_array().unwrap().len(), 1);

        let (status, body) = call(
            &app,
            "PUT",
            &uri,
            serde_json::json!({
                "chunks": [{ "index": 0, "data": "cafe", "tag": "other" }],
            }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let (status, body) = call(&app, "GET", &uri, serde_json::Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["payment_status"], "Pending");

        let (status, _) = call(
            &app,
            "GET",
            "/api/v2/upload-sessions/missing",
            serde_json::Value::Null,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        // no file has been released for ledger submission yet
        let (status, _) = call(&app, "POST", "/api/v2/chunk-work", serde_json::json!({})).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        state.ingestion.close().await;
    }
}
