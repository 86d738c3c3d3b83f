//! HTTP API for health checks, nonce previews and transaction tracking

use crate::chain::{EthProvider, NetworkClient};
use crate::config::ApiConfig;
use crate::error::{KeeperError, KeeperResult};
use crate::state::{InMemoryStore, StoreStats, TransactionStore};
use crate::tx::{
    NonceAllocator, NonceDetails, SignedTransaction, SubmissionTracker, TrackedTransaction,
    TransactionRecord,
};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ethers::types::Address;
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub provider: Arc<EthProvider>,
    pub store: Arc<InMemoryStore>,
    pub allocator: Arc<NonceAllocator>,
    pub tracker: Arc<SubmissionTracker>,
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> KeeperResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| KeeperError::Internal(format!("API bind failed: {}", e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| KeeperError::Internal(format!("API server failed: {}", e)))?;

    Ok(())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(get_status))
        .route("/nonce/:address", get(get_nonce))
        .route("/transactions", post(track_transaction))
        .route("/transactions/import", post(import_transactions))
        .route("/transactions/:address", get(get_transactions))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Latest block and store counts
async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        chain_id: state.provider.chain_id(),
        latest_block: state.provider.cached_block().map(|b| b.number),
        transactions: state.store.stats().await,
    })
}

/// Preview the next nonce; the lock is released before responding
async fn get_nonce(
    State(state): State<AppState>,
    Path(address): Path<Address>,
) -> Result<Json<NonceResponse>, ApiError> {
    let lock = state.allocator.acquire_nonce(address).await?;
    let response = NonceResponse {
        address,
        nonce: lock.nonce(),
        details: lock.details().clone(),
    };
    lock.release();

    Ok(Json(response))
}

async fn get_transactions(
    State(state): State<AppState>,
    Path(address): Path<Address>,
) -> impl IntoResponse {
    Json(TransactionsResponse {
        pending: state.store.pending_transactions(address).await,
        transactions: state.store.transactions_for(address).await,
    })
}

async fn track_transaction(
    State(state): State<AppState>,
    Json(signed): Json<SignedTransaction>,
) -> Result<Json<TrackedTransaction>, ApiError> {
    Ok(Json(state.tracker.track(signed).await?))
}

async fn import_transactions(
    State(state): State<AppState>,
    Json(records): Json<Vec<TransactionRecord>>,
) -> impl IntoResponse {
    let imported = state.tracker.import_history(records).await;
    Json(ImportResponse { imported })
}

/// Error response wrapper
pub struct ApiError(KeeperError);

impl From<KeeperError> for ApiError {
    fn from(err: KeeperError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            KeeperError::NonceConflict { .. } => StatusCode::CONFLICT,
            err if err.is_fatal() => StatusCode::UNPROCESSABLE_ENTITY,
            KeeperError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            KeeperError::Network(_) | KeeperError::Broadcast(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    chain_id: u64,
    latest_block: Option<u64>,
    transactions: StoreStats,
}

#[derive(Serialize)]
struct NonceResponse {
    address: Address,
    nonce: u64,
    details: NonceDetails,
}

#[derive(Serialize)]
struct TransactionsResponse {
    pending: Vec<TransactionRecord>,
    transactions: Vec<TransactionRecord>,
}

#[derive(Serialize)]
struct ImportResponse {
    imported: usize,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}
