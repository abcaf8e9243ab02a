//! # REST API
//!
//! Builds the axum router that exposes the node's HTTP interface.
//! All endpoints share application state through axum's `State` extractor.
//!
//! ## Endpoints
//!
//! | Method | Path                                | Description                        |
//! |--------|-------------------------------------|------------------------------------|
//! | GET    | `/health`                           | Liveness probe                     |
//! | GET    | `/status`                           | Node status summary                |
//! | GET    | `/sessions`                         | Sessions currently in flight       |
//! | GET    | `/transactions/:role`               | All records for `seller`/`buyer`   |
//! | GET    | `/transactions/:role/*session_id`   | One record                         |
//! | GET    | `/bulletins`                        | Bulletins this node sells          |
//! | GET    | `/bulletins/:merkle_root`           | One bulletin with its chain status |
//!
//! Buyer record keys contain a slash (`<seller>/<id>`), hence the wildcard
//! segment for session ids.

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use pod_protocol::bulletin::{BulletinCatalog, BulletinStatus, PublishedBulletin};
use pod_protocol::escrow::Escrow;
use pod_protocol::registry::{ActiveSession, SessionRegistry};
use pod_protocol::transaction::{RecordStore, Role, StoreError, TransactionRecord};
use pod_protocol::{ErrorKind, PodError};

use crate::metrics::SharedMetrics;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared application state available to all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub version: String,
    /// Chain address this node signs with.
    pub address: String,
    pub store: RecordStore,
    pub registry: Arc<SessionRegistry>,
    pub catalog: Arc<BulletinCatalog>,
    pub escrow: Escrow,
    pub metrics: SharedMetrics,
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

/// Builds the full axum [`Router`] with all API routes, CORS, and tracing.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/sessions", get(sessions_handler))
        .route("/transactions/:role", get(transactions_handler))
        .route("/transactions/:role/*session_id", get(transaction_handler))
        .route("/bulletins", get(bulletins_handler))
        .route("/bulletins/:merkle_root", get(bulletin_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error returned by every handler, rendered as `{"error", "kind"}`.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    /// A contract read failed.
    Upstream(String),
    Internal(String),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, error) = match self {
            ApiError::NotFound(e) => (StatusCode::NOT_FOUND, "not_found", e),
            ApiError::BadRequest(e) => (StatusCode::BAD_REQUEST, "bad_request", e),
            ApiError::Upstream(e) => (StatusCode::BAD_GATEWAY, "contract_call", e),
            ApiError::Internal(e) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", e),
        };
        if status.is_server_error() {
            tracing::error!(%status, error = %error, "api request failed");
        }
        let body = ErrorResponse {
            error,
            kind: kind.into(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<PodError> for ApiError {
    fn from(err: PodError) -> Self {
        match (&err, err.kind()) {
            (PodError::BulletinNotFound(_), _) => ApiError::NotFound(err.to_string()),
            (_, ErrorKind::ContractCall) => ApiError::Upstream(err.to_string()),
            (_, ErrorKind::ProtocolViolation) => ApiError::BadRequest(err.to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Internal(format!("record store: {err}"))
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ---------------------------------------------------------------------------
// Response Types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub address: String,
    pub active_seller_sessions: usize,
    pub active_buyer_sessions: usize,
    pub seller_records: usize,
    pub buyer_records: usize,
    pub bulletins: usize,
    pub timestamp: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BulletinResponse {
    #[serde(flatten)]
    pub listing: PublishedBulletin,
    /// Escrow mapping key, `0x`-prefixed.
    pub key: String,
    /// On-chain status, absent when the ledger could not be read.
    pub chain_status: Option<BulletinStatus>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health` - returns 200 if the node is alive.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

/// `GET /status` - session and record counts.
async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: state.version.clone(),
        address: state.address.clone(),
        active_seller_sessions: state.registry.count(Role::Seller),
        active_buyer_sessions: state.registry.count(Role::Buyer),
        seller_records: state.store.count(Role::Seller),
        buyer_records: state.store.count(Role::Buyer),
        bulletins: state.catalog.len(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

async fn sessions_handler(State(state): State<AppState>) -> Json<Vec<ActiveSession>> {
    Json(state.registry.active())
}

fn parse_role(role: &str) -> Result<Role, ApiError> {
    Role::from_str(role).map_err(ApiError::BadRequest)
}

/// `GET /transactions/:role`
async fn transactions_handler(
    Path(role): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Vec<TransactionRecord>> {
    let role = parse_role(&role)?;
    Ok(Json(state.store.list(role)?))
}

/// `GET /transactions/:role/*session_id`
async fn transaction_handler(
    Path((role, session_id)): Path<(String, String)>,
    State(state): State<AppState>,
) -> ApiResult<TransactionRecord> {
    let role = parse_role(&role)?;
    let key = session_id.trim_start_matches('/');
    state
        .store
        .get(role, key)?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no {role} record {key}")))
}

async fn bulletins_handler(State(state): State<AppState>) -> Json<Vec<PublishedBulletin>> {
    Json(state.catalog.list())
}

/// `GET /bulletins/:merkle_root` - catalog entry plus the escrow's view of it.
async fn bulletin_handler(
    Path(root): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<BulletinResponse> {
    let listing = state
        .catalog
        .get(&root)
        .ok_or_else(|| ApiError::from(PodError::BulletinNotFound(root.clone())))?;
    let key = listing
        .bulletin
        .key()
        .map_err(|e| ApiError::Internal(format!("bad bulletin {root}: {e}")))?;
    let chain_status = match state.escrow.read_status(key).await {
        Ok(status) => Some(status),
        Err(e) => {
            tracing::warn!(root = %root, error = %e, "bulletin status unavailable");
            None
        }
    };
    Ok(Json(BulletinResponse {
        listing,
        key: format!("{key:#x}"),
        chain_status,
    }))
}
