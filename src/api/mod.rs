//! HTTP API for operating swaps and checking health

use crate::config::ApiConfig;
use crate::coordination::SwapEngine;
use crate::error::{ErrorKind, SwapError, SwapResult};
use crate::swap::{
    Asset, Ledger, LedgerKind, Network, Role, Secret, SwapAcceptance, SwapDescriptor, SwapId,
    SwapProposal,
};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SwapEngine>,
}

/// Build the operator router
pub fn router(engine: Arc<SwapEngine>) -> Router {
    let state = AppState { engine };

    Router::new()
        .route("/health", get(health_check))
        .route("/ledgers", get(get_ledgers))
        .route(
            "/ledgers/:kind/:network/balances/:identity",
            get(get_balance),
        )
        .route("/swaps", post(create_swap).get(list_swaps))
        .route("/swaps/handshake", post(create_swap_from_handshake))
        .route("/swaps/:id", get(get_swap))
        .route("/swaps/:id/accept", post(accept_swap))
        .route("/swaps/:id/abort", post(abort_swap))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, engine: Arc<SwapEngine>) -> SwapResult<()> {
    let app = router(engine);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| SwapError::Internal(format!("failed to bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| SwapError::Internal(format!("API server failed: {}", e)))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        actor: state.engine.actor().to_string(),
        active_swaps: state.engine.registry().active_count().await,
    })
}

/// Ledger reachability; 503 when any ledger is down
async fn get_ledgers(State(state): State<AppState>) -> impl IntoResponse {
    let ledgers = state.engine.ledger_health().await;
    let status = if ledgers.iter().all(|l| l.healthy) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(ledgers))
}

/// Balance of one identity; `?contract=` selects a token
async fn get_balance(
    State(state): State<AppState>,
    Path((kind, network, identity)): Path<(LedgerKind, Network, String)>,
    Query(query): Query<BalanceQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let ledger = Ledger::new(kind, network);
    let asset = Asset {
        ledger: kind,
        quantity: 0,
        contract: query.contract,
    };
    let balance = state.engine.balance(&ledger, &identity, &asset).await?;
    Ok(Json(BalanceResponse {
        ledger,
        identity,
        contract: asset.contract,
        balance,
    }))
}

async fn create_swap(
    State(state): State<AppState>,
    Json(request): Json<CreateSwapRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let status = state
        .engine
        .create_swap(request.descriptor, request.role, request.secret)
        .await?;
    Ok((StatusCode::CREATED, Json(status)))
}

async fn create_swap_from_handshake(
    State(state): State<AppState>,
    Json(request): Json<HandshakeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let status = state
        .engine
        .create_swap_from_handshake(
            request.swap_id.unwrap_or_default(),
            request.proposal,
            request.acceptance,
            request.role,
            request.secret,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(status)))
}

async fn list_swaps(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.list_swaps().await)
}

async fn get_swap(
    State(state): State<AppState>,
    Path(id): Path<SwapId>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.get_swap_status(id).await?))
}

async fn accept_swap(
    State(state): State<AppState>,
    Path(id): Path<SwapId>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.accept_swap(id).await?))
}

async fn abort_swap(
    State(state): State<AppState>,
    Path(id): Path<SwapId>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.abort_swap(id).await?))
}

/// Maps engine errors onto HTTP status codes
pub struct ApiError(SwapError);

impl From<SwapError> for ApiError {
    fn from(error: SwapError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SwapError::SwapNotFound(_) => StatusCode::NOT_FOUND,
            SwapError::Negotiation(_) | SwapError::LedgerNotConfigured(_) => {
                StatusCode::BAD_REQUEST
            }
            SwapError::AbortRejected { .. } | SwapError::InvalidStateTransition { .. } => {
                StatusCode::CONFLICT
            }
            SwapError::TransientLedger { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = ErrorResponse {
            kind: self.0.kind(),
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

// Request and response types

#[derive(Debug, Deserialize)]
pub struct CreateSwapRequest {
    pub descriptor: SwapDescriptor,
    pub role: Role,
    #[serde(default)]
    pub secret: Option<Secret>,
}

/// Both handshake halves; a fresh swap id is assigned when none is given
#[derive(Debug, Deserialize)]
pub struct HandshakeRequest {
    #[serde(default)]
    pub swap_id: Option<SwapId>,
    pub proposal: SwapProposal,
    pub acceptance: SwapAcceptance,
    pub role: Role,
    #[serde(default)]
    pub secret: Option<Secret>,
}

#[derive(Debug, Deserialize)]
pub struct BalanceQuery {
    #[serde(default)]
    pub contract: Option<String>,
}

#[derive(Serialize)]
struct BalanceResponse {
    ledger: Ledger,
    identity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    contract: Option<String>,
    balance: u128,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    actor: String,
    active_swaps: usize,
}

#[derive(Serialize)]
struct ErrorResponse {
    kind: ErrorKind,
    error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::ledger::{ActorContext, LedgerSet, SimulatedLedger, SimulatedLedgerConfig};
    use crate::swap::descriptor::fixtures::erc20_for_btc;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    const GENESIS: u64 = 1_700_000_000;

    fn app() -> Router {
        app_with_ledgers().0
    }

    fn app_with_ledgers() -> (Router, Arc<SimulatedLedger>, Arc<SimulatedLedger>) {
        let eth = Arc::new(SimulatedLedger::new(SimulatedLedgerConfig::new(
            "ethereum-regtest",
            Ledger::new(LedgerKind::Ethereum, Network::Regtest),
            GENESIS,
        )));
        let btc = Arc::new(SimulatedLedger::new(SimulatedLedgerConfig::new(
            "bitcoin-regtest",
            Ledger::new(LedgerKind::Bitcoin, Network::Regtest),
            GENESIS,
        )));
        let ledgers = LedgerSet::new()
            .with(eth.ledger(), eth.clone())
            .with(btc.ledger(), btc.clone());
        let engine = SwapEngine::new(ActorContext::new("maker", ledgers), EngineConfig::default());
        (router(Arc::new(engine)), eth, btc)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    #[tokio::test]
    async fn create_inspect_and_abort_a_swap() {
        let app = app();
        let descriptor = erc20_for_btc(GENESIS, &Secret::generate());
        let id = descriptor.swap_id.to_string();

        let (status, body) = send(
            &app,
            "POST",
            "/swaps",
            Some(json!({ "descriptor": descriptor, "role": "beta" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["phase"], "negotiated");
        assert_eq!(body["role"], "beta");

        let (status, body) = send(&app, "GET", &format!("/swaps/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["swap_id"], id.as_str());

        let (status, body) = send(&app, "POST", &format!("/swaps/{}/abort", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["phase"], "aborted");
        assert_eq!(body["terminal"], true);

        let (status, body) = send(&app, "POST", &format!("/swaps/{}/accept", id), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "invariant_violation");

        let (status, body) = send(&app, "GET", "/swaps", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn invalid_terms_are_bad_requests() {
        let app = app();
        let mut descriptor = erc20_for_btc(GENESIS, &Secret::generate());
        descriptor.alpha_expiry = descriptor.beta_expiry;

        let (status, body) = send(
            &app,
            "POST",
            "/swaps",
            Some(json!({ "descriptor": descriptor, "role": "beta" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "negotiation");
    }

    #[tokio::test]
    async fn unknown_and_malformed_ids() {
        let app = app();

        let (status, _) = send(&app, "GET", &format!("/swaps/{}", SwapId::new()), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, "GET", "/swaps/not-a-uuid", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_and_ledgers() {
        let app = app();

        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["actor"], "maker");
        assert_eq!(body["active_swaps"], 0);

        let (status, body) = send(&app, "GET", "/ledgers", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn balances_per_identity_and_token() {
        let (app, eth, btc) = app_with_ledgers();
        let token = Asset::token(
            LedgerKind::Ethereum,
            "0x5fbdb2315678afecb367f032d93f642f64180aa3",
            0,
        );
        eth.credit("maker-eth", &token, 42).await;
        btc.credit("maker-btc", &Asset::native(LedgerKind::Bitcoin, 0), 100_000_000)
            .await;

        let (status, body) = send(&app, "GET", "/ledgers/bitcoin/regtest/balances/maker-btc", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["balance"], 100_000_000);
        assert_eq!(body["identity"], "maker-btc");

        let uri = "/ledgers/ethereum/regtest/balances/maker-eth?contract=0x5fbdb2315678afecb367f032d93f642f64180aa3";
        let (status, body) = send(&app, "GET", uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["balance"], 42);

        // Native ether is a different unit from the token
        let (_, body) = send(&app, "GET", "/ledgers/ethereum/regtest/balances/maker-eth", None).await;
        assert_eq!(body["balance"], 0);

        let (status, body) = send(&app, "GET", "/ledgers/bitcoin/mainnet/balances/maker-btc", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "operational");
    }

    #[tokio::test]
    async fn create_from_handshake() {
        let app = app();
        let descriptor = erc20_for_btc(GENESIS, &Secret::generate());
        let proposal = SwapProposal {
            alpha_ledger: descriptor.alpha_ledger,
            beta_ledger: descriptor.beta_ledger,
            alpha_asset: descriptor.alpha_asset.clone(),
            beta_asset: descriptor.beta_asset.clone(),
            alpha_refund_identity: descriptor.identities.alpha_refund.clone(),
            beta_redeem_identity: descriptor.identities.beta_redeem.clone(),
            alpha_expiry: descriptor.alpha_expiry,
            beta_expiry: descriptor.beta_expiry,
            secret_hash: descriptor.secret_hash,
        };
        let acceptance = SwapAcceptance {
            alpha_redeem_identity: descriptor.identities.alpha_redeem.clone(),
            beta_refund_identity: descriptor.identities.beta_refund.clone(),
        };

        let (status, body) = send(
            &app,
            "POST",
            "/swaps/handshake",
            Some(json!({
                "swap_id": descriptor.swap_id,
                "proposal": proposal,
                "acceptance": acceptance,
                "role": "beta",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["swap_id"], descriptor.swap_id.to_string().as_str());
        assert_eq!(body["descriptor_digest"], descriptor.digest().unwrap().as_str());

        let empty = SwapAcceptance {
            alpha_redeem_identity: " ".to_string(),
            beta_refund_identity: "maker-btc".to_string(),
        };
        let (status, body) = send(
            &app,
            "POST",
            "/swaps/handshake",
            Some(json!({ "proposal": proposal, "acceptance": empty, "role": "beta" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "negotiation");
    }
}
