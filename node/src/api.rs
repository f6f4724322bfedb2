//! # HTTP API
//!
//! Builds the axum router that drives and inspects the sandbox. All
//! handlers share [`AppState`] through axum's `State` extractor.
//!
//! ## Endpoints
//!
//! | Method | Path                             | Description                              |
//! |--------|----------------------------------|------------------------------------------|
//! | GET    | `/health`                        | Liveness check                           |
//! | GET    | `/status`                        | Chain height and per-party summary       |
//! | GET    | `/trades`                        | Every party's trades, open and closed    |
//! | GET    | `/trades/:id`                    | One trade as each party sees it          |
//! | GET    | `/offers`                        | The maker's offers                       |
//! | GET    | `/disputes`                      | Every party's disputes                   |
//! | POST   | `/offers`                        | Maker places an offer                    |
//! | POST   | `/offers/:id/take`               | Taker takes a signed offer               |
//! | POST   | `/trades/:id/payment-sent`       | Buyer confirms the payment went out      |
//! | POST   | `/trades/:id/payment-received`   | Seller confirms the payment arrived      |
//! | POST   | `/trades/:id/dispute`            | A trader opens a dispute                 |
//! | POST   | `/trades/:id/chat`               | Send a dispute chat line                 |
//! | POST   | `/trades/:id/resolve`            | Arbitrator decides a dispute             |
//! | POST   | `/verify-payout`                 | Stateless cooperative payout check       |
//! | POST   | `/mine`                          | Mine simulated blocks                    |

use axum::{
    extract::{Path, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use xmrx_protocol::config::PROTOCOL_VERSION;
use xmrx_protocol::dispute::{Dispute, DisputeError, DisputeResult, SupportType};
use xmrx_protocol::escrow::{verify_payout_tx, PayoutSplit, PayoutTerms, TxDescription};
use xmrx_protocol::offer::{OfferError, OpenOffer};
use xmrx_protocol::trade::{Side, Trade, TradeError};
use xmrx_protocol::wallet::XmrWallet;

use crate::metrics::SharedMetrics;
use crate::sim::{NewOffer, Party, Sandbox};

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Cheap to clone: everything behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub sandbox: Arc<Sandbox>,
    pub metrics: SharedMetrics,
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

/// Builds the full axum [`Router`] with all API routes, CORS, and tracing.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/trades", get(trades_handler))
        .route("/trades/:id", get(trade_handler))
        .route("/offers", get(offers_handler).post(place_offer_handler))
        .route("/offers/:id/take", post(take_offer_handler))
        .route("/trades/:id/payment-sent", post(payment_sent_handler))
        .route("/trades/:id/payment-received", post(payment_received_handler))
        .route("/trades/:id/dispute", post(open_dispute_handler))
        .route("/trades/:id/chat", post(chat_handler))
        .route("/trades/:id/resolve", post(resolve_handler))
        .route("/disputes", get(disputes_handler))
        .route("/verify-payout", post(verify_payout_handler))
        .route("/mine", post(mine_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// A handler failure with the status it maps to.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

impl From<TradeError> for ApiError {
    fn from(e: TradeError) -> Self {
        let status = match &e {
            TradeError::UnknownTrade(_) => StatusCode::NOT_FOUND,
            TradeError::AlreadyExists(_)
            | TradeError::OwnOffer(_)
            | TradeError::NotReady { .. }
            | TradeError::NoContract(_)
            | TradeError::ContractLocked(_) => StatusCode::CONFLICT,
            TradeError::Offer(inner) => return ApiError::from_offer_ref(inner, e.to_string()),
            TradeError::ActorGone(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::UNPROCESSABLE_ENTITY,
        };
        Self::new(status, e.to_string())
    }
}

impl ApiError {
    fn from_offer_ref(e: &OfferError, message: String) -> Self {
        let status = match e {
            OfferError::UnknownOffer(_) => StatusCode::NOT_FOUND,
            OfferError::NotAvailable { .. } | OfferError::Duplicate(_) => StatusCode::CONFLICT,
            OfferError::AmountOutOfRange { .. }
            | OfferError::InvalidAmounts(_)
            | OfferError::SelfArbitration
            | OfferError::NotOwned(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::UNPROCESSABLE_ENTITY,
        };
        Self::new(status, message)
    }
}

impl From<OfferError> for ApiError {
    fn from(e: OfferError) -> Self {
        let message = e.to_string();
        Self::from_offer_ref(&e, message)
    }
}

impl From<DisputeError> for ApiError {
    fn from(e: DisputeError) -> Self {
        let status = match &e {
            DisputeError::UnknownTrade(_) | DisputeError::UnknownDispute(_) => {
                StatusCode::NOT_FOUND
            }
            DisputeError::AlreadyOpen(_)
            | DisputeError::Closed(_)
            | DisputeError::WrongRole { .. }
            | DisputeError::NoContract(_) => StatusCode::CONFLICT,
            DisputeError::Delivery(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::UNPROCESSABLE_ENTITY,
        };
        Self::new(status, e.to_string())
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ---------------------------------------------------------------------------
// Request / Response Types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct PartyStatus {
    pub party: String,
    pub address: String,
    pub balance: u64,
    pub active_trades: usize,
    pub closed_trades: usize,
    pub disputes: usize,
    pub orphaned_messages: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub protocol_version: String,
    pub chain_height: u64,
    pub parties: Vec<PartyStatus>,
    pub timestamp: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PartyTrade {
    pub party: String,
    pub trade: Trade,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PartyDispute {
    pub party: String,
    pub dispute: Dispute,
}

#[derive(Debug, Deserialize)]
pub struct TakeOfferRequest {
    /// Atomic units.
    pub amount: u64,
}

#[derive(Debug, Deserialize)]
pub struct OpenDisputeRequest {
    /// `maker` or `taker`.
    pub party: String,
    #[serde(default = "default_support_type")]
    pub support_type: SupportType,
    pub reason: String,
}

fn default_support_type() -> SupportType {
    SupportType::Arbitration
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub party: String,
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyPayoutRequest {
    pub tx: TxDescription,
    pub terms: PayoutTerms,
    pub multisig_address: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyPayoutResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub split: Option<PayoutSplit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MineRequest {
    pub blocks: u64,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn party<'a>(sandbox: &'a Sandbox, name: &str) -> Result<&'a Party, ApiError> {
    sandbox
        .party(name)
        .ok_or_else(|| ApiError::bad_request(format!("unknown party {name}")))
}

fn trader<'a>(sandbox: &'a Sandbox, name: &str) -> Result<&'a Party, ApiError> {
    let party = party(sandbox, name)?;
    if party.name == "arbitrator" {
        return Err(ApiError::bad_request("the arbitrator is not a trader"));
    }
    Ok(party)
}

/// The trader holding `side` of trade `id`.
fn trader_on_side<'a>(sandbox: &'a Sandbox, id: &str, side: Side) -> Result<&'a Party, ApiError> {
    [&sandbox.maker, &sandbox.taker]
        .into_iter()
        .find(|p| {
            p.runtime
                .trades()
                .snapshot(id)
                .is_some_and(|t| t.side() == Some(side))
        })
        .ok_or_else(|| ApiError::not_found(format!("no open trade {id} with a {side:?}")))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health`: 200 while the process is up.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let sandbox = &state.sandbox;
    let parties = sandbox
        .parties()
        .into_iter()
        .map(|p| {
            let trades = p.runtime.trades();
            PartyStatus {
                party: p.name.to_string(),
                address: p.address().to_string(),
                balance: sandbox.chain.balance(&p.wallet.primary_address()),
                active_trades: trades.active_count(),
                closed_trades: trades.closed_trades().len(),
                disputes: p.runtime.disputes().disputes().len(),
                orphaned_messages: trades.orphan_count(),
            }
        })
        .collect();

    Json(StatusResponse {
        version: state.version.clone(),
        protocol_version: PROTOCOL_VERSION.to_string(),
        chain_height: sandbox.chain.height(),
        parties,
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

async fn trades_handler(State(state): State<AppState>) -> Json<Vec<PartyTrade>> {
    let mut all = Vec::new();
    for p in state.sandbox.parties() {
        let trades = p.runtime.trades();
        all.extend(
            trades
                .trades()
                .into_iter()
                .chain(trades.closed_trades())
                .map(|trade| PartyTrade {
                    party: p.name.to_string(),
                    trade,
                }),
        );
    }
    Json(all)
}

/// `GET /trades/:id`: the trade as each party that knows it sees it.
async fn trade_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Vec<PartyTrade>> {
    let views: Vec<PartyTrade> = state
        .sandbox
        .parties()
        .into_iter()
        .filter_map(|p| {
            let trades = p.runtime.trades();
            trades
                .snapshot(&id)
                .or_else(|| trades.closed_trades().into_iter().find(|t| t.id == id))
                .map(|trade| PartyTrade {
                    party: p.name.to_string(),
                    trade,
                })
        })
        .collect();
    if views.is_empty() {
        return Err(ApiError::not_found(format!("trade {id} not found")));
    }
    Ok(Json(views))
}

async fn offers_handler(State(state): State<AppState>) -> Json<Vec<OpenOffer>> {
    Json(state.sandbox.maker.runtime.offers().open_offers())
}

async fn place_offer_handler(
    State(state): State<AppState>,
    Json(terms): Json<NewOffer>,
) -> Result<(StatusCode, Json<OpenOffer>), ApiError> {
    let offer = state.sandbox.place_offer(&terms).await?;
    Ok((StatusCode::CREATED, Json(offer)))
}

async fn take_offer_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(req): Json<TakeOfferRequest>,
) -> ApiResult<Trade> {
    if state.sandbox.maker.runtime.offers().open_offer(&id).is_none() {
        return Err(ApiError::not_found(format!("offer {id} not found")));
    }
    Ok(Json(state.sandbox.take_offer(&id, req.amount).await?))
}

async fn payment_sent_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Trade> {
    let buyer = trader_on_side(&state.sandbox, &id, Side::Buyer)?;
    Ok(Json(buyer.runtime.trades().confirm_payment_sent(&id).await?))
}

async fn payment_received_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Trade> {
    let seller = trader_on_side(&state.sandbox, &id, Side::Seller)?;
    Ok(Json(seller.runtime.trades().confirm_payment_received(&id).await?))
}

async fn open_dispute_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(req): Json<OpenDisputeRequest>,
) -> ApiResult<Dispute> {
    let opener = trader(&state.sandbox, &req.party)?;
    let dispute = opener
        .runtime
        .disputes()
        .open_dispute(&id, req.support_type, req.reason)
        .await?;
    Ok(Json(dispute))
}

async fn chat_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let sender = party(&state.sandbox, &req.party)?;
    let message = sender.runtime.disputes().send_chat(&id, req.text).await?;
    Ok(Json(message))
}

async fn resolve_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(result): Json<DisputeResult>,
) -> ApiResult<Dispute> {
    let dispute = state
        .sandbox
        .arbitrator
        .runtime
        .disputes()
        .resolve_dispute(&id, result)
        .await?;
    Ok(Json(dispute))
}

async fn disputes_handler(State(state): State<AppState>) -> Json<Vec<PartyDispute>> {
    let all = state
        .sandbox
        .parties()
        .into_iter()
        .flat_map(|p| {
            p.runtime
                .disputes()
                .disputes()
                .into_iter()
                .map(move |dispute| PartyDispute {
                    party: p.name.to_string(),
                    dispute,
                })
        })
        .collect();
    Json(all)
}

/// `POST /verify-payout`: runs the cooperative payout checks on a
/// described transaction without touching any trade. A failed check is a
/// 422 carrying the first failing rule.
async fn verify_payout_handler(
    State(state): State<AppState>,
    Json(req): Json<VerifyPayoutRequest>,
) -> impl IntoResponse {
    match verify_payout_tx(&req.tx, &req.terms, &req.multisig_address) {
        Ok(split) => (
            StatusCode::OK,
            Json(VerifyPayoutResponse {
                valid: true,
                split: Some(split),
                error: None,
            }),
        ),
        Err(e) => {
            state.metrics.payout_checks_rejected_total.inc();
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(VerifyPayoutResponse {
                    valid: false,
                    split: None,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

async fn mine_handler(
    State(state): State<AppState>,
    Json(req): Json<MineRequest>,
) -> impl IntoResponse {
    state.sandbox.mine(req.blocks);
    Json(serde_json::json!({ "chain_height": state.sandbox.chain.height() }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use xmrx_protocol::config::{ProtocolConfig, ATOMIC_UNITS_PER_XMR as XMR};
    use xmrx_protocol::escrow::Destination;

    async fn test_app_state() -> AppState {
        let sandbox = Sandbox::start(ProtocolConfig::fast(), None, 100 * XMR, None)
            .await
            .expect("sandbox");
        AppState {
            version: "0.1.0-test".into(),
            sandbox,
            metrics: Arc::new(crate::metrics::NodeMetrics::new()),
        }
    }

    /// Sends a GET request and returns the (status, body_bytes).
    async fn get(router: &Router, path: &str) -> (StatusCode, Vec<u8>) {
        let req = Request::builder().uri(path).body(Body::empty()).unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .unwrap()
            .to_bytes()
            .to_vec();
        (status, body)
    }

    /// Sends a POST request with JSON body and returns (status, body_bytes).
    async fn post_json(
        router: &Router,
        path: &str,
        body: serde_json::Value,
    ) -> (StatusCode, Vec<u8>) {
        let req = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .unwrap()
            .to_bytes()
            .to_vec();
        (status, body)
    }

    fn payout_request(buyer_amount: u64) -> serde_json::Value {
        let terms = PayoutTerms {
            buyer_payout_address: "buyer".into(),
            seller_payout_address: "seller".into(),
            buyer_deposit: XMR,
            seller_deposit: 3 * XMR,
            trade_amount: 2 * XMR,
        };
        let fee = 1_000;
        let tx = TxDescription {
            hash: "payout".into(),
            destinations: vec![
                Destination::new("buyer", buyer_amount),
                Destination::new("seller", XMR - fee / 2),
            ],
            change_address: None,
            change_amount: 0,
            fee,
            output_sum: buyer_amount + XMR - fee / 2,
            key_images: vec![],
            signature_count: 1,
        };
        serde_json::json!({ "tx": tx, "terms": terms, "multisig_address": "msig" })
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let state = test_app_state().await;
        let router = create_router(state.clone());
        let (status, body) = get(&router, "/health").await;

        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        state.sandbox.shutdown().await;
    }

    #[tokio::test]
    async fn status_lists_three_funded_parties() {
        let state = test_app_state().await;
        let router = create_router(state.clone());
        let (status, body) = get(&router, "/status").await;

        assert_eq!(status, StatusCode::OK);
        let resp: StatusResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(resp.parties.len(), 3);
        assert_eq!(resp.parties[0].balance, 100 * XMR);
        assert_eq!(resp.parties[2].balance, 0);
        state.sandbox.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_trade_is_404() {
        let state = test_app_state().await;
        let router = create_router(state.clone());

        let (status, _) = get(&router, "/trades/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = post_json(&router, "/trades/missing/payment-sent", serde_json::json!({})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = post_json(
            &router,
            "/offers/missing/take",
            serde_json::json!({ "amount": XMR }),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        state.sandbox.shutdown().await;
    }

    #[tokio::test]
    async fn place_offer_is_created_and_listed() {
        let state = test_app_state().await;
        let router = create_router(state.clone());
        let (status, body) = post_json(
            &router,
            "/offers",
            serde_json::json!({
                "direction": "Sell",
                "amount": 4 * XMR,
                "min_amount": XMR,
                "price": 15_000,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{}", String::from_utf8_lossy(&body));
        let offer: OpenOffer = serde_json::from_slice(&body).unwrap();

        let (status, body) = get(&router, "/offers").await;
        assert_eq!(status, StatusCode::OK);
        let offers: Vec<OpenOffer> = serde_json::from_slice(&body).unwrap();
        assert!(offers.iter().any(|o| o.id() == offer.id()));
        state.sandbox.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_offer_is_400() {
        let state = test_app_state().await;
        let router = create_router(state.clone());
        let (status, _) = post_json(
            &router,
            "/offers",
            serde_json::json!({ "direction": "Buy", "amount": 0, "price": 1 }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        state.sandbox.shutdown().await;
    }

    #[tokio::test]
    async fn dispute_by_arbitrator_is_rejected() {
        let state = test_app_state().await;
        let router = create_router(state.clone());
        let (status, _) = post_json(
            &router,
            "/trades/t1/dispute",
            serde_json::json!({ "party": "arbitrator", "reason": "x" }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        state.sandbox.shutdown().await;
    }

    #[tokio::test]
    async fn verify_payout_accepts_exact_split() {
        let state = test_app_state().await;
        let router = create_router(state.clone());
        let (status, body) = post_json(&router, "/verify-payout", payout_request(3 * XMR - 500)).await;

        assert_eq!(status, StatusCode::OK, "{}", String::from_utf8_lossy(&body));
        let resp: VerifyPayoutResponse = serde_json::from_slice(&body).unwrap();
        assert!(resp.valid);
        assert_eq!(resp.split.unwrap().tx_cost, 1_000);
        state.sandbox.shutdown().await;
    }

    #[tokio::test]
    async fn verify_payout_rejects_one_piconero_off() {
        let state = test_app_state().await;
        let router = create_router(state.clone());
        let (status, body) = post_json(&router, "/verify-payout", payout_request(3 * XMR - 499)).await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        let resp: VerifyPayoutResponse = serde_json::from_slice(&body).unwrap();
        assert!(!resp.valid);
        assert!(resp.error.is_some());
        assert_eq!(state.metrics.payout_checks_rejected_total.get(), 1);
        state.sandbox.shutdown().await;
    }

    #[tokio::test]
    async fn mine_advances_chain() {
        let state = test_app_state().await;
        let router = create_router(state.clone());
        let (status, body) = post_json(&router, "/mine", serde_json::json!({ "blocks": 3 })).await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["chain_height"], 3);
        state.sandbox.shutdown().await;
    }
}
