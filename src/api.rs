//! API surface: request validation, dispatch into the managers, response
//! shaping, and the WebSocket upgrade path.
//!
//! Handlers catch typed errors and map them onto the HTTP contract;
//! managers stay transport-free. A bet or order that is rejected after the
//! user already opened a settlement session gets that session closed with a
//! full refund; plain validation failures never touch a session.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::warn;

use crate::clearnode::ClearnodeClient;
use crate::config::{HubConfig, Settings};
use crate::db;
use crate::errors::{HubError, HubResult};
use crate::lp::LpManager;
use crate::market::MarketManager;
use crate::models::{Market, MarketStatus, PositionMode};
use crate::orderbook::{NewOrderInput, OrderBookManager};
use crate::oracle::GameController;
use crate::positions::{NewPosition, PositionTracker};
use crate::resolution::ResolutionPipeline;
use crate::session_data::{self, SessionDataV2, SessionDataV3};
use crate::ws::{ConnectionManager, WsKind};

type ApiResult = Result<Json<Value>, HubError>;

#[derive(Clone)]
pub struct AppState {
    pub db: sqlx::SqlitePool,
    pub settings: Settings,
    pub markets: Arc<MarketManager>,
    pub positions: Arc<PositionTracker>,
    pub orderbook: Arc<OrderBookManager>,
    pub lp: Arc<LpManager>,
    pub clearnode: Arc<ClearnodeClient>,
    pub ws: Arc<ConnectionManager>,
    pub oracle: Arc<GameController>,
    pub pipeline: Arc<ResolutionPipeline>,
}

impl AppState {
    pub fn new(pool: sqlx::SqlitePool, config: &HubConfig, settings: Settings) -> Self {
        let markets = Arc::new(MarketManager::new(pool.clone(), settings.clone()));
        let positions = Arc::new(PositionTracker::new(pool.clone()));
        let orderbook = Arc::new(OrderBookManager::new(pool.clone()));
        let lp = Arc::new(LpManager::new(pool.clone()));
        let clearnode = ClearnodeClient::new(config);
        let ws = Arc::new(ConnectionManager::new());
        let oracle = Arc::new(GameController::new(pool.clone(), ws.clone()));
        let pipeline = Arc::new(ResolutionPipeline::new(
            markets.clone(),
            positions.clone(),
            orderbook.clone(),
            clearnode.clone(),
            ws.clone(),
            settings.clone(),
        ));
        Self {
            db: pool,
            settings,
            markets,
            positions,
            orderbook,
            lp,
            clearnode,
            ws,
            oracle,
            pipeline,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/bet", post(place_bet))
        .route("/api/orderbook/order", post(place_order))
        .route("/api/orderbook/order/:order_id", delete(cancel_order))
        .route("/api/orderbook/depth/:market_id", get(order_depth))
        .route("/api/orderbook/orders/:address", get(orders_by_user))
        .route("/api/market", get(current_market))
        .route("/api/market/:id", get(market_by_id))
        .route("/api/positions/:address", get(positions_by_address))
        .route("/api/oracle/game-state", post(set_game_state))
        .route("/api/oracle/market/open", post(oracle_open_market))
        .route("/api/oracle/market/close", post(oracle_close_market))
        .route("/api/oracle/outcome", post(oracle_outcome))
        .route("/api/lp/deposit", post(lp_deposit))
        .route("/api/lp/withdraw", post(lp_withdraw))
        .route("/api/lp/stats", get(lp_stats))
        .route("/api/lp/share/:address", get(lp_share))
        .route("/api/lp/events", get(lp_events))
        .route("/api/admin/state", get(admin_state))
        .route("/api/admin/reset", post(admin_reset))
        .route("/api/admin/config", get(get_admin_config).post(set_admin_config))
        .route("/api/mm/info", get(mm_info))
        .route("/ws", get(ws_upgrade))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy", "service": "pitchside" }))
}

// ----------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------

fn require_str<'a>(field: &'a Option<String>, name: &str) -> HubResult<&'a str> {
    field
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| HubError::Validation(format!("missing required field: {name}")))
}

fn require_f64(field: Option<f64>, name: &str) -> HubResult<f64> {
    let value =
        field.ok_or_else(|| HubError::Validation(format!("missing required field: {name}")))?;
    if !value.is_finite() {
        return Err(HubError::Validation(format!("{name} must be finite")));
    }
    Ok(value)
}

/// Outcomes arrive either as an index or as a category label.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum OutcomeRef {
    Index(i64),
    Label(String),
}

impl OutcomeRef {
    fn resolve(&self, labels: &[String]) -> HubResult<usize> {
        match self {
            OutcomeRef::Index(index) => {
                let index = usize::try_from(*index).map_err(|_| {
                    HubError::Validation(format!("outcome index must be non-negative, got {index}"))
                })?;
                if index >= labels.len() {
                    return Err(HubError::Validation(format!(
                        "outcome index {index} out of range for {} outcomes",
                        labels.len()
                    )));
                }
                Ok(index)
            }
            OutcomeRef::Label(label) => labels
                .iter()
                .position(|candidate| candidate.eq_ignore_ascii_case(label))
                .ok_or_else(|| HubError::Validation(format!("unknown outcome: {label}"))),
        }
    }
}

/// A rejected bet/order whose session already exists gets the full stake
/// handed back through an immediate session close.
async fn refund_session(
    state: &AppState,
    session_id: &str,
    address: &str,
    amount: f64,
    mode: PositionMode,
    market_id: &str,
) {
    let data = session_data::encode(&SessionDataV3::refund(mode, market_id, amount));
    let allocations = match (
        crate::clearnode::Allocation::new(address, amount),
        crate::clearnode::Allocation::new(&state.clearnode.mm_address(), 0.0),
    ) {
        (Ok(user), Ok(mm)) => vec![user, mm],
        _ => return,
    };
    if let Err(e) = state
        .clearnode
        .close_session(session_id, &allocations, &data)
        .await
    {
        warn!(session_id, error = %e, "failed to close session for rejected bet");
    }
}

async fn broadcast_orderbook(state: &AppState, market: &Market) {
    let Ok(category) = state.markets.get_category(&market.category_id).await else {
        return;
    };
    if let Ok(depth) = state.orderbook.get_depth(&market.id, &category.outcomes).await {
        state.ws.broadcast(
            WsKind::OrderbookUpdate,
            json!({ "marketId": market.id, "outcomes": depth }),
        );
    }
}

// ----------------------------------------------------------------------
// Betting
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BetRequest {
    address: Option<String>,
    market_id: Option<String>,
    outcome: Option<OutcomeRef>,
    amount: Option<f64>,
    app_session_id: Option<String>,
    app_session_version: Option<i64>,
}

async fn place_bet(State(state): State<AppState>, Json(body): Json<BetRequest>) -> ApiResult {
    let address = require_str(&body.address, "address")?.to_string();
    let market_id = require_str(&body.market_id, "marketId")?.to_string();
    let session_id = require_str(&body.app_session_id, "appSessionId")?.to_string();
    let session_version = body
        .app_session_version
        .ok_or_else(|| HubError::Validation("missing required field: appSessionVersion".into()))?;
    let amount = require_f64(body.amount, "amount")?;
    if amount <= 0.0 {
        return Err(HubError::Validation(format!(
            "amount must be positive, got {amount}"
        )));
    }
    let outcome = body
        .outcome
        .ok_or_else(|| HubError::Validation("missing required field: outcome".into()))?;

    let market = state.markets.get_market(&market_id).await?;
    let category = state.markets.get_category(&market.category_id).await?;
    let outcome_index = outcome.resolve(&category.outcomes)?;

    // Session exists by now; a state-machine rejection must hand the stake
    // back before reporting the refusal.
    if market.status != MarketStatus::Open {
        refund_session(
            &state,
            &session_id,
            &address,
            amount,
            PositionMode::Lmsr,
            &market_id,
        )
        .await;
        return Ok(Json(json!({
            "accepted": false,
            "reason": format!("Market is {}", market.status.as_str()),
        })));
    }

    let execution = match state.markets.place_bet(&market_id, outcome_index, amount).await {
        Ok(execution) => execution,
        Err(e @ (HubError::PriceInfeasible(_) | HubError::IllegalMarketState { .. })) => {
            refund_session(
                &state,
                &session_id,
                &address,
                amount,
                PositionMode::Lmsr,
                &market_id,
            )
            .await;
            return Ok(Json(json!({ "accepted": false, "reason": e.to_string() })));
        }
        Err(e) => return Err(e),
    };

    let fee = amount * state.settings.transaction_fee_percent().await / 100.0;
    let v2 = SessionDataV2::new(
        PositionMode::Lmsr,
        &market_id,
        outcome_index as i64,
        amount,
        execution.shares,
        execution.prices.clone(),
        fee,
    );
    let blob = session_data::encode(&v2);

    let position = state
        .positions
        .add_position(NewPosition {
            address: address.clone(),
            market_id: market_id.clone(),
            outcome_index: outcome_index as i64,
            shares: execution.shares,
            cost_paid: amount,
            fee_paid: fee,
            app_session_id: session_id.clone(),
            app_session_version: session_version,
            mode: PositionMode::Lmsr,
            session_data: Some(blob.clone()),
        })
        .await?;

    // Mirror acceptance into the session: same escrow, V2 data, version + 1.
    let next_version = session_version + 1;
    let escrow = match (
        crate::clearnode::Allocation::new(&address, amount),
        crate::clearnode::Allocation::new(&state.clearnode.mm_address(), 0.0),
    ) {
        (Ok(user), Ok(mm)) => Some(vec![user, mm]),
        _ => None,
    };
    if let Some(allocations) = escrow {
        match state
            .clearnode
            .submit_app_state(
                &session_id,
                crate::clearnode::StateIntent::Operate,
                next_version,
                &allocations,
                &blob,
            )
            .await
        {
            Ok(_) => {
                state
                    .positions
                    .update_app_session_version(&session_id, next_version)
                    .await?;
                state.ws.broadcast(
                    WsKind::SessionVersionUpdated,
                    json!({ "appSessionId": session_id, "version": next_version }),
                );
            }
            Err(e) => warn!(session_id = %session_id, error = %e, "bet accepted but V2 submit failed"),
        }
    }

    state.ws.broadcast(
        WsKind::OddsUpdate,
        json!({
            "marketId": market_id,
            "prices": execution.prices,
            "outcomes": category.outcomes,
        }),
    );
    state.ws.broadcast(
        WsKind::VolumeUpdate,
        json!({ "marketId": market_id, "volume": execution.market.volume }),
    );
    state
        .ws
        .send_to(&address, WsKind::PositionAdded, json!(position));

    Ok(Json(json!({
        "accepted": true,
        "shares": execution.shares,
        "prices": execution.prices,
        "outcomes": category.outcomes,
    })))
}

// ----------------------------------------------------------------------
// Order book
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderRequest {
    market_id: Option<String>,
    #[allow(dead_code)]
    game_id: Option<String>,
    user_address: Option<String>,
    outcome: Option<OutcomeRef>,
    mcps: Option<f64>,
    amount: Option<f64>,
    app_session_id: Option<String>,
    app_session_version: Option<i64>,
}

async fn place_order(State(state): State<AppState>, Json(body): Json<OrderRequest>) -> ApiResult {
    let market_id = require_str(&body.market_id, "marketId")?.to_string();
    let address = require_str(&body.user_address, "userAddress")?.to_string();
    let session_id = require_str(&body.app_session_id, "appSessionId")?.to_string();
    let session_version = body
        .app_session_version
        .ok_or_else(|| HubError::Validation("missing required field: appSessionVersion".into()))?;
    let mcps = require_f64(body.mcps, "mcps")?;
    let amount = require_f64(body.amount, "amount")?;
    let outcome = body
        .outcome
        .ok_or_else(|| HubError::Validation("missing required field: outcome".into()))?;

    let market = state.markets.get_market(&market_id).await?;
    let category = state.markets.get_category(&market.category_id).await?;
    let outcome_index = outcome.resolve(&category.outcomes)?;

    if market.status != MarketStatus::Open {
        refund_session(
            &state,
            &session_id,
            &address,
            amount,
            PositionMode::P2p,
            &market_id,
        )
        .await;
        return Err(HubError::IllegalMarketState {
            id: market_id,
            status: market.status.as_str().to_string(),
            expected: MarketStatus::Open.as_str().to_string(),
        });
    }
    if category.outcomes.len() != 2 {
        refund_session(
            &state,
            &session_id,
            &address,
            amount,
            PositionMode::P2p,
            &market_id,
        )
        .await;
        return Err(HubError::UnsupportedMarket(category.outcomes.len()));
    }

    // Matching for one market is serialized alongside its bets.
    let lock = state.markets.market_lock(&market_id).await;
    let guard = lock.lock().await;
    let result = state
        .orderbook
        .place_order(
            NewOrderInput {
                market_id: market_id.clone(),
                user_address: address.clone(),
                outcome_index: outcome_index as i64,
                mcps,
                amount,
                app_session_id: session_id.clone(),
                app_session_version: session_version,
            },
            &category.outcomes,
        )
        .await?;
    drop(guard);

    // Mirror filled totals into positions, taker and every maker touched.
    if !result.fills.is_empty() {
        let taker = &result.order;
        state
            .positions
            .upsert_p2p_fill(
                &taker.user_address,
                &market_id,
                taker.outcome_index,
                &taker.app_session_id,
                taker.app_session_version,
                taker.filled_shares,
                taker.filled_amount,
            )
            .await?;
        for fill in &result.fills {
            let maker = state.orderbook.get_order(&fill.maker_order_id).await?;
            state
                .positions
                .upsert_p2p_fill(
                    &maker.user_address,
                    &market_id,
                    maker.outcome_index,
                    &maker.app_session_id,
                    maker.app_session_version,
                    maker.filled_shares,
                    maker.filled_amount,
                )
                .await?;
            state.ws.send_to(
                &maker.user_address,
                WsKind::OrderFilled,
                json!({ "orderId": maker.id, "fill": fill }),
            );
        }
        state.ws.send_to(
            &address,
            WsKind::OrderFilled,
            json!({ "orderId": result.order_id, "fills": result.fills }),
        );
    }

    state.ws.broadcast(
        WsKind::OrderPlaced,
        json!({
            "orderId": result.order_id,
            "marketId": market_id,
            "outcome": category.outcomes[outcome_index],
            "mcps": mcps,
            "status": result.status,
        }),
    );
    broadcast_orderbook(&state, &market).await;

    Ok(Json(json!({
        "orderId": result.order_id,
        "status": result.status,
        "fills": result.fills,
        "order": result.order,
    })))
}

async fn cancel_order(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> ApiResult {
    let order = state.orderbook.cancel_order(&order_id).await?;

    // A never-filled order's stake goes straight back; a partially filled
    // one keeps its session open for the resolution sweep, which refunds
    // the unfilled remainder in the final close allocations.
    if order.filled_shares <= f64::EPSILON {
        refund_session(
            &state,
            &order.app_session_id,
            &order.user_address,
            order.amount,
            PositionMode::P2p,
            &order.market_id,
        )
        .await;
    }

    state.ws.send_to(
        &order.user_address,
        WsKind::OrderCancelled,
        json!({ "orderId": order.id, "marketId": order.market_id, "reason": "CANCELLED" }),
    );
    if let Ok(market) = state.markets.get_market(&order.market_id).await {
        broadcast_orderbook(&state, &market).await;
    }
    Ok(Json(json!({ "order": order })))
}

async fn order_depth(
    State(state): State<AppState>,
    Path(market_id): Path<String>,
) -> ApiResult {
    let market = state.markets.get_market(&market_id).await?;
    let category = state.markets.get_category(&market.category_id).await?;
    let depth = state.orderbook.get_depth(&market_id, &category.outcomes).await?;
    Ok(Json(json!({
        "marketId": market_id,
        "outcomes": depth,
        "updatedAt": chrono::Utc::now(),
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrdersQuery {
    market_id: Option<String>,
}

async fn orders_by_user(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Query(query): Query<OrdersQuery>,
) -> ApiResult {
    let orders = state
        .orderbook
        .get_orders_by_user(&address, query.market_id.as_deref())
        .await?;
    Ok(Json(json!({ "orders": orders })))
}

// ----------------------------------------------------------------------
// Markets and positions
// ----------------------------------------------------------------------

async fn market_response(state: &AppState, market: Market) -> ApiResult {
    let category = state.markets.get_category(&market.category_id).await?;
    let prices = crate::lmsr::prices(&market.quantities, market.liquidity_b)?;
    Ok(Json(json!({
        "market": market,
        "prices": prices,
        "outcomes": category.outcomes,
    })))
}

async fn current_market(State(state): State<AppState>) -> ApiResult {
    match state.markets.get_current_market(None, None).await? {
        Some(market) => market_response(&state, market).await,
        None => Ok(Json(json!({ "market": Value::Null }))),
    }
}

async fn market_by_id(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let market = state.markets.get_market(&id).await?;
    market_response(&state, market).await
}

async fn positions_by_address(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> ApiResult {
    let positions = state.positions.get_positions_by_user(&address).await?;
    Ok(Json(json!({ "positions": positions })))
}

// ----------------------------------------------------------------------
// Oracle
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GameStateRequest {
    active: Option<bool>,
}

async fn set_game_state(
    State(state): State<AppState>,
    Json(body): Json<GameStateRequest>,
) -> ApiResult {
    let active = body
        .active
        .ok_or_else(|| HubError::Validation("missing required field: active".into()))?;
    state.oracle.set_game_active(active).await?;
    Ok(Json(json!({ "success": true, "active": active })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OracleMarketRequest {
    game_id: Option<String>,
    category_id: Option<String>,
}

async fn oracle_open_market(
    State(state): State<AppState>,
    Json(body): Json<OracleMarketRequest>,
) -> ApiResult {
    let game_id = require_str(&body.game_id, "gameId")?;
    let category_id = require_str(&body.category_id, "categoryId")?;

    let market = match state
        .markets
        .get_current_market(Some(game_id), Some(category_id))
        .await?
    {
        Some(market) if market.status == MarketStatus::Pending => market,
        Some(market) => {
            return Err(HubError::IllegalMarketState {
                id: market.id,
                status: market.status.as_str().to_string(),
                expected: MarketStatus::Pending.as_str().to_string(),
            })
        }
        None => state.markets.create_market(game_id, category_id, None).await?,
    };

    let pool_value = state.clearnode.pool_value().await;
    let market = state.markets.open_market(&market.id, pool_value).await?;

    state.ws.broadcast(
        WsKind::MarketStatus,
        json!({ "marketId": market.id, "status": "OPEN" }),
    );
    Ok(Json(json!({ "success": true, "marketId": market.id })))
}

async fn oracle_close_market(
    State(state): State<AppState>,
    Json(body): Json<OracleMarketRequest>,
) -> ApiResult {
    let market = state
        .markets
        .get_current_market(body.game_id.as_deref(), body.category_id.as_deref())
        .await?
        .ok_or_else(|| HubError::NotFound("open market".into()))?;
    let market = state.markets.close_market(&market.id).await?;

    state.ws.broadcast(
        WsKind::MarketStatus,
        json!({ "marketId": market.id, "status": "CLOSED" }),
    );
    Ok(Json(json!({ "success": true, "marketId": market.id })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OracleOutcomeRequest {
    outcome: Option<OutcomeRef>,
    game_id: Option<String>,
    category_id: Option<String>,
}

async fn oracle_outcome(
    State(state): State<AppState>,
    Json(body): Json<OracleOutcomeRequest>,
) -> ApiResult {
    let outcome = body
        .outcome
        .ok_or_else(|| HubError::Validation("missing required field: outcome".into()))?;
    let market = state
        .markets
        .get_current_market(body.game_id.as_deref(), body.category_id.as_deref())
        .await?
        .ok_or_else(|| HubError::NotFound("market".into()))?;
    let category = state.markets.get_category(&market.category_id).await?;
    let winning_outcome = outcome.resolve(&category.outcomes)?;

    // One oracle call drives the legal remainder of the chain.
    if market.status == MarketStatus::Open {
        state.markets.close_market(&market.id).await?;
        state.ws.broadcast(
            WsKind::MarketStatus,
            json!({ "marketId": market.id, "status": "CLOSED" }),
        );
    }

    let report = state.pipeline.resolve(&market.id, winning_outcome).await?;
    Ok(Json(json!({
        "success": true,
        "marketId": market.id,
        "outcome": category.outcomes[winning_outcome],
        "winners": report.outcome.winners,
        "losers": report.outcome.losers,
        "totalPayout": report.outcome.total_payout,
    })))
}

// ----------------------------------------------------------------------
// LP
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct LpDepositRequest {
    address: Option<String>,
    amount: Option<f64>,
}

async fn lp_deposit(
    State(state): State<AppState>,
    Json(body): Json<LpDepositRequest>,
) -> ApiResult {
    let address = require_str(&body.address, "address")?;
    let amount = require_f64(body.amount, "amount")?;

    let pool_value = state.clearnode.pool_value().await.unwrap_or(0.0);
    let result = state.lp.deposit(address, amount, pool_value).await?;

    state.ws.broadcast(
        WsKind::LpDeposit,
        json!({ "address": address, "amount": amount, "shares": result.shares }),
    );
    state.ws.broadcast(
        WsKind::PoolUpdate,
        json!({ "poolValue": result.pool_value_after }),
    );
    Ok(Json(json!({
        "success": true,
        "shares": result.shares,
        "sharePrice": result.share_price,
        "poolValueAfter": result.pool_value_after,
    })))
}

#[derive(Debug, Deserialize)]
struct LpWithdrawRequest {
    address: Option<String>,
    shares: Option<f64>,
}

async fn lp_withdraw(
    State(state): State<AppState>,
    Json(body): Json<LpWithdrawRequest>,
) -> ApiResult {
    let address = require_str(&body.address, "address")?;
    let shares = require_f64(body.shares, "shares")?;

    let pool_value = state.clearnode.pool_value().await.unwrap_or(0.0);
    let result = state.lp.withdraw(address, shares, pool_value).await?;

    // Pay out from the market-maker account. The hub stays authoritative
    // over the share ledger even when the transfer cannot be delivered.
    if let Err(e) = state
        .clearnode
        .transfer(address, crate::clearnode::PRIMARY_ASSET, result.amount)
        .await
    {
        warn!(address, amount = result.amount, error = %e, "LP payout transfer failed");
    }

    state.ws.broadcast(
        WsKind::LpWithdrawal,
        json!({ "address": address, "amount": result.amount, "shares": shares }),
    );
    state.ws.broadcast(
        WsKind::PoolUpdate,
        json!({ "poolValue": result.pool_value_after }),
    );
    Ok(Json(json!({
        "success": true,
        "amount": result.amount,
        "shares": result.shares,
        "sharePrice": result.share_price,
        "poolValueAfter": result.pool_value_after,
    })))
}

async fn lp_stats(State(state): State<AppState>) -> ApiResult {
    let pool_value = state.clearnode.pool_value().await.unwrap_or(0.0);
    let stats = state.lp.pool_stats(pool_value).await?;
    Ok(Json(json!(stats)))
}

async fn lp_share(State(state): State<AppState>, Path(address): Path<String>) -> ApiResult {
    match state.lp.get_share(&address).await? {
        Some(share) => Ok(Json(json!(share))),
        None => Err(HubError::NotFound(format!("LP share for {address}"))),
    }
}

#[derive(Debug, Deserialize)]
struct LpEventsQuery {
    address: Option<String>,
}

async fn lp_events(
    State(state): State<AppState>,
    Query(query): Query<LpEventsQuery>,
) -> ApiResult {
    let events = state.lp.get_events(query.address.as_deref()).await?;
    Ok(Json(json!({ "events": events })))
}

// ----------------------------------------------------------------------
// Admin
// ----------------------------------------------------------------------

async fn admin_state(State(state): State<AppState>) -> ApiResult {
    let markets = state.markets.list_markets(None).await?;
    let game_rows = sqlx::query("SELECT * FROM games ORDER BY created_at DESC")
        .fetch_all(&state.db)
        .await
        .map_err(HubError::from)?;
    let games: Vec<_> = game_rows
        .iter()
        .map(crate::models::Game::from_row)
        .collect::<HubResult<_>>()?;
    let settings = state.settings.snapshot().await;
    Ok(Json(json!({
        "gameActive": db::get_flag(&state.db, "game_active", true).await.map_err(HubError::from)?,
        "games": games,
        "markets": markets,
        "connections": state.ws.connection_count(),
        "config": {
            "transactionFeePercent": settings.transaction_fee_percent,
            "lmsrSensitivityFactor": settings.lmsr_sensitivity_factor,
        },
        "mmConnected": state.clearnode.is_connected(),
    })))
}

async fn admin_reset(State(state): State<AppState>) -> ApiResult {
    state.oracle.stop_autoplay().await;
    state.ws.clear();
    db::reset(&state.db).await.map_err(HubError::from)?;
    Ok(Json(json!({ "success": true })))
}

async fn get_admin_config(State(state): State<AppState>) -> ApiResult {
    let settings = state.settings.snapshot().await;
    Ok(Json(json!({
        "success": true,
        "transactionFeePercent": settings.transaction_fee_percent,
        "lmsrSensitivityFactor": settings.lmsr_sensitivity_factor,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdminConfigRequest {
    transaction_fee_percent: Option<f64>,
    lmsr_sensitivity_factor: Option<f64>,
}

async fn set_admin_config(
    State(state): State<AppState>,
    Json(body): Json<AdminConfigRequest>,
) -> ApiResult {
    let updated = state
        .settings
        .update(body.transaction_fee_percent, body.lmsr_sensitivity_factor)
        .await
        .map_err(HubError::Validation)?;

    state.ws.broadcast(
        WsKind::ConfigUpdated,
        json!({
            "transactionFeePercent": updated.transaction_fee_percent,
            "lmsrSensitivityFactor": updated.lmsr_sensitivity_factor,
        }),
    );
    Ok(Json(json!({
        "success": true,
        "transactionFeePercent": updated.transaction_fee_percent,
        "lmsrSensitivityFactor": updated.lmsr_sensitivity_factor,
    })))
}

async fn mm_info(State(state): State<AppState>) -> ApiResult {
    let balance = state.clearnode.pool_value().await;
    Ok(Json(json!({
        "address": state.clearnode.mm_address(),
        "balance": balance,
        "isConnected": state.clearnode.is_connected(),
    })))
}

// ----------------------------------------------------------------------
// WebSocket
// ----------------------------------------------------------------------

async fn ws_upgrade(
    upgrade: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> Response {
    let address = params.get("address").cloned();
    upgrade.on_upgrade(move |socket| ws_connection(socket, state, address))
}

async fn ws_connection(socket: WebSocket, state: AppState, address: Option<String>) {
    let (mut sink, mut stream) = socket.split();
    let (conn_id, mut outbound) = state.ws.add_connection(address.clone());

    // Initial snapshot, targeted at this socket only.
    let snapshot = state_sync_snapshot(&state, address.as_deref()).await;
    state
        .ws
        .send_to_socket(conn_id, WsKind::StateSync, snapshot);
    state.ws.broadcast(
        WsKind::ConnectionCount,
        json!({ "connections": state.ws.connection_count() }),
    );

    // Writer: drains this socket's queue in enqueue order.
    let writer = tokio::spawn(async move {
        while let Some(payload) = outbound.recv().await {
            if sink.send(Message::Text(payload)).await.is_err() {
                break;
            }
        }
    });

    // Clients never send application messages; drain until close.
    while let Some(Ok(message)) = stream.next().await {
        if let Message::Close(_) = message {
            break;
        }
    }

    state.ws.remove_connection(conn_id);
    writer.abort();
    state.ws.broadcast(
        WsKind::ConnectionCount,
        json!({ "connections": state.ws.connection_count() }),
    );
}

async fn state_sync_snapshot(state: &AppState, address: Option<&str>) -> Value {
    let market = state.markets.get_current_market(None, None).await.ok().flatten();
    let market_view = match &market {
        Some(market) => {
            let prices = crate::lmsr::prices(&market.quantities, market.liquidity_b).ok();
            let outcomes = state
                .markets
                .get_category(&market.category_id)
                .await
                .map(|category| category.outcomes)
                .ok();
            json!({ "market": market, "prices": prices, "outcomes": outcomes })
        }
        None => json!({ "market": Value::Null }),
    };
    let positions = match address {
        Some(address) => state
            .positions
            .get_positions_by_user(address)
            .await
            .unwrap_or_default(),
        None => Vec::new(),
    };
    json!({
        "market": market_view,
        "positions": positions,
        "gameActive": db::get_flag(&state.db, "game_active", true).await.unwrap_or(true),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeSettings;
    use crate::testutil::MockClearnode;

    async fn hub(mock: &MockClearnode) -> AppState {
        let pool = crate::db::memory_pool().await.unwrap();
        let config = HubConfig {
            clearnode_url: mock.url(),
            faucet_url: "http://127.0.0.1:1/faucet".to_string(),
            ..HubConfig::default()
        };
        let settings = Settings::with(RuntimeSettings {
            transaction_fee_percent: 2.0,
            lmsr_sensitivity_factor: 0.01,
        });
        let state = AppState::new(pool, &config, settings);
        state.oracle.activate_game("GAME_DEMO").await.unwrap();
        state
    }

    async fn open_market(state: &AppState) -> String {
        let market = state
            .markets
            .create_market("GAME_DEMO", "PITCH_OUTCOME", Some(100.0))
            .await
            .unwrap();
        state.markets.open_market(&market.id, None).await.unwrap();
        market.id
    }

    fn bet_body(market_id: &str, session: &str) -> BetRequest {
        BetRequest {
            address: Some("0xuser".to_string()),
            market_id: Some(market_id.to_string()),
            outcome: Some(OutcomeRef::Label("BALL".to_string())),
            amount: Some(10.0),
            app_session_id: Some(session.to_string()),
            app_session_version: Some(1),
        }
    }

    #[tokio::test]
    async fn accepted_bet_creates_position_and_submits_v2() {
        let mock = MockClearnode::start().await;
        let state = hub(&mock).await;
        let market_id = open_market(&state).await;

        let Json(body) = place_bet(State(state.clone()), Json(bet_body(&market_id, "sess_bet")))
            .await
            .unwrap();
        assert_eq!(body["accepted"], true);
        assert!(body["shares"].as_f64().unwrap() > 10.0);
        assert!(body["prices"][0].as_f64().unwrap() > 0.5);

        let position = state
            .positions
            .get_position_by_session("sess_bet")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(position.app_session_version, 2);
        assert!((position.fee_paid - 0.2).abs() < 1e-12);
        let blob = position.session_data.unwrap();
        assert!(blob.contains(r#""v":2"#));

        let submit = mock
            .recorded_calls()
            .into_iter()
            .find(|call| call.method == "submit_app_state")
            .unwrap();
        assert_eq!(submit.params["version"].as_i64().unwrap(), 2);
    }

    #[tokio::test]
    async fn bet_on_closed_market_is_refused_and_session_closed() {
        let mock = MockClearnode::start().await;
        let state = hub(&mock).await;
        let market_id = open_market(&state).await;
        state.markets.close_market(&market_id).await.unwrap();

        let Json(body) = place_bet(State(state.clone()), Json(bet_body(&market_id, "sess_late")))
            .await
            .unwrap();
        assert_eq!(body["accepted"], false);
        assert_eq!(body["reason"], "Market is CLOSED");

        // Full stake handed back through an immediate session close.
        let close = mock
            .recorded_calls()
            .into_iter()
            .find(|call| call.method == "close_app_session")
            .expect("session close for the rejected bet");
        assert_eq!(close.params["app_session_id"], "sess_late");
        assert_eq!(
            close.params["allocations"][0]["amount"].as_str().unwrap(),
            "10000000"
        );
        assert!(state
            .positions
            .get_position_by_session("sess_late")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn validation_errors_never_touch_a_session() {
        let mock = MockClearnode::start().await;
        let state = hub(&mock).await;
        let market_id = open_market(&state).await;

        let mut body = bet_body(&market_id, "sess_invalid");
        body.amount = None;
        let err = place_bet(State(state.clone()), Json(body)).await.unwrap_err();
        assert!(matches!(err, HubError::Validation(_)));
        assert!(!mock
            .recorded_methods()
            .iter()
            .any(|method| method == "close_app_session"));
    }

    #[tokio::test]
    async fn order_on_non_binary_market_is_rejected_with_refund() {
        let mock = MockClearnode::start().await;
        let state = hub(&mock).await;

        sqlx::query(
            "INSERT INTO market_categories (id, sport_id, outcomes, description)
             VALUES ('TRIPLE', 'BASEBALL', '[\"A\",\"B\",\"C\"]', 'three-way')",
        )
        .execute(&state.db)
        .await
        .unwrap();
        let market = state
            .markets
            .create_market("GAME_DEMO", "TRIPLE", None)
            .await
            .unwrap();
        state.markets.open_market(&market.id, None).await.unwrap();

        let err = place_order(
            State(state.clone()),
            Json(OrderRequest {
                market_id: Some(market.id.clone()),
                game_id: None,
                user_address: Some("0xuser".to_string()),
                outcome: Some(OutcomeRef::Index(0)),
                mcps: Some(0.5),
                amount: Some(5.0),
                app_session_id: Some("sess_tri".to_string()),
                app_session_version: Some(1),
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HubError::UnsupportedMarket(3)));

        let close = mock
            .recorded_calls()
            .into_iter()
            .find(|call| call.method == "close_app_session")
            .expect("refund close for the unsupported order");
        assert_eq!(close.params["app_session_id"], "sess_tri");
    }

    #[tokio::test]
    async fn cancelling_an_unfilled_order_refunds_the_stake() {
        let mock = MockClearnode::start().await;
        let state = hub(&mock).await;
        let market_id = open_market(&state).await;

        let Json(placed) = place_order(
            State(state.clone()),
            Json(OrderRequest {
                market_id: Some(market_id.clone()),
                game_id: None,
                user_address: Some("0xuser".to_string()),
                outcome: Some(OutcomeRef::Label("BALL".to_string())),
                mcps: Some(0.6),
                amount: Some(6.0),
                app_session_id: Some("sess_rest".to_string()),
                app_session_version: Some(1),
            }),
        )
        .await
        .unwrap();
        let order_id = placed["orderId"].as_str().unwrap().to_string();

        let Json(cancelled) = cancel_order(State(state.clone()), Path(order_id))
            .await
            .unwrap();
        assert_eq!(cancelled["order"]["status"], "CANCELLED");

        let close = mock
            .recorded_calls()
            .into_iter()
            .find(|call| call.method == "close_app_session")
            .expect("refund close for the cancelled order");
        assert_eq!(
            close.params["allocations"][0]["amount"].as_str().unwrap(),
            "6000000"
        );
    }

    #[tokio::test]
    async fn lp_share_lookup_misses_with_not_found() {
        let mock = MockClearnode::start().await;
        let state = hub(&mock).await;
        let err = lp_share(State(state), Path("0xnobody".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::NotFound(_)));
    }

    #[tokio::test]
    async fn admin_config_round_trips_and_validates() {
        let mock = MockClearnode::start().await;
        let state = hub(&mock).await;

        let Json(updated) = set_admin_config(
            State(state.clone()),
            Json(AdminConfigRequest {
                transaction_fee_percent: Some(5.0),
                lmsr_sensitivity_factor: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(updated["transactionFeePercent"], 5.0);

        let err = set_admin_config(
            State(state.clone()),
            Json(AdminConfigRequest {
                transaction_fee_percent: Some(500.0),
                lmsr_sensitivity_factor: None,
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HubError::Validation(_)));

        let Json(current) = get_admin_config(State(state)).await.unwrap();
        assert_eq!(current["transactionFeePercent"], 5.0);
    }
}
