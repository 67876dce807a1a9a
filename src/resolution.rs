//! Resolution pipeline: settles every position of a resolved market through
//! the settlement service in three phases.
//!
//! Phase A: LMSR losers, then winners (losers first so the market-maker
//! account holds the loser stakes before paying winners). Phase B: the same
//! sweep for P2P filled orders. Phase C: expire fully-unfilled orders and
//! return their stakes.
//!
//! Each settlement RPC is attempted exactly once per step. A failure is
//! logged and the sweep continues; the hub-side status update and broadcast
//! happen regardless, so a user-visible position can never get stuck on a
//! settlement outage. The resulting skew between hub and service is
//! accepted partial failure.

use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::clearnode::{Allocation, ClearnodeClient, StateIntent, PRIMARY_ASSET};
use crate::config::Settings;
use crate::errors::{HubError, HubResult};
use crate::market::{MarketManager, ResolutionOutcome};
use crate::models::{P2pOrder, Position, PositionMode, SessionStatus};
use crate::orderbook::OrderBookManager;
use crate::positions::PositionTracker;
use crate::session_data::{self, SessionDataV3};
use crate::ws::{ConnectionManager, WsKind};

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionReport {
    #[serde(flatten)]
    pub outcome: ResolutionOutcome,
    pub p2p_settled: usize,
    pub expired_orders: usize,
}

pub struct ResolutionPipeline {
    markets: Arc<MarketManager>,
    positions: Arc<PositionTracker>,
    orderbook: Arc<OrderBookManager>,
    clearnode: Arc<ClearnodeClient>,
    ws: Arc<ConnectionManager>,
    settings: Settings,
}

impl ResolutionPipeline {
    pub fn new(
        markets: Arc<MarketManager>,
        positions: Arc<PositionTracker>,
        orderbook: Arc<OrderBookManager>,
        clearnode: Arc<ClearnodeClient>,
        ws: Arc<ConnectionManager>,
        settings: Settings,
    ) -> Self {
        Self {
            markets,
            positions,
            orderbook,
            clearnode,
            ws,
            settings,
        }
    }

    /// Resolve a CLOSED market and settle every position. Single-threaded
    /// per market: the market lock is held for the whole sweep.
    pub async fn resolve(
        &self,
        market_id: &str,
        winning_outcome: usize,
    ) -> HubResult<ResolutionReport> {
        let lock = self.markets.market_lock(market_id).await;
        let _guard = lock.lock().await;

        let all_positions = self.positions.get_positions_by_market(market_id).await?;
        let outcome = self
            .markets
            .resolve_market(market_id, winning_outcome, &all_positions)
            .await?;

        // Phase A: LMSR losers first, then winners.
        let lmsr: Vec<&Position> = all_positions
            .iter()
            .filter(|p| p.mode == PositionMode::Lmsr)
            .collect();
        for position in lmsr
            .iter()
            .filter(|p| p.outcome_index != winning_outcome as i64)
        {
            self.settle_lmsr_loser(market_id, position).await?;
        }
        for position in lmsr
            .iter()
            .filter(|p| p.outcome_index == winning_outcome as i64)
        {
            self.settle_lmsr_winner(market_id, position).await?;
        }

        // Phase B: P2P losers first, then winners.
        let filled = self
            .orderbook
            .get_filled_orders_for_resolution(market_id)
            .await?;
        for order in filled
            .iter()
            .filter(|o| o.outcome_index != winning_outcome as i64)
        {
            self.settle_p2p_loser(market_id, order).await?;
        }
        for order in filled
            .iter()
            .filter(|o| o.outcome_index == winning_outcome as i64)
        {
            self.settle_p2p_winner(market_id, order).await?;
        }

        // Phase C: expire whatever never traded and give the stake back.
        let expired = self.orderbook.expire_unfilled_orders(market_id).await?;
        for order in &expired {
            let data = session_data::encode(&SessionDataV3::refund(
                PositionMode::P2p,
                market_id,
                order.amount,
            ));
            let refund = self.allocations(&order.user_address, order.amount, 0.0);
            if let Some(allocations) = refund {
                if let Err(e) = self
                    .clearnode
                    .close_session(&order.app_session_id, &allocations, &data)
                    .await
                {
                    self.log_settlement_failure("close_session", &order.app_session_id, &e);
                }
            }
            self.ws.send_to(
                &order.user_address,
                WsKind::OrderCancelled,
                json!({ "orderId": order.id, "marketId": market_id, "reason": "EXPIRED" }),
            );
        }

        self.positions
            .clear_positions(market_id, Some(winning_outcome as i64))
            .await?;

        self.ws.broadcast(
            WsKind::MarketStatus,
            json!({
                "marketId": market_id,
                "status": "RESOLVED",
                "winningOutcome": winning_outcome,
            }),
        );
        if let Some(pool_value) = self.clearnode.pool_value().await {
            self.ws
                .broadcast(WsKind::PoolUpdate, json!({ "poolValue": pool_value }));
        }

        info!(
            market_id,
            winning_outcome,
            winners = outcome.winners.len(),
            losers = outcome.losers.len(),
            p2p_settled = filled.len(),
            expired = expired.len(),
            "resolution complete"
        );
        Ok(ResolutionReport {
            outcome,
            p2p_settled: filled.len(),
            expired_orders: expired.len(),
        })
    }

    // ------------------------------------------------------------------
    // Phase A steps
    // ------------------------------------------------------------------

    async fn settle_lmsr_loser(&self, market_id: &str, position: &Position) -> HubResult<()> {
        let session_id = &position.app_session_id;
        let next_version = position.app_session_version + 1;
        let data = session_data::encode(&SessionDataV3::loss(
            PositionMode::Lmsr,
            market_id,
            position.cost_paid,
        ));
        let allocations = self.allocations(&position.address, 0.0, position.cost_paid);

        if let Some(allocations) = &allocations {
            if let Err(e) = self
                .clearnode
                .submit_app_state(session_id, StateIntent::Operate, next_version, allocations, &data)
                .await
            {
                self.log_settlement_failure("submit_app_state", session_id, &e);
            }
        }
        self.advance_session(session_id, next_version, &data).await?;

        if let Some(allocations) = &allocations {
            if let Err(e) = self
                .clearnode
                .close_session(session_id, allocations, &data)
                .await
            {
                self.log_settlement_failure("close_session", session_id, &e);
            }
        }
        self.mark_settled(session_id).await?;

        self.ws.send_to(
            &position.address,
            WsKind::BetResult,
            json!({
                "marketId": market_id,
                "result": "LOSS",
                "loss": position.cost_paid,
                "appSessionId": session_id,
            }),
        );
        Ok(())
    }

    async fn settle_lmsr_winner(&self, market_id: &str, position: &Position) -> HubResult<()> {
        let session_id = &position.app_session_id;
        let next_version = position.app_session_version + 1;
        let payout = position.shares;
        let profit = payout - position.cost_paid;
        let fee = position.fee_paid;
        let data = session_data::encode(&SessionDataV3::win(
            PositionMode::Lmsr,
            market_id,
            payout,
            profit,
        ));
        let allocations = self.allocations(&position.address, position.cost_paid - fee, fee);

        if let Some(allocations) = &allocations {
            if let Err(e) = self
                .clearnode
                .submit_app_state(session_id, StateIntent::Operate, next_version, allocations, &data)
                .await
            {
                self.log_settlement_failure("submit_app_state", session_id, &e);
            }
        }
        self.advance_session(session_id, next_version, &data).await?;

        if let Some(allocations) = &allocations {
            if let Err(e) = self
                .clearnode
                .close_session(session_id, allocations, &data)
                .await
            {
                self.log_settlement_failure("close_session", session_id, &e);
            }
        }
        if profit > 0.0 {
            if let Err(e) = self
                .clearnode
                .transfer(&position.address, PRIMARY_ASSET, profit)
                .await
            {
                self.log_settlement_failure("transfer", session_id, &e);
            }
        }
        self.mark_settled(session_id).await?;

        self.ws.send_to(
            &position.address,
            WsKind::BetResult,
            json!({
                "marketId": market_id,
                "result": "WIN",
                "payout": payout,
                "profit": profit,
                "appSessionId": session_id,
            }),
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Phase B steps
    // ------------------------------------------------------------------

    async fn settle_p2p_loser(&self, market_id: &str, order: &P2pOrder) -> HubResult<()> {
        let session_id = &order.app_session_id;
        let next_version = order.app_session_version + 1;
        let data = session_data::encode(&SessionDataV3::loss(
            PositionMode::P2p,
            market_id,
            order.filled_amount,
        ));
        let allocations =
            self.allocations(&order.user_address, order.unfilled_amount, order.filled_amount);

        if let Some(allocations) = &allocations {
            if let Err(e) = self
                .clearnode
                .submit_app_state(session_id, StateIntent::Operate, next_version, allocations, &data)
                .await
            {
                self.log_settlement_failure("submit_app_state", session_id, &e);
            }
            if let Err(e) = self
                .clearnode
                .close_session(session_id, allocations, &data)
                .await
            {
                self.log_settlement_failure("close_session", session_id, &e);
            }
        }

        self.finish_p2p_order(order, next_version, &data).await?;
        self.ws.send_to(
            &order.user_address,
            WsKind::P2pBetResult,
            json!({
                "marketId": market_id,
                "orderId": order.id,
                "result": "LOSS",
                "loss": order.filled_amount,
                "refund": order.unfilled_amount,
            }),
        );
        Ok(())
    }

    async fn settle_p2p_winner(&self, market_id: &str, order: &P2pOrder) -> HubResult<()> {
        let session_id = &order.app_session_id;
        let next_version = order.app_session_version + 1;
        let fee_percent = self.settings.transaction_fee_percent().await;
        let fee = order.filled_shares * fee_percent / 100.0;
        let net_payout = order.filled_shares - fee;
        let profit = net_payout - order.filled_amount;
        let data = session_data::encode(&SessionDataV3::win(
            PositionMode::P2p,
            market_id,
            net_payout,
            profit,
        ));
        let user_allocation = order.filled_amount + order.unfilled_amount - fee;
        let allocations = self.allocations(&order.user_address, user_allocation, fee);

        if let Some(allocations) = &allocations {
            if let Err(e) = self
                .clearnode
                .submit_app_state(session_id, StateIntent::Operate, next_version, allocations, &data)
                .await
            {
                self.log_settlement_failure("submit_app_state", session_id, &e);
            }
            if let Err(e) = self
                .clearnode
                .close_session(session_id, allocations, &data)
                .await
            {
                self.log_settlement_failure("close_session", session_id, &e);
            }
        }
        if profit > 0.0 {
            if let Err(e) = self
                .clearnode
                .transfer(&order.user_address, PRIMARY_ASSET, profit)
                .await
            {
                self.log_settlement_failure("transfer", session_id, &e);
            }
        }

        self.finish_p2p_order(order, next_version, &data).await?;
        self.ws.send_to(
            &order.user_address,
            WsKind::P2pBetResult,
            json!({
                "marketId": market_id,
                "orderId": order.id,
                "result": "WIN",
                "payout": net_payout,
                "profit": profit,
                "fee": fee,
            }),
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Shared plumbing
    // ------------------------------------------------------------------

    /// `[user: X, mm: Y]` allocation pair, or None when an amount fails the
    /// micro-unit conversion (logged; the hub-side updates still run).
    fn allocations(&self, user: &str, user_amount: f64, mm_amount: f64) -> Option<Vec<Allocation>> {
        let mm = self.clearnode.mm_address();
        match (
            Allocation::new(user, user_amount),
            Allocation::new(&mm, mm_amount),
        ) {
            (Ok(user_allocation), Ok(mm_allocation)) => {
                Some(vec![user_allocation, mm_allocation])
            }
            (user_result, mm_result) => {
                error!(
                    user,
                    ?user_result,
                    ?mm_result,
                    "allocation construction failed; skipping settlement RPCs"
                );
                None
            }
        }
    }

    /// Hub-side version bump + blob update + broadcast. Runs regardless of
    /// RPC outcomes so the stored view keeps moving.
    async fn advance_session(&self, session_id: &str, version: i64, data: &str) -> HubResult<()> {
        match self
            .positions
            .update_app_session_version(session_id, version)
            .await
        {
            Ok(()) => {}
            Err(HubError::SessionVersionRegression {
                current, attempted, ..
            }) => {
                warn!(session_id, current, attempted, "skipping stale version bump");
            }
            Err(e) => return Err(e),
        }
        self.positions.update_session_data(session_id, data).await?;
        self.ws.broadcast(
            WsKind::SessionVersionUpdated,
            json!({ "appSessionId": session_id, "version": version }),
        );
        Ok(())
    }

    async fn mark_settled(&self, session_id: &str) -> HubResult<()> {
        self.positions
            .update_session_status(session_id, SessionStatus::Settled)
            .await?;
        self.ws.broadcast(
            WsKind::SessionSettled,
            json!({ "appSessionId": session_id }),
        );
        Ok(())
    }

    /// Advance the order row and its mirrored position (present only once
    /// the order has traded).
    async fn finish_p2p_order(&self, order: &P2pOrder, version: i64, data: &str) -> HubResult<()> {
        if let Err(e) = self
            .orderbook
            .update_order_session_version(&order.id, version)
            .await
        {
            if !matches!(e, HubError::SessionVersionRegression { .. }) {
                return Err(e);
            }
        }
        self.orderbook.settle_order(&order.id).await?;

        if self
            .positions
            .get_position_by_session(&order.app_session_id)
            .await?
            .is_some()
        {
            self.advance_session(&order.app_session_id, version, data).await?;
            self.mark_settled(&order.app_session_id).await?;
        }
        Ok(())
    }

    fn log_settlement_failure(&self, step: &str, session_id: &str, error: &HubError) {
        // Deliberate catch-and-continue: one unreachable session must not
        // block the rest of the sweep.
        error!(
            step,
            session_id,
            error = %error,
            settlement_failure = error.is_settlement_failure(),
            "settlement RPC failed during resolution; continuing"
        );
    }
}
