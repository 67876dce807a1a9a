//! Peer-to-peer limit order book: price-time-priority matching, depth
//! aggregation, cancellation, expiry, and settlement status.
//!
//! Matching is defined for binary markets only. An incoming order on outcome
//! A at max-cost-per-share `p` crosses a resting order on outcome B at `q`
//! iff `p + q >= 1`; each side fills at its own price. Counterparties are
//! ranked by mcps descending, ties by earliest arrival.

use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use tracing::{debug, info};
use uuid::Uuid;

use crate::errors::{HubError, HubResult};
use crate::models::{OrderStatus, P2pFill, P2pOrder};

/// Unfilled share remainders below this are considered fully filled.
const SHARE_EPSILON: f64 = 1e-9;

pub struct NewOrderInput {
    pub market_id: String,
    pub user_address: String,
    pub outcome_index: i64,
    pub mcps: f64,
    pub amount: f64,
    pub app_session_id: String,
    pub app_session_version: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOrderResult {
    pub order_id: String,
    pub status: OrderStatus,
    pub fills: Vec<P2pFill>,
    pub order: P2pOrder,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DepthLevel {
    pub price: f64,
    pub shares: f64,
    pub order_count: usize,
}

pub struct OrderBookManager {
    pool: SqlitePool,
}

impl OrderBookManager {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get_order(&self, order_id: &str) -> HubResult<P2pOrder> {
        let row = sqlx::query("SELECT * FROM p2p_orders WHERE id = ?1")
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| HubError::NotFound(format!("order {order_id}")))?;
        P2pOrder::from_row(&row)
    }

    /// Validate, rest, and immediately match an incoming order.
    /// `outcomes` is the market category's label list; non-binary markets
    /// are rejected before anything is written.
    pub async fn place_order(
        &self,
        input: NewOrderInput,
        outcomes: &[String],
    ) -> HubResult<PlaceOrderResult> {
        if outcomes.len() != 2 {
            return Err(HubError::UnsupportedMarket(outcomes.len()));
        }
        if input.outcome_index < 0 || input.outcome_index as usize >= outcomes.len() {
            return Err(HubError::Validation(format!(
                "outcome index {} out of range",
                input.outcome_index
            )));
        }
        if !(input.mcps > 0.0 && input.mcps < 1.0) {
            return Err(HubError::Validation(format!(
                "mcps must be inside (0, 1), got {}",
                input.mcps
            )));
        }
        if !(input.amount.is_finite() && input.amount > 0.0) {
            return Err(HubError::Validation(format!(
                "amount must be positive, got {}",
                input.amount
            )));
        }

        let now = Utc::now();
        let max_shares = input.amount / input.mcps;
        let mut taker = P2pOrder {
            id: format!("ord_{}", Uuid::new_v4().simple()),
            market_id: input.market_id,
            user_address: input.user_address,
            outcome_index: input.outcome_index,
            mcps: input.mcps,
            amount: input.amount,
            filled_amount: 0.0,
            unfilled_amount: input.amount,
            max_shares,
            filled_shares: 0.0,
            unfilled_shares: max_shares,
            app_session_id: input.app_session_id,
            app_session_version: input.app_session_version,
            status: OrderStatus::Open,
            created_at: now,
            updated_at: now,
        };

        let counter_outcome = 1 - taker.outcome_index;
        // Tolerance keeps exact p + q = 1 crosses from failing on rounding.
        let min_counter_mcps = 1.0 - taker.mcps - 1e-9;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO p2p_orders
             (id, market_id, user_address, outcome_index, mcps, amount, filled_amount,
              unfilled_amount, max_shares, filled_shares, unfilled_shares, app_session_id,
              app_session_version, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        )
        .bind(&taker.id)
        .bind(&taker.market_id)
        .bind(&taker.user_address)
        .bind(taker.outcome_index)
        .bind(taker.mcps)
        .bind(taker.amount)
        .bind(taker.filled_amount)
        .bind(taker.unfilled_amount)
        .bind(taker.max_shares)
        .bind(taker.filled_shares)
        .bind(taker.unfilled_shares)
        .bind(&taker.app_session_id)
        .bind(taker.app_session_version)
        .bind(taker.status.as_str())
        .bind(taker.created_at)
        .bind(taker.updated_at)
        .execute(&mut *tx)
        .await?;

        // Eligible makers, best price first, ties by age.
        let maker_rows = sqlx::query(
            "SELECT * FROM p2p_orders
             WHERE market_id = ?1 AND outcome_index = ?2 AND mcps >= ?3
               AND status IN ('OPEN', 'PARTIALLY_FILLED')
             ORDER BY mcps DESC, created_at ASC",
        )
        .bind(&taker.market_id)
        .bind(counter_outcome)
        .bind(min_counter_mcps)
        .fetch_all(&mut *tx)
        .await?;

        let mut fills = Vec::new();
        for maker_row in &maker_rows {
            if taker.unfilled_shares <= SHARE_EPSILON {
                break;
            }
            let mut maker = P2pOrder::from_row(maker_row)?;
            let matched = taker.unfilled_shares.min(maker.unfilled_shares);
            if matched <= SHARE_EPSILON {
                continue;
            }

            apply_fill(&mut taker, matched);
            apply_fill(&mut maker, matched);

            let fill = P2pFill {
                id: format!("fill_{}", Uuid::new_v4().simple()),
                market_id: taker.market_id.clone(),
                taker_order_id: taker.id.clone(),
                maker_order_id: maker.id.clone(),
                shares: matched,
                price: taker.mcps,
                cost: matched * taker.mcps,
                created_at: Utc::now(),
            };

            sqlx::query(
                "INSERT INTO p2p_fills
                 (id, market_id, taker_order_id, maker_order_id, shares, price, cost, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )
            .bind(&fill.id)
            .bind(&fill.market_id)
            .bind(&fill.taker_order_id)
            .bind(&fill.maker_order_id)
            .bind(fill.shares)
            .bind(fill.price)
            .bind(fill.cost)
            .bind(fill.created_at)
            .execute(&mut *tx)
            .await?;

            persist_fill_state(&mut tx, &maker).await?;
            fills.push(fill);
        }

        persist_fill_state(&mut tx, &taker).await?;
        tx.commit().await?;

        if !fills.is_empty() {
            info!(
                order_id = %taker.id,
                market_id = %taker.market_id,
                fills = fills.len(),
                filled_shares = taker.filled_shares,
                "order matched"
            );
        } else {
            debug!(order_id = %taker.id, market_id = %taker.market_id, "order resting");
        }

        Ok(PlaceOrderResult {
            order_id: taker.id.clone(),
            status: taker.status,
            fills,
            order: taker,
        })
    }

    /// Cancel a resting order; only OPEN and PARTIALLY_FILLED orders are
    /// cancellable. The unfilled portion is released by the caller through
    /// the settlement service.
    pub async fn cancel_order(&self, order_id: &str) -> HubResult<P2pOrder> {
        let order = self.get_order(order_id).await?;
        if !order.status.is_restable() {
            return Err(HubError::IllegalMarketState {
                id: order.id,
                status: order.status.as_str().to_string(),
                expected: "OPEN or PARTIALLY_FILLED".to_string(),
            });
        }
        sqlx::query(
            "UPDATE p2p_orders SET status = 'CANCELLED', updated_at = ?1
             WHERE id = ?2 AND status IN ('OPEN', 'PARTIALLY_FILLED')",
        )
        .bind(Utc::now())
        .bind(order_id)
        .execute(&self.pool)
        .await?;
        info!(order_id, "order cancelled");
        self.get_order(order_id).await
    }

    /// Aggregated resting depth per outcome label, price levels sorted
    /// descending.
    pub async fn get_depth(
        &self,
        market_id: &str,
        outcomes: &[String],
    ) -> HubResult<BTreeMap<String, Vec<DepthLevel>>> {
        let rows = sqlx::query(
            "SELECT * FROM p2p_orders
             WHERE market_id = ?1 AND status IN ('OPEN', 'PARTIALLY_FILLED')",
        )
        .bind(market_id)
        .fetch_all(&self.pool)
        .await?;

        let mut depth: BTreeMap<String, Vec<DepthLevel>> = BTreeMap::new();
        for label in outcomes {
            depth.insert(label.clone(), Vec::new());
        }

        for row in &rows {
            let order = P2pOrder::from_row(row)?;
            let Some(label) = outcomes.get(order.outcome_index as usize) else {
                continue;
            };
            let levels = depth.entry(label.clone()).or_default();
            match levels
                .iter_mut()
                .find(|level| (level.price - order.mcps).abs() < 1e-12)
            {
                Some(level) => {
                    level.shares += order.unfilled_shares;
                    level.order_count += 1;
                }
                None => levels.push(DepthLevel {
                    price: order.mcps,
                    shares: order.unfilled_shares,
                    order_count: 1,
                }),
            }
        }

        for levels in depth.values_mut() {
            levels.sort_by(|a, b| b.price.partial_cmp(&a.price).expect("finite prices"));
        }
        Ok(depth)
    }

    pub async fn get_orders_by_user(
        &self,
        address: &str,
        market_id: Option<&str>,
    ) -> HubResult<Vec<P2pOrder>> {
        let rows = match market_id {
            Some(market) => {
                sqlx::query(
                    "SELECT * FROM p2p_orders
                     WHERE user_address = ?1 AND market_id = ?2
                     ORDER BY created_at DESC",
                )
                .bind(address)
                .bind(market)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM p2p_orders WHERE user_address = ?1 ORDER BY created_at DESC",
                )
                .bind(address)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(P2pOrder::from_row).collect()
    }

    /// Orders with any filled portion that have not yet been settled.
    pub async fn get_filled_orders_for_resolution(
        &self,
        market_id: &str,
    ) -> HubResult<Vec<P2pOrder>> {
        let rows = sqlx::query(
            "SELECT * FROM p2p_orders
             WHERE market_id = ?1 AND filled_shares > 0 AND status != 'SETTLED'
             ORDER BY created_at ASC",
        )
        .bind(market_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(P2pOrder::from_row).collect()
    }

    /// Mark every fully-unfilled resting order EXPIRED and return them.
    pub async fn expire_unfilled_orders(&self, market_id: &str) -> HubResult<Vec<P2pOrder>> {
        let rows = sqlx::query(
            "SELECT * FROM p2p_orders
             WHERE market_id = ?1 AND status = 'OPEN' AND filled_shares <= ?2
             ORDER BY created_at ASC",
        )
        .bind(market_id)
        .bind(SHARE_EPSILON)
        .fetch_all(&self.pool)
        .await?;

        let mut expired = Vec::new();
        let now = Utc::now();
        for row in &rows {
            let mut order = P2pOrder::from_row(row)?;
            sqlx::query("UPDATE p2p_orders SET status = 'EXPIRED', updated_at = ?1 WHERE id = ?2")
                .bind(now)
                .bind(&order.id)
                .execute(&self.pool)
                .await?;
            order.status = OrderStatus::Expired;
            order.updated_at = now;
            expired.push(order);
        }
        if !expired.is_empty() {
            info!(market_id, count = expired.len(), "unfilled orders expired");
        }
        Ok(expired)
    }

    /// Terminal transition once the resolution pipeline has closed the
    /// order's session.
    pub async fn settle_order(&self, order_id: &str) -> HubResult<()> {
        let result = sqlx::query(
            "UPDATE p2p_orders SET status = 'SETTLED', updated_at = ?1 WHERE id = ?2",
        )
        .bind(Utc::now())
        .bind(order_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(HubError::NotFound(format!("order {order_id}")));
        }
        Ok(())
    }

    pub async fn update_order_session_version(
        &self,
        order_id: &str,
        version: i64,
    ) -> HubResult<()> {
        let result = sqlx::query(
            "UPDATE p2p_orders SET app_session_version = ?1, updated_at = ?2
             WHERE id = ?3 AND app_session_version < ?1",
        )
        .bind(version)
        .bind(Utc::now())
        .bind(order_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            let order = self.get_order(order_id).await?;
            return Err(HubError::SessionVersionRegression {
                session_id: order.app_session_id,
                current: order.app_session_version,
                attempted: version,
            });
        }
        Ok(())
    }
}

/// Apply `matched` shares to one side of a fill at that side's own price.
fn apply_fill(order: &mut P2pOrder, matched: f64) {
    let own_cost = matched * order.mcps;
    order.filled_shares += matched;
    order.unfilled_shares = (order.unfilled_shares - matched).max(0.0);
    order.filled_amount += own_cost;
    order.unfilled_amount = (order.unfilled_amount - own_cost).max(0.0);
    order.status = if order.unfilled_shares <= SHARE_EPSILON {
        OrderStatus::Filled
    } else {
        OrderStatus::PartiallyFilled
    };
    order.updated_at = Utc::now();
}

async fn persist_fill_state(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    order: &P2pOrder,
) -> HubResult<()> {
    sqlx::query(
        "UPDATE p2p_orders SET filled_amount = ?1, unfilled_amount = ?2, filled_shares = ?3,
                unfilled_shares = ?4, status = ?5, updated_at = ?6
         WHERE id = ?7",
    )
    .bind(order.filled_amount)
    .bind(order.unfilled_amount)
    .bind(order.filled_shares)
    .bind(order.unfilled_shares)
    .bind(order.status.as_str())
    .bind(order.updated_at)
    .bind(&order.id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
