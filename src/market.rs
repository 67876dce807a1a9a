//! Market lifecycle state machine, LMSR bet execution, volume accounting,
//! and resolution computation.
//!
//! Bets on the same market are serialized by a per-market async mutex so the
//! quantity vector sees a linearizable update order.

use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::config::Settings;
use crate::db;
use crate::errors::{HubError, HubResult};
use crate::lmsr;
use crate::models::{
    Game, GameStatus, Market, MarketCategory, MarketStatus, Position, PositionMode,
};

/// Result of an accepted LMSR bet.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BetExecution {
    pub market: Market,
    pub shares: f64,
    pub prices: Vec<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettledWinner {
    pub address: String,
    pub app_session_id: String,
    pub payout: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettledLoser {
    pub address: String,
    pub app_session_id: String,
    pub loss: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionOutcome {
    pub market_id: String,
    pub winning_outcome: i64,
    pub winners: Vec<SettledWinner>,
    pub losers: Vec<SettledLoser>,
    pub total_payout: f64,
}

pub struct MarketManager {
    pool: SqlitePool,
    settings: Settings,
    /// One mutex per market id; bets and matches acquire it before mutating.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MarketManager {
    pub fn new(pool: SqlitePool, settings: Settings) -> Self {
        Self {
            pool,
            settings,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn market_lock(&self, market_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(market_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn get_category(&self, category_id: &str) -> HubResult<MarketCategory> {
        let row = sqlx::query("SELECT * FROM market_categories WHERE id = ?1")
            .bind(category_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| HubError::NotFound(format!("category {category_id}")))?;
        MarketCategory::from_row(&row)
    }

    pub async fn get_game(&self, game_id: &str) -> HubResult<Game> {
        let row = sqlx::query("SELECT * FROM games WHERE id = ?1")
            .bind(game_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| HubError::NotFound(format!("game {game_id}")))?;
        Game::from_row(&row)
    }

    pub async fn get_market(&self, market_id: &str) -> HubResult<Market> {
        let row = sqlx::query("SELECT * FROM markets WHERE id = ?1")
            .bind(market_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| HubError::NotFound(format!("market {market_id}")))?;
        Market::from_row(&row)
    }

    /// The single non-RESOLVED market for a (game, category) pair when
    /// scoped, else the most recent non-RESOLVED market globally.
    pub async fn get_current_market(
        &self,
        game_id: Option<&str>,
        category_id: Option<&str>,
    ) -> HubResult<Option<Market>> {
        let row = match (game_id, category_id) {
            (Some(game), Some(category)) => {
                sqlx::query(
                    "SELECT * FROM markets
                     WHERE game_id = ?1 AND category_id = ?2 AND status != 'RESOLVED'
                     ORDER BY created_at DESC LIMIT 1",
                )
                .bind(game)
                .bind(category)
                .fetch_optional(&self.pool)
                .await?
            }
            (Some(game), None) => {
                sqlx::query(
                    "SELECT * FROM markets
                     WHERE game_id = ?1 AND status != 'RESOLVED'
                     ORDER BY created_at DESC LIMIT 1",
                )
                .bind(game)
                .fetch_optional(&self.pool)
                .await?
            }
            (None, Some(category)) => {
                sqlx::query(
                    "SELECT * FROM markets
                     WHERE category_id = ?1 AND status != 'RESOLVED'
                     ORDER BY created_at DESC LIMIT 1",
                )
                .bind(category)
                .fetch_optional(&self.pool)
                .await?
            }
            (None, None) => {
                sqlx::query(
                    "SELECT * FROM markets WHERE status != 'RESOLVED'
                     ORDER BY created_at DESC LIMIT 1",
                )
                .fetch_optional(&self.pool)
                .await?
            }
        };
        row.map(|r| Market::from_row(&r)).transpose()
    }

    pub async fn list_markets(&self, game_id: Option<&str>) -> HubResult<Vec<Market>> {
        let rows = match game_id {
            Some(game) => {
                sqlx::query("SELECT * FROM markets WHERE game_id = ?1 ORDER BY created_at DESC")
                    .bind(game)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM markets ORDER BY created_at DESC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(Market::from_row).collect()
    }

    /// Allocate a new PENDING market under an ACTIVE game. At most one
    /// non-RESOLVED market may exist per (game, category) pair.
    pub async fn create_market(
        &self,
        game_id: &str,
        category_id: &str,
        b_override: Option<f64>,
    ) -> HubResult<Market> {
        if !db::get_flag(&self.pool, "game_active", true).await? {
            return Err(HubError::GameNotActive(game_id.to_string()));
        }
        let game = self.get_game(game_id).await?;
        if game.status != GameStatus::Active {
            return Err(HubError::GameNotActive(game_id.to_string()));
        }
        let category = self.get_category(category_id).await?;

        if let Some(b) = b_override {
            if !(b.is_finite() && b > 0.0) {
                return Err(HubError::Validation(format!(
                    "liquidity override must be positive, got {b}"
                )));
            }
        }

        let existing = sqlx::query(
            "SELECT COUNT(*) AS n FROM markets
             WHERE game_id = ?1 AND category_id = ?2 AND status != 'RESOLVED'",
        )
        .bind(game_id)
        .bind(category_id)
        .fetch_one(&self.pool)
        .await?;
        let n: i64 = sqlx::Row::get(&existing, "n");
        if n > 0 {
            return Err(HubError::MarketExists {
                game_id: game_id.to_string(),
                category_id: category_id.to_string(),
            });
        }

        let now = Utc::now();
        let market = Market {
            id: format!("mkt_{}", Uuid::new_v4().simple()),
            game_id: game_id.to_string(),
            category_id: category_id.to_string(),
            status: MarketStatus::Pending,
            resolved_outcome: None,
            quantities: vec![0.0; category.outcomes.len()],
            liquidity_b: b_override.unwrap_or(lmsr::DEFAULT_LIQUIDITY_B),
            volume: 0.0,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            "INSERT INTO markets
             (id, game_id, category_id, status, quantities, liquidity_b, volume, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(&market.id)
        .bind(&market.game_id)
        .bind(&market.category_id)
        .bind(market.status.as_str())
        .bind(serde_json::to_string(&market.quantities).expect("serializing a Vec<f64>"))
        .bind(market.liquidity_b)
        .bind(market.volume)
        .bind(market.created_at)
        .bind(market.updated_at)
        .execute(&self.pool)
        .await?;

        info!(market_id = %market.id, game_id, category_id, "market created");
        Ok(market)
    }

    /// PENDING → OPEN. When no explicit `b` override was given at creation
    /// and the live pool value is known and positive, `b` is rescaled to
    /// `pool_value × lmsr_sensitivity_factor` before any bet lands.
    pub async fn open_market(
        &self,
        market_id: &str,
        pool_value: Option<f64>,
    ) -> HubResult<Market> {
        if !db::get_flag(&self.pool, "game_active", true).await? {
            return Err(HubError::GameNotActive("hub".to_string()));
        }
        let market = self.get_market(market_id).await?;
        self.require_status(&market, MarketStatus::Pending, MarketStatus::Open)?;

        let mut b = market.liquidity_b;
        if (b - lmsr::DEFAULT_LIQUIDITY_B).abs() < f64::EPSILON {
            if let Some(pool_value) = pool_value {
                let factor = self.settings.lmsr_sensitivity_factor().await;
                let scaled = pool_value * factor;
                if scaled.is_finite() && scaled > 0.0 {
                    b = scaled;
                }
            }
        }

        self.transition(market_id, MarketStatus::Pending, MarketStatus::Open, Some(b))
            .await
    }

    /// OPEN → CLOSED.
    pub async fn close_market(&self, market_id: &str) -> HubResult<Market> {
        let market = self.get_market(market_id).await?;
        self.require_status(&market, MarketStatus::Open, MarketStatus::Closed)?;
        self.transition(market_id, MarketStatus::Open, MarketStatus::Closed, None)
            .await
    }

    fn require_status(
        &self,
        market: &Market,
        expected: MarketStatus,
        target: MarketStatus,
    ) -> HubResult<()> {
        if market.status != expected || !market.status.can_transition_to(target) {
            return Err(HubError::IllegalMarketState {
                id: market.id.clone(),
                status: market.status.as_str().to_string(),
                expected: expected.as_str().to_string(),
            });
        }
        Ok(())
    }

    async fn transition(
        &self,
        market_id: &str,
        from: MarketStatus,
        to: MarketStatus,
        new_b: Option<f64>,
    ) -> HubResult<Market> {
        let result = match new_b {
            Some(b) => {
                sqlx::query(
                    "UPDATE markets SET status = ?1, liquidity_b = ?2, updated_at = ?3
                     WHERE id = ?4 AND status = ?5",
                )
                .bind(to.as_str())
                .bind(b)
                .bind(Utc::now())
                .bind(market_id)
                .bind(from.as_str())
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "UPDATE markets SET status = ?1, updated_at = ?2
                     WHERE id = ?3 AND status = ?4",
                )
                .bind(to.as_str())
                .bind(Utc::now())
                .bind(market_id)
                .bind(from.as_str())
                .execute(&self.pool)
                .await?
            }
        };
        if result.rows_affected() == 0 {
            // Raced with another transition; report the state we actually see.
            let market = self.get_market(market_id).await?;
            return Err(HubError::IllegalMarketState {
                id: market.id,
                status: market.status.as_str().to_string(),
                expected: from.as_str().to_string(),
            });
        }
        info!(market_id, from = from.as_str(), to = to.as_str(), "market transition");
        self.get_market(market_id).await
    }

    /// Execute an LMSR bet: compute shares, mutate quantities, accumulate
    /// volume. Serialized per market.
    pub async fn place_bet(
        &self,
        market_id: &str,
        outcome_index: usize,
        amount: f64,
    ) -> HubResult<BetExecution> {
        let lock = self.market_lock(market_id).await;
        let _guard = lock.lock().await;

        let market = self.get_market(market_id).await?;
        if market.status != MarketStatus::Open {
            return Err(HubError::IllegalMarketState {
                id: market.id,
                status: market.status.as_str().to_string(),
                expected: MarketStatus::Open.as_str().to_string(),
            });
        }
        if outcome_index >= market.quantities.len() {
            return Err(HubError::Validation(format!(
                "outcome index {outcome_index} out of range for {} outcomes",
                market.quantities.len()
            )));
        }

        let shares =
            lmsr::shares_for_amount(&market.quantities, market.liquidity_b, outcome_index, amount)?;
        let new_quantities = lmsr::apply_purchase(&market.quantities, outcome_index, shares);
        let prices = lmsr::prices(&new_quantities, market.liquidity_b)?;

        sqlx::query(
            "UPDATE markets SET quantities = ?1, volume = volume + ?2, updated_at = ?3
             WHERE id = ?4",
        )
        .bind(serde_json::to_string(&new_quantities).expect("serializing a Vec<f64>"))
        .bind(amount)
        .bind(Utc::now())
        .bind(market_id)
        .execute(&self.pool)
        .await?;

        let mut updated = market;
        updated.quantities = new_quantities;
        updated.volume += amount;

        Ok(BetExecution {
            market: updated,
            shares,
            prices,
        })
    }

    /// CLOSED → RESOLVED. Computes the per-position outcome for the LMSR
    /// positions handed in: winners are owed $1 per share, losers lose their
    /// cost paid.
    pub async fn resolve_market(
        &self,
        market_id: &str,
        winning_outcome: usize,
        positions: &[Position],
    ) -> HubResult<ResolutionOutcome> {
        let market = self.get_market(market_id).await?;
        self.require_status(&market, MarketStatus::Closed, MarketStatus::Resolved)?;
        if winning_outcome >= market.quantities.len() {
            return Err(HubError::Validation(format!(
                "winning outcome {winning_outcome} out of range for {} outcomes",
                market.quantities.len()
            )));
        }

        let mut winners = Vec::new();
        let mut losers = Vec::new();
        let mut total_payout = 0.0;
        for position in positions {
            if position.mode != PositionMode::Lmsr || position.market_id != market_id {
                continue;
            }
            if position.outcome_index == winning_outcome as i64 {
                total_payout += position.shares;
                winners.push(SettledWinner {
                    address: position.address.clone(),
                    app_session_id: position.app_session_id.clone(),
                    payout: position.shares,
                });
            } else {
                losers.push(SettledLoser {
                    address: position.address.clone(),
                    app_session_id: position.app_session_id.clone(),
                    loss: position.cost_paid,
                });
            }
        }

        let result = sqlx::query(
            "UPDATE markets SET status = 'RESOLVED', resolved_outcome = ?1, updated_at = ?2
             WHERE id = ?3 AND status = 'CLOSED'",
        )
        .bind(winning_outcome as i64)
        .bind(Utc::now())
        .bind(market_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            let market = self.get_market(market_id).await?;
            return Err(HubError::IllegalMarketState {
                id: market.id,
                status: market.status.as_str().to_string(),
                expected: MarketStatus::Closed.as_str().to_string(),
            });
        }

        info!(
            market_id,
            winning_outcome,
            winners = winners.len(),
            losers = losers.len(),
            total_payout,
            "market resolved"
        );
        Ok(ResolutionOutcome {
            market_id: market_id.to_string(),
            winning_outcome: winning_outcome as i64,
            winners,
            losers,
            total_payout,
        })
    }

    /// True when any market is currently OPEN; feeds the LP withdrawal lock.
    pub async fn any_market_open(&self) -> HubResult<bool> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM markets WHERE status = 'OPEN'")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = sqlx::Row::get(&row, "n");
        Ok(n > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeSettings;

    async fn manager() -> MarketManager {
        let pool = db::memory_pool().await.unwrap();
        MarketManager::new(pool, Settings::with(RuntimeSettings::default()))
    }

    async fn activate_demo_game(manager: &MarketManager) {
        sqlx::query("UPDATE games SET status = 'ACTIVE' WHERE id = 'GAME_DEMO'")
            .execute(&manager.pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn create_requires_an_active_game() {
        let manager = manager().await;
        let err = manager
            .create_market("GAME_DEMO", "PITCH_OUTCOME", None)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::GameNotActive(_)));

        activate_demo_game(&manager).await;
        let market = manager
            .create_market("GAME_DEMO", "PITCH_OUTCOME", None)
            .await
            .unwrap();
        assert_eq!(market.status, MarketStatus::Pending);
        assert_eq!(market.quantities, vec![0.0, 0.0]);
        assert_eq!(market.liquidity_b, lmsr::DEFAULT_LIQUIDITY_B);
    }

    #[tokio::test]
    async fn duplicate_unresolved_market_is_rejected() {
        let manager = manager().await;
        activate_demo_game(&manager).await;
        manager
            .create_market("GAME_DEMO", "PITCH_OUTCOME", None)
            .await
            .unwrap();
        let err = manager
            .create_market("GAME_DEMO", "PITCH_OUTCOME", None)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::MarketExists { .. }));
    }

    #[tokio::test]
    async fn lifecycle_is_a_single_chain() {
        let manager = manager().await;
        activate_demo_game(&manager).await;
        let market = manager
            .create_market("GAME_DEMO", "PITCH_OUTCOME", None)
            .await
            .unwrap();

        // Cannot close a PENDING market.
        assert!(matches!(
            manager.close_market(&market.id).await.unwrap_err(),
            HubError::IllegalMarketState { .. }
        ));

        let market = manager.open_market(&market.id, None).await.unwrap();
        assert_eq!(market.status, MarketStatus::Open);

        // Cannot open twice.
        assert!(matches!(
            manager.open_market(&market.id, None).await.unwrap_err(),
            HubError::IllegalMarketState { .. }
        ));

        let market = manager.close_market(&market.id).await.unwrap();
        assert_eq!(market.status, MarketStatus::Closed);

        let outcome = manager.resolve_market(&market.id, 0, &[]).await.unwrap();
        assert_eq!(outcome.total_payout, 0.0);
        let market = manager.get_market(&market.id).await.unwrap();
        assert_eq!(market.status, MarketStatus::Resolved);
        assert_eq!(market.resolved_outcome, Some(0));
    }

    #[tokio::test]
    async fn open_scales_b_from_pool_value() {
        let manager = manager().await;
        activate_demo_game(&manager).await;
        let market = manager
            .create_market("GAME_DEMO", "PITCH_OUTCOME", None)
            .await
            .unwrap();
        let market = manager.open_market(&market.id, Some(50_000.0)).await.unwrap();
        // 50_000 × default sensitivity 0.01
        assert!((market.liquidity_b - 500.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn explicit_b_override_is_not_rescaled() {
        let manager = manager().await;
        activate_demo_game(&manager).await;
        let market = manager
            .create_market("GAME_DEMO", "PITCH_OUTCOME", Some(250.0))
            .await
            .unwrap();
        let market = manager.open_market(&market.id, Some(50_000.0)).await.unwrap();
        assert_eq!(market.liquidity_b, 250.0);
    }

    #[tokio::test]
    async fn bets_move_prices_and_volume() {
        let manager = manager().await;
        activate_demo_game(&manager).await;
        let market = manager
            .create_market("GAME_DEMO", "PITCH_OUTCOME", Some(100.0))
            .await
            .unwrap();
        let market = manager.open_market(&market.id, None).await.unwrap();

        let execution = manager.place_bet(&market.id, 0, 10.0).await.unwrap();
        assert!(execution.prices[0] > 0.5 && execution.prices[1] < 0.5);
        assert!((execution.shares - 10.499).abs() < 1e-3);
        assert_eq!(execution.market.volume, 10.0);

        let stored = manager.get_market(&market.id).await.unwrap();
        assert_eq!(stored.volume, 10.0);
        assert!((stored.quantities[0] - execution.shares).abs() < 1e-12);
    }

    #[tokio::test]
    async fn bet_on_closed_market_is_illegal_state() {
        let manager = manager().await;
        activate_demo_game(&manager).await;
        let market = manager
            .create_market("GAME_DEMO", "PITCH_OUTCOME", None)
            .await
            .unwrap();
        manager.open_market(&market.id, None).await.unwrap();
        manager.close_market(&market.id).await.unwrap();

        let err = manager.place_bet(&market.id, 0, 10.0).await.unwrap_err();
        assert!(matches!(err, HubError::IllegalMarketState { .. }));
    }

    #[tokio::test]
    async fn resolution_splits_winners_and_losers() {
        let manager = manager().await;
        activate_demo_game(&manager).await;
        let market = manager
            .create_market("GAME_DEMO", "PITCH_OUTCOME", None)
            .await
            .unwrap();
        manager.open_market(&market.id, None).await.unwrap();
        manager.close_market(&market.id).await.unwrap();

        let position = |address: &str, outcome: i64, shares: f64, cost: f64| Position {
            id: Uuid::new_v4().to_string(),
            address: address.to_string(),
            market_id: market.id.clone(),
            outcome_index: outcome,
            shares,
            cost_paid: cost,
            fee_paid: 0.0,
            app_session_id: format!("sess_{address}_{outcome}"),
            app_session_version: 2,
            session_status: crate::models::SessionStatus::Open,
            mode: PositionMode::Lmsr,
            session_data: None,
            created_at: Utc::now(),
        };

        let positions = vec![
            position("0xaaa", 0, 5.0, 5.0),
            position("0xbbb", 1, 11.0, 10.0),
        ];
        let outcome = manager
            .resolve_market(&market.id, 0, &positions)
            .await
            .unwrap();
        assert_eq!(outcome.winners.len(), 1);
        assert_eq!(outcome.losers.len(), 1);
        assert_eq!(outcome.winners[0].payout, 5.0);
        assert_eq!(outcome.losers[0].loss, 10.0);
        assert_eq!(outcome.total_payout, 5.0);
    }

    #[tokio::test]
    async fn concurrent_bets_serialize_per_market() {
        let manager = Arc::new(manager().await);
        activate_demo_game(&manager).await;
        let market = manager
            .create_market("GAME_DEMO", "PITCH_OUTCOME", Some(1_000.0))
            .await
            .unwrap();
        manager.open_market(&market.id, None).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let manager = manager.clone();
            let id = market.id.clone();
            handles.push(tokio::spawn(async move {
                manager.place_bet(&id, i % 2, 25.0).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let stored = manager.get_market(&market.id).await.unwrap();
        assert_eq!(stored.volume, 200.0);
        // Final quantities must cost exactly the total spent.
        let total_cost = lmsr::cost(&stored.quantities, stored.liquidity_b).unwrap()
            - lmsr::cost(&[0.0, 0.0], stored.liquidity_b).unwrap();
        assert!((total_cost - 200.0).abs() < 1e-6, "cost drift: {total_cost}");
    }
}
