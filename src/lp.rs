//! LP share accounting against the single pooled asset.
//!
//! ERC-4626-style issuance: shares represent a proportional claim on the
//! pool value observed from the settlement service. Withdrawals are locked
//! whenever any market is OPEN or any live position still has an open
//! session; the policy is re-evaluated on every attempt and stats query.

use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

use crate::errors::{HubError, HubResult};
use crate::models::{LpEvent, LpEventKind, LpShare};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositResult {
    pub shares: f64,
    pub share_price: f64,
    pub pool_value_before: f64,
    pub pool_value_after: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalResult {
    pub amount: f64,
    pub shares: f64,
    pub share_price: f64,
    pub pool_value_before: f64,
    pub pool_value_after: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub pool_value: f64,
    pub total_shares: f64,
    pub share_price: f64,
    pub lp_count: i64,
    pub can_withdraw: bool,
}

pub struct LpManager {
    pool: SqlitePool,
}

impl LpManager {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn total_shares(&self) -> HubResult<f64> {
        let row = sqlx::query("SELECT COALESCE(SUM(shares), 0.0) AS total FROM lp_shares")
            .fetch_one(&self.pool)
            .await?;
        Ok(sqlx::Row::get(&row, "total"))
    }

    pub async fn get_share(&self, address: &str) -> HubResult<Option<LpShare>> {
        let row = sqlx::query("SELECT * FROM lp_shares WHERE address = ?1")
            .bind(address)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| LpShare::from_row(&r)).transpose()
    }

    pub async fn get_events(&self, address: Option<&str>) -> HubResult<Vec<LpEvent>> {
        let rows = match address {
            Some(address) => {
                sqlx::query(
                    "SELECT * FROM lp_events WHERE address = ?1 ORDER BY created_at DESC",
                )
                .bind(address)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM lp_events ORDER BY created_at DESC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(LpEvent::from_row).collect()
    }

    /// Withdrawals are locked whenever any market is OPEN or any live
    /// position still has an open session.
    pub async fn can_withdraw(&self) -> HubResult<bool> {
        let row = sqlx::query(
            "SELECT
                (SELECT COUNT(*) FROM markets WHERE status = 'OPEN') AS open_markets,
                (SELECT COUNT(*) FROM positions WHERE session_status = 'open') AS open_sessions",
        )
        .fetch_one(&self.pool)
        .await?;
        let open_markets: i64 = sqlx::Row::get(&row, "open_markets");
        let open_sessions: i64 = sqlx::Row::get(&row, "open_sessions");
        Ok(open_markets == 0 && open_sessions == 0)
    }

    /// Issue shares for a deposit. `pool_value` is the settlement-service
    /// balance observed before the deposit arrived.
    pub async fn deposit(
        &self,
        address: &str,
        amount: f64,
        pool_value: f64,
    ) -> HubResult<DepositResult> {
        if !(amount.is_finite() && amount > 0.0) {
            return Err(HubError::Validation(format!(
                "deposit amount must be positive, got {amount}"
            )));
        }

        let total_shares = self.total_shares().await?;
        let share_price = if total_shares <= 0.0 || pool_value <= 0.0 {
            1.0
        } else {
            pool_value / total_shares
        };
        let issued = amount / share_price;
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO lp_shares
             (address, shares, total_deposited, total_withdrawn, first_deposit_at, last_action_at)
             VALUES (?1, ?2, ?3, 0, ?4, ?4)
             ON CONFLICT (address) DO UPDATE SET
                shares = lp_shares.shares + excluded.shares,
                total_deposited = lp_shares.total_deposited + excluded.total_deposited,
                last_action_at = excluded.last_action_at",
        )
        .bind(address)
        .bind(issued)
        .bind(amount)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        self.record_event(
            &mut tx,
            address,
            LpEventKind::Deposit,
            amount,
            issued,
            share_price,
            pool_value,
            pool_value + amount,
        )
        .await?;
        tx.commit().await?;

        info!(address, amount, issued, share_price, "LP deposit");
        Ok(DepositResult {
            shares: issued,
            share_price,
            pool_value_before: pool_value,
            pool_value_after: pool_value + amount,
        })
    }

    /// Redeem `shares` at the current share price. Fails when locked or when
    /// the LP holds fewer shares than requested.
    pub async fn withdraw(
        &self,
        address: &str,
        shares: f64,
        pool_value: f64,
    ) -> HubResult<WithdrawalResult> {
        if !(shares.is_finite() && shares > 0.0) {
            return Err(HubError::Validation(format!(
                "withdrawal shares must be positive, got {shares}"
            )));
        }
        if !self.can_withdraw().await? {
            return Err(HubError::WithdrawalsLocked);
        }

        let held = self
            .get_share(address)
            .await?
            .map(|share| share.shares)
            .unwrap_or(0.0);
        if shares > held + 1e-9 {
            return Err(HubError::InsufficientShares {
                requested: shares,
                held,
            });
        }

        let total_shares = self.total_shares().await?;
        if total_shares <= 0.0 {
            return Err(HubError::InsufficientShares {
                requested: shares,
                held: 0.0,
            });
        }
        let share_price = pool_value / total_shares;
        let amount_out = shares * share_price;
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE lp_shares SET
                shares = shares - ?1,
                total_withdrawn = total_withdrawn + ?2,
                last_action_at = ?3
             WHERE address = ?4",
        )
        .bind(shares)
        .bind(amount_out)
        .bind(now)
        .bind(address)
        .execute(&mut *tx)
        .await?;

        self.record_event(
            &mut tx,
            address,
            LpEventKind::Withdrawal,
            amount_out,
            shares,
            share_price,
            pool_value,
            pool_value - amount_out,
        )
        .await?;
        tx.commit().await?;

        info!(address, shares, amount_out, share_price, "LP withdrawal");
        Ok(WithdrawalResult {
            amount: amount_out,
            shares,
            share_price,
            pool_value_before: pool_value,
            pool_value_after: pool_value - amount_out,
        })
    }

    pub async fn pool_stats(&self, pool_value: f64) -> HubResult<PoolStats> {
        let total_shares = self.total_shares().await?;
        let row = sqlx::query("SELECT COUNT(*) AS n FROM lp_shares WHERE shares > 0")
            .fetch_one(&self.pool)
            .await?;
        let lp_count: i64 = sqlx::Row::get(&row, "n");
        let share_price = if total_shares <= 0.0 {
            1.0
        } else {
            pool_value / total_shares
        };
        Ok(PoolStats {
            pool_value,
            total_shares,
            share_price,
            lp_count,
            can_withdraw: self.can_withdraw().await?,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_event(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        address: &str,
        kind: LpEventKind,
        amount: f64,
        shares: f64,
        share_price: f64,
        pool_value_before: f64,
        pool_value_after: f64,
    ) -> HubResult<()> {
        sqlx::query(
            "INSERT INTO lp_events
             (id, address, kind, amount, shares, share_price, pool_value_before,
              pool_value_after, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(format!("lpe_{}", Uuid::new_v4().simple()))
        .bind(address)
        .bind(kind.as_str())
        .bind(amount)
        .bind(shares)
        .bind(share_price)
        .bind(pool_value_before)
        .bind(pool_value_after)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn manager() -> LpManager {
        LpManager::new(db::memory_pool().await.unwrap())
    }

    async fn open_a_market(manager: &LpManager) {
        sqlx::query(
            "INSERT INTO markets (id, game_id, category_id, status, quantities, liquidity_b, volume, created_at, updated_at)
             VALUES ('m1', 'GAME_DEMO', 'PITCH_OUTCOME', 'OPEN', '[0.0,0.0]', 100.0, 0, ?1, ?1)",
        )
        .bind(Utc::now())
        .execute(&manager.pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn first_deposit_issues_at_price_one() {
        let manager = manager().await;
        let result = manager.deposit("0xa", 1000.0, 0.0).await.unwrap();
        assert_eq!(result.share_price, 1.0);
        assert_eq!(result.shares, 1000.0);
        assert_eq!(result.pool_value_after, 1000.0);

        let share = manager.get_share("0xa").await.unwrap().unwrap();
        assert_eq!(share.shares, 1000.0);
        assert_eq!(share.total_deposited, 1000.0);
    }

    #[tokio::test]
    async fn later_deposits_are_proportional() {
        let manager = manager().await;
        manager.deposit("0xa", 1000.0, 0.0).await.unwrap();

        // Pool value has grown to 1500 independently of deposits.
        let result = manager.deposit("0xb", 500.0, 1500.0).await.unwrap();
        assert!((result.share_price - 1.5).abs() < 1e-12);
        assert!((result.shares - 500.0 * 1000.0 / 1500.0).abs() < 1e-9);

        let total = manager.total_shares().await.unwrap();
        assert!((total - 1333.3333333).abs() < 1e-6);
    }

    #[tokio::test]
    async fn withdrawal_requires_sufficient_shares() {
        let manager = manager().await;
        manager.deposit("0xa", 100.0, 0.0).await.unwrap();

        let err = manager.withdraw("0xa", 200.0, 100.0).await.unwrap_err();
        assert!(matches!(err, HubError::InsufficientShares { .. }));

        let result = manager.withdraw("0xa", 40.0, 100.0).await.unwrap();
        assert!((result.amount - 40.0).abs() < 1e-9);
        let share = manager.get_share("0xa").await.unwrap().unwrap();
        assert!((share.shares - 60.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn open_market_locks_withdrawals() {
        let manager = manager().await;
        manager.deposit("0xa", 1000.0, 0.0).await.unwrap();
        open_a_market(&manager).await;

        assert!(!manager.can_withdraw().await.unwrap());
        let err = manager.withdraw("0xa", 100.0, 1000.0).await.unwrap_err();
        assert!(matches!(err, HubError::WithdrawalsLocked));

        let stats = manager.pool_stats(1000.0).await.unwrap();
        assert!(!stats.can_withdraw);

        sqlx::query("UPDATE markets SET status = 'RESOLVED' WHERE id = 'm1'")
            .execute(&manager.pool)
            .await
            .unwrap();
        assert!(manager.can_withdraw().await.unwrap());
        manager.withdraw("0xa", 100.0, 1000.0).await.unwrap();
    }

    #[tokio::test]
    async fn open_position_session_locks_withdrawals() {
        let manager = manager().await;
        manager.deposit("0xa", 1000.0, 0.0).await.unwrap();
        sqlx::query(
            "INSERT INTO positions
             (id, address, market_id, outcome_index, shares, cost_paid, fee_paid, app_session_id,
              app_session_version, session_status, mode, created_at)
             VALUES ('p1', '0xu', 'm1', 0, 1.0, 1.0, 0, 'sess', 1, 'open', 'lmsr', ?1)",
        )
        .bind(Utc::now())
        .execute(&manager.pool)
        .await
        .unwrap();

        assert!(!manager.can_withdraw().await.unwrap());
        sqlx::query("UPDATE positions SET session_status = 'settled'")
            .execute(&manager.pool)
            .await
            .unwrap();
        assert!(manager.can_withdraw().await.unwrap());
    }

    #[tokio::test]
    async fn event_log_reconstructs_held_shares() {
        let manager = manager().await;
        manager.deposit("0xa", 1000.0, 0.0).await.unwrap();
        manager.deposit("0xa", 500.0, 1000.0).await.unwrap();
        manager.withdraw("0xa", 300.0, 1500.0).await.unwrap();

        let events = manager.get_events(Some("0xa")).await.unwrap();
        assert_eq!(events.len(), 3);

        let net: f64 = events
            .iter()
            .map(|event| match event.kind {
                LpEventKind::Deposit => event.shares,
                LpEventKind::Withdrawal => -event.shares,
            })
            .sum();
        let held = manager.get_share("0xa").await.unwrap().unwrap().shares;
        assert!((net - held).abs() < 1e-9);
    }

    #[tokio::test]
    async fn stats_default_share_price_is_one() {
        let manager = manager().await;
        let stats = manager.pool_stats(0.0).await.unwrap();
        assert_eq!(stats.total_shares, 0.0);
        assert_eq!(stats.share_price, 1.0);
        assert_eq!(stats.lp_count, 0);
        assert!(stats.can_withdraw);
    }
}
