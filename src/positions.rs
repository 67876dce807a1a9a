//! Per-user per-market position ledger.
//!
//! Rows are appended at bet acceptance (or first P2P fill) and mutated only
//! through their session identifier. Session versions may never go
//! backwards; the guarded UPDATE returns zero rows on a regression attempt.

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

use crate::errors::{HubError, HubResult};
use crate::models::{Position, PositionMode, SessionStatus};

pub struct NewPosition {
    pub address: String,
    pub market_id: String,
    pub outcome_index: i64,
    pub shares: f64,
    pub cost_paid: f64,
    pub fee_paid: f64,
    pub app_session_id: String,
    pub app_session_version: i64,
    pub mode: PositionMode,
    pub session_data: Option<String>,
}

pub struct PositionTracker {
    pool: SqlitePool,
}

impl PositionTracker {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn add_position(&self, new: NewPosition) -> HubResult<Position> {
        let position = Position {
            id: format!("pos_{}", Uuid::new_v4().simple()),
            address: new.address,
            market_id: new.market_id,
            outcome_index: new.outcome_index,
            shares: new.shares,
            cost_paid: new.cost_paid,
            fee_paid: new.fee_paid,
            app_session_id: new.app_session_id,
            app_session_version: new.app_session_version,
            session_status: SessionStatus::Open,
            mode: new.mode,
            session_data: new.session_data,
            created_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO positions
             (id, address, market_id, outcome_index, shares, cost_paid, fee_paid,
              app_session_id, app_session_version, session_status, mode, session_data, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )
        .bind(&position.id)
        .bind(&position.address)
        .bind(&position.market_id)
        .bind(position.outcome_index)
        .bind(position.shares)
        .bind(position.cost_paid)
        .bind(position.fee_paid)
        .bind(&position.app_session_id)
        .bind(position.app_session_version)
        .bind(position.session_status.as_str())
        .bind(position.mode.as_str())
        .bind(&position.session_data)
        .bind(position.created_at)
        .execute(&self.pool)
        .await?;

        debug!(
            position_id = %position.id,
            session_id = %position.app_session_id,
            mode = position.mode.as_str(),
            "position added"
        );
        Ok(position)
    }

    pub async fn get_positions_by_user(&self, address: &str) -> HubResult<Vec<Position>> {
        let rows = sqlx::query(
            "SELECT * FROM positions WHERE address = ?1 ORDER BY created_at DESC",
        )
        .bind(address)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Position::from_row).collect()
    }

    pub async fn get_positions_by_market(&self, market_id: &str) -> HubResult<Vec<Position>> {
        let rows = sqlx::query(
            "SELECT * FROM positions WHERE market_id = ?1 ORDER BY created_at ASC",
        )
        .bind(market_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Position::from_row).collect()
    }

    pub async fn get_position_by_session(&self, session_id: &str) -> HubResult<Option<Position>> {
        let row = sqlx::query("SELECT * FROM positions WHERE app_session_id = ?1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Position::from_row(&r)).transpose()
    }

    pub async fn get_position_by_user_and_market(
        &self,
        address: &str,
        market_id: &str,
    ) -> HubResult<Vec<Position>> {
        let rows = sqlx::query(
            "SELECT * FROM positions WHERE address = ?1 AND market_id = ?2 ORDER BY created_at ASC",
        )
        .bind(address)
        .bind(market_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Position::from_row).collect()
    }

    /// Bump a session to `version`. Strictly increasing; a downgrade or
    /// same-version write fails with `SessionVersionRegression`.
    pub async fn update_app_session_version(
        &self,
        session_id: &str,
        version: i64,
    ) -> HubResult<()> {
        let result = sqlx::query(
            "UPDATE positions SET app_session_version = ?1
             WHERE app_session_id = ?2 AND app_session_version < ?1",
        )
        .bind(version)
        .bind(session_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let current = self
                .get_position_by_session(session_id)
                .await?
                .ok_or_else(|| HubError::NotFound(format!("session {session_id}")))?;
            return Err(HubError::SessionVersionRegression {
                session_id: session_id.to_string(),
                current: current.app_session_version,
                attempted: version,
            });
        }
        Ok(())
    }

    pub async fn update_session_data(&self, session_id: &str, blob: &str) -> HubResult<()> {
        let result = sqlx::query(
            "UPDATE positions SET session_data = ?1 WHERE app_session_id = ?2",
        )
        .bind(blob)
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(HubError::NotFound(format!("session {session_id}")));
        }
        Ok(())
    }

    pub async fn update_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> HubResult<()> {
        let result = sqlx::query(
            "UPDATE positions SET session_status = ?1 WHERE app_session_id = ?2",
        )
        .bind(status.as_str())
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(HubError::NotFound(format!("session {session_id}")));
        }
        Ok(())
    }

    /// Update the P2P position mirroring `session_id` with the running
    /// filled totals, or create it on the first fill.
    pub async fn upsert_p2p_fill(
        &self,
        address: &str,
        market_id: &str,
        outcome_index: i64,
        session_id: &str,
        session_version: i64,
        filled_shares: f64,
        filled_cost: f64,
    ) -> HubResult<()> {
        let existing = self.get_position_by_session(session_id).await?;
        match existing {
            Some(_) => {
                sqlx::query(
                    "UPDATE positions SET shares = ?1, cost_paid = ?2 WHERE app_session_id = ?3",
                )
                .bind(filled_shares)
                .bind(filled_cost)
                .bind(session_id)
                .execute(&self.pool)
                .await?;
            }
            None => {
                self.add_position(NewPosition {
                    address: address.to_string(),
                    market_id: market_id.to_string(),
                    outcome_index,
                    shares: filled_shares,
                    cost_paid: filled_cost,
                    fee_paid: 0.0,
                    app_session_id: session_id.to_string(),
                    app_session_version: session_version,
                    mode: PositionMode::P2p,
                    session_data: None,
                })
                .await?;
            }
        }
        Ok(())
    }

    /// True when any live position's session is still open; feeds the LP
    /// withdrawal lock.
    pub async fn any_session_open(&self) -> HubResult<bool> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM positions WHERE session_status = 'open'")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = sqlx::Row::get(&row, "n");
        Ok(n > 0)
    }

    /// Archive every position for `market_id` to the settlements log and
    /// delete the live rows. The archive write and the delete share one
    /// transaction. `winning_outcome` decides which settled positions get a
    /// payout recorded.
    pub async fn clear_positions(
        &self,
        market_id: &str,
        winning_outcome: Option<i64>,
    ) -> HubResult<u64> {
        let positions = self.get_positions_by_market(market_id).await?;
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();
        for position in &positions {
            let won = winning_outcome == Some(position.outcome_index);
            let payout = if won && position.session_status == SessionStatus::Settled {
                position.shares
            } else {
                0.0
            };
            sqlx::query(
                "INSERT INTO settlements
                 (id, market_id, address, app_session_id, mode, outcome_index, shares,
                  cost_paid, payout, archived_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )
            .bind(format!("stl_{}", Uuid::new_v4().simple()))
            .bind(&position.market_id)
            .bind(&position.address)
            .bind(&position.app_session_id)
            .bind(position.mode.as_str())
            .bind(position.outcome_index)
            .bind(position.shares)
            .bind(position.cost_paid)
            .bind(payout)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        let deleted = sqlx::query("DELETE FROM positions WHERE market_id = ?1")
            .bind(market_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        debug!(market_id, archived = positions.len(), "positions cleared");
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn tracker() -> PositionTracker {
        PositionTracker::new(db::memory_pool().await.unwrap())
    }

    fn sample(session: &str) -> NewPosition {
        NewPosition {
            address: "0xabc".to_string(),
            market_id: "mkt_1".to_string(),
            outcome_index: 0,
            shares: 10.5,
            cost_paid: 10.0,
            fee_paid: 0.2,
            app_session_id: session.to_string(),
            app_session_version: 1,
            mode: PositionMode::Lmsr,
            session_data: None,
        }
    }

    #[tokio::test]
    async fn add_and_lookup_by_every_index() {
        let tracker = tracker().await;
        tracker.add_position(sample("sess_1")).await.unwrap();

        assert_eq!(tracker.get_positions_by_user("0xabc").await.unwrap().len(), 1);
        assert_eq!(
            tracker.get_positions_by_market("mkt_1").await.unwrap().len(),
            1
        );
        assert!(tracker
            .get_position_by_session("sess_1")
            .await
            .unwrap()
            .is_some());
        assert_eq!(
            tracker
                .get_position_by_user_and_market("0xabc", "mkt_1")
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(tracker
            .get_position_by_session("sess_missing")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn session_version_never_regresses() {
        let tracker = tracker().await;
        tracker.add_position(sample("sess_1")).await.unwrap();

        tracker.update_app_session_version("sess_1", 2).await.unwrap();
        tracker.update_app_session_version("sess_1", 3).await.unwrap();

        let err = tracker
            .update_app_session_version("sess_1", 2)
            .await
            .unwrap_err();
        match err {
            HubError::SessionVersionRegression {
                current, attempted, ..
            } => {
                assert_eq!(current, 3);
                assert_eq!(attempted, 2);
            }
            other => panic!("expected regression error, got {other:?}"),
        }

        // Same-version rewrite is also a regression.
        assert!(tracker
            .update_app_session_version("sess_1", 3)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn status_and_data_updates_target_the_session() {
        let tracker = tracker().await;
        tracker.add_position(sample("sess_1")).await.unwrap();

        tracker
            .update_session_status("sess_1", SessionStatus::Settled)
            .await
            .unwrap();
        tracker
            .update_session_data("sess_1", r#"{"v":3,"mode":"lmsr"}"#)
            .await
            .unwrap();

        let position = tracker
            .get_position_by_session("sess_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(position.session_status, SessionStatus::Settled);
        assert!(position.session_data.unwrap().contains("\"v\":3"));

        assert!(matches!(
            tracker
                .update_session_status("missing", SessionStatus::Settled)
                .await
                .unwrap_err(),
            HubError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn open_session_scan_feeds_the_withdrawal_lock() {
        let tracker = tracker().await;
        assert!(!tracker.any_session_open().await.unwrap());

        tracker.add_position(sample("sess_1")).await.unwrap();
        assert!(tracker.any_session_open().await.unwrap());

        tracker
            .update_session_status("sess_1", SessionStatus::Settled)
            .await
            .unwrap();
        assert!(!tracker.any_session_open().await.unwrap());
    }

    #[tokio::test]
    async fn clear_archives_then_deletes() {
        let tracker = tracker().await;
        tracker.add_position(sample("sess_1")).await.unwrap();
        tracker.add_position(sample("sess_2")).await.unwrap();
        tracker
            .update_session_status("sess_1", SessionStatus::Settled)
            .await
            .unwrap();

        let deleted = tracker.clear_positions("mkt_1", Some(0)).await.unwrap();
        assert_eq!(deleted, 2);
        assert!(tracker
            .get_positions_by_market("mkt_1")
            .await
            .unwrap()
            .is_empty());

        let (archived,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM settlements WHERE market_id = 'mkt_1'")
                .fetch_one(&tracker.pool)
                .await
                .unwrap();
        assert_eq!(archived, 2);

        // Only the settled winner carries a payout into the archive.
        let (paid,): (f64,) = sqlx::query_as(
            "SELECT COALESCE(SUM(payout), 0) FROM settlements WHERE market_id = 'mkt_1'",
        )
        .fetch_one(&tracker.pool)
        .await
        .unwrap();
        assert!((paid - 10.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn p2p_fill_upsert_creates_then_updates() {
        let tracker = tracker().await;
        tracker
            .upsert_p2p_fill("0xabc", "mkt_1", 0, "sess_p2p", 1, 4.0, 2.4)
            .await
            .unwrap();
        let position = tracker
            .get_position_by_session("sess_p2p")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(position.mode, PositionMode::P2p);
        assert_eq!(position.shares, 4.0);

        tracker
            .upsert_p2p_fill("0xabc", "mkt_1", 0, "sess_p2p", 1, 10.0, 6.0)
            .await
            .unwrap();
        let position = tracker
            .get_position_by_session("sess_p2p")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(position.shares, 10.0);
        assert_eq!(position.cost_paid, 6.0);
    }
}
