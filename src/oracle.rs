//! Game lifecycle and oracle controls: the admin kill-switch, game
//! creation/activation, and the optional auto-play loop that cycles demo
//! markets until an admin reset stops it.

use chrono::Utc;
use serde_json::json;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db;
use crate::errors::{HubError, HubResult};
use crate::market::MarketManager;
use crate::models::{Game, GameStatus};
use crate::resolution::ResolutionPipeline;
use crate::ws::{ConnectionManager, WsKind};

/// How long an auto-played market stays open before it is closed and
/// resolved.
const AUTOPLAY_MARKET_WINDOW: Duration = Duration::from_secs(20);

pub struct GameController {
    pool: SqlitePool,
    ws: Arc<ConnectionManager>,
    autoplay: Mutex<Option<JoinHandle<()>>>,
}

impl GameController {
    pub fn new(pool: SqlitePool, ws: Arc<ConnectionManager>) -> Self {
        Self {
            pool,
            ws,
            autoplay: Mutex::new(None),
        }
    }

    pub async fn is_game_active(&self) -> HubResult<bool> {
        Ok(db::get_flag(&self.pool, "game_active", true).await?)
    }

    /// Admin kill-switch. When off, no new market may be created or opened.
    pub async fn set_game_active(&self, active: bool) -> HubResult<()> {
        db::set_flag(&self.pool, "game_active", active).await?;
        self.ws
            .broadcast(WsKind::GameState, json!({ "active": active }));
        info!(active, "game kill-switch set");
        Ok(())
    }

    pub async fn create_game(
        &self,
        sport_id: &str,
        home_team_id: &str,
        away_team_id: &str,
    ) -> HubResult<Game> {
        let game = Game {
            id: format!("game_{}", Uuid::new_v4().simple()),
            sport_id: sport_id.to_string(),
            home_team_id: home_team_id.to_string(),
            away_team_id: away_team_id.to_string(),
            status: GameStatus::Scheduled,
            created_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO games (id, sport_id, home_team_id, away_team_id, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&game.id)
        .bind(&game.sport_id)
        .bind(&game.home_team_id)
        .bind(&game.away_team_id)
        .bind(game.status.as_str())
        .bind(game.created_at)
        .execute(&self.pool)
        .await?;

        self.ws.broadcast(WsKind::GameCreated, json!(game));
        info!(game_id = %game.id, "game created");
        Ok(game)
    }

    pub async fn activate_game(&self, game_id: &str) -> HubResult<Game> {
        self.transition_game(game_id, GameStatus::Scheduled, GameStatus::Active)
            .await
    }

    pub async fn complete_game(&self, game_id: &str) -> HubResult<Game> {
        self.transition_game(game_id, GameStatus::Active, GameStatus::Completed)
            .await
    }

    async fn transition_game(
        &self,
        game_id: &str,
        from: GameStatus,
        to: GameStatus,
    ) -> HubResult<Game> {
        let result = sqlx::query("UPDATE games SET status = ?1 WHERE id = ?2 AND status = ?3")
            .bind(to.as_str())
            .bind(game_id)
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            let row = sqlx::query("SELECT * FROM games WHERE id = ?1")
                .bind(game_id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| HubError::NotFound(format!("game {game_id}")))?;
            let game = Game::from_row(&row)?;
            return Err(HubError::Validation(format!(
                "game {game_id} is {}, expected {}",
                game.status.as_str(),
                from.as_str()
            )));
        }
        let row = sqlx::query("SELECT * FROM games WHERE id = ?1")
            .bind(game_id)
            .fetch_one(&self.pool)
            .await?;
        let game = Game::from_row(&row)?;
        info!(game_id, status = game.status.as_str(), "game transition");
        Ok(game)
    }

    /// Periodically cycle markets on the demo game: create, open, hold the
    /// window, close, resolve with a random outcome. Stopped by admin reset.
    pub async fn start_autoplay(
        &self,
        markets: Arc<MarketManager>,
        pipeline: Arc<ResolutionPipeline>,
        game_id: String,
        category_id: String,
    ) {
        let mut guard = self.autoplay.lock().await;
        if guard.is_some() {
            return;
        }
        let pool = self.pool.clone();
        info!(game_id, category_id, "auto-play started");
        *guard = Some(tokio::spawn(async move {
            loop {
                if !db::get_flag(&pool, "game_active", true).await.unwrap_or(false) {
                    tokio::time::sleep(AUTOPLAY_MARKET_WINDOW).await;
                    continue;
                }
                let cycle = async {
                    let market = markets.create_market(&game_id, &category_id, None).await?;
                    markets.open_market(&market.id, None).await?;
                    tokio::time::sleep(AUTOPLAY_MARKET_WINDOW).await;
                    markets.close_market(&market.id).await?;
                    let market = markets.get_market(&market.id).await?;
                    let winning = rand::random::<usize>() % market.quantities.len();
                    pipeline.resolve(&market.id, winning).await?;
                    Ok::<(), HubError>(())
                };
                if let Err(e) = cycle.await {
                    warn!(error = %e, "auto-play cycle failed");
                    tokio::time::sleep(AUTOPLAY_MARKET_WINDOW).await;
                }
            }
        }));
    }

    pub async fn stop_autoplay(&self) {
        if let Some(handle) = self.autoplay.lock().await.take() {
            handle.abort();
            info!("auto-play stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn controller() -> GameController {
        GameController::new(
            db::memory_pool().await.unwrap(),
            Arc::new(ConnectionManager::new()),
        )
    }

    #[tokio::test]
    async fn kill_switch_round_trips_and_broadcasts() {
        let controller = controller().await;
        let (_id, mut rx) = controller.ws.add_connection(None);

        assert!(controller.is_game_active().await.unwrap());
        controller.set_game_active(false).await.unwrap();
        assert!(!controller.is_game_active().await.unwrap());

        let message = rx.recv().await.unwrap();
        assert!(message.contains("GAME_STATE"));
        assert!(message.contains("false"));
    }

    #[tokio::test]
    async fn game_lifecycle_is_gated() {
        let controller = controller().await;
        let game = controller
            .create_game("BASEBALL", "TEAM_HOME", "TEAM_AWAY")
            .await
            .unwrap();
        assert_eq!(game.status, GameStatus::Scheduled);

        // Cannot complete before activation.
        assert!(controller.complete_game(&game.id).await.is_err());

        let game = controller.activate_game(&game.id).await.unwrap();
        assert_eq!(game.status, GameStatus::Active);
        // Cannot activate twice.
        assert!(controller.activate_game(&game.id).await.is_err());

        let game = controller.complete_game(&game.id).await.unwrap();
        assert_eq!(game.status, GameStatus::Completed);

        assert!(matches!(
            controller.activate_game("game_missing").await.unwrap_err(),
            HubError::NotFound(_)
        ));
    }
}
