//! Database bootstrap: SQLite pool, schema, seed data, admin reset.

use anyhow::Result;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Open (creating if missing) the SQLite database at `db_path` and make sure
/// the schema exists.
pub async fn create_pool(db_path: &str) -> Result<SqlitePool> {
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{db_path}"))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    migrate(&pool).await?;
    info!(db_path, "database ready");
    Ok(pool)
}

/// In-memory pool for tests. Single connection so every query sees the same
/// memory database.
pub async fn memory_pool() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    migrate(&pool).await?;
    Ok(pool)
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS sports (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS teams (
        id TEXT PRIMARY KEY,
        sport_id TEXT NOT NULL,
        code TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS market_categories (
        id TEXT PRIMARY KEY,
        sport_id TEXT NOT NULL,
        outcomes TEXT NOT NULL,
        description TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS games (
        id TEXT PRIMARY KEY,
        sport_id TEXT NOT NULL,
        home_team_id TEXT NOT NULL,
        away_team_id TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'SCHEDULED',
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS markets (
        id TEXT PRIMARY KEY,
        game_id TEXT NOT NULL,
        category_id TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'PENDING',
        resolved_outcome INTEGER,
        quantities TEXT NOT NULL,
        liquidity_b REAL NOT NULL,
        volume REAL NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_markets_pair ON markets (game_id, category_id, status)",
    "CREATE TABLE IF NOT EXISTS positions (
        id TEXT PRIMARY KEY,
        address TEXT NOT NULL,
        market_id TEXT NOT NULL,
        outcome_index INTEGER NOT NULL,
        shares REAL NOT NULL,
        cost_paid REAL NOT NULL,
        fee_paid REAL NOT NULL DEFAULT 0,
        app_session_id TEXT NOT NULL UNIQUE,
        app_session_version INTEGER NOT NULL,
        session_status TEXT NOT NULL DEFAULT 'open',
        mode TEXT NOT NULL,
        session_data TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_positions_address ON positions (address)",
    "CREATE INDEX IF NOT EXISTS idx_positions_market ON positions (market_id)",
    "CREATE TABLE IF NOT EXISTS p2p_orders (
        id TEXT PRIMARY KEY,
        market_id TEXT NOT NULL,
        user_address TEXT NOT NULL,
        outcome_index INTEGER NOT NULL,
        mcps REAL NOT NULL,
        amount REAL NOT NULL,
        filled_amount REAL NOT NULL DEFAULT 0,
        unfilled_amount REAL NOT NULL,
        max_shares REAL NOT NULL,
        filled_shares REAL NOT NULL DEFAULT 0,
        unfilled_shares REAL NOT NULL,
        app_session_id TEXT NOT NULL,
        app_session_version INTEGER NOT NULL,
        status TEXT NOT NULL DEFAULT 'OPEN',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_orders_market ON p2p_orders (market_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_orders_user ON p2p_orders (user_address)",
    "CREATE TABLE IF NOT EXISTS p2p_fills (
        id TEXT PRIMARY KEY,
        market_id TEXT NOT NULL,
        taker_order_id TEXT NOT NULL,
        maker_order_id TEXT NOT NULL,
        shares REAL NOT NULL,
        price REAL NOT NULL,
        cost REAL NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS lp_shares (
        address TEXT PRIMARY KEY,
        shares REAL NOT NULL DEFAULT 0,
        total_deposited REAL NOT NULL DEFAULT 0,
        total_withdrawn REAL NOT NULL DEFAULT 0,
        first_deposit_at TEXT NOT NULL,
        last_action_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS lp_events (
        id TEXT PRIMARY KEY,
        address TEXT NOT NULL,
        kind TEXT NOT NULL,
        amount REAL NOT NULL,
        shares REAL NOT NULL,
        share_price REAL NOT NULL,
        pool_value_before REAL NOT NULL,
        pool_value_after REAL NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS settlements (
        id TEXT PRIMARY KEY,
        market_id TEXT NOT NULL,
        address TEXT NOT NULL,
        app_session_id TEXT NOT NULL,
        mode TEXT NOT NULL,
        outcome_index INTEGER NOT NULL,
        shares REAL NOT NULL,
        cost_paid REAL NOT NULL,
        payout REAL NOT NULL,
        archived_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS hub_state (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
];

async fn migrate(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    seed_defaults(pool).await?;
    Ok(())
}

/// Static reference data plus one demo game, inserted only when absent so a
/// fresh hub can serve the demo flow end to end.
pub async fn seed_defaults(pool: &SqlitePool) -> Result<()> {
    let now = Utc::now();

    sqlx::query("INSERT OR IGNORE INTO sports (id, name) VALUES (?1, ?2)")
        .bind("BASEBALL")
        .bind("Baseball")
        .execute(pool)
        .await?;

    for (id, code) in [("TEAM_HOME", "HME"), ("TEAM_AWAY", "AWY")] {
        sqlx::query("INSERT OR IGNORE INTO teams (id, sport_id, code) VALUES (?1, ?2, ?3)")
            .bind(id)
            .bind("BASEBALL")
            .bind(code)
            .execute(pool)
            .await?;
    }

    sqlx::query(
        "INSERT OR IGNORE INTO market_categories (id, sport_id, outcomes, description)
         VALUES (?1, ?2, ?3, ?4)",
    )
    .bind("PITCH_OUTCOME")
    .bind("BASEBALL")
    .bind(r#"["BALL","STRIKE"]"#)
    .bind("Will the next pitch be called a ball or a strike?")
    .execute(pool)
    .await?;

    sqlx::query(
        "INSERT OR IGNORE INTO games (id, sport_id, home_team_id, away_team_id, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )
    .bind("GAME_DEMO")
    .bind("BASEBALL")
    .bind("TEAM_HOME")
    .bind("TEAM_AWAY")
    .bind("SCHEDULED")
    .bind(now)
    .execute(pool)
    .await?;

    sqlx::query("INSERT OR IGNORE INTO hub_state (key, value) VALUES ('game_active', 'true')")
        .execute(pool)
        .await?;

    Ok(())
}

/// Admin reset: truncate every data table and re-seed the defaults.
pub async fn reset(pool: &SqlitePool) -> Result<()> {
    let mut tx = pool.begin().await?;
    for table in [
        "markets",
        "positions",
        "p2p_orders",
        "p2p_fills",
        "lp_shares",
        "lp_events",
        "settlements",
        "games",
        "teams",
        "market_categories",
        "sports",
        "hub_state",
    ] {
        sqlx::query(&format!("DELETE FROM {table}"))
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    seed_defaults(pool).await?;
    info!("database reset to seed state");
    Ok(())
}

/// Singleton boolean flags stored in hub_state.
pub async fn get_flag(pool: &SqlitePool, key: &str, default: bool) -> Result<bool> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM hub_state WHERE key = ?1")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|(v,)| v == "true").unwrap_or(default))
}

pub async fn set_flag(pool: &SqlitePool, key: &str, value: bool) -> Result<()> {
    sqlx::query(
        "INSERT INTO hub_state (key, value) VALUES (?1, ?2)
         ON CONFLICT (key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(if value { "true" } else { "false" })
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_and_seed_come_up_on_a_fresh_database() {
        let pool = memory_pool().await.unwrap();

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM market_categories")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);

        assert!(get_flag(&pool, "game_active", false).await.unwrap());
    }

    #[tokio::test]
    async fn reset_truncates_and_reseeds() {
        let pool = memory_pool().await.unwrap();
        sqlx::query(
            "INSERT INTO markets (id, game_id, category_id, status, quantities, liquidity_b, volume, created_at, updated_at)
             VALUES ('m1', 'GAME_DEMO', 'PITCH_OUTCOME', 'PENDING', '[0.0,0.0]', 100.0, 0, ?1, ?1)",
        )
        .bind(Utc::now())
        .execute(&pool)
        .await
        .unwrap();

        reset(&pool).await.unwrap();

        let (markets,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM markets")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(markets, 0);
        let (games,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM games")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(games, 1);
    }

    #[tokio::test]
    async fn flags_round_trip() {
        let pool = memory_pool().await.unwrap();
        set_flag(&pool, "game_active", false).await.unwrap();
        assert!(!get_flag(&pool, "game_active", true).await.unwrap());
        set_flag(&pool, "game_active", true).await.unwrap();
        assert!(get_flag(&pool, "game_active", false).await.unwrap());
    }
}
