use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

use pitchside::api::{self, AppState};
use pitchside::config::{HubConfig, Settings};
use pitchside::db;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!("⚾ Starting Pitchside hub...");

    let config = HubConfig::from_env();
    let settings = Settings::from_env();
    let pool = db::create_pool(&config.db_path).await?;
    let state = AppState::new(pool, &config, settings);

    // Optional demo loop: activate the seeded game and cycle markets on it.
    if std::env::var("AUTOPLAY").map(|v| v == "1" || v == "true").unwrap_or(false) {
        if let Err(e) = state.oracle.activate_game("GAME_DEMO").await {
            tracing::warn!(error = %e, "demo game activation skipped");
        }
        state
            .oracle
            .start_autoplay(
                state.markets.clone(),
                state.pipeline.clone(),
                "GAME_DEMO".to_string(),
                "PITCH_OUTCOME".to_string(),
            )
            .await;
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    println!("🚀 Hub listening on http://{addr}");
    println!("   POST /api/bet                     - place an LMSR bet");
    println!("   POST /api/orderbook/order         - place a P2P limit order");
    println!("   GET  /api/market                  - current market and prices");
    println!("   POST /api/oracle/outcome          - resolve the current market");
    println!("   GET  /api/lp/stats                - LP pool stats");
    println!("   GET  /ws?address=0x…              - real-time updates");

    let app = api::router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
