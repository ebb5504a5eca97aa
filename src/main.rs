mod api;
mod bootstrap;
mod chain;
mod config;
mod error;
mod indexer;
mod middleware;
mod offramp;
mod payout;
mod server;
mod store;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,tower_http=debug,relief_settlement=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    info!("🚀 Starting relief settlement service");

    let config = config::Config::from_env()?;

    let app = bootstrap::initialize_app_state(&config).await?;

    // Optional built-in schedule; external cron can hit /api/v1/indexer/run instead
    let _scheduler = app.scheduler.as_ref().map(|scheduler| scheduler.start());

    let router = server::create_app(app.state, config.rate_limit_per_minute);
    server::run_server(router, &config.bind_address).await?;

    info!("👋 Server stopped");
    Ok(())
}
