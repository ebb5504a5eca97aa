use std::{sync::Arc, time::Duration};

use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::{info, warn};

use crate::{
    api::handler::AppState,
    chain::{JsonRpcLedgerClient, LedgerClient},
    config::{Config, OfframpBackend, StoreBackend},
    error::{AppError, AppResult},
    indexer::{ChainIndexer, IndexerScheduler},
    offramp::{HttpOfframpAdapter, MockOfframpAdapter, OfframpAdapter},
    payout::PayoutEngine,
    store::{InMemorySettlementStore, PgSettlementStore, SettlementStore},
};

/// Everything `main` needs: router state plus the optional background schedule
pub struct App {
    pub state: AppState,
    pub scheduler: Option<IndexerScheduler>,
}

pub async fn initialize_app_state(config: &Config) -> AppResult<App> {
    info!("Initializing application components ...");

    let store = initialize_store(config).await?;

    let ledger: Arc<dyn LedgerClient> =
        Arc::new(JsonRpcLedgerClient::new(&config.rpc_url, config.ledger_timeout())?);
    info!("✅ Ledger client initialized: {}", config.rpc_url);

    let indexer_config = config.indexer_config()?;
    for (name, address) in [
        ("DonationVault", indexer_config.contracts.donation_vault),
        ("AllocationRegistry", indexer_config.contracts.allocation_registry),
        ("PayoutReceipt", indexer_config.contracts.payout_receipt),
    ] {
        if address.is_zero() {
            warn!("⚠️  {} address not set - stream disabled", name);
        } else {
            info!("   {} at {:#x}", name, address);
        }
    }
    let indexer = Arc::new(ChainIndexer::new(store.clone(), ledger, indexer_config));
    info!("✅ Chain indexer initialized (chunk {} blocks)", config.block_chunk);

    let offramp = initialize_offramp(config)?;
    let payout_engine = Arc::new(PayoutEngine::new(
        store.clone(),
        offramp.clone(),
        config.offramp_timeout(),
    ));
    info!("✅ Payout engine initialized with {} off-ramp", offramp.name());

    let api_key = config.cron_api_key.as_deref().map(Arc::from);
    if api_key.is_none() {
        warn!("⚠️  CRON_API_KEY not set - trigger and write endpoints are unauthenticated");
    }

    let scheduler = (config.indexer_poll_secs > 0).then(|| {
        IndexerScheduler::new(
            indexer.clone(),
            Duration::from_secs(config.indexer_poll_secs),
        )
    });

    Ok(App {
        state: AppState {
            store,
            indexer,
            payout_engine,
            offramp,
            api_key,
        },
        scheduler,
    })
}

async fn initialize_store(config: &Config) -> AppResult<Arc<dyn SettlementStore>> {
    match config.store_backend {
        StoreBackend::Memory => {
            warn!("⚠️  Using in-memory settlement store - state is lost on restart");
            Ok(Arc::new(InMemorySettlementStore::new()))
        }
        StoreBackend::Postgres => {
            let database_url = config
                .database_url
                .as_deref()
                .ok_or_else(|| AppError::Config("DATABASE_URL must be set".to_string()))?;
            let pool = initialize_database(database_url).await?;
            Ok(Arc::new(PgSettlementStore::new(pool)))
        }
    }
}

fn initialize_offramp(config: &Config) -> AppResult<Arc<dyn OfframpAdapter>> {
    match config.offramp_backend {
        OfframpBackend::Mock => Ok(Arc::new(MockOfframpAdapter::new(Duration::from_millis(
            config.mock_offramp_latency_ms,
        )))),
        OfframpBackend::Http => {
            let base_url = config.offramp_base_url.as_deref().ok_or_else(|| {
                AppError::Config("OFFRAMP_BASE_URL must be set for the http off-ramp".to_string())
            })?;
            let api_key = config.offramp_api_key.as_deref().ok_or_else(|| {
                AppError::Config("OFFRAMP_API_KEY must be set for the http off-ramp".to_string())
            })?;
            Ok(Arc::new(HttpOfframpAdapter::new(
                base_url,
                api_key,
                config.offramp_timeout(),
            )?))
        }
    }
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!("✓ Database pool configured: 20 max connections");

    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
