//! WSS Engine binary: boots the store and broker, seeds the universe on an
//! empty database, and drives the tick loop until interrupted.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wss_engine::engine::{bootstrap, heartbeat, TickEngine};
use wss_engine::webhook::HttpTransport;
use wss_engine::{Broker, EngineConfig, EngineStore};

#[derive(Debug, Parser)]
#[command(name = "wss-engine", about = "Tick engine for the market simulator")]
struct Args {
    /// SQLite database path (overrides DB_PATH).
    #[arg(long)]
    db: Option<String>,

    /// Tick period in milliseconds (overrides TICK_INTERVAL_MS).
    #[arg(long)]
    tick_ms: Option<u64>,

    /// Deterministic RNG seed (overrides RNG_SEED).
    #[arg(long)]
    seed: Option<u64>,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init_tracing();

    let args = Args::parse();
    let mut config = EngineConfig::from_env();
    if let Some(db) = args.db {
        config.db_path = db;
    }
    if let Some(tick_ms) = args.tick_ms {
        config.tick_interval_ms = tick_ms;
    }
    if let Some(seed) = args.seed {
        config.rng_seed = Some(seed);
    }

    info!(
        db = %config.db_path,
        tick_ms = config.tick_interval_ms,
        "wss-engine starting"
    );

    let store = Arc::new(EngineStore::new(&config.db_path)?);
    let broker = Arc::new(Broker::new());

    let seeded = bootstrap::seed_universe(&store)?;
    if seeded > 0 {
        info!(companies = seeded, "fresh database seeded");
    }

    let transport = Arc::new(HttpTransport::new(config.webhook_timeout_ms)?);
    let heartbeat_interval = config.heartbeat_interval_ms;
    let engine = TickEngine::new(config, store, broker.clone(), transport)
        .context("failed to initialize tick engine")?;
    let shared = engine.shared();

    let heartbeat_handle =
        heartbeat::spawn_heartbeat(broker.clone(), shared.clone(), heartbeat_interval);

    // Ctrl-C stops the loop cleanly and drops the liveness key.
    {
        let shared = shared.clone();
        let broker = broker.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
                TickEngine::stop(&shared, &broker);
            }
        });
    }

    engine.run().await?;
    heartbeat_handle.abort();
    info!("wss-engine exited");
    Ok(())
}
