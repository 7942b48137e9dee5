//! Code Vault server
//!
//! ```text
//! ┌──────────┐    ┌────────────┐    ┌──────────────┐
//! │ HTTP API │───▶│ ShopEngine │───▶│ ResourceStore│  (PostgreSQL | memory)
//! └──────────┘    └─────┬──────┘    └──────────────┘
//!                       │
//!          ┌────────────┼─────────────┐
//!          ▼            ▼             ▼
//!      Pollers       Sweeper    Notification
//!   (per record)   (periodic)    channels
//! ```
//!
//! Usage: `codevault [--env dev] [--port 8080]`

use anyhow::Context;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use codevault::api::{self, AppState};
use codevault::config::AppConfig;
use codevault::db::Database;
use codevault::engine::ShopEngine;
use codevault::notify::NotificationDispatcher;
use codevault::payment::{HttpGateway, PaymentGateway};
use codevault::store::{MemoryStore, PgStore, ResourceStore, schema};

/// Pool size for the PostgreSQL store
const PG_MAX_CONNECTIONS: u32 = 16;

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

/// Port override from the command line (`--port`)
fn get_port_override() -> Option<u16> {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if args[i] == "--port" && i + 1 < args.len() {
            return args[i + 1].parse().ok();
        }
    }
    None
}

fn build_gateway(config: &AppConfig) -> anyhow::Result<Arc<dyn PaymentGateway>> {
    match config.payment.provider.as_str() {
        #[cfg(feature = "mock-gateway")]
        "mock" => {
            warn!("Using the in-process mock payment gateway");
            Ok(Arc::new(codevault::payment::MockGateway::new()))
        }
        "http" => Ok(Arc::new(
            HttpGateway::new(&config.payment).context("build payment gateway client")?,
        )),
        other => anyhow::bail!("payment provider {:?} not available in this build", other),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let mut config = AppConfig::load(&env).with_context(|| format!("load config for env {}", env))?;
    if let Some(port) = get_port_override() {
        config.api.port = port;
    }
    let _log_guard = codevault::logging::init_logging(&config).context("init logging")?;
    info!(
        env = %env,
        version = env!("CARGO_PKG_VERSION"),
        git = env!("GIT_HASH"),
        "Starting Code Vault"
    );

    let (store, db): (Arc<dyn ResourceStore>, Option<Arc<Database>>) = match &config.postgres_url {
        Some(url) => {
            let db = Arc::new(
                Database::connect(url, PG_MAX_CONNECTIONS)
                    .await
                    .context("connect to PostgreSQL")?,
            );
            schema::ensure_schema(db.pool())
                .await
                .context("bootstrap schema")?;
            let store: Arc<dyn ResourceStore> = Arc::new(PgStore::new(db.pool().clone()));
            (store, Some(db))
        }
        None => {
            warn!("No postgres_url configured, using the in-memory store");
            let store: Arc<dyn ResourceStore> = Arc::new(MemoryStore::new());
            (store, None)
        }
    };
    info!(store = store.name(), "Resource store ready");

    let gateway = build_gateway(&config)?;
    let notifier =
        Arc::new(NotificationDispatcher::from_config(&config.notify).context("notify channels")?);
    info!(
        gateway = gateway.name(),
        channels = notifier.channel_count(),
        "Collaborators ready"
    );

    let engine = Arc::new(ShopEngine::new(
        store,
        gateway,
        notifier,
        config.engine.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweeper = Arc::new(engine.sweeper());
    let sweep_task = {
        let sweeper = sweeper.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { sweeper.run(shutdown).await })
    };

    let state = Arc::new(AppState::new(
        engine.clone(),
        config.api.admin_token.clone(),
        db,
    ));
    let api_config = config.api.clone();
    let api_shutdown = shutdown_rx.clone();
    let mut api_task =
        tokio::spawn(async move { api::serve(&api_config, state, api_shutdown).await });

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "Failed to listen for ctrl-c");
            }
            info!("Shutdown requested");
        }
        result = &mut api_task => {
            match result {
                Ok(Ok(())) => info!("API server exited"),
                Ok(Err(e)) => warn!(error = %e, "API server failed"),
                Err(e) => warn!(error = %e, "API task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);
    engine.shutdown();
    if let Err(e) = sweep_task.await {
        warn!(error = %e, "Sweeper task ended abnormally");
    }
    if !api_task.is_finished()
        && let Ok(Err(e)) = api_task.await
    {
        warn!(error = %e, "API server failed during shutdown");
    }
    info!("Bye");
    Ok(())
}
