//! Worklane daemon - HTTP surface for the lifecycle engine.
//!
//! Wires a ledger backend and an escrow gateway into the contract and
//! milestone engines, then serves the REST API plus the inbound escrow
//! webhook.

use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use worklane_engine::{ContractEngine, EscrowReconciler, MilestoneEngine};
use worklane_escrow::{EscrowGateway, HttpEscrowGateway, HttpGatewayConfig, MockEscrowGateway};
use worklane_storage::{memory::InMemoryLedger, postgres::PgLedger, LedgerStore};

mod config;
mod error;
mod routes;

use config::{EscrowConfig, ServiceConfig, StorageConfig};
use routes::AppState;

/// Worklane daemon CLI.
#[derive(Parser)]
#[command(name = "worklaned")]
#[command(about = "Worklane - contract and milestone lifecycle service", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path (JSON).
    #[arg(short, long, env = "WORKLANE_CONFIG")]
    config: Option<String>,

    /// Listen address, overrides the config file.
    #[arg(short, long, env = "WORKLANE_LISTEN_ADDR")]
    listen: Option<String>,

    /// PostgreSQL URL; selects the postgres ledger when set.
    #[arg(long, env = "WORKLANE_DATABASE_URL")]
    database_url: Option<String>,

    /// Escrow gateway base URL; selects the HTTP gateway when set.
    #[arg(long, env = "WORKLANE_GATEWAY_URL")]
    gateway_url: Option<String>,

    /// Escrow gateway API key.
    #[arg(long, env = "WORKLANE_GATEWAY_KEY", default_value = "")]
    gateway_key: String,

    /// Log level.
    #[arg(long, env = "WORKLANE_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Enable JSON logging.
    #[arg(long, env = "WORKLANE_LOG_JSON")]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| cli.log_level.clone().into());
    if cli.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let mut config = ServiceConfig::load(cli.config.as_deref())?;
    if let Some(listen) = &cli.listen {
        config.server.listen_addr = listen.parse()?;
    }
    if let Some(url) = &cli.database_url {
        config.storage = StorageConfig::Postgres {
            url: url.clone(),
            max_connections: 10,
            connect_timeout_secs: 5,
        };
    }
    if let Some(url) = &cli.gateway_url {
        config.escrow = EscrowConfig::Http {
            base_url: url.clone(),
            api_key: cli.gateway_key.clone(),
            request_timeout_secs: 10,
            max_retries: 2,
        };
    }

    let store: Arc<dyn LedgerStore> = match &config.storage {
        StorageConfig::Memory => {
            info!("using in-memory ledger");
            Arc::new(InMemoryLedger::new())
        }
        StorageConfig::Postgres {
            url,
            max_connections,
            connect_timeout_secs,
        } => {
            info!("connecting postgres ledger");
            Arc::new(
                PgLedger::connect_with_options(url, *max_connections, *connect_timeout_secs)
                    .await
                    .map_err(|e| anyhow::anyhow!("ledger init failed: {e}"))?,
            )
        }
    };

    let gateway: Arc<dyn EscrowGateway> = match &config.escrow {
        EscrowConfig::Mock => {
            info!("using mock escrow gateway");
            Arc::new(MockEscrowGateway::new())
        }
        EscrowConfig::Http {
            base_url,
            api_key,
            request_timeout_secs,
            max_retries,
        } => Arc::new(
            HttpEscrowGateway::new(HttpGatewayConfig {
                base_url: base_url.clone(),
                api_key: api_key.clone(),
                request_timeout: std::time::Duration::from_secs(*request_timeout_secs),
                max_retries: *max_retries,
                retry_backoff: std::time::Duration::from_millis(250),
            })
            .map_err(|e| anyhow::anyhow!("gateway init failed: {e}"))?,
        ),
    };

    let state = AppState {
        contracts: Arc::new(ContractEngine::new(store.clone())),
        milestones: Arc::new(MilestoneEngine::new(store.clone())),
        escrow: Arc::new(EscrowReconciler::new(
            store.clone(),
            gateway,
            config.currency.clone(),
        )),
        store,
    };
    let router = routes::router(state, config.server.enable_cors);

    let listener = tokio::net::TcpListener::bind(config.server.listen_addr).await?;
    info!(addr = %config.server.listen_addr, "worklaned listening");
    axum::serve(listener, router).await?;
    Ok(())
}
