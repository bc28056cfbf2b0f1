use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rebecca_core::{
    ChatBackend, ConversationStore, MemoryStore, OllamaChatClient, PgStore, RebeccaConfig,
    RebeccaError, SessionGate, UserStore,
};
use sqlx::PgPool;
use tokio::sync::broadcast;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing_subscriber::{fmt, EnvFilter};

use rebecca_server::http::{self, HttpState};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "rebecca.toml")]
    config: String,

    /// Check database connectivity and exit.
    #[arg(long)]
    health: bool,

    /// Keep users and conversations in memory instead of PostgreSQL.
    #[arg(long)]
    ephemeral: bool,
}

async fn connect_with_retry(config: &RebeccaConfig) -> Result<PgPool, RebeccaError> {
    let attempts = config.database.connect_retries.max(1);
    let strategy = ExponentialBackoff::from_millis(250)
        .max_delay(Duration::from_secs(5))
        .map(jitter)
        .take(attempts - 1);

    Retry::spawn(strategy, || async {
        rebecca_core::db::create_pool(&config.database)
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "Database connection attempt failed");
                e
            })
    })
    .await
    .map_err(RebeccaError::from)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience, production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let config = match RebeccaConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.service.log_level)),
        )
        .init();

    let (users, turns, pool): (Arc<dyn UserStore>, Arc<dyn ConversationStore>, Option<PgPool>) =
        if args.ephemeral {
            tracing::warn!("Running with in-memory storage; nothing survives a restart");
            let store = Arc::new(MemoryStore::new());
            (store.clone(), store, None)
        } else {
            let pool = match connect_with_retry(&config).await {
                Ok(p) => p,
                Err(e) => {
                    eprintln!("Failed to connect to database: {}", e);
                    std::process::exit(1);
                }
            };

            if args.health {
                match rebecca_core::db::health_check(&pool).await {
                    Ok(v) => println!("✅ PostgreSQL connected: {}", v),
                    Err(e) => {
                        println!("❌ PostgreSQL connection failed: {}", e);
                        std::process::exit(1);
                    }
                }
                return Ok(());
            }

            rebecca_core::db::run_migrations(&pool)
                .await
                .map_err(RebeccaError::from)?;
            tracing::info!("Database migrations applied");

            let store = Arc::new(PgStore::new(pool.clone()));
            (store.clone(), store, Some(pool))
        };

    if args.health {
        println!("✅ In-memory storage, nothing to check");
        return Ok(());
    }

    let gate = SessionGate::from_config(&config.auth)?;
    let backend: Arc<dyn ChatBackend> = Arc::new(OllamaChatClient::new(&config.model)?);
    tracing::info!(
        base_url = %config.model.base_url,
        model = %config.model.model,
        history_limit = config.chat.history_limit,
        "Model backend configured"
    );

    let state = HttpState::new(&config, users, turns, backend, gate, pool);

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    http::start_http_server(state, &config, tx.subscribe()).await?;

    Ok(())
}
