//! Session maintenance against a Redis store.
//!
//! Run with: cargo run -p session-sweeper -- [sweep|once|list|clear <session-id>]
//!
//! Settings come from the environment (`REDIS_HOST`, `REDIS_PORT`,
//! `SESSION_MAX_AGE_HOURS`, `SWEEP_INTERVAL_SECS`, ...).

use std::sync::Arc;

use anyhow::{Context, bail};
use chatbridge_core::{BridgeConfig, KeyValueStore, SessionId};
use chatbridge_session::{KeyNamespace, SessionRegistry, SessionStateStore, storage::RedisStore};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

enum Command {
    Sweep,
    Once,
    List,
    Clear(SessionId),
}

fn parse_args(mut args: impl Iterator<Item = String>) -> anyhow::Result<Command> {
    let command = match args.next().as_deref() {
        None | Some("sweep") => Command::Sweep,
        Some("once") => Command::Once,
        Some("list") => Command::List,
        Some("clear") => {
            let id = args.next().context("clear needs a session id")?;
            Command::Clear(SessionId::new(id)?)
        }
        Some(other) => bail!("unknown command {other:?}; expected sweep, once, list or clear <id>"),
    };
    Ok(command)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let command = parse_args(std::env::args().skip(1))?;
    let config = BridgeConfig::from_env()?;

    let store = RedisStore::connect(&config.redis_url())
        .await
        .context("connecting to Redis")?;
    store.ping().await?;
    let store: Arc<dyn KeyValueStore> = Arc::new(store);
    let namespace = KeyNamespace::new(config.key_prefix.clone());
    let registry = SessionRegistry::new(Arc::clone(&store)).with_namespace(namespace.clone());

    match command {
        Command::Sweep => {
            tracing::info!(
                interval = ?config.sweep_interval,
                max_age = ?config.session_max_age,
                "Starting expiry sweeper"
            );
            let sweeper = registry.spawn_sweeper(config.sweep_interval, config.session_max_age);
            tokio::select! {
                res = sweeper => res.context("sweeper task stopped")?,
                res = tokio::signal::ctrl_c() => {
                    res?;
                    tracing::info!("Shutting down");
                }
            }
        }
        Command::Once => {
            let cleared = registry.sweep_expired(config.session_max_age).await?;
            tracing::info!(cleared, "Sweep finished");
        }
        Command::List => {
            for session in registry.list_active().await? {
                println!(
                    "{}\t{}\t{}",
                    session.session_id,
                    session.status,
                    session.last_active.to_rfc3339()
                );
            }
        }
        Command::Clear(session_id) => {
            let removed = SessionStateStore::new(store, session_id.clone())
                .with_namespace(namespace)
                .clear_session()
                .await?;
            tracing::info!(session = %session_id, removed, "Session cleared; next connect needs a fresh login");
        }
    }

    Ok(())
}
