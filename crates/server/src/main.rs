use std::time::Duration;

use anyhow::Result;
use loanflow_core::config::{AppConfig, LoadOptions};
use loanflow_server::bootstrap::{self, Application};
use loanflow_server::health::{self, HealthState};
use tokio::task::JoinHandle;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

fn init_logging(config: &AppConfig) {
    use loanflow_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;

    health::spawn(
        &app.config.server.bind_address,
        app.config.server.health_check_port,
        HealthState {
            store: app.store.clone(),
            api: app.api.clone(),
            sessions: app.sessions.clone(),
        },
    )
    .await?;

    let cleanup = spawn_session_cleanup(&app);

    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        backend = app.store.backend(),
        master_agent = app.master.agent_id(),
        "loanflow-server started"
    );
    wait_for_shutdown().await?;
    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        "loanflow-server stopping"
    );

    cleanup.abort();
    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    if tokio::time::timeout(grace, cleanup).await.is_err() {
        tracing::warn!(
            event_name = "system.server.shutdown_timeout",
            correlation_id = "shutdown",
            grace_secs = grace.as_secs(),
            "background tasks did not stop within the grace period"
        );
    }

    Ok(())
}

/// Periodically evicts idle sessions from the in-memory index. Stored copies stay.
fn spawn_session_cleanup(app: &Application) -> JoinHandle<()> {
    let sessions = app.sessions.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let expired = sessions.cleanup_expired_sessions(None).await;
            if !expired.is_empty() {
                tracing::info!(
                    event_name = "system.sessions.expired",
                    correlation_id = "cleanup",
                    expired = expired.len(),
                    "evicted idle sessions"
                );
            }
        }
    })
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
