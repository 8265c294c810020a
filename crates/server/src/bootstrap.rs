use std::sync::Arc;

use loanflow_agent::{MasterAgent, SessionManager};
use loanflow_core::audit::TracingAuditSink;
use loanflow_core::config::{AppConfig, ConfigError, LoadOptions};
use loanflow_core::context::{ContextManager, ContextStore};
use loanflow_core::error_handler::ErrorHandler;
use loanflow_core::external::ExternalApiService;
use loanflow_core::resilience::{ResilienceError, ResilientClient, Transport};
use loanflow_db::{open_context_store, StoreOpenError};
use thiserror::Error;
use tracing::info;

use crate::transport::HttpTransport;

pub struct Application {
    pub config: AppConfig,
    pub store: Arc<dyn ContextStore>,
    pub api: Arc<ExternalApiService>,
    pub sessions: Arc<SessionManager>,
    pub master: MasterAgent,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("context store unavailable: {0}")]
    Store(#[from] StoreOpenError),
    #[error("api registration failed: {0}")]
    Integration(#[from] ResilienceError),
    #[error("http client could not be built: {0}")]
    Transport(#[from] reqwest::Error),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    info!(event_name = "system.bootstrap.start", correlation_id = "bootstrap", "starting bootstrap");
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new()?);
    bootstrap_with_transport(config, transport).await
}

/// Wires the runtime against an arbitrary transport. Tests pass a scripted one.
pub async fn bootstrap_with_transport(
    config: AppConfig,
    transport: Arc<dyn Transport>,
) -> Result<Application, BootstrapError> {
    config.validate()?;

    let store = open_context_store(&config).await?;

    let mut client = ResilientClient::new(transport, config.resilience_settings());
    for endpoint in config.api_endpoints() {
        client.register(endpoint)?;
    }
    let api = Arc::new(ExternalApiService::new(Arc::new(client)));
    info!(
        event_name = "system.bootstrap.apis_registered",
        correlation_id = "bootstrap",
        apis = api.client().api_names().count(),
        "upstream apis registered"
    );

    let contexts = Arc::new(ContextManager::new(store.clone(), config.session_timeout()));
    let sessions = Arc::new(
        SessionManager::new(contexts, Arc::new(ErrorHandler::new()), Arc::new(TracingAuditSink))
            .with_list_limit(config.sessions.list_limit),
    );
    let master = MasterAgent::new(sessions.clone())
        .with_escalation_threshold(config.sessions.escalation_threshold as usize);

    info!(
        event_name = "system.bootstrap.ready",
        correlation_id = "bootstrap",
        backend = store.backend(),
        master_agent = master.agent_id(),
        "application wired"
    );

    Ok(Application { config, store, api, sessions, master })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use loanflow_core::config::{AppConfig, StorageBackend};
    use loanflow_core::domain::conversation::AgentType;
    use loanflow_core::resilience::ScriptedTransport;

    use super::{bootstrap_with_transport, BootstrapError};

    fn memory_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.storage.backend = StorageBackend::Memory;
        config
    }

    #[tokio::test]
    async fn wires_sessions_against_the_configured_store() {
        let app = bootstrap_with_transport(memory_config(), Arc::new(ScriptedTransport::new()))
            .await
            .expect("bootstrap");

        assert_eq!(app.store.backend(), "memory");
        let names: Vec<&str> = app.api.client().api_names().collect();
        assert_eq!(names.len(), 3);

        let context = app.sessions.start_session(Some("CUST001".to_string())).await.expect("start");
        assert_eq!(context.current_agent, AgentType::Master);
        assert!(app.sessions.contexts().is_active(&context.session_id).await);
    }

    #[tokio::test]
    async fn sqlite_store_is_migrated_during_bootstrap() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = AppConfig::default();
        config.storage.backend = StorageBackend::Sqlite;
        config.database.url = format!("sqlite://{}", dir.path().join("loanflow.db").display());

        let app = bootstrap_with_transport(config, Arc::new(ScriptedTransport::new()))
            .await
            .expect("bootstrap");
        assert_eq!(app.store.backend(), "sqlite");
        app.store.ping().await.expect("ping");
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_before_wiring() {
        let mut config = memory_config();
        config.sessions.timeout_minutes = 0;

        let result = bootstrap_with_transport(config, Arc::new(ScriptedTransport::new())).await;
        assert!(matches!(result, Err(BootstrapError::Config(_))));
    }
}
