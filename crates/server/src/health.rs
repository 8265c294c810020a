use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use loanflow_agent::SessionManager;
use loanflow_core::context::ContextStore;
use loanflow_core::external::{ExternalApiService, OverallHealth};
use serde::Serialize;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct HealthState {
    pub store: Arc<dyn ContextStore>,
    pub api: Arc<ExternalApiService>,
    pub sessions: Arc<SessionManager>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DependencyHealth {
    pub overall_status: OverallHealth,
    pub healthy_apis: usize,
    pub total_apis: usize,
    pub health_percentage: f64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionHealth {
    pub active_sessions: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub storage: HealthCheck,
    pub dependencies: DependencyHealth,
    pub sessions: SessionHealth,
    pub checked_at: String,
}

pub fn router(state: HealthState) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}

pub async fn spawn(bind_address: &str, port: u16, state: HealthState) -> std::io::Result<()> {
    let address = format!("{bind_address}:{port}");
    let listener = tokio::net::TcpListener::bind(&address).await?;

    info!(
        event_name = "system.health.start",
        correlation_id = "bootstrap",
        bind_address = %address,
        "health endpoint started"
    );

    tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, router(state)).await {
            error!(
                event_name = "system.health.error",
                correlation_id = "bootstrap",
                error = %error,
                "health endpoint server terminated unexpectedly"
            );
        }
    });

    Ok(())
}

/// Storage gates readiness. Upstream outages only degrade the report since
/// every upstream call has fallback data.
pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let storage = storage_check(state.store.as_ref()).await;
    let report = state.api.perform_health_checks().await;
    let active_sessions = state.sessions.contexts().get_active_sessions().await.len();

    let storage_ready = storage.status == "ready";
    let upstreams_healthy = report.overall_status == OverallHealth::Healthy;
    if !upstreams_healthy {
        warn!(
            event_name = "system.health.upstreams_degraded",
            correlation_id = "health",
            healthy_apis = report.healthy_apis,
            total_apis = report.total_apis,
            "upstream apis not fully healthy"
        );
    }

    let payload = HealthResponse {
        status: if storage_ready && upstreams_healthy { "ready" } else { "degraded" },
        service: HealthCheck {
            status: "ready",
            detail: "loanflow-server runtime initialized".to_string(),
        },
        storage,
        dependencies: DependencyHealth {
            overall_status: report.overall_status,
            healthy_apis: report.healthy_apis,
            total_apis: report.total_apis,
            health_percentage: report.health_percentage,
        },
        sessions: SessionHealth { active_sessions },
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if storage_ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn storage_check(store: &dyn ContextStore) -> HealthCheck {
    let backend = store.backend();
    match store.ping().await {
        Ok(()) => HealthCheck { status: "ready", detail: format!("{backend} store reachable") },
        Err(error) => HealthCheck {
            status: "degraded",
            detail: format!("{backend} store unreachable: {error}"),
        },
    }
}
