use std::sync::Arc;

use loanflow_core::config::{AppConfig, LoadOptions};
use loanflow_core::context::ContextStore;
use loanflow_core::external::{ExternalApiService, OverallHealth};
use loanflow_core::resilience::ResilientClient;
use loanflow_db::open_context_store;
use loanflow_server::HttpTransport;
use serde::Serialize;

use crate::commands::{runtime, CommandResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Warn,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

impl DoctorCheck {
    fn skipped(name: &'static str, reason: &str) -> Self {
        Self { name, status: CheckStatus::Skipped, details: format!("skipped because {reason}") }
    }
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool) -> CommandResult {
    let report = build_report();
    let exit_code = if report.overall_status == CheckStatus::Fail { 1 } else { 0 };

    if json_output {
        let output = serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        });
        return CommandResult::text(exit_code, output);
    }

    CommandResult::text(exit_code, render_human(&report))
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            match runtime() {
                Ok(runtime) => {
                    checks.push(runtime.block_on(check_context_storage(&config)));
                    checks.push(runtime.block_on(check_upstream_health(&config)));
                }
                Err(error) => {
                    let reason = format!("the async runtime failed to start: {error}");
                    checks.push(DoctorCheck::skipped("context_storage", &reason));
                    checks.push(DoctorCheck::skipped("upstream_health", &reason));
                }
            }
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            let reason = "configuration did not load";
            checks.push(DoctorCheck::skipped("context_storage", reason));
            checks.push(DoctorCheck::skipped("upstream_health", reason));
        }
    }

    let failed = checks
        .iter()
        .any(|check| matches!(check.status, CheckStatus::Fail | CheckStatus::Skipped));
    let warned = checks.iter().any(|check| check.status == CheckStatus::Warn);
    let (overall_status, summary) = if failed {
        (CheckStatus::Fail, "doctor: one or more readiness checks failed")
    } else if warned {
        (CheckStatus::Warn, "doctor: ready, upstream apis will be served from fallback data")
    } else {
        (CheckStatus::Pass, "doctor: all readiness checks passed")
    };

    DoctorReport { overall_status, summary: summary.to_string(), checks }
}

async fn check_context_storage(config: &AppConfig) -> DoctorCheck {
    let backend = config.storage.backend.as_str();
    let store = match open_context_store(config).await {
        Ok(store) => store,
        Err(error) => {
            return DoctorCheck {
                name: "context_storage",
                status: CheckStatus::Fail,
                details: format!("failed to open {backend} store: {error}"),
            };
        }
    };

    match store.ping().await {
        Ok(()) => DoctorCheck {
            name: "context_storage",
            status: CheckStatus::Pass,
            details: format!("{backend} store reachable"),
        },
        Err(error) => DoctorCheck {
            name: "context_storage",
            status: CheckStatus::Fail,
            details: format!("{backend} store unreachable: {error}"),
        },
    }
}

/// Upstream outages only warn: every loan api call has a fallback.
async fn check_upstream_health(config: &AppConfig) -> DoctorCheck {
    let transport = match HttpTransport::new() {
        Ok(transport) => transport,
        Err(error) => {
            return DoctorCheck {
                name: "upstream_health",
                status: CheckStatus::Fail,
                details: format!("http client could not be built: {error}"),
            };
        }
    };

    let mut client = ResilientClient::new(Arc::new(transport), config.resilience_settings());
    for endpoint in config.api_endpoints() {
        if let Err(error) = client.register(endpoint) {
            return DoctorCheck {
                name: "upstream_health",
                status: CheckStatus::Fail,
                details: error.to_string(),
            };
        }
    }

    let report = ExternalApiService::new(Arc::new(client)).perform_health_checks().await;
    let unhealthy: Vec<&str> = report
        .apis
        .values()
        .filter(|probe| !probe.healthy)
        .map(|probe| probe.api_name.as_str())
        .collect();
    let status = match report.overall_status {
        OverallHealth::Healthy => CheckStatus::Pass,
        OverallHealth::Degraded | OverallHealth::Critical => CheckStatus::Warn,
    };
    let mut details = format!(
        "{}/{} apis healthy ({})",
        report.healthy_apis,
        report.total_apis,
        report.overall_status.as_str()
    );
    if !unhealthy.is_empty() {
        details.push_str(&format!("; unreachable: {}", unhealthy.join(", ")));
    }

    DoctorCheck { name: "upstream_health", status, details }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Warn => "warn",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
