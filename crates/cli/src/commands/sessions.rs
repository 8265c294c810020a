use anyhow::Context;
use loanflow_core::config::{AppConfig, LoadOptions};
use loanflow_core::context::{ContextStore, StoredSessionSummary};
use loanflow_db::open_context_store;
use serde::Serialize;

use crate::commands::{runtime, CommandResult};

#[derive(Debug, Serialize)]
struct SessionRow {
    session_id: String,
    customer_id: Option<String>,
    stage: String,
    updated_at: String,
}

impl From<StoredSessionSummary> for SessionRow {
    fn from(summary: StoredSessionSummary) -> Self {
        Self {
            session_id: summary.session_id.to_string(),
            customer_id: summary.customer_id,
            stage: summary.stage.as_str().to_string(),
            updated_at: summary.updated_at.to_rfc3339(),
        }
    }
}

pub fn run(customer_id: Option<&str>, limit: Option<usize>, json_output: bool) -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "sessions",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };

    let limit = limit.unwrap_or(config.sessions.list_limit);
    let rows = match list_sessions(&config, customer_id, limit) {
        Ok(rows) => rows,
        Err(error) => {
            return CommandResult::failure("sessions", "storage", format!("{error:#}"), 4);
        }
    };

    if json_output {
        return match serde_json::to_string_pretty(&rows) {
            Ok(output) => CommandResult::text(0, output),
            Err(error) => CommandResult::failure("sessions", "serialization", error.to_string(), 1),
        };
    }

    CommandResult::text(0, render_human(&rows))
}

fn list_sessions(
    config: &AppConfig,
    customer_id: Option<&str>,
    limit: usize,
) -> anyhow::Result<Vec<SessionRow>> {
    let runtime = runtime().context("failed to initialize async runtime")?;
    let summaries = runtime.block_on(async {
        let store = open_context_store(config)
            .await
            .with_context(|| format!("failed to open {} store", config.storage.backend.as_str()))?;
        store.list().await.context("failed to list stored sessions")
    })?;

    Ok(summaries
        .into_iter()
        .filter(|summary| {
            customer_id.map_or(true, |wanted| summary.customer_id.as_deref() == Some(wanted))
        })
        .take(limit)
        .map(SessionRow::from)
        .collect())
}

fn render_human(rows: &[SessionRow]) -> String {
    if rows.is_empty() {
        return "no stored sessions".to_string();
    }

    let mut lines = vec![format!("{} stored session(s), newest first:", rows.len())];
    for row in rows {
        lines.push(format!(
            "- {} stage={} customer={} updated_at={}",
            row.session_id,
            row.stage,
            row.customer_id.as_deref().unwrap_or("<anonymous>"),
            row.updated_at
        ));
    }
    lines.join("\n")
}
