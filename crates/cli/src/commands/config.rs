use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use loanflow_core::config::{AppConfig, LoadOptions};
use secrecy::{ExposeSecret, SecretString};
use toml::Value;

use crate::commands::CommandResult;

struct Field {
    key: String,
    value: String,
    env_key: Option<String>,
}

impl Field {
    fn new(key: impl Into<String>, value: impl ToString, env_key: Option<&str>) -> Self {
        Self { key: key.into(), value: value.to_string(), env_key: env_key.map(str::to_string) }
    }
}

pub fn run() -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return CommandResult::text(2, format!("config validation failed: {error}")),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for field in effective_fields(&config) {
        let source = field_source(
            &field.key,
            field.env_key.as_deref(),
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(render_line(&field.key, &field.value, source));
    }

    CommandResult::text(0, lines.join("\n"))
}

fn effective_fields(config: &AppConfig) -> Vec<Field> {
    let database = &config.database;
    let storage = &config.storage;
    let server = &config.server;
    let resilience = &config.resilience;
    let sessions = &config.sessions;

    let mut fields = vec![
        Field::new("database.url", &database.url, Some("LOANFLOW_DATABASE_URL")),
        Field::new(
            "database.max_connections",
            database.max_connections,
            Some("LOANFLOW_DATABASE_MAX_CONNECTIONS"),
        ),
        Field::new(
            "database.timeout_secs",
            database.timeout_secs,
            Some("LOANFLOW_DATABASE_TIMEOUT_SECS"),
        ),
        Field::new("storage.backend", storage.backend.as_str(), Some("LOANFLOW_STORAGE_BACKEND")),
        Field::new(
            "storage.context_dir",
            storage.context_dir.display(),
            Some("LOANFLOW_STORAGE_CONTEXT_DIR"),
        ),
        Field::new(
            "server.bind_address",
            &server.bind_address,
            Some("LOANFLOW_SERVER_BIND_ADDRESS"),
        ),
        Field::new(
            "server.health_check_port",
            server.health_check_port,
            Some("LOANFLOW_SERVER_HEALTH_CHECK_PORT"),
        ),
        Field::new(
            "server.graceful_shutdown_secs",
            server.graceful_shutdown_secs,
            Some("LOANFLOW_SERVER_GRACEFUL_SHUTDOWN_SECS"),
        ),
        Field::new(
            "resilience.failure_threshold",
            resilience.failure_threshold,
            Some("LOANFLOW_RESILIENCE_FAILURE_THRESHOLD"),
        ),
        Field::new(
            "resilience.recovery_timeout_secs",
            resilience.recovery_timeout_secs,
            Some("LOANFLOW_RESILIENCE_RECOVERY_TIMEOUT_SECS"),
        ),
        Field::new(
            "resilience.max_retries",
            resilience.max_retries,
            Some("LOANFLOW_RESILIENCE_MAX_RETRIES"),
        ),
        Field::new("resilience.backoff", format!("{:?}", resilience.backoff), None),
        Field::new(
            "resilience.base_delay_ms",
            resilience.base_delay_ms,
            Some("LOANFLOW_RESILIENCE_BASE_DELAY_MS"),
        ),
        Field::new(
            "resilience.max_delay_ms",
            resilience.max_delay_ms,
            Some("LOANFLOW_RESILIENCE_MAX_DELAY_MS"),
        ),
        Field::new(
            "resilience.jitter_ms",
            format!("{}..={}", resilience.jitter_min_ms, resilience.jitter_max_ms),
            None,
        ),
    ];

    for (name, api) in config.apis.iter() {
        let prefix = format!("LOANFLOW_APIS_{}", name.to_ascii_uppercase());
        let base_url_env = format!("{prefix}_BASE_URL");
        let timeout_env = format!("{prefix}_TIMEOUT_SECS");
        let api_key_env = format!("{prefix}_API_KEY");
        fields.push(Field::new(
            format!("apis.{name}.base_url"),
            &api.base_url,
            Some(base_url_env.as_str()),
        ));
        fields.push(Field::new(
            format!("apis.{name}.timeout_secs"),
            api.timeout_secs,
            Some(timeout_env.as_str()),
        ));
        fields.push(Field::new(format!("apis.{name}.max_retries"), api.max_retries, None));
        fields.push(Field::new(
            format!("apis.{name}.api_key"),
            redact_secret(api.api_key.as_ref()),
            Some(api_key_env.as_str()),
        ));
    }

    fields.extend([
        Field::new(
            "sessions.timeout_minutes",
            sessions.timeout_minutes,
            Some("LOANFLOW_SESSIONS_TIMEOUT_MINUTES"),
        ),
        Field::new(
            "sessions.escalation_threshold",
            sessions.escalation_threshold,
            Some("LOANFLOW_SESSIONS_ESCALATION_THRESHOLD"),
        ),
        Field::new("sessions.list_limit", sessions.list_limit, None),
        Field::new("logging.level", &config.logging.level, Some("LOANFLOW_LOGGING_LEVEL")),
        Field::new(
            "logging.format",
            format!("{:?}", config.logging.format),
            Some("LOANFLOW_LOGGING_FORMAT"),
        ),
    ]);

    fields
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("loanflow.toml"), PathBuf::from("config/loanflow.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: Option<&str>,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_key {
        if env::var_os(env_key).is_some() {
            return format!("env ({env_key})");
        }
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

/// Keeps a `prefix-` marker when present so operators can tell key families apart.
fn redact_secret(secret: Option<&SecretString>) -> String {
    let Some(secret) = secret else {
        return "<unset>".to_string();
    };
    let trimmed = secret.expose_secret().trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    if let Some((prefix, _)) = trimmed.split_once('-') {
        return format!("{prefix}-***");
    }

    "<redacted>".to_string()
}
