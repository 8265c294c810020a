use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resilience::fallback::{CREDIT_BUREAU, CRM, OFFER_MART};
use crate::resilience::{
    ApiEndpoint, BackoffStrategy, CircuitBreakerConfig, ResilienceSettings, RetryPolicy,
};

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub server: ServerConfig,
    pub resilience: ResilienceConfig,
    pub apis: ApisConfig,
    pub sessions: SessionsConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub context_dir: PathBuf,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub health_check_port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResilienceConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    pub max_retries: u32,
    pub backoff: BackoffStrategy,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: u32,
    pub jitter_min_ms: u64,
    pub jitter_max_ms: u64,
}

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub health_path: String,
    pub api_key: Option<SecretString>,
}

#[derive(Clone, Debug)]
pub struct ApisConfig {
    pub crm: ApiConfig,
    pub credit_bureau: ApiConfig,
    pub offer_mart: ApiConfig,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionsConfig {
    pub timeout_minutes: u64,
    pub escalation_threshold: u32,
    pub list_limit: usize,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Sqlite,
    File,
    Memory,
}

impl StorageBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::File => "file",
            Self::Memory => "memory",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub storage_backend: Option<StorageBackend>,
    pub context_dir: Option<PathBuf>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://loanflow.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            storage: StorageConfig {
                backend: StorageBackend::Sqlite,
                context_dir: PathBuf::from("data/contexts"),
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                health_check_port: 8080,
                graceful_shutdown_secs: 15,
            },
            resilience: ResilienceConfig {
                failure_threshold: 5,
                recovery_timeout_secs: 60,
                max_retries: 3,
                backoff: BackoffStrategy::Exponential,
                base_delay_ms: 1_000,
                max_delay_ms: 60_000,
                backoff_multiplier: 2,
                jitter_min_ms: 100,
                jitter_max_ms: 500,
            },
            apis: ApisConfig {
                crm: ApiConfig::local(3001, 30),
                credit_bureau: ApiConfig::local(3002, 45),
                offer_mart: ApiConfig::local(3003, 30),
            },
            sessions: SessionsConfig {
                timeout_minutes: 30,
                escalation_threshold: 3,
                list_limit: 50,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl ApiConfig {
    fn local(port: u16, timeout_secs: u64) -> Self {
        Self {
            base_url: format!("http://localhost:{port}"),
            timeout_secs,
            max_retries: 3,
            health_path: "/health".to_string(),
            api_key: None,
        }
    }

    fn endpoint(&self, name: &str) -> ApiEndpoint {
        let mut endpoint =
            ApiEndpoint::new(name, self.base_url.clone(), Duration::from_secs(self.timeout_secs))
                .with_max_retries(self.max_retries);
        endpoint.health_path = self.health_path.clone();
        endpoint.api_key = self.api_key.clone();
        endpoint
    }
}

impl ApisConfig {
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &ApiConfig)> {
        [(CRM, &self.crm), (CREDIT_BUREAU, &self.credit_bureau), (OFFER_MART, &self.offer_mart)]
            .into_iter()
    }

    fn get_mut(&mut self, name: &str) -> Option<&mut ApiConfig> {
        match name {
            CRM => Some(&mut self.crm),
            CREDIT_BUREAU => Some(&mut self.credit_bureau),
            OFFER_MART => Some(&mut self.offer_mart),
            _ => None,
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for StorageBackend {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "file" => Ok(Self::File),
            "memory" => Ok(Self::Memory),
            other => Err(ConfigError::Validation(format!(
                "unsupported storage backend `{other}` (expected sqlite|file|memory)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch)?;
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("loanflow.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    /// Breaker and retry tuning for the resilient client.
    pub fn resilience_settings(&self) -> ResilienceSettings {
        let resilience = &self.resilience;
        ResilienceSettings {
            breaker: CircuitBreakerConfig {
                failure_threshold: resilience.failure_threshold,
                recovery_timeout: Duration::from_secs(resilience.recovery_timeout_secs),
            },
            retry: RetryPolicy {
                max_retries: resilience.max_retries,
                strategy: resilience.backoff,
                base_delay: Duration::from_millis(resilience.base_delay_ms),
                multiplier: resilience.backoff_multiplier,
                max_delay: Duration::from_millis(resilience.max_delay_ms),
                jitter_min: Duration::from_millis(resilience.jitter_min_ms),
                jitter_max: Duration::from_millis(resilience.jitter_max_ms),
            },
        }
    }

    pub fn api_endpoints(&self) -> Vec<ApiEndpoint> {
        self.apis.iter().map(|(name, api)| api.endpoint(name)).collect()
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.sessions.timeout_minutes * 60)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) -> Result<(), ConfigError> {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(storage) = patch.storage {
            if let Some(backend) = storage.backend {
                self.storage.backend = backend;
            }
            if let Some(context_dir) = storage.context_dir {
                self.storage.context_dir = context_dir;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(health_check_port) = server.health_check_port {
                self.server.health_check_port = health_check_port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(resilience) = patch.resilience {
            let target = &mut self.resilience;
            if let Some(value) = resilience.failure_threshold {
                target.failure_threshold = value;
            }
            if let Some(value) = resilience.recovery_timeout_secs {
                target.recovery_timeout_secs = value;
            }
            if let Some(value) = resilience.max_retries {
                target.max_retries = value;
            }
            if let Some(value) = resilience.backoff {
                target.backoff = value;
            }
            if let Some(value) = resilience.base_delay_ms {
                target.base_delay_ms = value;
            }
            if let Some(value) = resilience.max_delay_ms {
                target.max_delay_ms = value;
            }
            if let Some(value) = resilience.backoff_multiplier {
                target.backoff_multiplier = value;
            }
            if let Some(value) = resilience.jitter_min_ms {
                target.jitter_min_ms = value;
            }
            if let Some(value) = resilience.jitter_max_ms {
                target.jitter_max_ms = value;
            }
        }

        if let Some(apis) = patch.apis {
            for (name, api_patch) in
                [(CRM, apis.crm), (CREDIT_BUREAU, apis.credit_bureau), (OFFER_MART, apis.offer_mart)]
            {
                let (Some(api_patch), Some(target)) = (api_patch, self.apis.get_mut(name)) else {
                    continue;
                };
                if let Some(base_url) = api_patch.base_url {
                    target.base_url = base_url;
                }
                if let Some(timeout_secs) = api_patch.timeout_secs {
                    target.timeout_secs = timeout_secs;
                }
                if let Some(max_retries) = api_patch.max_retries {
                    target.max_retries = max_retries;
                }
                if let Some(health_path) = api_patch.health_path {
                    target.health_path = health_path;
                }
                if let Some(api_key_value) = api_patch.api_key {
                    target.api_key = Some(secret_value(api_key_value));
                }
            }
        }

        if let Some(sessions) = patch.sessions {
            if let Some(timeout_minutes) = sessions.timeout_minutes {
                self.sessions.timeout_minutes = timeout_minutes;
            }
            if let Some(escalation_threshold) = sessions.escalation_threshold {
                self.sessions.escalation_threshold = escalation_threshold;
            }
            if let Some(list_limit) = sessions.list_limit {
                self.sessions.list_limit = list_limit;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("LOANFLOW_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("LOANFLOW_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("LOANFLOW_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("LOANFLOW_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("LOANFLOW_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("LOANFLOW_STORAGE_BACKEND") {
            self.storage.backend = value.parse()?;
        }
        if let Some(value) = read_env("LOANFLOW_STORAGE_CONTEXT_DIR") {
            self.storage.context_dir = PathBuf::from(value);
        }

        if let Some(value) = read_env("LOANFLOW_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("LOANFLOW_SERVER_HEALTH_CHECK_PORT") {
            self.server.health_check_port =
                parse_u16("LOANFLOW_SERVER_HEALTH_CHECK_PORT", &value)?;
        }
        if let Some(value) = read_env("LOANFLOW_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("LOANFLOW_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("LOANFLOW_RESILIENCE_FAILURE_THRESHOLD") {
            self.resilience.failure_threshold =
                parse_u32("LOANFLOW_RESILIENCE_FAILURE_THRESHOLD", &value)?;
        }
        if let Some(value) = read_env("LOANFLOW_RESILIENCE_RECOVERY_TIMEOUT_SECS") {
            self.resilience.recovery_timeout_secs =
                parse_u64("LOANFLOW_RESILIENCE_RECOVERY_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("LOANFLOW_RESILIENCE_MAX_RETRIES") {
            self.resilience.max_retries = parse_u32("LOANFLOW_RESILIENCE_MAX_RETRIES", &value)?;
        }
        if let Some(value) = read_env("LOANFLOW_RESILIENCE_BASE_DELAY_MS") {
            self.resilience.base_delay_ms =
                parse_u64("LOANFLOW_RESILIENCE_BASE_DELAY_MS", &value)?;
        }
        if let Some(value) = read_env("LOANFLOW_RESILIENCE_MAX_DELAY_MS") {
            self.resilience.max_delay_ms = parse_u64("LOANFLOW_RESILIENCE_MAX_DELAY_MS", &value)?;
        }

        for name in [CRM, CREDIT_BUREAU, OFFER_MART] {
            let prefix = format!("LOANFLOW_APIS_{}", name.to_ascii_uppercase());
            let Some(target) = self.apis.get_mut(name) else {
                continue;
            };
            if let Some(value) = read_env(&format!("{prefix}_BASE_URL")) {
                target.base_url = value;
            }
            let timeout_key = format!("{prefix}_TIMEOUT_SECS");
            if let Some(value) = read_env(&timeout_key) {
                target.timeout_secs = parse_u64(&timeout_key, &value)?;
            }
            if let Some(value) = read_env(&format!("{prefix}_API_KEY")) {
                target.api_key = Some(secret_value(value));
            }
        }

        if let Some(value) = read_env("LOANFLOW_SESSIONS_TIMEOUT_MINUTES") {
            self.sessions.timeout_minutes =
                parse_u64("LOANFLOW_SESSIONS_TIMEOUT_MINUTES", &value)?;
        }
        if let Some(value) = read_env("LOANFLOW_SESSIONS_ESCALATION_THRESHOLD") {
            self.sessions.escalation_threshold =
                parse_u32("LOANFLOW_SESSIONS_ESCALATION_THRESHOLD", &value)?;
        }

        let log_level =
            read_env("LOANFLOW_LOGGING_LEVEL").or_else(|| read_env("LOANFLOW_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("LOANFLOW_LOGGING_FORMAT").or_else(|| read_env("LOANFLOW_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(storage_backend) = overrides.storage_backend {
            self.storage.backend = storage_backend;
        }
        if let Some(context_dir) = overrides.context_dir {
            self.storage.context_dir = context_dir;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_storage(&self.storage)?;
        validate_server(&self.server)?;
        validate_resilience(&self.resilience)?;
        for (name, api) in self.apis.iter() {
            validate_api(name, api)?;
        }
        validate_sessions(&self.sessions)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("loanflow.toml"), PathBuf::from("config/loanflow.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_storage(storage: &StorageConfig) -> Result<(), ConfigError> {
    if storage.backend == StorageBackend::File && storage.context_dir.as_os_str().is_empty() {
        return Err(ConfigError::Validation(
            "storage.context_dir is required when storage.backend = \"file\"".to_string(),
        ));
    }
    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.health_check_port == 0 {
        return Err(ConfigError::Validation(
            "server.health_check_port must be greater than zero".to_string(),
        ));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_resilience(resilience: &ResilienceConfig) -> Result<(), ConfigError> {
    if resilience.failure_threshold == 0 {
        return Err(ConfigError::Validation(
            "resilience.failure_threshold must be at least 1".to_string(),
        ));
    }
    if resilience.recovery_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "resilience.recovery_timeout_secs must be greater than zero".to_string(),
        ));
    }
    if resilience.jitter_min_ms > resilience.jitter_max_ms {
        return Err(ConfigError::Validation(
            "resilience.jitter_min_ms must not exceed resilience.jitter_max_ms".to_string(),
        ));
    }
    if resilience.base_delay_ms > resilience.max_delay_ms {
        return Err(ConfigError::Validation(
            "resilience.base_delay_ms must not exceed resilience.max_delay_ms".to_string(),
        ));
    }
    Ok(())
}

fn validate_api(name: &str, api: &ApiConfig) -> Result<(), ConfigError> {
    if !api.base_url.starts_with("http://") && !api.base_url.starts_with("https://") {
        return Err(ConfigError::Validation(format!(
            "apis.{name}.base_url must start with http:// or https://"
        )));
    }
    if api.timeout_secs == 0 || api.timeout_secs > 300 {
        return Err(ConfigError::Validation(format!(
            "apis.{name}.timeout_secs must be in range 1..=300"
        )));
    }
    if !api.health_path.starts_with('/') {
        return Err(ConfigError::Validation(format!(
            "apis.{name}.health_path must start with `/`"
        )));
    }
    Ok(())
}

fn validate_sessions(sessions: &SessionsConfig) -> Result<(), ConfigError> {
    if sessions.timeout_minutes == 0 {
        return Err(ConfigError::Validation(
            "sessions.timeout_minutes must be greater than zero".to_string(),
        ));
    }
    if sessions.escalation_threshold == 0 {
        return Err(ConfigError::Validation(
            "sessions.escalation_threshold must be at least 1".to_string(),
        ));
    }
    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    storage: Option<StoragePatch>,
    server: Option<ServerPatch>,
    resilience: Option<ResiliencePatch>,
    apis: Option<ApisPatch>,
    sessions: Option<SessionsPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct StoragePatch {
    backend: Option<StorageBackend>,
    context_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    health_check_port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ResiliencePatch {
    failure_threshold: Option<u32>,
    recovery_timeout_secs: Option<u64>,
    max_retries: Option<u32>,
    backoff: Option<BackoffStrategy>,
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    backoff_multiplier: Option<u32>,
    jitter_min_ms: Option<u64>,
    jitter_max_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ApisPatch {
    crm: Option<ApiPatch>,
    credit_bureau: Option<ApiPatch>,
    offer_mart: Option<ApiPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiPatch {
    base_url: Option<String>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
    health_path: Option<String>,
    api_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SessionsPatch {
    timeout_minutes: Option<u64>,
    escalation_threshold: Option<u32>,
    list_limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};
    use std::time::Duration;

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat, StorageBackend};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_describe_local_dependencies() -> Result<(), String> {
        let config = AppConfig::default();
        config.validate().map_err(|err| err.to_string())?;

        ensure(config.apis.crm.base_url == "http://localhost:3001", "crm default port")?;
        ensure(config.apis.credit_bureau.timeout_secs == 45, "bureau gets a longer timeout")?;
        ensure(config.resilience.failure_threshold == 5, "breaker threshold default")?;
        ensure(config.sessions.escalation_threshold == 3, "escalation default")?;

        let endpoints = config.api_endpoints();
        ensure(endpoints.len() == 3, "three endpoints")?;
        ensure(
            endpoints.iter().any(|e| e.name == "offer_mart" && e.health_path == "/health"),
            "offer mart endpoint carries health path",
        )?;

        let settings = config.resilience_settings();
        ensure(
            settings.breaker.recovery_timeout == Duration::from_secs(60),
            "recovery timeout converts to seconds",
        )?;
        ensure(settings.retry.jitter_max == Duration::from_millis(500), "jitter max")
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_BUREAU_API_KEY", "bureau-key-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("loanflow.toml");
            fs::write(
                &path,
                r#"
[apis.credit_bureau]
base_url = "https://bureau.example.test"
api_key = "${TEST_BUREAU_API_KEY}"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config
                    .apis
                    .credit_bureau
                    .api_key
                    .as_ref()
                    .is_some_and(|key| key.expose_secret() == "bureau-key-from-env"),
                "api key should be loaded from environment",
            )?;
            ensure(
                config.apis.credit_bureau.base_url == "https://bureau.example.test",
                "base url should come from file",
            )?;
            ensure(config.apis.crm.api_key.is_none(), "other apis stay keyless")?;
            Ok(())
        })();

        clear_vars(&["TEST_BUREAU_API_KEY"]);
        result
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("LOANFLOW_LOG_LEVEL", "warn");
        env::set_var("LOANFLOW_LOG_FORMAT", "json");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Json),
                "json logging format should be set from env var",
            )?;
            Ok(())
        })();

        clear_vars(&["LOANFLOW_LOG_LEVEL", "LOANFLOW_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("LOANFLOW_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("LOANFLOW_APIS_CRM_TIMEOUT_SECS", "12");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("loanflow.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[storage]
backend = "file"

[apis.crm]
timeout_secs = 20

[resilience]
max_retries = 5

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    storage_backend: Some(StorageBackend::Memory),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(config.storage.backend == StorageBackend::Memory, "override backend wins")?;
            ensure(config.apis.crm.timeout_secs == 12, "env timeout wins over file")?;
            ensure(config.resilience.max_retries == 5, "file value wins over default")?;
            Ok(())
        })();

        clear_vars(&["LOANFLOW_DATABASE_URL", "LOANFLOW_APIS_CRM_TIMEOUT_SECS"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("LOANFLOW_APIS_OFFER_MART_BASE_URL", "ftp://offers");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("apis.offer_mart.base_url")
            );
            ensure(has_message, "validation failure should name apis.offer_mart.base_url")
        })();

        clear_vars(&["LOANFLOW_APIS_OFFER_MART_BASE_URL"]);
        result
    }

    #[test]
    fn invalid_numeric_override_is_reported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("LOANFLOW_RESILIENCE_MAX_RETRIES", "many");
        let result = match AppConfig::load(LoadOptions::default()) {
            Err(ConfigError::InvalidEnvOverride { key, .. }) => {
                ensure(key == "LOANFLOW_RESILIENCE_MAX_RETRIES", "override key is named")
            }
            Err(other) => Err(format!("unexpected error: {other}")),
            Ok(_) => Err("non-numeric retry count should fail".to_string()),
        };

        clear_vars(&["LOANFLOW_RESILIENCE_MAX_RETRIES"]);
        result
    }

    #[test]
    fn missing_required_file_is_reported() {
        let result = AppConfig::load(LoadOptions {
            config_path: Some("does-not-exist/loanflow.toml".into()),
            require_file: true,
            ..LoadOptions::default()
        });
        assert!(matches!(result, Err(ConfigError::MissingConfigFile(_))));
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("LOANFLOW_APIS_CRM_API_KEY", "crm-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("crm-secret-value"), "debug output should not contain api key")?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )?;
            Ok(())
        })();

        clear_vars(&["LOANFLOW_APIS_CRM_API_KEY"]);
        result
    }
}
