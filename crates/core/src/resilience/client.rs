use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use secrecy::SecretString;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{info, warn};

use super::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState, Clock, SystemClock,
};
use super::fallback::{FallbackProvider, CREDIT_BUREAU, CRM, OFFER_MART};
use super::retry::RetryPolicy;
use super::transport::{Method, Transport, TransportError, TransportRequest};
use super::validator::{sanitize, DataValidator};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResilienceError {
    #[error("api `{0}` is not registered")]
    UnknownApi(String),
    #[error("api `{0}` is already registered")]
    DuplicateApi(String),
}

#[derive(Clone, Debug)]
pub struct ApiEndpoint {
    pub name: String,
    pub base_url: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub health_path: String,
    pub api_key: Option<SecretString>,
}

impl ApiEndpoint {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            timeout,
            max_retries: 3,
            health_path: "/health".to_string(),
            api_key: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_api_key(mut self, api_key: SecretString) -> Self {
        self.api_key = Some(api_key);
        self
    }

    pub fn url_for(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        }
    }
}

/// CRM, credit bureau and offer mart on their local development ports.
pub fn default_endpoints() -> Vec<ApiEndpoint> {
    vec![
        ApiEndpoint::new(CRM, "http://localhost:3001", Duration::from_secs(30)),
        ApiEndpoint::new(CREDIT_BUREAU, "http://localhost:3002", Duration::from_secs(45)),
        ApiEndpoint::new(OFFER_MART, "http://localhost:3003", Duration::from_secs(30)),
    ]
}

#[derive(Clone, Debug, PartialEq)]
pub struct ApiOperation {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
}

impl ApiOperation {
    pub fn get(path: impl Into<String>) -> Self {
        Self { method: Method::Get, path: path.into(), body: None }
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self { method: Method::Post, path: path.into(), body: Some(body) }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    Api,
    Fallback,
}

/// Outcome of one resilient call. A fallback result has `success = false` but its
/// `data` is still shaped like the real response.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CallResult {
    pub success: bool,
    pub data: Value,
    pub fallback_used: bool,
    pub error: Option<String>,
    pub source: DataSource,
    pub attempts: u32,
    pub warnings: Vec<String>,
}

impl CallResult {
    /// Live data or fallback data; callers that only need something to show use this.
    pub fn is_usable(&self) -> bool {
        self.success || self.fallback_used
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiStatus {
    Healthy,
    Degraded,
    Unavailable,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ApiHealth {
    pub api_name: String,
    pub status: ApiStatus,
    pub circuit: CircuitSnapshot,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HealthProbe {
    pub api_name: String,
    pub healthy: bool,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub response_time_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ApiCallStats {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub fallback_calls: u64,
    pub success_rate: f64,
    pub circuit_state: CircuitState,
}

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    fallback: AtomicU64,
}

impl Counters {
    fn reset(&self) {
        for counter in [&self.total, &self.successful, &self.failed, &self.fallback] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[derive(Debug)]
struct RegisteredApi {
    endpoint: ApiEndpoint,
    breaker: CircuitBreaker,
    counters: Counters,
}

/// Breaker, retry and fallback tuning shared by every registered endpoint.
#[derive(Clone, Debug, Default)]
pub struct ResilienceSettings {
    pub breaker: CircuitBreakerConfig,
    pub retry: RetryPolicy,
}

pub struct ResilientClient {
    apis: BTreeMap<String, RegisteredApi>,
    transport: Arc<dyn Transport>,
    settings: ResilienceSettings,
    clock: Arc<dyn Clock>,
    fallback: FallbackProvider,
    validator: DataValidator,
}

impl ResilientClient {
    pub fn new(transport: Arc<dyn Transport>, settings: ResilienceSettings) -> Self {
        Self::with_clock(transport, settings, Arc::new(SystemClock))
    }

    pub fn with_clock(
        transport: Arc<dyn Transport>,
        settings: ResilienceSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            apis: BTreeMap::new(),
            transport,
            settings,
            clock,
            fallback: FallbackProvider::new(),
            validator: DataValidator::default(),
        }
    }

    pub fn register(&mut self, endpoint: ApiEndpoint) -> Result<(), ResilienceError> {
        if self.apis.contains_key(&endpoint.name) {
            return Err(ResilienceError::DuplicateApi(endpoint.name));
        }
        let breaker =
            CircuitBreaker::with_clock(&endpoint.name, self.settings.breaker, self.clock.clone());
        self.apis.insert(
            endpoint.name.clone(),
            RegisteredApi { endpoint, breaker, counters: Counters::default() },
        );
        Ok(())
    }

    pub fn api_names(&self) -> impl Iterator<Item = &str> {
        self.apis.keys().map(String::as_str)
    }

    pub fn breaker(&self, api_name: &str) -> Result<&CircuitBreaker, ResilienceError> {
        self.lookup(api_name).map(|api| &api.breaker)
    }

    /// Calls `api_name` through its breaker, retrying transient failures and falling
    /// back to substitute data. Only an unregistered API name is an error.
    pub async fn invoke(
        &self,
        api_name: &str,
        operation: &ApiOperation,
        request: &Map<String, Value>,
    ) -> Result<CallResult, ResilienceError> {
        let api = self.lookup(api_name)?;
        api.counters.total.fetch_add(1, Ordering::Relaxed);

        if !api.breaker.can_execute() {
            warn!(
                event_name = "resilience.call.short_circuited",
                api_name,
                "circuit open, serving fallback"
            );
            return Ok(self.fallback_result(api, request, 0, "circuit breaker is open".to_string()));
        }

        // A half-open breaker allows exactly one trial call, so no retries.
        let trial = api.breaker.state() == CircuitState::HalfOpen;
        let url = api.endpoint.url_for(&operation.path);
        let mut retries = 0;
        loop {
            let attempts = retries + 1;
            let failure = match self.attempt(api, operation, &url).await {
                Ok(body) => {
                    let report = self.validator.validate_response(&body, api_name);
                    if report.is_valid {
                        api.breaker.record_success();
                        api.counters.successful.fetch_add(1, Ordering::Relaxed);
                        return Ok(CallResult {
                            success: true,
                            data: sanitize(body),
                            fallback_used: false,
                            error: None,
                            source: DataSource::Api,
                            attempts,
                            warnings: report.warnings,
                        });
                    }

                    warn!(
                        event_name = "resilience.call.invalid_response",
                        api_name,
                        reasons = ?report.reasons,
                        "response failed validation"
                    );
                    api.breaker.record_failure();
                    let error = format!("invalid response: {}", report.reasons.join("; "));
                    return Ok(self.fallback_result(api, request, attempts, error));
                }
                Err(failure) => failure,
            };

            let next_delay = if trial {
                None
            } else {
                self.settings.retry.next_delay(retries, api.endpoint.max_retries, &failure)
            };
            match next_delay {
                Some(delay) => {
                    info!(
                        event_name = "resilience.call.retry",
                        api_name,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure,
                        "retrying external call"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    retries += 1;
                }
                None => {
                    api.breaker.record_failure();
                    return Ok(self.fallback_result(api, request, attempts, failure.to_string()));
                }
            }
        }
    }

    /// Probes the endpoint's health path once, bypassing breaker and retries.
    pub async fn check_health(&self, api_name: &str) -> Result<HealthProbe, ResilienceError> {
        let api = self.lookup(api_name)?;
        let mut request = TransportRequest::get(
            api.endpoint.url_for(&api.endpoint.health_path),
            api.endpoint.timeout,
        );
        request.bearer_token = api.endpoint.api_key.clone();

        let started = Instant::now();
        let outcome =
            tokio::time::timeout(api.endpoint.timeout, self.transport.call(request)).await;
        let response_time_ms = started.elapsed().as_millis() as u64;

        let probe = match outcome {
            Ok(Ok(response)) => HealthProbe {
                api_name: api_name.to_string(),
                healthy: response.status == 200,
                status_code: Some(response.status),
                error: None,
                response_time_ms,
            },
            Ok(Err(error)) => HealthProbe {
                api_name: api_name.to_string(),
                healthy: false,
                status_code: None,
                error: Some(error.to_string()),
                response_time_ms,
            },
            Err(_) => HealthProbe {
                api_name: api_name.to_string(),
                healthy: false,
                status_code: None,
                error: Some(
                    TransportError::Timeout { after: api.endpoint.timeout }.to_string(),
                ),
                response_time_ms,
            },
        };
        Ok(probe)
    }

    pub fn health_status(&self) -> Vec<ApiHealth> {
        self.apis
            .iter()
            .map(|(name, api)| {
                let circuit = api.breaker.snapshot();
                let status = match circuit.state {
                    CircuitState::Open => ApiStatus::Unavailable,
                    CircuitState::HalfOpen => ApiStatus::Degraded,
                    CircuitState::Closed if circuit.failure_count > 0 => ApiStatus::Degraded,
                    CircuitState::Closed => ApiStatus::Healthy,
                };
                ApiHealth { api_name: name.clone(), status, circuit }
            })
            .collect()
    }

    pub fn call_stats(&self) -> BTreeMap<String, ApiCallStats> {
        self.apis
            .iter()
            .map(|(name, api)| {
                let total = api.counters.total.load(Ordering::Relaxed);
                let successful = api.counters.successful.load(Ordering::Relaxed);
                let stats = ApiCallStats {
                    total_calls: total,
                    successful_calls: successful,
                    failed_calls: api.counters.failed.load(Ordering::Relaxed),
                    fallback_calls: api.counters.fallback.load(Ordering::Relaxed),
                    success_rate: ratio(successful, total),
                    circuit_state: api.breaker.state(),
                };
                (name.clone(), stats)
            })
            .collect()
    }

    pub fn reset_stats(&self) {
        for api in self.apis.values() {
            api.counters.reset();
        }
    }

    fn lookup(&self, api_name: &str) -> Result<&RegisteredApi, ResilienceError> {
        self.apis.get(api_name).ok_or_else(|| ResilienceError::UnknownApi(api_name.to_string()))
    }

    async fn attempt(
        &self,
        api: &RegisteredApi,
        operation: &ApiOperation,
        url: &str,
    ) -> Result<Value, TransportError> {
        let request = TransportRequest {
            method: operation.method,
            url: url.to_string(),
            timeout: api.endpoint.timeout,
            body: operation.body.clone(),
            bearer_token: api.endpoint.api_key.clone(),
        };

        let response = tokio::time::timeout(api.endpoint.timeout, self.transport.call(request))
            .await
            .map_err(|_| TransportError::Timeout { after: api.endpoint.timeout })??;

        if !response.is_success() {
            return Err(TransportError::Status {
                status: response.status,
                body: Some(response.body.to_string()),
            });
        }
        Ok(response.body)
    }

    fn fallback_result(
        &self,
        api: &RegisteredApi,
        request: &Map<String, Value>,
        attempts: u32,
        error: String,
    ) -> CallResult {
        api.counters.failed.fetch_add(1, Ordering::Relaxed);
        api.counters.fallback.fetch_add(1, Ordering::Relaxed);
        warn!(
            event_name = "resilience.call.fallback",
            api_name = %api.endpoint.name,
            attempts,
            error = %error,
            "serving fallback data"
        );
        CallResult {
            success: false,
            data: self.fallback.payload(&api.endpoint.name, request),
            fallback_used: true,
            error: Some(error),
            source: DataSource::Fallback,
            attempts,
            warnings: Vec::new(),
        }
    }
}

pub(crate) fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::{json, Map, Value};

    use super::{
        ApiEndpoint, ApiOperation, ApiStatus, DataSource, ResilienceError, ResilienceSettings,
        ResilientClient,
    };
    use crate::resilience::circuit_breaker::{CircuitBreakerConfig, CircuitState, ManualClock};
    use crate::resilience::retry::RetryPolicy;
    use crate::resilience::transport::{ScriptedTransport, TransportError};

    fn settings(threshold: u32, retries: u32) -> ResilienceSettings {
        ResilienceSettings {
            breaker: CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: Duration::from_secs(60),
            },
            retry: RetryPolicy::immediate(retries),
        }
    }

    fn client(
        transport: Arc<ScriptedTransport>,
        settings: ResilienceSettings,
    ) -> (ResilientClient, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let mut client = ResilientClient::with_clock(transport, settings, clock.clone());
        client
            .register(ApiEndpoint::new("crm", "http://crm.test", Duration::from_secs(5)))
            .expect("register crm");
        (client, clock)
    }

    fn request() -> Map<String, Value> {
        let mut request = Map::new();
        request.insert("customer_id".to_string(), json!("CUST001"));
        request
    }

    #[tokio::test]
    async fn unknown_api_fails_fast() {
        let transport = Arc::new(ScriptedTransport::new());
        let (client, _) = client(transport.clone(), settings(5, 3));

        let error = client
            .invoke("ledger", &ApiOperation::get("/x"), &request())
            .await
            .expect_err("unregistered api");
        assert_eq!(error, ResilienceError::UnknownApi("ledger".to_string()));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn success_path_keeps_breaker_clean() {
        let transport = Arc::new(ScriptedTransport::new().respond(
            "/crm/",
            200,
            json!({"customer_id": "CUST001", "name": "Asha <script>Rao"}),
        ));
        let (client, _) = client(transport.clone(), settings(5, 3));

        for _ in 0..4 {
            let result = client
                .invoke("crm", &ApiOperation::get("/crm/CUST001"), &request())
                .await
                .expect("invoke");
            assert!(result.success);
            assert!(!result.fallback_used);
            assert_eq!(result.source, DataSource::Api);
            assert_eq!(result.data["name"], json!("Asha Rao"));
        }
        assert_eq!(client.breaker("crm").expect("breaker").failure_count(), 0);
        assert_eq!(client.call_stats()["crm"].success_rate, 1.0);
    }

    #[tokio::test]
    async fn transient_failures_retry_then_succeed() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .fail("/crm/", TransportError::Status { status: 503, body: None })
                .fail("/crm/", TransportError::Timeout { after: Duration::from_secs(5) })
                .respond("/crm/", 200, json!({"customer_id": "CUST001", "name": "Asha"})),
        );
        let (client, _) = client(transport.clone(), settings(5, 3));

        let result =
            client.invoke("crm", &ApiOperation::get("/crm/CUST001"), &request()).await.expect("ok");
        assert!(result.success);
        assert_eq!(result.attempts, 3);
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_fall_back_and_count_one_failure() {
        let transport = Arc::new(
            ScriptedTransport::new().fail("/crm/", TransportError::Connect("refused".to_string())),
        );
        let (client, _) = client(transport.clone(), settings(5, 2));

        let result =
            client.invoke("crm", &ApiOperation::get("/crm/CUST001"), &request()).await.expect("ok");
        assert!(!result.success);
        assert!(result.fallback_used);
        assert!(result.is_usable());
        assert_eq!(result.data["name"], json!("Valued Customer"));
        assert_eq!(result.attempts, 3);
        assert_eq!(transport.calls(), 3);
        assert_eq!(client.breaker("crm").expect("breaker").failure_count(), 1);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let transport = Arc::new(
            ScriptedTransport::new().respond("/crm/", 404, json!({"error": "not found"})),
        );
        let (client, _) = client(transport.clone(), settings(5, 3));

        let result =
            client.invoke("crm", &ApiOperation::get("/crm/NOPE"), &request()).await.expect("ok");
        assert!(result.fallback_used);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn invalid_payload_takes_fallback_path() {
        let transport =
            Arc::new(ScriptedTransport::new().respond("/crm/", 200, json!({"name": "Asha"})));
        let (client, _) = client(transport.clone(), settings(5, 3));

        let result =
            client.invoke("crm", &ApiOperation::get("/crm/CUST001"), &request()).await.expect("ok");
        assert!(result.fallback_used);
        assert!(result.error.as_deref().is_some_and(|e| e.contains("customer_id")));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn open_circuit_never_touches_transport() {
        let transport = Arc::new(ScriptedTransport::new().respond(
            "/crm/",
            200,
            json!({"customer_id": "CUST001", "name": "Asha"}),
        ));
        let (client, _) = client(transport.clone(), settings(2, 0));
        let breaker = client.breaker("crm").expect("breaker");
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        for _ in 0..5 {
            let result = client
                .invoke("crm", &ApiOperation::get("/crm/CUST001"), &request())
                .await
                .expect("ok");
            assert!(result.fallback_used);
            assert_eq!(result.attempts, 0);
        }
        assert_eq!(transport.calls(), 0);
        assert_eq!(client.health_status()[0].status, ApiStatus::Unavailable);
    }

    #[tokio::test]
    async fn half_open_trial_makes_a_single_transport_call() {
        let transport = Arc::new(
            ScriptedTransport::new().fail("/crm/", TransportError::Connect("refused".to_string())),
        );
        let (client, clock) = client(transport.clone(), settings(1, 3));
        client.breaker("crm").expect("breaker").record_failure();

        clock.advance(Duration::from_secs(60));
        let result =
            client.invoke("crm", &ApiOperation::get("/crm/CUST001"), &request()).await.expect("ok");

        assert!(result.fallback_used);
        assert_eq!(result.attempts, 1);
        assert_eq!(transport.calls(), 1);
        assert_eq!(client.breaker("crm").expect("breaker").state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn half_open_trial_closes_circuit_on_success() {
        let transport = Arc::new(ScriptedTransport::new().respond(
            "/crm/",
            200,
            json!({"customer_id": "CUST001", "name": "Asha"}),
        ));
        let (client, clock) = client(transport.clone(), settings(1, 0));
        client.breaker("crm").expect("breaker").record_failure();

        clock.advance(Duration::from_secs(60));
        let result =
            client.invoke("crm", &ApiOperation::get("/crm/CUST001"), &request()).await.expect("ok");
        assert!(result.success);
        assert_eq!(client.breaker("crm").expect("breaker").state(), CircuitState::Closed);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let (mut client, _) = client(Arc::new(ScriptedTransport::new()), settings(5, 3));
        let error = client
            .register(ApiEndpoint::new("crm", "http://other", Duration::from_secs(1)))
            .expect_err("duplicate");
        assert_eq!(error, ResilienceError::DuplicateApi("crm".to_string()));
    }

    #[tokio::test]
    async fn health_probe_reports_status_code() {
        let transport =
            Arc::new(ScriptedTransport::new().respond("/health", 200, json!({"status": "ok"})));
        let (client, _) = client(transport, settings(5, 3));

        let probe = client.check_health("crm").await.expect("probe");
        assert!(probe.healthy);
        assert_eq!(probe.status_code, Some(200));
    }

    #[test]
    fn endpoint_urls_join_cleanly() {
        let endpoint = ApiEndpoint::new("crm", "http://crm.test/", Duration::from_secs(1));
        assert_eq!(endpoint.url_for("/crm/C1"), "http://crm.test/crm/C1");
        assert_eq!(endpoint.url_for("health"), "http://crm.test/health");
    }
}
