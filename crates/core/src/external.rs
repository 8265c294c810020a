use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::info;

use crate::resilience::client::ratio;
use crate::resilience::fallback::{CREDIT_BUREAU, CRM, OFFER_MART};
use crate::resilience::{
    ApiCallStats, ApiOperation, CallResult, DataSource, HealthProbe, ResilienceError,
    ResilientClient,
};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResourceResult {
    pub success: bool,
    pub data: Value,
    pub error: Option<String>,
    pub source: DataSource,
    pub fallback_used: bool,
}

impl From<CallResult> for ResourceResult {
    fn from(result: CallResult) -> Self {
        Self {
            success: result.success,
            data: result.data,
            error: result.error,
            source: result.source,
            fallback_used: result.fallback_used,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ComprehensiveCustomerData {
    pub customer_id: String,
    pub customer: ResourceResult,
    pub credit: ResourceResult,
    pub offers: ResourceResult,
    pub overall_success_rate: f64,
    pub all_apis_successful: bool,
    pub any_fallback_used: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallHealth {
    Healthy,
    Degraded,
    Critical,
}

impl OverallHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Critical => "critical",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HealthReport {
    pub apis: BTreeMap<String, HealthProbe>,
    pub healthy_apis: usize,
    pub total_apis: usize,
    pub health_percentage: f64,
    pub overall_status: OverallHealth,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ApiStatistics {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub fallback_calls: u64,
    pub success_rate: f64,
    pub failure_rate: f64,
    pub fallback_rate: f64,
    pub apis: BTreeMap<String, ApiCallStats>,
}

/// Loan-domain view over the CRM, credit bureau and offer mart.
pub struct ExternalApiService {
    client: Arc<ResilientClient>,
}

impl ExternalApiService {
    pub fn new(client: Arc<ResilientClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &ResilientClient {
        &self.client
    }

    pub async fn get_customer_data(&self, customer_id: &str) -> Result<CallResult, ResilienceError> {
        self.fetch(CRM, &format!("/crm/{customer_id}"), customer_id).await
    }

    pub async fn get_credit_report(&self, customer_id: &str) -> Result<CallResult, ResilienceError> {
        self.fetch(CREDIT_BUREAU, &format!("/credit-score/{customer_id}"), customer_id).await
    }

    pub async fn get_offers(&self, customer_id: &str) -> Result<CallResult, ResilienceError> {
        self.fetch(OFFER_MART, &format!("/offers/{customer_id}"), customer_id).await
    }

    /// Issues all three lookups concurrently and merges them.
    pub async fn get_comprehensive_customer_data(
        &self,
        customer_id: &str,
    ) -> Result<ComprehensiveCustomerData, ResilienceError> {
        let (customer, credit, offers) = tokio::join!(
            self.get_customer_data(customer_id),
            self.get_credit_report(customer_id),
            self.get_offers(customer_id),
        );
        let results = [customer?, credit?, offers?];

        let successes = results.iter().filter(|result| result.success).count();
        let any_fallback_used = results.iter().any(|result| result.fallback_used);
        let overall_success_rate = ratio(successes as u64, results.len() as u64);
        let [customer, credit, offers] = results;

        info!(
            event_name = "external.customer_data.aggregated",
            customer_id,
            overall_success_rate,
            any_fallback_used,
            "aggregated customer data"
        );

        Ok(ComprehensiveCustomerData {
            customer_id: customer_id.to_string(),
            customer: customer.into(),
            credit: credit.into(),
            offers: offers.into(),
            overall_success_rate,
            all_apis_successful: successes == 3,
            any_fallback_used,
        })
    }

    pub async fn perform_health_checks(&self) -> HealthReport {
        let probes = probe_all(&self.client).await;

        let total_apis = self.client.api_names().count();
        let healthy_apis = probes.values().filter(|probe| probe.healthy).count();
        let overall_status = if total_apis > 0 && healthy_apis == total_apis {
            OverallHealth::Healthy
        } else if healthy_apis > 0 {
            OverallHealth::Degraded
        } else {
            OverallHealth::Critical
        };

        HealthReport {
            apis: probes,
            healthy_apis,
            total_apis,
            health_percentage: ratio(healthy_apis as u64, total_apis as u64) * 100.0,
            overall_status,
        }
    }

    pub fn get_api_statistics(&self) -> ApiStatistics {
        let apis = self.client.call_stats();
        let total_calls = apis.values().map(|stats| stats.total_calls).sum();
        let successful_calls = apis.values().map(|stats| stats.successful_calls).sum();
        let failed_calls = apis.values().map(|stats| stats.failed_calls).sum();
        let fallback_calls = apis.values().map(|stats| stats.fallback_calls).sum();

        ApiStatistics {
            total_calls,
            successful_calls,
            failed_calls,
            fallback_calls,
            success_rate: ratio(successful_calls, total_calls),
            failure_rate: ratio(failed_calls, total_calls),
            fallback_rate: ratio(fallback_calls, total_calls),
            apis,
        }
    }

    pub fn reset_statistics(&self) {
        self.client.reset_stats();
    }

    async fn fetch(
        &self,
        api_name: &str,
        path: &str,
        customer_id: &str,
    ) -> Result<CallResult, ResilienceError> {
        let mut request = Map::new();
        request.insert("customer_id".to_string(), Value::String(customer_id.to_string()));
        self.client.invoke(api_name, &ApiOperation::get(path), &request).await
    }
}

async fn probe_all(client: &Arc<ResilientClient>) -> BTreeMap<String, HealthProbe> {
    let mut probes = tokio::task::JoinSet::new();
    for name in client.api_names().map(str::to_string).collect::<Vec<_>>() {
        let client = Arc::clone(client);
        probes.spawn(async move { client.check_health(&name).await });
    }

    let mut results = BTreeMap::new();
    while let Some(joined) = probes.join_next().await {
        if let Ok(Ok(probe)) = joined {
            results.insert(probe.api_name.clone(), probe);
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::{ExternalApiService, OverallHealth};
    use crate::resilience::{
        default_endpoints, DataSource, ResilienceSettings, ResilientClient, RetryPolicy,
        ScriptedTransport, TransportError,
    };

    fn service(transport: Arc<ScriptedTransport>) -> ExternalApiService {
        let settings =
            ResilienceSettings { retry: RetryPolicy::immediate(1), ..ResilienceSettings::default() };
        let mut client = ResilientClient::new(transport, settings);
        for endpoint in default_endpoints() {
            client.register(endpoint).expect("register endpoint");
        }
        ExternalApiService::new(Arc::new(client))
    }

    fn mixed_transport() -> ScriptedTransport {
        ScriptedTransport::new()
            .respond("/crm/", 200, json!({"customer_id": "CUST001", "name": "Asha Rao"}))
            .fail("/credit-score/", TransportError::Connect("bureau down".to_string()))
            .respond(
                "/offers/",
                200,
                json!({"customer_id": "CUST001", "pre_approved_limit": 150000}),
            )
    }

    #[tokio::test]
    async fn fan_out_reports_partial_success_and_fallback() {
        let service = service(Arc::new(mixed_transport()));
        let aggregate =
            service.get_comprehensive_customer_data("CUST001").await.expect("aggregate");

        assert!((aggregate.overall_success_rate - 2.0 / 3.0).abs() < f64::EPSILON);
        assert!(aggregate.any_fallback_used);
        assert!(!aggregate.all_apis_successful);
        assert_eq!(aggregate.credit.source, DataSource::Fallback);
        assert_eq!(aggregate.credit.data["credit_score"], json!(650));
        assert_eq!(aggregate.offers.data["pre_approved_limit"], json!(150000));
    }

    #[tokio::test]
    async fn resource_paths_carry_customer_id() {
        let transport = Arc::new(mixed_transport());
        let service = service(transport.clone());
        service.get_customer_data("CUST001").await.expect("crm");
        service.get_offers("CUST001").await.expect("offers");

        assert_eq!(transport.calls_matching("localhost:3001/crm/CUST001"), 1);
        assert_eq!(transport.calls_matching("localhost:3003/offers/CUST001"), 1);
    }

    #[tokio::test]
    async fn statistics_accumulate_and_reset() {
        let service = service(Arc::new(mixed_transport()));
        service.get_comprehensive_customer_data("CUST001").await.expect("aggregate");

        let stats = service.get_api_statistics();
        assert_eq!(stats.total_calls, 3);
        assert_eq!(stats.successful_calls, 2);
        assert_eq!(stats.fallback_calls, 1);
        assert_eq!(stats.apis["credit_bureau"].fallback_calls, 1);

        service.reset_statistics();
        assert_eq!(service.get_api_statistics().total_calls, 0);
    }

    #[tokio::test]
    async fn health_checks_classify_by_reachable_count() {
        let transport = ScriptedTransport::new()
            .respond("localhost:3001/health", 200, json!({"status": "ok"}))
            .respond("localhost:3003/health", 200, json!({"status": "ok"}));
        let report = service(Arc::new(transport)).perform_health_checks().await;

        assert_eq!(report.total_apis, 3);
        assert_eq!(report.healthy_apis, 2);
        assert_eq!(report.overall_status, OverallHealth::Degraded);
        assert!(!report.apis["credit_bureau"].healthy);

        let dark = service(Arc::new(ScriptedTransport::new())).perform_health_checks().await;
        assert_eq!(dark.overall_status, OverallHealth::Critical);
    }
}
