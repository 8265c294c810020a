use chrono::Utc;
use serde_json::{json, Map, Value};

pub const CRM: &str = "crm";
pub const CREDIT_BUREAU: &str = "credit_bureau";
pub const OFFER_MART: &str = "offer_mart";

/// Substitute payloads shaped like the real API responses, tagged `data_source: fallback`.
#[derive(Clone, Copy, Debug, Default)]
pub struct FallbackProvider;

impl FallbackProvider {
    pub fn new() -> Self {
        Self
    }

    pub fn payload(&self, api_name: &str, request: &Map<String, Value>) -> Value {
        let customer_id = request
            .get("customer_id")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();

        match api_name.to_ascii_lowercase().as_str() {
            CRM => json!({
                "customer_id": customer_id,
                "name": "Valued Customer",
                "phone": "Please provide your phone number",
                "address": "Please provide your address",
                "kyc_status": "manual_verification_required",
                "data_source": "fallback",
                "requires_manual_verification": true,
            }),
            CREDIT_BUREAU => json!({
                "customer_id": customer_id,
                "credit_score": 650,
                "score_date": Utc::now().date_naive().to_string(),
                "bureau_name": "fallback_estimation",
                "status": "estimated_score",
                "data_source": "fallback",
                "requires_verification": true,
                "note": "This is an estimated score. Actual verification required.",
            }),
            OFFER_MART => json!({
                "customer_id": customer_id,
                "pre_approved_limit": 100000,
                "interest_rate": 18.0,
                "offers": [
                    {"amount": 50000, "interest_rate": 18.0, "tenure": 24, "offer_type": "conservative_offer"},
                    {"amount": 75000, "interest_rate": 19.0, "tenure": 36, "offer_type": "standard_offer"},
                ],
                "data_source": "fallback",
                "note": "These are conservative offers. Better rates may be available upon verification.",
            }),
            _ => {
                let mut generic = Map::new();
                if let Some(customer_id) = request.get("customer_id") {
                    generic.insert("customer_id".to_string(), customer_id.clone());
                }
                generic.insert("data_source".to_string(), json!("fallback"));
                generic.insert("fallback_used".to_string(), json!(true));
                Value::Object(generic)
            }
        }
    }
}

/// True when a payload was produced by [`FallbackProvider`].
pub fn is_fallback_payload(data: &Value) -> bool {
    data.get("data_source").and_then(Value::as_str) == Some("fallback")
}
