use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

use super::fallback::{CREDIT_BUREAU, CRM, OFFER_MART};

const STRIPPED_PATTERNS: [&str; 4] = ["<script>", "</script>", "javascript:", "data:"];

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub reasons: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    fn error(&mut self, reason: impl Into<String>) {
        self.is_valid = false;
        self.reasons.push(reason.into());
    }

    fn warn(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }
}

#[derive(Clone, Debug)]
pub struct DataValidator {
    required_fields: HashMap<String, Vec<String>>,
}

impl Default for DataValidator {
    fn default() -> Self {
        let mut validator = Self { required_fields: HashMap::new() };
        validator.require(CRM, &["customer_id", "name"]);
        validator.require(CREDIT_BUREAU, &["customer_id", "credit_score"]);
        validator.require(OFFER_MART, &["customer_id", "pre_approved_limit"]);
        validator
    }
}

impl DataValidator {
    pub fn require(&mut self, api_name: &str, fields: &[&str]) {
        self.required_fields.insert(
            api_name.to_ascii_lowercase(),
            fields.iter().map(|field| field.to_string()).collect(),
        );
    }

    pub fn validate_response(&self, data: &Value, api_name: &str) -> ValidationReport {
        let mut report = ValidationReport { is_valid: true, ..ValidationReport::default() };
        let object = match data {
            Value::Object(object) if !object.is_empty() => object,
            Value::Null => {
                report.error("response is empty");
                return report;
            }
            Value::Object(_) => {
                report.error("response object has no fields");
                return report;
            }
            _ => {
                report.error("response is not a JSON object");
                return report;
            }
        };

        let api_name = api_name.to_ascii_lowercase();
        if let Some(required) = self.required_fields.get(&api_name) {
            for field in required {
                if object.get(field).map_or(true, Value::is_null) {
                    report.error(format!("missing required field `{field}`"));
                }
            }
        }

        match api_name.as_str() {
            CRM => check_crm(data, &mut report),
            CREDIT_BUREAU => check_credit(data, &mut report),
            OFFER_MART => check_offers(data, &mut report),
            _ => {}
        }

        report
    }
}

fn check_crm(data: &Value, report: &mut ValidationReport) {
    if let Some(phone) = data.get("phone").and_then(Value::as_str) {
        if phone.chars().filter(char::is_ascii_digit).count() < 10 {
            report.warn("phone number looks too short");
        }
    }
    if let Some(address) = data.get("address").and_then(Value::as_str) {
        if address.trim().len() < 10 {
            report.warn("address looks too short");
        }
    }
}

fn check_credit(data: &Value, report: &mut ValidationReport) {
    match data.get("credit_score") {
        Some(Value::Number(score)) => {
            let score = score.as_f64().unwrap_or_default();
            if !(300.0..=900.0).contains(&score) {
                report.warn(format!("credit score {score} is outside 300-900"));
            }
        }
        Some(Value::Null) | None => {}
        Some(_) => report.error("credit_score is not a number"),
    }
}

fn check_offers(data: &Value, report: &mut ValidationReport) {
    match data.get("pre_approved_limit") {
        Some(Value::Number(limit)) => {
            let limit = limit.as_f64().unwrap_or_default();
            if limit < 0.0 {
                report.error("pre_approved_limit is negative");
            } else if limit > 10_000_000.0 {
                report.warn("pre_approved_limit is unusually high");
            }
        }
        Some(Value::Null) | None => {}
        Some(_) => report.error("pre_approved_limit is not a number"),
    }

    if let Some(offers) = data.get("offers").and_then(Value::as_array) {
        for (index, offer) in offers.iter().enumerate() {
            for field in ["amount", "interest_rate", "tenure"] {
                if offer.get(field).is_none() {
                    report.warn(format!("offer {index} is missing `{field}`"));
                }
            }
        }
    }
}

/// Strips script tags and script-bearing URL schemes from every string in `value`.
pub fn sanitize(value: Value) -> Value {
    match value {
        Value::String(text) => Value::String(sanitize_str(&text)),
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize).collect()),
        Value::Object(object) => {
            Value::Object(object.into_iter().map(|(key, value)| (key, sanitize(value))).collect())
        }
        other => other,
    }
}

pub fn sanitize_str(text: &str) -> String {
    let mut cleaned = text.to_string();
    for pattern in STRIPPED_PATTERNS {
        while let Some(start) = cleaned.to_ascii_lowercase().find(pattern) {
            cleaned.replace_range(start..start + pattern.len(), "");
        }
    }
    cleaned.trim().to_string()
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{sanitize, sanitize_str, DataValidator};

    #[test]
    fn empty_payloads_are_invalid() {
        let validator = DataValidator::default();
        assert!(!validator.validate_response(&Value::Null, "crm").is_valid);
        assert!(!validator.validate_response(&json!({}), "crm").is_valid);
        assert!(!validator.validate_response(&json!([1, 2]), "unknown").is_valid);
    }

    #[test]
    fn crm_requires_customer_identifier() {
        let report = DataValidator::default().validate_response(&json!({"name": "Asha"}), "crm");
        assert!(!report.is_valid);
        assert_eq!(report.reasons, vec!["missing required field `customer_id`".to_string()]);
    }

    #[test]
    fn warnings_do_not_invalidate() {
        let report = DataValidator::default().validate_response(
            &json!({"customer_id": "C1", "credit_score": 950}),
            "credit_bureau",
        );
        assert!(report.is_valid);
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn semantic_errors_invalidate() {
        let validator = DataValidator::default();
        let score = validator.validate_response(
            &json!({"customer_id": "C1", "credit_score": "seven hundred"}),
            "credit_bureau",
        );
        assert!(!score.is_valid);

        let limit = validator.validate_response(
            &json!({"customer_id": "C1", "pre_approved_limit": -5}),
            "offer_mart",
        );
        assert!(!limit.is_valid);
    }

    #[test]
    fn incomplete_offers_are_flagged() {
        let report = DataValidator::default().validate_response(
            &json!({"customer_id": "C1", "pre_approved_limit": 200000, "offers": [{"amount": 1}]}),
            "offer_mart",
        );
        assert!(report.is_valid);
        assert_eq!(report.warnings.len(), 2);
    }

    #[test]
    fn unregistered_api_only_needs_a_non_empty_object() {
        let report = DataValidator::default().validate_response(&json!({"ok": true}), "kyc");
        assert!(report.is_valid);
    }

    #[test]
    fn sanitizer_strips_script_content_recursively() {
        assert_eq!(sanitize_str("  <SCRIPT>alert(1)</script> Asha "), "alert(1) Asha");
        assert_eq!(sanitize_str("JavaScript:void(0)"), "void(0)");

        let cleaned = sanitize(json!({"profile": {"links": ["data:text/html,x", "ok"]}, "n": 3}));
        assert_eq!(cleaned, json!({"profile": {"links": ["text/html,x", "ok"]}, "n": 3}));
    }
}
