use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::info;

use loanflow_core::context::ContextUpdate;
use loanflow_core::domain::conversation::AgentType;
use loanflow_core::domain::task::AgentTask;
use loanflow_core::external::ExternalApiService;

use crate::agent::{read_text, AgentError, TaskContext};

const ADDRESS_MATCH_THRESHOLD: f64 = 0.8;
const NAME_MATCH_THRESHOLD: f64 = 0.7;
const REVIEW_SCORE_THRESHOLD: f64 = 0.5;
const PHONE_DIGITS: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Verified,
    ManualReview,
    Failed,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Verified => "verified",
            Self::ManualReview => "manual_review",
            Self::Failed => "failed",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FieldCheck {
    pub matched: bool,
    pub similarity: f64,
}

impl FieldCheck {
    fn to_json(self) -> Value {
        json!({"matched": self.matched, "similarity": self.similarity})
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct VerificationReport {
    pub status: VerificationStatus,
    pub checks: Map<String, Value>,
    pub issues: Vec<String>,
    pub verification_score: f64,
    pub fallback_used: bool,
}

/// Claimed customer details, compared against the CRM record.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClaimedDetails {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
}

impl ClaimedDetails {
    fn resolve(input: &Map<String, Value>, context: &TaskContext) -> Self {
        let pick = |key: &str| {
            read_text(input, key).or_else(|| {
                context
                    .collected(key)
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|text| !text.is_empty())
                    .map(str::to_string)
            })
        };
        Self { name: pick("name"), phone: pick("phone"), address: pick("address") }
    }
}

/// KYC checks of claimed details against the CRM.
pub struct VerificationAgent {
    api: Arc<ExternalApiService>,
}

impl VerificationAgent {
    pub fn new(api: Arc<ExternalApiService>) -> Self {
        Self { api }
    }

    pub(crate) async fn execute(
        &self,
        task: &AgentTask,
        context: &TaskContext,
    ) -> Result<(Value, ContextUpdate), AgentError> {
        let customer_id = read_text(&task.input, "customer_id")
            .or_else(|| context.customer_id().map(str::to_string))
            .ok_or_else(|| AgentError::Validation("customer id is required".to_string()))?;
        let claimed = ClaimedDetails::resolve(&task.input, context);

        let record = self.api.get_customer_data(&customer_id).await?;
        let report = if record.fallback_used {
            VerificationReport {
                status: VerificationStatus::ManualReview,
                checks: Map::new(),
                issues: vec!["customer record unavailable, manual verification required"
                    .to_string()],
                verification_score: 0.0,
                fallback_used: true,
            }
        } else {
            verify(&claimed, &record.data)
        };

        info!(
            event_name = "agent.verification.evaluated",
            correlation_id = %context.session_id(),
            session_id = %context.session_id(),
            status = report.status.as_str(),
            verification_score = report.verification_score,
            fallback_used = report.fallback_used,
            "verification evaluated"
        );

        let result = json!({
            "status": report.status.as_str(),
            "customer_id": customer_id,
            "checks": report.checks,
            "issues": report.issues,
            "verification_score": report.verification_score,
            "fallback_used": report.fallback_used,
            "kyc_status": record.data.get("kyc_status").cloned().unwrap_or(Value::Null),
        });

        let mut handoff = Map::new();
        handoff.insert("customer_id".to_string(), json!(customer_id));
        handoff.insert("verification_status".to_string(), json!(report.status.as_str()));
        let updates = ContextUpdate::new()
            .collect("verification_status", json!(report.status.as_str()))
            .collect("kyc_verified", json!(report.status == VerificationStatus::Verified))
            .share(AgentType::Verification, AgentType::Underwriting, handoff);

        Ok((result, updates))
    }
}

/// Scores claimed details against a live CRM record.
pub fn verify(claimed: &ClaimedDetails, record: &Value) -> VerificationReport {
    let mut checks = Map::new();
    let mut issues = Vec::new();

    let fields: [(&str, &Option<String>); 3] =
        [("phone", &claimed.phone), ("address", &claimed.address), ("name", &claimed.name)];
    for (field, claimed_value) in fields {
        let Some(claimed_value) = claimed_value else {
            continue;
        };
        let Some(on_record) = record.get(field).and_then(Value::as_str) else {
            issues.push(format!("no {field} on record"));
            let missing = FieldCheck { matched: false, similarity: 0.0 };
            checks.insert(field.to_string(), missing.to_json());
            continue;
        };

        let check = match field {
            "phone" => {
                let matched = phones_match(claimed_value, on_record);
                FieldCheck { matched, similarity: if matched { 1.0 } else { 0.0 } }
            }
            "address" => threshold_check(claimed_value, on_record, ADDRESS_MATCH_THRESHOLD),
            _ => threshold_check(claimed_value, on_record, NAME_MATCH_THRESHOLD),
        };
        if !check.matched {
            issues.push(format!("{field} does not match our records"));
        }
        checks.insert(field.to_string(), check.to_json());
    }

    if checks.is_empty() {
        return VerificationReport {
            status: VerificationStatus::ManualReview,
            checks,
            issues: vec!["no customer details supplied to verify".to_string()],
            verification_score: 0.0,
            fallback_used: false,
        };
    }

    let matched = checks
        .values()
        .filter(|check| check.get("matched").and_then(Value::as_bool).unwrap_or(false))
        .count();
    let verification_score = matched as f64 / checks.len() as f64;
    let status = if matched == checks.len() {
        VerificationStatus::Verified
    } else if verification_score >= REVIEW_SCORE_THRESHOLD {
        VerificationStatus::ManualReview
    } else {
        VerificationStatus::Failed
    };

    VerificationReport { status, checks, issues, verification_score, fallback_used: false }
}

/// Last ten digits after dropping a `91` country code or a trunk `0`.
pub fn normalize_phone(raw: &str) -> String {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    let trimmed = if digits.len() == PHONE_DIGITS + 2 && digits.starts_with("91") {
        &digits[2..]
    } else if digits.len() == PHONE_DIGITS + 1 && digits.starts_with('0') {
        &digits[1..]
    } else {
        digits.as_str()
    };
    trimmed.to_string()
}

fn phones_match(claimed: &str, on_record: &str) -> bool {
    let claimed = normalize_phone(claimed);
    claimed.len() == PHONE_DIGITS && claimed == normalize_phone(on_record)
}

/// Jaccard overlap of lower-cased word tokens.
pub fn token_similarity(left: &str, right: &str) -> f64 {
    let tokens = |text: &str| -> BTreeSet<String> {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|token| !token.is_empty())
            .map(str::to_lowercase)
            .collect()
    };
    let left = tokens(left);
    let right = tokens(right);
    if left.is_empty() && right.is_empty() {
        return 1.0;
    }
    let shared = left.intersection(&right).count();
    let union = left.union(&right).count();
    shared as f64 / union as f64
}

fn threshold_check(claimed: &str, on_record: &str, threshold: f64) -> FieldCheck {
    let similarity = token_similarity(claimed, on_record);
    FieldCheck { matched: similarity >= threshold, similarity }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{normalize_phone, token_similarity, verify, ClaimedDetails, VerificationStatus};

    fn record() -> serde_json::Value {
        json!({
            "customer_id": "CUST001",
            "name": "Asha Rao",
            "phone": "+91 98765 43210",
            "address": "12 MG Road, Bengaluru",
        })
    }

    #[test]
    fn phone_prefixes_are_normalised() {
        assert_eq!(normalize_phone("+91-98765-43210"), "9876543210");
        assert_eq!(normalize_phone("09876543210"), "9876543210");
        assert_eq!(normalize_phone("98765 43210"), "9876543210");
    }

    #[test]
    fn similarity_ignores_case_and_punctuation() {
        assert_eq!(token_similarity("12 MG Road, Bengaluru", "12 mg road bengaluru"), 1.0);
        assert!(token_similarity("Asha Rao", "Ravi Kumar") < 0.7);
    }

    #[test]
    fn all_matching_details_verify() {
        let claimed = ClaimedDetails {
            name: Some("asha rao".to_string()),
            phone: Some("9876543210".to_string()),
            address: Some("12 MG Road Bengaluru".to_string()),
        };
        let report = verify(&claimed, &record());

        assert_eq!(report.status, VerificationStatus::Verified);
        assert_eq!(report.verification_score, 1.0);
        assert!(report.issues.is_empty());
    }

    #[test]
    fn partial_match_goes_to_manual_review() {
        let claimed = ClaimedDetails {
            name: Some("Asha Rao".to_string()),
            phone: Some("9000000000".to_string()),
            address: None,
        };
        let report = verify(&claimed, &record());

        assert_eq!(report.status, VerificationStatus::ManualReview);
        assert_eq!(report.verification_score, 0.5);
        assert_eq!(report.issues, vec!["phone does not match our records".to_string()]);
    }

    #[test]
    fn mostly_wrong_details_fail() {
        let claimed = ClaimedDetails {
            name: Some("Ravi Kumar".to_string()),
            phone: Some("9000000000".to_string()),
            address: Some("Flat 4, Park Street, Kolkata".to_string()),
        };
        assert_eq!(verify(&claimed, &record()).status, VerificationStatus::Failed);
    }

    #[test]
    fn nothing_to_check_needs_review() {
        let report = verify(&ClaimedDetails::default(), &record());
        assert_eq!(report.status, VerificationStatus::ManualReview);
        assert!(report.checks.is_empty());
    }
}
