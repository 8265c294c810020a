use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{json, Map, Value};

use loanflow_core::context::ContextUpdate;
use loanflow_core::domain::conversation::AgentType;
use loanflow_core::domain::task::AgentTask;
use loanflow_core::loan;

use crate::agent::{money_json, rate_json, read_number, to_decimal, AgentError, TaskContext};

/// Largest amount offered at standard terms without a counter-offer.
pub const STANDARD_LIMIT: i64 = 100_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoanTerms {
    pub interest_rate: Decimal,
    pub tenure_months: u32,
}

pub const STANDARD_TERMS: LoanTerms =
    LoanTerms { interest_rate: Decimal::from_parts(125, 0, 0, false, 1), tenure_months: 24 };
pub const COUNTER_OFFER_TERMS: LoanTerms =
    LoanTerms { interest_rate: Decimal::from_parts(130, 0, 0, false, 1), tenure_months: 36 };

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SalesDecision {
    Approved,
    CounterOffer,
}

impl SalesDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::CounterOffer => "counter_offer",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SalesOffer {
    pub decision: SalesDecision,
    pub requested_amount: Decimal,
    pub negotiated_amount: Decimal,
    pub terms: LoanTerms,
    pub emi: Decimal,
}

impl SalesOffer {
    pub fn message(&self) -> String {
        match self.decision {
            SalesDecision::Approved => format!(
                "Good news! We can offer you Rs. {} at {}% per annum for {} months. Your EMI would be Rs. {}.",
                self.negotiated_amount, self.terms.interest_rate, self.terms.tenure_months, self.emi
            ),
            SalesDecision::CounterOffer => format!(
                "Rs. {} is above what we can offer right away. We can offer Rs. {} at {}% per annum for {} months, with an EMI of Rs. {}. Would you like to go ahead?",
                self.requested_amount,
                self.negotiated_amount,
                self.terms.interest_rate,
                self.terms.tenure_months,
                self.emi
            ),
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "status": self.decision.as_str(),
            "requested_amount": money_json(self.requested_amount),
            "negotiated_amount": money_json(self.negotiated_amount),
            "interest_rate": rate_json(self.terms.interest_rate),
            "tenure": self.terms.tenure_months,
            "emi": money_json(self.emi),
            "message": self.message(),
        })
    }
}

/// Negotiates amount and terms from the customer's request.
#[derive(Clone, Copy, Debug, Default)]
pub struct SalesAgent;

impl SalesAgent {
    pub fn new() -> Self {
        Self
    }

    pub fn negotiate(&self, requested_amount: Decimal) -> Result<SalesOffer, AgentError> {
        if requested_amount <= Decimal::ZERO {
            return Err(AgentError::Validation("loan amount must be positive".to_string()));
        }

        let (decision, negotiated_amount, terms) =
            if requested_amount <= Decimal::from(STANDARD_LIMIT) {
                (SalesDecision::Approved, requested_amount, STANDARD_TERMS)
            } else {
                (SalesDecision::CounterOffer, Decimal::from(STANDARD_LIMIT), COUNTER_OFFER_TERMS)
            };
        let emi = loan::calculate_emi(negotiated_amount, terms.interest_rate, terms.tenure_months)?;

        Ok(SalesOffer { decision, requested_amount, negotiated_amount, terms, emi })
    }

    pub(crate) fn execute(
        &self,
        task: &AgentTask,
        context: &TaskContext,
    ) -> Result<(Value, ContextUpdate), AgentError> {
        let requested = requested_amount(&task.input, context)
            .ok_or_else(|| AgentError::Validation("loan amount is required".to_string()))?;
        let offer = self.negotiate(to_decimal(requested, "loan amount")?)?;

        let terms = json!({
            "status": offer.decision.as_str(),
            "amount": money_json(offer.negotiated_amount),
            "interest_rate": rate_json(offer.terms.interest_rate),
            "tenure": offer.terms.tenure_months,
            "emi": money_json(offer.emi),
        });
        let mut for_verification = Map::new();
        for_verification.insert("loan_amount".to_string(), money_json(offer.negotiated_amount));
        if let Some(customer_id) = context.customer_id() {
            for_verification.insert("customer_id".to_string(), json!(customer_id));
        }
        let mut for_underwriting = Map::new();
        for_underwriting.insert("loan_amount".to_string(), money_json(offer.negotiated_amount));
        for_underwriting
            .insert("interest_rate".to_string(), rate_json(offer.terms.interest_rate));
        for_underwriting.insert("tenure".to_string(), json!(offer.terms.tenure_months));

        let updates = ContextUpdate::new()
            .collect("loan_amount", money_json(offer.requested_amount))
            .collect("negotiated_terms", terms)
            .share(AgentType::Sales, AgentType::Verification, for_verification)
            .share(AgentType::Sales, AgentType::Underwriting, for_underwriting);

        Ok((offer.to_json(), updates))
    }
}

fn requested_amount(input: &Map<String, Value>, context: &TaskContext) -> Option<f64> {
    read_number(input, "amount")
        .or_else(|| match input.get("loan_request") {
            Some(Value::Object(request)) => read_number(request, "amount"),
            _ => None,
        })
        .or_else(|| crate::agent::value_number(context.collected("loan_amount")))
}
