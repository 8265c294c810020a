use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::info;

use loanflow_core::context::ContextUpdate;
use loanflow_core::domain::conversation::AgentType;
use loanflow_core::domain::task::{AgentTask, TaskType};
use loanflow_core::external::ExternalApiService;
use loanflow_core::loan;

use crate::agent::{
    money_json, rate_json, read_number, read_text, to_decimal, value_number, AgentError,
    TaskContext,
};
use crate::sales::{LoanTerms, STANDARD_TERMS};

pub const MIN_CREDIT_SCORE: f64 = 700.0;
const MAX_LIMIT_MULTIPLE: i64 = 2;
const SALARY_EMI_SHARE: Decimal = Decimal::from_parts(5, 0, 0, false, 1);
const SALARY_SLIP: &str = "salary_slip";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnderwritingStatus {
    Approved,
    Rejected,
    RequiresDocuments,
}

impl UnderwritingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::RequiresDocuments => "requires_documents",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    Instant,
    Conditional,
}

impl DecisionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Instant => "instant",
            Self::Conditional => "conditional",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnderwritingRequest {
    pub amount: Decimal,
    pub terms: LoanTerms,
    pub monthly_salary: Option<Decimal>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnderwritingDecision {
    pub status: UnderwritingStatus,
    pub decision_type: Option<DecisionType>,
    pub approved_amount: Option<Decimal>,
    pub suggested_amount: Option<Decimal>,
    pub emi: Option<Decimal>,
    pub reasons: Vec<String>,
    pub required_documents: Vec<String>,
}

impl UnderwritingDecision {
    fn rejected(reason: String, suggested_amount: Option<Decimal>) -> Self {
        Self {
            status: UnderwritingStatus::Rejected,
            decision_type: None,
            approved_amount: None,
            suggested_amount,
            emi: None,
            reasons: vec![reason],
            required_documents: Vec::new(),
        }
    }

    fn approved(decision_type: DecisionType, amount: Decimal, emi: Decimal, reason: String) -> Self {
        Self {
            status: UnderwritingStatus::Approved,
            decision_type: Some(decision_type),
            approved_amount: Some(amount),
            suggested_amount: None,
            emi: Some(emi),
            reasons: vec![reason],
            required_documents: Vec::new(),
        }
    }
}

/// Credit rules over a bureau score and the offer mart's pre-approved limit.
pub fn decide(
    request: &UnderwritingRequest,
    credit_score: f64,
    pre_approved_limit: Decimal,
) -> Result<UnderwritingDecision, AgentError> {
    let amount = request.amount;
    let terms = request.terms;

    if credit_score < MIN_CREDIT_SCORE {
        return Ok(UnderwritingDecision::rejected(
            format!("credit score {credit_score} is below the minimum of {MIN_CREDIT_SCORE}"),
            None,
        ));
    }
    if amount > pre_approved_limit * Decimal::from(MAX_LIMIT_MULTIPLE) {
        return Ok(UnderwritingDecision::rejected(
            format!("requested amount exceeds twice the pre-approved limit of {pre_approved_limit}"),
            Some(pre_approved_limit),
        ));
    }

    loan::check_amount(amount)?;
    let emi = loan::calculate_emi(amount, terms.interest_rate, terms.tenure_months)?;
    if amount <= pre_approved_limit {
        return Ok(UnderwritingDecision::approved(
            DecisionType::Instant,
            amount,
            emi,
            "within pre-approved limit".to_string(),
        ));
    }

    let Some(salary) = request.monthly_salary else {
        return Ok(UnderwritingDecision {
            status: UnderwritingStatus::RequiresDocuments,
            decision_type: None,
            approved_amount: None,
            suggested_amount: None,
            emi: Some(emi),
            reasons: vec!["salary proof needed above the pre-approved limit".to_string()],
            required_documents: vec![SALARY_SLIP.to_string()],
        });
    };

    let affordable_emi = salary * SALARY_EMI_SHARE;
    if emi <= affordable_emi {
        return Ok(UnderwritingDecision::approved(
            DecisionType::Conditional,
            amount,
            emi,
            "instalment within half of monthly salary".to_string(),
        ));
    }

    let suggested = if affordable_emi > Decimal::ZERO {
        loan::max_principal_for_emi(affordable_emi, terms.interest_rate, terms.tenure_months)
            .ok()
            .map(|principal| principal.floor())
            .filter(|principal| *principal >= Decimal::from(loan::MIN_LOAN_AMOUNT))
    } else {
        None
    };
    Ok(UnderwritingDecision::rejected(
        format!("instalment {emi} exceeds half of monthly salary {salary}"),
        suggested,
    ))
}

/// Credit decisions and sanction summaries.
pub struct UnderwritingAgent {
    api: Arc<ExternalApiService>,
}

impl UnderwritingAgent {
    pub fn new(api: Arc<ExternalApiService>) -> Self {
        Self { api }
    }

    pub(crate) async fn execute(
        &self,
        task: &AgentTask,
        context: &TaskContext,
    ) -> Result<(Value, ContextUpdate), AgentError> {
        match task.task_type {
            TaskType::DocumentGeneration => sanction_summary(task, context),
            _ => self.underwrite(task, context).await,
        }
    }

    async fn underwrite(
        &self,
        task: &AgentTask,
        context: &TaskContext,
    ) -> Result<(Value, ContextUpdate), AgentError> {
        let customer_id = read_text(&task.input, "customer_id")
            .or_else(|| context.customer_id().map(str::to_string))
            .ok_or_else(|| AgentError::Validation("customer id is required".to_string()))?;
        let request = resolve_request(&task.input, context)?;

        let (credit, offers) = tokio::join!(
            self.api.get_credit_report(&customer_id),
            self.api.get_offers(&customer_id),
        );
        let (credit, offers) = (credit?, offers?);

        let credit_score = value_number(credit.data.get("credit_score")).ok_or_else(|| {
            AgentError::Validation("credit report carried no credit score".to_string())
        })?;
        let limit = value_number(offers.data.get("pre_approved_limit")).ok_or_else(|| {
            AgentError::Validation("offer data carried no pre-approved limit".to_string())
        })?;
        let limit = to_decimal(limit, "pre-approved limit")?;
        let fallback_used = credit.fallback_used || offers.fallback_used;

        let decision = decide(&request, credit_score, limit)?;
        info!(
            event_name = "agent.underwriting.decided",
            correlation_id = %context.session_id(),
            session_id = %context.session_id(),
            status = decision.status.as_str(),
            credit_score,
            fallback_used,
            "underwriting decided"
        );

        let mut result = Map::new();
        result.insert("status".to_string(), json!(decision.status.as_str()));
        result.insert(
            "decision_type".to_string(),
            decision.decision_type.map(|kind| json!(kind.as_str())).unwrap_or(Value::Null),
        );
        result.insert("customer_id".to_string(), json!(customer_id));
        result.insert("requested_amount".to_string(), money_json(request.amount));
        result.insert("credit_score".to_string(), json!(credit_score));
        result.insert("pre_approved_limit".to_string(), money_json(limit));
        result.insert("interest_rate".to_string(), rate_json(request.terms.interest_rate));
        result.insert("tenure".to_string(), json!(request.terms.tenure_months));
        if let Some(amount) = decision.approved_amount {
            result.insert("approved_amount".to_string(), money_json(amount));
        }
        if let Some(amount) = decision.suggested_amount {
            result.insert("suggested_amount".to_string(), money_json(amount));
        }
        if let Some(emi) = decision.emi {
            result.insert("emi".to_string(), money_json(emi));
        }
        result.insert("reasons".to_string(), json!(decision.reasons));
        result.insert("required_documents".to_string(), json!(decision.required_documents));
        result.insert("fallback_used".to_string(), json!(fallback_used));

        let mut updates = ContextUpdate::new()
            .collect("underwriting_decision", json!(decision.status.as_str()))
            .collect("credit_score", json!(credit_score));
        if let (Some(amount), Some(emi)) = (decision.approved_amount, decision.emi) {
            updates = updates.collect("approved_amount", money_json(amount)).collect(
                "approved_terms",
                json!({
                    "amount": money_json(amount),
                    "interest_rate": rate_json(request.terms.interest_rate),
                    "tenure": request.terms.tenure_months,
                    "emi": money_json(emi),
                }),
            );
        }

        Ok((Value::Object(result), updates))
    }
}

fn resolve_request(
    input: &Map<String, Value>,
    context: &TaskContext,
) -> Result<UnderwritingRequest, AgentError> {
    let from_sales = context.shared_from(AgentType::Sales, AgentType::Underwriting);

    let amount = read_number(input, "amount")
        .or_else(|| read_number(input, "loan_amount"))
        .or_else(|| read_number(&from_sales, "loan_amount"))
        .or_else(|| value_number(context.collected("loan_amount")))
        .ok_or_else(|| AgentError::Validation("loan amount is required".to_string()))?;
    let amount = to_decimal(amount, "loan amount")?;
    if amount <= Decimal::ZERO {
        return Err(AgentError::Validation("loan amount must be positive".to_string()));
    }

    let interest_rate = match read_number(input, "interest_rate")
        .or_else(|| read_number(&from_sales, "interest_rate"))
    {
        Some(rate) => to_decimal(rate, "interest rate")?,
        None => STANDARD_TERMS.interest_rate,
    };
    let tenure_months = read_number(input, "tenure")
        .or_else(|| read_number(&from_sales, "tenure"))
        .map(|tenure| tenure as u32)
        .unwrap_or(STANDARD_TERMS.tenure_months);

    let monthly_salary = match read_number(input, "monthly_salary")
        .or_else(|| value_number(context.collected("monthly_salary")))
    {
        Some(salary) if salary > 0.0 => Some(to_decimal(salary, "monthly salary")?),
        _ => None,
    };

    Ok(UnderwritingRequest {
        amount,
        terms: LoanTerms { interest_rate, tenure_months },
        monthly_salary,
    })
}

/// Figures for the sanction letter, built from approved terms.
fn sanction_summary(
    task: &AgentTask,
    context: &TaskContext,
) -> Result<(Value, ContextUpdate), AgentError> {
    let approved = match (task.input.get("approved_terms"), context.collected("approved_terms")) {
        (Some(Value::Object(terms)), _) => terms.clone(),
        (_, Some(Value::Object(terms))) => terms.clone(),
        _ => task.input.clone(),
    };
    let amount = read_number(&approved, "amount")
        .ok_or_else(|| AgentError::Validation("no approved loan terms to document".to_string()))?;
    let rate = read_number(&approved, "interest_rate")
        .ok_or_else(|| AgentError::Validation("approved terms carry no interest rate".to_string()))?;
    let tenure = read_number(&approved, "tenure")
        .ok_or_else(|| AgentError::Validation("approved terms carry no tenure".to_string()))?;

    let quote =
        loan::quote(to_decimal(amount, "amount")?, to_decimal(rate, "interest rate")?, tenure as u32)?;
    let summary = json!({
        "document_type": "sanction_letter",
        "customer_id": context.customer_id(),
        "approved_amount": money_json(quote.principal),
        "interest_rate": rate_json(quote.annual_rate),
        "tenure": quote.tenure_months,
        "emi": money_json(quote.emi),
        "total_payable": money_json(quote.total_payable),
        "total_interest": money_json(quote.total_interest),
        "generated_at": Utc::now().to_rfc3339(),
    });
    let updates = ContextUpdate::new().collect("sanction_summary", summary.clone());
    Ok((summary, updates))
}
