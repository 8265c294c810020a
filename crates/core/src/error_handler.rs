//! Error classification and customer-safe messaging.
//!
//! Internal failure text goes to operators through `tracing`; customers only ever
//! see the fixed, category-specific sentences defined here.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use crate::domain::conversation::{AgentType, ConversationStage, ErrorLog, ErrorSeverity, SessionId};
use crate::domain::task::TaskId;

const CATEGORY_ESCALATION_THRESHOLD: u64 = 10;
const GENERIC_CUSTOMER_MESSAGE: &str =
    "I apologize, but I'm experiencing a technical issue. Let me try to help you in a different way.";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    AgentFailure,
    ApiFailure,
    ValidationError,
    ProcessingError,
    NetworkError,
    TimeoutError,
    BusinessRuleError,
    DataError,
    SystemError,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentFailure => "agent_failure",
            Self::ApiFailure => "api_failure",
            Self::ValidationError => "validation_error",
            Self::ProcessingError => "processing_error",
            Self::NetworkError => "network_error",
            Self::TimeoutError => "timeout_error",
            Self::BusinessRuleError => "business_rule_error",
            Self::DataError => "data_error",
            Self::SystemError => "system_error",
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::SystemError => ErrorSeverity::Critical,
            Self::AgentFailure | Self::ApiFailure => ErrorSeverity::High,
            Self::ProcessingError | Self::NetworkError | Self::TimeoutError | Self::DataError => {
                ErrorSeverity::Medium
            }
            Self::ValidationError | Self::BusinessRuleError => ErrorSeverity::Low,
        }
    }

    pub fn recovery_plan(&self) -> RecoveryPlan {
        let (recovery_type, actions): (&'static str, &'static [&'static str]) = match self {
            Self::AgentFailure => ("agent_restart", &["restart_agent", "reset_task", "notify_customer"]),
            Self::ApiFailure => (
                "api_retry_with_fallback",
                &["retry_api_call", "use_fallback_data", "continue_with_manual"],
            ),
            Self::ValidationError => (
                "request_correction",
                &["request_data_correction", "provide_format_guidance", "offer_assistance"],
            ),
            Self::ProcessingError => (
                "reprocess_with_alternative",
                &["retry_processing", "use_alternative_method", "simplify_process"],
            ),
            Self::NetworkError => {
                ("network_retry", &["retry_connection", "use_cached_data", "wait_and_retry"])
            }
            Self::TimeoutError => (
                "timeout_retry",
                &["increase_timeout", "retry_operation", "use_async_processing"],
            ),
            Self::BusinessRuleError => (
                "provide_alternatives",
                &["explain_rules", "offer_alternatives", "suggest_modifications"],
            ),
            Self::DataError => (
                "data_correction",
                &["request_data_verification", "use_default_values", "manual_data_entry"],
            ),
            Self::SystemError => {
                ("system_recovery", &["restart_service", "use_backup_system", "escalate_to_admin"])
            }
        };

        RecoveryPlan {
            recovery_type,
            actions,
            retry_possible: true,
            escalation_required: matches!(self, Self::SystemError),
        }
    }

    /// Customer-facing text, optionally narrowed by an agent type, API name, or field.
    pub fn customer_message(&self, specific: Option<&str>) -> &'static str {
        let specific = specific.map(|value| value.trim().to_ascii_lowercase());
        let specific = specific.as_deref();

        match (self, specific) {
            (Self::AgentFailure, Some("sales")) => {
                "I'm having trouble with the loan calculation. Let me get you connected with our loan specialist."
            }
            (Self::AgentFailure, Some("verification")) => {
                "There's a temporary issue with verification. Let me try an alternative approach."
            }
            (Self::AgentFailure, Some("underwriting")) => {
                "I'm experiencing difficulty with the approval process. Please give me a moment to resolve this."
            }
            (Self::AgentFailure, _) => {
                "I apologize, but I'm experiencing a temporary issue. Let me try to help you in a different way."
            }
            (Self::ApiFailure, Some("crm")) => {
                "I'm unable to access your customer information at the moment. Could you please provide your details manually?"
            }
            (Self::ApiFailure, Some("credit_bureau")) => {
                "I'm having difficulty checking your credit score. We can proceed with alternative verification methods."
            }
            (Self::ApiFailure, Some("offer_mart")) => {
                "I'm unable to access your pre-approved offers right now. Let me calculate options based on standard criteria."
            }
            (Self::ApiFailure, _) => {
                "I'm having trouble accessing some information right now. Let me try again in a moment."
            }
            (Self::ValidationError, Some("amount")) => {
                "The loan amount you've entered seems unusual. Could you please confirm the amount?"
            }
            (Self::ValidationError, Some("tenure")) => {
                "The tenure you've selected isn't available. Let me show you the available options."
            }
            (Self::ValidationError, _) => {
                "There seems to be an issue with the information provided. Could you please check and try again?"
            }
            (Self::ProcessingError, Some("calculation")) => {
                "There's an issue with the loan calculations. Let me recalculate this for you."
            }
            (Self::ProcessingError, _) => {
                "I'm having trouble processing your request. Let me try a different approach."
            }
            (Self::NetworkError, Some("timeout")) => {
                "The request is taking longer than expected. Let me try again with a different approach."
            }
            (Self::NetworkError, _) => {
                "I'm experiencing connectivity issues. Please bear with me while I resolve this."
            }
            (Self::TimeoutError, Some("api_timeout")) => {
                "I'm having trouble getting a response from our systems. Let me try an alternative method."
            }
            (Self::TimeoutError, _) => {
                "The operation is taking longer than expected. Let me try again."
            }
            (Self::BusinessRuleError, Some("eligibility")) => {
                "Based on our current criteria, there are some eligibility concerns. Let me explain the alternatives."
            }
            (Self::BusinessRuleError, Some("limits")) => {
                "The requested amount exceeds our current limits. Let me show you what's available."
            }
            (Self::BusinessRuleError, _) => {
                "There's an issue with the loan criteria. Let me explain the available options."
            }
            (Self::DataError, Some("missing_data")) => {
                "Some required information is missing. Could you please provide the additional details?"
            }
            (Self::DataError, _) => {
                "There seems to be an issue with the data. Could you please verify the information?"
            }
            (Self::SystemError, Some("service_unavailable")) => {
                "Some of our services are temporarily unavailable. Let me try alternative methods."
            }
            (Self::SystemError, _) => {
                "I'm experiencing a technical issue. Let me try to resolve this for you."
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecoveryPlan {
    pub recovery_type: &'static str,
    pub actions: &'static [&'static str],
    pub retry_possible: bool,
    pub escalation_required: bool,
}

/// Correlation fields attached to a handled error.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub session_id: Option<SessionId>,
    pub agent_type: Option<AgentType>,
    pub task_id: Option<TaskId>,
    pub stage: Option<ConversationStage>,
}

impl ErrorContext {
    pub fn for_session(session_id: SessionId) -> Self {
        Self { session_id: Some(session_id), ..Self::default() }
    }

    pub fn with_agent(mut self, agent_type: AgentType) -> Self {
        self.agent_type = Some(agent_type);
        self
    }

    pub fn with_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_stage(mut self, stage: ConversationStage) -> Self {
        self.stage = Some(stage);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ErrorHandlingResult {
    pub handled: bool,
    pub error_id: String,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub customer_message: String,
    pub recovery_type: String,
    pub recovery_actions: Vec<String>,
    pub escalation_required: bool,
    pub retry_possible: bool,
}

impl ErrorHandlingResult {
    /// Operator-facing log entry for the conversation context.
    pub fn error_log(&self, internal_message: &str) -> ErrorLog {
        ErrorLog::new(format!("Error ID {}: {internal_message}", self.error_id), self.severity)
            .with_context("error_id", self.error_id.clone())
            .with_context("error_category", self.category.as_str())
            .with_context("recovery_strategy", self.recovery_type.clone())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ErrorStatistics {
    pub total_errors: u64,
    pub errors_by_category: BTreeMap<ErrorCategory, u64>,
    pub escalations: u64,
}

#[derive(Debug, Default)]
pub struct ErrorHandler {
    stats: Mutex<ErrorStatistics>,
}

impl ErrorHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(
        &self,
        category: ErrorCategory,
        specific: Option<&str>,
        internal_message: &str,
        context: &ErrorContext,
    ) -> ErrorHandlingResult {
        let error_id = Uuid::new_v4().to_string();
        let plan = category.recovery_plan();

        let category_count = self.with_stats(|stats| {
            stats.total_errors += 1;
            let count = stats.errors_by_category.entry(category).or_insert(0);
            *count += 1;
            *count
        });
        let escalation_required =
            plan.escalation_required || category_count > CATEGORY_ESCALATION_THRESHOLD;
        if escalation_required {
            self.with_stats(|stats| stats.escalations += 1);
        }

        error!(
            event_name = "error.handled",
            error_id = %error_id,
            category = category.as_str(),
            severity = category.severity().as_str(),
            session_id = context.session_id.as_ref().map(SessionId::as_str).unwrap_or("unknown"),
            agent_type = context.agent_type.map(|agent| agent.as_str()).unwrap_or("unknown"),
            task_id = context.task_id.as_ref().map(|id| id.0.as_str()).unwrap_or("unknown"),
            stage = context.stage.map(|stage| stage.as_str()).unwrap_or("unknown"),
            escalation_required,
            error = internal_message,
            "error handled"
        );

        ErrorHandlingResult {
            handled: true,
            error_id,
            category,
            severity: category.severity(),
            customer_message: category.customer_message(specific).to_string(),
            recovery_type: plan.recovery_type.to_string(),
            recovery_actions: plan.actions.iter().map(|action| action.to_string()).collect(),
            escalation_required,
            retry_possible: plan.retry_possible,
        }
    }

    pub fn handle_agent_error(
        &self,
        agent_type: AgentType,
        internal_message: &str,
        context: &ErrorContext,
    ) -> ErrorHandlingResult {
        let context = context.clone().with_agent(agent_type);
        self.handle(
            ErrorCategory::AgentFailure,
            Some(agent_type.as_str()),
            internal_message,
            &context,
        )
    }

    pub fn handle_api_error(
        &self,
        api_name: &str,
        internal_message: &str,
        context: &ErrorContext,
    ) -> ErrorHandlingResult {
        self.handle(ErrorCategory::ApiFailure, Some(api_name), internal_message, context)
    }

    pub fn statistics(&self) -> ErrorStatistics {
        self.with_stats(|stats| stats.clone())
    }

    fn with_stats<T>(&self, f: impl FnOnce(&mut ErrorStatistics) -> T) -> T {
        match self.stats.lock() {
            Ok(mut stats) => f(&mut stats),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

pub fn generic_customer_message() -> &'static str {
    GENERIC_CUSTOMER_MESSAGE
}
