use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use loanflow_core::context::ContextUpdate;
use loanflow_core::domain::conversation::{AgentType, ConversationContext, SessionId};
use loanflow_core::domain::task::{AgentTask, TaskId, TaskStatus, TaskType};
use loanflow_core::error_handler::{
    ErrorCategory, ErrorContext, ErrorHandler, ErrorHandlingResult,
};
use loanflow_core::errors::DomainError;
use loanflow_core::external::ExternalApiService;
use loanflow_core::loan::LoanError;
use loanflow_core::resilience::ResilienceError;

use crate::sales::SalesAgent;
use crate::underwriting::UnderwritingAgent;
use crate::verification::VerificationAgent;

const MAX_HEALTHY_ERRORS: u32 = 10;
const MAX_RECOVERY_ATTEMPTS: u32 = 2;
const MAX_ERROR_STATE_SECS: i64 = 300;
const RECENT_ERROR_LIMIT: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Running,
    Completed,
    Error,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid task input: {0}")]
    Validation(String),
    #[error("{agent} agent cannot run {task} tasks", task = .task_type.as_str())]
    UnsupportedTask { agent: AgentType, task_type: TaskType },
    #[error(transparent)]
    Loan(#[from] LoanError),
    #[error("integration failure: {0}")]
    Integration(#[from] ResilienceError),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl AgentError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation(_) | Self::Loan(_) => ErrorCategory::ValidationError,
            Self::Integration(_) => ErrorCategory::ApiFailure,
            Self::UnsupportedTask { .. } | Self::Domain(_) => ErrorCategory::AgentFailure,
        }
    }
}

/// A failed task after the agent finished its bookkeeping.
#[derive(Debug, Error)]
#[error("task {task} failed: {error}", task = .task_id.0)]
pub struct TaskFailure {
    pub task_id: TaskId,
    pub error: AgentError,
    pub handling: ErrorHandlingResult,
}

/// Read-only view of the conversation handed to a running task.
#[derive(Clone, Debug)]
pub struct TaskContext {
    snapshot: ConversationContext,
}

impl TaskContext {
    pub fn new(snapshot: ConversationContext) -> Self {
        Self { snapshot }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.snapshot.session_id
    }

    pub fn customer_id(&self) -> Option<&str> {
        self.snapshot.customer_id.as_deref()
    }

    pub fn collected(&self, key: &str) -> Option<&Value> {
        self.snapshot.collected_value(key)
    }

    pub fn shared_from(&self, producer: AgentType, consumer: AgentType) -> Map<String, Value> {
        self.snapshot.shared_data.get(producer, consumer)
    }

    pub fn error_context(&self) -> ErrorContext {
        ErrorContext::for_session(self.snapshot.session_id.clone())
            .with_stage(self.snapshot.conversation_stage)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub result: Value,
    pub updates: ContextUpdate,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AgentStatusReport {
    pub agent_id: String,
    pub agent_type: AgentType,
    pub status: AgentStatus,
    pub current_task_id: Option<String>,
    pub error_count: u32,
    pub task_history_count: usize,
    pub recovery_attempts: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TaskErrorRecord {
    pub task_id: String,
    pub task_type: TaskType,
    pub error: String,
    pub failed_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ErrorSummary {
    pub agent_id: String,
    pub agent_type: AgentType,
    pub status: AgentStatus,
    pub error_count: u32,
    pub healthy: bool,
    pub recent_errors: Vec<TaskErrorRecord>,
}

pub enum AgentKind {
    Sales(SalesAgent),
    Verification(VerificationAgent),
    Underwriting(UnderwritingAgent),
}

impl AgentKind {
    pub fn agent_type(&self) -> AgentType {
        match self {
            Self::Sales(_) => AgentType::Sales,
            Self::Verification(_) => AgentType::Verification,
            Self::Underwriting(_) => AgentType::Underwriting,
        }
    }
}

/// A worker agent: its task logic plus the bookkeeping every worker shares.
pub struct Agent {
    agent_id: String,
    kind: AgentKind,
    status: AgentStatus,
    current_task: Option<TaskId>,
    error_count: u32,
    recovery_attempts: u32,
    error_since: Option<DateTime<Utc>>,
    task_history: Vec<AgentTask>,
    outbox: Map<String, Value>,
    error_handler: Arc<ErrorHandler>,
}

impl Agent {
    pub fn new(kind: AgentKind, error_handler: Arc<ErrorHandler>) -> Self {
        let hex = Uuid::new_v4().simple().to_string();
        Self {
            agent_id: format!("{}_{}", kind.agent_type().as_str(), &hex[..8]),
            kind,
            status: AgentStatus::Idle,
            current_task: None,
            error_count: 0,
            recovery_attempts: 0,
            error_since: None,
            task_history: Vec::new(),
            outbox: Map::new(),
            error_handler,
        }
    }

    pub fn sales(error_handler: Arc<ErrorHandler>) -> Self {
        Self::new(AgentKind::Sales(SalesAgent::new()), error_handler)
    }

    pub fn verification(api: Arc<ExternalApiService>, error_handler: Arc<ErrorHandler>) -> Self {
        Self::new(AgentKind::Verification(VerificationAgent::new(api)), error_handler)
    }

    pub fn underwriting(api: Arc<ExternalApiService>, error_handler: Arc<ErrorHandler>) -> Self {
        Self::new(AgentKind::Underwriting(UnderwritingAgent::new(api)), error_handler)
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn agent_type(&self) -> AgentType {
        self.kind.agent_type()
    }

    pub fn status(&self) -> AgentStatus {
        self.status
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn task_history(&self) -> &[AgentTask] {
        &self.task_history
    }

    pub fn can_execute_task(&self, task_type: TaskType) -> bool {
        match (&self.kind, task_type) {
            (AgentKind::Sales(_), TaskType::Sales) => true,
            (AgentKind::Verification(_), TaskType::Verification) => true,
            (AgentKind::Underwriting(_), TaskType::Underwriting | TaskType::DocumentGeneration) => {
                true
            }
            (AgentKind::Sales(_), _)
            | (AgentKind::Verification(_), _)
            | (AgentKind::Underwriting(_), _) => false,
        }
    }

    pub fn create_task(&self, task_type: TaskType, input: Map<String, Value>) -> AgentTask {
        AgentTask::new(task_type, input)
    }

    /// Runs `task` to a terminal state. Failures are recorded on the agent and then
    /// returned, never swallowed.
    pub async fn execute_task(
        &mut self,
        mut task: AgentTask,
        context: &TaskContext,
    ) -> Result<TaskOutcome, TaskFailure> {
        if !self.can_execute_task(task.task_type) {
            let error =
                AgentError::UnsupportedTask { agent: self.agent_type(), task_type: task.task_type };
            return Err(self.fail_task(task, error, context));
        }
        if let Err(error) = task.start() {
            return Err(self.fail_task(task, error.into(), context));
        }

        self.status = AgentStatus::Running;
        self.current_task = Some(task.id.clone());
        info!(
            event_name = "agent.task.started",
            correlation_id = %context.session_id(),
            session_id = %context.session_id(),
            agent_type = self.agent_type().as_str(),
            agent_id = %self.agent_id,
            task_id = %task.id.0,
            task_type = task.task_type.as_str(),
            "agent task started"
        );

        let outcome = match &self.kind {
            AgentKind::Sales(agent) => agent.execute(&task, context),
            AgentKind::Verification(agent) => agent.execute(&task, context).await,
            AgentKind::Underwriting(agent) => agent.execute(&task, context).await,
        };

        let (result, updates) = match outcome {
            Ok(outcome) => outcome,
            Err(error) => return Err(self.fail_task(task, error, context)),
        };
        if let Err(error) = task.complete(result.clone()) {
            return Err(self.fail_task(task, error.into(), context));
        }

        self.status = AgentStatus::Completed;
        self.current_task = None;
        self.error_since = None;
        let task_id = task.id.clone();
        info!(
            event_name = "agent.task.completed",
            correlation_id = %context.session_id(),
            session_id = %context.session_id(),
            agent_type = self.agent_type().as_str(),
            task_id = %task_id.0,
            "agent task completed"
        );
        self.task_history.push(task);

        Ok(TaskOutcome { task_id, result, updates })
    }

    fn fail_task(
        &mut self,
        mut task: AgentTask,
        error: AgentError,
        context: &TaskContext,
    ) -> TaskFailure {
        if task.status == TaskStatus::Pending {
            task.start().ok();
        }
        task.fail(error.to_string()).ok();

        let error_context = context.error_context().with_task(task.id.clone());
        let handling = self.handle_error(&error, &error_context);
        self.current_task = None;
        warn!(
            event_name = "agent.task.failed",
            correlation_id = %context.session_id(),
            session_id = %context.session_id(),
            agent_type = self.agent_type().as_str(),
            task_id = %task.id.0,
            error_id = %handling.error_id,
            "agent task failed"
        );

        let task_id = task.id.clone();
        self.task_history.push(task);
        TaskFailure { task_id, error, handling }
    }

    pub fn handle_error(
        &mut self,
        error: &AgentError,
        context: &ErrorContext,
    ) -> ErrorHandlingResult {
        self.error_count += 1;
        self.status = AgentStatus::Error;
        self.error_since.get_or_insert_with(Utc::now);

        let agent_type = self.agent_type();
        let context = context.clone().with_agent(agent_type);
        match error.category() {
            ErrorCategory::AgentFailure => {
                self.error_handler.handle_agent_error(agent_type, &error.to_string(), &context)
            }
            category => self.error_handler.handle(category, None, &error.to_string(), &context),
        }
    }

    pub fn is_healthy(&self) -> bool {
        if self.error_count > MAX_HEALTHY_ERRORS || self.recovery_attempts >= MAX_RECOVERY_ATTEMPTS
        {
            return false;
        }
        match (self.status, self.error_since) {
            (AgentStatus::Error, Some(since)) => {
                (Utc::now() - since).num_seconds() <= MAX_ERROR_STATE_SECS
            }
            _ => true,
        }
    }

    pub fn get_status(&self) -> AgentStatusReport {
        AgentStatusReport {
            agent_id: self.agent_id.clone(),
            agent_type: self.agent_type(),
            status: self.status,
            current_task_id: self.current_task.as_ref().map(|id| id.0.clone()),
            error_count: self.error_count,
            task_history_count: self.task_history.len(),
            recovery_attempts: self.recovery_attempts,
        }
    }

    pub fn get_error_summary(&self) -> ErrorSummary {
        let recent_errors = self
            .task_history
            .iter()
            .rev()
            .filter(|task| task.status == TaskStatus::Failed)
            .take(RECENT_ERROR_LIMIT)
            .map(|task| TaskErrorRecord {
                task_id: task.id.0.clone(),
                task_type: task.task_type,
                error: task.error.clone().unwrap_or_default(),
                failed_at: task.completed_at,
            })
            .collect();

        ErrorSummary {
            agent_id: self.agent_id.clone(),
            agent_type: self.agent_type(),
            status: self.status,
            error_count: self.error_count,
            healthy: self.is_healthy(),
            recent_errors,
        }
    }

    /// Forgets everything, error statistics included.
    pub fn reset_agent(&mut self) {
        self.status = AgentStatus::Idle;
        self.current_task = None;
        self.error_count = 0;
        self.recovery_attempts = 0;
        self.error_since = None;
        self.task_history.clear();
        self.outbox.clear();
    }

    /// Back to idle; error statistics survive and the attempt is counted.
    pub fn restart(&mut self) {
        self.recovery_attempts += 1;
        self.status = AgentStatus::Idle;
        self.current_task = None;
        self.error_since = None;
        info!(
            event_name = "agent.lifecycle.restarted",
            correlation_id = %self.agent_id,
            agent_type = self.agent_type().as_str(),
            recovery_attempts = self.recovery_attempts,
            "agent restarted"
        );
    }

    /// Queues a value for the session's collected data; published after the next task.
    pub fn share_context_data(&mut self, key: impl Into<String>, value: Value) {
        self.outbox.insert(key.into(), value);
    }

    pub fn get_shared_data(&self, key: &str) -> Option<&Value> {
        self.outbox.get(key)
    }

    pub fn take_shared(&mut self) -> Map<String, Value> {
        std::mem::take(&mut self.outbox)
    }
}

pub(crate) fn read_number(input: &Map<String, Value>, key: &str) -> Option<f64> {
    match input.get(key)? {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().replace(',', "").parse().ok(),
        _ => None,
    }
}

pub(crate) fn read_text(input: &Map<String, Value>, key: &str) -> Option<String> {
    input
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

pub(crate) fn value_number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn to_decimal(value: f64, field: &str) -> Result<Decimal, AgentError> {
    loanflow_core::loan::decimal_from_f64(value)
        .map(|decimal| decimal.round_dp(2))
        .ok_or_else(|| AgentError::Validation(format!("{field} is not a usable number")))
}

/// Whole amounts become JSON integers, anything else a float.
pub(crate) fn money_json(value: Decimal) -> Value {
    if value.fract().is_zero() {
        if let Some(whole) = value.to_i64() {
            return Value::from(whole);
        }
    }
    Value::from(loanflow_core::loan::decimal_to_f64(value))
}

pub(crate) fn rate_json(value: Decimal) -> Value {
    Value::from(loanflow_core::loan::decimal_to_f64(value))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{json, Map, Value};

    use loanflow_core::domain::conversation::{ConversationContext, SessionId};
    use loanflow_core::domain::task::{TaskStatus, TaskType};
    use loanflow_core::error_handler::{ErrorCategory, ErrorHandler};

    use super::{money_json, Agent, AgentError, AgentStatus, TaskContext};

    fn context() -> TaskContext {
        TaskContext::new(ConversationContext::new(SessionId::from("session_feedfacecafe"), None))
    }

    fn input(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[tokio::test]
    async fn completed_task_lands_in_history() {
        let mut agent = Agent::sales(Arc::new(ErrorHandler::new()));
        let task = agent.create_task(TaskType::Sales, input(json!({"amount": 50000})));

        let outcome = agent.execute_task(task, &context()).await.expect("sales task");

        assert_eq!(outcome.result["status"], json!("approved"));
        assert_eq!(agent.status(), AgentStatus::Completed);
        assert_eq!(agent.task_history().len(), 1);
        assert_eq!(agent.task_history()[0].status, TaskStatus::Completed);
        assert!(agent.agent_id().starts_with("sales_"));
    }

    #[tokio::test]
    async fn failure_is_recorded_then_surfaced() {
        let handler = Arc::new(ErrorHandler::new());
        let mut agent = Agent::sales(handler.clone());
        let task = agent.create_task(TaskType::Sales, Map::new());

        let failure = agent.execute_task(task, &context()).await.expect_err("missing amount");

        assert!(matches!(failure.error, AgentError::Validation(_)));
        assert_eq!(failure.handling.category, ErrorCategory::ValidationError);
        assert!(!failure.handling.customer_message.contains("amount is required"));
        assert_eq!(agent.status(), AgentStatus::Error);
        assert_eq!(agent.error_count(), 1);
        assert_eq!(agent.task_history()[0].status, TaskStatus::Failed);
        assert_eq!(handler.statistics().total_errors, 1);
        assert_eq!(agent.get_error_summary().recent_errors.len(), 1);
    }

    #[tokio::test]
    async fn unsupported_task_type_fails_as_agent_failure() {
        let mut agent = Agent::sales(Arc::new(ErrorHandler::new()));
        assert!(!agent.can_execute_task(TaskType::Underwriting));

        let task = agent.create_task(TaskType::Underwriting, Map::new());
        let failure = agent.execute_task(task, &context()).await.expect_err("unsupported");

        assert!(matches!(failure.error, AgentError::UnsupportedTask { .. }));
        assert_eq!(failure.handling.category, ErrorCategory::AgentFailure);
    }

    #[test]
    fn restarts_keep_statistics_and_count_toward_health() {
        let mut agent = Agent::sales(Arc::new(ErrorHandler::new()));
        let ctx = context().error_context();
        agent.handle_error(&AgentError::Validation("bad".to_string()), &ctx);
        assert!(agent.is_healthy());

        agent.restart();
        assert_eq!(agent.status(), AgentStatus::Idle);
        assert_eq!(agent.error_count(), 1);
        assert!(agent.is_healthy());

        agent.restart();
        assert!(!agent.is_healthy());
        assert_eq!(agent.get_status().recovery_attempts, 2);

        agent.reset_agent();
        assert!(agent.is_healthy());
        assert_eq!(agent.get_status().error_count, 0);
    }

    #[test]
    fn too_many_errors_make_agent_unhealthy() {
        let mut agent = Agent::sales(Arc::new(ErrorHandler::new()));
        let ctx = context().error_context();
        for _ in 0..11 {
            agent.handle_error(&AgentError::Validation("bad".to_string()), &ctx);
        }
        assert!(!agent.is_healthy());
    }

    #[test]
    fn outbox_drains_once() {
        let mut agent = Agent::sales(Arc::new(ErrorHandler::new()));
        agent.share_context_data("preferred_language", json!("en"));
        assert_eq!(agent.get_shared_data("preferred_language"), Some(&json!("en")));

        assert_eq!(agent.take_shared().len(), 1);
        assert!(agent.take_shared().is_empty());
    }

    #[test]
    fn whole_amounts_serialize_as_integers() {
        assert_eq!(money_json(rust_decimal::Decimal::from(80_000)), json!(80000));
        assert_eq!(money_json(rust_decimal::Decimal::new(888_488, 2)), json!(8884.88));
    }
}
