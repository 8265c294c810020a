use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use loanflow_core::context::ContextUpdate;
use loanflow_core::domain::conversation::{AgentType, ConversationStage, SessionId};
use loanflow_core::error_handler::{ErrorContext, ErrorHandler};

use crate::session::{SessionError, SessionManager};

pub const DEFAULT_ESCALATION_THRESHOLD: usize = 3;
const RECENT_WINDOW_MINUTES: i64 = 60;
const HEALTH_PENALTY_PER_FAILURE: u32 = 20;
const DEGRADED_AT: usize = 3;
const CRITICAL_AT: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    RetrySameAgent,
    ReassignAgent,
    RestartAgent,
    NotifyCustomer,
    EscalateToHuman,
}

impl RecoveryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RetrySameAgent => "retry_same_agent",
            Self::ReassignAgent => "reassign_agent",
            Self::RestartAgent => "restart_agent",
            Self::NotifyCustomer => "notify_customer",
            Self::EscalateToHuman => "escalate_to_human",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    pub timestamp: DateTime<Utc>,
    pub session_id: SessionId,
    pub error_details: String,
    pub stage: Option<ConversationStage>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WorkerErrorResponse {
    pub error_handled: bool,
    pub error_id: String,
    pub customer_message: String,
    pub recovery_actions: Vec<RecoveryAction>,
    pub escalated: bool,
    pub next_stage: ConversationStage,
    pub reassign_to: Option<AgentType>,
    pub failure_count: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerHealthStatus {
    Healthy,
    Degraded,
    Critical,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WorkerHealth {
    pub healthy: bool,
    pub error_count: u32,
    pub total_failures: usize,
    pub recent_failures: usize,
    pub health_score: u32,
    pub status: WorkerHealthStatus,
    pub escalation_needed: bool,
}

const ESCALATION_MESSAGE: &str = "I'm connecting you with one of our loan specialists who can help you further. Thank you for your patience.";

/// Where a session goes back to when a worker cannot finish, and who picks it up.
pub fn alternative_route(agent_type: AgentType) -> (ConversationStage, AgentType) {
    match agent_type {
        AgentType::Sales => (ConversationStage::InformationCollection, AgentType::Master),
        AgentType::Verification => (ConversationStage::SalesNegotiation, AgentType::Sales),
        AgentType::Underwriting => (ConversationStage::Verification, AgentType::Verification),
        AgentType::Master => (ConversationStage::ErrorHandling, AgentType::Master),
    }
}

/// The worker that owns a stage, if any.
pub fn agent_for_stage(stage: ConversationStage) -> AgentType {
    match stage {
        ConversationStage::SalesNegotiation => AgentType::Sales,
        ConversationStage::Verification => AgentType::Verification,
        ConversationStage::Underwriting
        | ConversationStage::DocumentUpload
        | ConversationStage::SanctionGeneration => AgentType::Underwriting,
        ConversationStage::Initiation
        | ConversationStage::InformationCollection
        | ConversationStage::Completion
        | ConversationStage::ErrorHandling => AgentType::Master,
    }
}

/// Supervises worker agents for every session and turns their failures into
/// customer-safe messages and recovery steps.
pub struct MasterAgent {
    agent_id: String,
    sessions: Arc<SessionManager>,
    error_handler: Arc<ErrorHandler>,
    escalation_threshold: usize,
    failures: Mutex<HashMap<AgentType, Vec<FailureRecord>>>,
}

impl MasterAgent {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        let hex = Uuid::new_v4().simple().to_string();
        let error_handler = sessions.error_handler().clone();
        Self {
            agent_id: format!("{}_{}", AgentType::Master.as_str(), &hex[..8]),
            sessions,
            error_handler,
            escalation_threshold: DEFAULT_ESCALATION_THRESHOLD,
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_escalation_threshold(mut self, threshold: usize) -> Self {
        self.escalation_threshold = threshold.max(1);
        self
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub async fn handle_worker_agent_error(
        &self,
        session_id: &SessionId,
        failed_agent: AgentType,
        error_details: &str,
    ) -> Result<WorkerErrorResponse, SessionError> {
        let stage = self
            .sessions
            .get_session_context(session_id)
            .await?
            .map(|context| context.conversation_stage);
        let failure_count = self.record_failure(failed_agent, FailureRecord {
            timestamp: Utc::now(),
            session_id: session_id.clone(),
            error_details: error_details.to_string(),
            stage,
        });

        let mut error_context = ErrorContext::for_session(session_id.clone());
        if let Some(stage) = stage {
            error_context = error_context.with_stage(stage);
        }
        let handling =
            self.error_handler.handle_agent_error(failed_agent, error_details, &error_context);

        let escalated =
            failure_count >= self.escalation_threshold || handling.escalation_required;
        let response = if escalated {
            let escalation = json!({
                "agent_type": failed_agent.as_str(),
                "error_id": handling.error_id,
                "failure_count": failure_count,
                "escalated_at": Utc::now().to_rfc3339(),
            });
            self.sessions
                .contexts()
                .update_context(
                    session_id,
                    ContextUpdate::new()
                        .with_agent(AgentType::Master)
                        .with_stage(ConversationStage::ErrorHandling)
                        .collect("escalation_required", escalation),
                )
                .await?;
            warn!(
                event_name = "master.worker.escalated",
                correlation_id = %session_id,
                session_id = %session_id,
                agent_type = failed_agent.as_str(),
                error_id = %handling.error_id,
                failure_count,
                "worker failure escalated to a human"
            );
            WorkerErrorResponse {
                error_handled: true,
                error_id: handling.error_id,
                customer_message: ESCALATION_MESSAGE.to_string(),
                recovery_actions: vec![
                    RecoveryAction::EscalateToHuman,
                    RecoveryAction::NotifyCustomer,
                ],
                escalated: true,
                next_stage: ConversationStage::ErrorHandling,
                reassign_to: None,
                failure_count,
            }
        } else {
            let (next_stage, fallback_agent) = alternative_route(failed_agent);
            let mut recovery_actions = Vec::new();
            let mut reassign_to = None;
            if failure_count <= 1 {
                recovery_actions.push(RecoveryAction::RetrySameAgent);
            } else {
                if self.sessions.restart_agent(session_id, failed_agent).await {
                    recovery_actions.push(RecoveryAction::RestartAgent);
                }
                recovery_actions.push(RecoveryAction::ReassignAgent);
                reassign_to = Some(fallback_agent);
            }
            recovery_actions.push(RecoveryAction::NotifyCustomer);

            self.sessions.update_conversation_stage(session_id, next_stage).await?;
            info!(
                event_name = "master.worker.recovered",
                correlation_id = %session_id,
                session_id = %session_id,
                agent_type = failed_agent.as_str(),
                error_id = %handling.error_id,
                next_stage = next_stage.as_str(),
                failure_count,
                "worker failure routed to recovery"
            );
            WorkerErrorResponse {
                error_handled: true,
                error_id: handling.error_id,
                customer_message: handling.customer_message,
                recovery_actions,
                escalated: false,
                next_stage,
                reassign_to,
                failure_count,
            }
        };

        Ok(response)
    }

    /// Health of every worker registered for the session, keyed by agent type.
    pub async fn get_worker_agent_health_status(
        &self,
        session_id: &SessionId,
    ) -> BTreeMap<AgentType, WorkerHealth> {
        let since = Utc::now() - ChronoDuration::minutes(RECENT_WINDOW_MINUTES);
        let failures = self.failures_snapshot();

        self.sessions
            .registered_agents(session_id)
            .await
            .into_iter()
            .filter(|entry| entry.report.agent_type != AgentType::Master)
            .map(|entry| {
                let agent_type = entry.report.agent_type;
                let records: Vec<&FailureRecord> = failures
                    .get(&agent_type)
                    .map(|records| {
                        records.iter().filter(|record| &record.session_id == session_id).collect()
                    })
                    .unwrap_or_default();
                let total_failures = records.len();
                let recent_failures =
                    records.iter().filter(|record| record.timestamp >= since).count();
                let penalty = HEALTH_PENALTY_PER_FAILURE.saturating_mul(recent_failures as u32);
                let status = if recent_failures < DEGRADED_AT {
                    WorkerHealthStatus::Healthy
                } else if recent_failures < CRITICAL_AT {
                    WorkerHealthStatus::Degraded
                } else {
                    WorkerHealthStatus::Critical
                };
                let health = WorkerHealth {
                    healthy: entry.healthy,
                    error_count: entry.report.error_count,
                    total_failures,
                    recent_failures,
                    health_score: 100u32.saturating_sub(penalty),
                    status,
                    escalation_needed: !entry.healthy
                        || recent_failures >= self.escalation_threshold,
                };
                (agent_type, health)
            })
            .collect()
    }

    /// Shares `data` from one agent to the next, then makes the receiver current.
    pub async fn coordinate_handoff(
        &self,
        session_id: &SessionId,
        from: AgentType,
        to: AgentType,
        data: Map<String, Value>,
        stage: ConversationStage,
    ) -> Result<bool, SessionError> {
        self.sessions.share_data_between_agents(session_id, from, to, data).await?;
        let switched = self.sessions.switch_agent(session_id, to, stage).await?;
        info!(
            event_name = "master.handoff.coordinated",
            correlation_id = %session_id,
            session_id = %session_id,
            from = from.as_str(),
            to = to.as_str(),
            stage = stage.as_str(),
            switched,
            "handoff coordinated"
        );
        Ok(switched)
    }

    /// Moves to `next` when the flow allows it and hands the session to the stage owner.
    pub async fn advance_stage(
        &self,
        session_id: &SessionId,
        next: ConversationStage,
    ) -> Result<bool, SessionError> {
        let context = self
            .sessions
            .get_session_context(session_id)
            .await?
            .ok_or_else(|| SessionError::SessionNotFound(session_id.clone()))?;
        if !context.conversation_stage.can_transition_to(next) {
            warn!(
                event_name = "master.stage.transition_rejected",
                correlation_id = %session_id,
                session_id = %session_id,
                from = context.conversation_stage.as_str(),
                to = next.as_str(),
                "stage transition not allowed by flow"
            );
            return Ok(false);
        }
        self.sessions.switch_agent(session_id, agent_for_stage(next), next).await
    }

    /// Failures recorded for `agent_type` in `session_id`.
    pub fn failure_count(&self, session_id: &SessionId, agent_type: AgentType) -> usize {
        self.failures_snapshot()
            .get(&agent_type)
            .map(|records| records.iter().filter(|record| &record.session_id == session_id).count())
            .unwrap_or(0)
    }

    fn record_failure(&self, agent_type: AgentType, record: FailureRecord) -> usize {
        let session_id = record.session_id.clone();
        let mut failures = match self.failures.lock() {
            Ok(failures) => failures,
            Err(poisoned) => poisoned.into_inner(),
        };
        let records = failures.entry(agent_type).or_default();
        records.push(record);
        records.iter().filter(|record| record.session_id == session_id).count()
    }

    fn failures_snapshot(&self) -> HashMap<AgentType, Vec<FailureRecord>> {
        match self.failures.lock() {
            Ok(failures) => failures.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}
