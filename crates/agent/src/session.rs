use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use loanflow_core::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink};
use loanflow_core::context::{
    ContextError, ContextManager, ContextUpdate, SessionStatistics, StoredSessionSummary,
};
use loanflow_core::domain::conversation::{
    AgentType, ConversationContext, ConversationStage, SessionId,
};
use loanflow_core::domain::task::TaskType;
use loanflow_core::error_handler::ErrorHandler;

use crate::agent::{Agent, AgentStatusReport, TaskContext, TaskFailure};

pub const DEFAULT_LIST_LIMIT: usize = 50;
const ACTOR: &str = "session-manager";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session `{0}` not found")]
    SessionNotFound(SessionId),
    #[error("{agent_type} agent is not registered for session `{session_id}`")]
    AgentNotRegistered { session_id: SessionId, agent_type: AgentType },
    #[error("{agent_type} agent cannot execute {task} tasks", task = .task_type.as_str())]
    UnsupportedTask { agent_type: AgentType, task_type: TaskType },
    #[error(transparent)]
    TaskFailed(TaskFailure),
    #[error(transparent)]
    Context(ContextError),
}

impl From<ContextError> for SessionError {
    fn from(error: ContextError) -> Self {
        match error {
            ContextError::NotFound(session_id) => Self::SessionNotFound(session_id),
            other => Self::Context(other),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AgentRegistryStatistics {
    pub sessions_with_agents: usize,
    pub total_registered_agents: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ManagerStatistics {
    #[serde(flatten)]
    pub sessions: SessionStatistics,
    pub agent_registry: AgentRegistryStatistics,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RegisteredAgent {
    pub report: AgentStatusReport,
    pub healthy: bool,
}

type AgentSlot = Arc<Mutex<Agent>>;

/// Session lifecycle, per-session agent registry and task dispatch.
///
/// Agents run under their own lock only. The conversation context is snapshotted before
/// a task and updated once afterwards, so slow external calls never hold the session.
pub struct SessionManager {
    contexts: Arc<ContextManager>,
    agents: RwLock<HashMap<SessionId, HashMap<AgentType, AgentSlot>>>,
    error_handler: Arc<ErrorHandler>,
    audit: Arc<dyn AuditSink>,
    list_limit: usize,
}

impl SessionManager {
    pub fn new(
        contexts: Arc<ContextManager>,
        error_handler: Arc<ErrorHandler>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            contexts,
            agents: RwLock::new(HashMap::new()),
            error_handler,
            audit,
            list_limit: DEFAULT_LIST_LIMIT,
        }
    }

    pub fn with_list_limit(mut self, list_limit: usize) -> Self {
        self.list_limit = list_limit;
        self
    }

    pub fn contexts(&self) -> &Arc<ContextManager> {
        &self.contexts
    }

    pub fn error_handler(&self) -> &Arc<ErrorHandler> {
        &self.error_handler
    }

    pub async fn start_session(
        &self,
        customer_id: Option<String>,
    ) -> Result<ConversationContext, SessionError> {
        let context = self.contexts.create_session(customer_id).await?;
        self.agents.write().await.entry(context.session_id.clone()).or_default();
        self.emit(
            &context.session_id,
            "session.started",
            AuditCategory::Session,
            AuditOutcome::Success,
            &[("customer_id", context.customer_id.clone().unwrap_or_default())],
        );
        Ok(context)
    }

    /// Registers `agent` for the session, replacing any agent of the same type.
    /// Returns false when the session is not active.
    pub async fn register_agent(&self, session_id: &SessionId, agent: Agent) -> bool {
        if !self.contexts.is_active(session_id).await {
            warn!(
                event_name = "session.agent.register_rejected",
                correlation_id = %session_id,
                session_id = %session_id,
                agent_type = agent.agent_type().as_str(),
                "agent registration for unknown session"
            );
            return false;
        }

        let agent_type = agent.agent_type();
        let agent_id = agent.agent_id().to_string();
        self.agents
            .write()
            .await
            .entry(session_id.clone())
            .or_default()
            .insert(agent_type, Arc::new(Mutex::new(agent)));
        self.emit(
            session_id,
            "session.agent_registered",
            AuditCategory::Agent,
            AuditOutcome::Success,
            &[("agent_type", agent_type.as_str().to_string()), ("agent_id", agent_id)],
        );
        true
    }

    pub async fn registered_agent_types(&self, session_id: &SessionId) -> Vec<AgentType> {
        let agents = self.agents.read().await;
        let mut types: Vec<AgentType> =
            agents.get(session_id).map(|slots| slots.keys().copied().collect()).unwrap_or_default();
        types.sort();
        types
    }

    /// Makes `agent_type` current. The master is always available; workers must be registered.
    pub async fn switch_agent(
        &self,
        session_id: &SessionId,
        agent_type: AgentType,
        stage: ConversationStage,
    ) -> Result<bool, SessionError> {
        if agent_type != AgentType::Master && self.agent_slot(session_id, agent_type).await.is_none()
        {
            self.emit(
                session_id,
                "session.agent_switched",
                AuditCategory::Session,
                AuditOutcome::Rejected,
                &[("to", agent_type.as_str().to_string())],
            );
            return Ok(false);
        }

        let (previous, _) = self
            .contexts
            .modify_context(session_id, |context| {
                let previous = context.current_agent;
                context.switch_agent(agent_type, stage);
                previous
            })
            .await?;
        self.emit(
            session_id,
            "session.agent_switched",
            AuditCategory::Session,
            AuditOutcome::Success,
            &[
                ("from", previous.as_str().to_string()),
                ("to", agent_type.as_str().to_string()),
                ("stage", stage.as_str().to_string()),
            ],
        );
        Ok(true)
    }

    /// Runs one task on a registered agent and folds its outcome into the context.
    ///
    /// Gating failures leave the agent untouched. Task failures are logged on the
    /// context, marked terminal and returned.
    pub async fn execute_agent_task(
        &self,
        session_id: &SessionId,
        agent_type: AgentType,
        task_type: TaskType,
        input: Map<String, Value>,
    ) -> Result<Value, SessionError> {
        let slot = self.agent_slot(session_id, agent_type).await.ok_or_else(|| {
            SessionError::AgentNotRegistered { session_id: session_id.clone(), agent_type }
        })?;
        let mut agent = slot.lock().await;
        if !agent.can_execute_task(task_type) {
            return Err(SessionError::UnsupportedTask { agent_type, task_type });
        }

        let task = agent.create_task(task_type, input);
        let task_id = task.id.clone();
        let pending = ContextUpdate { pending_tasks: vec![task_id.clone()], ..ContextUpdate::new() };
        let snapshot = self.contexts.update_context(session_id, pending).await?;

        let outcome = agent.execute_task(task, &TaskContext::new(snapshot)).await;
        let published = agent.take_shared();
        drop(agent);

        match outcome {
            Ok(outcome) => {
                let mut updates = outcome.updates;
                updates.collected_data.extend(published);
                updates.completed_tasks.push(task_id.clone());
                self.contexts.update_context(session_id, updates).await?;
                self.emit(
                    session_id,
                    "session.task_completed",
                    AuditCategory::Task,
                    AuditOutcome::Success,
                    &[
                        ("agent_type", agent_type.as_str().to_string()),
                        ("task_type", task_type.as_str().to_string()),
                        ("task_id", task_id.0.clone()),
                    ],
                );
                Ok(outcome.result)
            }
            Err(failure) => {
                let log = failure
                    .handling
                    .error_log(&failure.error.to_string())
                    .with_context("agent_type", agent_type.as_str())
                    .with_context("task_id", task_id.0.clone());
                let mut updates = ContextUpdate::new().with_error(log);
                updates.collected_data.extend(published);
                updates.completed_tasks.push(task_id.clone());
                self.contexts.update_context(session_id, updates).await?;
                self.emit(
                    session_id,
                    "session.task_failed",
                    AuditCategory::Task,
                    AuditOutcome::Failed,
                    &[
                        ("agent_type", agent_type.as_str().to_string()),
                        ("task_type", task_type.as_str().to_string()),
                        ("task_id", task_id.0.clone()),
                        ("error_id", failure.handling.error_id.clone()),
                    ],
                );
                Err(SessionError::TaskFailed(failure))
            }
        }
    }

    pub async fn share_data_between_agents(
        &self,
        session_id: &SessionId,
        producer: AgentType,
        consumer: AgentType,
        data: Map<String, Value>,
    ) -> Result<(), SessionError> {
        self.contexts.share_context_between_agents(session_id, producer, consumer, data).await?;
        Ok(())
    }

    pub async fn get_shared_data(
        &self,
        session_id: &SessionId,
        consumer: AgentType,
        producer: AgentType,
    ) -> Result<Map<String, Value>, SessionError> {
        Ok(self.contexts.get_shared_data(session_id, consumer, producer).await?)
    }

    /// Marks the conversation complete and drops it from memory. The durable record stays.
    pub async fn end_session(&self, session_id: &SessionId) -> Result<bool, SessionError> {
        match self
            .contexts
            .modify_context(session_id, |context| context.set_stage(ConversationStage::Completion))
            .await
        {
            Ok(_) => {}
            Err(ContextError::NotFound(_)) => return Ok(false),
            Err(error) => return Err(error.into()),
        }

        let removed_agents =
            self.agents.write().await.remove(session_id).map(|slots| slots.len()).unwrap_or(0);
        self.contexts.remove_from_cache(session_id).await;
        self.emit(
            session_id,
            "session.ended",
            AuditCategory::Session,
            AuditOutcome::Success,
            &[("released_agents", removed_agents.to_string())],
        );
        Ok(true)
    }

    pub async fn get_session_statistics(&self) -> ManagerStatistics {
        let sessions = self.contexts.get_session_statistics().await;
        let agents = self.agents.read().await;
        let agent_registry = AgentRegistryStatistics {
            sessions_with_agents: agents.values().filter(|slots| !slots.is_empty()).count(),
            total_registered_agents: agents.values().map(HashMap::len).sum(),
        };
        ManagerStatistics { sessions, agent_registry }
    }

    pub async fn get_session_context(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<ConversationContext>, SessionError> {
        Ok(self.contexts.get_context(session_id).await?)
    }

    pub async fn update_conversation_stage(
        &self,
        session_id: &SessionId,
        stage: ConversationStage,
    ) -> Result<ConversationContext, SessionError> {
        Ok(self.contexts.update_context(session_id, ContextUpdate::new().with_stage(stage)).await?)
    }

    pub async fn add_session_data(
        &self,
        session_id: &SessionId,
        key: &str,
        value: Value,
    ) -> Result<(), SessionError> {
        self.contexts.update_context(session_id, ContextUpdate::new().collect(key, value)).await?;
        Ok(())
    }

    pub async fn get_session_data(
        &self,
        session_id: &SessionId,
        key: &str,
    ) -> Result<Option<Value>, SessionError> {
        let context = self
            .contexts
            .get_context(session_id)
            .await?
            .ok_or_else(|| SessionError::SessionNotFound(session_id.clone()))?;
        Ok(context.collected_value(key).cloned())
    }

    /// Brings a session back from durable storage. Agents must be registered again.
    pub async fn recover_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<ConversationContext>, SessionError> {
        let Some(context) = self.contexts.recover_context(session_id).await? else {
            return Ok(None);
        };
        self.agents.write().await.entry(session_id.clone()).or_default();
        self.emit(
            session_id,
            "session.recovered",
            AuditCategory::Session,
            AuditOutcome::Success,
            &[("stage", context.conversation_stage.as_str().to_string())],
        );
        Ok(Some(context))
    }

    pub async fn restart_agent(&self, session_id: &SessionId, agent_type: AgentType) -> bool {
        let Some(slot) = self.agent_slot(session_id, agent_type).await else {
            return false;
        };
        slot.lock().await.restart();
        info!(
            event_name = "session.agent.restarted",
            correlation_id = %session_id,
            session_id = %session_id,
            agent_type = agent_type.as_str(),
            "worker agent restarted"
        );
        true
    }

    pub async fn agent_status(
        &self,
        session_id: &SessionId,
        agent_type: AgentType,
    ) -> Option<AgentStatusReport> {
        let slot = self.agent_slot(session_id, agent_type).await?;
        let agent = slot.lock().await;
        Some(agent.get_status())
    }

    pub async fn registered_agents(&self, session_id: &SessionId) -> Vec<RegisteredAgent> {
        let slots: Vec<AgentSlot> = {
            let agents = self.agents.read().await;
            agents.get(session_id).map(|slots| slots.values().cloned().collect()).unwrap_or_default()
        };

        let mut registered = Vec::with_capacity(slots.len());
        for slot in slots {
            let agent = slot.lock().await;
            registered.push(RegisteredAgent { report: agent.get_status(), healthy: agent.is_healthy() });
        }
        registered.sort_by_key(|entry| entry.report.agent_type);
        registered
    }

    /// Active sessions, newest first.
    pub async fn list_active_sessions(
        &self,
        customer_id: Option<&str>,
        limit: Option<usize>,
    ) -> Vec<StoredSessionSummary> {
        let mut contexts: Vec<ConversationContext> = self
            .contexts
            .active_contexts()
            .await
            .into_iter()
            .filter(|context| {
                customer_id.map_or(true, |wanted| context.customer_id.as_deref() == Some(wanted))
            })
            .collect();
        contexts.sort_by(|left, right| right.updated_at.cmp(&left.updated_at));
        contexts
            .iter()
            .take(limit.unwrap_or(self.list_limit))
            .map(StoredSessionSummary::from)
            .collect()
    }

    /// Drops idle sessions and their agents from memory.
    pub async fn cleanup_expired_sessions(&self, timeout: Option<Duration>) -> Vec<SessionId> {
        let expired = self.contexts.cleanup_expired_sessions(timeout).await;
        if !expired.is_empty() {
            let mut agents = self.agents.write().await;
            for session_id in &expired {
                agents.remove(session_id);
            }
        }
        expired
    }

    async fn agent_slot(&self, session_id: &SessionId, agent_type: AgentType) -> Option<AgentSlot> {
        self.agents.read().await.get(session_id)?.get(&agent_type).cloned()
    }

    fn emit(
        &self,
        session_id: &SessionId,
        event_type: &str,
        category: AuditCategory,
        outcome: AuditOutcome,
        metadata: &[(&str, String)],
    ) {
        let event = metadata.iter().fold(
            AuditEvent::for_session(session_id, event_type, category, ACTOR, outcome),
            |event, (key, value)| event.with_metadata(*key, value.clone()),
        );
        self.audit.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::{json, Map, Value};

    use loanflow_core::audit::InMemoryAuditSink;
    use loanflow_core::context::{ContextManager, ContextStore, InMemoryContextStore};
    use loanflow_core::domain::conversation::{AgentType, ConversationStage, SessionId};
    use loanflow_core::domain::task::TaskType;
    use loanflow_core::error_handler::ErrorHandler;

    use super::{SessionError, SessionManager};
    use crate::agent::Agent;

    fn manager() -> (SessionManager, InMemoryAuditSink) {
        let store = Arc::new(InMemoryContextStore::new());
        let contexts = Arc::new(ContextManager::new(store, Duration::from_secs(30 * 60)));
        let audit = InMemoryAuditSink::default();
        let manager =
            SessionManager::new(contexts, Arc::new(ErrorHandler::new()), Arc::new(audit.clone()));
        (manager, audit)
    }

    fn input(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[tokio::test]
    async fn registering_for_unknown_session_is_refused() {
        let (manager, _) = manager();
        let handler = manager.error_handler().clone();
        let registered =
            manager.register_agent(&SessionId::from("session_000000000000"), Agent::sales(handler)).await;
        assert!(!registered);
    }

    #[tokio::test]
    async fn switching_requires_registration() {
        let (manager, audit) = manager();
        let session = manager.start_session(Some("CUST001".to_string())).await.expect("start");
        let sid = session.session_id;

        let switched = manager
            .switch_agent(&sid, AgentType::Sales, ConversationStage::SalesNegotiation)
            .await
            .expect("switch");
        assert!(!switched);

        let handler = manager.error_handler().clone();
        assert!(manager.register_agent(&sid, Agent::sales(handler)).await);
        assert!(manager
            .switch_agent(&sid, AgentType::Sales, ConversationStage::SalesNegotiation)
            .await
            .expect("switch"));

        let context = manager.get_session_context(&sid).await.expect("get").expect("context");
        assert_eq!(context.current_agent, AgentType::Sales);
        assert_eq!(context.conversation_stage, ConversationStage::SalesNegotiation);
        assert!(audit.event_types().contains(&"session.agent_registered".to_string()));
    }

    #[tokio::test]
    async fn completed_task_updates_context() {
        let (manager, _) = manager();
        let sid = manager.start_session(Some("CUST001".to_string())).await.expect("start").session_id;
        let handler = manager.error_handler().clone();
        manager.register_agent(&sid, Agent::sales(handler)).await;

        let result = manager
            .execute_agent_task(&sid, AgentType::Sales, TaskType::Sales, input(json!({"amount": 80000})))
            .await
            .expect("task");
        assert_eq!(result["status"], json!("approved"));

        let context = manager.get_session_context(&sid).await.expect("get").expect("context");
        assert_eq!(context.collected_value("loan_amount"), Some(&json!(80000)));
        assert!(context.pending_tasks.is_empty());
        assert_eq!(context.completed_tasks.len(), 1);
        assert!(!context.shared_data.get(AgentType::Sales, AgentType::Underwriting).is_empty());
    }

    #[tokio::test]
    async fn failed_task_is_logged_on_context() {
        let (manager, audit) = manager();
        let sid = manager.start_session(None).await.expect("start").session_id;
        let handler = manager.error_handler().clone();
        manager.register_agent(&sid, Agent::sales(handler)).await;

        let error = manager
            .execute_agent_task(&sid, AgentType::Sales, TaskType::Sales, Map::new())
            .await
            .expect_err("missing amount");
        assert!(matches!(error, SessionError::TaskFailed(_)));

        let context = manager.get_session_context(&sid).await.expect("get").expect("context");
        assert_eq!(context.errors.len(), 1);
        assert!(context.errors[0].message.starts_with("Error ID "));
        assert!(context.pending_tasks.is_empty());
        assert!(audit.event_types().contains(&"session.task_failed".to_string()));
    }

    #[tokio::test]
    async fn ending_keeps_the_durable_record() {
        let (manager, _) = manager();
        let sid = manager.start_session(None).await.expect("start").session_id;
        let handler = manager.error_handler().clone();
        manager.register_agent(&sid, Agent::sales(handler)).await;

        assert!(manager.end_session(&sid).await.expect("end"));
        assert!(!manager.contexts().is_active(&sid).await);
        assert!(manager.registered_agent_types(&sid).await.is_empty());

        let stored = manager.contexts().store().get(&sid).await.expect("store").expect("record");
        assert_eq!(stored.conversation_stage, ConversationStage::Completion);
        assert!(!manager.end_session(&SessionId::from("session_ffffffffffff")).await.expect("end"));
    }

    #[tokio::test]
    async fn listing_filters_by_customer_and_limits() {
        let (manager, _) = manager();
        manager.start_session(Some("CUST001".to_string())).await.expect("start");
        manager.start_session(Some("CUST002".to_string())).await.expect("start");
        manager.start_session(Some("CUST001".to_string())).await.expect("start");

        assert_eq!(manager.list_active_sessions(Some("CUST001"), None).await.len(), 2);
        assert_eq!(manager.list_active_sessions(None, Some(1)).await.len(), 1);

        let stats = manager.get_session_statistics().await;
        assert_eq!(stats.sessions.active_sessions, 3);
        assert_eq!(stats.agent_registry.total_registered_agents, 0);
    }
}
