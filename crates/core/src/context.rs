//! Conversation context ownership.
//!
//! [`ContextManager`] keeps the active sessions in memory and writes every change
//! through to a [`ContextStore`] before returning. Each session has its own lock, so
//! writers on one session never wait on another session.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::domain::conversation::{
    AgentType, ConversationContext, ConversationStage, ErrorLog, RecoveryInfo, SessionId,
};
use crate::domain::task::TaskId;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("stored context `{session_id}` is corrupt: {reason}")]
    Corrupt { session_id: String, reason: String },
    #[error("context storage i/o failed: {0}")]
    Io(String),
    #[error("context could not be encoded or decoded: {0}")]
    Codec(String),
    #[error("context storage backend failed: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("session `{0}` not found")]
    NotFound(SessionId),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StoredSessionSummary {
    pub session_id: SessionId,
    pub customer_id: Option<String>,
    pub stage: ConversationStage,
    pub updated_at: DateTime<Utc>,
}

impl From<&ConversationContext> for StoredSessionSummary {
    fn from(context: &ConversationContext) -> Self {
        Self {
            session_id: context.session_id.clone(),
            customer_id: context.customer_id.clone(),
            stage: context.conversation_stage,
            updated_at: context.updated_at,
        }
    }
}

/// Durable home of conversation contexts. A missing session is `Ok(None)`.
#[async_trait]
pub trait ContextStore: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn get(&self, session_id: &SessionId)
        -> Result<Option<ConversationContext>, StoreError>;

    async fn put(&self, context: &ConversationContext) -> Result<(), StoreError>;

    /// Newest first.
    async fn list(&self) -> Result<Vec<StoredSessionSummary>, StoreError>;

    async fn delete(&self, session_id: &SessionId) -> Result<bool, StoreError>;

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryContextStore {
    contexts: RwLock<HashMap<SessionId, ConversationContext>>,
}

impl InMemoryContextStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContextStore for InMemoryContextStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<ConversationContext>, StoreError> {
        Ok(self.contexts.read().await.get(session_id).cloned())
    }

    async fn put(&self, context: &ConversationContext) -> Result<(), StoreError> {
        self.contexts.write().await.insert(context.session_id.clone(), context.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<StoredSessionSummary>, StoreError> {
        let mut summaries: Vec<StoredSessionSummary> =
            self.contexts.read().await.values().map(StoredSessionSummary::from).collect();
        summaries.sort_by(|left, right| right.updated_at.cmp(&left.updated_at));
        Ok(summaries)
    }

    async fn delete(&self, session_id: &SessionId) -> Result<bool, StoreError> {
        Ok(self.contexts.write().await.remove(session_id).is_some())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SharedEntry {
    pub producer: AgentType,
    pub consumer: AgentType,
    pub data: Map<String, Value>,
}

/// A batch of changes applied to a context in one locked write.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ContextUpdate {
    pub customer_id: Option<String>,
    pub agent: Option<AgentType>,
    pub stage: Option<ConversationStage>,
    pub collected_data: Map<String, Value>,
    pub shared_data: Vec<SharedEntry>,
    pub errors: Vec<ErrorLog>,
    pub pending_tasks: Vec<TaskId>,
    pub completed_tasks: Vec<TaskId>,
}

impl ContextUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_customer(mut self, customer_id: impl Into<String>) -> Self {
        self.customer_id = Some(customer_id.into());
        self
    }

    pub fn with_agent(mut self, agent: AgentType) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn with_stage(mut self, stage: ConversationStage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn collect(mut self, key: impl Into<String>, value: Value) -> Self {
        self.collected_data.insert(key.into(), value);
        self
    }

    pub fn share(
        mut self,
        producer: AgentType,
        consumer: AgentType,
        data: Map<String, Value>,
    ) -> Self {
        self.shared_data.push(SharedEntry { producer, consumer, data });
        self
    }

    pub fn with_error(mut self, error: ErrorLog) -> Self {
        self.errors.push(error);
        self
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn apply(self, context: &mut ConversationContext) {
        if let Some(customer_id) = self.customer_id {
            context.customer_id = Some(customer_id);
        }
        if let Some(agent) = self.agent {
            context.current_agent = agent;
        }
        if let Some(stage) = self.stage {
            context.conversation_stage = stage;
        }
        for (key, value) in self.collected_data {
            context.add_collected_data(key, value);
        }
        for entry in self.shared_data {
            context.shared_data.put(entry.producer, entry.consumer, entry.data);
        }
        for error in self.errors {
            context.add_error(error);
        }
        for task_id in self.pending_tasks {
            context.add_pending_task(task_id);
        }
        for task_id in &self.completed_tasks {
            context.complete_task(task_id);
        }
        context.touch();
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionStatistics {
    pub active_sessions: usize,
    pub sessions_by_stage: BTreeMap<String, usize>,
    pub sessions_by_agent: BTreeMap<String, usize>,
    pub session_timeout_minutes: u64,
}

type SessionSlot = Arc<Mutex<ConversationContext>>;

pub struct ContextManager {
    store: Arc<dyn ContextStore>,
    active: RwLock<HashMap<SessionId, SessionSlot>>,
    session_timeout: Duration,
}

impl ContextManager {
    pub fn new(store: Arc<dyn ContextStore>, session_timeout: Duration) -> Self {
        Self { store, active: RwLock::new(HashMap::new()), session_timeout }
    }

    pub fn store(&self) -> &Arc<dyn ContextStore> {
        &self.store
    }

    pub fn session_timeout(&self) -> Duration {
        self.session_timeout
    }

    pub async fn create_session(
        &self,
        customer_id: Option<String>,
    ) -> Result<ConversationContext, ContextError> {
        let context = ConversationContext::new(SessionId::generate(), customer_id);
        self.store.put(&context).await?;
        self.active
            .write()
            .await
            .insert(context.session_id.clone(), Arc::new(Mutex::new(context.clone())));

        info!(
            event_name = "context.session.created",
            correlation_id = %context.session_id,
            session_id = %context.session_id,
            backend = self.store.backend(),
            "conversation context created"
        );
        Ok(context)
    }

    /// Active copy when cached, otherwise the durable copy without activating it.
    pub async fn get_context(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<ConversationContext>, ContextError> {
        if let Some(slot) = self.slot(session_id).await {
            return Ok(Some(slot.lock().await.clone()));
        }
        Ok(self.store.get(session_id).await?)
    }

    pub async fn update_context(
        &self,
        session_id: &SessionId,
        update: ContextUpdate,
    ) -> Result<ConversationContext, ContextError> {
        self.modify_context(session_id, |context| update.apply(context))
            .await
            .map(|(_, context)| context)
    }

    /// Runs `change` on a copy under the session lock and swaps it in only after the
    /// durable write succeeded.
    pub async fn modify_context<R, F>(
        &self,
        session_id: &SessionId,
        change: F,
    ) -> Result<(R, ConversationContext), ContextError>
    where
        F: FnOnce(&mut ConversationContext) -> R + Send,
        R: Send,
    {
        let slot = self.activate(session_id).await?;
        let mut guard = slot.lock().await;

        let mut next = guard.clone();
        let outcome = change(&mut next);
        next.touch();
        self.store.put(&next).await?;
        *guard = next.clone();
        Ok((outcome, next))
    }

    /// Reloads a session from durable storage into the active index.
    pub async fn recover_context(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<ConversationContext>, ContextError> {
        if let Some(slot) = self.slot(session_id).await {
            return Ok(Some(slot.lock().await.clone()));
        }

        let Some(mut context) = self.store.get(session_id).await? else {
            warn!(
                event_name = "context.session.recover_missing",
                correlation_id = %session_id,
                session_id = %session_id,
                "no durable context to recover"
            );
            return Ok(None);
        };

        context.recovery =
            Some(RecoveryInfo { recovered_at: Utc::now(), original_updated_at: context.updated_at });
        self.store.put(&context).await?;

        let mut active = self.active.write().await;
        let slot = active
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(context.clone())))
            .clone();
        drop(active);

        let current = slot.lock().await.clone();
        info!(
            event_name = "context.session.recovered",
            correlation_id = %session_id,
            session_id = %session_id,
            stage = current.conversation_stage.as_str(),
            "conversation context recovered"
        );
        Ok(Some(current))
    }

    pub async fn share_context_between_agents(
        &self,
        session_id: &SessionId,
        producer: AgentType,
        consumer: AgentType,
        data: Map<String, Value>,
    ) -> Result<(), ContextError> {
        self.update_context(session_id, ContextUpdate::new().share(producer, consumer, data))
            .await
            .map(|_| ())
    }

    /// What `producer` handed to `consumer`; empty when nothing was shared on that pair.
    pub async fn get_shared_data(
        &self,
        session_id: &SessionId,
        consumer: AgentType,
        producer: AgentType,
    ) -> Result<Map<String, Value>, ContextError> {
        let context = self
            .get_context(session_id)
            .await?
            .ok_or_else(|| ContextError::NotFound(session_id.clone()))?;
        Ok(context.shared_data.get(producer, consumer))
    }

    /// Drops the in-memory copy only; the durable record stays.
    pub async fn remove_from_cache(&self, session_id: &SessionId) -> bool {
        self.active.write().await.remove(session_id).is_some()
    }

    pub async fn is_active(&self, session_id: &SessionId) -> bool {
        self.active.read().await.contains_key(session_id)
    }

    pub async fn get_active_sessions(&self) -> Vec<SessionId> {
        let mut sessions: Vec<SessionId> = self.active.read().await.keys().cloned().collect();
        sessions.sort();
        sessions
    }

    pub async fn active_contexts(&self) -> Vec<ConversationContext> {
        let slots: Vec<SessionSlot> = self.active.read().await.values().cloned().collect();
        let mut contexts = Vec::with_capacity(slots.len());
        for slot in slots {
            contexts.push(slot.lock().await.clone());
        }
        contexts
    }

    /// Evicts sessions idle longer than `timeout` (the configured timeout when `None`).
    pub async fn cleanup_expired_sessions(&self, timeout: Option<Duration>) -> Vec<SessionId> {
        let timeout = timeout.unwrap_or(self.session_timeout);
        let now = Utc::now();
        let expired: Vec<SessionId> = self
            .active_contexts()
            .await
            .into_iter()
            .filter(|context| (now - context.updated_at).to_std().unwrap_or_default() >= timeout)
            .map(|context| context.session_id)
            .collect();

        if !expired.is_empty() {
            let mut active = self.active.write().await;
            for session_id in &expired {
                active.remove(session_id);
            }
            info!(
                event_name = "context.session.expired",
                correlation_id = "cleanup",
                expired = expired.len(),
                "evicted idle sessions"
            );
        }
        expired
    }

    pub async fn get_session_statistics(&self) -> SessionStatistics {
        let contexts = self.active_contexts().await;
        let mut sessions_by_stage = BTreeMap::new();
        let mut sessions_by_agent = BTreeMap::new();
        for context in &contexts {
            let stage = context.conversation_stage.as_str().to_string();
            *sessions_by_stage.entry(stage).or_insert(0) += 1;
            let agent = context.current_agent.as_str().to_string();
            *sessions_by_agent.entry(agent).or_insert(0) += 1;
        }

        SessionStatistics {
            active_sessions: contexts.len(),
            sessions_by_stage,
            sessions_by_agent,
            session_timeout_minutes: self.session_timeout.as_secs() / 60,
        }
    }

    async fn slot(&self, session_id: &SessionId) -> Option<SessionSlot> {
        self.active.read().await.get(session_id).cloned()
    }

    /// Cached slot, or the durable copy brought back into the active index.
    async fn activate(&self, session_id: &SessionId) -> Result<SessionSlot, ContextError> {
        if let Some(slot) = self.slot(session_id).await {
            return Ok(slot);
        }
        self.recover_context(session_id)
            .await?
            .ok_or_else(|| ContextError::NotFound(session_id.clone()))?;
        self.slot(session_id).await.ok_or_else(|| ContextError::NotFound(session_id.clone()))
    }
}
