use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::domain::task::TaskId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn generate() -> Self {
        let hex = Uuid::new_v4().simple().to_string();
        Self(format!("session_{}", &hex[..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Master,
    Sales,
    Verification,
    Underwriting,
}

impl AgentType {
    pub const WORKERS: [AgentType; 3] = [Self::Sales, Self::Verification, Self::Underwriting];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::Sales => "sales",
            Self::Verification => "verification",
            Self::Underwriting => "underwriting",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "master" => Some(Self::Master),
            "sales" => Some(Self::Sales),
            "verification" => Some(Self::Verification),
            "underwriting" => Some(Self::Underwriting),
            _ => None,
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStage {
    Initiation,
    InformationCollection,
    SalesNegotiation,
    Verification,
    Underwriting,
    DocumentUpload,
    SanctionGeneration,
    Completion,
    ErrorHandling,
}

impl ConversationStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiation => "initiation",
            Self::InformationCollection => "information_collection",
            Self::SalesNegotiation => "sales_negotiation",
            Self::Verification => "verification",
            Self::Underwriting => "underwriting",
            Self::DocumentUpload => "document_upload",
            Self::SanctionGeneration => "sanction_generation",
            Self::Completion => "completion",
            Self::ErrorHandling => "error_handling",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "initiation" => Some(Self::Initiation),
            "information_collection" => Some(Self::InformationCollection),
            "sales_negotiation" => Some(Self::SalesNegotiation),
            "verification" => Some(Self::Verification),
            "underwriting" => Some(Self::Underwriting),
            "document_upload" => Some(Self::DocumentUpload),
            "sanction_generation" => Some(Self::SanctionGeneration),
            "completion" => Some(Self::Completion),
            "error_handling" => Some(Self::ErrorHandling),
            _ => None,
        }
    }

    /// Stages the conversation flow allows after this one.
    pub fn next_stages(&self) -> &'static [ConversationStage] {
        use ConversationStage::*;
        match self {
            Initiation => &[InformationCollection],
            InformationCollection => &[SalesNegotiation, ErrorHandling],
            SalesNegotiation => &[Verification, ErrorHandling],
            Verification => &[Underwriting, ErrorHandling],
            Underwriting => &[SanctionGeneration, DocumentUpload, Completion, ErrorHandling],
            DocumentUpload => &[Underwriting, ErrorHandling],
            SanctionGeneration => &[Completion, ErrorHandling],
            Completion => &[],
            ErrorHandling => &[Initiation, Completion],
        }
    }

    pub fn can_transition_to(&self, next: ConversationStage) -> bool {
        self.next_stages().contains(&next)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completion)
    }
}

impl fmt::Display for ConversationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorLog {
    pub id: String,
    pub message: String,
    pub severity: ErrorSeverity,
    pub context: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl ErrorLog {
    pub fn new(message: impl Into<String>, severity: ErrorSeverity) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message: message.into(),
            severity,
            context: Map::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CollectedValue {
    pub value: Value,
    pub recorded_at: DateTime<Utc>,
}

/// Data handed from one agent to another, keyed by the ordered (producer, consumer) pair.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SharedData {
    entries: BTreeMap<String, Map<String, Value>>,
}

impl SharedData {
    fn key(producer: AgentType, consumer: AgentType) -> String {
        format!("{}->{}", producer.as_str(), consumer.as_str())
    }

    /// Replaces whatever the producer previously sent to this consumer.
    pub fn put(&mut self, producer: AgentType, consumer: AgentType, data: Map<String, Value>) {
        self.entries.insert(Self::key(producer, consumer), data);
    }

    pub fn get(&self, producer: AgentType, consumer: AgentType) -> Map<String, Value> {
        self.entries.get(&Self::key(producer, consumer)).cloned().unwrap_or_default()
    }

    /// Everything addressed to `consumer`, later producers winning on key clashes.
    pub fn for_consumer(&self, consumer: AgentType) -> Map<String, Value> {
        let suffix = format!("->{}", consumer.as_str());
        let mut merged = Map::new();
        for (key, data) in &self.entries {
            if key.ends_with(&suffix) {
                merged.extend(data.clone());
            }
        }
        merged
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecoveryInfo {
    pub recovered_at: DateTime<Utc>,
    pub original_updated_at: DateTime<Utc>,
}

/// Durable, shareable state for one customer conversation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationContext {
    pub session_id: SessionId,
    pub customer_id: Option<String>,
    pub current_agent: AgentType,
    pub conversation_stage: ConversationStage,
    #[serde(default)]
    pub collected_data: BTreeMap<String, CollectedValue>,
    #[serde(default)]
    pub shared_data: SharedData,
    #[serde(default)]
    pub errors: Vec<ErrorLog>,
    #[serde(default)]
    pub pending_tasks: Vec<TaskId>,
    #[serde(default)]
    pub completed_tasks: Vec<TaskId>,
    #[serde(default)]
    pub recovery: Option<RecoveryInfo>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationContext {
    pub fn new(session_id: SessionId, customer_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            customer_id,
            current_agent: AgentType::Master,
            conversation_stage: ConversationStage::Initiation,
            collected_data: BTreeMap::new(),
            shared_data: SharedData::default(),
            errors: Vec::new(),
            pending_tasks: Vec::new(),
            completed_tasks: Vec::new(),
            recovery: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn switch_agent(&mut self, agent: AgentType, stage: ConversationStage) {
        self.current_agent = agent;
        self.conversation_stage = stage;
        self.touch();
    }

    pub fn set_stage(&mut self, stage: ConversationStage) {
        self.conversation_stage = stage;
        self.touch();
    }

    pub fn add_collected_data(&mut self, key: impl Into<String>, value: Value) {
        self.collected_data
            .insert(key.into(), CollectedValue { value, recorded_at: Utc::now() });
        self.touch();
    }

    pub fn collected_value(&self, key: &str) -> Option<&Value> {
        self.collected_data.get(key).map(|entry| &entry.value)
    }

    pub fn add_error(&mut self, error: ErrorLog) {
        self.errors.push(error);
        self.touch();
    }

    pub fn add_pending_task(&mut self, task_id: TaskId) {
        if !self.pending_tasks.contains(&task_id) {
            self.pending_tasks.push(task_id);
        }
        self.touch();
    }

    pub fn complete_task(&mut self, task_id: &TaskId) {
        self.pending_tasks.retain(|pending| pending != task_id);
        if !self.completed_tasks.contains(task_id) {
            self.completed_tasks.push(task_id.clone());
        }
        self.touch();
    }

    pub fn is_terminal(&self) -> bool {
        self.conversation_stage.is_terminal()
    }
}
