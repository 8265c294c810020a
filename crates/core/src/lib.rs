pub mod audit;
pub mod config;
pub mod context;
pub mod domain;
pub mod error_handler;
pub mod errors;
pub mod external;
pub mod loan;
pub mod resilience;

pub use audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink, InMemoryAuditSink};
pub use context::{
    ContextError, ContextManager, ContextStore, ContextUpdate, InMemoryContextStore,
    SessionStatistics, StoreError, StoredSessionSummary,
};
pub use domain::conversation::{
    AgentType, ConversationContext, ConversationStage, ErrorLog, ErrorSeverity, SessionId,
};
pub use domain::task::{AgentTask, TaskId, TaskStatus, TaskType};
pub use error_handler::{ErrorCategory, ErrorContext, ErrorHandler, ErrorHandlingResult};
pub use errors::DomainError;
pub use external::{ComprehensiveCustomerData, ExternalApiService, HealthReport, OverallHealth};
pub use resilience::{CallResult, ResilienceError, ResilientClient};
