//! Loan conversation agents and the session orchestration around them.
//!
//! # Architecture
//!
//! A session owns a set of registered worker agents. Work flows through
//! [`SessionManager::execute_agent_task`]:
//! 1. **Gate** - the agent must be registered and able to run the task type
//! 2. **Snapshot** - the agent reads a copy of the conversation context
//! 3. **Execute** - task logic runs outside the session lock (external calls happen here)
//! 4. **Apply** - the task's context changes are written back under the session lock
//!
//! [`MasterAgent`] sits above the workers: it turns worker failures into customer-safe
//! replies plus recovery actions, and escalates repeat offenders to a human.
//!
//! # Key Types
//!
//! - `Agent` - one worker (sales, verification or underwriting) with its bookkeeping
//! - `SessionManager` - session lifecycle, agent registry, task execution
//! - `MasterAgent` - failure coordination, handoffs, worker health

pub mod agent;
pub mod master;
pub mod sales;
pub mod session;
pub mod underwriting;
pub mod verification;

pub use agent::{
    Agent, AgentError, AgentKind, AgentStatus, AgentStatusReport, TaskContext, TaskFailure,
    TaskOutcome,
};
pub use master::{MasterAgent, RecoveryAction, WorkerErrorResponse, WorkerHealth};
pub use session::{SessionError, SessionManager};
