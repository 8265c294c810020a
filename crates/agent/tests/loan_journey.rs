use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};

use loanflow_agent::{Agent, MasterAgent, SessionError, SessionManager};
use loanflow_core::audit::InMemoryAuditSink;
use loanflow_core::context::{ContextManager, InMemoryContextStore};
use loanflow_core::domain::conversation::{AgentType, ConversationStage, SessionId};
use loanflow_core::domain::task::TaskType;
use loanflow_core::error_handler::ErrorHandler;
use loanflow_core::external::ExternalApiService;
use loanflow_core::resilience::{
    default_endpoints, ResilienceSettings, ResilientClient, RetryPolicy, ScriptedTransport,
    TransportError,
};

type JourneyTestResult<T = ()> = Result<T, String>;

macro_rules! require {
    ($cond:expr) => {
        if !$cond {
            return Err(format!("assertion failed: `{}`", stringify!($cond)));
        }
    };
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            return Err(format!($($arg)*));
        }
    };
}

macro_rules! require_eq {
    ($left:expr, $right:expr) => {
        if $left != $right {
            return Err(format!(
                "assertion failed: `left == right` (`{:?}` != `{:?}`)",
                $left,
                $right
            ));
        }
    };
}

struct Harness {
    sessions: Arc<SessionManager>,
    api: Arc<ExternalApiService>,
    audit: InMemoryAuditSink,
}

impl Harness {
    fn new(transport: ScriptedTransport) -> JourneyTestResult<Self> {
        let settings =
            ResilienceSettings { retry: RetryPolicy::immediate(1), ..ResilienceSettings::default() };
        let mut client = ResilientClient::new(Arc::new(transport), settings);
        for endpoint in default_endpoints() {
            client.register(endpoint).map_err(|error| error.to_string())?;
        }

        let store = Arc::new(InMemoryContextStore::new());
        let contexts = Arc::new(ContextManager::new(store, Duration::from_secs(30 * 60)));
        let audit = InMemoryAuditSink::default();
        let sessions = SessionManager::new(
            contexts,
            Arc::new(ErrorHandler::new()),
            Arc::new(audit.clone()),
        );
        Ok(Self {
            sessions: Arc::new(sessions),
            api: Arc::new(ExternalApiService::new(Arc::new(client))),
            audit,
        })
    }

    async fn session_with_workers(&self, customer_id: &str) -> JourneyTestResult<SessionId> {
        let session_id = self
            .sessions
            .start_session(Some(customer_id.to_string()))
            .await
            .map_err(|error| error.to_string())?
            .session_id;
        let handler = self.sessions.error_handler().clone();
        let workers = [
            Agent::sales(handler.clone()),
            Agent::verification(self.api.clone(), handler.clone()),
            Agent::underwriting(self.api.clone(), handler),
        ];
        for agent in workers {
            require!(self.sessions.register_agent(&session_id, agent).await, "register failed");
        }
        Ok(session_id)
    }

    async fn run(
        &self,
        session_id: &SessionId,
        agent_type: AgentType,
        task_type: TaskType,
        input: Value,
    ) -> Result<Value, SessionError> {
        let input = match input {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.sessions.execute_agent_task(session_id, agent_type, task_type, input).await
    }
}

fn healthy_upstreams() -> ScriptedTransport {
    ScriptedTransport::new()
        .respond(
            "/crm/",
            200,
            json!({
                "customer_id": "CUST001",
                "name": "Asha Rao",
                "phone": "9876543210",
                "address": "12 MG Road, Bengaluru",
                "kyc_status": "verified",
            }),
        )
        .respond("/credit-score/", 200, json!({"customer_id": "CUST001", "credit_score": 780}))
        .respond(
            "/offers/",
            200,
            json!({"customer_id": "CUST001", "pre_approved_limit": 100000, "interest_rate": 12.5}),
        )
}

#[tokio::test]
async fn approved_journey_runs_end_to_end() -> JourneyTestResult {
    let harness = Harness::new(healthy_upstreams())?;
    let sid = harness.session_with_workers("CUST001").await?;
    let sessions = &harness.sessions;

    require!(sessions
        .switch_agent(&sid, AgentType::Sales, ConversationStage::SalesNegotiation)
        .await
        .map_err(|error| error.to_string())?);
    let offer = harness
        .run(&sid, AgentType::Sales, TaskType::Sales, json!({"amount": 80000}))
        .await
        .map_err(|error| error.to_string())?;
    require_eq!(offer["status"], json!("approved"));
    require_eq!(offer["interest_rate"].as_f64(), Some(12.5));
    require_eq!(offer["tenure"], json!(24));

    let kyc = harness
        .run(
            &sid,
            AgentType::Verification,
            TaskType::Verification,
            json!({"name": "Asha Rao", "phone": "+91 98765 43210", "address": "12 MG Road Bengaluru"}),
        )
        .await
        .map_err(|error| error.to_string())?;
    require_eq!(kyc["status"], json!("verified"));
    require_eq!(kyc["fallback_used"], json!(false));

    let decision = harness
        .run(&sid, AgentType::Underwriting, TaskType::Underwriting, json!({}))
        .await
        .map_err(|error| error.to_string())?;
    require_eq!(decision["status"], json!("approved"));
    require_eq!(decision["decision_type"], json!("instant"));
    require_eq!(decision["approved_amount"], json!(80000));

    let sanction = harness
        .run(&sid, AgentType::Underwriting, TaskType::DocumentGeneration, json!({}))
        .await
        .map_err(|error| error.to_string())?;
    require_eq!(sanction["document_type"], json!("sanction_letter"));
    require_eq!(sanction["approved_amount"], json!(80000));

    let context = sessions
        .get_session_context(&sid)
        .await
        .map_err(|error| error.to_string())?
        .ok_or("context missing")?;
    require_eq!(context.completed_tasks.len(), 4);
    require!(context.pending_tasks.is_empty());
    require_eq!(context.collected_value("kyc_verified"), Some(&json!(true)));
    require!(context.collected_value("sanction_summary").is_some());

    require!(sessions.end_session(&sid).await.map_err(|error| error.to_string())?);
    let types = harness.audit.event_types();
    require!(types.iter().filter(|kind| *kind == "session.task_completed").count() == 4);
    require!(types.contains(&"session.ended".to_string()));
    Ok(())
}

#[tokio::test]
async fn large_request_is_countered() -> JourneyTestResult {
    let harness = Harness::new(healthy_upstreams())?;
    let sid = harness.session_with_workers("CUST001").await?;

    let offer = harness
        .run(&sid, AgentType::Sales, TaskType::Sales, json!({"loan_request": {"amount": 150000}}))
        .await
        .map_err(|error| error.to_string())?;
    require_eq!(offer["status"], json!("counter_offer"));
    require_eq!(offer["negotiated_amount"], json!(100000));
    require_eq!(offer["interest_rate"].as_f64(), Some(13.0));
    require_eq!(offer["tenure"], json!(36));

    let shared = harness
        .sessions
        .get_shared_data(&sid, AgentType::Underwriting, AgentType::Sales)
        .await
        .map_err(|error| error.to_string())?;
    require_eq!(shared.get("loan_amount"), Some(&json!(100000)));
    Ok(())
}

#[tokio::test]
async fn gating_leaves_agent_history_untouched() -> JourneyTestResult {
    let harness = Harness::new(healthy_upstreams())?;
    let sid = harness.session_with_workers("CUST001").await?;

    let outcome =
        harness.run(&sid, AgentType::Sales, TaskType::Underwriting, json!({"amount": 50000})).await;
    require!(matches!(outcome, Err(SessionError::UnsupportedTask { .. })), "expected gating error");

    let status = harness
        .sessions
        .agent_status(&sid, AgentType::Sales)
        .await
        .ok_or("sales agent missing")?;
    require_eq!(status.task_history_count, 0);
    require_eq!(status.error_count, 0);

    let unregistered = harness
        .sessions
        .execute_agent_task(
            &SessionId::from("session_000000000000"),
            AgentType::Sales,
            TaskType::Sales,
            Map::new(),
        )
        .await;
    require!(matches!(unregistered, Err(SessionError::AgentNotRegistered { .. })));
    Ok(())
}

#[tokio::test]
async fn unavailable_upstreams_degrade_to_fallback_data() -> JourneyTestResult {
    let transport = ScriptedTransport::new()
        .fail("/crm/", TransportError::Connect("crm down".to_string()))
        .fail("/credit-score/", TransportError::Connect("bureau down".to_string()))
        .respond("/offers/", 200, json!({"customer_id": "CUST002", "pre_approved_limit": 200000}));
    let harness = Harness::new(transport)?;
    let sid = harness.session_with_workers("CUST002").await?;

    let kyc = harness
        .run(&sid, AgentType::Verification, TaskType::Verification, json!({"name": "Ravi"}))
        .await
        .map_err(|error| error.to_string())?;
    require_eq!(kyc["status"], json!("manual_review"));
    require_eq!(kyc["fallback_used"], json!(true));

    let decision = harness
        .run(&sid, AgentType::Underwriting, TaskType::Underwriting, json!({"amount": 50000}))
        .await
        .map_err(|error| error.to_string())?;
    require_eq!(decision["status"], json!("rejected"));
    require_eq!(decision["credit_score"].as_f64(), Some(650.0));
    require_eq!(decision["fallback_used"], json!(true));
    Ok(())
}

#[tokio::test]
async fn master_escalates_after_repeated_worker_failures() -> JourneyTestResult {
    let harness = Harness::new(healthy_upstreams())?;
    let sid = harness.session_with_workers("CUST001").await?;
    let master = MasterAgent::new(harness.sessions.clone());

    for _ in 0..2 {
        let failure = harness.run(&sid, AgentType::Sales, TaskType::Sales, json!({})).await;
        let Err(SessionError::TaskFailed(failure)) = failure else {
            return Err("sales task should fail without an amount".to_string());
        };
        let response = master
            .handle_worker_agent_error(&sid, AgentType::Sales, &failure.error.to_string())
            .await
            .map_err(|error| error.to_string())?;
        require!(!response.escalated);
        require!(!response.customer_message.contains("amount is required"));
    }

    let response = master
        .handle_worker_agent_error(&sid, AgentType::Sales, "sales worker crashed")
        .await
        .map_err(|error| error.to_string())?;
    require!(response.escalated);

    let context = harness
        .sessions
        .get_session_context(&sid)
        .await
        .map_err(|error| error.to_string())?
        .ok_or("context missing")?;
    require_eq!(context.conversation_stage, ConversationStage::ErrorHandling);
    require_eq!(context.errors.len(), 2);

    let status = harness
        .sessions
        .agent_status(&sid, AgentType::Sales)
        .await
        .ok_or("sales agent missing")?;
    require_eq!(status.error_count, 2);
    require_eq!(status.recovery_attempts, 1);
    Ok(())
}
