//! Session recovery tests
//!
//! A specialist keeps its registration and keeps serving across broker
//! outages; the supervisor gives up after the configured number of
//! consecutive failures.

mod test_helpers;

use agentrelay::broker::{Broker, InMemoryBroker};
use agentrelay::delegation::{Artifact, Instruction, StageReply};
use agentrelay::protocol::Registration;
use agentrelay::session::{
    BrokerSession, ReconnectPolicy, SessionError, SessionHealth, SessionSupervisor,
    SessionWorkload,
};
use agentrelay::specialist::{SpecialistAgent, SpecialistRole};
use agentrelay::testing::{CountingBroker, FlakyConnector};
use agentrelay::tools::builtin::PR_DIFF_TOOL;
use agentrelay::tools::{Tool, ToolDescription, ToolError, ToolSystem};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::*;
use tokio::sync::watch;

struct OneFileDiff;

#[async_trait]
impl Tool for OneFileDiff {
    fn describe(&self) -> ToolDescription {
        ToolDescription {
            name: PR_DIFF_TOOL.to_string(),
            description: "Single canned diff".to_string(),
            parameters: json!({ "type": "object" }),
        }
    }

    async fn initialize(&mut self, _config: Option<&Value>) -> Result<(), ToolError> {
        Ok(())
    }

    async fn execute(&self, _parameters: &Value) -> Result<Value, ToolError> {
        Ok(json!({ "files": [{ "filename": "calculator.py", "patch": "+pass" }] }))
    }
}

async fn diff_specialist() -> SpecialistAgent {
    let mut tools = ToolSystem::new();
    tools.register(Box::new(OneFileDiff), None).await.unwrap();
    SpecialistAgent::new(
        SpecialistRole::DiffReview,
        COORDINATOR_ID,
        Duration::from_millis(10),
        tools,
    )
}

async fn ask_for_diff(session: &BrokerSession) -> StageReply {
    let mut thread = interaction_thread(session).await;
    let instruction = Instruction::AnalyzeDiff {
        repo: "octocat/calculator".to_string(),
        pr_number: 42,
    };
    thread
        .send(&instruction.render(), &["codediff_review_agent".to_string()])
        .await
        .unwrap();

    for _ in 0..100 {
        let delivered = session
            .poll_mentions(COORDINATOR_ID, Duration::from_millis(20))
            .await
            .unwrap();
        if let Some(reply) = delivered.first() {
            return serde_json::from_str(reply.content()).unwrap();
        }
    }
    panic!("specialist never replied");
}

#[tokio::test]
async fn test_specialist_survives_broker_outage() {
    let connector = Arc::new(FlakyConnector::with_schedule(vec![true, false, true]));
    let broker = connector.broker().clone();
    let supervisor = SessionSupervisor::new(
        connector.clone(),
        SpecialistRole::DiffReview.default_identity(),
        ReconnectPolicy::new(5, Duration::from_millis(20)),
    );
    let mut health = supervisor.health();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut agent = diff_specialist().await.with_shutdown(shutdown_rx);
    let running = tokio::spawn(async move { supervisor.run(&mut agent).await });

    let session = BrokerSession::new(broker.clone() as Arc<dyn Broker>, coordinator());
    session.register(&coordinator()).await.unwrap();
    health.wait_for(|h| h.is_healthy()).await.unwrap();
    assert!(matches!(ask_for_diff(&session).await, StageReply::Success { .. }));

    // Drop the connection; the next connect fails, the one after succeeds
    broker.disconnect();
    health
        .wait_for(|h| matches!(h, SessionHealth::Reconnecting { .. }))
        .await
        .unwrap();
    broker.reconnect();
    health.wait_for(|h| h.is_healthy()).await.unwrap();

    // Re-registration after reconnect did not duplicate the agent
    assert_eq!(broker.agent_count(), 2);
    match ask_for_diff(&session).await {
        StageReply::Success {
            artifact: Artifact::DiffListing { files },
        } => assert_eq!(files[0].filename, "calculator.py"),
        other => panic!("unexpected reply: {other:?}"),
    }

    shutdown_tx.send_replace(true);
    tokio::time::timeout(Duration::from_secs(2), running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(connector.attempts() >= 3);
}

#[tokio::test]
async fn test_supervisor_gives_up_after_budget() {
    let connector = Arc::new(FlakyConnector::failing(usize::MAX));
    let supervisor = SessionSupervisor::new(
        connector.clone(),
        coordinator(),
        ReconnectPolicy::new(3, Duration::from_millis(1)),
    );
    let health = supervisor.health();

    let mut agent = diff_specialist().await;
    let result = supervisor.run(&mut agent).await;

    match result {
        Err(SessionError::RetriesExhausted { attempts, last_error }) => {
            assert_eq!(attempts, 3);
            assert!(last_error.contains("scripted connect failure"));
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }
    assert_eq!(connector.attempts(), 3);
    assert!(matches!(
        *health.borrow(),
        SessionHealth::PermanentlyDisconnected(_)
    ));
}

#[tokio::test]
async fn test_registration_is_idempotent_across_sessions() {
    let broker = Arc::new(InMemoryBroker::new());
    let identity = SpecialistRole::Checkout.default_identity();

    let first = BrokerSession::new(broker.clone() as Arc<dyn Broker>, identity.clone());
    let second = BrokerSession::new(broker.clone() as Arc<dyn Broker>, identity.clone());

    assert_eq!(first.register(&identity).await.unwrap(), Registration::Created);
    assert_eq!(
        second.register(&identity).await.unwrap(),
        Registration::AlreadyRegistered
    );

    let agents = second.list_agents().await.unwrap();
    assert_eq!(agents, vec![identity]);
}

#[tokio::test]
async fn test_idle_specialist_only_polls() {
    let inner = Arc::new(InMemoryBroker::new());
    let counting = Arc::new(CountingBroker::new(inner));
    let session = BrokerSession::new(
        counting.clone() as Arc<dyn Broker>,
        SpecialistRole::DiffReview.default_identity(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut agent = diff_specialist().await.with_shutdown(shutdown_rx);
    let running = tokio::spawn(async move { agent.run(session).await });

    tokio::time::sleep(Duration::from_millis(60)).await;
    shutdown_tx.send_replace(true);
    tokio::time::timeout(Duration::from_secs(1), running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert!(counting.polls() >= 2);
    assert_eq!(counting.sends(), 0);
}
