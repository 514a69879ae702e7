//! Specialist agents
//!
//! A specialist registers, then waits for mentions one poll at a time. Each
//! instruction from its coordinator that matches its role runs the role's
//! tool; the result (or the tool error) goes back as a [`StageReply`] in the
//! same thread, mentioning the requester and echoing the instruction's
//! reference. Anything else is skipped.

use crate::broker::BrokerError;
use crate::delegation::{split_reference, Artifact, FileDiff, Instruction, StageReply, TestReport};
use crate::error::{sanitize_error_message, RelayResult};
use crate::protocol::{AgentIdentity, Message};
use crate::session::{BrokerSession, SessionWorkload};
use crate::thread::ThreadChannel;
use crate::tools::{builtin, ToolError, ToolSystem};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecialistRole {
    Checkout,
    DiffReview,
    TestExecution,
}

impl SpecialistRole {
    pub const ALL: [SpecialistRole; 3] = [
        SpecialistRole::Checkout,
        SpecialistRole::DiffReview,
        SpecialistRole::TestExecution,
    ];

    pub fn tool_name(&self) -> &'static str {
        match self {
            SpecialistRole::Checkout => builtin::CHECKOUT_TOOL,
            SpecialistRole::DiffReview => builtin::PR_DIFF_TOOL,
            SpecialistRole::TestExecution => builtin::TEST_RUNNER_TOOL,
        }
    }

    /// Identity a specialist of this role registers with by default
    pub fn default_identity(&self) -> AgentIdentity {
        match self {
            SpecialistRole::Checkout => AgentIdentity::new(
                "gitclone_agent",
                "Git Clone Agent",
                "Clones GitHub repositories and checks out the branch for a specific Pull Request.",
            ),
            SpecialistRole::DiffReview => AgentIdentity::new(
                "codediff_review_agent",
                "Code Diff Review Agent",
                "Fetches and formats code diffs from GitHub pull requests.",
            ),
            SpecialistRole::TestExecution => AgentIdentity::new(
                "unit_test_runner_agent",
                "Unit Test Runner Agent",
                "Determines and runs relevant pytest unit tests given code diffs.",
            ),
        }
    }

    /// Tool arguments when `instruction` is this role's work (pure function)
    pub fn tool_arguments(&self, instruction: &Instruction) -> Option<Value> {
        match (self, instruction) {
            (SpecialistRole::Checkout, Instruction::Checkout { repo, pr_number })
            | (SpecialistRole::DiffReview, Instruction::AnalyzeDiff { repo, pr_number }) => {
                Some(json!({ "repo": repo, "pr_number": pr_number }))
            }
            (
                SpecialistRole::TestExecution,
                Instruction::RunTests {
                    project_root,
                    files,
                },
            ) => Some(json!({ "project_root": project_root, "files": files })),
            _ => None,
        }
    }

    /// Artifact built from this role's tool output (pure function)
    pub fn artifact_from(&self, output: Value) -> Result<Artifact, ToolError> {
        let malformed = |e: serde_json::Error| {
            ToolError::execution(format!("Unexpected {} output: {e}", self.tool_name()))
        };

        match self {
            SpecialistRole::Checkout => {
                let path = output["path"]
                    .as_str()
                    .ok_or_else(|| ToolError::execution("Checkout output has no path"))?;
                Ok(Artifact::CheckoutPath {
                    path: path.to_string(),
                })
            }
            SpecialistRole::DiffReview => {
                let files: Vec<FileDiff> =
                    serde_json::from_value(output["files"].clone()).map_err(malformed)?;
                Ok(Artifact::DiffListing { files })
            }
            SpecialistRole::TestExecution => {
                let report: TestReport = serde_json::from_value(output).map_err(malformed)?;
                Ok(Artifact::TestReport(report))
            }
        }
    }
}

impl fmt::Display for SpecialistRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SpecialistRole::Checkout => "checkout",
            SpecialistRole::DiffReview => "diff_review",
            SpecialistRole::TestExecution => "test_execution",
        })
    }
}

pub struct SpecialistAgent {
    role: SpecialistRole,
    coordinator_id: String,
    poll_timeout: Duration,
    tools: ToolSystem,
    shutdown: Option<watch::Receiver<bool>>,
}

impl SpecialistAgent {
    pub fn new(
        role: SpecialistRole,
        coordinator_id: impl Into<String>,
        poll_timeout: Duration,
        tools: ToolSystem,
    ) -> Self {
        Self {
            role,
            coordinator_id: coordinator_id.into(),
            poll_timeout,
            tools,
            shutdown: None,
        }
    }

    /// Specialist whose tool system holds the role's builtin tool
    pub async fn with_builtin_tool(
        role: SpecialistRole,
        coordinator_id: impl Into<String>,
        poll_timeout: Duration,
        tool_config: Option<&Value>,
    ) -> Result<Self, ToolError> {
        let mut tools = ToolSystem::new();
        tools.register_builtin(role.tool_name(), tool_config).await?;
        Ok(Self::new(role, coordinator_id, poll_timeout, tools))
    }

    /// Stop after the current poll once `shutdown` turns true
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn role(&self) -> SpecialistRole {
        self.role
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    async fn serve(&mut self, session: BrokerSession) -> RelayResult<()> {
        let me = session.agent().clone();
        let registration = session.register(&me).await?;
        info!(role = %self.role, ?registration, "Specialist ready");

        while !self.shutdown_requested() {
            let delivered = session.poll_mentions(&me.id, self.poll_timeout).await?;
            for message in delivered {
                self.handle(&session, message).await?;
            }
        }

        info!(role = %self.role, "Specialist stopping");
        Ok(())
    }

    /// Handle one delivered mention; only connection loss is returned
    async fn handle(&self, session: &BrokerSession, message: Message) -> RelayResult<()> {
        if message.sender_id() != self.coordinator_id {
            debug!(sender = message.sender_id(), "Ignoring mention from non-coordinator");
            return Ok(());
        }

        let (body, reference) = split_reference(message.content());
        let Some(arguments) = Instruction::parse(body).and_then(|i| self.role.tool_arguments(&i))
        else {
            debug!(thread_id = message.thread_id(), "Ignoring message that is not an instruction for this role");
            return Ok(());
        };

        info!(
            thread_id = message.thread_id(),
            tool = self.role.tool_name(),
            reference = reference.unwrap_or("-"),
            "Running instruction"
        );
        let reply = match self
            .tools
            .execute_tool(self.role.tool_name(), &arguments)
            .await
            .and_then(|output| self.role.artifact_from(output))
        {
            Ok(artifact) => StageReply::success(artifact),
            Err(e) => StageReply::error(sanitize_error_message(&e.to_string())),
        };

        let content = reply.to_content_with_reference(reference);
        match self.reply(session, &message, &content).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_connection_lost() => Err(e.into()),
            Err(e) => {
                warn!(thread_id = message.thread_id(), error = %e, "Could not deliver reply");
                Ok(())
            }
        }
    }

    async fn reply(
        &self,
        session: &BrokerSession,
        request: &Message,
        content: &str,
    ) -> Result<(), BrokerError> {
        let mut thread = ThreadChannel::join(session.clone(), request.thread_id()).await?;
        thread
            .send(content, &[request.sender_id().to_string()])
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SessionWorkload for SpecialistAgent {
    async fn run(&mut self, session: BrokerSession) -> RelayResult<()> {
        let span = crate::lifecycle_span!(agent_id = %session.agent_id(), role = %self.role);
        self.serve(session).instrument(span).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::tools::{Tool, ToolDescription};
    use std::sync::Arc;

    struct FixedCheckout;

    #[async_trait]
    impl Tool for FixedCheckout {
        fn describe(&self) -> ToolDescription {
            ToolDescription {
                name: builtin::CHECKOUT_TOOL.to_string(),
                description: "fixed".to_string(),
                parameters: json!({ "type": "object" }),
            }
        }

        async fn initialize(&mut self, _config: Option<&Value>) -> Result<(), ToolError> {
            Ok(())
        }

        async fn execute(&self, parameters: &Value) -> Result<Value, ToolError> {
            if parameters["pr_number"] == 13 {
                return Err(ToolError::execution("git fetch failed"));
            }
            Ok(json!({ "path": "/work/calculator" }))
        }
    }

    async fn checkout_specialist() -> SpecialistAgent {
        let mut tools = ToolSystem::new();
        tools.register(Box::new(FixedCheckout), None).await.unwrap();
        SpecialistAgent::new(
            SpecialistRole::Checkout,
            "user_interaction_agent",
            Duration::from_millis(20),
            tools,
        )
    }

    async fn coordinator(broker: &Arc<InMemoryBroker>) -> ThreadChannel {
        let identity = AgentIdentity::new("user_interaction_agent", "UI", "coordinator");
        let session = BrokerSession::new(broker.clone(), identity.clone());
        session.register(&identity).await.unwrap();
        ThreadChannel::open(session, "work", &[]).await.unwrap()
    }

    fn spawn_specialist(
        broker: &Arc<InMemoryBroker>,
        mut agent: SpecialistAgent,
    ) -> (watch::Sender<bool>, tokio::task::JoinHandle<RelayResult<()>>) {
        let (tx, rx) = watch::channel(false);
        let session =
            BrokerSession::new(broker.clone(), SpecialistRole::Checkout.default_identity());
        agent = agent.with_shutdown(rx);
        let handle = tokio::spawn(async move { agent.run(session).await });
        (tx, handle)
    }

    async fn wait_for_registration(broker: &InMemoryBroker, count: usize) {
        for _ in 0..100 {
            if broker.agent_count() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("specialist never registered");
    }

    async fn reply_to(thread: &ThreadChannel) -> StageReply {
        let session = thread.session();
        for _ in 0..50 {
            let messages = session
                .poll_mentions("user_interaction_agent", Duration::from_millis(20))
                .await
                .unwrap();
            if let Some(m) = messages.into_iter().next() {
                return serde_json::from_str(m.content()).unwrap();
            }
        }
        panic!("no reply");
    }

    #[test]
    fn test_role_matches_only_its_instruction() {
        let checkout = Instruction::Checkout {
            repo: "octocat/calculator".to_string(),
            pr_number: 42,
        };
        assert!(SpecialistRole::Checkout.tool_arguments(&checkout).is_some());
        assert!(SpecialistRole::DiffReview.tool_arguments(&checkout).is_none());
        assert!(SpecialistRole::TestExecution.tool_arguments(&checkout).is_none());
    }

    #[test]
    fn test_artifact_from_test_output() {
        let artifact = SpecialistRole::TestExecution
            .artifact_from(json!({
                "outcome": "failed",
                "summary": "Some tests failed",
                "files": [{ "file": "test_calculator.py", "passed": false, "output": "1 failed" }]
            }))
            .unwrap();
        assert!(artifact.to_string().starts_with("Result: FAILED"));

        assert!(SpecialistRole::Checkout.artifact_from(json!({})).is_err());
    }

    #[test]
    fn test_role_serde_names() {
        let role: SpecialistRole = serde_json::from_str("\"diff_review\"").unwrap();
        assert_eq!(role, SpecialistRole::DiffReview);
        assert_eq!(SpecialistRole::TestExecution.to_string(), "test_execution");
    }

    #[tokio::test]
    async fn test_replies_with_artifact_to_coordinator() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut thread = coordinator(&broker).await;
        let (stop, handle) = spawn_specialist(&broker, checkout_specialist().await);
        wait_for_registration(&broker, 2).await;

        thread
            .send(
                "Checkout PR #42 from 'octocat/calculator'",
                &["gitclone_agent".to_string()],
            )
            .await
            .unwrap();

        let reply = reply_to(&thread).await;
        assert_eq!(
            reply,
            StageReply::success(Artifact::CheckoutPath {
                path: "/work/calculator".to_string()
            })
        );

        stop.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_reply_echoes_instruction_reference() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut thread = coordinator(&broker).await;
        let (stop, handle) = spawn_specialist(&broker, checkout_specialist().await);
        wait_for_registration(&broker, 2).await;

        let instruction = Instruction::Checkout {
            repo: "octocat/calculator".to_string(),
            pr_number: 42,
        };
        thread
            .send(
                &instruction.render_with_reference("7e3b.checkout"),
                &["gitclone_agent".to_string()],
            )
            .await
            .unwrap();

        let session = thread.session();
        let mut reply = None;
        for _ in 0..50 {
            let messages = session
                .poll_mentions("user_interaction_agent", Duration::from_millis(20))
                .await
                .unwrap();
            if let Some(m) = messages.into_iter().next() {
                reply = Some(m);
                break;
            }
        }
        let reply = reply.expect("no reply");
        assert_eq!(
            crate::delegation::reply_reference(reply.content()).as_deref(),
            Some("7e3b.checkout")
        );

        stop.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_tool_failure_becomes_error_reply() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut thread = coordinator(&broker).await;
        let (stop, handle) = spawn_specialist(&broker, checkout_specialist().await);
        wait_for_registration(&broker, 2).await;

        thread
            .send(
                "Checkout PR #13 from 'octocat/calculator'",
                &["gitclone_agent".to_string()],
            )
            .await
            .unwrap();

        match reply_to(&thread).await {
            StageReply::Error { message } => assert!(message.contains("git fetch failed")),
            other => panic!("expected error reply, got {other:?}"),
        }

        stop.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unmatched_instruction_is_skipped() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut thread = coordinator(&broker).await;
        let (stop, handle) = spawn_specialist(&broker, checkout_specialist().await);
        wait_for_registration(&broker, 2).await;

        thread
            .send(
                "Analyze PR #42 from 'octocat/calculator'",
                &["gitclone_agent".to_string()],
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(broker.pending_mentions("user_interaction_agent"), 0);
        let history = thread.history().await.unwrap();
        assert_eq!(history.len(), 1);

        stop.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}
