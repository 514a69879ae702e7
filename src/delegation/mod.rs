//! Delegating one unit of work to a specialist
//!
//! A [`DelegationStep`] sends an instruction that mentions the target agent,
//! waits for the target's reply with a [`MentionWaiter`], and classifies it.
//! When a whole wait comes back empty the same instruction is sent again, up
//! to `send_attempts` times. A reply that arrives but has the wrong shape is
//! never retried. An instruction the broker refuses to deliver (unknown
//! target, closed thread) ends the step as `NoResponse`; only a lost
//! connection is returned as an error.

use crate::broker::BrokerResult;
use crate::observability::metrics::metrics;
use crate::thread::ThreadChannel;
use crate::waiter::{MentionWaiter, ReplyFilter, WaitOutcome, WaitRequest};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

pub mod instruction;
pub mod reply;

pub use instruction::{split_reference, Instruction};
pub use reply::{
    parse_reply, reply_reference, Artifact, ArtifactKind, FileDiff, ParsedReply, StageReply,
    TestFileResult, TestOutcome, TestReport,
};

/// Why a step produced no artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FailureReason {
    #[error("no response")]
    NoResponse,
    #[error("malformed reply")]
    MalformedReply,
    #[error("tool error")]
    ToolError,
}

impl FailureReason {
    /// Stable label for metrics
    pub fn label(&self) -> &'static str {
        match self {
            FailureReason::NoResponse => "no_response",
            FailureReason::MalformedReply => "malformed_reply",
            FailureReason::ToolError => "tool_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepResult {
    Success {
        artifact: Artifact,
        raw_reply: String,
    },
    Failure {
        reason: FailureReason,
        /// Human-readable explanation
        detail: String,
        /// Reply text, absent for `NoResponse`
        raw_reply: Option<String>,
    },
}

impl StepResult {
    pub fn is_success(&self) -> bool {
        matches!(self, StepResult::Success { .. })
    }
}

/// Timeout and retry budget of one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagePolicy {
    /// Duration of each mention poll
    pub timeout: Duration,
    /// Polls per wait
    pub wait_attempts: u32,
    /// Times the instruction is sent before giving up
    pub send_attempts: u32,
}

impl StagePolicy {
    pub fn new(timeout: Duration, wait_attempts: u32, send_attempts: u32) -> Self {
        Self {
            timeout,
            wait_attempts,
            send_attempts,
        }
    }
}

impl Default for StagePolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(30_000), 3, 3)
    }
}

/// Ask one agent for one artifact
#[derive(Debug, Clone)]
pub struct DelegationStep {
    /// Name used in logs and metrics
    pub label: String,
    pub target_agent_id: String,
    pub instruction: String,
    pub expected: ArtifactKind,
    pub policy: StagePolicy,
    /// Key the reply must echo; replies carrying another key are skipped
    pub reference: Option<String>,
}

impl DelegationStep {
    pub fn new(
        label: impl Into<String>,
        target_agent_id: impl Into<String>,
        instruction: impl Into<String>,
        expected: ArtifactKind,
        policy: StagePolicy,
    ) -> Self {
        Self {
            label: label.into(),
            target_agent_id: target_agent_id.into(),
            instruction: instruction.into(),
            expected,
            policy,
            reference: None,
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    /// Message content: the instruction plus its reference line
    pub fn content(&self) -> String {
        match &self.reference {
            Some(reference) => format!("{}\n\n[ref: {reference}]", self.instruction),
            None => self.instruction.clone(),
        }
    }

    /// Run the step on `thread`
    ///
    /// Only transport failures are returned as `Err`; every stage-level
    /// outcome is a [`StepResult`].
    pub async fn execute(&self, thread: &mut ThreadChannel) -> BrokerResult<StepResult> {
        let mut filter = ReplyFilter::new(&self.target_agent_id, thread.thread_id());
        if let Some(reference) = &self.reference {
            filter = filter.with_reference(reference.clone());
        }
        let mentions = [self.target_agent_id.clone()];
        let content = self.content();

        for send in 1..=self.policy.send_attempts {
            match thread.send(&content, &mentions).await {
                Ok(_) => {}
                Err(e) if e.is_connection_lost() => return Err(e),
                Err(e) => {
                    let result = StepResult::Failure {
                        reason: FailureReason::NoResponse,
                        detail: format!(
                            "instruction could not be delivered to {}: {e}",
                            self.target_agent_id
                        ),
                        raw_reply: None,
                    };
                    self.record(&result, send);
                    return Ok(result);
                }
            }
            info!(
                stage = %self.label,
                target = %self.target_agent_id,
                thread_id = %thread.thread_id(),
                send,
                "Instruction sent"
            );

            let request = WaitRequest::new(
                thread.session().agent_id(),
                self.policy.timeout,
                self.policy.wait_attempts,
            );
            let outcome = MentionWaiter::new(thread.session())
                .wait(request, &filter)
                .await?;

            match outcome {
                WaitOutcome::Received(reply) => {
                    let result = classify_reply(reply.content(), self.expected);
                    self.record(&result, send);
                    return Ok(result);
                }
                WaitOutcome::NoResponse { awaited, attempts } => {
                    warn!(
                        stage = %self.label,
                        awaited = %awaited,
                        polls = attempts,
                        send,
                        send_attempts = self.policy.send_attempts,
                        "No response to instruction"
                    );
                }
            }
        }

        let result = StepResult::Failure {
            reason: FailureReason::NoResponse,
            detail: format!(
                "{} did not respond after {} attempts",
                self.target_agent_id, self.policy.send_attempts
            ),
            raw_reply: None,
        };
        self.record(&result, self.policy.send_attempts);
        Ok(result)
    }

    fn record(&self, result: &StepResult, sends: u32) {
        match result {
            StepResult::Success { .. } => metrics().stage_succeeded(&self.label, sends),
            StepResult::Failure { reason, detail, .. } => {
                warn!(stage = %self.label, reason = %reason, detail = %detail, "Stage failed");
                metrics().stage_failed(&self.label, reason.label(), sends);
            }
        }
    }
}

/// Turn reply text into a step result (pure function)
pub fn classify_reply(content: &str, expected: ArtifactKind) -> StepResult {
    match parse_reply(content, expected) {
        ParsedReply::Artifact(artifact) => StepResult::Success {
            artifact,
            raw_reply: content.to_string(),
        },
        ParsedReply::RemoteError(message) => StepResult::Failure {
            reason: FailureReason::ToolError,
            detail: message,
            raw_reply: Some(content.to_string()),
        },
        ParsedReply::Malformed(why) => StepResult::Failure {
            reason: FailureReason::MalformedReply,
            detail: why,
            raw_reply: Some(content.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::protocol::AgentIdentity;
    use crate::session::BrokerSession;
    use std::sync::Arc;

    async fn owner_thread() -> ThreadChannel {
        let broker = Arc::new(InMemoryBroker::new());
        let owner = AgentIdentity::new("owner", "Owner", "delegates");
        let session = BrokerSession::new(broker, owner.clone());
        session.register(&owner).await.unwrap();
        ThreadChannel::open(session, "work", &[]).await.unwrap()
    }

    fn quick_step(target: &str) -> DelegationStep {
        DelegationStep::new(
            "checkout",
            target,
            "Checkout PR #1 from 'octocat/calculator'",
            ArtifactKind::CheckoutPath,
            StagePolicy::new(Duration::from_millis(5), 1, 3),
        )
    }

    #[tokio::test]
    async fn test_unknown_target_is_no_response() {
        let mut thread = owner_thread().await;

        let result = quick_step("ghost_agent").execute(&mut thread).await.unwrap();

        match result {
            StepResult::Failure {
                reason: FailureReason::NoResponse,
                detail,
                raw_reply: None,
            } => assert!(detail.contains("ghost_agent")),
            other => panic!("expected NoResponse, got {other:?}"),
        }
        assert!(thread.history().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_closed_thread_is_no_response() {
        let mut thread = owner_thread().await;
        thread
            .session()
            .close_thread(thread.thread_id())
            .await
            .unwrap();

        let result = quick_step("owner").execute(&mut thread).await.unwrap();
        assert!(matches!(
            result,
            StepResult::Failure {
                reason: FailureReason::NoResponse,
                ..
            }
        ));
    }

    #[test]
    fn test_content_carries_reference() {
        let step = quick_step("gitclone_agent").with_reference("r1.checkout");
        assert_eq!(
            step.content(),
            "Checkout PR #1 from 'octocat/calculator'\n\n[ref: r1.checkout]"
        );
        assert_eq!(
            split_reference(&step.content()),
            ("Checkout PR #1 from 'octocat/calculator'", Some("r1.checkout"))
        );
        assert_eq!(
            quick_step("gitclone_agent").content(),
            "Checkout PR #1 from 'octocat/calculator'"
        );
    }

    #[test]
    fn test_classify_success_keeps_raw_reply() {
        let content = "Local path: /repos/calculator";
        match classify_reply(content, ArtifactKind::CheckoutPath) {
            StepResult::Success { artifact, raw_reply } => {
                assert_eq!(
                    artifact,
                    Artifact::CheckoutPath {
                        path: "/repos/calculator".to_string()
                    }
                );
                assert_eq!(raw_reply, content);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_classify_remote_error() {
        let result = classify_reply(
            r#"{"status":"error","message":"clone failed"}"#,
            ArtifactKind::CheckoutPath,
        );
        assert!(matches!(
            result,
            StepResult::Failure {
                reason: FailureReason::ToolError,
                raw_reply: Some(_),
                ..
            }
        ));
    }

    #[test]
    fn test_classify_malformed() {
        let result = classify_reply("I could not find it", ArtifactKind::DiffListing);
        assert!(matches!(
            result,
            StepResult::Failure {
                reason: FailureReason::MalformedReply,
                ..
            }
        ));
    }

    #[test]
    fn test_failure_reason_labels() {
        assert_eq!(FailureReason::NoResponse.label(), "no_response");
        assert_eq!(FailureReason::MalformedReply.to_string(), "malformed reply");
    }

    #[test]
    fn test_default_stage_policy() {
        let policy = StagePolicy::default();
        assert_eq!(policy.timeout, Duration::from_secs(30));
        assert_eq!(policy.wait_attempts, 3);
        assert_eq!(policy.send_attempts, 3);
    }
}
