//! Test helpers and utilities for integration tests

use agentrelay::broker::{Broker, InMemoryBroker};
use agentrelay::delegation::{Artifact, FileDiff, StagePolicy, StageReply, TestOutcome, TestReport};
use agentrelay::pipeline::{PipelineSettings, StageSpec};
use agentrelay::protocol::AgentIdentity;
use agentrelay::session::BrokerSession;
use agentrelay::thread::ThreadChannel;
use std::sync::Arc;
use std::time::Duration;

#[allow(dead_code)]
pub const COORDINATOR_ID: &str = "user_interaction_agent";

/// Stage settings with short waits: 2 sends of 2 polls each
#[allow(dead_code)]
pub fn fast_settings() -> PipelineSettings {
    let policy = StagePolicy::new(Duration::from_millis(50), 2, 2);
    PipelineSettings {
        checkout: StageSpec::new("gitclone_agent", policy),
        diff_review: StageSpec::new("codediff_review_agent", policy),
        test_execution: StageSpec::new("unit_test_runner_agent", policy),
    }
}

#[allow(dead_code)]
pub fn coordinator() -> AgentIdentity {
    AgentIdentity::new(
        COORDINATOR_ID,
        "User Interaction Agent",
        "Handles user instructions and coordinates testing tasks.",
    )
}

/// Shared broker plus a registered coordinator session
#[allow(dead_code)]
pub async fn coordinator_session() -> (Arc<InMemoryBroker>, BrokerSession) {
    let broker = Arc::new(InMemoryBroker::new());
    let session = BrokerSession::new(broker.clone() as Arc<dyn Broker>, coordinator());
    session.register(&coordinator()).await.unwrap();
    (broker, session)
}

#[allow(dead_code)]
pub async fn interaction_thread(session: &BrokerSession) -> ThreadChannel {
    ThreadChannel::open(session.clone(), "User Interaction Thread", &[])
        .await
        .unwrap()
}

#[allow(dead_code)]
pub fn checkout_reply(path: &str) -> String {
    StageReply::success(Artifact::CheckoutPath {
        path: path.to_string(),
    })
    .to_content()
}

#[allow(dead_code)]
pub fn diff_reply(files: &[(&str, &str)]) -> String {
    StageReply::success(Artifact::DiffListing {
        files: files
            .iter()
            .map(|(name, patch)| FileDiff::new(*name, *patch))
            .collect(),
    })
    .to_content()
}

#[allow(dead_code)]
pub fn test_reply(outcome: TestOutcome, summary: &str) -> String {
    StageReply::success(Artifact::TestReport(TestReport {
        outcome,
        summary: summary.to_string(),
        files: Vec::new(),
    }))
    .to_content()
}

/// Minimal valid config file for the front line
#[allow(dead_code)]
pub fn front_line_toml() -> &'static str {
    r#"
[agent]
id = "user_interaction_agent"
name = "User Interaction Agent"
description = "Handles user instructions and coordinates testing tasks."

[broker]
url = "mqtt://localhost:1883"
"#
}
