//! Front-line agent loop
//!
//! Talks to the human, runs the pipeline for each pull request they name and
//! posts the report to the interaction thread.

use super::request::{parse_command, HumanCommand};
use super::{PipelineOrchestrator, PipelineSettings};
use crate::error::RelayResult;
use crate::human::HumanInterface;
use crate::protocol::AgentIdentity;
use crate::session::{BrokerSession, SessionWorkload};
use crate::thread::ThreadChannel;
use async_trait::async_trait;
use tracing::{info, warn, Instrument};

pub const THREAD_NAME: &str = "User Interaction Thread";
pub const READY_MESSAGE: &str = "I am ready to receive testing instructions.";
pub const REQUEST_QUESTION: &str =
    "Please tell me the GitHub repo (e.g., owner/repo) and the PR number to test.";
pub const INVALID_INPUT_REPLY: &str = "No valid instructions received.";
pub const TASK_COMPLETED: &str = "Task completed.";

pub struct FrontLine<H> {
    orchestrator: PipelineOrchestrator,
    human: H,
}

impl<H: HumanInterface> FrontLine<H> {
    pub fn new(settings: PipelineSettings, human: H) -> Self {
        Self {
            orchestrator: PipelineOrchestrator::new(settings),
            human,
        }
    }

    pub fn orchestrator(&self) -> &PipelineOrchestrator {
        &self.orchestrator
    }

    pub fn human(&self) -> &H {
        &self.human
    }

    async fn open_thread(session: &BrokerSession) -> RelayResult<ThreadChannel> {
        let mut thread = ThreadChannel::open(session.clone(), THREAD_NAME, &[]).await?;
        thread.send(READY_MESSAGE, &[]).await?;
        Ok(thread)
    }

    async fn serve(&mut self, session: BrokerSession) -> RelayResult<()> {
        let known = session.list_agents().await?;
        info!(known_agents = known.len(), "Broker agent registry loaded");

        let me = session.agent().clone();
        session.register(&me).await?;
        let mut thread = Self::open_thread(&session).await?;

        loop {
            let Some(answer) = self.human.ask(REQUEST_QUESTION).await? else {
                info!("Human input closed, stopping");
                return Ok(());
            };

            match parse_command(&answer) {
                HumanCommand::ListAgents => {
                    let agents = session.list_agents().await?;
                    self.human.tell(&format_agent_list(&agents)).await?;
                }
                HumanCommand::CloseThread => {
                    thread.clone().close().await?;
                    thread = Self::open_thread(&session).await?;
                    self.human
                        .tell("Thread closed. Continuing in a new thread.")
                        .await?;
                }
                HumanCommand::Invalid => {
                    thread.send(INVALID_INPUT_REPLY, &[]).await?;
                    self.human.tell(INVALID_INPUT_REPLY).await?;
                }
                HumanCommand::Test(request) => {
                    let run = match self.orchestrator.run(request, &mut thread).await {
                        Ok(run) => run,
                        Err(e) => {
                            if e.is_connection_lost() {
                                warn!(error = %e, "Request abandoned, broker connection lost");
                                let _ = self
                                    .human
                                    .tell("Lost the connection to the broker; the request was abandoned.")
                                    .await;
                            }
                            return Err(e);
                        }
                    };

                    thread.send(&run.report, &[]).await?;
                    thread.send(TASK_COMPLETED, &[]).await?;
                    self.human.tell(&run.report).await?;
                }
            }
        }
    }
}

#[async_trait]
impl<H: HumanInterface> SessionWorkload for FrontLine<H> {
    async fn run(&mut self, session: BrokerSession) -> RelayResult<()> {
        let span = crate::lifecycle_span!(agent_id = %session.agent_id(), role = "front_line");
        self.serve(session).instrument(span).await
    }
}

/// One line per registered agent (pure function)
pub fn format_agent_list(agents: &[AgentIdentity]) -> String {
    if agents.is_empty() {
        return "No agents are registered.".to_string();
    }

    let mut lines = vec![format!("Registered agents ({}):", agents.len())];
    lines.extend(
        agents
            .iter()
            .map(|agent| format!("- {} ({}): {}", agent.id, agent.display_name, agent.description)),
    );
    lines.join("\n")
}
