//! Broker session
//!
//! [`BrokerSession`] is the only path from agent code to the broker. It wraps
//! one live connection handed out by a [`crate::broker::BrokerConnector`];
//! when that connection is lost the [`SessionSupervisor`] drops the session
//! and builds a new one.

use crate::broker::{Broker, BrokerResult};
use crate::observability::metrics::metrics;
use crate::protocol::{AgentIdentity, Message, Registration, ThreadInfo};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub mod policy;
pub mod supervisor;

pub use policy::{ReconnectPolicy, ReconnectionDecision};
pub use supervisor::{SessionError, SessionHealth, SessionSupervisor, SessionWorkload};

/// One live broker connection, owned by the agent it was opened for
#[derive(Clone)]
pub struct BrokerSession {
    broker: Arc<dyn Broker>,
    agent: AgentIdentity,
}

impl std::fmt::Debug for BrokerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerSession")
            .field("agent_id", &self.agent.id)
            .field("connected", &self.broker.is_connected())
            .finish()
    }
}

impl BrokerSession {
    pub fn new(broker: Arc<dyn Broker>, agent: AgentIdentity) -> Self {
        Self { broker, agent }
    }

    /// Identity this session was opened for
    pub fn agent(&self) -> &AgentIdentity {
        &self.agent
    }

    pub fn agent_id(&self) -> &str {
        &self.agent.id
    }

    pub fn is_connected(&self) -> bool {
        self.broker.is_connected()
    }

    /// Register an agent; a second registration of the same id is a no-op
    pub async fn register(&self, agent: &AgentIdentity) -> BrokerResult<Registration> {
        let registration = self.broker.register_agent(agent).await?;
        match registration {
            Registration::Created => info!(agent_id = %agent.id, "Agent registered"),
            Registration::AlreadyRegistered => {
                debug!(agent_id = %agent.id, "Agent already known to broker")
            }
        }
        Ok(registration)
    }

    pub async fn list_agents(&self) -> BrokerResult<Vec<AgentIdentity>> {
        self.broker.list_agents().await
    }

    /// Create a thread owned by this session's agent
    pub async fn create_thread(
        &self,
        name: &str,
        participant_ids: &[String],
    ) -> BrokerResult<ThreadInfo> {
        let thread = self
            .broker
            .create_thread(name, &self.agent.id, participant_ids)
            .await?;
        info!(thread_id = %thread.thread_id, name = %name, "Thread created");
        Ok(thread)
    }

    pub async fn add_participant(&self, thread_id: &str, agent_id: &str) -> BrokerResult<()> {
        debug!(thread_id = %thread_id, agent_id = %agent_id, "Adding participant");
        self.broker.add_participant(thread_id, agent_id).await
    }

    pub async fn remove_participant(&self, thread_id: &str, agent_id: &str) -> BrokerResult<()> {
        debug!(thread_id = %thread_id, agent_id = %agent_id, "Removing participant");
        self.broker.remove_participant(thread_id, agent_id).await
    }

    pub async fn close_thread(&self, thread_id: &str) -> BrokerResult<()> {
        info!(thread_id = %thread_id, "Closing thread");
        self.broker.close_thread(thread_id).await
    }

    pub async fn thread_info(&self, thread_id: &str) -> BrokerResult<ThreadInfo> {
        self.broker.thread_info(thread_id).await
    }

    pub async fn send_message(
        &self,
        thread_id: &str,
        sender_id: &str,
        mentions: &[String],
        content: &str,
    ) -> BrokerResult<Message> {
        let message = self
            .broker
            .send_message(thread_id, sender_id, mentions, content)
            .await
            .map_err(|e| {
                if e.is_connection_lost() {
                    warn!(thread_id = %thread_id, error = %e, "Send failed, connection lost");
                }
                e
            })?;

        metrics().message_sent();
        debug!(
            thread_id = %thread_id,
            message_id = %message.message_id(),
            mentions = ?mentions,
            "Message sent"
        );
        Ok(message)
    }

    /// One `wait_for_mentions` call; an empty result means the timeout elapsed
    pub async fn poll_mentions(
        &self,
        agent_id: &str,
        timeout: Duration,
    ) -> BrokerResult<Vec<Message>> {
        let messages = self.broker.wait_for_mentions(agent_id, timeout).await?;
        metrics().mention_poll(messages.len());
        debug!(
            agent_id = %agent_id,
            delivered = messages.len(),
            timeout_ms = timeout.as_millis() as u64,
            "Mention poll returned"
        );
        Ok(messages)
    }

    pub async fn thread_history(&self, thread_id: &str) -> BrokerResult<Vec<Message>> {
        self.broker.thread_history(thread_id).await
    }
}
