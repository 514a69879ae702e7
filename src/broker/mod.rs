//! Broker protocol abstraction
//!
//! The broker stores threads, keeps the agent registry and delivers mentions.
//! It is an external collaborator: agents talk to it only through the
//! [`Broker`] trait, which mirrors the broker's request/response operations.
//! Implementations:
//!
//! - [`memory::InMemoryBroker`] - in-process broker (`memory://`)
//! - [`crate::transport::mqtt::MqttBroker`] - MQTT-backed broker (`mqtt://`, `mqtts://`)

use crate::protocol::{AgentIdentity, Message, Registration, ThreadInfo};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod memory;

pub use memory::{InMemoryBroker, InMemoryConnector};

/// Errors reported by a broker implementation
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
    #[error("Unknown thread: {0}")]
    UnknownThread(String),
    #[error("Unknown agent: {0}")]
    UnknownAgent(String),
    #[error("Thread is closed: {0}")]
    ThreadClosed(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Serialization error")]
    Serialization(#[source] serde_json::Error),
}

impl BrokerError {
    /// Transport-level failure that the session supervisor recovers from
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, BrokerError::ConnectionLost(_))
    }

    pub fn connection_lost<S: Into<String>>(reason: S) -> Self {
        Self::ConnectionLost(reason.into())
    }

    pub fn invalid_request<S: Into<String>>(reason: S) -> Self {
        Self::InvalidRequest(reason.into())
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Broker operations, one per protocol call
///
/// Every call may fail with [`BrokerError::ConnectionLost`]; callers never
/// retry that themselves, the session supervisor does.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Register an agent. Registering a known id is not an error.
    async fn register_agent(&self, agent: &AgentIdentity) -> BrokerResult<Registration>;

    /// All registered agents, ordered by id
    async fn list_agents(&self) -> BrokerResult<Vec<AgentIdentity>>;

    async fn create_thread(
        &self,
        name: &str,
        creator_id: &str,
        participant_ids: &[String],
    ) -> BrokerResult<ThreadInfo>;

    async fn add_participant(&self, thread_id: &str, agent_id: &str) -> BrokerResult<()>;

    async fn remove_participant(&self, thread_id: &str, agent_id: &str) -> BrokerResult<()>;

    async fn close_thread(&self, thread_id: &str) -> BrokerResult<()>;

    async fn thread_info(&self, thread_id: &str) -> BrokerResult<ThreadInfo>;

    /// Append a message to a thread and deliver it to every mentioned agent
    async fn send_message(
        &self,
        thread_id: &str,
        sender_id: &str,
        mentions: &[String],
        content: &str,
    ) -> BrokerResult<Message>;

    /// Wait up to `timeout` for messages mentioning `agent_id`
    ///
    /// Returns every message delivered since the previous call, in delivery
    /// order, or an empty vector once the timeout elapses.
    async fn wait_for_mentions(
        &self,
        agent_id: &str,
        timeout: Duration,
    ) -> BrokerResult<Vec<Message>>;

    /// Ordered message log of a thread
    async fn thread_history(&self, thread_id: &str) -> BrokerResult<Vec<Message>>;

    fn is_connected(&self) -> bool;
}

/// Establishes fresh broker connections for the session supervisor
///
/// The connector owns the connection precondition (`wait_for_agents`): it
/// only hands out a broker once enough agents are registered.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, agent: &AgentIdentity) -> BrokerResult<Arc<dyn Broker>>;

    /// Broker URL for logging
    fn describe(&self) -> String;
}
