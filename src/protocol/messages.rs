//! Protocol message types for the agent relay
//!
//! This module defines the records exchanged through the broker: agent
//! identities, thread descriptors and the immutable thread messages that carry
//! mentions between agents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Static description of one participant
///
/// Created once at process start and never mutated. The `id` is the key used
/// for mentions and participant lists.
///
/// # Examples
/// ```
/// use agentrelay::protocol::AgentIdentity;
///
/// let agent = AgentIdentity::new(
///     "gitclone_agent",
///     "Git Clone Agent",
///     "Clones GitHub repositories and checks out the branch for a specific Pull Request.",
/// );
/// assert_eq!(agent.id, "gitclone_agent");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentIdentity {
    /// Agent identifier (must match [a-zA-Z0-9._-]+)
    pub id: String,
    /// Human-readable name
    pub display_name: String,
    /// Capability description other agents read when choosing a delegate
    pub description: String,
}

impl AgentIdentity {
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            description: description.into(),
        }
    }
}

/// A message posted to a thread
///
/// Messages are immutable once sent: the fields are private and only the
/// broker constructs them. Ordering within a thread is the broker's delivery
/// order.
///
/// # Examples
/// ```
/// use agentrelay::protocol::Message;
///
/// let message = Message::new(
///     "thread-1",
///     "user_interaction_agent",
///     ["gitclone_agent".to_string()],
///     "Checkout PR #42 from 'octocat/calculator'",
/// );
/// assert!(message.mentions("gitclone_agent"));
/// assert_eq!(message.sender_id(), "user_interaction_agent");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    message_id: Uuid,
    thread_id: String,
    sender_id: String,
    mentions: BTreeSet<String>,
    content: String,
    sent_at: DateTime<Utc>,
}

impl Message {
    /// Stamp a new message with a fresh id and the current time
    pub fn new(
        thread_id: impl Into<String>,
        sender_id: impl Into<String>,
        mentions: impl IntoIterator<Item = String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            thread_id: thread_id.into(),
            sender_id: sender_id.into(),
            mentions: mentions.into_iter().collect(),
            content: content.into(),
            sent_at: Utc::now(),
        }
    }

    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    pub fn mention_ids(&self) -> &BTreeSet<String> {
        &self.mentions
    }

    /// True if the message explicitly addresses `agent_id`
    pub fn mentions(&self, agent_id: &str) -> bool {
        self.mentions.contains(agent_id)
    }

    /// True if the message addresses nobody in particular
    pub fn is_broadcast(&self) -> bool {
        self.mentions.is_empty()
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn sent_at(&self) -> DateTime<Utc> {
        self.sent_at
    }
}

/// Descriptor of a conversation thread as known to the broker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThreadInfo {
    pub thread_id: String,
    pub name: String,
    pub creator_id: String,
    pub participant_ids: BTreeSet<String>,
    #[serde(default)]
    pub closed: bool,
}

impl ThreadInfo {
    pub fn new(
        name: impl Into<String>,
        creator_id: impl Into<String>,
        participant_ids: impl IntoIterator<Item = String>,
    ) -> Self {
        let creator_id = creator_id.into();
        let mut participant_ids: BTreeSet<String> = participant_ids.into_iter().collect();
        participant_ids.insert(creator_id.clone());

        Self {
            thread_id: Uuid::new_v4().to_string(),
            name: name.into(),
            creator_id,
            participant_ids,
            closed: false,
        }
    }

    pub fn has_participant(&self, agent_id: &str) -> bool {
        self.participant_ids.contains(agent_id)
    }
}

/// Outcome of a registration call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// The broker did not know the agent before
    Created,
    /// The agent id was already registered; nothing changed
    AlreadyRegistered,
}

/// Registration record published for discovery
///
/// Retained on `/control/agents/{agent_id}/status` when the MQTT broker is used.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentRecord {
    pub agent: AgentIdentity,
    pub status: AgentStatusType,
    /// RFC 3339 format with Z suffix
    pub timestamp: DateTime<Utc>,
}

/// Agent availability
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatusType {
    Available,
    Unavailable,
}
