//! Topic canonicalization, topic parsing and agent ID validation
//!
//! Broker topics follow a small fixed grammar:
//!
//! - `/control/agents/{agent_id}/status` - retained registration record
//! - `/control/agents/{agent_id}/mentions` - messages addressed to one agent
//! - `/threads/{thread_id}/meta` - retained thread descriptor
//! - `/threads/{thread_id}/messages` - ordered thread log

use thiserror::Error;

pub fn canonicalize_topic(topic: &str) -> String {
    if topic.is_empty() {
        return "/".to_string();
    }

    // Single leading slash
    let mut result = if topic.starts_with('/') {
        topic.to_string()
    } else {
        format!("/{topic}")
    };

    // Collapse repeated slashes
    while result.contains("//") {
        result = result.replace("//", "/");
    }

    // No trailing slash except for root
    if result.len() > 1 && result.ends_with('/') {
        result.pop();
    }

    result
}

pub fn validate_agent_id(agent_id: &str) -> Result<(), ValidationError> {
    if agent_id.is_empty() {
        return Err(ValidationError::EmptyAgentId);
    }

    for ch in agent_id.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '.' && ch != '_' && ch != '-' {
            return Err(ValidationError::InvalidAgentIdChar(ch));
        }
    }

    Ok(())
}

/// A parsed relay topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayTopic {
    AgentStatus(String),
    AgentMentions(String),
    ThreadMeta(String),
    ThreadMessages(String),
}

impl RelayTopic {
    /// Parse a topic into its relay meaning (pure function)
    ///
    /// Returns `None` for topics outside the relay grammar.
    pub fn parse(topic: &str) -> Option<Self> {
        let canonical = canonicalize_topic(topic);
        let segments: Vec<&str> = canonical.trim_start_matches('/').split('/').collect();

        match segments.as_slice() {
            ["control", "agents", id, "status"] => Some(Self::AgentStatus(id.to_string())),
            ["control", "agents", id, "mentions"] => Some(Self::AgentMentions(id.to_string())),
            ["threads", id, "meta"] => Some(Self::ThreadMeta(id.to_string())),
            ["threads", id, "messages"] => Some(Self::ThreadMessages(id.to_string())),
            _ => None,
        }
    }

    /// Render the topic string
    pub fn to_topic(&self) -> String {
        let raw = match self {
            Self::AgentStatus(id) => format!("/control/agents/{id}/status"),
            Self::AgentMentions(id) => format!("/control/agents/{id}/mentions"),
            Self::ThreadMeta(id) => format!("/threads/{id}/meta"),
            Self::ThreadMessages(id) => format!("/threads/{id}/messages"),
        };
        canonicalize_topic(&raw)
    }
}

/// Validation errors for agent protocol
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Agent ID cannot be empty")]
    EmptyAgentId,
    #[error("Agent ID contains invalid character: '{0}'")]
    InvalidAgentIdChar(char),
}
