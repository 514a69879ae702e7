//! Bounded mention polling
//!
//! [`MentionWaiter`] asks the broker for messages addressed to the calling
//! agent at most `max_attempts` times. Each poll blocks for the request's
//! timeout; there is no extra delay between polls.

use crate::broker::BrokerResult;
use crate::delegation::reply_reference;
use crate::protocol::Message;
use crate::session::BrokerSession;
use std::time::Duration;
use tracing::{debug, info};

/// One bounded wait, created per poll cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitRequest {
    /// Agent whose mentions are polled
    pub agent_id: String,
    pub timeout: Duration,
    /// Polls already made
    pub attempt: u32,
    pub max_attempts: u32,
}

impl WaitRequest {
    pub fn new(agent_id: impl Into<String>, timeout: Duration, max_attempts: u32) -> Self {
        Self {
            agent_id: agent_id.into(),
            timeout,
            attempt: 0,
            max_attempts,
        }
    }

    /// Count one more poll; `None` once the budget is spent
    ///
    /// `attempt` never exceeds `max_attempts`.
    pub fn next_attempt(&mut self) -> Option<u32> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        self.attempt += 1;
        Some(self.attempt)
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Which replies count for a wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyFilter {
    /// Sender whose reply is awaited
    pub sender_id: String,
    /// Thread the exchange runs in
    pub thread_id: String,
    /// Reference the reply must echo, when the instruction carried one
    pub reference: Option<String>,
}

impl ReplyFilter {
    pub fn new(sender_id: impl Into<String>, thread_id: impl Into<String>) -> Self {
        Self {
            sender_id: sender_id.into(),
            thread_id: thread_id.into(),
            reference: None,
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    /// A reply echoing a different reference answers an earlier request and
    /// never matches. Replies without a reference are matched on sender and
    /// thread alone.
    pub fn matches(&self, message: &Message) -> bool {
        if message.sender_id() != self.sender_id || message.thread_id() != self.thread_id {
            return false;
        }
        match (&self.reference, reply_reference(message.content())) {
            (Some(expected), Some(echoed)) => *expected == echoed,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    /// First message from the awaited sender in the active thread
    Received(Message),
    /// Every poll came back without a matching message
    NoResponse { awaited: String, attempts: u32 },
}

pub struct MentionWaiter<'a> {
    session: &'a BrokerSession,
}

impl<'a> MentionWaiter<'a> {
    pub fn new(session: &'a BrokerSession) -> Self {
        Self { session }
    }

    /// Poll until a matching message arrives or the request is exhausted
    ///
    /// Messages that do not match `filter` are skipped; they stay in their
    /// thread's history. Transport failures propagate unchanged.
    pub async fn wait(
        &self,
        mut request: WaitRequest,
        filter: &ReplyFilter,
    ) -> BrokerResult<WaitOutcome> {
        while let Some(attempt) = request.next_attempt() {
            let delivered = self
                .session
                .poll_mentions(&request.agent_id, request.timeout)
                .await?;

            let count = delivered.len();
            if let Some(reply) = first_match(delivered, filter) {
                debug!(
                    agent_id = %request.agent_id,
                    sender_id = %filter.sender_id,
                    attempt,
                    "Reply received"
                );
                return Ok(WaitOutcome::Received(reply));
            }

            info!(
                agent_id = %request.agent_id,
                awaited = %filter.sender_id,
                skipped = count,
                attempt,
                max_attempts = request.max_attempts,
                "No reply yet"
            );
        }

        Ok(WaitOutcome::NoResponse {
            awaited: filter.sender_id.clone(),
            attempts: request.attempt,
        })
    }
}

/// First message in delivery order that passes `filter` (pure function)
pub fn first_match(delivered: Vec<Message>, filter: &ReplyFilter) -> Option<Message> {
    delivered.into_iter().find(|message| filter.matches(message))
}
