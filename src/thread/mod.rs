//! Conversation threads
//!
//! A [`ThreadChannel`] is one conversation seen from the agent that owns it.
//! Mentioned agents that are not yet participants are added on demand, so
//! no pairing has to be set up in advance.

use crate::broker::{BrokerError, BrokerResult};
use crate::protocol::{Message, ThreadInfo};
use crate::session::BrokerSession;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ThreadChannel {
    session: BrokerSession,
    info: ThreadInfo,
}

impl ThreadChannel {
    /// Create a new thread at the broker
    pub async fn open(
        session: BrokerSession,
        name: &str,
        participant_ids: &[String],
    ) -> BrokerResult<Self> {
        let info = session.create_thread(name, participant_ids).await?;
        Ok(Self { session, info })
    }

    /// Continue an existing thread, e.g. the one an instruction arrived on
    pub async fn join(session: BrokerSession, thread_id: &str) -> BrokerResult<Self> {
        let info = session.thread_info(thread_id).await?;
        Ok(Self { session, info })
    }

    pub fn thread_id(&self) -> &str {
        &self.info.thread_id
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Participants as last seen by this channel
    pub fn info(&self) -> &ThreadInfo {
        &self.info
    }

    pub fn session(&self) -> &BrokerSession {
        &self.session
    }

    /// Post `content` as this session's agent
    ///
    /// Empty mentions broadcast to every participant. Mentioned agents that
    /// are not participants yet are added first.
    pub async fn send(&mut self, content: &str, mentions: &[String]) -> BrokerResult<Message> {
        if content.trim().is_empty() {
            return Err(BrokerError::invalid_request("message content must not be empty"));
        }

        for agent_id in mentions {
            if !self.info.has_participant(agent_id) {
                debug!(
                    thread_id = %self.info.thread_id,
                    agent_id = %agent_id,
                    "Adding mentioned agent to thread"
                );
                self.session
                    .add_participant(&self.info.thread_id, agent_id)
                    .await?;
                self.info.participant_ids.insert(agent_id.clone());
            }
        }

        self.session
            .send_message(
                &self.info.thread_id,
                self.session.agent_id(),
                mentions,
                content,
            )
            .await
    }

    /// Ordered message log of this thread
    pub async fn history(&self) -> BrokerResult<Vec<Message>> {
        self.session.thread_history(&self.info.thread_id).await
    }

    /// Close the thread at the broker
    pub async fn close(self) -> BrokerResult<()> {
        self.session.close_thread(&self.info.thread_id).await
    }
}
