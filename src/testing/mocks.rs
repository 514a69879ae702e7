//! Mock implementations for testing
//!
//! Test doubles for the broker seams and the human boundary, all backed by
//! [`InMemoryBroker`] so no external broker is needed.

use crate::broker::{Broker, BrokerConnector, BrokerError, BrokerResult, InMemoryBroker};
use crate::human::HumanInterface;
use crate::protocol::{AgentIdentity, Message, Registration, ThreadInfo};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Connector whose connect attempts fail on a schedule
///
/// Successful attempts hand out the wrapped in-memory broker.
#[derive(Debug)]
pub struct FlakyConnector {
    broker: Arc<InMemoryBroker>,
    schedule: Option<Vec<bool>>,
    fail_first: usize,
    attempts: AtomicUsize,
}

impl FlakyConnector {
    /// Fail the first `count` attempts, then succeed
    pub fn failing(count: usize) -> Self {
        Self {
            broker: Arc::new(InMemoryBroker::new()),
            schedule: None,
            fail_first: count,
            attempts: AtomicUsize::new(0),
        }
    }

    /// Attempt `i` succeeds when `schedule[i]` is true; past the end, succeed
    pub fn with_schedule(schedule: Vec<bool>) -> Self {
        Self {
            schedule: Some(schedule),
            ..Self::failing(0)
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn broker(&self) -> &Arc<InMemoryBroker> {
        &self.broker
    }
}

#[async_trait]
impl BrokerConnector for FlakyConnector {
    async fn connect(&self, _agent: &AgentIdentity) -> BrokerResult<Arc<dyn Broker>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        let succeeds = match &self.schedule {
            Some(schedule) => schedule.get(attempt).copied().unwrap_or(true),
            None => attempt >= self.fail_first,
        };

        if succeeds {
            Ok(self.broker.clone() as Arc<dyn Broker>)
        } else {
            Err(BrokerError::connection_lost(format!(
                "scripted connect failure #{}",
                attempt + 1
            )))
        }
    }

    fn describe(&self) -> String {
        "flaky://".to_string()
    }
}

/// Broker wrapper counting polls and sends
pub struct CountingBroker {
    inner: Arc<InMemoryBroker>,
    polls: AtomicUsize,
    sends: AtomicUsize,
}

impl CountingBroker {
    pub fn new(inner: Arc<InMemoryBroker>) -> Self {
        Self {
            inner,
            polls: AtomicUsize::new(0),
            sends: AtomicUsize::new(0),
        }
    }

    /// `wait_for_mentions` calls so far
    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    /// `send_message` calls so far
    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Broker for CountingBroker {
    async fn register_agent(&self, agent: &AgentIdentity) -> BrokerResult<Registration> {
        self.inner.register_agent(agent).await
    }

    async fn list_agents(&self) -> BrokerResult<Vec<AgentIdentity>> {
        self.inner.list_agents().await
    }

    async fn create_thread(
        &self,
        name: &str,
        creator_id: &str,
        participant_ids: &[String],
    ) -> BrokerResult<ThreadInfo> {
        self.inner
            .create_thread(name, creator_id, participant_ids)
            .await
    }

    async fn add_participant(&self, thread_id: &str, agent_id: &str) -> BrokerResult<()> {
        self.inner.add_participant(thread_id, agent_id).await
    }

    async fn remove_participant(&self, thread_id: &str, agent_id: &str) -> BrokerResult<()> {
        self.inner.remove_participant(thread_id, agent_id).await
    }

    async fn close_thread(&self, thread_id: &str) -> BrokerResult<()> {
        self.inner.close_thread(thread_id).await
    }

    async fn thread_info(&self, thread_id: &str) -> BrokerResult<ThreadInfo> {
        self.inner.thread_info(thread_id).await
    }

    async fn send_message(
        &self,
        thread_id: &str,
        sender_id: &str,
        mentions: &[String],
        content: &str,
    ) -> BrokerResult<Message> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        self.inner
            .send_message(thread_id, sender_id, mentions, content)
            .await
    }

    async fn wait_for_mentions(
        &self,
        agent_id: &str,
        timeout: Duration,
    ) -> BrokerResult<Vec<Message>> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        self.inner.wait_for_mentions(agent_id, timeout).await
    }

    async fn thread_history(&self, thread_id: &str) -> BrokerResult<Vec<Message>> {
        self.inner.thread_history(thread_id).await
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }
}

/// Stand-in specialist answering each mention from a script
///
/// Entry `i` answers the `i`-th mention: `Some(content)` replies in the same
/// thread mentioning the sender, `None` stays silent. Once the script runs
/// out every further mention is ignored.
pub struct ScriptedResponder {
    broker: Arc<dyn Broker>,
    identity: AgentIdentity,
    script: VecDeque<Option<String>>,
}

impl ScriptedResponder {
    pub fn new(broker: Arc<dyn Broker>, agent_id: &str) -> Self {
        Self {
            broker,
            identity: AgentIdentity::new(agent_id, agent_id, "scripted responder"),
            script: VecDeque::new(),
        }
    }

    pub fn reply(mut self, content: impl Into<String>) -> Self {
        self.script.push_back(Some(content.into()));
        self
    }

    pub fn stay_silent(mut self) -> Self {
        self.script.push_back(None);
        self
    }

    /// Register, then answer mentions in a background task
    pub async fn spawn(self) -> BrokerResult<ResponderHandle> {
        self.broker.register_agent(&self.identity).await?;

        let received = Arc::new(Mutex::new(Vec::new()));
        let log = received.clone();
        let ScriptedResponder {
            broker,
            identity,
            mut script,
        } = self;

        let task = tokio::spawn(async move {
            loop {
                let delivered = match broker
                    .wait_for_mentions(&identity.id, Duration::from_millis(10))
                    .await
                {
                    Ok(delivered) => delivered,
                    Err(_) => return,
                };

                for message in delivered {
                    if let Ok(mut log) = log.lock() {
                        log.push(message.content().to_string());
                    }
                    if let Some(Some(reply)) = script.pop_front() {
                        let _ = broker
                            .send_message(
                                message.thread_id(),
                                &identity.id,
                                &[message.sender_id().to_string()],
                                &reply,
                            )
                            .await;
                    }
                }
            }
        });

        Ok(ResponderHandle { received, task })
    }
}

/// Running [`ScriptedResponder`]; aborts its task on drop
pub struct ResponderHandle {
    received: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl ResponderHandle {
    /// Contents of every mention received so far
    pub fn received(&self) -> Vec<String> {
        self.received
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }
}

impl Drop for ResponderHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Human answering from a queue and recording what it was shown
#[derive(Debug, Default)]
pub struct ScriptedHuman {
    answers: VecDeque<String>,
    pub asked: Vec<String>,
    pub told: Vec<String>,
}

impl ScriptedHuman {
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            answers: answers.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl HumanInterface for ScriptedHuman {
    async fn ask(&mut self, question: &str) -> io::Result<Option<String>> {
        self.asked.push(question.to_string());
        Ok(self.answers.pop_front())
    }

    async fn tell(&mut self, message: &str) -> io::Result<()> {
        self.told.push(message.to_string());
        Ok(())
    }
}
