//! In-process broker
//!
//! Keeps the agent registry, thread logs and per-agent mention mailboxes in
//! memory. Used by the `demo` command, where every agent runs inside one
//! process, and by the test suite. A connection can be cut with
//! [`InMemoryBroker::disconnect`] to exercise the reconnect path.

use super::{Broker, BrokerConnector, BrokerError, BrokerResult};
use crate::protocol::{validate_agent_id, AgentIdentity, Message, Registration, ThreadInfo};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info};

#[derive(Debug, Default)]
struct ThreadState {
    info: Option<ThreadInfo>,
    messages: Vec<Message>,
}

#[derive(Debug, Default)]
struct BrokerState {
    agents: BTreeMap<String, AgentIdentity>,
    threads: HashMap<String, ThreadState>,
    mailboxes: HashMap<String, VecDeque<Message>>,
    attached: BTreeSet<String>,
}

/// Shared in-memory broker
#[derive(Debug)]
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    delivered: Notify,
    connected: AtomicBool,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            delivered: Notify::new(),
            connected: AtomicBool::new(true),
        }
    }

    /// Simulate a transport failure: every call fails with `ConnectionLost`
    /// until [`InMemoryBroker::reconnect`] is called
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.delivered.notify_waiters();
    }

    pub fn reconnect(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    /// Number of registered agents
    pub fn agent_count(&self) -> usize {
        self.lock().agents.len()
    }

    /// Messages waiting in an agent's mailbox
    pub fn pending_mentions(&self, agent_id: &str) -> usize {
        self.lock()
            .mailboxes
            .get(agent_id)
            .map_or(0, VecDeque::len)
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // A poisoned lock only means another agent task panicked mid-call;
        // the maps themselves are always left consistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_connected(&self) -> BrokerResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::connection_lost("in-memory broker disconnected"))
        }
    }

    fn attach(&self, agent_id: &str) {
        self.lock().attached.insert(agent_id.to_string());
        self.delivered.notify_waiters();
    }

    fn attached_count(&self) -> usize {
        self.lock().attached.len()
    }

    fn open_thread<'a>(
        state: &'a mut BrokerState,
        thread_id: &str,
    ) -> BrokerResult<&'a mut ThreadState> {
        let thread = state
            .threads
            .get_mut(thread_id)
            .filter(|t| t.info.is_some())
            .ok_or_else(|| BrokerError::UnknownThread(thread_id.to_string()))?;

        if thread.info.as_ref().is_some_and(|info| info.closed) {
            return Err(BrokerError::ThreadClosed(thread_id.to_string()));
        }

        Ok(thread)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn register_agent(&self, agent: &AgentIdentity) -> BrokerResult<Registration> {
        self.ensure_connected()?;
        validate_agent_id(&agent.id).map_err(|e| BrokerError::invalid_request(e.to_string()))?;

        let mut state = self.lock();
        if state.agents.contains_key(&agent.id) {
            debug!(agent_id = %agent.id, "Agent already registered");
            return Ok(Registration::AlreadyRegistered);
        }

        state.agents.insert(agent.id.clone(), agent.clone());
        state.mailboxes.entry(agent.id.clone()).or_default();
        info!(agent_id = %agent.id, "Registered new agent");
        Ok(Registration::Created)
    }

    async fn list_agents(&self) -> BrokerResult<Vec<AgentIdentity>> {
        self.ensure_connected()?;
        Ok(self.lock().agents.values().cloned().collect())
    }

    async fn create_thread(
        &self,
        name: &str,
        creator_id: &str,
        participant_ids: &[String],
    ) -> BrokerResult<ThreadInfo> {
        self.ensure_connected()?;
        if name.trim().is_empty() {
            return Err(BrokerError::invalid_request("thread name must not be empty"));
        }

        let mut state = self.lock();
        for agent_id in participant_ids.iter().map(String::as_str).chain([creator_id]) {
            if !state.agents.contains_key(agent_id) {
                return Err(BrokerError::UnknownAgent(agent_id.to_string()));
            }
        }

        let info = ThreadInfo::new(name, creator_id, participant_ids.iter().cloned());
        state.threads.insert(
            info.thread_id.clone(),
            ThreadState {
                info: Some(info.clone()),
                messages: Vec::new(),
            },
        );

        debug!(thread_id = %info.thread_id, name = %name, "Created thread");
        Ok(info)
    }

    async fn add_participant(&self, thread_id: &str, agent_id: &str) -> BrokerResult<()> {
        self.ensure_connected()?;
        let mut state = self.lock();
        if !state.agents.contains_key(agent_id) {
            return Err(BrokerError::UnknownAgent(agent_id.to_string()));
        }

        let thread = Self::open_thread(&mut state, thread_id)?;
        if let Some(info) = thread.info.as_mut() {
            info.participant_ids.insert(agent_id.to_string());
        }
        Ok(())
    }

    async fn remove_participant(&self, thread_id: &str, agent_id: &str) -> BrokerResult<()> {
        self.ensure_connected()?;
        let mut state = self.lock();
        let thread = Self::open_thread(&mut state, thread_id)?;
        if let Some(info) = thread.info.as_mut() {
            info.participant_ids.remove(agent_id);
        }
        Ok(())
    }

    async fn close_thread(&self, thread_id: &str) -> BrokerResult<()> {
        self.ensure_connected()?;
        let mut state = self.lock();
        let thread = Self::open_thread(&mut state, thread_id)?;
        if let Some(info) = thread.info.as_mut() {
            info.closed = true;
        }
        debug!(thread_id = %thread_id, "Closed thread");
        Ok(())
    }

    async fn thread_info(&self, thread_id: &str) -> BrokerResult<ThreadInfo> {
        self.ensure_connected()?;
        self.lock()
            .threads
            .get(thread_id)
            .and_then(|t| t.info.clone())
            .ok_or_else(|| BrokerError::UnknownThread(thread_id.to_string()))
    }

    async fn send_message(
        &self,
        thread_id: &str,
        sender_id: &str,
        mentions: &[String],
        content: &str,
    ) -> BrokerResult<Message> {
        self.ensure_connected()?;
        if content.trim().is_empty() {
            return Err(BrokerError::invalid_request("message content must not be empty"));
        }

        let message = {
            let mut state = self.lock();
            let thread = Self::open_thread(&mut state, thread_id)?;
            let info = thread
                .info
                .as_ref()
                .ok_or_else(|| BrokerError::UnknownThread(thread_id.to_string()))?;

            if !info.has_participant(sender_id) {
                return Err(BrokerError::invalid_request(format!(
                    "sender {sender_id} is not a participant of thread {thread_id}"
                )));
            }
            if let Some(outsider) = mentions.iter().find(|m| !info.has_participant(m)) {
                return Err(BrokerError::invalid_request(format!(
                    "mentioned agent {outsider} is not a participant of thread {thread_id}"
                )));
            }

            let message = Message::new(thread_id, sender_id, mentions.iter().cloned(), content);
            thread.messages.push(message.clone());

            for agent_id in message.mention_ids() {
                state
                    .mailboxes
                    .entry(agent_id.clone())
                    .or_default()
                    .push_back(message.clone());
            }
            message
        };

        self.delivered.notify_waiters();
        Ok(message)
    }

    async fn wait_for_mentions(
        &self,
        agent_id: &str,
        timeout: Duration,
    ) -> BrokerResult<Vec<Message>> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Register interest before checking the mailbox so a delivery that
            // lands in between still wakes us.
            let notified = self.delivered.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.ensure_connected()?;
            {
                let mut state = self.lock();
                if !state.agents.contains_key(agent_id) {
                    return Err(BrokerError::UnknownAgent(agent_id.to_string()));
                }
                let mailbox = state.mailboxes.entry(agent_id.to_string()).or_default();
                if !mailbox.is_empty() {
                    return Ok(mailbox.drain(..).collect());
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn thread_history(&self, thread_id: &str) -> BrokerResult<Vec<Message>> {
        self.ensure_connected()?;
        self.lock()
            .threads
            .get(thread_id)
            .map(|t| t.messages.clone())
            .ok_or_else(|| BrokerError::UnknownThread(thread_id.to_string()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Connector handing out the shared in-memory broker
///
/// Honors the `wait_for_agents` precondition by waiting until that many agents
/// have connected before returning.
#[derive(Debug, Clone)]
pub struct InMemoryConnector {
    broker: Arc<InMemoryBroker>,
    wait_for_agents: usize,
    gate_timeout: Duration,
}

impl InMemoryConnector {
    pub fn new(broker: Arc<InMemoryBroker>) -> Self {
        Self {
            broker,
            wait_for_agents: 0,
            gate_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_wait_for_agents(mut self, count: usize, gate_timeout: Duration) -> Self {
        self.wait_for_agents = count;
        self.gate_timeout = gate_timeout;
        self
    }

    pub fn broker(&self) -> &Arc<InMemoryBroker> {
        &self.broker
    }
}

#[async_trait]
impl BrokerConnector for InMemoryConnector {
    async fn connect(&self, agent: &AgentIdentity) -> BrokerResult<Arc<dyn Broker>> {
        self.broker.ensure_connected()?;
        self.broker.attach(&agent.id);

        let gate = async {
            loop {
                let notified = self.broker.delivered.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if self.broker.attached_count() >= self.wait_for_agents {
                    return;
                }
                notified.await;
            }
        };

        tokio::time::timeout(self.gate_timeout, gate)
            .await
            .map_err(|_| {
                BrokerError::connection_lost(format!(
                    "timed out waiting for {} agents to connect",
                    self.wait_for_agents
                ))
            })?;

        Ok(self.broker.clone() as Arc<dyn Broker>)
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}
