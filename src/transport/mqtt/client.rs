//! MQTT-backed broker client
//!
//! [`MqttConnector`] opens one rumqttc v5 connection per session and hands
//! out an [`MqttBroker`]. A background task drives the event loop and folds
//! incoming publishes into the shared [`RelayView`]. When the connection
//! drops the task ends, the state turns `Disconnected` and every further call
//! fails with `ConnectionLost`; the session supervisor then connects again.

use super::connection::{
    configure_mqtt_options, status_payload, subscription_topics, ConnectionState, MqttError,
};
use super::message_handler::{route_mqtt_event, EventRoute, RelayView, ViewUpdate};
use crate::broker::{Broker, BrokerConnector, BrokerError, BrokerResult};
use crate::config::BrokerSection;
use crate::protocol::{
    validate_agent_id, AgentIdentity, AgentStatusType, Message, Registration, RelayTopic,
    ThreadInfo,
};
use async_trait::async_trait;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, EventLoop};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const CONNACK_TIMEOUT: Duration = Duration::from_secs(10);
const GATE_POLL_INTERVAL: Duration = Duration::from_millis(100);

type SharedView = Arc<Mutex<RelayView>>;

fn lock_view(view: &SharedView) -> MutexGuard<'_, RelayView> {
    view.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct MqttBroker {
    agent_id: String,
    client: AsyncClient,
    view: SharedView,
    mentions: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
    state_rx: watch::Receiver<ConnectionState>,
    event_loop_handle: JoinHandle<()>,
}

impl MqttBroker {
    fn ensure_connected(&self) -> BrokerResult<()> {
        let state = self.state_rx.borrow().clone();
        if state.is_connected() {
            Ok(())
        } else {
            Err(MqttError::NotConnected { state }.into())
        }
    }

    async fn publish_json<T: serde::Serialize>(
        &self,
        topic: RelayTopic,
        value: &T,
        retain: bool,
    ) -> BrokerResult<()> {
        let payload = serde_json::to_vec(value).map_err(BrokerError::Serialization)?;
        self.client
            .publish(topic.to_topic(), QoS::AtLeastOnce, retain, payload)
            .await
            .map_err(MqttError::from)?;
        Ok(())
    }

    /// Current descriptor of an open thread
    fn open_thread(&self, thread_id: &str) -> BrokerResult<ThreadInfo> {
        let info = lock_view(&self.view)
            .threads
            .get(thread_id)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownThread(thread_id.to_string()))?;
        if info.closed {
            return Err(BrokerError::ThreadClosed(thread_id.to_string()));
        }
        Ok(info)
    }

    async fn update_thread(&self, info: ThreadInfo) -> BrokerResult<()> {
        self.publish_json(RelayTopic::ThreadMeta(info.thread_id.clone()), &info, true)
            .await?;
        lock_view(&self.view)
            .threads
            .insert(info.thread_id.clone(), info);
        Ok(())
    }

    fn is_registered(&self, agent_id: &str) -> bool {
        lock_view(&self.view).agents.contains_key(agent_id)
    }

    /// Drive the event loop until the connection drops
    async fn run_event_loop(
        agent_id: String,
        mut event_loop: EventLoop,
        view: SharedView,
        mentions_tx: mpsc::UnboundedSender<Message>,
        state_tx: watch::Sender<ConnectionState>,
    ) {
        loop {
            match event_loop.poll().await {
                Ok(event) => match route_mqtt_event(&event) {
                    EventRoute::ConnectionAcknowledged => {
                        state_tx.send_replace(ConnectionState::Connected);
                    }
                    EventRoute::MessageReceived { topic, payload, .. } => {
                        let update = lock_view(&view).apply(&agent_id, &topic, &payload);
                        if let ViewUpdate::Mention(message) = update {
                            debug!(topic = %topic, message_id = %message.message_id(), "Mention received");
                            if mentions_tx.send(message).is_err() {
                                break;
                            }
                        }
                    }
                    EventRoute::Disconnected => {
                        warn!(agent_id = %agent_id, "Broker sent disconnect");
                        state_tx.send_replace(ConnectionState::Disconnected(
                            "disconnected by broker".to_string(),
                        ));
                        break;
                    }
                    EventRoute::Infrastructure => {}
                },
                Err(e) => {
                    error!(agent_id = %agent_id, error = %e, "MQTT event loop error");
                    state_tx.send_replace(ConnectionState::Disconnected(e.to_string()));
                    break;
                }
            }
        }
        info!(agent_id = %agent_id, "MQTT event loop stopped");
    }
}

impl Drop for MqttBroker {
    fn drop(&mut self) {
        self.event_loop_handle.abort();
    }
}

#[async_trait]
impl Broker for MqttBroker {
    async fn register_agent(&self, agent: &AgentIdentity) -> BrokerResult<Registration> {
        self.ensure_connected()?;
        validate_agent_id(&agent.id).map_err(|e| BrokerError::invalid_request(e.to_string()))?;

        if self.is_registered(&agent.id) {
            return Ok(Registration::AlreadyRegistered);
        }

        let payload = status_payload(agent, AgentStatusType::Available)?;
        self.client
            .publish(
                RelayTopic::AgentStatus(agent.id.clone()).to_topic(),
                QoS::AtLeastOnce,
                true,
                payload,
            )
            .await
            .map_err(MqttError::from)?;
        lock_view(&self.view)
            .agents
            .insert(agent.id.clone(), agent.clone());

        info!(agent_id = %agent.id, "Registered agent");
        Ok(Registration::Created)
    }

    async fn list_agents(&self) -> BrokerResult<Vec<AgentIdentity>> {
        self.ensure_connected()?;
        Ok(lock_view(&self.view).agents.values().cloned().collect())
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
        for agent_id in participant_ids.iter().map(String::as_str).chain([creator_id]) {
            if !self.is_registered(agent_id) {
                return Err(BrokerError::UnknownAgent(agent_id.to_string()));
            }
        }

        let info = ThreadInfo::new(name, creator_id, participant_ids.iter().cloned());
        self.update_thread(info.clone()).await?;
        debug!(thread_id = %info.thread_id, name = %name, "Created thread");
        Ok(info)
    }

    async fn add_participant(&self, thread_id: &str, agent_id: &str) -> BrokerResult<()> {
        self.ensure_connected()?;
        if !self.is_registered(agent_id) {
            return Err(BrokerError::UnknownAgent(agent_id.to_string()));
        }
        let mut info = self.open_thread(thread_id)?;
        if info.participant_ids.insert(agent_id.to_string()) {
            self.update_thread(info).await?;
        }
        Ok(())
    }

    async fn remove_participant(&self, thread_id: &str, agent_id: &str) -> BrokerResult<()> {
        self.ensure_connected()?;
        let mut info = self.open_thread(thread_id)?;
        if info.participant_ids.remove(agent_id) {
            self.update_thread(info).await?;
        }
        Ok(())
    }

    async fn close_thread(&self, thread_id: &str) -> BrokerResult<()> {
        self.ensure_connected()?;
        let mut info = self.open_thread(thread_id)?;
        info.closed = true;
        self.update_thread(info).await
    }

    async fn thread_info(&self, thread_id: &str) -> BrokerResult<ThreadInfo> {
        self.ensure_connected()?;
        lock_view(&self.view)
            .threads
            .get(thread_id)
            .cloned()
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

        let info = self.open_thread(thread_id)?;
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
        self.publish_json(
            RelayTopic::ThreadMessages(thread_id.to_string()),
            &message,
            false,
        )
        .await?;
        for agent_id in message.mention_ids() {
            self.publish_json(RelayTopic::AgentMentions(agent_id.clone()), &message, false)
                .await?;
        }

        lock_view(&self.view).record_message(message.clone());
        Ok(message)
    }

    async fn wait_for_mentions(
        &self,
        agent_id: &str,
        timeout: Duration,
    ) -> BrokerResult<Vec<Message>> {
        self.ensure_connected()?;
        if agent_id != self.agent_id {
            return Err(BrokerError::invalid_request(format!(
                "this connection only receives mentions for {}",
                self.agent_id
            )));
        }

        let mut mentions = self.mentions.lock().await;
        let mut delivered = Vec::new();
        while let Ok(message) = mentions.try_recv() {
            delivered.push(message);
        }
        if !delivered.is_empty() {
            return Ok(delivered);
        }

        match tokio::time::timeout(timeout, mentions.recv()).await {
            Err(_) => Ok(Vec::new()),
            Ok(None) => Err(BrokerError::connection_lost("MQTT event loop stopped")),
            Ok(Some(first)) => {
                delivered.push(first);
                while let Ok(message) = mentions.try_recv() {
                    delivered.push(message);
                }
                Ok(delivered)
            }
        }
    }

    async fn thread_history(&self, thread_id: &str) -> BrokerResult<Vec<Message>> {
        self.ensure_connected()?;
        let view = lock_view(&self.view);
        if !view.threads.contains_key(thread_id) {
            return Err(BrokerError::UnknownThread(thread_id.to_string()));
        }
        Ok(view.history(thread_id))
    }

    fn is_connected(&self) -> bool {
        self.state_rx.borrow().is_connected()
    }
}

/// Opens MQTT sessions for the session supervisor
pub struct MqttConnector {
    config: BrokerSection,
}

impl MqttConnector {
    pub fn new(config: BrokerSection) -> Self {
        Self { config }
    }

    async fn wait_for_connack(mut state_rx: watch::Receiver<ConnectionState>) -> BrokerResult<()> {
        let confirmed = tokio::time::timeout(CONNACK_TIMEOUT, async {
            loop {
                let state = state_rx.borrow_and_update().clone();
                match state {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Disconnected(reason) => {
                        return Err(BrokerError::connection_lost(reason))
                    }
                    ConnectionState::Connecting => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(BrokerError::connection_lost("event loop ended"));
                }
            }
        })
        .await;

        confirmed.unwrap_or_else(|_| {
            Err(BrokerError::connection_lost(
                "ConnAck timeout - no connection confirmation received",
            ))
        })
    }

    /// Wait until the retained registry lists enough agents
    async fn wait_for_agents(&self, broker: &MqttBroker) -> BrokerResult<()> {
        let wanted = self.config.wait_for_agents;
        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.config.wait_for_agents_timeout_secs);

        loop {
            broker.ensure_connected()?;
            // Counts this agent too, like the in-process gate
            let known = {
                let view = lock_view(&broker.view);
                view.agents.len() + usize::from(!view.agents.contains_key(&broker.agent_id))
            };
            if known >= wanted {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(BrokerError::connection_lost(format!(
                    "timed out waiting for {wanted} agents (saw {known})"
                )));
            }
            tokio::time::sleep(GATE_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl BrokerConnector for MqttConnector {
    async fn connect(&self, agent: &AgentIdentity) -> BrokerResult<Arc<dyn Broker>> {
        let options = configure_mqtt_options(agent, &self.config)?;
        let (client, event_loop) = AsyncClient::new(options, 64);

        let view: SharedView = Arc::new(Mutex::new(RelayView::default()));
        let (mentions_tx, mentions_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        let event_loop_handle = tokio::spawn(MqttBroker::run_event_loop(
            agent.id.clone(),
            event_loop,
            view.clone(),
            mentions_tx,
            state_tx,
        ));

        let broker = MqttBroker {
            agent_id: agent.id.clone(),
            client,
            view,
            mentions: tokio::sync::Mutex::new(mentions_rx),
            state_rx: state_rx.clone(),
            event_loop_handle,
        };

        Self::wait_for_connack(state_rx).await?;
        for topic in subscription_topics(&agent.id) {
            broker
                .client
                .subscribe(topic, QoS::AtLeastOnce)
                .await
                .map_err(MqttError::from)?;
        }
        info!(agent_id = %agent.id, broker = %self.config.url, "MQTT session established");

        if self.config.wait_for_agents > 0 {
            self.wait_for_agents(&broker).await?;
        }

        Ok(Arc::new(broker))
    }

    fn describe(&self) -> String {
        self.config.url.clone()
    }
}
