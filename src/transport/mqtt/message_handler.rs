//! Pure event routing and the local broker view
//!
//! The MQTT broker only stores retained records and forwards publishes, so
//! each client rebuilds the registry, thread descriptors and thread history
//! from what it receives. [`RelayView::apply`] folds one publish into that
//! view.
//!
//! History is kept only for open threads the agent takes part in, and only
//! the last [`MAX_THREAD_HISTORY`] messages of each.

use crate::protocol::{
    AgentIdentity, AgentRecord, AgentStatusType, Message, RelayTopic, ThreadInfo,
};
use rumqttc::v5::Event;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tracing::debug;
use uuid::Uuid;

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    ConnectionAcknowledged,
    MessageReceived {
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    },
    Disconnected,
    /// Acks, pings and outgoing packets
    Infrastructure,
}

/// Route an MQTT event (pure function)
pub fn route_mqtt_event(event: &Event) -> EventRoute {
    use rumqttc::v5::mqttbytes::v5::Packet;

    match event {
        Event::Incoming(Packet::ConnAck(_)) => EventRoute::ConnectionAcknowledged,
        Event::Incoming(Packet::Publish(publish)) => EventRoute::MessageReceived {
            topic: String::from_utf8_lossy(&publish.topic).to_string(),
            payload: publish.payload.to_vec(),
            retain: publish.retain,
        },
        Event::Incoming(Packet::Disconnect(_)) => EventRoute::Disconnected,
        _ => EventRoute::Infrastructure,
    }
}

/// What one publish changed
#[derive(Debug, Clone, PartialEq)]
pub enum ViewUpdate {
    /// A message mentioning this agent
    Mention(Message),
    Applied,
    Ignored,
}

/// Messages kept per thread; the oldest are dropped first
pub const MAX_THREAD_HISTORY: usize = 500;

/// Recent messages of one thread plus their ids for deduplication
#[derive(Debug, Default)]
struct ThreadLog {
    messages: VecDeque<Message>,
    ids: HashSet<Uuid>,
}

impl ThreadLog {
    fn push(&mut self, message: Message) {
        if !self.ids.insert(message.message_id()) {
            return;
        }
        self.messages.push_back(message);
        while self.messages.len() > MAX_THREAD_HISTORY {
            if let Some(dropped) = self.messages.pop_front() {
                self.ids.remove(&dropped.message_id());
            }
        }
    }
}

/// Registry, thread cache and history as seen by one client
#[derive(Debug, Default)]
pub struct RelayView {
    pub agents: BTreeMap<String, AgentIdentity>,
    pub threads: HashMap<String, ThreadInfo>,
    logs: HashMap<String, ThreadLog>,
}

impl RelayView {
    /// Fold one publish into the view
    pub fn apply(&mut self, own_id: &str, topic: &str, payload: &[u8]) -> ViewUpdate {
        let Some(relay_topic) = RelayTopic::parse(topic) else {
            return ViewUpdate::Ignored;
        };

        match relay_topic {
            RelayTopic::AgentStatus(agent_id) => {
                // An empty retained payload clears the record
                if payload.is_empty() {
                    self.agents.remove(&agent_id);
                    return ViewUpdate::Applied;
                }
                let Ok(record) = serde_json::from_slice::<AgentRecord>(payload) else {
                    debug!(topic, "Ignoring malformed status record");
                    return ViewUpdate::Ignored;
                };
                match record.status {
                    AgentStatusType::Available => {
                        self.agents.insert(agent_id, record.agent);
                    }
                    AgentStatusType::Unavailable => {
                        self.agents.remove(&agent_id);
                    }
                }
                ViewUpdate::Applied
            }
            RelayTopic::ThreadMeta(thread_id) => {
                let Ok(info) = serde_json::from_slice::<ThreadInfo>(payload) else {
                    debug!(topic, "Ignoring malformed thread descriptor");
                    return ViewUpdate::Ignored;
                };
                if info.closed || !info.has_participant(own_id) {
                    self.logs.remove(&thread_id);
                }
                self.threads.insert(thread_id, info);
                ViewUpdate::Applied
            }
            RelayTopic::ThreadMessages(_) => match serde_json::from_slice::<Message>(payload) {
                Ok(message) if self.follows(own_id, &message) => {
                    self.record_message(message);
                    ViewUpdate::Applied
                }
                _ => ViewUpdate::Ignored,
            },
            RelayTopic::AgentMentions(agent_id) if agent_id == own_id => {
                match serde_json::from_slice::<Message>(payload) {
                    Ok(message) if message.mentions(own_id) => ViewUpdate::Mention(message),
                    _ => ViewUpdate::Ignored,
                }
            }
            RelayTopic::AgentMentions(_) => ViewUpdate::Ignored,
        }
    }

    /// Whether `message` belongs to a thread whose history this agent keeps
    fn follows(&self, own_id: &str, message: &Message) -> bool {
        match self.threads.get(message.thread_id()) {
            Some(info) => !info.closed && info.has_participant(own_id),
            // Descriptor not seen yet
            None => message.sender_id() == own_id || message.mentions(own_id),
        }
    }

    /// Append to thread history once per message id
    pub fn record_message(&mut self, message: Message) {
        self.logs
            .entry(message.thread_id().to_string())
            .or_default()
            .push(message);
    }

    /// Kept messages of `thread_id`, oldest first
    pub fn history(&self, thread_id: &str) -> Vec<Message> {
        self.logs
            .get(thread_id)
            .map(|log| log.messages.iter().cloned().collect())
            .unwrap_or_default()
    }
}
