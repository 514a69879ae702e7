//! Pure connection configuration for the MQTT broker client
//!
//! Option building, subscription topics and error mapping. Nothing in here
//! touches the network.

use crate::broker::BrokerError;
use crate::config::BrokerSection;
use crate::protocol::{AgentIdentity, AgentRecord, AgentStatusType, RelayTopic};
use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::{mqttbytes::QoS, MqttOptions};
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

/// Connection state published by the event loop task
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Waiting for ConnAck
    Connecting,
    Connected,
    /// Terminal for this client; the supervisor builds a new one
    Disconnected(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("MQTT client request failed")]
    Client(#[from] rumqttc::v5::ClientError),
    #[error("Serialization error")]
    Serialization(#[source] serde_json::Error),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
}

impl From<MqttError> for BrokerError {
    fn from(error: MqttError) -> Self {
        match error {
            MqttError::InvalidBrokerUrl(url) => {
                BrokerError::invalid_request(format!("invalid broker URL {url}"))
            }
            MqttError::Serialization(e) => BrokerError::Serialization(e),
            other => BrokerError::connection_lost(other.to_string()),
        }
    }
}

/// Build client options from the `[broker]` section (pure apart from env lookup)
///
/// The last will marks the agent unavailable on its retained status topic.
pub fn configure_mqtt_options(
    agent: &AgentIdentity,
    config: &BrokerSection,
) -> Result<MqttOptions, MqttError> {
    let url =
        Url::parse(&config.url).map_err(|_| MqttError::InvalidBrokerUrl(config.url.clone()))?;
    let host = url
        .host_str()
        .ok_or_else(|| MqttError::InvalidBrokerUrl(config.url.clone()))?;
    let tls = matches!(url.scheme(), "mqtts" | "ssl");
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    // Fresh client id per connection so a stale session never kicks us off
    let client_id = format!("{}-{}", agent.id, Uuid::new_v4().simple());
    let mut mqtt_options = MqttOptions::new(client_id, host, port);

    if tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(username_env) = &config.username_env {
        if let Ok(username) = std::env::var(username_env) {
            let password = config
                .password_env
                .as_ref()
                .and_then(|env_name| std::env::var(env_name).ok())
                .unwrap_or_default();
            mqtt_options.set_credentials(&username, &password);
        }
    }

    mqtt_options.set_keep_alive(Duration::from_secs(30));
    // Diff listings and test output can be large
    mqtt_options.set_max_packet_size(Some(1024 * 1024));

    let unavailable = status_payload(agent, AgentStatusType::Unavailable)?;
    let status_topic = RelayTopic::AgentStatus(agent.id.clone()).to_topic();
    mqtt_options.set_last_will(LastWill::new(
        status_topic,
        unavailable,
        QoS::AtLeastOnce,
        true,
        None,
    ));

    Ok(mqtt_options)
}

/// Retained status record for `agent` (pure function)
pub fn status_payload(agent: &AgentIdentity, status: AgentStatusType) -> Result<String, MqttError> {
    let record = AgentRecord {
        agent: agent.clone(),
        status,
        timestamp: chrono::Utc::now(),
    };
    serde_json::to_string(&record).map_err(MqttError::Serialization)
}

/// Topics an agent subscribes to (pure function)
///
/// Every status and thread topic feeds the local registry and thread cache;
/// mentions are only read for the agent itself.
pub fn subscription_topics(agent_id: &str) -> Vec<String> {
    vec![
        "/control/agents/+/status".to_string(),
        "/threads/+/meta".to_string(),
        "/threads/+/messages".to_string(),
        RelayTopic::AgentMentions(agent_id.to_string()).to_topic(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(url: &str) -> BrokerSection {
        BrokerSection {
            url: url.to_string(),
            username_env: None,
            password_env: None,
            wait_for_agents: 0,
            wait_for_agents_timeout_secs: 60,
        }
    }

    fn agent() -> AgentIdentity {
        AgentIdentity::new("gitclone_agent", "Git Clone Agent", "Clones repositories")
    }

    #[test]
    fn test_configure_mqtt_options() {
        let options = configure_mqtt_options(&agent(), &section("mqtt://localhost:1883")).unwrap();
        assert_eq!(options.broker_address(), ("localhost".to_string(), 1883));
        assert!(options.client_id().starts_with("gitclone_agent-"));
    }

    #[test]
    fn test_default_ports() {
        let plain = configure_mqtt_options(&agent(), &section("mqtt://broker")).unwrap();
        assert_eq!(plain.broker_address().1, 1883);
        let tls = configure_mqtt_options(&agent(), &section("mqtts://broker")).unwrap();
        assert_eq!(tls.broker_address().1, 8883);
    }

    #[test]
    fn test_invalid_broker_url() {
        let result = configure_mqtt_options(&agent(), &section("not a url"));
        assert!(matches!(result, Err(MqttError::InvalidBrokerUrl(_))));
    }

    #[test]
    fn test_subscription_topics() {
        let topics = subscription_topics("gitclone_agent");
        assert!(topics.contains(&"/control/agents/gitclone_agent/mentions".to_string()));
        assert!(!topics.iter().any(|t| t.contains("other_agent")));
    }

    #[test]
    fn test_errors_map_to_broker_errors() {
        let lost: BrokerError = MqttError::NotConnected {
            state: ConnectionState::Disconnected("eof".to_string()),
        }
        .into();
        assert!(lost.is_connection_lost());

        let invalid: BrokerError = MqttError::InvalidBrokerUrl("x".to_string()).into();
        assert!(!invalid.is_connection_lost());
    }
}
