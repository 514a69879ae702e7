//! MQTT implementation of the broker protocol
//!
//! The MQTT broker only routes publishes and keeps retained messages, so the
//! relay protocol is layered on top of topics:
//!
//! - `/control/agents/{id}/status` - retained registry record per agent
//! - `/control/agents/{id}/mentions` - mention delivery for one agent
//! - `/threads/{id}/meta` - retained thread descriptor
//! - `/threads/{id}/messages` - thread message log
//!
//! The module is split into pure and impure parts:
//!
//! - [`connection`] - option building, subscription topics, error mapping
//! - [`message_handler`] - event routing and the local [`RelayView`]
//! - [`client`] - the event loop task and the [`Broker`](crate::broker::Broker) implementation
//!
//! # Usage
//!
//! ```rust,no_run
//! use agentrelay::broker::BrokerConnector;
//! use agentrelay::config::BrokerSection;
//! use agentrelay::protocol::AgentIdentity;
//! use agentrelay::transport::mqtt::MqttConnector;
//!
//! # tokio_test::block_on(async {
//! let connector = MqttConnector::new(BrokerSection {
//!     url: "mqtt://localhost:1883".to_string(),
//!     username_env: None,
//!     password_env: None,
//!     wait_for_agents: 0,
//!     wait_for_agents_timeout_secs: 60,
//! });
//!
//! let agent = AgentIdentity::new("gitclone_agent", "Git Clone Agent", "Clones repositories");
//! let broker = connector.connect(&agent).await?;
//! broker.register_agent(&agent).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::{MqttBroker, MqttConnector};
pub use connection::{ConnectionState, MqttError};
pub use message_handler::{EventRoute, RelayView, ViewUpdate};
