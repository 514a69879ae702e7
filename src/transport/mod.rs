//! Network transports for the broker protocol
//!
//! The in-process broker lives in [`crate::broker::memory`]; everything that
//! crosses a socket lives here.

pub mod mqtt;

pub use mqtt::{MqttBroker, MqttConnector};
