//! Agent Relay - multi-agent pull request testing over a thread broker
//!
//! A front-line agent takes a GitHub repository and pull request number from
//! a person, then delegates three stages to specialist agents over a shared
//! broker: checking out the pull request, listing the changed files with
//! their patches, and running the tests that cover those files. The stage
//! replies are collected into one report.
//!
//! # Overview
//!
//! - [`protocol`] - agent identities, thread messages and broker topics
//! - [`broker`] - the broker protocol trait and the in-process broker
//! - [`transport`] - the MQTT-backed broker
//! - [`session`] - broker sessions and the supervised reconnect loop
//! - [`thread`], [`waiter`] - thread handles and mention waiting
//! - [`delegation`] - one instruction/reply exchange with a specialist
//! - [`pipeline`] - the staged checkout, diff review and test run
//! - [`specialist`] - the agents serving each stage
//! - [`tools`] - schema-validated tools backing the specialists
//!
//! # Quick Start
//!
//! ```rust
//! use agentrelay::delegation::Instruction;
//!
//! let instruction = Instruction::Checkout {
//!     repo: "octocat/hello-world".to_string(),
//!     pr_number: 42,
//! };
//!
//! let text = instruction.render();
//! assert_eq!(Instruction::parse(&text), Some(instruction));
//! ```

pub mod broker;
pub mod config;
pub mod delegation;
pub mod error;
pub mod human;
pub mod observability;
pub mod pipeline;
pub mod protocol;
pub mod session;
pub mod specialist;
pub mod testing;
pub mod thread;
pub mod tools;
pub mod transport;
pub mod waiter;

pub use config::AgentConfig;
pub use error::{RelayError, RelayResult};
pub use protocol::*;
