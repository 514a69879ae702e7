//! Protocol records and topic grammar shared by every agent
//!
//! Agents only ever exchange the types defined here: identities, thread
//! descriptors and immutable messages.

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
