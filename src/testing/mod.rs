//! Testing utilities and mock implementations
//!
//! Doubles for exercising agents without an external broker or a person at
//! the terminal.

pub mod mocks;

pub use mocks::*;
