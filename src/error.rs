//! Crate-level error type
//!
//! Each layer has its own `thiserror` enum; [`RelayError`] collects them for
//! the agent loops. Text that reaches a human or another agent goes through
//! [`sanitize_error_message`] first.

use crate::broker::BrokerError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for agent relay operations
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Tool error: {0}")]
    Tool(#[from] crate::tools::ToolError),

    #[error("Human interface error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl RelayError {
    /// True when the session supervisor should reconnect
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, RelayError::Broker(e) if e.is_connection_lost())
    }

    /// Error text safe to show to a human
    pub fn user_message(&self) -> String {
        sanitize_error_message(&self.to_string())
    }

    /// Create invalid input error
    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create internal error
    pub fn internal_error<S: Into<String>>(message: S) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").expect("secret pattern is valid")
});

static SENSITIVE_PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
        .expect("path pattern is valid")
});

const MAX_MESSAGE_LEN: usize = 500;
const TRUNCATE_SUFFIX: &str = "...[truncated]";

/// Redact secrets and sensitive paths, cap the length at 500 bytes
pub fn sanitize_error_message(message: &str) -> String {
    let sanitized = SECRET_PATTERN.replace_all(message, "${1}=***");
    let mut sanitized = SENSITIVE_PATH_PATTERN
        .replace_all(&sanitized, "/***REDACTED***/")
        .into_owned();

    if sanitized.len() > MAX_MESSAGE_LEN {
        let mut cut = MAX_MESSAGE_LEN - TRUNCATE_SUFFIX.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str(TRUNCATE_SUFFIX);
    }

    sanitized
}

/// Result type for relay operations
pub type RelayResult<T> = Result<T, RelayError>;
