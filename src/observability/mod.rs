//! Observability: structured logging, metrics and health endpoints

pub mod health;
pub mod logging;
pub mod metrics;

// Re-export for convenience
pub use health::{health_port_from_env, HealthServer};
pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{metrics, MetricsCollector, MetricsSnapshot};

// Span macros for structured logging
pub use logging::{broker_span, lifecycle_span, stage_span};
