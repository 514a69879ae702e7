//! Supervised reconnect loop
//!
//! The supervisor connects, hands a fresh [`BrokerSession`] to the workload
//! and, when the workload or the connect itself fails with `ConnectionLost`,
//! waits the policy delay and tries again. Its state is published on a
//! `watch` channel for the health server.

use super::policy::{ReconnectPolicy, ReconnectionDecision};
use super::BrokerSession;
use crate::broker::BrokerConnector;
use crate::error::{RelayError, RelayResult};
use crate::observability::metrics::metrics;
use crate::protocol::AgentIdentity;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Observable session state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionHealth {
    Connecting,
    Connected,
    /// Waiting before reconnection attempt `attempt`
    Reconnecting { attempt: u32 },
    PermanentlyDisconnected(String),
    /// Workload finished normally
    Stopped,
}

impl SessionHealth {
    pub fn label(&self) -> &'static str {
        match self {
            SessionHealth::Connecting => "connecting",
            SessionHealth::Connected => "connected",
            SessionHealth::Reconnecting { .. } => "reconnecting",
            SessionHealth::PermanentlyDisconnected(_) => "permanently_disconnected",
            SessionHealth::Stopped => "stopped",
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, SessionHealth::Connected)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Broker connection lost {attempts} times in a row, giving up: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
    #[error("Fatal session error: {0}")]
    Fatal(#[source] RelayError),
}

/// Work run on top of a live session
///
/// Returning `Ok` ends supervision. Returning an error whose
/// [`RelayError::is_connection_lost`] is true triggers a reconnect and a new
/// call with a fresh session; any other error is fatal.
#[async_trait]
pub trait SessionWorkload: Send {
    async fn run(&mut self, session: BrokerSession) -> RelayResult<()>;
}

pub struct SessionSupervisor {
    connector: Arc<dyn BrokerConnector>,
    agent: AgentIdentity,
    policy: ReconnectPolicy,
    health_tx: watch::Sender<SessionHealth>,
}

impl SessionSupervisor {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        agent: AgentIdentity,
        policy: ReconnectPolicy,
    ) -> Self {
        let (health_tx, _) = watch::channel(SessionHealth::Connecting);
        Self {
            connector,
            agent,
            policy,
            health_tx,
        }
    }

    /// Subscribe to session health changes
    pub fn health(&self) -> watch::Receiver<SessionHealth> {
        self.health_tx.subscribe()
    }

    fn publish(&self, health: SessionHealth) {
        metrics().set_session_state(health.label());
        self.health_tx.send_replace(health);
    }

    /// Run `workload` until it finishes or the retry budget is exhausted
    pub async fn run<W: SessionWorkload>(&self, workload: &mut W) -> Result<(), SessionError> {
        let mut consecutive_failures = 0u32;

        loop {
            if consecutive_failures == 0 {
                self.publish(SessionHealth::Connecting);
            }
            metrics().connection_attempt();

            let last_error = match self.connector.connect(&self.agent).await {
                Ok(broker) => {
                    // A healthy connection resets the budget
                    consecutive_failures = 0;
                    metrics().connection_established();
                    self.publish(SessionHealth::Connected);
                    info!(
                        agent_id = %self.agent.id,
                        broker = %self.connector.describe(),
                        "Broker session established"
                    );

                    let session = BrokerSession::new(broker, self.agent.clone());
                    match workload.run(session).await {
                        Ok(()) => {
                            self.publish(SessionHealth::Stopped);
                            info!(agent_id = %self.agent.id, "Session workload finished");
                            return Ok(());
                        }
                        Err(e) if e.is_connection_lost() => {
                            metrics().connection_lost();
                            warn!(agent_id = %self.agent.id, error = %e, "Broker connection lost");
                            e.to_string()
                        }
                        Err(e) => {
                            error!(agent_id = %self.agent.id, error = %e, "Session workload failed");
                            self.publish(SessionHealth::PermanentlyDisconnected(e.user_message()));
                            return Err(SessionError::Fatal(e));
                        }
                    }
                }
                Err(e) if e.is_connection_lost() => {
                    metrics().connection_failed();
                    warn!(
                        agent_id = %self.agent.id,
                        broker = %self.connector.describe(),
                        error = %e,
                        "Broker connection attempt failed"
                    );
                    e.to_string()
                }
                Err(e) => {
                    metrics().connection_failed();
                    let e = RelayError::from(e);
                    error!(agent_id = %self.agent.id, error = %e, "Broker rejected session");
                    self.publish(SessionHealth::PermanentlyDisconnected(e.user_message()));
                    return Err(SessionError::Fatal(e));
                }
            };

            consecutive_failures += 1;
            match self.policy.decide(consecutive_failures) {
                ReconnectionDecision::Proceed { attempt, delay } => {
                    metrics().reconnect_scheduled();
                    self.publish(SessionHealth::Reconnecting { attempt });
                    info!(
                        agent_id = %self.agent.id,
                        attempt,
                        max_retries = self.policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "Reconnecting to broker"
                    );
                    tokio::time::sleep(delay).await;
                }
                ReconnectionDecision::AbortMaxAttemptsExceeded => {
                    error!(
                        agent_id = %self.agent.id,
                        attempts = consecutive_failures,
                        "Reconnect budget exhausted"
                    );
                    self.publish(SessionHealth::PermanentlyDisconnected(last_error.clone()));
                    return Err(SessionError::RetriesExhausted {
                        attempts: consecutive_failures,
                        last_error,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerError, InMemoryBroker, InMemoryConnector};
    use crate::testing::mocks::FlakyConnector;
    use std::time::Duration;

    struct FailingWorkload {
        runs: u32,
        error: fn() -> RelayError,
        finish_after: Option<u32>,
    }

    #[async_trait]
    impl SessionWorkload for FailingWorkload {
        async fn run(&mut self, _session: BrokerSession) -> RelayResult<()> {
            self.runs += 1;
            if Some(self.runs) == self.finish_after {
                return Ok(());
            }
            Err((self.error)())
        }
    }

    fn lost() -> RelayError {
        BrokerError::connection_lost("dropped").into()
    }

    fn policy(max: u32) -> ReconnectPolicy {
        ReconnectPolicy::new(max, Duration::from_millis(1))
    }

    fn agent() -> AgentIdentity {
        AgentIdentity::new("a", "A", "test")
    }

    #[tokio::test]
    async fn test_exhausts_after_max_consecutive_connect_failures() {
        let connector = Arc::new(FlakyConnector::failing(usize::MAX));
        let supervisor = SessionSupervisor::new(connector.clone(), agent(), policy(5));
        let health = supervisor.health();
        let mut workload = FailingWorkload {
            runs: 0,
            error: lost,
            finish_after: None,
        };

        let result = supervisor.run(&mut workload).await;

        assert!(matches!(
            result,
            Err(SessionError::RetriesExhausted { attempts: 5, .. })
        ));
        assert_eq!(connector.attempts(), 5);
        assert_eq!(workload.runs, 0);
        assert!(matches!(
            *health.borrow(),
            SessionHealth::PermanentlyDisconnected(_)
        ));
    }

    #[tokio::test]
    async fn test_successful_connect_resets_budget() {
        // Four failures, a success whose workload loses the connection,
        // then four more failures and a success that finishes.
        let connector = Arc::new(FlakyConnector::with_schedule(vec![
            false, false, false, false, true, false, false, false, false, true,
        ]));
        let supervisor = SessionSupervisor::new(connector.clone(), agent(), policy(5));
        let mut workload = FailingWorkload {
            runs: 0,
            error: lost,
            finish_after: Some(2),
        };

        let result = supervisor.run(&mut workload).await;

        assert!(result.is_ok());
        assert_eq!(connector.attempts(), 10);
        assert_eq!(workload.runs, 2);
        assert_eq!(*supervisor.health().borrow(), SessionHealth::Stopped);
    }

    #[tokio::test]
    async fn test_workload_gets_fresh_session_after_connection_loss() {
        let broker = Arc::new(InMemoryBroker::new());
        let connector = Arc::new(InMemoryConnector::new(broker));
        let supervisor = SessionSupervisor::new(connector, agent(), policy(2));
        let mut workload = FailingWorkload {
            runs: 0,
            error: lost,
            finish_after: Some(4),
        };

        // Every connect succeeds and resets the counter, so three losses in
        // a row never exhaust a budget of two.
        let result = supervisor.run(&mut workload).await;

        assert!(result.is_ok());
        assert_eq!(workload.runs, 4);
    }

    #[tokio::test]
    async fn test_non_connection_error_is_fatal() {
        let broker = Arc::new(InMemoryBroker::new());
        let connector = Arc::new(InMemoryConnector::new(broker));
        let supervisor = SessionSupervisor::new(connector, agent(), policy(5));
        let mut workload = FailingWorkload {
            runs: 0,
            error: || RelayError::internal_error("bad state"),
            finish_after: None,
        };

        let result = supervisor.run(&mut workload).await;

        assert!(matches!(result, Err(SessionError::Fatal(_))));
        assert_eq!(workload.runs, 1);
    }
}
