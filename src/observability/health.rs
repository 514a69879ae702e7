//! Health check HTTP server for container orchestration
//!
//! Serves the supervised session state and the metrics snapshot. The
//! session state comes from [`SessionSupervisor::health`](crate::session::SessionSupervisor::health).

use crate::observability::metrics::metrics;
use crate::session::SessionHealth;
use serde::Serialize;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use warp::http::StatusCode;
use warp::Filter;

/// Default port when `HEALTH_PORT` is unset
pub const DEFAULT_HEALTH_PORT: u16 = 8080;

/// Port from `HEALTH_PORT`; `None` when set to 0
pub fn health_port_from_env() -> Option<u16> {
    let port = std::env::var("HEALTH_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(DEFAULT_HEALTH_PORT);
    (port != 0).then_some(port)
}

/// HTTP health check server
pub struct HealthServer {
    agent_id: String,
    port: u16,
    session: watch::Receiver<SessionHealth>,
}

impl HealthServer {
    pub fn new(agent_id: String, port: u16, session: watch::Receiver<SessionHealth>) -> Self {
        Self {
            agent_id,
            port,
            session,
        }
    }

    /// Build the route tree
    pub fn routes(
        self: Arc<Self>,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        let health_server = self.clone();
        let ready_server = self;

        // GET /health - session state with individual checks
        let health_route = warp::path("health").and(warp::get()).and_then(move || {
            let server = health_server.clone();
            async move {
                let status = server.health_status();
                let code = if status.status == "healthy" {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&status), code))
            }
        });

        // GET /metrics - complete metrics export
        let metrics_route = warp::path("metrics").and(warp::get()).and_then(|| async {
            Ok::<_, Infallible>(warp::reply::json(&metrics().get_metrics()))
        });

        // GET /ready - ready while the broker session is live
        let ready_route = warp::path("ready").and(warp::get()).and_then(move || {
            let server = ready_server.clone();
            async move {
                let ready = server.session.borrow().is_healthy();
                let response = ReadinessResponse {
                    ready,
                    timestamp: current_timestamp(),
                };
                let code = if ready {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&response), code))
            }
        });

        // GET /live - process is up
        let live_route = warp::path("live").and(warp::get()).and_then(|| async {
            Ok::<_, Infallible>(warp::reply::json(&LivenessResponse {
                alive: true,
                timestamp: current_timestamp(),
            }))
        });

        health_route.or(metrics_route).or(ready_route).or(live_route)
    }

    /// Serve until the process exits
    pub async fn start(self: Arc<Self>) {
        let port = self.port;
        tracing::info!(port, "Starting health server");
        warp::serve(self.routes()).run(([0, 0, 0, 0], port)).await;
    }

    fn health_status(&self) -> HealthStatus {
        let session = self.session.borrow().clone();
        let snapshot = metrics().get_metrics();

        let mut checks = BTreeMap::new();
        checks.insert("broker_session".to_string(), session_check(&session));

        let status = if checks.values().all(|c| c.status == "healthy") {
            "healthy"
        } else {
            "degraded"
        };

        HealthStatus {
            status: status.to_string(),
            timestamp: current_timestamp(),
            agent_id: self.agent_id.clone(),
            uptime_seconds: snapshot.lifecycle.uptime_seconds,
            checks,
        }
    }
}

/// Health check for the supervised session (pure function)
pub fn session_check(session: &SessionHealth) -> HealthCheck {
    let (status, message) = match session {
        SessionHealth::Connected => ("healthy", "Broker session established".to_string()),
        SessionHealth::Connecting => ("unhealthy", "Connecting to broker".to_string()),
        SessionHealth::Reconnecting { attempt } => (
            "unhealthy",
            format!("Waiting before reconnection attempt {attempt}"),
        ),
        SessionHealth::PermanentlyDisconnected(reason) => {
            ("unhealthy", format!("Gave up reconnecting: {reason}"))
        }
        SessionHealth::Stopped => ("unhealthy", "Session stopped".to_string()),
    };

    HealthCheck {
        status: status.to_string(),
        message: Some(message),
        last_check: current_timestamp(),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub last_check: u64,
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: String,
    timestamp: u64,
    agent_id: String,
    uptime_seconds: u64,
    checks: BTreeMap<String, HealthCheck>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(initial: SessionHealth) -> (watch::Sender<SessionHealth>, Arc<HealthServer>) {
        let (tx, rx) = watch::channel(initial);
        let server = Arc::new(HealthServer::new("test-agent".to_string(), 0, rx));
        (tx, server)
    }

    #[test]
    fn test_session_check() {
        assert_eq!(session_check(&SessionHealth::Connected).status, "healthy");
        assert_eq!(
            session_check(&SessionHealth::Reconnecting { attempt: 2 }).status,
            "unhealthy"
        );
        let gave_up = session_check(&SessionHealth::PermanentlyDisconnected("eof".to_string()));
        assert!(gave_up.message.unwrap().contains("eof"));
    }

    #[tokio::test]
    async fn test_ready_follows_session() {
        let (tx, server) = server(SessionHealth::Connecting);
        let routes = server.routes();

        let response = warp::test::request().path("/ready").reply(&routes).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        tx.send_replace(SessionHealth::Connected);
        let response = warp::test::request().path("/ready").reply(&routes).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_reports_degraded_session() {
        let (_tx, server) = server(SessionHealth::Reconnecting { attempt: 1 });
        let routes = server.routes();

        let response = warp::test::request().path("/health").reply(&routes).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["agent_id"], "test-agent");
        assert_eq!(body["checks"]["broker_session"]["status"], "unhealthy");
    }

    #[tokio::test]
    async fn test_live_and_metrics() {
        let (_tx, server) = server(SessionHealth::Connected);
        let routes = server.routes();

        let live = warp::test::request().path("/live").reply(&routes).await;
        assert_eq!(live.status(), StatusCode::OK);

        let metrics = warp::test::request().path("/metrics").reply(&routes).await;
        let body: serde_json::Value = serde_json::from_slice(metrics.body()).unwrap();
        assert!(body.get("broker").is_some());
    }
}
