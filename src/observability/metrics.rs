//! Thread-safe metrics collection system
//!
//! Provides atomic counters and mutex-protected collections for tracking
//! pipeline requests, delegation stages, broker traffic and tool runs.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

const MAX_SAMPLES: usize = 1000;

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // Pipeline requests
    requests_received: AtomicU64,
    requests_completed: AtomicU64,
    requests_failed: AtomicU64,
    request_times: Mutex<Vec<u64>>, // in milliseconds

    // Delegation stages, keyed by stage name
    stage_stats: Mutex<BTreeMap<String, StageStats>>,

    // Broker session
    broker_connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    reconnects: AtomicU64,
    messages_sent: AtomicU64,
    polls: AtomicU64,
    empty_polls: AtomicU64,
    mentions_received: AtomicU64,

    // Tools
    tool_stats: Mutex<HashMap<String, ToolExecutionStats>>,

    // Lifecycle
    session_state: Mutex<String>,
    uptime_start: AtomicU64,
    state_transitions: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            requests_received: AtomicU64::new(0),
            requests_completed: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            request_times: Mutex::new(Vec::new()),
            stage_stats: Mutex::new(BTreeMap::new()),
            broker_connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            polls: AtomicU64::new(0),
            empty_polls: AtomicU64::new(0),
            mentions_received: AtomicU64::new(0),
            tool_stats: Mutex::new(HashMap::new()),
            session_state: Mutex::new("initializing".to_string()),
            uptime_start: AtomicU64::new(current_timestamp()),
            state_transitions: AtomicU64::new(0),
        }
    }

    // Pipeline request metrics
    pub fn request_received(&self) {
        self.requests_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_completed(&self, duration: Duration) {
        self.requests_completed.fetch_add(1, Ordering::Relaxed);
        self.record_request_time(duration);
    }

    pub fn request_failed(&self, duration: Duration) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
        self.record_request_time(duration);
    }

    fn record_request_time(&self, duration: Duration) {
        if let Ok(mut times) = self.request_times.lock() {
            push_bounded(&mut times, duration.as_millis() as u64);
        }
    }

    // Stage metrics
    pub fn stage_succeeded(&self, stage: &str, sends: u32) {
        if let Ok(mut stats) = self.stage_stats.lock() {
            let entry = stats.entry(stage.to_string()).or_default();
            entry.successes += 1;
            entry.sends += u64::from(sends);
        }
    }

    pub fn stage_failed(&self, stage: &str, reason: &str, sends: u32) {
        if let Ok(mut stats) = self.stage_stats.lock() {
            let entry = stats.entry(stage.to_string()).or_default();
            entry.sends += u64::from(sends);
            *entry.failures.entry(reason.to_string()).or_insert(0) += 1;
        }
    }

    // Broker metrics
    pub fn connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.broker_connected.store(true, Ordering::Relaxed);
    }

    pub fn connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.broker_connected.store(false, Ordering::Relaxed);
    }

    pub fn connection_lost(&self) {
        self.broker_connected.store(false, Ordering::Relaxed);
    }

    pub fn reconnect_scheduled(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mention_poll(&self, delivered: usize) {
        self.polls.fetch_add(1, Ordering::Relaxed);
        if delivered == 0 {
            self.empty_polls.fetch_add(1, Ordering::Relaxed);
        } else {
            self.mentions_received
                .fetch_add(delivered as u64, Ordering::Relaxed);
        }
    }

    // Tool execution metrics
    pub fn tool_executed(&self, tool_name: &str, duration: Duration, success: bool) {
        if let Ok(mut stats) = self.tool_stats.lock() {
            let tool_stats = stats.entry(tool_name.to_string()).or_default();
            tool_stats.executions += 1;
            tool_stats.last_execution = current_timestamp();
            push_bounded(&mut tool_stats.execution_times, duration.as_millis() as u64);
            if !success {
                tool_stats.failures += 1;
            }
        }
    }

    // Lifecycle metrics
    pub fn set_session_state(&self, state: &str) {
        if let Ok(mut current_state) = self.session_state.lock() {
            if *current_state != state {
                self.state_transitions.fetch_add(1, Ordering::Relaxed);
                *current_state = state.to_string();
            }
        }
    }

    // Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.requests_received,
            &self.requests_completed,
            &self.requests_failed,
            &self.connection_attempts,
            &self.connections_established,
            &self.connection_failures,
            &self.reconnects,
            &self.messages_sent,
            &self.polls,
            &self.empty_polls,
            &self.mentions_received,
            &self.state_transitions,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.broker_connected.store(false, Ordering::Relaxed);
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);

        if let Ok(mut times) = self.request_times.lock() {
            times.clear();
        }
        if let Ok(mut stats) = self.stage_stats.lock() {
            stats.clear();
        }
        if let Ok(mut stats) = self.tool_stats.lock() {
            stats.clear();
        }
        if let Ok(mut state) = self.session_state.lock() {
            *state = "initializing".to_string();
        }
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();

        let (avg_request_time_ms, p50, p95) = self
            .request_times
            .lock()
            .map(|times| timing_summary(&times))
            .unwrap_or((0.0, 0.0, 0.0));

        let stages = self
            .stage_stats
            .lock()
            .map(|stats| {
                stats
                    .iter()
                    .map(|(name, s)| (name.clone(), s.snapshot()))
                    .collect()
            })
            .unwrap_or_default();

        let tools = self
            .tool_stats
            .lock()
            .map(|stats| {
                stats
                    .iter()
                    .map(|(name, s)| (name.clone(), s.snapshot(name)))
                    .collect()
            })
            .unwrap_or_default();

        let current_state = self
            .session_state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|_| "unknown".to_string());

        MetricsSnapshot {
            requests: RequestMetrics {
                received: self.requests_received.load(Ordering::Relaxed),
                completed: self.requests_completed.load(Ordering::Relaxed),
                failed: self.requests_failed.load(Ordering::Relaxed),
                avg_duration_ms: avg_request_time_ms,
                duration_p50_ms: p50,
                duration_p95_ms: p95,
            },
            stages,
            broker: BrokerMetrics {
                connected: self.broker_connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                reconnects: self.reconnects.load(Ordering::Relaxed),
                messages_sent: self.messages_sent.load(Ordering::Relaxed),
                polls: self.polls.load(Ordering::Relaxed),
                empty_polls: self.empty_polls.load(Ordering::Relaxed),
                mentions_received: self.mentions_received.load(Ordering::Relaxed),
            },
            tools,
            lifecycle: LifecycleMetrics {
                current_state,
                uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
                state_transitions: self.state_transitions.load(Ordering::Relaxed),
            },
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct StageStats {
    successes: u64,
    sends: u64,
    failures: BTreeMap<String, u64>,
}

impl StageStats {
    fn snapshot(&self) -> StageMetrics {
        StageMetrics {
            successes: self.successes,
            instructions_sent: self.sends,
            failures: self.failures.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct ToolExecutionStats {
    executions: u64,
    failures: u64,
    execution_times: Vec<u64>, // milliseconds
    last_execution: u64,
}

impl ToolExecutionStats {
    fn snapshot(&self, name: &str) -> ToolExecutionStatsSnapshot {
        let (avg_execution_time_ms, _, _) = timing_summary(&self.execution_times);
        let success_rate = if self.executions == 0 {
            0.0
        } else {
            (self.executions - self.failures) as f64 / self.executions as f64
        };

        ToolExecutionStatsSnapshot {
            name: name.to_string(),
            executions: self.executions,
            failures: self.failures,
            avg_execution_time_ms,
            last_execution: self.last_execution,
            success_rate,
        }
    }
}

// Public metrics structures
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub requests: RequestMetrics,
    pub stages: BTreeMap<String, StageMetrics>,
    pub broker: BrokerMetrics,
    pub tools: HashMap<String, ToolExecutionStatsSnapshot>,
    pub lifecycle: LifecycleMetrics,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct RequestMetrics {
    pub received: u64,
    pub completed: u64,
    pub failed: u64,
    pub avg_duration_ms: f64,
    pub duration_p50_ms: f64,
    pub duration_p95_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct StageMetrics {
    pub successes: u64,
    pub instructions_sent: u64,
    /// Failure count per reason
    pub failures: BTreeMap<String, u64>,
}

#[derive(Debug, Serialize)]
pub struct BrokerMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub reconnects: u64,
    pub messages_sent: u64,
    pub polls: u64,
    pub empty_polls: u64,
    pub mentions_received: u64,
}

#[derive(Debug, Serialize)]
pub struct ToolExecutionStatsSnapshot {
    pub name: String,
    pub executions: u64,
    pub failures: u64,
    pub avg_execution_time_ms: f64,
    pub last_execution: u64,
    pub success_rate: f64,
}

#[derive(Debug, Serialize)]
pub struct LifecycleMetrics {
    pub current_state: String,
    pub uptime_seconds: u64,
    pub state_transitions: u64,
}

// Helper functions
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn push_bounded(samples: &mut Vec<u64>, value: u64) {
    samples.push(value);
    if samples.len() > MAX_SAMPLES {
        samples.remove(0);
    }
}

/// Average, p50 and p95 of a sample set (pure function)
fn timing_summary(samples: &[u64]) -> (f64, f64, f64) {
    if samples.is_empty() {
        return (0.0, 0.0, 0.0);
    }

    let mut sorted = samples.to_vec();
    sorted.sort_unstable();
    let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
    (avg, percentile(&sorted, 50.0), percentile(&sorted, 95.0))
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower_value = sorted_data[index.floor() as usize] as f64;
        let upper_value = sorted_data[index.ceil() as usize] as f64;
        lower_value + (upper_value - lower_value) * index.fract()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_request_metrics() {
        let collector = MetricsCollector::new();

        collector.request_received();
        collector.request_completed(Duration::from_millis(1500));
        collector.request_received();
        collector.request_failed(Duration::from_millis(500));

        let metrics = collector.get_metrics();
        assert_eq!(metrics.requests.received, 2);
        assert_eq!(metrics.requests.completed, 1);
        assert_eq!(metrics.requests.failed, 1);
        assert!(metrics.requests.avg_duration_ms > 900.0);
    }

    #[test]
    fn test_stage_metrics_by_reason() {
        let collector = MetricsCollector::new();

        collector.stage_succeeded("checkout", 1);
        collector.stage_failed("diff_review", "no_response", 3);
        collector.stage_failed("diff_review", "no_response", 3);
        collector.stage_failed("diff_review", "malformed_reply", 1);

        let metrics = collector.get_metrics();
        assert_eq!(metrics.stages["checkout"].successes, 1);

        let diff = &metrics.stages["diff_review"];
        assert_eq!(diff.successes, 0);
        assert_eq!(diff.instructions_sent, 7);
        assert_eq!(diff.failures["no_response"], 2);
        assert_eq!(diff.failures["malformed_reply"], 1);
    }

    #[test]
    fn test_broker_metrics() {
        let collector = MetricsCollector::new();

        collector.connection_attempt();
        collector.connection_established();
        collector.message_sent();
        collector.mention_poll(0);
        collector.mention_poll(2);

        let metrics = collector.get_metrics();
        assert_eq!(metrics.broker.connection_attempts, 1);
        assert_eq!(metrics.broker.connections_established, 1);
        assert_eq!(metrics.broker.messages_sent, 1);
        assert_eq!(metrics.broker.polls, 2);
        assert_eq!(metrics.broker.empty_polls, 1);
        assert_eq!(metrics.broker.mentions_received, 2);
        assert!(metrics.broker.connected);

        collector.connection_lost();
        assert!(!collector.get_metrics().broker.connected);
    }

    #[test]
    fn test_tool_metrics() {
        let collector = MetricsCollector::new();

        collector.tool_executed("run_relevant_tests", Duration::from_millis(500), true);
        collector.tool_executed("run_relevant_tests", Duration::from_millis(300), false);

        let metrics = collector.get_metrics();
        let tool_stats = metrics.tools.get("run_relevant_tests").unwrap();

        assert_eq!(tool_stats.executions, 2);
        assert_eq!(tool_stats.failures, 1);
        assert_eq!(tool_stats.success_rate, 0.5);
        assert!(tool_stats.avg_execution_time_ms > 350.0);
    }

    #[test]
    fn test_thread_safety() {
        let collector = Arc::new(MetricsCollector::new());

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let collector = Arc::clone(&collector);
                thread::spawn(move || {
                    for _ in 0..100 {
                        collector.request_received();
                        collector.message_sent();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let metrics = collector.get_metrics();
        assert_eq!(metrics.requests.received, 1000);
        assert_eq!(metrics.broker.messages_sent, 1000);
    }

    #[test]
    fn test_percentile_calculation() {
        let data = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10];

        let p50 = percentile(&data, 50.0);
        let p95 = percentile(&data, 95.0);

        assert!((p50 - 5.5).abs() < 0.1, "P50: expected ~5.5, got {p50}");
        assert!((p95 - 9.5).abs() < 0.1, "P95: expected ~9.5, got {p95}");
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn test_session_state_transitions() {
        let collector = MetricsCollector::new();

        collector.set_session_state("connected");
        collector.set_session_state("connected");
        collector.set_session_state("reconnecting");

        let metrics = collector.get_metrics();
        assert_eq!(metrics.lifecycle.current_state, "reconnecting");
        assert_eq!(metrics.lifecycle.state_transitions, 2);
    }

    #[test]
    fn test_reset_functionality() {
        let collector = MetricsCollector::new();

        collector.request_received();
        collector.connection_established();
        collector.stage_succeeded("checkout", 1);
        collector.tool_executed("t", Duration::from_millis(100), true);

        collector.reset();

        let metrics = collector.get_metrics();
        assert_eq!(metrics.requests.received, 0);
        assert!(!metrics.broker.connected);
        assert!(metrics.stages.is_empty());
        assert!(metrics.tools.is_empty());
    }
}
