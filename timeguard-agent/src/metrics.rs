//! Metrics collection for timeguard-agent
//!
//! Counters for the command server and the enforcement monitor. The snapshot
//! is served over the command protocol (`METRICS`) in Prometheus text format.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Metrics collector for the agent daemon
pub struct MetricsCollector {
    start_time: Instant,

    /// Connections accepted since start
    pub connections_total: AtomicU64,
    /// Connections currently open
    pub connections_active: AtomicU64,
    /// Keepalive frames sent to idle peers
    pub keepalives_total: AtomicU64,

    /// Commands processed
    pub commands_total: AtomicU64,
    /// Commands answered with a failure response
    pub command_errors_total: AtomicU64,

    /// Lock state changes observed by the monitor
    pub lock_transitions_total: AtomicU64,
    /// Automatic locks started by a trigger
    pub triggers_fired_total: AtomicU64,

    /// Command latencies (microseconds)
    command_latencies: RwLock<LatencyHistogram>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            keepalives_total: AtomicU64::new(0),
            commands_total: AtomicU64::new(0),
            command_errors_total: AtomicU64::new(0),
            lock_transitions_total: AtomicU64::new(0),
            triggers_fired_total: AtomicU64::new(0),
            command_latencies: RwLock::new(LatencyHistogram::new()),
        }
    }

    pub fn record_connection_opened(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_closed(&self) {
        let _ = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn record_keepalive(&self) {
        self.keepalives_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a processed command
    pub fn record_command(&self, success: bool, latency: Duration) {
        self.commands_total.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.command_errors_total.fetch_add(1, Ordering::Relaxed);
        }

        if let Ok(mut hist) = self.command_latencies.write() {
            hist.record(latency.as_micros() as u64);
        }
    }

    pub fn record_lock_transition(&self) {
        self.lock_transitions_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_trigger(&self) {
        self.triggers_fired_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Export metrics as a snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let hist = self.command_latencies.read().ok();

        MetricsSnapshot {
            uptime_seconds: self.uptime_seconds(),
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            keepalives_total: self.keepalives_total.load(Ordering::Relaxed),
            commands_total: self.commands_total.load(Ordering::Relaxed),
            command_errors_total: self.command_errors_total.load(Ordering::Relaxed),
            command_latency_p50_us: hist.as_ref().map(|h| h.percentile(50)).unwrap_or(0),
            command_latency_p99_us: hist.as_ref().map(|h| h.percentile(99)).unwrap_or(0),
            lock_transitions_total: self.lock_transitions_total.load(Ordering::Relaxed),
            triggers_fired_total: self.triggers_fired_total.load(Ordering::Relaxed),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time (serializable)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: u64,

    pub connections_total: u64,
    pub connections_active: u64,
    pub keepalives_total: u64,

    pub commands_total: u64,
    pub command_errors_total: u64,
    /// 50th percentile latency in microseconds
    pub command_latency_p50_us: u64,
    /// 99th percentile latency in microseconds
    pub command_latency_p99_us: u64,

    pub lock_transitions_total: u64,
    pub triggers_fired_total: u64,
}

impl MetricsSnapshot {
    /// Format as Prometheus text exposition format
    pub fn to_prometheus(&self) -> String {
        let mut lines = Vec::new();

        let mut metric = |name: &str, kind: &str, help: &str, value: String| {
            lines.push(format!("# HELP timeguard_agent_{} {}", name, help));
            lines.push(format!("# TYPE timeguard_agent_{} {}", name, kind));
            lines.push(format!("timeguard_agent_{} {}", name, value));
        };

        metric(
            "uptime_seconds",
            "gauge",
            "Agent uptime in seconds",
            self.uptime_seconds.to_string(),
        );
        metric(
            "connections_total",
            "counter",
            "Total connections accepted",
            self.connections_total.to_string(),
        );
        metric(
            "connections_active",
            "gauge",
            "Currently open connections",
            self.connections_active.to_string(),
        );
        metric(
            "keepalives_total",
            "counter",
            "Keepalive frames sent to idle peers",
            self.keepalives_total.to_string(),
        );
        metric(
            "commands_total",
            "counter",
            "Total commands processed",
            self.commands_total.to_string(),
        );
        metric(
            "command_errors_total",
            "counter",
            "Commands answered with a failure",
            self.command_errors_total.to_string(),
        );
        metric(
            "lock_transitions_total",
            "counter",
            "Session lock changes observed",
            self.lock_transitions_total.to_string(),
        );
        metric(
            "triggers_fired_total",
            "counter",
            "Automatic locks started by a trigger",
            self.triggers_fired_total.to_string(),
        );

        lines.push(
            "# HELP timeguard_agent_command_latency_us Command latency in microseconds"
                .to_string(),
        );
        lines.push("# TYPE timeguard_agent_command_latency_us summary".to_string());
        lines.push(format!(
            "timeguard_agent_command_latency_us{{quantile=\"0.5\"}} {}",
            self.command_latency_p50_us
        ));
        lines.push(format!(
            "timeguard_agent_command_latency_us{{quantile=\"0.99\"}} {}",
            self.command_latency_p99_us
        ));

        lines.join("\n")
    }
}

/// Simple latency histogram for percentile calculations
struct LatencyHistogram {
    values: Vec<u64>,
    /// Maximum values to keep (for memory bounds)
    max_size: usize,
}

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            values: Vec::with_capacity(256),
            max_size: 4096,
        }
    }

    fn record(&mut self, value: u64) {
        if self.values.len() >= self.max_size {
            self.values.remove(0);
        }
        self.values.push(value);
    }

    fn percentile(&self, p: u8) -> u64 {
        if self.values.is_empty() {
            return 0;
        }

        let mut sorted = self.values.clone();
        sorted.sort_unstable();

        let idx = ((p as f64 / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        sorted[idx.min(sorted.len() - 1)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_collector() {
        let collector = MetricsCollector::new();

        collector.record_command(true, Duration::from_micros(100));
        collector.record_command(true, Duration::from_micros(200));
        collector.record_command(false, Duration::from_micros(50));

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.commands_total, 3);
        assert_eq!(snapshot.command_errors_total, 1);
    }

    #[test]
    fn test_active_connections_never_underflow() {
        let collector = MetricsCollector::new();
        collector.record_connection_opened();
        collector.record_connection_closed();
        collector.record_connection_closed();

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.connections_total, 1);
        assert_eq!(snapshot.connections_active, 0);
    }

    #[test]
    fn test_latency_histogram() {
        let mut hist = LatencyHistogram::new();

        for i in 1..=100 {
            hist.record(i);
        }

        let p50 = hist.percentile(50);
        let p99 = hist.percentile(99);

        assert!((49..=51).contains(&p50), "p50 was {}", p50);
        assert!((98..=100).contains(&p99), "p99 was {}", p99);
    }

    #[test]
    fn test_prometheus_format() {
        let collector = MetricsCollector::new();
        collector.record_keepalive();

        let prom = collector.snapshot().to_prometheus();

        assert!(prom.contains("timeguard_agent_uptime_seconds"));
        assert!(prom.contains("timeguard_agent_keepalives_total 1"));
        assert!(prom.contains("quantile=\"0.99\""));
    }
}
