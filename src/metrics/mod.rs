//! Metrics for monitoring state transfer.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                    StateTransferMetrics                        │
//! │  ┌────────────────────┐ ┌──────────────────┐ ┌──────────────┐ │
//! │  │ Counters           │ │ Gauges           │ │ Histograms   │ │
//! │  │ - segments         │ │ - inbound tasks  │ │ - chunk      │ │
//! │  │ - chunks/entries   │ │ - outbound tasks │ │   apply time │ │
//! │  │ - confirmations    │ │                  │ │ - phase time │ │
//! │  └────────────────────┘ └──────────────────┘ └──────────────┘ │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! One instance is shared by the manager, consumer and provider of a cache.

mod primitives;

pub use primitives::{Counter, Gauge, Histogram};

use std::fmt::Write as _;
use std::time::Duration;

/// Buckets for applying one chunk (seconds).
pub const CHUNK_APPLY_BUCKETS: &[f64] = &[0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0];

/// Buckets for a full rebalance phase (seconds).
pub const PHASE_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0];

/// State transfer metrics for one cache on one node.
#[derive(Debug)]
pub struct StateTransferMetrics {
    /// Topologies installed.
    pub topology_updates: Counter,
    /// Segments requested from other owners.
    pub segments_requested: Counter,
    /// Segments that received their last chunk.
    pub segments_completed: Counter,
    /// Segments with no live owner to fetch from.
    pub segments_lost: Counter,
    /// Chunks received.
    pub chunks_received: Counter,
    /// Chunks dropped (stale topology, unowned segment, unknown sender).
    pub chunks_discarded: Counter,
    /// Entries written to the container.
    pub entries_applied: Counter,
    /// Entries rejected by the commit manager.
    pub entries_discarded: Counter,
    /// Chunks sent to consumers.
    pub chunks_sent: Counter,
    /// Entries sent to consumers.
    pub entries_sent: Counter,
    /// Outbound tasks started.
    pub outbound_tasks_started: Counter,
    /// Outbound tasks cancelled.
    pub outbound_tasks_cancelled: Counter,
    /// Rebalance phases confirmed to the coordinator.
    pub phase_confirmations: Counter,
    /// Keys whose divergent copies were reconciled.
    pub conflicts_resolved: Counter,
    /// Inbound tasks in progress.
    pub inbound_tasks_active: Gauge,
    /// Outbound tasks in progress.
    pub outbound_tasks_active: Gauge,
    /// Time to apply one chunk.
    pub chunk_apply_time: Histogram,
    /// Time from topology install to phase confirmation.
    pub phase_time: Histogram,
}

impl StateTransferMetrics {
    /// Create a zeroed metrics instance.
    pub fn new() -> Self {
        Self {
            topology_updates: Counter::new("st_topology_updates_total", "Topologies installed"),
            segments_requested: Counter::new(
                "st_segments_requested_total",
                "Segments requested from other owners",
            ),
            segments_completed: Counter::new(
                "st_segments_completed_total",
                "Segments fully received",
            ),
            segments_lost: Counter::new(
                "st_segments_lost_total",
                "Segments with no live owner to fetch from",
            ),
            chunks_received: Counter::new("st_chunks_received_total", "Chunks received"),
            chunks_discarded: Counter::new("st_chunks_discarded_total", "Chunks dropped"),
            entries_applied: Counter::new("st_entries_applied_total", "Entries applied"),
            entries_discarded: Counter::new(
                "st_entries_discarded_total",
                "Entries superseded by live writes",
            ),
            chunks_sent: Counter::new("st_chunks_sent_total", "Chunks sent"),
            entries_sent: Counter::new("st_entries_sent_total", "Entries sent"),
            outbound_tasks_started: Counter::new(
                "st_outbound_tasks_started_total",
                "Outbound tasks started",
            ),
            outbound_tasks_cancelled: Counter::new(
                "st_outbound_tasks_cancelled_total",
                "Outbound tasks cancelled",
            ),
            phase_confirmations: Counter::new(
                "st_phase_confirmations_total",
                "Rebalance phases confirmed",
            ),
            conflicts_resolved: Counter::new(
                "st_conflicts_resolved_total",
                "Keys reconciled across owners",
            ),
            inbound_tasks_active: Gauge::new("st_inbound_tasks", "Inbound tasks in progress"),
            outbound_tasks_active: Gauge::new("st_outbound_tasks", "Outbound tasks in progress"),
            chunk_apply_time: Histogram::new(
                "st_chunk_apply_seconds",
                "Time to apply one chunk",
                CHUNK_APPLY_BUCKETS,
            ),
            phase_time: Histogram::new(
                "st_phase_seconds",
                "Time from topology install to phase confirmation",
                PHASE_BUCKETS,
            ),
        }
    }

    /// Record a received chunk and its outcome.
    pub fn record_chunk_applied(&self, applied: u64, discarded: u64, elapsed: Duration) {
        self.chunks_received.inc();
        self.entries_applied.inc_by(applied);
        self.entries_discarded.inc_by(discarded);
        self.chunk_apply_time.observe(elapsed);
    }

    /// Record a batch sent to a consumer.
    pub fn record_batch_sent(&self, chunks: usize, entries: usize) {
        self.chunks_sent.inc_by(chunks as u64);
        self.entries_sent.inc_by(entries as u64);
    }

    /// Record a phase confirmation.
    pub fn record_phase_confirmed(&self, elapsed: Duration) {
        self.phase_confirmations.inc();
        self.phase_time.observe(elapsed);
    }

    /// Point-in-time copy of the counters and gauges.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            topology_updates: self.topology_updates.get(),
            segments_requested: self.segments_requested.get(),
            segments_completed: self.segments_completed.get(),
            segments_lost: self.segments_lost.get(),
            chunks_received: self.chunks_received.get(),
            chunks_discarded: self.chunks_discarded.get(),
            entries_applied: self.entries_applied.get(),
            entries_discarded: self.entries_discarded.get(),
            chunks_sent: self.chunks_sent.get(),
            entries_sent: self.entries_sent.get(),
            outbound_tasks_started: self.outbound_tasks_started.get(),
            outbound_tasks_cancelled: self.outbound_tasks_cancelled.get(),
            phase_confirmations: self.phase_confirmations.get(),
            conflicts_resolved: self.conflicts_resolved.get(),
            inbound_tasks_active: self.inbound_tasks_active.get(),
            outbound_tasks_active: self.outbound_tasks_active.get(),
        }
    }

    /// Format metrics in Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        macro_rules! add_metric {
            ($kind:literal, $metric:expr) => {
                let _ = write!(
                    output,
                    "# HELP {name} {help}\n# TYPE {name} {kind}\n{name} {value}\n",
                    name = $metric.name(),
                    help = $metric.help(),
                    kind = $kind,
                    value = $metric.get()
                );
            };
        }

        add_metric!("counter", self.topology_updates);
        add_metric!("counter", self.segments_requested);
        add_metric!("counter", self.segments_completed);
        add_metric!("counter", self.segments_lost);
        add_metric!("counter", self.chunks_received);
        add_metric!("counter", self.chunks_discarded);
        add_metric!("counter", self.entries_applied);
        add_metric!("counter", self.entries_discarded);
        add_metric!("counter", self.chunks_sent);
        add_metric!("counter", self.entries_sent);
        add_metric!("counter", self.outbound_tasks_started);
        add_metric!("counter", self.outbound_tasks_cancelled);
        add_metric!("counter", self.phase_confirmations);
        add_metric!("counter", self.conflicts_resolved);
        add_metric!("gauge", self.inbound_tasks_active);
        add_metric!("gauge", self.outbound_tasks_active);

        for hist in [&self.chunk_apply_time, &self.phase_time] {
            let _ = writeln!(output, "# HELP {} {}", hist.name(), hist.help());
            let _ = writeln!(output, "# TYPE {} histogram", hist.name());
            for (upper, count) in hist.buckets() {
                let _ = writeln!(output, "{}_bucket{{le=\"{}\"}} {}", hist.name(), upper, count);
            }
            let _ = writeln!(output, "{}_bucket{{le=\"+Inf\"}} {}", hist.name(), hist.count());
            let _ = writeln!(output, "{}_sum {}", hist.name(), hist.sum());
            let _ = writeln!(output, "{}_count {}", hist.name(), hist.count());
        }

        output
    }
}

impl Default for StateTransferMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A copy of the state transfer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub topology_updates: u64,
    pub segments_requested: u64,
    pub segments_completed: u64,
    pub segments_lost: u64,
    pub chunks_received: u64,
    pub chunks_discarded: u64,
    pub entries_applied: u64,
    pub entries_discarded: u64,
    pub chunks_sent: u64,
    pub entries_sent: u64,
    pub outbound_tasks_started: u64,
    pub outbound_tasks_cancelled: u64,
    pub phase_confirmations: u64,
    pub conflicts_resolved: u64,
    pub inbound_tasks_active: i64,
    pub outbound_tasks_active: i64,
}

impl MetricsSnapshot {
    /// Fraction of received entries that were superseded by live writes.
    pub fn discard_rate(&self) -> f64 {
        let total = self.entries_applied + self.entries_discarded;
        if total == 0 {
            0.0
        } else {
            self.entries_discarded as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let metrics = StateTransferMetrics::new();
        metrics.record_chunk_applied(3, 1, Duration::from_micros(200));
        metrics.record_chunk_applied(4, 0, Duration::from_micros(100));
        metrics.record_batch_sent(2, 9);
        metrics.inbound_tasks_active.inc();

        let snap = metrics.snapshot();
        assert_eq!(snap.chunks_received, 2);
        assert_eq!(snap.entries_applied, 7);
        assert_eq!(snap.entries_discarded, 1);
        assert_eq!(snap.chunks_sent, 2);
        assert_eq!(snap.entries_sent, 9);
        assert_eq!(snap.inbound_tasks_active, 1);
        assert!((snap.discard_rate() - 0.125).abs() < 1e-9);
    }

    #[test]
    fn test_prometheus_output() {
        let metrics = StateTransferMetrics::new();
        metrics.record_phase_confirmed(Duration::from_millis(30));

        let output = metrics.to_prometheus();
        assert!(output.contains("# TYPE st_phase_confirmations_total counter"));
        assert!(output.contains("st_phase_confirmations_total 1"));
        assert!(output.contains("st_phase_seconds_bucket{le=\"0.05\"} 1"));
        assert!(output.contains("st_phase_seconds_count 1"));
    }
}
