//! Prometheus metrics for the agent

use prometheus::{
    register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec,
};
use std::sync::OnceLock;

/// Metrics registry
pub struct Metrics {
    /// Events handled, by resource kind and operation
    pub events_total: IntCounterVec,

    /// Event handler errors, by resource kind and operation
    pub event_errors: IntCounterVec,

    /// Event handler duration, by resource kind
    pub event_duration: HistogramVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

impl Metrics {
    /// Initialize metrics
    pub fn new() -> Self {
        Self {
            events_total: register_int_counter_vec!(
                "rampart_events_handled_total",
                "Total number of watch events handled",
                &["kind", "op"]
            )
            .unwrap(),

            event_errors: register_int_counter_vec!(
                "rampart_event_errors_total",
                "Total number of event handler errors",
                &["kind", "op"]
            )
            .unwrap(),

            event_duration: register_histogram_vec!(
                "rampart_event_duration_seconds",
                "Duration of event reconciliation",
                &["kind"],
                vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
            )
            .unwrap(),
        }
    }

    /// Get global metrics instance
    pub fn global() -> &'static Metrics {
        METRICS.get_or_init(Metrics::new)
    }

    /// Record a handled event
    pub fn record_event(&self, kind: &str, op: &str, duration_secs: f64) {
        self.events_total.with_label_values(&[kind, op]).inc();
        self.event_duration
            .with_label_values(&[kind])
            .observe(duration_secs);
    }

    /// Record a handler error
    pub fn record_error(&self, kind: &str, op: &str) {
        self.event_errors.with_label_values(&[kind, op]).inc();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
