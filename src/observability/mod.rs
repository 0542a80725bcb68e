//! Counter sinks the queue engines report into.
//!
//! The engine only emits increments; [`CounterSink`] implementations own the
//! aggregation. [`create_counter_sink`] picks the backend named in
//! `[observability]`.

pub mod counters;

#[cfg(feature = "observability-prometheus")]
pub use counters::PrometheusCounters;
pub use counters::{CounterKind, CounterSink, CounterSpec, InMemoryCounters};

use crate::config::ObservabilityConfig;
use std::sync::Arc;

/// Counter ids owned by one channel, e.g. `queue/v1.received`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelCounters {
    pub received: String,
    pub received_per_second: String,
    pub dropped: String,
    pub timeouts: String,
    pub dead: String,
}

impl ChannelCounters {
    pub fn new(channel: &str) -> Self {
        Self {
            received: format!("{channel}.received"),
            received_per_second: format!("{channel}.received_per_second"),
            dropped: format!("{channel}.dropped"),
            timeouts: format!("{channel}.timeouts"),
            dead: format!("{channel}.dead"),
        }
    }

    /// Declare every counter of the channel on `sink`.
    pub fn register(&self, sink: &dyn CounterSink, channel: &str) {
        sink.register(CounterSpec::total(
            &self.received,
            format!("Messages accepted on {channel}"),
        ));
        sink.register(CounterSpec::per_second(
            &self.received_per_second,
            format!("Messages accepted per second on {channel}"),
        ));
        sink.register(CounterSpec::total(
            &self.dropped,
            format!("Messages dropped from the overflow store of {channel}"),
        ));
        sink.register(CounterSpec::total(
            &self.timeouts,
            format!("Deliveries on {channel} that were not acked in time"),
        ));
        sink.register(CounterSpec::total(
            &self.dead,
            format!("Messages on {channel} expired by TTL"),
        ));
    }
}

/// Build the counter sink selected by `[observability] backend`.
pub fn create_counter_sink(config: &ObservabilityConfig) -> Arc<dyn CounterSink> {
    match config.backend.trim().to_ascii_lowercase().as_str() {
        #[cfg(feature = "observability-prometheus")]
        "prometheus" => Arc::new(PrometheusCounters::new()),
        #[cfg(not(feature = "observability-prometheus"))]
        "prometheus" => {
            tracing::warn!(
                "Prometheus backend requested but the observability-prometheus feature is disabled; using in-memory counters"
            );
            Arc::new(InMemoryCounters::new())
        }
        "memory" | "" => Arc::new(InMemoryCounters::new()),
        other => {
            tracing::warn!("Unknown observability backend '{other}'; using in-memory counters");
            Arc::new(InMemoryCounters::new())
        }
    }
}
