use crate::util::now_epoch_ms;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a counter aggregates the values reported into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterKind {
    /// Monotonic running sum.
    Total,
    /// Sum of the updates received during the last complete second.
    PerSecond,
}

/// Declaration of a counter, registered once before it is updated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterSpec {
    pub id: String,
    pub description: String,
    pub kind: CounterKind,
}

impl CounterSpec {
    pub fn total(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            kind: CounterKind::Total,
        }
    }

    pub fn per_second(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            kind: CounterKind::PerSecond,
        }
    }
}

/// Sink the queue engines report into. Aggregation lives behind this trait.
pub trait CounterSink: Send + Sync {
    fn register(&self, spec: CounterSpec);

    /// Add `value` to the counter `id`.
    fn update(&self, id: &str, value: u64);

    fn get_all(&self) -> BTreeMap<String, u64>;

    fn get(&self, id: &str) -> u64 {
        self.get_all().get(id).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
struct CounterState {
    kind: CounterKind,
    total: u64,
    window_sec: u64,
    window_count: u64,
    last_rate: u64,
}

impl CounterState {
    fn new(kind: CounterKind) -> Self {
        Self {
            kind,
            total: 0,
            window_sec: 0,
            window_count: 0,
            last_rate: 0,
        }
    }

    fn roll(&mut self, sec: u64) {
        if sec == self.window_sec {
            return;
        }
        self.last_rate = if sec == self.window_sec + 1 {
            self.window_count
        } else {
            0
        };
        self.window_sec = sec;
        self.window_count = 0;
    }

    fn record(&mut self, value: u64, now_ms: u64) {
        self.total = self.total.saturating_add(value);
        if self.kind == CounterKind::PerSecond {
            self.roll(now_ms / 1000);
            self.window_count = self.window_count.saturating_add(value);
        }
    }

    fn read(&self, now_ms: u64) -> u64 {
        match self.kind {
            CounterKind::Total => self.total,
            CounterKind::PerSecond => {
                let sec = now_ms / 1000;
                if sec == self.window_sec {
                    self.last_rate
                } else if sec == self.window_sec + 1 {
                    self.window_count
                } else {
                    0
                }
            }
        }
    }
}

/// Process-local counter sink.
#[derive(Debug, Default)]
pub struct InMemoryCounters {
    counters: Mutex<BTreeMap<String, CounterState>>,
}

impl InMemoryCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_at(&self, id: &str, value: u64, now_ms: u64) {
        let mut counters = self.counters.lock();
        counters
            .entry(id.to_string())
            .or_insert_with(|| CounterState::new(CounterKind::Total))
            .record(value, now_ms);
    }

    pub fn get_all_at(&self, now_ms: u64) -> BTreeMap<String, u64> {
        self.counters
            .lock()
            .iter()
            .map(|(id, state)| (id.clone(), state.read(now_ms)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.counters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.lock().is_empty()
    }
}

impl CounterSink for InMemoryCounters {
    fn register(&self, spec: CounterSpec) {
        self.counters
            .lock()
            .entry(spec.id)
            .or_insert_with(|| CounterState::new(spec.kind));
    }

    fn update(&self, id: &str, value: u64) {
        self.update_at(id, value, now_epoch_ms());
    }

    fn get_all(&self) -> BTreeMap<String, u64> {
        self.get_all_at(now_epoch_ms())
    }
}

#[cfg(feature = "observability-prometheus")]
pub use self::prometheus_sink::PrometheusCounters;

#[cfg(feature = "observability-prometheus")]
mod prometheus_sink {
    use super::{CounterKind, CounterSink, CounterSpec, InMemoryCounters};
    use parking_lot::Mutex;
    use prometheus::{Encoder, IntCounter, Opts, Registry, TextEncoder};
    use std::collections::{BTreeMap, HashMap};

    /// Counter sink that mirrors totals into a Prometheus registry.
    ///
    /// Per-second counters stay local; Prometheus derives rates from totals.
    pub struct PrometheusCounters {
        registry: Registry,
        exported: Mutex<HashMap<String, IntCounter>>,
        local: InMemoryCounters,
    }

    impl PrometheusCounters {
        pub fn new() -> Self {
            Self {
                registry: Registry::new(),
                exported: Mutex::new(HashMap::new()),
                local: InMemoryCounters::new(),
            }
        }

        pub fn registry(&self) -> &Registry {
            &self.registry
        }

        /// Render the registry in the Prometheus text exposition format.
        pub fn encode(&self) -> String {
            let mut buffer = Vec::new();
            if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
                tracing::warn!("Failed to encode metrics: {e}");
                return String::new();
            }
            String::from_utf8(buffer).unwrap_or_default()
        }
    }

    impl Default for PrometheusCounters {
        fn default() -> Self {
            Self::new()
        }
    }

    impl CounterSink for PrometheusCounters {
        fn register(&self, spec: CounterSpec) {
            if spec.kind == CounterKind::Total {
                let help = if spec.description.trim().is_empty() {
                    spec.id.clone()
                } else {
                    spec.description.clone()
                };
                match IntCounter::with_opts(Opts::new(metric_name(&spec.id), help)) {
                    Ok(counter) => match self.registry.register(Box::new(counter.clone())) {
                        Ok(()) => {
                            self.exported.lock().insert(spec.id.clone(), counter);
                        }
                        Err(e) => tracing::warn!(counter = %spec.id, "Metric registration failed: {e}"),
                    },
                    Err(e) => tracing::warn!(counter = %spec.id, "Invalid metric definition: {e}"),
                }
            }
            self.local.register(spec);
        }

        fn update(&self, id: &str, value: u64) {
            self.local.update(id, value);
            if let Some(counter) = self.exported.lock().get(id) {
                counter.inc_by(value);
            }
        }

        fn get_all(&self) -> BTreeMap<String, u64> {
            self.local.get_all()
        }
    }

    /// Map a counter id such as `queue/v1.received` onto a legal metric name.
    fn metric_name(id: &str) -> String {
        let mut name: String = id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        if name.starts_with(|c: char| c.is_ascii_digit()) {
            name.insert(0, '_');
        }
        format!("switchyard_{name}")
    }

}
