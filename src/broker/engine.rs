//! Per-channel queue delivery engine.
//!
//! Lifecycle of a message, by the store that holds it:
//!
//! ```text
//! primary ──pump──► ack table ──ack──► gone
//!    ▲  │                │
//!    │  │ no subscriber  │ nack / ack timeout
//!    │  ▼                ▼
//!    │ secondary      nb_requeues < limit ? primary | delayed : dropped
//!    └── add_client ──┘
//! ```
//!
//! The engine is plain data: every operation takes the current time in epoch
//! milliseconds and deliveries are queued in an outbox instead of being
//! pushed to the transport. [`super::channel::Channel`] supplies the clock,
//! the lock, the timer and the handler.

use super::envelope::{Delivery, Envelope, Headers, SubscriberKind, WILDCARD};
use super::secondary::{SecondaryStats, SecondaryStore};
use super::tree::DispatchTree;
use crate::config::{ChannelConfig, QueueConfig};
use crate::observability::{ChannelCounters, CounterSink};
use crate::util::{payload_preview, secs_to_ms};
use crate::validation::{self, ValidationError, ValidationErrors, Validator};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

const PREVIEW_CHARS: usize = 120;

/// What happened to a message handed back by `nack` or an ack timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResendOutcome {
    /// Appended to the primary queue.
    Requeued,
    /// Parked until its due time.
    Delayed { due_at: u64 },
    /// Retry budget exhausted.
    Dropped,
}

/// Work done by one [`QueueEngine::tick`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub timed_out: usize,
    pub promoted: usize,
    pub delivered: usize,
    pub expired: usize,
}

/// Point-in-time counts of a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelStatistics {
    pub received: u64,
    pub dropped: u64,
    pub timeouts: u64,
    pub dead: u64,
    pub in_flight: usize,
    pub primary: usize,
    pub delayed: usize,
    pub secondary: usize,
}

/// Queue depths and the last message seen by each store.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSnapshot {
    pub in_flight: usize,
    pub primary: usize,
    pub delayed: usize,
    pub secondary: SecondaryStats,
    pub last_item: Option<Envelope>,
    pub last_item_secondary: Option<Envelope>,
}

#[derive(Debug, Clone)]
struct InFlight {
    envelope: Envelope,
    sequence: u64,
}

pub struct QueueEngine {
    name: String,
    requeue_limit: u32,
    requeue_interval_ms: u64,
    queue: QueueConfig,
    validator: Box<dyn Validator>,
    tree: DispatchTree,
    primary: VecDeque<Envelope>,
    requeue_delayed: Vec<(u64, Envelope)>,
    secondary: SecondaryStore,
    ack_table: HashMap<String, InFlight>,
    next_sequence: u64,
    last_item: Option<Envelope>,
    last_item_secondary: Option<Envelope>,
    nb_messages_received: u64,
    counters: Arc<dyn CounterSink>,
    counter_ids: ChannelCounters,
    outbox: VecDeque<Delivery>,
}

impl fmt::Debug for QueueEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueEngine")
            .field("name", &self.name)
            .field("requeue_limit", &self.requeue_limit)
            .field("requeue_interval_ms", &self.requeue_interval_ms)
            .field("queue", &self.queue)
            .field("primary", &self.primary.len())
            .field("delayed", &self.requeue_delayed.len())
            .field("secondary", &self.secondary.len())
            .field("in_flight", &self.ack_table.len())
            .finish_non_exhaustive()
    }
}

impl QueueEngine {
    pub fn new(config: &ChannelConfig, counters: Arc<dyn CounterSink>) -> Self {
        let name = config.name();
        let counter_ids = ChannelCounters::new(&name);
        counter_ids.register(counters.as_ref(), &name);

        Self {
            requeue_limit: config.requeue_limit,
            requeue_interval_ms: secs_to_ms(config.requeue_interval_secs),
            queue: config.queue.clone(),
            validator: validation::compile(&config.queue.map),
            tree: DispatchTree::new(),
            primary: VecDeque::new(),
            requeue_delayed: Vec::new(),
            secondary: SecondaryStore::new(config.max_items_in_queue),
            ack_table: HashMap::new(),
            next_sequence: 0,
            last_item: None,
            last_item_secondary: None,
            nb_messages_received: 0,
            counters,
            counter_ids,
            outbox: VecDeque::new(),
            name,
        }
    }

    /// Replace the validator compiled from the field map.
    pub fn with_validator(mut self, validator: Box<dyn Validator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn prefetch(&self) -> usize {
        self.queue.prefetch.max(1)
    }

    /// Validate `item.data` and enqueue the item under correlation key `id`.
    ///
    /// Returns the message id (generated when `message_id` is `None`). On
    /// rejection nothing is enqueued.
    pub fn add_in_queue(
        &mut self,
        id: &str,
        item: Value,
        message_id: Option<String>,
        now: u64,
    ) -> Result<String, ValidationErrors> {
        let errors = match item.get("data") {
            None | Some(Value::Null) => {
                vec![ValidationError::new("data", Value::Null, "is required")]
            }
            Some(data) => self.validator.validate(data),
        };
        if !errors.is_empty() {
            tracing::debug!(channel = %self.name, id, errors = errors.len(), "Item rejected");
            return Err(ValidationErrors(errors));
        }

        let message_id = message_id
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut headers = Headers::new(message_id.clone());
        headers.created = now;
        self.primary
            .push_back(Envelope::new(id, item, headers, now));

        self.nb_messages_received += 1;
        self.counters.update(&self.counter_ids.received, 1);
        self.counters
            .update(&self.counter_ids.received_per_second, 1);

        self.pump(now);
        Ok(message_id)
    }

    /// Move messages from the primary queue to subscribers until the
    /// prefetch window is full or the queue is empty. Returns the number of
    /// deliveries produced.
    pub fn pump(&mut self, now: u64) -> usize {
        let mut delivered = 0;
        while self.ack_table.len() < self.prefetch() {
            let Some(envelope) = self.primary.pop_front() else {
                break;
            };
            let targets = self.tree.resolve(&envelope.id);
            if targets.is_empty() {
                self.buffer(envelope);
                continue;
            }
            self.dispatch(envelope, targets, now);
            delivered += 1;
        }
        delivered
    }

    fn buffer(&mut self, envelope: Envelope) {
        tracing::debug!(
            channel = %self.name,
            id = %envelope.id,
            message_id = %envelope.message_id(),
            "No subscriber; buffering in overflow store"
        );
        self.last_item_secondary = Some(envelope.clone());
        if let Some(evicted) = self.secondary.push(envelope) {
            self.counters.update(&self.counter_ids.dropped, 1);
            tracing::warn!(
                channel = %self.name,
                id = %evicted.id,
                message_id = %evicted.message_id(),
                limit = self.secondary.max_per_key(),
                "Overflow store full for key; dropped oldest message"
            );
        }
    }

    fn dispatch(&mut self, mut envelope: Envelope, addresses: Vec<String>, now: u64) {
        envelope.headers.created = now;
        let message_id = envelope.message_id().to_string();
        self.next_sequence += 1;
        let previous = self.ack_table.insert(
            message_id.clone(),
            InFlight {
                envelope: envelope.clone(),
                sequence: self.next_sequence,
            },
        );
        if previous.is_some() {
            tracing::warn!(
                channel = %self.name,
                message_id = %message_id,
                "Message id already awaiting an ack; previous delivery replaced"
            );
        }

        tracing::debug!(
            channel = %self.name,
            id = %envelope.id,
            message_id = %message_id,
            targets = addresses.len(),
            payload = %payload_preview(&envelope.payload, PREVIEW_CHARS),
            "Dispatching message"
        );

        let unacked = self.unacked_ids();
        self.outbox.push_back(Delivery {
            channel: self.name.clone(),
            addresses,
            payload: envelope.payload.clone(),
            headers: envelope.headers.clone(),
            unacked,
        });
        self.last_item = Some(envelope);
    }

    /// Settle a delivery. Unknown ids are ignored.
    pub fn ack(&mut self, message_id: &str, now: u64) -> bool {
        if self.ack_table.remove(message_id).is_none() {
            return false;
        }
        self.pump(now);
        true
    }

    /// Hand a delivery back for another attempt, after `delay_secs` seconds.
    /// Unknown ids are ignored.
    pub fn nack(&mut self, message_id: &str, delay_secs: u64, now: u64) -> Option<ResendOutcome> {
        let outcome = self.resend(message_id, delay_secs, now)?;
        self.pump(now);
        Some(outcome)
    }

    fn resend(&mut self, message_id: &str, delay_secs: u64, now: u64) -> Option<ResendOutcome> {
        let InFlight { mut envelope, .. } = self.ack_table.remove(message_id)?;
        envelope.headers.nb_requeues += 1;
        if envelope.headers.nb_requeues >= self.requeue_limit {
            tracing::debug!(
                channel = %self.name,
                message_id,
                attempts = envelope.headers.nb_requeues,
                "Retry budget exhausted; dropping message"
            );
            return Some(ResendOutcome::Dropped);
        }

        envelope.enqueued_at = now;
        if delay_secs == 0 {
            self.primary.push_back(envelope);
            Some(ResendOutcome::Requeued)
        } else {
            let due_at = now.saturating_add(secs_to_ms(delay_secs));
            self.requeue_delayed.push((due_at, envelope));
            Some(ResendOutcome::Delayed { due_at })
        }
    }

    /// One timer step: resend timed-out deliveries, promote due delayed
    /// requeues, pump, then expire stale overflow entries.
    pub fn tick(&mut self, now: u64) -> TickReport {
        let mut report = TickReport::default();

        let mut expired: Vec<(u64, String)> = self
            .ack_table
            .iter()
            .filter(|(_, entry)| {
                entry
                    .envelope
                    .headers
                    .created
                    .saturating_add(self.requeue_interval_ms)
                    <= now
            })
            .map(|(message_id, entry)| (entry.sequence, message_id.clone()))
            .collect();
        expired.sort_unstable();
        for (_, message_id) in expired {
            self.counters.update(&self.counter_ids.timeouts, 1);
            if let Some(entry) = self.ack_table.get_mut(&message_id) {
                entry.envelope.headers.error = Some("ack timeout".to_string());
            }
            tracing::debug!(channel = %self.name, message_id = %message_id, "Ack timeout");
            self.resend(&message_id, 0, now);
            report.timed_out += 1;
        }

        if !self.requeue_delayed.is_empty() {
            let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.requeue_delayed)
                .into_iter()
                .partition(|(due_at, _)| *due_at <= now);
            self.requeue_delayed = waiting;
            report.promoted = due.len();
            self.primary
                .extend(due.into_iter().map(|(_, envelope)| envelope));
        }

        report.delivered = self.pump(now);

        if let Some(ttl_secs) = self.queue.ttl_secs {
            let ttl_ms = secs_to_ms(ttl_secs);
            if now >= ttl_ms {
                let evicted = self.secondary.evict_enqueued_before(now - ttl_ms);
                if !evicted.is_empty() {
                    let count = evicted.len() as u64;
                    self.counters.update(&self.counter_ids.dead, count);
                    self.counters.update(&self.counter_ids.dropped, count);
                    tracing::warn!(
                        channel = %self.name,
                        expired = evicted.len(),
                        ttl_secs,
                        "Expired overflow entries"
                    );
                }
                report.expired = evicted.len();
            }
        }

        report
    }

    /// Register a subscriber on `ids`, replay matching overflow backlog and
    /// pump. Returns the number of replayed messages.
    pub fn add_client<S: AsRef<str>>(
        &mut self,
        ids: &[S],
        client: &str,
        node: &str,
        kind: SubscriberKind,
        now: u64,
    ) -> usize {
        self.tree.add_client(client, node, kind, ids);
        tracing::debug!(channel = %self.name, client, node, %kind, ids = ids.len(), "Subscriber registered");

        let mut replayed = Vec::new();
        if ids.iter().any(|id| id.as_ref() == WILDCARD) {
            replayed = self.secondary.take_all();
        } else {
            for id in ids {
                replayed.extend(self.secondary.take(id.as_ref()));
            }
            replayed.extend(self.secondary.take(WILDCARD));
        }

        let count = replayed.len();
        if count > 0 {
            tracing::debug!(channel = %self.name, replayed = count, "Replaying overflow backlog");
            self.primary.extend(replayed);
        }
        self.pump(now);
        count
    }

    /// Unregister a subscriber from `ids`, or from every id it holds.
    pub fn remove_client(
        &mut self,
        ids: Option<&[String]>,
        client: &str,
        node: &str,
        kind: SubscriberKind,
    ) -> usize {
        let removed = self.tree.remove_client(client, node, kind, ids);
        if removed > 0 {
            tracing::debug!(channel = %self.name, client, node, %kind, removed, "Subscriber removed");
        }
        removed
    }

    /// Swap the per-queue settings and recompile the validator. Queued
    /// messages are left untouched.
    pub fn reload(&mut self, queue: QueueConfig) {
        self.validator = validation::compile(&queue.map);
        tracing::info!(
            channel = %self.name,
            prefetch = queue.prefetch,
            ttl_secs = ?queue.ttl_secs,
            fields = queue.map.len(),
            "Queue config reloaded"
        );
        self.queue = queue;
    }

    pub fn statistics(&self) -> ChannelStatistics {
        let counters = self.counters.get_all();
        let read = |id: &str| counters.get(id).copied().unwrap_or(0);
        ChannelStatistics {
            received: read(&self.counter_ids.received),
            dropped: read(&self.counter_ids.dropped),
            timeouts: read(&self.counter_ids.timeouts),
            dead: read(&self.counter_ids.dead),
            in_flight: self.ack_table.len(),
            primary: self.primary.len(),
            delayed: self.requeue_delayed.len(),
            secondary: self.secondary.len(),
        }
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            in_flight: self.ack_table.len(),
            primary: self.primary.len(),
            delayed: self.requeue_delayed.len(),
            secondary: self.secondary.stats(),
            last_item: self.last_item.clone(),
            last_item_secondary: self.last_item_secondary.clone(),
        }
    }

    /// Next delivery waiting for the transport, oldest first.
    pub fn pop_delivery(&mut self) -> Option<Delivery> {
        self.outbox.pop_front()
    }

    pub fn has_pending_deliveries(&self) -> bool {
        !self.outbox.is_empty()
    }

    /// Message ids awaiting an ack, in delivery order.
    pub fn unacked_ids(&self) -> Vec<String> {
        let mut entries: Vec<(u64, &String)> = self
            .ack_table
            .iter()
            .map(|(message_id, entry)| (entry.sequence, message_id))
            .collect();
        entries.sort_unstable();
        entries.into_iter().map(|(_, id)| id.clone()).collect()
    }

    pub fn in_flight(&self, message_id: &str) -> Option<&Headers> {
        self.ack_table
            .get(message_id)
            .map(|entry| &entry.envelope.headers)
    }

    pub fn primary(&self) -> impl Iterator<Item = &Envelope> {
        self.primary.iter()
    }

    pub fn primary_len(&self) -> usize {
        self.primary.len()
    }

    pub fn delayed_len(&self) -> usize {
        self.requeue_delayed.len()
    }

    pub fn secondary(&self) -> &SecondaryStore {
        &self.secondary
    }

    pub fn secondary_stats(&self) -> SecondaryStats {
        self.secondary.stats()
    }

    pub fn last_item(&self) -> Option<&Envelope> {
        self.last_item.as_ref()
    }

    pub fn last_item_secondary(&self) -> Option<&Envelope> {
        self.last_item_secondary.as_ref()
    }

    pub fn messages_received(&self) -> u64 {
        self.nb_messages_received
    }

    pub fn tree(&self) -> &DispatchTree {
        &self.tree
    }

    pub fn queue_config(&self) -> &QueueConfig {
        &self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FieldKind, FieldRule};
    use crate::observability::InMemoryCounters;
    use serde_json::json;

    const T0: u64 = 1_700_000_000_000;

    fn channel_config() -> ChannelConfig {
        let mut config = ChannelConfig::new("queue", "v1");
        config.max_items_in_queue = 3;
        config.requeue_limit = 3;
        config.requeue_interval_secs = 10;
        config
    }

    fn engine_with(config: &ChannelConfig) -> (QueueEngine, Arc<InMemoryCounters>) {
        let counters = Arc::new(InMemoryCounters::new());
        (QueueEngine::new(config, counters.clone()), counters)
    }

    fn item(label: &str) -> Value {
        json!({"data": {"label": label}})
    }

    fn drain(engine: &mut QueueEngine) -> Vec<Delivery> {
        std::iter::from_fn(|| engine.pop_delivery()).collect()
    }

    fn labels(deliveries: &[Delivery]) -> Vec<String> {
        deliveries
            .iter()
            .map(|d| d.payload["data"]["label"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn missing_data_is_rejected_without_side_effects() {
        let (mut engine, counters) = engine_with(&channel_config());
        let errors = engine
            .add_in_queue("1", json!({"label": "a"}), None, T0)
            .unwrap_err();
        assert_eq!(errors.errors()[0].field, "data");
        assert_eq!(engine.primary_len(), 0);
        assert_eq!(engine.secondary().len(), 0);
        assert_eq!(counters.get("queue/v1.received"), 0);
    }

    #[test]
    fn validator_rejection_leaves_primary_unchanged() {
        let mut config = channel_config();
        config.queue.map.insert(
            "label".into(),
            FieldRule {
                kind: FieldKind::String,
                required: true,
            },
        );
        let (mut engine, _) = engine_with(&config);
        let errors = engine
            .add_in_queue("1", json!({"data": {"label": 5}}), None, T0)
            .unwrap_err();
        assert!(!errors.is_empty());
        assert_eq!(engine.primary_len(), 0);
        assert_eq!(engine.messages_received(), 0);
    }

    #[test]
    fn generated_message_ids_are_returned() {
        let (mut engine, counters) = engine_with(&channel_config());
        let message_id = engine.add_in_queue("1", item("a"), None, T0).unwrap();
        assert!(Uuid::parse_str(&message_id).is_ok());
        let given = engine
            .add_in_queue("1", item("b"), Some("m-2".into()), T0)
            .unwrap();
        assert_eq!(given, "m-2");
        assert_eq!(counters.get("queue/v1.received"), 2);
    }

    #[test]
    fn no_subscriber_buffers_up_to_bound_and_counts_drops() {
        let (mut engine, counters) = engine_with(&channel_config());
        for i in 0..5 {
            engine
                .add_in_queue("1", item(&format!("m{i}")), None, T0)
                .unwrap();
        }
        assert_eq!(engine.secondary().len_for("1"), 3);
        assert_eq!(engine.secondary_stats().dropped, 2);
        assert_eq!(counters.get("queue/v1.dropped"), 2);
        assert_eq!(engine.primary_len(), 0);
        let kept: Vec<_> = engine
            .secondary()
            .bucket("1")
            .iter()
            .map(|e| e.payload["data"]["label"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(kept, vec!["m2", "m3", "m4"]);
        assert_eq!(
            engine.last_item_secondary().unwrap().payload["data"]["label"],
            "m4"
        );
    }

    #[test]
    fn buffered_backlog_replays_in_order_on_registration() {
        let (mut engine, _) = engine_with(&channel_config());
        engine.add_in_queue("1", item("a"), None, T0).unwrap();
        engine.add_in_queue("1", item("b"), None, T0).unwrap();
        assert_eq!(engine.secondary().len_for("1"), 2);

        let replayed = engine.add_client(&["1"], "c1", "n1", SubscriberKind::Consume, T0);
        assert_eq!(replayed, 2);
        assert!(engine.secondary().is_empty());

        let first = drain(&mut engine);
        assert_eq!(labels(&first), vec!["a"]);
        assert_eq!(first[0].addresses, vec!["c1#n1"]);
        assert_eq!(engine.primary_len(), 1);

        let message_id = first[0].headers.message_id.clone();
        assert!(engine.ack(&message_id, T0));
        assert_eq!(labels(&drain(&mut engine)), vec!["b"]);
    }

    #[test]
    fn prefetch_bounds_in_flight_messages() {
        let mut config = channel_config();
        config.queue.prefetch = 2;
        let (mut engine, _) = engine_with(&config);
        engine.add_client(&["1"], "c1", "n1", SubscriberKind::Consume, T0);
        for i in 0..5 {
            engine
                .add_in_queue("1", item(&format!("m{i}")), None, T0)
                .unwrap();
            assert!(engine.unacked_ids().len() <= 2);
        }
        let delivered = drain(&mut engine);
        assert_eq!(labels(&delivered), vec!["m0", "m1"]);
        assert_eq!(delivered[1].unacked.len(), 2);
        assert_eq!(engine.primary_len(), 3);

        engine.ack(&delivered[0].headers.message_id, T0);
        assert_eq!(labels(&drain(&mut engine)), vec!["m2"]);
        assert_eq!(engine.unacked_ids().len(), 2);
    }

    #[test]
    fn consumers_are_load_balanced_and_listeners_fan_out() {
        let mut config = channel_config();
        config.queue.prefetch = 10;
        let (mut engine, _) = engine_with(&config);
        engine.add_client(&["1"], "c1", "n1", SubscriberKind::Consume, T0);
        engine.add_client(&["1"], "c2", "n1", SubscriberKind::Consume, T0);
        engine.add_client(&["1"], "l1", "n1", SubscriberKind::Listen, T0);

        engine.add_in_queue("1", item("a"), None, T0).unwrap();
        engine.add_in_queue("1", item("b"), None, T0).unwrap();
        let delivered = drain(&mut engine);
        assert_eq!(delivered[0].addresses, vec!["c1#n1", "l1#n1"]);
        assert_eq!(delivered[1].addresses, vec!["c2#n1", "l1#n1"]);
    }

    #[test]
    fn ack_of_unknown_id_is_a_noop() {
        let (mut engine, _) = engine_with(&channel_config());
        assert!(!engine.ack("missing", T0));
        assert_eq!(engine.nack("missing", 0, T0), None);
    }

    #[test]
    fn timeout_redelivers_with_incremented_requeue_count_then_drops() {
        let (mut engine, counters) = engine_with(&channel_config());
        engine.add_client(&["1"], "c1", "n1", SubscriberKind::Consume, T0);
        engine.add_in_queue("1", item("a"), Some("m".into()), T0).unwrap();
        assert_eq!(drain(&mut engine)[0].headers.nb_requeues, 0);

        // not yet due
        assert_eq!(engine.tick(T0 + 9_999).timed_out, 0);

        let mut now = T0 + 10_000;
        let report = engine.tick(now);
        assert_eq!(report.timed_out, 1);
        let redelivered = drain(&mut engine);
        assert_eq!(redelivered[0].headers.nb_requeues, 1);
        assert_eq!(redelivered[0].headers.error.as_deref(), Some("ack timeout"));

        now += 10_000;
        engine.tick(now);
        assert_eq!(drain(&mut engine)[0].headers.nb_requeues, 2);

        // third timeout reaches requeue_limit = 3
        now += 10_000;
        let report = engine.tick(now);
        assert_eq!(report.timed_out, 1);
        assert!(drain(&mut engine).is_empty());
        assert!(engine.in_flight("m").is_none());
        assert_eq!(engine.primary_len(), 0);
        assert_eq!(counters.get("queue/v1.timeouts"), 3);
    }

    #[test]
    fn nack_requeues_at_tail() {
        let mut config = channel_config();
        config.queue.prefetch = 1;
        let (mut engine, _) = engine_with(&config);
        engine.add_client(&["1"], "c1", "n1", SubscriberKind::Consume, T0);
        engine.add_in_queue("1", item("a"), Some("a".into()), T0).unwrap();
        engine.add_in_queue("1", item("b"), Some("b".into()), T0).unwrap();
        assert_eq!(labels(&drain(&mut engine)), vec!["a"]);

        assert_eq!(engine.nack("a", 0, T0), Some(ResendOutcome::Requeued));
        assert_eq!(labels(&drain(&mut engine)), vec!["b"]);
        engine.ack("b", T0);
        let again = drain(&mut engine);
        assert_eq!(labels(&again), vec!["a"]);
        assert_eq!(again[0].headers.nb_requeues, 1);
    }

    #[test]
    fn delayed_nack_is_not_redelivered_before_due_time() {
        let (mut engine, _) = engine_with(&channel_config());
        engine.add_client(&["1"], "c1", "n1", SubscriberKind::Consume, T0);
        engine.add_in_queue("1", item("a"), Some("a".into()), T0).unwrap();
        drain(&mut engine);

        assert_eq!(
            engine.nack("a", 5, T0),
            Some(ResendOutcome::Delayed { due_at: T0 + 5_000 })
        );
        assert_eq!(engine.delayed_len(), 1);
        engine.tick(T0 + 4_999);
        assert!(drain(&mut engine).is_empty());

        let report = engine.tick(T0 + 5_000);
        assert_eq!(report.promoted, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(labels(&drain(&mut engine)), vec!["a"]);
    }

    #[test]
    fn delayed_promotion_preserves_relative_order() {
        let mut config = channel_config();
        config.queue.prefetch = 3;
        let (mut engine, _) = engine_with(&config);
        engine.add_client(&["1"], "c1", "n1", SubscriberKind::Consume, T0);
        for label in ["a", "b", "c"] {
            engine
                .add_in_queue("1", item(label), Some(label.into()), T0)
                .unwrap();
        }
        drain(&mut engine);
        engine.nack("c", 1, T0);
        engine.nack("a", 2, T0);
        engine.nack("b", 1, T0);
        assert!(drain(&mut engine).is_empty());

        engine.tick(T0 + 3_000);
        assert_eq!(labels(&drain(&mut engine)), vec!["c", "a", "b"]);
    }

    #[test]
    fn nack_at_limit_drops_silently() {
        let mut config = channel_config();
        config.requeue_limit = 1;
        let (mut engine, counters) = engine_with(&config);
        engine.add_client(&["1"], "c1", "n1", SubscriberKind::Consume, T0);
        engine.add_in_queue("1", item("a"), Some("a".into()), T0).unwrap();
        drain(&mut engine);

        assert_eq!(engine.nack("a", 0, T0), Some(ResendOutcome::Dropped));
        assert_eq!(engine.primary_len(), 0);
        assert_eq!(engine.delayed_len(), 0);
        assert_eq!(counters.get("queue/v1.timeouts"), 0);
        assert_eq!(counters.get("queue/v1.dropped"), 0);
    }

    #[test]
    fn ttl_expires_overflow_entries() {
        let mut config = channel_config();
        config.queue.ttl_secs = Some(60);
        let (mut engine, counters) = engine_with(&config);
        engine.add_in_queue("1", item("old"), None, T0).unwrap();
        engine.add_in_queue("2", item("new"), None, T0 + 30_000).unwrap();

        assert_eq!(engine.tick(T0 + 59_999).expired, 0);
        let report = engine.tick(T0 + 60_000);
        assert_eq!(report.expired, 1);
        assert_eq!(engine.secondary().len(), 1);
        assert!(engine.secondary().has_entries_for("2"));
        assert_eq!(counters.get("queue/v1.dead"), 1);
        assert_eq!(counters.get("queue/v1.dropped"), 1);
    }

    #[test]
    fn without_ttl_overflow_entries_stay() {
        let (mut engine, _) = engine_with(&channel_config());
        engine.add_in_queue("1", item("a"), None, T0).unwrap();
        assert_eq!(engine.tick(T0 + 86_400_000).expired, 0);
        assert_eq!(engine.secondary().len(), 1);
    }

    #[test]
    fn wildcard_subscriber_receives_every_key_and_replays_all_buckets() {
        let mut config = channel_config();
        config.queue.prefetch = 10;
        let (mut engine, _) = engine_with(&config);
        engine.add_in_queue("1", item("a"), None, T0).unwrap();
        engine.add_in_queue("2", item("b"), None, T0).unwrap();

        let replayed = engine.add_client(&[WILDCARD], "audit", "n1", SubscriberKind::Listen, T0);
        assert_eq!(replayed, 2);
        let delivered = drain(&mut engine);
        assert_eq!(labels(&delivered), vec!["a", "b"]);
        assert!(delivered.iter().all(|d| d.addresses == vec!["audit#n1"]));
    }

    #[test]
    fn wildcard_messages_wait_for_any_subscriber() {
        let (mut engine, _) = engine_with(&channel_config());
        engine.add_in_queue(WILDCARD, item("broadcast"), None, T0).unwrap();
        assert_eq!(engine.secondary().len_for(WILDCARD), 1);

        engine.add_client(&["9"], "c1", "n1", SubscriberKind::Consume, T0);
        let delivered = drain(&mut engine);
        assert_eq!(labels(&delivered), vec!["broadcast"]);
        assert_eq!(delivered[0].addresses, vec!["c1#n1"]);
    }

    #[test]
    fn removed_subscriber_no_longer_receives() {
        let (mut engine, _) = engine_with(&channel_config());
        engine.add_client(&["1"], "c1", "n1", SubscriberKind::Consume, T0);
        assert_eq!(engine.remove_client(None, "c1", "n1", SubscriberKind::Consume), 1);
        engine.add_in_queue("1", item("a"), None, T0).unwrap();
        assert!(drain(&mut engine).is_empty());
        assert_eq!(engine.secondary().len_for("1"), 1);
    }

    #[test]
    fn reload_swaps_validator_without_touching_queues() {
        let (mut engine, _) = engine_with(&channel_config());
        engine.add_in_queue("1", item("a"), None, T0).unwrap();

        let mut queue = QueueConfig::default();
        queue.prefetch = 5;
        queue.map.insert(
            "count".into(),
            FieldRule {
                kind: FieldKind::Integer,
                required: true,
            },
        );
        engine.reload(queue);

        assert_eq!(engine.secondary().len(), 1);
        assert_eq!(engine.queue_config().prefetch, 5);
        assert!(engine.add_in_queue("1", item("b"), None, T0).is_err());
        assert!(engine
            .add_in_queue("1", json!({"data": {"count": 1}}), None, T0)
            .is_ok());
    }

    #[test]
    fn statistics_come_from_counters() {
        let (mut engine, _) = engine_with(&channel_config());
        for i in 0..4 {
            engine
                .add_in_queue("1", item(&format!("m{i}")), None, T0)
                .unwrap();
        }
        let stats = engine.statistics();
        assert_eq!(stats.received, 4);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.secondary, 3);
        assert_eq!(stats.in_flight, 0);
    }

    #[test]
    fn snapshot_reports_depths_and_last_items() {
        let (mut engine, _) = engine_with(&channel_config());
        engine.add_in_queue("1", item("buffered"), None, T0).unwrap();
        engine.add_client(&["2"], "c1", "n1", SubscriberKind::Consume, T0);
        engine.add_in_queue("2", item("sent"), None, T0).unwrap();
        engine.add_in_queue("2", item("waiting"), None, T0).unwrap();

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.in_flight, 1);
        assert_eq!(snapshot.primary, 1);
        assert_eq!(snapshot.delayed, 0);
        assert_eq!(snapshot.secondary.total, 1);
        assert_eq!(snapshot.last_item.unwrap().payload["data"]["label"], "sent");
        assert_eq!(
            snapshot.last_item_secondary.unwrap().payload["data"]["label"],
            "buffered"
        );
    }

    #[test]
    fn custom_validator_replaces_field_map() {
        let (engine, _) = engine_with(&channel_config());
        let mut engine = engine.with_validator(Box::new(|data: &Value| {
            if data.get("label").is_some() {
                Vec::new()
            } else {
                vec![ValidationError::new("label", Value::Null, "missing")]
            }
        }));
        assert!(engine.add_in_queue("1", json!({"data": {}}), None, T0).is_err());
        assert!(engine.add_in_queue("1", item("a"), None, T0).is_ok());
    }
}
