use super::engine::{ChannelStatistics, EngineSnapshot, QueueEngine, ResendOutcome, TickReport};
use super::envelope::{Delivery, SubscriberKind};
use crate::config::{validate_queue, ChannelConfig, QueueConfig};
use crate::observability::CounterSink;
use crate::util::now_epoch_ms;
use crate::validation::ValidationErrors;
use anyhow::Result;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

const TICK_INTERVAL: Duration = Duration::from_millis(1000);

/// Transport side of a channel: receives every delivery the engine produces.
///
/// Called without the channel lock held, so an implementation may `ack` or
/// `nack` on `channel` before returning.
pub trait DeliveryHandler: Send + Sync {
    fn deliver(&self, channel: &Channel, delivery: Delivery);
}

impl<F> DeliveryHandler for F
where
    F: Fn(&Channel, Delivery) + Send + Sync,
{
    fn deliver(&self, channel: &Channel, delivery: Delivery) {
        self(channel, delivery);
    }
}

/// Forwards deliveries to an async consumer over an unbounded mpsc channel.
#[derive(Debug, Clone)]
pub struct ForwardingHandler {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl ForwardingHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl DeliveryHandler for ForwardingHandler {
    fn deliver(&self, channel: &Channel, delivery: Delivery) {
        if self.tx.send(delivery).is_err() {
            tracing::warn!(channel = %channel.name(), "Delivery receiver closed; delivery discarded");
        }
    }
}

/// Clears the flushing flag on scope exit, including when a handler unwinds.
struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct ChannelInner {
    name: String,
    engine: Mutex<QueueEngine>,
    handler: Arc<dyn DeliveryHandler>,
    flushing: AtomicBool,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        if let Some(handle) = self.ticker.get_mut().take() {
            handle.abort();
        }
    }
}

/// Shared handle to one channel's queue engine.
///
/// Every operation takes the channel lock, runs the engine, releases the lock
/// and then hands the produced deliveries to the [`DeliveryHandler`]. A
/// one-second tick task is spawned on first use when a tokio runtime is
/// available; it holds a weak reference and stops with the last handle.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.inner.name)
            .field("ticking", &self.is_ticking())
            .finish_non_exhaustive()
    }
}

impl Channel {
    pub fn new(
        config: &ChannelConfig,
        counters: Arc<dyn CounterSink>,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Self {
        Self::from_engine(QueueEngine::new(config, counters), handler)
    }

    /// Wrap an engine built by the caller, e.g. one with a custom validator.
    pub fn from_engine(engine: QueueEngine, handler: Arc<dyn DeliveryHandler>) -> Self {
        let name = engine.name().to_string();
        tracing::info!(channel = %name, "Channel created");
        Self {
            inner: Arc::new(ChannelInner {
                name,
                engine: Mutex::new(engine),
                handler,
                flushing: AtomicBool::new(false),
                ticker: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn add_in_queue(
        &self,
        id: &str,
        item: Value,
        message_id: Option<String>,
    ) -> Result<String, ValidationErrors> {
        let now = now_epoch_ms();
        let accepted = self.inner.engine.lock().add_in_queue(id, item, message_id, now);
        self.ensure_ticker();
        self.flush();
        accepted
    }

    pub fn ack(&self, message_id: &str) -> bool {
        let now = now_epoch_ms();
        let settled = self.inner.engine.lock().ack(message_id, now);
        self.flush();
        settled
    }

    pub fn nack(&self, message_id: &str, delay_secs: u64) -> Option<ResendOutcome> {
        let now = now_epoch_ms();
        let outcome = self.inner.engine.lock().nack(message_id, delay_secs, now);
        self.flush();
        outcome
    }

    pub fn add_client<S: AsRef<str>>(
        &self,
        ids: &[S],
        client: &str,
        node: &str,
        kind: SubscriberKind,
    ) -> usize {
        let now = now_epoch_ms();
        let replayed = self
            .inner
            .engine
            .lock()
            .add_client(ids, client, node, kind, now);
        self.ensure_ticker();
        self.flush();
        replayed
    }

    pub fn remove_client(
        &self,
        ids: Option<&[String]>,
        client: &str,
        node: &str,
        kind: SubscriberKind,
    ) -> usize {
        self.inner
            .engine
            .lock()
            .remove_client(ids, client, node, kind)
    }

    /// Validate and install new queue settings, then pump so a raised
    /// prefetch takes effect immediately.
    pub fn reload(&self, queue: QueueConfig) -> Result<()> {
        validate_queue(self.name(), &queue)?;
        let now = now_epoch_ms();
        {
            let mut engine = self.inner.engine.lock();
            engine.reload(queue);
            engine.pump(now);
        }
        self.flush();
        Ok(())
    }

    pub fn tick(&self) -> TickReport {
        self.tick_at(now_epoch_ms())
    }

    /// Run one timer step at an explicit time.
    pub fn tick_at(&self, now: u64) -> TickReport {
        let report = self.inner.engine.lock().tick(now);
        if report != TickReport::default() {
            tracing::debug!(
                channel = %self.inner.name,
                timed_out = report.timed_out,
                promoted = report.promoted,
                delivered = report.delivered,
                expired = report.expired,
                "Channel tick"
            );
        }
        self.flush();
        report
    }

    pub fn statistics(&self) -> ChannelStatistics {
        self.inner.engine.lock().statistics()
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        self.inner.engine.lock().snapshot()
    }

    /// Read engine state under the channel lock.
    pub fn inspect<R>(&self, f: impl FnOnce(&QueueEngine) -> R) -> R {
        f(&self.inner.engine.lock())
    }

    pub fn is_ticking(&self) -> bool {
        self.inner
            .ticker
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop the tick task until the next enqueue or registration. Queued
    /// state is kept and `tick` still works.
    pub fn shutdown(&self) {
        if let Some(handle) = self.inner.ticker.lock().take() {
            handle.abort();
            tracing::info!(channel = %self.inner.name, "Channel tick stopped");
        }
    }

    fn ensure_ticker(&self) {
        let mut ticker = self.inner.ticker.lock();
        if ticker.is_some() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let weak: Weak<ChannelInner> = Arc::downgrade(&self.inner);
        *ticker = Some(runtime.spawn(async move {
            let mut interval = time::interval(TICK_INTERVAL);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                Channel { inner }.tick();
            }
        }));
        tracing::debug!(channel = %self.inner.name, "Channel tick started");
    }

    fn flush(&self) {
        loop {
            if self.inner.flushing.swap(true, Ordering::AcqRel) {
                // an outer frame is already draining
                return;
            }
            {
                let _guard = FlushGuard(&self.inner.flushing);
                loop {
                    let next = self.inner.engine.lock().pop_delivery();
                    let Some(delivery) = next else {
                        break;
                    };
                    self.inner.handler.deliver(self, delivery);
                }
            }

            if !self.inner.engine.lock().has_pending_deliveries() {
                return;
            }
        }
    }
}
