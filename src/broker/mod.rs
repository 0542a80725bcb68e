//! Per-channel queue delivery.
//!
//! A [`Broker`] owns one [`Channel`] per configured `endpoint/version`. Each
//! channel wraps a [`QueueEngine`]: a primary FIFO feeding subscribers within
//! a prefetch window, an ack table with timeout-driven resends, a delayed
//! requeue list and a bounded per-key overflow store for messages nobody is
//! subscribed to yet. The broker gates sends and subscriptions through the
//! [`RulesEngine`].

pub mod channel;
pub mod engine;
pub mod envelope;
pub mod secondary;
pub mod tree;

pub use channel::{Channel, DeliveryHandler, ForwardingHandler};
pub use engine::{ChannelStatistics, EngineSnapshot, QueueEngine, ResendOutcome, TickReport};
pub use envelope::{address, Delivery, Envelope, Headers, SubscriberKind, WILDCARD};
pub use secondary::{SecondaryStats, SecondaryStore};
pub use tree::{DispatchTree, CONSUMER_GROUP};

use crate::config::{channel_name, Config, QueueConfig, RuleConfig};
use crate::observability::{create_counter_sink, CounterSink};
use crate::security::{Access, RulesEngine};
use crate::validation::ValidationErrors;
use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors returned by [`Broker`] entry points.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BrokerError {
    #[error("field `{field}` must not be empty")]
    EmptyField { field: &'static str },
    #[error("unknown channel `{channel}`")]
    UnknownChannel { channel: String },
    #[error("client `{client}` has no {access} access to `{path}`")]
    AccessDenied {
        client: String,
        path: String,
        access: Access,
    },
    #[error("subscription on `{channel}` names no ids")]
    NoIds { channel: String },
    #[error(transparent)]
    Validation(#[from] ValidationErrors),
}

fn require_non_empty(value: &str, field: &'static str) -> Result<(), BrokerError> {
    if value.trim().is_empty() {
        return Err(BrokerError::EmptyField { field });
    }
    Ok(())
}

/// Registry of channels built from configuration.
pub struct Broker {
    channels: BTreeMap<String, Channel>,
    rules: Arc<RulesEngine>,
    counters: Arc<dyn CounterSink>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("channels", &self.channels.keys().collect::<Vec<_>>())
            .field("rules", &self.rules)
            .finish_non_exhaustive()
    }
}

impl Broker {
    /// Build every channel of `config` with the counter sink it selects.
    pub fn from_config(config: &Config, handler: Arc<dyn DeliveryHandler>) -> Result<Self> {
        Self::with_counters(config, create_counter_sink(&config.observability), handler)
    }

    pub fn with_counters(
        config: &Config,
        counters: Arc<dyn CounterSink>,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<Self> {
        config.validate()?;
        let rules = RulesEngine::new(&config.rules).context("Failed to build access rules")?;

        let channels: BTreeMap<String, Channel> = config
            .channels
            .iter()
            .map(|channel| {
                (
                    channel.name(),
                    Channel::new(channel, counters.clone(), handler.clone()),
                )
            })
            .collect();

        tracing::info!(
            channels = channels.len(),
            rules = config.rules.len(),
            backend = %config.observability.backend,
            "Broker ready"
        );
        Ok(Self {
            channels,
            rules: Arc::new(rules),
            counters,
        })
    }

    pub fn channel(&self, endpoint: &str, version: &str) -> Result<&Channel, BrokerError> {
        let name = channel_name(endpoint, version);
        self.channels
            .get(&name)
            .ok_or(BrokerError::UnknownChannel { channel: name })
    }

    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    pub fn rules(&self) -> &Arc<RulesEngine> {
        &self.rules
    }

    pub fn counters(&self) -> &Arc<dyn CounterSink> {
        &self.counters
    }

    fn authorize(
        &self,
        client: &str,
        path: [&str; 3],
        access: Access,
    ) -> Result<(), BrokerError> {
        if self.rules.is_allowed(client, path, access) {
            return Ok(());
        }
        Err(BrokerError::AccessDenied {
            client: client.to_string(),
            path: path.join("/"),
            access,
        })
    }

    /// Enqueue `item` on `endpoint/version` under correlation key `id`.
    pub fn send(
        &self,
        client: &str,
        endpoint: &str,
        version: &str,
        id: &str,
        item: Value,
        message_id: Option<String>,
    ) -> Result<String, BrokerError> {
        require_non_empty(client, "client")?;
        require_non_empty(id, "id")?;
        let channel = self.channel(endpoint, version)?;
        self.authorize(client, [endpoint, version, id], Access::Write)?;
        Ok(channel.add_in_queue(id, item, message_id)?)
    }

    /// Register `client#node` on `ids`. Every id must pass the read check.
    /// Returns the number of replayed overflow messages.
    pub fn subscribe(
        &self,
        client: &str,
        node: &str,
        endpoint: &str,
        version: &str,
        ids: &[String],
        kind: SubscriberKind,
    ) -> Result<usize, BrokerError> {
        require_non_empty(client, "client")?;
        require_non_empty(node, "node")?;
        let channel = self.channel(endpoint, version)?;
        if ids.is_empty() {
            return Err(BrokerError::NoIds {
                channel: channel.name().to_string(),
            });
        }
        for id in ids {
            require_non_empty(id, "id")?;
            self.authorize(client, [endpoint, version, id], Access::Read)?;
        }
        Ok(channel.add_client(ids, client, node, kind))
    }

    pub fn unsubscribe(
        &self,
        client: &str,
        node: &str,
        endpoint: &str,
        version: &str,
        ids: Option<&[String]>,
        kind: SubscriberKind,
    ) -> Result<usize, BrokerError> {
        Ok(self
            .channel(endpoint, version)?
            .remove_client(ids, client, node, kind))
    }

    /// Drop every registration of `client#node` across all channels.
    pub fn disconnect(&self, client: &str, node: &str) -> usize {
        let removed: usize = self
            .channels
            .values()
            .map(|channel| {
                channel.remove_client(None, client, node, SubscriberKind::Consume)
                    + channel.remove_client(None, client, node, SubscriberKind::Listen)
            })
            .sum();
        if removed > 0 {
            tracing::info!(client, node, removed, "Client disconnected");
        }
        removed
    }

    pub fn ack(&self, endpoint: &str, version: &str, message_id: &str) -> Result<bool, BrokerError> {
        Ok(self.channel(endpoint, version)?.ack(message_id))
    }

    pub fn nack(
        &self,
        endpoint: &str,
        version: &str,
        message_id: &str,
        delay_secs: u64,
    ) -> Result<Option<ResendOutcome>, BrokerError> {
        Ok(self.channel(endpoint, version)?.nack(message_id, delay_secs))
    }

    pub fn reload_queue(&self, endpoint: &str, version: &str, queue: QueueConfig) -> Result<()> {
        self.channel(endpoint, version)?.reload(queue)
    }

    pub fn reload_rules(&self, rules: &[RuleConfig]) -> Result<()> {
        self.rules.reload(rules)
    }

    /// Run one timer step on every channel at an explicit time.
    pub fn tick_at(&self, now: u64) -> BTreeMap<String, TickReport> {
        self.channels
            .iter()
            .map(|(name, channel)| (name.clone(), channel.tick_at(now)))
            .collect()
    }

    pub fn statistics(&self) -> BTreeMap<String, ChannelStatistics> {
        self.channels
            .iter()
            .map(|(name, channel)| (name.clone(), channel.statistics()))
            .collect()
    }

    /// Stop every channel's tick task.
    pub fn shutdown(&self) {
        for channel in self.channels.values() {
            channel.shutdown();
        }
    }
}
