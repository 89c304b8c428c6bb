// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! This module provides the topology descriptor handed to producers and
//! consumers, and the installer that declares it over a channel.
//!
//! The main components are:
//! - `Topology`: immutable description of one exchange, its queue and the
//!   routing keys binding them
//! - `TopologyBuilder`: validated construction of a `Topology`
//! - `AmqpTopology`: declares the exchange, the queue and the bindings

use crate::{
    channel::AmqpChannel,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
};
use serde::Deserialize;
use tracing::debug;

/// Immutable exchange/queue/binding configuration.
///
/// Deserializes from the field names used by service configuration files:
/// `type`, `exchange`, `queue`, `key` and `durable`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Topology {
    #[serde(rename = "type", default)]
    kind: ExchangeKind,
    #[serde(rename = "exchange")]
    exchange_name: String,
    #[serde(rename = "queue", default)]
    queue_name: String,
    #[serde(rename = "key", default)]
    routing_keys: Vec<String>,
    #[serde(default)]
    durable: bool,
}

impl Topology {
    /// Starts a topology for `exchange`.
    ///
    /// # Parameters
    /// * `exchange` - The name of the exchange to declare
    ///
    /// # Returns
    /// A builder for a non-durable direct exchange with no queue and no keys
    pub fn builder(exchange: &str) -> TopologyBuilder {
        TopologyBuilder {
            topology: Topology {
                exchange_name: exchange.to_owned(),
                ..Default::default()
            },
        }
    }

    pub fn kind(&self) -> ExchangeKind {
        self.kind
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    /// The queue a consumer declares; empty lets the broker name it.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Keys a producer publishes to and a consumer binds with, in order.
    pub fn routing_keys(&self) -> &[String] {
        &self.routing_keys
    }

    /// Whether the exchange and the queue survive a broker restart.
    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// Checks the invariants every producer relies on.
    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.exchange_name.trim().is_empty() {
            return Err(AmqpError::InvalidTopology(
                "exchange name must not be empty".to_owned(),
            ));
        }

        Ok(())
    }

    /// Checks the invariants of a consuming topology: at least one binding
    /// must exist before consumption begins.
    pub fn validate_for_consumer(&self) -> Result<(), AmqpError> {
        self.validate()?;

        if self.routing_keys.is_empty() {
            return Err(AmqpError::InvalidTopology(format!(
                "queue `{}` needs at least one routing key",
                self.queue_name
            )));
        }

        Ok(())
    }

    /// Exchange declaration: never auto-deleted, never internal.
    pub fn exchange_definition(&self) -> ExchangeDefinition {
        let def = ExchangeDefinition::new(&self.exchange_name).kind(self.kind);
        if self.durable {
            def.durable()
        } else {
            def
        }
    }

    /// Queue declaration: deleted once unused, shared between connections.
    pub fn queue_definition(&self) -> QueueDefinition {
        let def = QueueDefinition::new(&self.queue_name).delete();
        if self.durable {
            def.durable()
        } else {
            def
        }
    }

    /// One binding per routing key, in declaration order.
    pub fn queue_bindings(&self, queue: &str) -> Vec<QueueBinding> {
        self.routing_keys
            .iter()
            .map(|key| {
                QueueBinding::new(queue)
                    .exchange(&self.exchange_name)
                    .routing_key(key)
            })
            .collect()
    }
}

/// Builder of a validated `Topology`.
#[derive(Debug, Clone)]
pub struct TopologyBuilder {
    topology: Topology,
}

impl TopologyBuilder {
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.topology.kind = kind;
        self
    }

    pub fn queue(mut self, name: &str) -> Self {
        self.topology.queue_name = name.to_owned();
        self
    }

    /// Appends one routing key.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn routing_key(mut self, key: &str) -> Self {
        self.topology.routing_keys.push(key.to_owned());
        self
    }

    pub fn routing_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topology
            .routing_keys
            .extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn durable(mut self) -> Self {
        self.topology.durable = true;
        self
    }

    /// Validates and returns the topology.
    ///
    /// # Returns
    /// The topology, or `AmqpError::InvalidTopology` for an empty exchange
    /// name
    pub fn build(self) -> Result<Topology, AmqpError> {
        self.topology.validate()?;
        Ok(self.topology)
    }
}

/// Declares a topology over one channel.
///
/// Each step stops at the first failure; the caller discards the channel and
/// starts over from the exchange.
pub(crate) struct AmqpTopology<'tp> {
    channel: &'tp mut dyn AmqpChannel,
    topology: &'tp Topology,
}

impl<'tp> AmqpTopology<'tp> {
    pub(crate) fn new(channel: &'tp mut dyn AmqpChannel, topology: &'tp Topology) -> Self {
        AmqpTopology { channel, topology }
    }

    /// Declares the exchange, the queue and every binding.
    ///
    /// # Returns
    /// The queue name as known by the broker
    pub(crate) async fn install(&mut self) -> Result<String, AmqpError> {
        self.install_exchange().await?;
        let queue = self.install_queue().await?;
        self.binding_queue(&queue).await?;
        Ok(queue)
    }

    pub(crate) async fn install_exchange(&mut self) -> Result<(), AmqpError> {
        let def = self.topology.exchange_definition();
        self.channel.exchange_declare(&def).await?;
        debug!(
            "exchange: {} ({}) was created",
            def.name(),
            def.exchange_kind()
        );
        Ok(())
    }

    async fn install_queue(&mut self) -> Result<String, AmqpError> {
        let def = self.topology.queue_definition();
        let name = self.channel.queue_declare(&def).await?;
        debug!("queue: {} was created", name);
        Ok(name)
    }

    async fn binding_queue(&mut self, queue: &str) -> Result<(), AmqpError> {
        for binding in self.topology.queue_bindings(queue) {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name(),
                binding.exchange_name(),
                binding.key()
            );
            self.channel.queue_bind(&binding).await?;
        }

        debug!("queue was bounded");
        Ok(())
    }
}
