// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Producer
//!
//! This module provides the send side of the client. A `Producer` owns one
//! channel over the shared connection, declares its exchange when it is
//! built, and publishes marshaled payloads to the routing keys of its
//! topology or to an explicit key.
//!
//! Publishing uses neither the mandatory nor the immediate flag: a message no
//! queue is bound for is dropped by the broker.

use crate::{
    channel::AmqpChannel,
    connection::BrokerConnection,
    errors::AmqpError,
    failure::{self, FailureSignal},
    message::{JsonMarshaler, Marshaler, PublishProperties},
    retry::retry,
    topology::{AmqpTopology, Topology},
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, info_span, Instrument};

/// Send-side channel bound to one exchange.
pub struct Producer<M = JsonMarshaler> {
    connection: Arc<BrokerConnection>,
    topology: Topology,
    channel: Box<dyn AmqpChannel>,
    failure: FailureSignal,
    marshaler: M,
}

impl Producer<JsonMarshaler> {
    /// Builds a producer publishing JSON payloads.
    ///
    /// Blocks until the exchange is declared; failed attempts are logged and
    /// retried per the connection retry policy.
    pub async fn new(
        connection: Arc<BrokerConnection>,
        topology: Topology,
    ) -> Result<Self, AmqpError> {
        Producer::with_marshaler(connection, topology, JsonMarshaler).await
    }
}

impl<M: Marshaler> Producer<M> {
    /// Builds a producer publishing payloads encoded by `marshaler`.
    ///
    /// # Parameters
    /// * `connection` - The shared broker connection
    /// * `topology` - Exchange and routing keys of the producer
    /// * `marshaler` - Encoder of every published payload
    ///
    /// # Returns
    /// A ready producer, or the error that stopped the setup retries
    pub async fn with_marshaler(
        connection: Arc<BrokerConnection>,
        topology: Topology,
        marshaler: M,
    ) -> Result<Self, AmqpError> {
        topology.validate()?;

        let (channel, failure) = retry(
            connection.retry_policy(),
            connection.cancellation(),
            "open producer channel",
            || setup(&connection, &topology),
        )
        .instrument(info_span!("producer", exchange = topology.exchange_name()))
        .await
        .inspect_err(|err| {
            error!(
                error = err.to_string(),
                exchange = topology.exchange_name(),
                "failure to open producer channel"
            );
        })?;

        info!(
            kind = %topology.kind(),
            exchange = topology.exchange_name(),
            queue = topology.queue_name(),
            keys = ?topology.routing_keys(),
            "producer ready"
        );

        Ok(Producer {
            connection,
            topology,
            channel,
            failure,
            marshaler,
        })
    }

    /// Publishes `payload` once per routing key of the topology.
    ///
    /// The payload is marshaled once; a marshal failure means no write at
    /// all. Keys are written in order and the first failing write is
    /// returned: keys before it have already been sent.
    pub async fn publish<T>(&mut self, payload: &T) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let body = self.marshal(payload)?;

        let Producer {
            topology,
            channel,
            marshaler,
            ..
        } = self;
        for key in topology.routing_keys() {
            write(
                &mut **channel,
                topology.exchange_name(),
                key,
                &body,
                marshaler.content_type(),
            )
            .await?;
        }

        Ok(())
    }

    /// Publishes `payload` to exactly `key`, ignoring the topology keys.
    pub async fn publish_to_key<T>(&mut self, key: &str, payload: &T) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let body = self.marshal(payload)?;
        write(
            self.channel.as_mut(),
            self.topology.exchange_name(),
            key,
            &body,
            self.marshaler.content_type(),
        )
        .await
    }

    /// The topology this producer was built with.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn connection(&self) -> &Arc<BrokerConnection> {
        &self.connection
    }

    /// Fires when this producer's channel or its connection dies.
    pub fn failure_signal(&self) -> FailureSignal {
        self.failure.clone()
    }

    /// Closes the channel; the failure signal does not fire.
    pub async fn close(mut self) -> Result<(), AmqpError> {
        self.channel.close().await
    }

    fn marshal<T>(&self, payload: &T) -> Result<Vec<u8>, AmqpError>
    where
        T: Serialize + ?Sized,
    {
        self.marshaler.marshal(payload).inspect_err(|err| {
            error!(
                error = err.to_string(),
                exchange = self.topology.exchange_name(),
                "failure to marshal payload"
            );
        })
    }
}

async fn write(
    channel: &mut dyn AmqpChannel,
    exchange: &str,
    key: &str,
    body: &[u8],
    content_type: &str,
) -> Result<(), AmqpError> {
    let properties = PublishProperties::new(content_type);

    channel
        .basic_publish(exchange, key, body, &properties)
        .await
        .inspect_err(|err| {
            error!(
                error = err.to_string(),
                exchange, key, "failure to publish"
            );
        })
}

/// One setup attempt: a fresh channel and the exchange declaration. The
/// channel is dropped when the declaration fails.
async fn setup(
    connection: &BrokerConnection,
    topology: &Topology,
) -> Result<(Box<dyn AmqpChannel>, FailureSignal), AmqpError> {
    let mut channel = connection.new_channel().await?;
    AmqpTopology::new(channel.as_mut(), topology)
        .install_exchange()
        .await?;

    let (notifier, failure) = failure::channel();
    channel.on_failure(notifier);

    Ok((channel, failure.with_parent(&connection.failure_signal())))
}
