// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumer
//!
//! This module provides the receive side of the client. Building a
//! `Consumer` is one setup unit: open a channel, declare the exchange, declare
//! the queue, bind every routing key and register for deliveries. A failure
//! at any step throws the channel away and the whole unit is retried from
//! the exchange declaration.
//!
//! Deliveries are auto-acknowledged: the broker considers a message handled
//! as soon as it is handed over, so a processing failure afterwards does not
//! cause a redelivery.

use crate::{
    channel::{AmqpChannel, Deliveries},
    connection::BrokerConnection,
    errors::AmqpError,
    failure::{self, FailureSignal},
    message::Message,
    queue::ConsumeOptions,
    retry::retry,
    topology::{AmqpTopology, Topology},
};
use futures_util::{Stream, StreamExt};
use std::{
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
};
use tracing::{debug, error, info, info_span, Instrument};

/// Receive-side channel bound to one exchange/queue pair.
///
/// The consumer is itself the inbound message stream. The stream ends when
/// the channel closes; a fresh one only comes with a new consumer.
pub struct Consumer {
    connection: Arc<BrokerConnection>,
    topology: Topology,
    queue: String,
    channel: Box<dyn AmqpChannel>,
    deliveries: Deliveries,
    failure: FailureSignal,
    drained: bool,
}

struct Registration {
    queue: String,
    channel: Box<dyn AmqpChannel>,
    deliveries: Deliveries,
    failure: FailureSignal,
}

impl Consumer {
    /// Builds a consumer and registers it for deliveries.
    ///
    /// Blocks until the full setup succeeds; failed attempts are logged and
    /// retried per the connection retry policy.
    pub async fn new(
        connection: Arc<BrokerConnection>,
        topology: Topology,
    ) -> Result<Self, AmqpError> {
        topology.validate_for_consumer()?;

        let registration = retry(
            connection.retry_policy(),
            connection.cancellation(),
            "open consumer channel",
            || setup(&connection, &topology),
        )
        .instrument(info_span!(
            "consumer",
            exchange = topology.exchange_name(),
            queue = topology.queue_name()
        ))
        .await
        .inspect_err(|err| {
            error!(
                error = err.to_string(),
                exchange = topology.exchange_name(),
                queue = topology.queue_name(),
                "failure to open consumer channel"
            );
        })?;

        info!(
            kind = %topology.kind(),
            exchange = topology.exchange_name(),
            queue = registration.queue.as_str(),
            keys = ?topology.routing_keys(),
            durable = topology.is_durable(),
            "consumer ready"
        );

        Ok(Consumer {
            connection,
            topology,
            queue: registration.queue,
            channel: registration.channel,
            deliveries: registration.deliveries,
            failure: registration.failure,
            drained: false,
        })
    }

    /// Waits for the next message; `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<Message> {
        self.next().await
    }

    /// Queue name as declared by the broker, generated when the topology
    /// leaves it empty.
    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// The connection the consumer's channel lives on.
    pub fn connection(&self) -> &Arc<BrokerConnection> {
        &self.connection
    }

    /// Fires when this consumer's channel or its connection dies.
    pub fn failure_signal(&self) -> FailureSignal {
        self.failure.clone()
    }

    /// Closes the channel; the failure signal does not fire.
    pub async fn close(mut self) -> Result<(), AmqpError> {
        self.channel.close().await
    }
}

impl Stream for Consumer {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        if self.drained {
            return Poll::Ready(None);
        }

        match ready!(self.deliveries.poll_next_unpin(cx)) {
            Some(Ok(msg)) => Poll::Ready(Some(msg)),
            Some(Err(err)) => {
                error!(
                    error = err.to_string(),
                    queue = self.queue.as_str(),
                    "delivery stream failed"
                );
                self.drained = true;
                Poll::Ready(None)
            }
            None => {
                debug!(queue = self.queue.as_str(), "delivery stream closed");
                self.drained = true;
                Poll::Ready(None)
            }
        }
    }
}

/// One setup attempt on a fresh channel. Any failing step drops the channel.
async fn setup(
    connection: &BrokerConnection,
    topology: &Topology,
) -> Result<Registration, AmqpError> {
    let mut channel = connection.new_channel().await?;

    let queue = AmqpTopology::new(channel.as_mut(), topology).install().await?;
    let deliveries = channel
        .basic_consume(&queue, &ConsumeOptions::auto_ack())
        .await?;

    let (notifier, failure) = failure::channel();
    channel.on_failure(notifier);

    Ok(Registration {
        queue,
        channel,
        deliveries,
        failure: failure.with_parent(&connection.failure_signal()),
    })
}
