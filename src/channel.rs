// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! This module defines the seam between the client and the broker protocol.
//! A `Transport` dials the broker and yields an `AmqpConnection`; the
//! connection hands out `AmqpChannel`s, each owned by exactly one producer or
//! consumer. Every channel operation takes `&mut self`, so one channel cannot
//! be driven from two call sites at once.
//!
//! The production implementation is backed by `lapin`.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    failure::FailureNotifier,
    message::{Message, PublishProperties},
    queue::{ConsumeOptions, QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    message::Delivery,
    options::{
        BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::collections::BTreeMap;
use tracing::{debug, error};

#[cfg(test)]
use mockall::automock;

/// Reply code sent to the broker on a graceful close.
const REPLY_SUCCESS: u16 = 200;

/// Inbound deliveries of a consumer registration.
pub type Deliveries = BoxStream<'static, Result<Message, AmqpError>>;

/// Dials the broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn dial(&self, endpoint: &str) -> Result<Box<dyn AmqpConnection>, AmqpError>;
}

/// The single physical connection to the broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Box<dyn AmqpChannel>, AmqpError>;

    /// Closes the connection without firing any failure signal.
    async fn close(&self) -> Result<(), AmqpError>;

    /// Registers the notifier fired when the connection dies unexpectedly.
    fn on_failure(&self, notifier: FailureNotifier);
}

/// A logical channel multiplexed over the connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AmqpChannel: Send {
    async fn exchange_declare(&mut self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Declares the queue and returns its name as known by the broker.
    async fn queue_declare(&mut self, def: &QueueDefinition) -> Result<String, AmqpError>;

    async fn queue_bind(&mut self, binding: &QueueBinding) -> Result<(), AmqpError>;

    async fn basic_consume(
        &mut self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<Deliveries, AmqpError>;

    /// Publishes without the mandatory and immediate flags: unroutable
    /// messages are dropped by the broker.
    async fn basic_publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> Result<(), AmqpError>;

    /// Closes the channel without firing its failure signal.
    async fn close(&mut self) -> Result<(), AmqpError>;

    /// Registers the notifier fired when the channel dies unexpectedly.
    fn on_failure(&self, notifier: FailureNotifier);
}

/// Dials RabbitMQ with `lapin`.
#[derive(Debug, Clone, Default)]
pub struct LapinTransport {
    connection_name: Option<String>,
}

impl LapinTransport {
    pub fn new() -> Self {
        LapinTransport::default()
    }

    /// Name shown for the connection in the broker management tools.
    pub fn with_connection_name(mut self, name: &str) -> Self {
        self.connection_name = Some(name.to_owned());
        self
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn dial(&self, endpoint: &str) -> Result<Box<dyn AmqpConnection>, AmqpError> {
        debug!("creating amqp connection...");
        let mut options = ConnectionProperties::default();
        if let Some(name) = &self.connection_name {
            options = options.with_connection_name(LongString::from(name.clone()));
        }

        match Connection::connect(endpoint, options).await {
            Ok(conn) => {
                debug!("amqp connected");
                Ok(Box::new(LapinConnection { conn }))
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::DialError(err.to_string()))
            }
        }
    }
}

struct LapinConnection {
    conn: Connection,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Box<dyn AmqpChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!(id = channel.id(), "channel created");
                Ok(Box::new(LapinChannel { channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.conn
            .close(REPLY_SUCCESS, "closed by client")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to close the connection");
                close_error(err)
            })
    }

    fn on_failure(&self, notifier: FailureNotifier) {
        self.conn.on_error(move |err| {
            notifier.notify(AmqpError::UnexpectedClose(err.to_string()));
        });
    }
}

struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn exchange_declare(&mut self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        self.channel
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the exchange"
                );
                AmqpError::DeclareExchangeError(def.name.clone())
            })
    }

    async fn queue_declare(&mut self, def: &QueueDefinition) -> Result<String, AmqpError> {
        debug!("creating queue: {}", def.name);

        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Ok(queue) => Ok(queue.name().to_string()),
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the queue"
                );
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
        }
    }

    async fn queue_bind(&mut self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                    binding.routing_key.clone(),
                )
            })
    }

    async fn basic_consume(
        &mut self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<Deliveries, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &options.consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: options.auto_ack,
                    exclusive: options.exclusive,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::BindingConsumerError(queue.to_owned())
            })?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(delivery_message(delivery)),
                Err(err) => Err(AmqpError::UnexpectedClose(err.to_string())),
            })
            .boxed())
    }

    async fn basic_publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> Result<(), AmqpError> {
        let headers = properties
            .headers
            .iter()
            .map(|(key, value)| {
                (
                    ShortString::from(key.clone()),
                    AMQPValue::LongString(LongString::from(value.clone())),
                )
            })
            .collect::<BTreeMap<_, _>>();

        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                BasicProperties::default()
                    .with_content_type(ShortString::from(properties.content_type.clone()))
                    .with_message_id(ShortString::from(properties.message_id.clone()))
                    .with_headers(FieldTable::from(headers)),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn close(&mut self) -> Result<(), AmqpError> {
        self.channel
            .close(REPLY_SUCCESS, "closed by client")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to close the channel");
                close_error(err)
            })
    }

    fn on_failure(&self, notifier: FailureNotifier) {
        self.channel.on_error(move |err| {
            notifier.notify(AmqpError::UnexpectedClose(err.to_string()));
        });
    }
}

fn close_error(err: lapin::Error) -> AmqpError {
    AmqpError::CloseError(err.to_string())
}

/// Converts a lapin delivery into the client message model. Only string
/// headers are kept.
fn delivery_message(delivery: Delivery) -> Message {
    let mut msg = Message::new(
        delivery.exchange.as_str(),
        delivery.routing_key.as_str(),
        delivery.data,
    );
    apply_properties(&mut msg, &delivery.properties);
    msg
}

fn apply_properties(msg: &mut Message, props: &BasicProperties) {
    msg.content_type = props.content_type().as_ref().map(ToString::to_string);
    msg.message_id = props.message_id().as_ref().map(ToString::to_string);

    if let Some(table) = props.headers() {
        msg.headers = table
            .inner()
            .iter()
            .filter_map(|(key, value)| header_string(value).map(|v| (key.to_string(), v)))
            .collect();
    }
}

fn header_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(v) => std::str::from_utf8(v.as_bytes()).ok().map(str::to_owned),
        AMQPValue::ShortString(v) => Some(v.to_string()),
        _ => None,
    }
}
