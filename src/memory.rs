// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker used by the unit tests.
//!
//! Routes like RabbitMQ for direct, topic and fanout exchanges, records every
//! declaration and write, and lets a test inject dial, declaration, publish
//! and close failures.

use crate::{
    channel::{AmqpChannel, AmqpConnection, Deliveries, Transport},
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    failure::FailureNotifier,
    message::{Message, PublishProperties},
    queue::{ConsumeOptions, QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::sync::mpsc;

type Inbox = mpsc::UnboundedSender<Result<Message, AmqpError>>;

#[derive(Default)]
struct Queue {
    bindings: Vec<(String, String)>,
    backlog: Vec<Message>,
    consumers: Vec<Inbox>,
}

#[derive(Default)]
struct State {
    dial_rejections: u32,
    dial_attempts: u32,
    creation_delay: Option<Duration>,
    creating: u32,
    max_creating: u32,
    channels_created: u32,
    exchange_failures: u32,
    bind_failures: HashMap<String, u32>,
    publish_failures: HashMap<String, u32>,
    exchanges: HashMap<String, ExchangeKind>,
    exchange_declarations: Vec<ExchangeDefinition>,
    queue_declarations: Vec<QueueDefinition>,
    consume_registrations: Vec<ConsumeOptions>,
    queues: HashMap<String, Queue>,
    published: Vec<(String, String, Vec<u8>)>,
    generated_queues: u32,
    connection_notifiers: Vec<FailureNotifier>,
    channel_notifiers: Vec<FailureNotifier>,
}

#[derive(Clone, Default)]
pub(crate) struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    pub(crate) fn new() -> Self {
        MemoryBroker::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    pub(crate) fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(MemoryTransport {
            state: self.state.clone(),
        })
    }

    pub(crate) fn reject_dials(&self, times: u32) {
        self.state().dial_rejections = times;
    }

    pub(crate) fn slow_channel_creation(&self, delay: Duration) {
        self.state().creation_delay = Some(delay);
    }

    pub(crate) fn fail_exchange_declarations(&self, times: u32) {
        self.state().exchange_failures = times;
    }

    pub(crate) fn fail_bindings(&self, key: &str, times: u32) {
        self.state().bind_failures.insert(key.to_owned(), times);
    }

    pub(crate) fn fail_publishes(&self, key: &str, times: u32) {
        self.state().publish_failures.insert(key.to_owned(), times);
    }

    pub(crate) fn dial_attempts(&self) -> u32 {
        self.state().dial_attempts
    }

    pub(crate) fn channels_created(&self) -> u32 {
        self.state().channels_created
    }

    pub(crate) fn max_concurrent_channel_creations(&self) -> u32 {
        self.state().max_creating
    }

    pub(crate) fn exchange_declarations(&self) -> Vec<ExchangeDefinition> {
        self.state().exchange_declarations.clone()
    }

    pub(crate) fn queue_declarations(&self) -> Vec<QueueDefinition> {
        self.state().queue_declarations.clone()
    }

    pub(crate) fn consume_registrations(&self) -> Vec<ConsumeOptions> {
        self.state().consume_registrations.clone()
    }

    /// Routing keys bound to `queue`, in binding order.
    pub(crate) fn bindings(&self, queue: &str) -> Vec<String> {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.bindings.iter().map(|(_, key)| key.clone()).collect())
            .unwrap_or_default()
    }

    /// Every accepted write as `(exchange, routing key, body)`.
    pub(crate) fn published(&self) -> Vec<(String, String, Vec<u8>)> {
        self.state().published.clone()
    }

    /// Broker-initiated close of every open channel.
    pub(crate) fn close_channels(&self, reason: &str) {
        let mut state = self.state();
        for notifier in state.channel_notifiers.drain(..) {
            notifier.notify(AmqpError::UnexpectedClose(reason.to_owned()));
        }
        for queue in state.queues.values_mut() {
            queue.consumers.clear();
        }
    }

    /// Delivery sources report an error, then stop.
    pub(crate) fn break_consumers(&self, reason: &str) {
        let mut state = self.state();
        for queue in state.queues.values_mut() {
            for inbox in queue.consumers.drain(..) {
                let _ = inbox.send(Err(AmqpError::UnexpectedClose(reason.to_owned())));
            }
        }
    }

    /// Network failure of the physical connection.
    pub(crate) fn sever_connection(&self, reason: &str) {
        let mut state = self.state();
        for notifier in state.connection_notifiers.drain(..) {
            notifier.notify(AmqpError::UnexpectedClose(reason.to_owned()));
        }
        for queue in state.queues.values_mut() {
            queue.consumers.clear();
        }
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn take_failure(failures: &mut HashMap<String, u32>, key: &str) -> bool {
    match failures.get_mut(key) {
        Some(remaining) if *remaining > 0 => {
            *remaining -= 1;
            true
        }
        _ => false,
    }
}

/// Topic pattern matching: `*` is exactly one word, `#` zero or more.
fn topic_matches(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.split_first(), key.split_first()) {
        (None, None) => true,
        (Some((&"#", rest)), _) => {
            topic_matches(rest, key) || (!key.is_empty() && topic_matches(pattern, &key[1..]))
        }
        (Some((&"*", rest)), Some((_, key_rest))) => topic_matches(rest, key_rest),
        (Some((word, rest)), Some((k, key_rest))) => word == k && topic_matches(rest, key_rest),
        _ => false,
    }
}

fn routes(kind: ExchangeKind, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Direct => binding_key == routing_key,
        ExchangeKind::Topic => {
            let pattern: Vec<&str> = binding_key.split('.').collect();
            let key: Vec<&str> = routing_key.split('.').collect();
            topic_matches(&pattern, &key)
        }
        ExchangeKind::Fanout | ExchangeKind::Headers => true,
    }
}

struct MemoryTransport {
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn dial(&self, _endpoint: &str) -> Result<Box<dyn AmqpConnection>, AmqpError> {
        let mut state = lock(&self.state);
        state.dial_attempts += 1;

        if state.dial_rejections > 0 {
            state.dial_rejections -= 1;
            return Err(AmqpError::DialError("connection refused".to_owned()));
        }

        Ok(Box::new(MemoryConnection {
            state: self.state.clone(),
        }))
    }
}

struct MemoryConnection {
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl AmqpConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Box<dyn AmqpChannel>, AmqpError> {
        let delay = {
            let mut state = lock(&self.state);
            state.creating += 1;
            state.max_creating = state.max_creating.max(state.creating);
            state.creation_delay
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.state);
        state.creating -= 1;
        state.channels_created += 1;

        Ok(Box::new(MemoryChannel {
            state: self.state.clone(),
        }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut state = lock(&self.state);
        state.connection_notifiers.clear();
        state.channel_notifiers.clear();
        for queue in state.queues.values_mut() {
            queue.consumers.clear();
        }
        Ok(())
    }

    fn on_failure(&self, notifier: FailureNotifier) {
        lock(&self.state).connection_notifiers.push(notifier);
    }
}

struct MemoryChannel {
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl AmqpChannel for MemoryChannel {
    async fn exchange_declare(&mut self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = lock(&self.state);
        state.exchange_declarations.push(def.clone());

        if state.exchange_failures > 0 {
            state.exchange_failures -= 1;
            return Err(AmqpError::DeclareExchangeError(def.name.clone()));
        }

        state.exchanges.insert(def.name.clone(), def.kind);
        Ok(())
    }

    async fn queue_declare(&mut self, def: &QueueDefinition) -> Result<String, AmqpError> {
        let mut state = lock(&self.state);
        state.queue_declarations.push(def.clone());

        let name = if def.name.is_empty() {
            state.generated_queues += 1;
            format!("amq.gen-{}", state.generated_queues)
        } else {
            def.name.clone()
        };

        state.queues.entry(name.clone()).or_default();
        Ok(name)
    }

    async fn queue_bind(&mut self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = lock(&self.state);

        if take_failure(&mut state.bind_failures, &binding.routing_key) {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
                binding.routing_key.clone(),
            ));
        }

        let queue = state
            .queues
            .get_mut(&binding.queue_name)
            .ok_or_else(|| AmqpError::DeclareQueueError(binding.queue_name.clone()))?;
        let entry = (binding.exchange_name.clone(), binding.routing_key.clone());
        if !queue.bindings.contains(&entry) {
            queue.bindings.push(entry);
        }
        Ok(())
    }

    async fn basic_consume(
        &mut self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<Deliveries, AmqpError> {
        let mut state = lock(&self.state);
        state.consume_registrations.push(options.clone());

        let target = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| AmqpError::BindingConsumerError(queue.to_owned()))?;

        let (inbox, outbox) = mpsc::unbounded_channel();
        for msg in target.backlog.drain(..) {
            let _ = inbox.send(Ok(msg));
        }
        target.consumers.push(inbox);

        Ok(stream::unfold(outbox, |mut outbox| async move {
            outbox.recv().await.map(|item| (item, outbox))
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
        let mut state = lock(&self.state);

        if take_failure(&mut state.publish_failures, routing_key) {
            return Err(AmqpError::PublishingError("channel write failed".to_owned()));
        }

        let Some(kind) = state.exchanges.get(exchange).copied() else {
            return Err(AmqpError::PublishingError(format!(
                "no exchange `{exchange}`"
            )));
        };

        state
            .published
            .push((exchange.to_owned(), routing_key.to_owned(), payload.to_vec()));

        for queue in state.queues.values_mut() {
            let bound = queue
                .bindings
                .iter()
                .any(|(ex, key)| ex == exchange && routes(kind, key, routing_key));
            if !bound {
                continue;
            }

            let mut msg = Message::new(exchange, routing_key, payload.to_vec());
            msg.content_type = Some(properties.content_type.clone());
            msg.message_id = Some(properties.message_id.clone());
            msg.headers = properties.headers.clone();

            queue.consumers.retain(|inbox| !inbox.is_closed());
            match queue.consumers.first() {
                Some(inbox) => {
                    let _ = inbox.send(Ok(msg));
                }
                None => queue.backlog.push(msg),
            }
        }

        Ok(())
    }

    async fn close(&mut self) -> Result<(), AmqpError> {
        Ok(())
    }

    fn on_failure(&self, notifier: FailureNotifier) {
        lock(&self.state).channel_notifiers.push(notifier);
    }
}

#[tokio::test]
async fn writes_to_unknown_exchanges_are_not_recorded() {
    let broker = MemoryBroker::new();
    let conn = broker.transport().dial("amqp://localhost").await.unwrap();
    let mut channel = conn.create_channel().await.unwrap();
    let props = PublishProperties::new("application/json");

    assert!(matches!(
        channel.basic_publish("missing", "a", b"{}", &props).await,
        Err(AmqpError::PublishingError(_))
    ));
    assert!(broker.published().is_empty());

    channel
        .exchange_declare(&ExchangeDefinition::new("orders"))
        .await
        .unwrap();
    channel.basic_publish("orders", "a", b"{}", &props).await.unwrap();
    assert_eq!(broker.published().len(), 1);
}

#[test]
fn topic_patterns_match_like_rabbitmq() {
    assert!(routes(ExchangeKind::Topic, "order.created", "order.created"));
    assert!(routes(ExchangeKind::Topic, "order.*", "order.created"));
    assert!(routes(ExchangeKind::Topic, "#", "order.created.eu"));
    assert!(routes(ExchangeKind::Topic, "order.#", "order"));
    assert!(!routes(ExchangeKind::Topic, "order.*", "order.created.eu"));
    assert!(!routes(ExchangeKind::Direct, "a", "c"));
    assert!(routes(ExchangeKind::Fanout, "", "anything"));
}
