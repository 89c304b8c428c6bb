// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Connection
//!
//! This module owns the single physical connection to the broker. The
//! connection is dialed with retry, shared by reference with every producer
//! and consumer built from it, and closed explicitly by its owner.
//!
//! Channel creation is serialized by a guard held only while the channel is
//! being opened; using a channel afterwards never touches the guard.

use crate::{
    channel::{AmqpChannel, AmqpConnection, LapinTransport, Transport},
    config::RabbitMQConfigs,
    errors::AmqpError,
    failure::{self, FailureSignal},
    retry::{retry, RetryPolicy},
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// The physical connection shared by producers and consumers.
pub struct BrokerConnection {
    endpoint: String,
    handle: Box<dyn AmqpConnection>,
    pub(crate) creation_lock: Mutex<()>,
    policy: RetryPolicy,
    cancel: CancellationToken,
    closed: AtomicBool,
    failure: FailureSignal,
}

impl BrokerConnection {
    /// Starts configuring a connection to `endpoint`.
    ///
    /// # Parameters
    /// * `endpoint` - AMQP URI of the broker, credentials included
    ///
    /// # Returns
    /// A builder using `lapin`, the default retry policy and a fresh
    /// cancellation token
    pub fn builder(endpoint: &str) -> ConnectionBuilder {
        ConnectionBuilder {
            endpoint: endpoint.to_owned(),
            transport: None,
            policy: RetryPolicy::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Dials the broker described by `cfg` with `lapin`.
    pub async fn connect(cfg: &RabbitMQConfigs) -> Result<Arc<BrokerConnection>, AmqpError> {
        BrokerConnection::builder(&cfg.uri())
            .transport(Arc::new(
                LapinTransport::new().with_connection_name(&cfg.connection_name),
            ))
            .retry_policy(cfg.retry_policy())
            .connect()
            .await
    }

    /// The URI this connection was dialed with, credentials included.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Policy used by producers and consumers built from this connection.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Token cancelled by `close`; every setup retry loop observes it.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fires when the connection dies unexpectedly.
    pub fn failure_signal(&self) -> FailureSignal {
        self.failure.clone()
    }

    /// Whether `close` was called. A cancelled token alone does not close
    /// the physical connection.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Opens a new channel.
    ///
    /// Concurrent callers are serialized for the duration of the call only.
    /// Failures are returned as is; retrying belongs to the caller.
    pub async fn new_channel(&self) -> Result<Box<dyn AmqpChannel>, AmqpError> {
        if self.is_closed() || self.cancel.is_cancelled() {
            return Err(AmqpError::ChannelError("connection closed".to_owned()));
        }

        let _guard = self.creation_lock.lock().await;
        self.handle.create_channel().await
    }

    /// Stops every retry loop derived from this connection and closes it.
    ///
    /// A graceful close never fires a failure signal.
    pub async fn close(&self) -> Result<(), AmqpError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.cancel.cancel();
        let _guard = self.creation_lock.lock().await;
        self.handle.close().await?;
        info!(endpoint = redact(&self.endpoint), "amqp connection closed");
        Ok(())
    }
}

/// Configures and dials a `BrokerConnection`.
pub struct ConnectionBuilder {
    endpoint: String,
    transport: Option<Arc<dyn Transport>>,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl ConnectionBuilder {
    /// Transport used to dial; `lapin` when not set.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Policy for the dial and for every channel setup on the connection.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Links the connection to an outer token, e.g. the process shutdown.
    pub fn cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Dials until the broker accepts the connection.
    ///
    /// Dial failures are logged and retried per the retry policy; with the
    /// default policy that is every 15 seconds, forever.
    pub async fn connect(self) -> Result<Arc<BrokerConnection>, AmqpError> {
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(LapinTransport::new()) as Arc<dyn Transport>);
        let endpoint = self.endpoint;

        debug!(endpoint = redact(&endpoint), "dialing broker...");
        let handle = retry(&self.policy, &self.cancel, "dial broker", || {
            let transport = transport.clone();
            let endpoint = endpoint.clone();
            async move {
                transport.dial(&endpoint).await.inspect_err(|err| {
                    error!(
                        error = err.to_string(),
                        endpoint = redact(&endpoint),
                        "amqp client dial error"
                    );
                })
            }
        })
        .await?;

        let (notifier, failure) = failure::channel();
        handle.on_failure(notifier);

        info!(endpoint = redact(&endpoint), "amqp client connected");

        Ok(Arc::new(BrokerConnection {
            endpoint,
            handle,
            creation_lock: Mutex::new(()),
            policy: self.policy,
            cancel: self.cancel,
            closed: AtomicBool::new(false),
            failure,
        }))
    }
}

/// Endpoint without its credentials, for logs.
fn redact(endpoint: &str) -> String {
    match (endpoint.find("://"), endpoint.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => {
            format!("{}***{}", &endpoint[..scheme + 3], &endpoint[at..])
        }
        _ => endpoint.to_owned(),
    }
}
