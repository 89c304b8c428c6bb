// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Messaging Client
//!
//! This module provides the error type shared by every part of the client.
//! The `AmqpError` enum covers dialing the broker, creating channels, declaring
//! the topology, encoding and publishing payloads, and the unexpected closes
//! reported through a failure signal.

use thiserror::Error;

/// Represents errors that can occur while talking to the broker.
///
/// Setup errors (dial, channel, declarations) are absorbed by the retry loops
/// of the connection, producer and consumer. Everything else is returned to
/// the caller as is.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the broker
    #[error("failure to connect `{0}`")]
    DialError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange with a routing key
    #[error("failure to binding exchange `{0}` to queue `{1}` with key `{2}`")]
    BindingExchangeToQueueError(String, String, String),

    /// Error registering a consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error marshaling a payload before publishing
    #[error("failure to encode payload `{0}`")]
    EncodeError(String),

    /// Error unmarshaling a received payload
    #[error("failure to decode payload `{0}`")]
    DecodeError(String),

    /// Error publishing a message on an established channel
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// The broker or the network closed a channel or connection
    #[error("unexpected close `{0}`")]
    UnexpectedClose(String),

    /// The topology descriptor breaks one of its invariants
    #[error("invalid topology `{0}`")]
    InvalidTopology(String),

    /// The broker refused or failed a graceful close
    #[error("failure to close `{0}`")]
    CloseError(String),

    /// A retry loop was interrupted by its cancellation token
    #[error("operation cancelled")]
    Cancelled,

    /// Error loading the client configuration
    #[error("failure to load configs `{0}`")]
    ConfigError(String),
}

impl AmqpError {
    /// Returns true for the errors a producer or consumer retries while
    /// establishing its channel.
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            AmqpError::ChannelError(_)
                | AmqpError::DeclareExchangeError(_)
                | AmqpError::DeclareQueueError(_)
                | AmqpError::BindingExchangeToQueueError(..)
                | AmqpError::BindingConsumerError(_)
        )
    }
}
