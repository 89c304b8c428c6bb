// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Resilient RabbitMQ client core.
//!
//! One `BrokerConnection` per process, dialed with retry, from which any
//! number of `Producer`s and `Consumer`s are built. Each of them owns its
//! channel, declares its `Topology` with retry and exposes a `FailureSignal`
//! that fires when the channel or the connection dies.

mod otel;

pub mod channel;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod exchange;
pub mod failure;
pub mod message;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod topology;

#[cfg(test)]
mod logs;
#[cfg(test)]
mod memory;

pub use config::RabbitMQConfigs;
pub use connection::BrokerConnection;
pub use consumer::Consumer;
pub use errors::AmqpError;
pub use exchange::ExchangeKind;
pub use failure::FailureSignal;
pub use message::{Envelope, Message};
pub use publisher::Producer;
pub use retry::RetryPolicy;
pub use topology::Topology;
