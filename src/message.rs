// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messages
//!
//! Inbound deliveries, outbound publish properties and the marshaling step
//! that turns a structured value into the bytes put on the wire. Bodies are
//! opaque to everything except the marshaler on the send side.

use crate::{errors::AmqpError, otel::HeaderPropagator};
use opentelemetry::{global, Context};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Turns a structured value into a message body.
pub trait Marshaler: Send + Sync {
    /// Content type advertised on every published message.
    fn content_type(&self) -> &str;

    fn marshal<T>(&self, value: &T) -> Result<Vec<u8>, AmqpError>
    where
        T: Serialize + ?Sized;
}

/// Marshals payloads with `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMarshaler;

impl Marshaler for JsonMarshaler {
    fn content_type(&self) -> &str {
        JSON_CONTENT_TYPE
    }

    fn marshal<T>(&self, value: &T) -> Result<Vec<u8>, AmqpError>
    where
        T: Serialize + ?Sized,
    {
        serde_json::to_vec(value).map_err(|err| AmqpError::EncodeError(err.to_string()))
    }
}

/// Properties attached to a single broker write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishProperties {
    pub content_type: String,
    pub message_id: String,
    pub headers: BTreeMap<String, String>,
}

impl PublishProperties {
    /// Fresh message id and the current trace context in the headers.
    pub fn new(content_type: &str) -> Self {
        let mut headers = BTreeMap::new();

        global::get_text_map_propagator(|propagator| {
            propagator.inject_context(&Context::current(), &mut HeaderPropagator::new(&mut headers))
        });

        PublishProperties {
            content_type: content_type.to_owned(),
            message_id: Uuid::new_v4().to_string(),
            headers,
        }
    }
}

/// A message delivered to a consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl Message {
    pub fn new(exchange: &str, routing_key: &str, payload: Vec<u8>) -> Self {
        Message {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            payload,
            ..Default::default()
        }
    }

    /// Decodes a JSON body.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        serde_json::from_slice(&self.payload).map_err(|err| AmqpError::DecodeError(err.to_string()))
    }

    /// Trace context propagated by the publisher, if any.
    ///
    /// # Returns
    /// The current context extended with what the global propagator finds
    /// in the headers
    pub fn context(&self) -> Context {
        let mut headers = self.headers.clone();
        global::get_text_map_propagator(|propagator| {
            propagator.extract(&HeaderPropagator::new(&mut headers))
        })
    }
}

/// Conventional body shape: an action name and its data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub action: String,
    pub data: T,
}

impl<T> Envelope<T> {
    pub fn new(action: &str, data: T) -> Self {
        Envelope {
            action: action.to_owned(),
            data,
        }
    }
}
