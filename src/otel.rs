// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! This module provides the adapter used to propagate trace context through
//! message headers. The publish path injects the current context; received
//! messages extract it back so handlers can continue the trace.

use opentelemetry::propagation::{Extractor, Injector};
use std::collections::BTreeMap;

/// An adapter for injecting and extracting OpenTelemetry context from message
/// headers.
///
/// Header names are lowercased on injection, matching how the broker clients
/// on the other side look them up.
pub(crate) struct HeaderPropagator<'a> {
    headers: &'a mut BTreeMap<String, String>,
}

impl<'a> HeaderPropagator<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<String, String>) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderPropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(key.to_lowercase(), value);
    }
}

impl Extractor for HeaderPropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }
}
