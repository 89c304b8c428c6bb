// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Failure Signal
//!
//! A one-shot notification raised when a channel, or the connection beneath
//! it, is closed by the broker or by a network error. The notifier side is
//! handed to the transport; the signal side is exposed by the connection,
//! producers and consumers. Nothing in the client reacts to it; a caller-level
//! supervisor decides whether to rebuild.

use crate::errors::AmqpError;
use std::sync::{Arc, OnceLock};
use tokio::sync::watch;
use tracing::warn;

/// Creates a linked notifier/signal pair.
pub fn channel() -> (FailureNotifier, FailureSignal) {
    let (sender, receiver) = watch::channel(None);
    (
        FailureNotifier { sender },
        FailureSignal {
            own: receiver,
            parent: None,
            reason: Arc::default(),
        },
    )
}

/// Sending half of a failure signal.
///
/// Only the first reason is kept; later notifications are ignored. Dropping
/// every notifier without notifying is how a graceful close looks to the
/// observers.
#[derive(Debug, Clone)]
pub struct FailureNotifier {
    sender: watch::Sender<Option<AmqpError>>,
}

impl FailureNotifier {
    /// Records `reason` if nothing fired before. Returns whether this call
    /// fired the signal.
    pub fn notify(&self, reason: AmqpError) -> bool {
        let reason = match reason {
            AmqpError::UnexpectedClose(_) => reason,
            other => AmqpError::UnexpectedClose(other.to_string()),
        };

        let fired = self.sender.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason.clone());
            true
        });

        if fired {
            warn!(reason = reason.to_string(), "failure signal fired");
        }

        fired
    }

    /// Whether a reason was already recorded through any notifier clone.
    pub fn has_fired(&self) -> bool {
        self.sender.borrow().is_some()
    }
}

/// Receiving half of a failure signal.
///
/// A producer or consumer signal also watches the connection it was created
/// from, so a dead connection is reported to every channel derived from it.
/// The first reason observed from either source is kept by the signal and
/// all of its clones.
#[derive(Debug, Clone)]
pub struct FailureSignal {
    own: watch::Receiver<Option<AmqpError>>,
    parent: Option<watch::Receiver<Option<AmqpError>>>,
    reason: Arc<OnceLock<AmqpError>>,
}

impl FailureSignal {
    /// Chains this signal to `parent`: either one firing fires this signal.
    pub(crate) fn with_parent(mut self, parent: &FailureSignal) -> Self {
        self.parent = Some(parent.own.clone());
        self
    }

    /// The reason of the failure, if one was already observed.
    ///
    /// Once a reason is returned, every later call returns the same one. When
    /// both sources fired before the first observation the connection wins.
    pub fn current(&self) -> Option<AmqpError> {
        if let Some(reason) = self.reason.get() {
            return Some(reason.clone());
        }

        let observed = self
            .parent
            .as_ref()
            .and_then(|p| p.borrow().clone())
            .or_else(|| self.own.borrow().clone())?;
        Some(self.latch(observed))
    }

    /// Whether the signal fired.
    pub fn has_fired(&self) -> bool {
        self.current().is_some()
    }

    /// Waits until the signal fires and returns the reason.
    ///
    /// Resolves to `None` once every watched source went away without
    /// failing, which is what a graceful close looks like.
    pub async fn wait(&mut self) -> Option<AmqpError> {
        if let Some(reason) = self.current() {
            return Some(reason);
        }

        let observed = match self.parent.as_mut() {
            None => fired(&mut self.own).await,
            Some(parent) => tokio::select! {
                Some(reason) = fired(parent) => Some(reason),
                Some(reason) = fired(&mut self.own) => Some(reason),
                else => None,
            },
        };

        observed.map(|reason| self.latch(reason))
    }

    fn latch(&self, reason: AmqpError) -> AmqpError {
        self.reason.get_or_init(|| reason).clone()
    }
}

async fn fired(receiver: &mut watch::Receiver<Option<AmqpError>>) -> Option<AmqpError> {
    receiver
        .wait_for(Option::is_some)
        .await
        .ok()
        .and_then(|reason| reason.clone())
}
