//! Relaying auth state changes between clients sharing a storage key

use std::fmt;

use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::{registry::SharedRegistry, AccessToken, AuthChangeEvent, Session};

/// An auth state change announced to the other clients
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BroadcastMessage {
    /// Instance identifier of the announcing client
    pub origin: u64,
    /// What happened
    pub event: AuthChangeEvent,
    /// The session after the change
    pub session: Option<Session>,
}

/// A channel connecting clients that share a storage key
pub trait BroadcastChannel: Send + Sync + fmt::Debug {
    /// Announces a change to every other subscriber
    fn publish(&self, message: BroadcastMessage);

    /// Opens a stream of announcements, or `None` if the channel never
    /// delivers any
    fn subscribe(&self) -> Option<BoxStream<'static, BroadcastMessage>>;
}

/// A channel connecting nothing
#[derive(Clone, Copy, Debug, Default)]
pub struct NoBroadcast;

impl BroadcastChannel for NoBroadcast {
    fn publish(&self, _message: BroadcastMessage) {}

    fn subscribe(&self) -> Option<BoxStream<'static, BroadcastMessage>> {
        None
    }
}

/// A channel connecting the clients of one process
#[derive(Clone, Debug)]
pub struct ProcessBroadcast {
    sender: broadcast::Sender<BroadcastMessage>,
}

impl ProcessBroadcast {
    /// Opens the channel for `storage_key` in `registry`
    pub fn new(registry: &SharedRegistry, storage_key: &str) -> Self {
        Self {
            sender: registry.channel(storage_key),
        }
    }
}

impl BroadcastChannel for ProcessBroadcast {
    fn publish(&self, message: BroadcastMessage) {
        let event = message.event;
        match self.sender.send(message) {
            Ok(receivers) => tracing::trace!(%event, receivers, "broadcast auth state change"),
            Err(_) => tracing::trace!(%event, "no other client is listening"),
        }
    }

    fn subscribe(&self) -> Option<BoxStream<'static, BroadcastMessage>> {
        let rx = self.sender.subscribe();
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(message) => return Some((message, rx)),
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "broadcast receiver lagged, skipping messages");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        });
        Some(stream.boxed())
    }
}

/// The last change a client applied, used to drop duplicate announcements
#[derive(Debug, Default)]
pub(crate) struct LastApplied(Mutex<Option<(AuthChangeEvent, Option<AccessToken>)>>);

impl LastApplied {
    /// Records a change, returning `false` if it repeats the previous one
    pub(crate) fn record(&self, event: AuthChangeEvent, session: Option<&Session>) -> bool {
        let fingerprint = (event, session.map(|s| s.access_token().to_owned()));
        let mut last = self.0.lock();
        if last.as_ref() == Some(&fingerprint) {
            false
        } else {
            *last = Some(fingerprint);
            true
        }
    }
}
