//! Channel registry
//!
//! Ids are allocated from a counter that only moves forward, so an id is
//! never handed out twice, even after the channel is deleted or its
//! creation failed halfway.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::channel::{Channel, ChannelId, MediaKind};
use crate::error::Result;
use crate::network::transport::DtlsSrtpTransport;

#[derive(Default)]
struct Inner {
    next_id: ChannelId,
    channels: HashMap<ChannelId, Arc<Channel>>,
}

/// Owns every live channel, keyed by id
#[derive(Default)]
pub struct ChannelRegistry {
    inner: Mutex<Inner>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id, build the channel's transport with `transport_for`
    /// and register the channel.
    ///
    /// The lock is not held while the factory runs; the factory usually
    /// dispatches onto the network context.
    pub fn create_channel<F>(&self, kind: MediaKind, transport_for: F) -> Result<Arc<Channel>>
    where
        F: FnOnce(ChannelId) -> Result<Arc<DtlsSrtpTransport>>,
    {
        let id = {
            let mut inner = self.inner.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            id
        };

        let transport = transport_for(id)?;
        let channel = Channel::new(id, kind, transport);
        self.inner.lock().channels.insert(id, channel.clone());

        tracing::info!(channel = id, %kind, "Channel created");
        Ok(channel)
    }

    pub fn find(&self, id: ChannelId) -> Option<Arc<Channel>> {
        self.inner.lock().channels.get(&id).cloned()
    }

    /// Remove a channel. Unknown ids are logged and ignored.
    pub fn delete(&self, id: ChannelId) -> Option<Arc<Channel>> {
        let removed = self.inner.lock().channels.remove(&id);
        match &removed {
            Some(_) => tracing::info!(channel = id, "Channel deleted"),
            None => tracing::warn!(channel = id, "Delete of unknown channel ignored"),
        }
        removed
    }

    /// Live ids in ascending order
    pub fn ids(&self) -> Vec<ChannelId> {
        let mut ids: Vec<_> = self.inner.lock().channels.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn channels(&self) -> Vec<Arc<Channel>> {
        let inner = self.inner.lock();
        let mut channels: Vec<_> = inner.channels.values().cloned().collect();
        channels.sort_by_key(|c| c.id());
        channels
    }

    pub fn len(&self) -> usize {
        self.inner.lock().channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().channels.is_empty()
    }
}
