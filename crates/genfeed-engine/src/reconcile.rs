use genfeed_contracts::requests::ImageStatus;
use genfeed_contracts::signals::SignalEvent;
use indexmap::IndexMap;

use crate::cache::FeedCache;

/// Signals that arrived before their image was cached, keyed by content hash.
///
/// Unbounded unless a limit is given; with a limit the oldest hash is evicted first.
#[derive(Debug, Clone, Default)]
pub struct SignalBuffer {
    pending: IndexMap<String, ImageStatus>,
    limit: Option<usize>,
}

impl SignalBuffer {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            pending: IndexMap::new(),
            limit: limit.filter(|value| *value > 0),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(None)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.pending.contains_key(hash)
    }

    pub fn status(&self, hash: &str) -> Option<ImageStatus> {
        self.pending.get(hash).copied()
    }

    pub fn hashes(&self) -> impl Iterator<Item = &str> {
        self.pending.keys().map(String::as_str)
    }

    /// Buffers `event`, replacing any earlier status for the same hash.
    /// Returns the hash evicted to stay within the limit, if any.
    pub fn push(&mut self, event: SignalEvent) -> Option<String> {
        self.pending.shift_remove(&event.image_hash);
        self.pending.insert(event.image_hash, event.status);
        let limit = self.limit?;
        if self.pending.len() > limit {
            return self.pending.shift_remove_index(0).map(|(hash, _)| hash);
        }
        None
    }

    pub fn take(&mut self, hash: &str) -> Option<SignalEvent> {
        self.pending
            .shift_remove(hash)
            .map(|status| SignalEvent::new(status, hash))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalOutcome {
    Applied,
    Buffered { evicted: Option<String> },
}

/// Applies a pushed image status to the cache, or buffers it when no cached image
/// carries the hash yet.
pub fn reconcile_signal(
    cache: &mut FeedCache,
    buffer: &mut SignalBuffer,
    event: &SignalEvent,
) -> SignalOutcome {
    if cache.patch_image_by_hash(&event.to_patch()) {
        return SignalOutcome::Applied;
    }
    let evicted = buffer.push(event.clone());
    SignalOutcome::Buffered { evicted }
}
