//! Per-channel subscription registry.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::subscription::{Subscription, Turn};
use super::types::{Handler, SubscriptionHandle, SubscriptionId};

/// Default capacity hint for a channel's entry list.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 10;

type Entries<M> = Arc<Vec<Arc<Subscription<M>>>>;

/// Immutable view of a registry's entries at one point in time.
///
/// Later `add`/`compact` calls never change a snapshot that was already taken.
pub struct Snapshot<M> {
    entries: Entries<M>,
}

impl<M> Snapshot<M> {
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Subscription<M>>> {
        self.entries.iter()
    }

    /// Entries whose flag is still set at the time of the call.
    pub fn active(&self) -> impl Iterator<Item = &Arc<Subscription<M>>> {
        self.entries.iter().filter(|sub| sub.is_active())
    }

    pub fn ids(&self) -> Vec<SubscriptionId> {
        self.entries.iter().map(|sub| sub.id()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<M> Clone for Snapshot<M> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

/// Ordered set of subscriptions for one channel.
///
/// Mutations replace the shared entry list instead of editing it in place, so
/// a publisher iterating an older [`Snapshot`] is never disturbed.
///
/// Compaction can drop an entry while deliveries to it are still queued or
/// running. Such entries are retired rather than forgotten, and `close`
/// drains them along with the tracked ones.
pub struct Registry<M> {
    entries: RwLock<Entries<M>>,
    /// Compacted-away entries that still had turns outstanding.
    retired: Mutex<Vec<Arc<Subscription<M>>>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl<M> Registry<M> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create an empty registry with a custom capacity hint.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(Arc::new(Vec::with_capacity(capacity))),
            retired: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            capacity,
        }
    }

    /// Append a new active subscription and return its handle.
    pub fn add<F>(&self, handler: F) -> SubscriptionHandle
    where
        F: Fn(&M) + Send + Sync + 'static,
    {
        self.add_handler(Arc::new(handler))
    }

    /// Append a new active subscription for an already shared handler.
    pub fn add_handler(&self, handler: Handler<M>) -> SubscriptionHandle {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let subscription = Arc::new(Subscription::new(id, handler));
        let handle = subscription.handle();

        let mut entries = self.entries.write();
        // Copies the list only while some snapshot still points at it.
        Arc::make_mut(&mut *entries).push(subscription);

        handle
    }

    /// Drop inactive entries, keeping the relative order of the rest.
    ///
    /// Flags are read once; an entry unsubscribed right after being read stays
    /// until the next compaction. Dropped entries with deliveries outstanding
    /// stay retired until those finish.
    pub fn compact(&self) {
        let mut entries = self.entries.write();

        let mut kept = Vec::with_capacity(entries.len().max(self.capacity));
        let mut retired = self.retired.lock();
        retired.retain(|sub| sub.has_pending_turns());
        for sub in entries.iter() {
            if sub.is_active() {
                kept.push(Arc::clone(sub));
            } else if sub.has_pending_turns() {
                retired.push(Arc::clone(sub));
            }
        }

        let removed = entries.len() - kept.len();
        if removed > 0 {
            debug!(
                removed,
                remaining = kept.len(),
                retired = retired.len(),
                "compacted subscriptions"
            );
        }
        *entries = Arc::new(kept);
    }

    /// Reserve one turn on every active entry.
    ///
    /// Reservation happens under the entry lock, so a compaction running
    /// concurrently either sees these turns outstanding or happens first and
    /// the entry is skipped.
    pub fn reserve_active(&self) -> Vec<Turn<M>> {
        let entries = self.entries.read();
        entries
            .iter()
            .filter(|sub| sub.is_active())
            .map(|sub| sub.reserve())
            .collect()
    }

    /// Wait for the last delivery to every subscription, tracked or retired,
    /// then release them.
    ///
    /// Entries are drained in order, retired ones last. No publish may start
    /// against this registry once close has begun; deliveries that still
    /// reach a drained subscription are skipped. Calling close again does
    /// nothing.
    pub fn close(&self) {
        let entries = std::mem::take(&mut *self.entries.write());
        let retired = std::mem::take(&mut *self.retired.lock());

        for sub in entries.iter().chain(retired.iter()) {
            if sub.drain() {
                debug!(subscription = %sub.id(), "drained subscription");
            }
        }
    }

    /// Current entries, for a publisher to iterate.
    pub fn snapshot(&self) -> Snapshot<M> {
        Snapshot {
            entries: Arc::clone(&self.entries.read()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Compacted-away entries still waiting on deliveries.
    pub fn retired_len(&self) -> usize {
        self.retired.lock().len()
    }
}

impl<M> Default for Registry<M> {
    fn default() -> Self {
        Self::new()
    }
}
