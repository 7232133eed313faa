//! Subscription types shared between the registry and its callers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Message callback registered by a subscriber.
pub type Handler<M> = Arc<dyn Fn(&M) + Send + Sync>;

/// Unique identifier for a subscription.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({})", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle returned to a subscriber.
///
/// The only capability it carries is retracting the subscription. The
/// subscription itself stays owned by its registry.
#[derive(Clone)]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    active: Arc<AtomicBool>,
}

impl SubscriptionHandle {
    pub(crate) fn new(id: SubscriptionId, active: Arc<AtomicBool>) -> Self {
        Self { id, active }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Mark the subscription inactive.
    ///
    /// A delivery already running finishes normally. The entry leaves the
    /// registry at the next compaction. Calling this again, or after the
    /// entry was compacted away, does nothing.
    pub fn unsubscribe(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Whether `unsubscribe` has not been called yet.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
