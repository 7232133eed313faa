//! Subscription registry for a single channel.
//!
//! This module tracks who is subscribed to one channel and coordinates
//! delivery to them:
//! - Adding subscribers and retracting them through a handle
//! - Copy-on-write compaction of inactive entries
//! - Strict FIFO delivery per subscriber, even with racing publishers
//! - Drain-then-close shutdown that waits for in-flight deliveries
//!
//! # Example
//!
//! ```ignore
//! let registry = Registry::<String>::new();
//! let handle = registry.add(|msg: &String| println!("got {msg}"));
//!
//! // A publisher takes a snapshot and delivers to every active entry.
//! for sub in registry.snapshot().active() {
//!     let _ = sub.deliver(&"hello".to_string());
//! }
//!
//! handle.unsubscribe();
//! registry.compact();
//! registry.close();
//! ```

mod registry;
mod subscription;
mod types;

pub use registry::{Registry, Snapshot, DEFAULT_CHANNEL_CAPACITY};
pub use subscription::{Subscription, Turn};
pub use types::{Handler, SubscriptionHandle, SubscriptionId};
