//! # SubPub
//!
//! An in-process publish/subscribe broker built around a per-channel
//! subscription registry.
//!
//! ## Core Concepts
//!
//! - **Registry**: the ordered subscriptions of one channel, compacted by
//!   copy-on-write rebuilds
//! - **Subscription**: a handler plus an activity flag, a FIFO turn sequencer
//!   and a single-permit completion baton
//! - **Handle**: what a subscriber keeps; it can only unsubscribe
//! - **Close**: drains every in-flight delivery before releasing subscribers
//!
//! ## Example
//!
//! ```ignore
//! use subpub::SubPub;
//! use std::time::Duration;
//!
//! let broker = SubPub::<String>::new();
//! let handle = broker.subscribe("news", |msg: &String| println!("{msg}"))?;
//!
//! broker.publish("news", "hello".to_string())?;
//! handle.unsubscribe();
//!
//! broker.close(Some(Duration::from_secs(5)))?;
//! ```

pub mod broker;
pub mod error;
pub mod subscriptions;

// Re-exports
pub use broker::{SubPub, SubPubConfig, DEFAULT_QUEUE_CAPACITY};
pub use error::{DeliveryError, Result, SubPubError};
pub use subscriptions::{
    Handler, Registry, Snapshot, Subscription, SubscriptionHandle, SubscriptionId, Turn,
    DEFAULT_CHANNEL_CAPACITY,
};
