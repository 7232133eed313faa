//! Topic directory and publisher tying channel registries together.

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::error::{DeliveryError, Result, SubPubError};
use crate::subscriptions::{
    Registry, SubscriptionHandle, SubscriptionId, Turn, DEFAULT_CHANNEL_CAPACITY,
};

/// Default number of queued deliveries per subscriber.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Broker configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SubPubConfig {
    /// Capacity hint for each channel's subscription list.
    pub channel_capacity: usize,

    /// Compact a channel every this many publishes to it (0 = never
    /// automatically).
    pub compact_every: u64,

    /// Max queued deliveries per subscriber before publishes to it are
    /// dropped (0 = unbounded).
    pub queue_capacity: usize,

    /// Thread name for delivery workers.
    pub worker_name: String,
}

impl Default for SubPubConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            compact_every: 1,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            worker_name: "subpub-delivery".to_string(),
        }
    }
}

/// A reserved turn plus the message it delivers.
type Job<M> = (Turn<M>, Arc<M>);

/// Dedicated delivery thread for one subscription.
struct Worker<M> {
    queue: Sender<Job<M>>,
    thread: JoinHandle<()>,
}

/// A channel's registry, its delivery workers and its compaction cadence.
struct Channel<M> {
    registry: Registry<M>,
    publishes: AtomicU64,
    /// Workers by subscription. Held for the whole of a publish, so dispatch
    /// on one channel is serialized.
    workers: Mutex<HashMap<SubscriptionId, Worker<M>>>,
    /// Workers of compacted-away subscriptions, finishing their queues.
    retired: Mutex<Vec<JoinHandle<()>>>,
}

impl<M> Channel<M> {
    fn new(capacity: usize) -> Self {
        Self {
            registry: Registry::with_capacity(capacity),
            publishes: AtomicU64::new(0),
            workers: Mutex::new(HashMap::new()),
            retired: Mutex::new(Vec::new()),
        }
    }

    /// Close the queues of workers whose subscription left the registry.
    fn retire_workers(&self, workers: &mut HashMap<SubscriptionId, Worker<M>>) {
        let live: HashSet<SubscriptionId> = self.registry.snapshot().ids().into_iter().collect();
        let stale: Vec<SubscriptionId> =
            workers.keys().filter(|id| !live.contains(id)).copied().collect();
        if stale.is_empty() {
            return;
        }

        let mut retired = self.retired.lock();
        retired.retain(|thread| !thread.is_finished());
        for id in stale {
            if let Some(worker) = workers.remove(&id) {
                // Dropping the sender lets the worker finish what is queued.
                drop(worker.queue);
                retired.push(worker.thread);
            }
        }
    }

    /// Drain every subscription, then stop and join every worker.
    fn close(&self) {
        self.registry.close();

        let workers = std::mem::take(&mut *self.workers.lock());
        let mut threads: Vec<JoinHandle<()>> = std::mem::take(&mut *self.retired.lock());
        for (_, worker) in workers {
            drop(worker.queue);
            threads.push(worker.thread);
        }
        for thread in threads {
            if thread.join().is_err() {
                warn!("delivery worker exited abnormally");
            }
        }
    }
}

/// In-process publish/subscribe broker.
///
/// Each subject owns a [`Registry`]. Every subscription gets one delivery
/// worker fed by its own queue; deliveries to one subscriber run one at a
/// time in publish order, deliveries to different subscribers run
/// concurrently.
pub struct SubPub<M> {
    /// Broker configuration.
    config: SubPubConfig,

    /// Channels by subject.
    channels: RwLock<HashMap<String, Arc<Channel<M>>>>,

    /// Set once by `close`, only while holding the `channels` write lock.
    closed: AtomicBool,
}

impl<M> SubPub<M>
where
    M: Send + Sync + 'static,
{
    /// Create a broker with default configuration.
    pub fn new() -> Self {
        Self::with_config(SubPubConfig::default())
    }

    /// Create a broker with custom configuration.
    pub fn with_config(config: SubPubConfig) -> Self {
        Self {
            config,
            channels: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SubPubConfig {
        &self.config
    }

    // --- Subscribing ---

    /// Register a handler on a subject, creating the channel on first use.
    ///
    /// Starts the subscription's delivery worker.
    pub fn subscribe<F>(&self, subject: &str, handler: F) -> Result<SubscriptionHandle>
    where
        F: Fn(&M) + Send + Sync + 'static,
    {
        let mut channels = self.channels.write();
        if self.closed.load(Ordering::Acquire) {
            return Err(SubPubError::Closed);
        }

        let (queue, jobs) = match self.config.queue_capacity {
            0 => unbounded(),
            capacity => bounded(capacity),
        };
        let worker_subject = subject.to_string();
        let thread = thread::Builder::new()
            .name(self.config.worker_name.clone())
            .spawn(move || run_worker(worker_subject, jobs))?;

        let capacity = self.config.channel_capacity;
        let channel = channels.entry(subject.to_string()).or_insert_with(|| {
            debug!(subject, "created channel");
            Arc::new(Channel::new(capacity))
        });

        let mut workers = channel.workers.lock();
        let handle = channel.registry.add(handler);
        workers.insert(handle.id(), Worker { queue, thread });

        trace!(subject, subscription = %handle.id(), "subscribed");
        Ok(handle)
    }

    // --- Publishing ---

    /// Deliver a message to every subscriber active on the subject right now.
    ///
    /// Returns once every delivery is queued; handlers run on the
    /// subscribers' workers. Publishing to a subject nobody subscribed to does
    /// nothing. Subscribers whose queue is full miss this message and are
    /// reported through [`SubPubError::QueueFull`].
    pub fn publish(&self, subject: &str, msg: M) -> Result<()> {
        // Dispatch while holding the directory lock so a concurrent close
        // drains after these deliveries, never before.
        let channels = self.channels.read();
        if self.closed.load(Ordering::Acquire) {
            return Err(SubPubError::Closed);
        }

        let Some(channel) = channels.get(subject) else {
            trace!(subject, "publish without subscribers");
            return Ok(());
        };

        let mut workers = channel.workers.lock();
        if self.compaction_due(channel) {
            channel.registry.compact();
            channel.retire_workers(&mut workers);
        }

        let msg = Arc::new(msg);
        let mut dropped = 0;
        for turn in channel.registry.reserve_active() {
            let Some(worker) = workers.get(&turn.subscription_id()) else {
                continue;
            };
            // A rejected job drops its turn, which gives up the place in line.
            if worker.queue.try_send((turn, Arc::clone(&msg))).is_err() {
                dropped += 1;
            }
        }

        if dropped > 0 {
            warn!(subject, dropped, "subscriber queues full, message dropped");
            return Err(SubPubError::QueueFull {
                subject: subject.to_string(),
                dropped,
            });
        }
        Ok(())
    }

    fn compaction_due(&self, channel: &Channel<M>) -> bool {
        match self.config.compact_every {
            0 => false,
            every => channel.publishes.fetch_add(1, Ordering::Relaxed) % every == 0,
        }
    }

    // --- Maintenance ---

    /// Compact every channel now, regardless of cadence.
    pub fn compact(&self) {
        for channel in self.channels.read().values() {
            let mut workers = channel.workers.lock();
            channel.registry.compact();
            channel.retire_workers(&mut workers);
        }
    }

    /// Number of subjects with a channel.
    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }

    /// Entries tracked for a subject, including unsubscribed ones not yet
    /// compacted.
    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.channels
            .read()
            .get(subject)
            .map_or(0, |channel| channel.registry.len())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // --- Shutdown ---

    /// Stop accepting work and wait for every in-flight delivery to finish.
    ///
    /// This covers subscriptions compacted away while a delivery to them was
    /// still queued or running, and joins every delivery worker. With a
    /// timeout, returns [`SubPubError::Timeout`] if draining takes longer;
    /// draining then carries on in the background. Closing an already closed
    /// broker succeeds immediately.
    pub fn close(&self, timeout: Option<Duration>) -> Result<()> {
        let channels: Vec<(String, Arc<Channel<M>>)> = {
            let mut channels = self.channels.write();
            if self.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
            channels.drain().collect()
        };
        debug!(channels = channels.len(), "closing broker");

        match timeout {
            None => {
                close_channels(channels);
                Ok(())
            }
            Some(timeout) => {
                let name = format!("{}-close", self.config.worker_name);
                close_with_timeout(channels, timeout, |job| {
                    thread::Builder::new().name(name).spawn(job).map(drop)
                })
            }
        }
    }
}

/// Drain on a background thread and wait up to `timeout` for it.
///
/// If the thread cannot be started the channels are drained on the calling
/// thread instead, without a timeout.
fn close_with_timeout<M, S>(
    channels: Vec<(String, Arc<Channel<M>>)>,
    timeout: Duration,
    spawn: S,
) -> Result<()>
where
    M: Send + Sync + 'static,
    S: FnOnce(Box<dyn FnOnce() + Send>) -> io::Result<()>,
{
    let (done_tx, done_rx) = bounded(1);
    let background = channels.clone();
    let spawned = spawn(Box::new(move || {
        close_channels(background);
        let _ = done_tx.send(());
    }));

    if let Err(e) = spawned {
        warn!(error = %e, "could not start close worker, draining inline");
        close_channels(channels);
        return Ok(());
    }
    drop(channels);

    match done_rx.recv_timeout(timeout) {
        Ok(()) | Err(RecvTimeoutError::Disconnected) => Ok(()),
        Err(RecvTimeoutError::Timeout) => {
            warn!(?timeout, "close timed out waiting for deliveries");
            Err(SubPubError::Timeout)
        }
    }
}

fn close_channels<M>(channels: Vec<(String, Arc<Channel<M>>)>) {
    for (subject, channel) in channels {
        channel.close();
        trace!(subject = %subject, "closed channel");
    }
}

fn run_worker<M>(subject: String, jobs: Receiver<Job<M>>) {
    for (turn, msg) in jobs.iter() {
        let subscription = turn.subscription_id();
        match turn.deliver(&msg) {
            Ok(()) => {}
            Err(DeliveryError::Drained) => {
                trace!(subject = %subject, %subscription, "skipped delivery to drained subscription");
            }
            Err(DeliveryError::HandlerPanicked(info)) => {
                warn!(subject = %subject, %subscription, panic = %info, "subscriber handler panicked");
            }
        }
    }
}

impl<M> Default for SubPub<M>
where
    M: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
