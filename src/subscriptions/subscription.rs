//! A single subscriber on a channel and its delivery ordering.
//!
//! Each subscription carries two independent pieces of synchronization:
//!
//! - a turn sequencer: every delivery takes a ticket when it is reserved and
//!   runs only once its ticket is served, so invocations of one handler never
//!   overlap and happen in reservation order;
//! - a single-permit baton: held by whoever is currently running the handler
//!   and posted back when it returns. A close takes the baton for good, which
//!   is how later deliveries learn the subscription was drained.
//!
//! The two are not interchangeable. The sequencer decides whose turn it is,
//! including the turn of a drain, so it is also what a drain waits on. The
//! baton says whether the last delivery handed control back: a drain receives
//! it exactly once when its turn comes up, and a delivery that finds it gone
//! skips the handler.

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::types::{Handler, SubscriptionHandle, SubscriptionId};
use crate::error::DeliveryError;

/// Ticket bookkeeping for the turn sequencer.
#[derive(Default)]
struct TurnState {
    next_ticket: u64,
    now_serving: u64,
    /// Tickets whose turn was dropped before it ran.
    abandoned: BTreeSet<u64>,
    /// Set by the drain that received the baton for good.
    drained: bool,
}

impl TurnState {
    fn take_ticket(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        ticket
    }

    fn advance(&mut self) {
        self.now_serving += 1;
        while self.abandoned.remove(&self.now_serving) {
            self.now_serving += 1;
        }
    }
}

/// One subscriber's handler plus its concurrency bookkeeping.
pub struct Subscription<M> {
    id: SubscriptionId,
    handler: Handler<M>,
    active: Arc<AtomicBool>,
    turns: Mutex<TurnState>,
    turn_changed: Condvar,
    baton_tx: Sender<()>,
    baton_rx: Receiver<()>,
}

impl<M> Subscription<M> {
    /// Create an active, idle subscription.
    pub(crate) fn new(id: SubscriptionId, handler: Handler<M>) -> Self {
        let (baton_tx, baton_rx) = bounded(1);
        // Idle subscriptions hold the permit, so closing one that never
        // received anything does not block.
        let _ = baton_tx.try_send(());

        Self {
            id,
            handler,
            active: Arc::new(AtomicBool::new(true)),
            turns: Mutex::new(TurnState::default()),
            turn_changed: Condvar::new(),
            baton_tx,
            baton_rx,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Lock-free read of the activity flag.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn handle(&self) -> SubscriptionHandle {
        SubscriptionHandle::new(self.id, Arc::clone(&self.active))
    }

    /// Reserve the next delivery slot without blocking.
    ///
    /// Turns run in the order they were reserved. Reserve on the publishing
    /// thread and hand the turn to a worker to keep publish order.
    pub fn reserve(self: &Arc<Self>) -> Turn<M> {
        let ticket = self.turns.lock().take_ticket();
        Turn {
            subscription: Arc::clone(self),
            ticket,
            finished: false,
        }
    }

    /// Reserve a turn and deliver on the calling thread.
    pub fn deliver(self: &Arc<Self>, msg: &M) -> Result<(), DeliveryError> {
        self.reserve().deliver(msg)
    }

    /// Wait for every delivery reserved so far, then take the baton for good.
    ///
    /// Returns false if the subscription had already been drained.
    pub(crate) fn drain(self: &Arc<Self>) -> bool {
        self.reserve().drain()
    }

    /// Whether some reserved turn has not finished yet.
    pub fn has_pending_turns(&self) -> bool {
        let turns = self.turns.lock();
        turns.now_serving != turns.next_ticket
    }

    fn wait_for_turn(&self, ticket: u64) {
        let mut turns = self.turns.lock();
        while turns.now_serving != ticket {
            self.turn_changed.wait(&mut turns);
        }
    }

    fn finish_turn(&self) {
        let mut turns = self.turns.lock();
        turns.advance();
        self.turn_changed.notify_all();
    }

    fn abandon_turn(&self, ticket: u64) {
        let mut turns = self.turns.lock();
        if turns.now_serving == ticket {
            turns.advance();
            self.turn_changed.notify_all();
        } else {
            turns.abandoned.insert(ticket);
        }
    }
}

impl<M> fmt::Debug for Subscription<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

/// A reserved place in a subscription's delivery order.
///
/// Dropping a turn without using it gives up the place; later turns are not
/// held up by it.
#[must_use = "an unused turn is abandoned on drop"]
pub struct Turn<M> {
    subscription: Arc<Subscription<M>>,
    ticket: u64,
    finished: bool,
}

impl<M> Turn<M> {
    pub fn subscription_id(&self) -> SubscriptionId {
        self.subscription.id
    }

    /// Block until this turn comes up, then run the handler once.
    ///
    /// The baton is posted back before the turn is released, also when the
    /// handler panics.
    pub fn deliver(mut self, msg: &M) -> Result<(), DeliveryError> {
        let sub = Arc::clone(&self.subscription);
        sub.wait_for_turn(self.ticket);
        self.finished = true;

        let result = match sub.baton_rx.try_recv() {
            Ok(()) => {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| (sub.handler)(msg)));
                let _ = sub.baton_tx.try_send(());
                outcome.map_err(|payload| DeliveryError::HandlerPanicked(panic_message(payload)))
            }
            // Under our turn the baton is only missing once drained.
            Err(_) => Err(DeliveryError::Drained),
        };

        sub.finish_turn();
        result
    }

    fn drain(mut self) -> bool {
        let sub = Arc::clone(&self.subscription);
        sub.wait_for_turn(self.ticket);
        self.finished = true;

        let already_drained = std::mem::replace(&mut sub.turns.lock().drained, true);
        // Every earlier turn posted the baton back before releasing, so this
        // receive only waits if a delivery broke that order.
        let took = !already_drained && sub.baton_rx.recv().is_ok();
        sub.finish_turn();
        took
    }
}

impl<M> Drop for Turn<M> {
    fn drop(&mut self) {
        if !self.finished {
            self.subscription.abandon_turn(self.ticket);
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    fn recording(log: &Arc<Mutex<Vec<u32>>>) -> Handler<u32> {
        let log = Arc::clone(log);
        Arc::new(move |msg: &u32| log.lock().push(*msg))
    }

    #[test]
    fn test_deliver_invokes_handler() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sub = Arc::new(Subscription::new(SubscriptionId(1), recording(&log)));

        sub.deliver(&5).unwrap();
        sub.deliver(&6).unwrap();

        assert_eq!(*log.lock(), vec![5, 6]);
    }

    #[test]
    fn test_turns_run_in_reservation_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sub = Arc::new(Subscription::new(SubscriptionId(1), recording(&log)));

        let turns: Vec<_> = (0..8).map(|_| sub.reserve()).collect();

        // Start workers in reverse so arrival order at the guard is scrambled.
        let workers: Vec<_> = turns
            .into_iter()
            .enumerate()
            .rev()
            .map(|(i, turn)| thread::spawn(move || turn.deliver(&(i as u32)).unwrap()))
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(*log.lock(), (0..8).collect::<Vec<u32>>());
    }

    #[test]
    fn test_first_delivery_completes_before_second_starts() {
        let running = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicBool::new(false));

        let handler: Handler<u32> = {
            let running = Arc::clone(&running);
            let overlap = Arc::clone(&overlap);
            Arc::new(move |_: &u32| {
                if running.fetch_add(1, Ordering::SeqCst) > 0 {
                    overlap.store(true, Ordering::SeqCst);
                }
                thread::sleep(Duration::from_millis(20));
                running.fetch_sub(1, Ordering::SeqCst);
            })
        };
        let sub = Arc::new(Subscription::new(SubscriptionId(1), handler));

        let first = sub.reserve();
        let second = sub.reserve();
        let a = thread::spawn(move || first.deliver(&1));
        let b = thread::spawn(move || second.deliver(&2));
        a.join().unwrap().unwrap();
        b.join().unwrap().unwrap();

        assert!(!overlap.load(Ordering::SeqCst));
    }

    #[test]
    fn test_abandoned_turn_does_not_block_later_turns() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sub = Arc::new(Subscription::new(SubscriptionId(1), recording(&log)));

        let skipped = sub.reserve();
        let later = sub.reserve();
        drop(skipped);

        later.deliver(&9).unwrap();
        // Abandoning a turn that is not at the front is also skipped.
        let front = sub.reserve();
        let middle = sub.reserve();
        let back = sub.reserve();
        drop(middle);
        front.deliver(&1).unwrap();
        back.deliver(&3).unwrap();

        assert_eq!(*log.lock(), vec![9, 1, 3]);
    }

    #[test]
    fn test_panicking_handler_posts_baton() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler: Handler<u32> = {
            let calls = Arc::clone(&calls);
            Arc::new(move |msg: &u32| {
                calls.fetch_add(1, Ordering::SeqCst);
                if *msg == 0 {
                    panic!("bad message");
                }
            })
        };
        let sub = Arc::new(Subscription::new(SubscriptionId(1), handler));

        let err = sub.deliver(&0).unwrap_err();
        assert_eq!(err, DeliveryError::HandlerPanicked("bad message".to_string()));

        sub.deliver(&1).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(sub.drain());
    }

    #[test]
    fn test_drain_idle_subscription_returns_immediately() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sub = Arc::new(Subscription::new(SubscriptionId(1), recording(&log)));

        assert!(sub.drain());
        assert!(!sub.drain());
    }

    #[test]
    fn test_delivery_after_drain_is_skipped() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sub = Arc::new(Subscription::new(SubscriptionId(1), recording(&log)));

        sub.deliver(&1).unwrap();
        assert!(sub.drain());

        assert_eq!(sub.deliver(&2), Err(DeliveryError::Drained));
        assert_eq!(*log.lock(), vec![1]);
    }

    #[test]
    fn test_drain_waits_for_reserved_deliveries() {
        let (release_tx, release_rx) = bounded::<()>(0);
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler: Handler<u32> = {
            let log = Arc::clone(&log);
            Arc::new(move |msg: &u32| {
                if *msg == 1 {
                    let _ = release_rx.recv();
                }
                log.lock().push(*msg);
            })
        };
        let sub = Arc::new(Subscription::new(SubscriptionId(1), handler));

        let first = sub.reserve();
        let second = sub.reserve();
        let a = thread::spawn(move || first.deliver(&1));
        let b = thread::spawn(move || second.deliver(&2));

        let drainer = {
            let sub = Arc::clone(&sub);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                sub.drain()
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!drainer.is_finished());

        release_tx.send(()).unwrap();
        assert!(drainer.join().unwrap());
        a.join().unwrap().unwrap();
        b.join().unwrap().unwrap();
        assert_eq!(*log.lock(), vec![1, 2]);
    }

    #[test]
    fn test_pending_turns_tracked_until_finished() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sub = Arc::new(Subscription::new(SubscriptionId(1), recording(&log)));
        assert!(!sub.has_pending_turns());

        let first = sub.reserve();
        let second = sub.reserve();
        assert!(sub.has_pending_turns());

        first.deliver(&1).unwrap();
        assert!(sub.has_pending_turns());
        drop(second);
        assert!(!sub.has_pending_turns());
    }

    #[test]
    fn test_repeated_drain_does_not_block() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sub = Arc::new(Subscription::new(SubscriptionId(1), recording(&log)));

        sub.deliver(&1).unwrap();
        assert!(sub.drain());
        assert!(!sub.drain());
        assert!(!sub.drain());
        assert!(!sub.has_pending_turns());
    }

    #[test]
    fn test_handle_flips_subscription_flag() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sub = Subscription::new(SubscriptionId(3), recording(&log));
        let handle = sub.handle();

        assert!(sub.is_active());
        handle.unsubscribe();
        assert!(!sub.is_active());
        assert_eq!(handle.id(), sub.id());
    }
}
