//! The demand protocol between one producer and one consumer.
//!
//! A consumer holds a [`Subscription`] and grants demand with
//! [`Subscription::request`]. The producer holds the matching [`Emitter`] and
//! may only deliver an item when [`Emitter::try_emit`] succeeds in consuming a
//! unit of that demand.
//!
//! Delivery is serialized per subscription. Every signal goes through a small
//! queue drained by whichever call frame currently owns the delivery loop, so a
//! subscriber that requests, cancels, or causes an emission from inside its own
//! `on_next` never re-enters itself and never deadlocks. The queue can only
//! hold what demand allowed, plus one terminal signal.

use crate::common::{add_demand, UNBOUNDED};
use crate::error::FlowError;
use crate::events::Signal;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;

/// The consumer side of a stream: the fixed capability interface every
/// consumer variant implements.
pub trait Subscriber<T>: Send + 'static {
    /// Called exactly once, before any other signal.
    fn on_subscribe(&mut self, subscription: Subscription);
    fn on_next(&mut self, item: T);
    fn on_error(&mut self, error: FlowError);
    fn on_complete(&mut self);
}

impl<T, S: Subscriber<T> + ?Sized> Subscriber<T> for Box<S> {
    fn on_subscribe(&mut self, subscription: Subscription) {
        (**self).on_subscribe(subscription)
    }
    fn on_next(&mut self, item: T) {
        (**self).on_next(item)
    }
    fn on_error(&mut self, error: FlowError) {
        (**self).on_error(error)
    }
    fn on_complete(&mut self) {
        (**self).on_complete()
    }
}

/// A boxed subscriber, as passed between operators.
pub type BoxSubscriber<T> = Box<dyn Subscriber<T>>;

/// Anything a `Subscription` can forward demand and cancellation to.
pub(crate) trait Link: Send + Sync {
    fn request(&self, n: u64);
    fn cancel(&self);
}

/// The consumer's handle on a live stream.
///
/// Cloning yields another handle to the same subscription.
#[derive(Clone)]
pub struct Subscription {
    link: Arc<dyn Link>,
}

impl Subscription {
    pub(crate) fn new(link: Arc<dyn Link>) -> Self {
        Self { link }
    }

    /// Grants `n` more items of demand. `n == 0` is a protocol violation and
    /// terminates the stream with a `Protocol` error.
    pub fn request(&self, n: u64) {
        self.link.request(n);
    }

    /// Grants unlimited demand.
    pub fn request_unbounded(&self) {
        self.link.request(UNBOUNDED);
    }

    /// Stops the stream. Idempotent.
    pub fn cancel(&self) {
        self.link.cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Subscription")
    }
}

/// The producer-side state machine behind one subscription.
pub trait Source<T>: Send + 'static {
    /// Called once, after the subscriber's `on_subscribe` has returned.
    fn start(&mut self, _emitter: &Emitter<T>) {}

    /// Called whenever demand has been granted. Emit while
    /// [`Emitter::try_emit`] succeeds; return when it refuses.
    fn pull(&mut self, emitter: &Emitter<T>);
}

/// Lifecycle of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Active,
    Cancelled,
    Terminated,
}

const ACTIVE: u8 = 0;
const CANCELLED: u8 = 1;
const TERMINATED: u8 = 2;

type CancelHook = Box<dyn FnOnce() + Send>;

enum Step<T> {
    Deliver(Signal<T>),
    Idle,
    Finished,
}

struct Core<T> {
    state: AtomicU8,
    demand: AtomicU64,
    pull_wip: AtomicUsize,
    deliver_wip: AtomicUsize,
    queue: Mutex<VecDeque<Signal<T>>>,
    downstream: Mutex<Option<BoxSubscriber<T>>>,
    source: Mutex<Option<Box<dyn Source<T>>>>,
    cancel_hook: Mutex<Option<CancelHook>>,
}

/// The producer's half of a subscription.
///
/// Cloning yields another handle to the same subscription, which is how timer
/// callbacks and upstream subscribers get to emit.
pub struct Emitter<T> {
    core: Arc<Core<T>>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<T: Send + 'static> Emitter<T> {
    /// Binds `source` to `subscriber` and hands the subscriber its
    /// `Subscription`.
    ///
    /// Demand granted from inside `on_subscribe` is recorded but only pulled
    /// once `on_subscribe` has returned and the source has been started.
    pub fn start(subscriber: BoxSubscriber<T>, source: impl Source<T>) -> Self {
        let core = Arc::new(Core {
            state: AtomicU8::new(ACTIVE),
            demand: AtomicU64::new(0),
            pull_wip: AtomicUsize::new(1),
            deliver_wip: AtomicUsize::new(1),
            queue: Mutex::new(VecDeque::new()),
            downstream: Mutex::new(Some(subscriber)),
            source: Mutex::new(Some(Box::new(source))),
            cancel_hook: Mutex::new(None),
        });
        let emitter = Self { core };

        let subscription = Subscription::new(Arc::new(emitter.clone()));
        if let Some(downstream) = emitter.core.downstream.lock().as_mut() {
            downstream.on_subscribe(subscription);
        }
        emitter.drain_delivery(1);

        if emitter.is_active() {
            if let Some(source) = emitter.core.source.lock().as_mut() {
                source.start(&emitter);
            }
        }
        emitter.drain_pull(1);
        emitter
    }

    /// Consumes one unit of demand and delivers `item`.
    ///
    /// Returns `false`, without delivering, when there is no outstanding
    /// demand or the subscription is no longer active.
    pub fn try_emit(&self, item: T) -> bool {
        if !self.is_active() || !self.consume_demand() {
            return false;
        }
        self.enqueue(Signal::Next(item))
    }

    /// Terminates the stream with `error`. Returns `false` if it had already
    /// ended.
    pub fn signal_error(&self, error: FlowError) -> bool {
        self.enqueue(Signal::Error(error))
    }

    /// Terminates the stream normally. Returns `false` if it had already
    /// ended.
    pub fn signal_complete(&self) -> bool {
        self.enqueue(Signal::Complete)
    }

    /// Registers cleanup to run when the consumer cancels.
    ///
    /// Runs immediately if the subscription is already cancelled, and is
    /// discarded if the stream terminates normally.
    pub fn on_cancel(&self, hook: impl FnOnce() + Send + 'static) {
        match self.state() {
            SubscriptionState::Cancelled => hook(),
            SubscriptionState::Terminated => {}
            SubscriptionState::Active => {
                *self.core.cancel_hook.lock() = Some(Box::new(hook));
                // The stream may have ended while the hook was being stored.
                match self.state() {
                    SubscriptionState::Cancelled => self.run_cancel_hook(),
                    SubscriptionState::Terminated => {
                        let stale = self.core.cancel_hook.lock().take();
                        drop(stale);
                    }
                    SubscriptionState::Active => {}
                }
            }
        }
    }

    pub fn state(&self) -> SubscriptionState {
        match self.core.state.load(Ordering::Acquire) {
            ACTIVE => SubscriptionState::Active,
            CANCELLED => SubscriptionState::Cancelled,
            _ => SubscriptionState::Terminated,
        }
    }

    pub fn is_active(&self) -> bool {
        self.core.state.load(Ordering::Acquire) == ACTIVE
    }

    pub fn is_cancelled(&self) -> bool {
        self.core.state.load(Ordering::Acquire) == CANCELLED
    }

    /// Outstanding demand; [`UNBOUNDED`] once unlimited.
    pub fn demand(&self) -> u64 {
        self.core.demand.load(Ordering::Acquire)
    }

    fn consume_demand(&self) -> bool {
        let mut current = self.core.demand.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            if current == UNBOUNDED {
                return true;
            }
            match self.core.demand.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn enqueue(&self, signal: Signal<T>) -> bool {
        let discarded_hook = {
            let mut queue = self.core.queue.lock();
            let hook = if signal.is_terminal() {
                if self
                    .core
                    .state
                    .compare_exchange(ACTIVE, TERMINATED, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    return false;
                }
                self.core.cancel_hook.lock().take()
            } else if !self.is_active() {
                return false;
            } else {
                None
            };
            queue.push_back(signal);
            hook
        };
        drop(discarded_hook);
        self.schedule_delivery();
        true
    }

    fn schedule_delivery(&self) {
        if self.core.deliver_wip.fetch_add(1, Ordering::AcqRel) == 0 {
            self.drain_delivery(1);
        }
    }

    fn drain_delivery(&self, mut missed: usize) {
        loop {
            loop {
                // State and queue are read under the same lock that terminal
                // signals are pushed under, so "finished" is never premature.
                let step = {
                    let mut queue = self.core.queue.lock();
                    if self.is_cancelled() {
                        queue.clear();
                        Step::Finished
                    } else {
                        match queue.pop_front() {
                            Some(signal) => Step::Deliver(signal),
                            None if !self.is_active() => Step::Finished,
                            None => Step::Idle,
                        }
                    }
                };
                let signal = match step {
                    Step::Deliver(signal) => signal,
                    Step::Idle => break,
                    Step::Finished => {
                        self.release();
                        break;
                    }
                };
                let mut downstream = self.core.downstream.lock();
                if let Some(subscriber) = downstream.as_mut() {
                    match signal {
                        Signal::Next(item) => subscriber.on_next(item),
                        Signal::Error(error) => subscriber.on_error(error),
                        Signal::Complete => subscriber.on_complete(),
                    }
                }
            }
            let previous = self.core.deliver_wip.fetch_sub(missed, Ordering::AcqRel);
            missed = previous - missed;
            if missed == 0 {
                break;
            }
        }
    }

    fn drain_pull(&self, mut missed: usize) {
        loop {
            {
                let mut source = self.core.source.lock();
                if self.is_active() {
                    if let Some(source) = source.as_mut() {
                        source.pull(self);
                    }
                } else {
                    source.take();
                }
            }
            let previous = self.core.pull_wip.fetch_sub(missed, Ordering::AcqRel);
            missed = previous - missed;
            if missed == 0 {
                break;
            }
        }
    }

    /// Drops the subscriber and the source once the stream is over, breaking
    /// the reference cycles through them. Only called while owning the
    /// delivery loop, so nothing else holds the subscriber.
    fn release(&self) {
        let subscriber = self.core.downstream.lock().take();
        drop(subscriber);
        // A pull in progress on this stack holds the source; it releases
        // the source itself once it notices the stream is over.
        if let Some(mut source) = self.core.source.try_lock() {
            let released = source.take();
            drop(source);
            drop(released);
        }
    }

    fn run_cancel_hook(&self) {
        let hook = self.core.cancel_hook.lock().take();
        if let Some(hook) = hook {
            hook();
        }
    }
}

impl<T: Send + 'static> Link for Emitter<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            let error = FlowError::Protocol("request(n) requires n > 0, got 0".into());
            // Take the hook before terminating: termination discards it.
            let hook = self.core.cancel_hook.lock().take();
            let terminated = self.signal_error(error);
            // A cancel that won the race found no hook to run.
            if terminated || self.state() == SubscriptionState::Cancelled {
                if let Some(hook) = hook {
                    hook();
                }
            }
            return;
        }
        if !self.is_active() {
            return;
        }
        let mut current = self.core.demand.load(Ordering::Acquire);
        loop {
            let next = add_demand(current, n);
            match self.core.demand.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        if self.core.pull_wip.fetch_add(1, Ordering::AcqRel) == 0 {
            self.drain_pull(1);
        }
    }

    fn cancel(&self) {
        if self
            .core
            .state
            .compare_exchange(ACTIVE, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            trace!("subscription cancelled");
            self.run_cancel_hook();
            // Owning the delivery loop lets us drop the queue and the subscriber.
            self.schedule_delivery();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Records signals and requests a fixed amount on subscribe.
    pub(crate) struct Probe<T> {
        pub log: Arc<Mutex<Vec<Signal<T>>>>,
        pub subscription: Arc<Mutex<Option<Subscription>>>,
        initial: u64,
    }

    impl<T> Probe<T> {
        pub(crate) fn new(initial: u64) -> Self {
            Self {
                log: Arc::new(Mutex::new(Vec::new())),
                subscription: Arc::new(Mutex::new(None)),
                initial,
            }
        }
    }

    impl<T: Send + 'static> Subscriber<T> for Probe<T> {
        fn on_subscribe(&mut self, subscription: Subscription) {
            *self.subscription.lock() = Some(subscription.clone());
            if self.initial > 0 {
                subscription.request(self.initial);
            }
        }
        fn on_next(&mut self, item: T) {
            self.log.lock().push(Signal::Next(item));
        }
        fn on_error(&mut self, error: FlowError) {
            self.log.lock().push(Signal::Error(error));
        }
        fn on_complete(&mut self) {
            self.log.lock().push(Signal::Complete);
        }
    }

    /// Emits 0, 1, 2, ... up to `limit` and then completes.
    struct Counter {
        next: u32,
        limit: u32,
    }

    impl Source<u32> for Counter {
        fn pull(&mut self, emitter: &Emitter<u32>) {
            while self.next < self.limit {
                if !emitter.try_emit(self.next) {
                    return;
                }
                self.next += 1;
            }
            emitter.signal_complete();
        }
    }

    fn nexts(log: &[Signal<u32>]) -> Vec<u32> {
        log.iter()
            .filter_map(|s| match s {
                Signal::Next(v) => Some(*v),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn emits_only_what_was_requested() {
        let probe = Probe::new(2);
        let (log, sub) = (probe.log.clone(), probe.subscription.clone());
        let emitter = Emitter::start(Box::new(probe), Counter { next: 0, limit: 5 });

        assert_eq!(nexts(&log.lock()), vec![0, 1]);
        assert_eq!(emitter.demand(), 0);

        sub.lock().clone().unwrap().request(10);
        let log = log.lock();
        assert_eq!(nexts(&log), vec![0, 1, 2, 3, 4]);
        assert!(matches!(log.last(), Some(Signal::Complete)));
        assert_eq!(emitter.state(), SubscriptionState::Terminated);
    }

    #[test]
    fn request_zero_is_a_protocol_error() {
        let probe = Probe::new(0);
        let (log, sub) = (probe.log.clone(), probe.subscription.clone());
        let emitter = Emitter::start(Box::new(probe), Counter { next: 0, limit: 5 });

        sub.lock().clone().unwrap().request(0);
        let log = log.lock();
        assert_eq!(log.len(), 1);
        assert!(matches!(&log[0], Signal::Error(FlowError::Protocol(_))));
        assert!(!emitter.try_emit(9));
    }

    #[test]
    fn cleanup_runs_exactly_once_when_request_zero_races_cancel() {
        for _ in 0..200 {
            let probe = Probe::<u32>::new(0);
            let sub = probe.subscription.clone();
            let emitter = Emitter::start(Box::new(probe), Counter { next: 0, limit: 5 });
            let hits = Arc::new(AtomicUsize::new(0));
            let counter = hits.clone();
            emitter.on_cancel(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });

            let subscription = sub.lock().clone().unwrap();
            let barrier = Arc::new(std::sync::Barrier::new(2));
            let (other, gate) = (subscription.clone(), barrier.clone());
            let canceller = std::thread::spawn(move || {
                gate.wait();
                other.cancel();
            });
            barrier.wait();
            subscription.request(0);
            canceller.join().unwrap();

            assert_eq!(hits.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn cancel_stops_emission_and_runs_hook_once() {
        let probe = Probe::new(1);
        let (log, sub) = (probe.log.clone(), probe.subscription.clone());
        let emitter = Emitter::start(Box::new(probe), Counter { next: 0, limit: 5 });
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        emitter.on_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let subscription = sub.lock().clone().unwrap();
        subscription.cancel();
        subscription.cancel();
        subscription.request(3);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.state(), SubscriptionState::Cancelled);
        assert!(!emitter.try_emit(42));
        assert_eq!(nexts(&log.lock()), vec![0]);
    }

    #[test]
    fn only_one_terminal_signal_is_delivered() {
        let probe = Probe::<u32>::new(1);
        let log = probe.log.clone();
        let emitter = Emitter::start(Box::new(probe), Counter { next: 0, limit: 0 });

        assert!(!emitter.signal_error(FlowError::Overflow("late".into())));
        assert!(!emitter.try_emit(1));
        let log = log.lock();
        assert_eq!(log.len(), 1);
        assert!(matches!(log[0], Signal::Complete));
    }

    /// Requests one more item from inside every `on_next`.
    struct OneByOne {
        subscription: Option<Subscription>,
        seen: Arc<Mutex<Vec<u32>>>,
    }

    impl Subscriber<u32> for OneByOne {
        fn on_subscribe(&mut self, subscription: Subscription) {
            subscription.request(1);
            self.subscription = Some(subscription);
        }
        fn on_next(&mut self, item: u32) {
            self.seen.lock().push(item);
            if let Some(subscription) = &self.subscription {
                subscription.request(1);
            }
        }
        fn on_error(&mut self, _error: FlowError) {}
        fn on_complete(&mut self) {
            self.seen.lock().push(u32::MAX);
        }
    }

    #[test]
    fn reentrant_requests_are_trampolined() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let subscriber = OneByOne {
            subscription: None,
            seen: seen.clone(),
        };
        Emitter::start(Box::new(subscriber), Counter { next: 0, limit: 1000 });

        let seen = seen.lock();
        assert_eq!(seen.len(), 1001);
        assert_eq!(seen[999], 999);
        assert_eq!(seen[1000], u32::MAX);
    }
}
