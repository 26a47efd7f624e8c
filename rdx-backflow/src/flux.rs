//! The `Flux` handle: a cloneable description of an item sequence.
//!
//! A `Flux` does nothing until it is subscribed to. Every subscription builds
//! its own chain of operator state and its own producer, so the same `Flux`
//! can be subscribed any number of times.

use crate::components::delay::DelayElements;
use crate::components::limit_rate::LimitRate;
use crate::components::log::Log;
use crate::components::map::Map;
use crate::components::producers::{Empty, Failed, FromSource, Interval, Range, Sequence};
use crate::components::take::Take;
use crate::config::{FlowConfig, OverflowPolicy};
use crate::error::FlowError;
use crate::hub::ConnectableFlux;
use crate::subscriber::{Disposable, LambdaSubscriber};
use crate::subscription::{BoxSubscriber, Source, Subscriber};
use crate::time::{ClockRef, RealClock};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Anything that can start a new subscription for a subscriber.
pub trait Publisher<T>: Send + Sync + 'static {
    fn subscribe(&self, subscriber: BoxSubscriber<T>);

    /// The policy applied to items produced while the consumer has no
    /// demand, for publishers that produce on their own schedule.
    fn overflow_policy(&self) -> Option<OverflowPolicy> {
        None
    }
}

/// A cold, cloneable stream description.
pub struct Flux<T> {
    publisher: Arc<dyn Publisher<T>>,
}

impl<T> Clone for Flux<T> {
    fn clone(&self) -> Self {
        Self {
            publisher: self.publisher.clone(),
        }
    }
}

impl<T: 'static> fmt::Debug for Flux<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flux")
            .field("overflow_policy", &self.publisher.overflow_policy())
            .finish()
    }
}

impl Flux<i64> {
    /// `count` consecutive integers starting at `start`.
    pub fn range(start: i64, count: u64) -> Self {
        Self::from_publisher(Range::new(start, count))
    }
}

impl Flux<u64> {
    /// Ticks `0, 1, 2, ...` every `period` on the real clock. A tick with no
    /// demand terminates the stream with an `Overflow` error.
    pub fn interval(period: Duration) -> Self {
        Self::interval_on(period, Arc::new(RealClock::current()))
    }

    /// Like [`Flux::interval`], scheduled on `clock`.
    pub fn interval_on(period: Duration, clock: ClockRef) -> Self {
        Self::interval_with(period, clock, OverflowPolicy::default())
    }

    /// Like [`Flux::interval_on`], with an explicit overflow policy.
    pub fn interval_with(period: Duration, clock: ClockRef, policy: OverflowPolicy) -> Self {
        Self::from_publisher(Interval::new(period, clock, policy))
    }
}

impl<T: Clone + Send + Sync + 'static> Flux<T> {
    /// Emits `items` in order, then completes.
    pub fn from_sequence(items: impl IntoIterator<Item = T>) -> Self {
        Self::from_publisher(Sequence::new(items.into_iter().collect()))
    }

    /// Alias of [`Flux::from_sequence`].
    pub fn just(items: impl IntoIterator<Item = T>) -> Self {
        Self::from_sequence(items)
    }
}

impl<T: Send + 'static> Flux<T> {
    /// Wraps a custom publisher.
    pub fn from_publisher(publisher: impl Publisher<T>) -> Self {
        Self {
            publisher: Arc::new(publisher),
        }
    }

    /// Builds a fresh [`Source`] for every subscription.
    ///
    /// This is the hook for producers backed by external collaborators: fetch
    /// from `pull`, emit while demand allows, and report transport failures
    /// with [`FlowError::upstream`].
    pub fn from_source<S, F>(factory: F) -> Self
    where
        S: Source<T>,
        F: Fn() -> S + Send + Sync + 'static,
    {
        Self::from_publisher(FromSource::new(factory))
    }

    /// Completes immediately.
    pub fn empty() -> Self {
        Self::from_publisher(Empty)
    }

    /// Fails immediately with `error`.
    pub fn error(error: FlowError) -> Self {
        Self::from_publisher(Failed::new(error))
    }

    pub fn overflow_policy(&self) -> Option<OverflowPolicy> {
        self.publisher.overflow_policy()
    }

    // --- Operators ---

    /// Transforms each item. A panic inside `f` terminates the stream with a
    /// `Transform` error and cancels upstream.
    pub fn map<U, F>(self, f: F) -> Flux<U>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        Flux::from_publisher(Map::catching(self, f))
    }

    /// Transforms each item with a fallible function. An `Err` terminates the
    /// stream with a `Transform` error and cancels upstream.
    pub fn try_map<U, E, F>(self, f: F) -> Flux<U>
    where
        U: Send + 'static,
        E: fmt::Display,
        F: Fn(T) -> Result<U, E> + Send + Sync + 'static,
    {
        Flux::from_publisher(Map::fallible(self, f))
    }

    /// Requests from upstream in chunks of at most `chunk` items.
    pub fn limit_rate(self, chunk: u64) -> Self {
        Flux::from_publisher(LimitRate::new(self, chunk))
    }

    /// Delays each item by `delay` on the real clock.
    pub fn delay_elements(self, delay: Duration) -> Self {
        self.delay_elements_on(delay, Arc::new(RealClock::current()))
    }

    /// Delays each item by `delay` on `clock`. Items are pulled one at a time,
    /// so consecutive items are spaced by `delay`.
    pub fn delay_elements_on(self, delay: Duration, clock: ClockRef) -> Self {
        Flux::from_publisher(DelayElements::new(self, delay, clock))
    }

    /// Forwards the first `n` items, then completes and cancels upstream.
    pub fn take(self, n: u64) -> Self {
        Flux::from_publisher(Take::new(self, n))
    }

    /// Logs every signal, request and cancellation at INFO.
    pub fn log(self) -> Self
    where
        T: fmt::Debug,
    {
        self.log_named("backflow.flux")
    }

    /// Like [`Flux::log`], under the given category.
    pub fn log_named(self, category: impl Into<String>) -> Self
    where
        T: fmt::Debug,
    {
        Flux::from_publisher(Log::new(self, category.into()))
    }

    /// Shares one upstream subscription among many subscribers. Nothing is
    /// requested from upstream until [`ConnectableFlux::connect`].
    pub fn publish(self) -> ConnectableFlux<T>
    where
        T: Clone,
    {
        ConnectableFlux::new(self, FlowConfig::default().hub_overflow)
    }

    /// Like [`Flux::publish`], with an explicit overflow policy for downstreams
    /// without demand.
    pub fn publish_with(self, policy: OverflowPolicy) -> ConnectableFlux<T>
    where
        T: Clone,
    {
        ConnectableFlux::new(self, policy)
    }

    // --- Consumers ---

    /// Subscribes a manual [`Subscriber`].
    pub fn subscribe_with(&self, subscriber: impl Subscriber<T>) {
        self.publisher.subscribe(Box::new(subscriber));
    }

    /// Subscribes with unlimited demand. Errors are logged.
    pub fn subscribe(&self, on_next: impl FnMut(T) + Send + 'static) -> Disposable {
        self.subscribe_lambda(LambdaSubscriber::new(Box::new(on_next), None, None))
    }

    /// Subscribes with unlimited demand and handlers for every signal.
    pub fn subscribe_all(
        &self,
        on_next: impl FnMut(T) + Send + 'static,
        on_error: impl FnMut(FlowError) + Send + 'static,
        on_complete: impl FnMut() + Send + 'static,
    ) -> Disposable {
        self.subscribe_lambda(LambdaSubscriber::new(
            Box::new(on_next),
            Some(Box::new(on_error)),
            Some(Box::new(on_complete)),
        ))
    }

    fn subscribe_lambda(&self, subscriber: LambdaSubscriber<T>) -> Disposable {
        let disposable = subscriber.disposable();
        self.subscribe_with(subscriber);
        disposable
    }

    pub(crate) fn subscribe_boxed(&self, subscriber: BoxSubscriber<T>) {
        self.publisher.subscribe(subscriber);
    }
}

impl<T: Clone + Send + 'static> From<ConnectableFlux<T>> for Flux<T> {
    fn from(hub: ConnectableFlux<T>) -> Self {
        hub.flux()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::time::VirtualClock;
    use parking_lot::Mutex;

    #[test]
    fn range_is_restartable() {
        let flux = Flux::range(3, 3);
        for _ in 0..2 {
            let seen = Arc::new(Mutex::new(Vec::new()));
            let sink = seen.clone();
            flux.subscribe(move |v| sink.lock().push(v));
            assert_eq!(*seen.lock(), vec![3, 4, 5]);
        }
    }

    #[test]
    fn subscribe_all_reports_completion_and_errors() {
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let (completed, failed) = (outcomes.clone(), outcomes.clone());
        Flux::<i64>::empty().subscribe_all(|_| {}, |_| {}, move || completed.lock().push(None));
        Flux::<i64>::error(FlowError::Protocol("bad".into())).subscribe_all(
            |_| {},
            move |err| failed.lock().push(Some(err.kind())),
            || {},
        );
        assert_eq!(*outcomes.lock(), vec![None, Some(ErrorKind::Protocol)]);
    }

    #[test]
    fn disposing_stops_an_interval() {
        let clock = VirtualClock::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let disposable = Flux::interval_on(Duration::from_millis(10), Arc::new(clock.clone()))
            .subscribe(move |v| sink.lock().push(v));

        clock.advance(Duration::from_millis(25));
        disposable.dispose();
        clock.advance(Duration::from_millis(100));

        assert_eq!(*seen.lock(), vec![0, 1]);
        assert!(disposable.is_disposed());
        assert_eq!(clock.pending_timers(), 0);
    }

    #[test]
    fn debug_shows_the_overflow_policy() {
        let clock: ClockRef = Arc::new(VirtualClock::new());
        let ticks = Flux::interval_with(Duration::from_millis(1), clock, OverflowPolicy::Drop);
        assert_eq!(format!("{ticks:?}"), "Flux { overflow_policy: Some(Drop) }");
        assert_eq!(format!("{:?}", Flux::range(0, 1)), "Flux { overflow_policy: None }");
    }

    #[test]
    fn interval_policy_is_queryable() {
        let clock: ClockRef = Arc::new(VirtualClock::new());
        let period = Duration::from_millis(1);
        assert_eq!(
            Flux::interval_on(period, clock.clone()).overflow_policy(),
            Some(OverflowPolicy::Error)
        );
        assert_eq!(
            Flux::interval_with(period, clock, OverflowPolicy::Drop).overflow_policy(),
            Some(OverflowPolicy::Drop)
        );
        assert_eq!(Flux::range(0, 1).overflow_policy(), None);
    }
}
