//! The `map` and `try_map` operators.

use crate::error::FlowError;
use crate::flux::{Flux, Publisher};
use crate::subscription::{BoxSubscriber, Subscriber, Subscription};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::debug;

type Transform<T, U> = Arc<dyn Fn(T) -> Result<U, FlowError> + Send + Sync>;

pub(crate) struct Map<T, U> {
    upstream: Flux<T>,
    transform: Transform<T, U>,
}

impl<T: Send + 'static, U: Send + 'static> Map<T, U> {
    /// A panic inside `f` becomes a `Transform` error.
    pub(crate) fn catching<F>(upstream: Flux<T>, f: F) -> Self
    where
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let transform = move |item: T| {
            catch_unwind(AssertUnwindSafe(|| f(item)))
                .map_err(|payload| FlowError::from_panic(payload.as_ref(), "transform panicked"))
        };
        Self {
            upstream,
            transform: Arc::new(transform),
        }
    }

    /// An `Err` from `f` becomes a `Transform` error.
    pub(crate) fn fallible<E, F>(upstream: Flux<T>, f: F) -> Self
    where
        E: fmt::Display,
        F: Fn(T) -> Result<U, E> + Send + Sync + 'static,
    {
        let transform = move |item: T| f(item).map_err(|err| FlowError::Transform(err.to_string()));
        Self {
            upstream,
            transform: Arc::new(transform),
        }
    }
}

impl<T: Send + 'static, U: Send + 'static> Publisher<U> for Map<T, U> {
    fn subscribe(&self, subscriber: BoxSubscriber<U>) {
        self.upstream.subscribe_boxed(Box::new(MapSubscriber {
            downstream: subscriber,
            transform: self.transform.clone(),
            upstream: None,
            done: false,
        }));
    }
}

struct MapSubscriber<T, U> {
    downstream: BoxSubscriber<U>,
    transform: Transform<T, U>,
    upstream: Option<Subscription>,
    done: bool,
}

impl<T: Send + 'static, U: Send + 'static> Subscriber<T> for MapSubscriber<T, U> {
    fn on_subscribe(&mut self, subscription: Subscription) {
        self.upstream = Some(subscription.clone());
        self.downstream.on_subscribe(subscription);
    }

    fn on_next(&mut self, item: T) {
        if self.done {
            return;
        }
        match (self.transform)(item) {
            Ok(mapped) => self.downstream.on_next(mapped),
            Err(error) => {
                debug!("map failed, cancelling upstream: {error}");
                self.done = true;
                self.downstream.on_error(error);
                if let Some(upstream) = self.upstream.take() {
                    upstream.cancel();
                }
            }
        }
    }

    fn on_error(&mut self, error: FlowError) {
        if !self.done {
            self.done = true;
            self.downstream.on_error(error);
        }
    }

    fn on_complete(&mut self) {
        if !self.done {
            self.done = true;
            self.downstream.on_complete();
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::error::ErrorKind;
    use crate::events::Signal;
    use crate::flux::Flux;
    use crate::subscription::tests::Probe;

    #[test]
    fn maps_each_item() {
        let probe = Probe::new(u64::MAX);
        let log = probe.log.clone();
        Flux::range(1, 3).map(|i| i * 10).subscribe_with(probe);
        let log = log.lock();
        assert!(matches!(
            &log[..],
            [Signal::Next(10), Signal::Next(20), Signal::Next(30), Signal::Complete]
        ));
    }

    #[test]
    fn try_map_error_keeps_earlier_items_and_stops() {
        let probe = Probe::new(u64::MAX);
        let log = probe.log.clone();
        Flux::range(1, 5)
            .try_map(|i| if i == 4 { Err(format!("bad item {i}")) } else { Ok(i) })
            .subscribe_with(probe);

        let log = log.lock();
        assert_eq!(log.len(), 4);
        assert!(matches!(&log[..3], [Signal::Next(1), Signal::Next(2), Signal::Next(3)]));
        match &log[3] {
            Signal::Error(e) => {
                assert_eq!(e.kind(), ErrorKind::Transform);
                assert!(e.to_string().contains("bad item 4"));
            }
            other => panic!("expected a transform error, got {other:?}"),
        }
    }

    #[test]
    fn panicking_transform_becomes_an_error() {
        let probe = Probe::new(u64::MAX);
        let log = probe.log.clone();
        Flux::range(1, 3)
            .map(|i| {
                if i == 2 {
                    panic!("two is not allowed");
                }
                i
            })
            .subscribe_with(probe);

        let log = log.lock();
        assert!(matches!(&log[0], Signal::Next(1)));
        assert!(matches!(&log[1], Signal::Error(e) if e.to_string().contains("two is not allowed")));
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn upstream_is_cancelled_after_a_failure() {
        let clock = crate::time::VirtualClock::new();
        let probe = Probe::new(u64::MAX);
        let log = probe.log.clone();
        Flux::interval_on(std::time::Duration::from_millis(5), std::sync::Arc::new(clock.clone()))
            .try_map(|tick| if tick == 1 { Err("boom") } else { Ok(tick) })
            .subscribe_with(probe);

        clock.advance(std::time::Duration::from_millis(50));
        assert_eq!(log.lock().len(), 2);
        assert_eq!(clock.pending_timers(), 0);
    }
}
