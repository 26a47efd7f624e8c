//! The `delay_elements` operator.
//!
//! Upstream is pulled one item at a time. Each item is held on a timer for the
//! configured delay and only then is the next one requested, which spaces
//! consecutive items by the delay.

use crate::error::FlowError;
use crate::flux::{Flux, Publisher};
use crate::subscription::{BoxSubscriber, Emitter, Source, Subscriber, Subscription};
use crate::time::{ClockRef, TimerHandle};
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::trace;

pub(crate) struct DelayElements<T> {
    upstream: Flux<T>,
    delay: Duration,
    clock: ClockRef,
}

impl<T> DelayElements<T> {
    pub(crate) fn new(upstream: Flux<T>, delay: Duration, clock: ClockRef) -> Self {
        Self {
            upstream,
            delay,
            clock,
        }
    }
}

impl<T: Send + 'static> Publisher<T> for DelayElements<T> {
    fn subscribe(&self, subscriber: BoxSubscriber<T>) {
        let shared = Arc::new(Shared {
            delay: self.delay,
            clock: self.clock.clone(),
            emitter: OnceLock::new(),
            state: Mutex::new(DelayState::default()),
        });
        let emitter = Emitter::start(
            subscriber,
            DelaySource {
                shared: shared.clone(),
            },
        );
        if !emitter.is_active() {
            return;
        }
        // Set before upstream exists, so no timer can fire without it.
        let _ = shared.emitter.set(emitter);
        self.upstream.subscribe_boxed(Box::new(DelaySubscriber { shared }));
    }
}

#[derive(Default)]
struct DelayState {
    upstream: Option<Subscription>,
    timer: Option<TimerHandle>,
    /// One item has been requested upstream and has not arrived.
    awaiting: bool,
    /// One item is sitting on a timer.
    scheduled: bool,
    /// Counts scheduled items, so a late handle never replaces a newer one.
    generation: u64,
    upstream_done: bool,
    cancelled: bool,
}

struct Shared<T> {
    delay: Duration,
    clock: ClockRef,
    emitter: OnceLock<Emitter<T>>,
    state: Mutex<DelayState>,
}

impl<T: Send + 'static> Shared<T> {
    /// Requests the next item when nothing is in flight and downstream wants
    /// one.
    fn pull_next(&self) {
        let Some(emitter) = self.emitter.get() else {
            return;
        };
        let upstream = {
            let mut state = self.state.lock();
            if state.awaiting
                || state.scheduled
                || state.upstream_done
                || state.cancelled
                || emitter.demand() == 0
            {
                return;
            }
            let Some(upstream) = state.upstream.clone() else {
                return;
            };
            state.awaiting = true;
            upstream
        };
        upstream.request(1);
    }

    fn arrived(self: &Arc<Self>, item: T, generation: u64) {
        let shared = self.clone();
        let handle = self
            .clock
            .schedule(self.delay, Box::new(move || shared.fire(item)));
        let mut state = self.state.lock();
        if state.scheduled && state.generation == generation {
            state.timer = Some(handle);
        }
    }

    fn fire(&self, item: T) {
        let complete = {
            let mut state = self.state.lock();
            state.scheduled = false;
            state.timer = None;
            state.upstream_done
        };
        let Some(emitter) = self.emitter.get() else {
            return;
        };
        emitter.try_emit(item);
        if complete {
            emitter.signal_complete();
        } else {
            self.pull_next();
        }
    }

    fn upstream_failed(&self, error: FlowError) {
        let timer = {
            let mut state = self.state.lock();
            state.upstream_done = true;
            state.scheduled = false;
            state.timer.take()
        };
        if let Some(timer) = timer {
            timer.cancel();
        }
        if let Some(emitter) = self.emitter.get() {
            emitter.signal_error(error);
        }
    }

    fn upstream_completed(&self) {
        let idle = {
            let mut state = self.state.lock();
            state.upstream_done = true;
            !state.scheduled
        };
        if idle {
            if let Some(emitter) = self.emitter.get() {
                emitter.signal_complete();
            }
        }
    }

    fn cancel(&self) {
        let (upstream, timer) = {
            let mut state = self.state.lock();
            state.cancelled = true;
            (state.upstream.take(), state.timer.take())
        };
        trace!("delay_elements cancelled");
        if let Some(timer) = timer {
            timer.cancel();
        }
        if let Some(upstream) = upstream {
            upstream.cancel();
        }
    }
}

struct DelaySource<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> Source<T> for DelaySource<T> {
    fn start(&mut self, emitter: &Emitter<T>) {
        let shared = self.shared.clone();
        emitter.on_cancel(move || shared.cancel());
    }

    fn pull(&mut self, _emitter: &Emitter<T>) {
        self.shared.pull_next();
    }
}

struct DelaySubscriber<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> Subscriber<T> for DelaySubscriber<T> {
    fn on_subscribe(&mut self, subscription: Subscription) {
        let cancelled = {
            let mut state = self.shared.state.lock();
            if !state.cancelled {
                state.upstream = Some(subscription.clone());
            }
            state.cancelled
        };
        if cancelled {
            subscription.cancel();
        } else {
            self.shared.pull_next();
        }
    }

    fn on_next(&mut self, item: T) {
        let generation = {
            let mut state = self.shared.state.lock();
            if state.cancelled || state.upstream_done {
                return;
            }
            state.awaiting = false;
            state.scheduled = true;
            state.generation += 1;
            state.generation
        };
        self.shared.arrived(item, generation);
    }

    fn on_error(&mut self, error: FlowError) {
        self.shared.upstream_failed(error);
    }

    fn on_complete(&mut self) {
        self.shared.upstream_completed();
    }
}

#[cfg(test)]
mod tests {
    use crate::error::{ErrorKind, FlowError};
    use crate::events::Signal;
    use crate::flux::Flux;
    use crate::subscription::tests::Probe;
    use crate::time::VirtualClock;
    use std::sync::Arc;
    use std::time::Duration;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn count_next<T>(log: &[Signal<T>]) -> usize {
        log.iter().filter(|s| matches!(s, Signal::Next(_))).count()
    }

    #[test]
    fn items_are_spaced_by_the_delay() {
        let clock = VirtualClock::new();
        let probe = Probe::new(u64::MAX);
        let log = probe.log.clone();
        Flux::range(1, 3)
            .delay_elements_on(ms(100), Arc::new(clock.clone()))
            .subscribe_with(probe);

        assert!(log.lock().is_empty());
        clock.advance(ms(100));
        assert_eq!(count_next(&log.lock()), 1);
        clock.advance(ms(99));
        assert_eq!(count_next(&log.lock()), 1);
        clock.advance(ms(1));
        assert_eq!(count_next(&log.lock()), 2);
        clock.advance(ms(100));

        let log = log.lock();
        assert!(matches!(
            &log[..],
            [Signal::Next(1), Signal::Next(2), Signal::Next(3), Signal::Complete]
        ));
    }

    #[test]
    fn completion_waits_for_the_pending_item() {
        let clock = VirtualClock::new();
        let probe = Probe::new(u64::MAX);
        let log = probe.log.clone();
        Flux::just([7])
            .delay_elements_on(ms(50), Arc::new(clock.clone()))
            .subscribe_with(probe);

        clock.advance(ms(49));
        assert!(log.lock().is_empty());
        clock.advance(ms(1));
        assert!(matches!(&log.lock()[..], [Signal::Next(7), Signal::Complete]));
    }

    #[test]
    fn respects_downstream_demand() {
        let clock = VirtualClock::new();
        let probe = Probe::new(1);
        let (log, sub) = (probe.log.clone(), probe.subscription.clone());
        Flux::range(0, 10)
            .delay_elements_on(ms(10), Arc::new(clock.clone()))
            .subscribe_with(probe);

        clock.advance(ms(500));
        assert_eq!(count_next(&log.lock()), 1);

        sub.lock().clone().unwrap().request(2);
        clock.advance(ms(500));
        assert_eq!(count_next(&log.lock()), 3);
    }

    #[test]
    fn upstream_error_cancels_the_pending_item() {
        let clock = VirtualClock::new();
        let probe = Probe::new(u64::MAX);
        let log = probe.log.clone();
        Flux::range(1, 3)
            .try_map(|i| if i == 2 { Err("nope") } else { Ok(i) })
            .delay_elements_on(ms(100), Arc::new(clock.clone()))
            .subscribe_with(probe);

        clock.advance(ms(100));
        // Item 1 was delivered; item 2 failed before its timer was armed.
        let log = log.lock();
        assert!(matches!(&log[0], Signal::Next(1)));
        assert!(matches!(&log[1], Signal::Error(e) if e.kind() == ErrorKind::Transform));
        assert_eq!(clock.pending_timers(), 0);
    }

    #[test]
    fn error_while_an_item_is_pending_discards_it() {
        let clock = VirtualClock::new();
        let probe = Probe::<u64>::new(u64::MAX);
        let log = probe.log.clone();
        Flux::interval_on(ms(10), Arc::new(clock.clone()))
            .delay_elements_on(ms(100), Arc::new(clock.clone()))
            .subscribe_with(probe);

        // Tick 0 arrives at 10ms and is held until 110ms. The interval
        // overflows at 20ms because only one item was requested from it.
        clock.advance(ms(200));
        let log = log.lock();
        assert_eq!(log.len(), 1);
        assert!(matches!(&log[0], Signal::Error(FlowError::Overflow(_))));
        assert_eq!(clock.pending_timers(), 0);
    }

    #[test]
    fn cancel_stops_timers_and_upstream() {
        let clock = VirtualClock::new();
        let probe = Probe::new(u64::MAX);
        let (log, sub) = (probe.log.clone(), probe.subscription.clone());
        Flux::range(1, 10)
            .delay_elements_on(ms(100), Arc::new(clock.clone()))
            .subscribe_with(probe);

        clock.advance(ms(150));
        sub.lock().clone().unwrap().cancel();
        clock.advance(ms(1000));

        assert_eq!(count_next(&log.lock()), 1);
        assert_eq!(clock.pending_timers(), 0);
    }
}
