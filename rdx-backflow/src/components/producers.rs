//! Source publishers: `range`, sequences, `interval`, and the trivial ones.

use crate::config::OverflowPolicy;
use crate::error::FlowError;
use crate::flux::Publisher;
use crate::subscription::{BoxSubscriber, Emitter, Source};
use crate::time::{ClockRef, TimerHandle};
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

// --- range ---

pub(crate) struct Range {
    start: i64,
    count: u64,
}

impl Range {
    pub(crate) fn new(start: i64, count: u64) -> Self {
        Self { start, count }
    }
}

impl Publisher<i64> for Range {
    fn subscribe(&self, subscriber: BoxSubscriber<i64>) {
        let source = RangeSource {
            start: self.start,
            count: self.count,
            emitted: 0,
        };
        Emitter::start(subscriber, source);
    }
}

struct RangeSource {
    start: i64,
    count: u64,
    emitted: u64,
}

impl Source<i64> for RangeSource {
    fn start(&mut self, emitter: &Emitter<i64>) {
        if self.count == 0 {
            emitter.signal_complete();
        }
    }

    fn pull(&mut self, emitter: &Emitter<i64>) {
        while self.emitted < self.count {
            let Some(value) = self.start.checked_add_unsigned(self.emitted) else {
                emitter.signal_error(FlowError::Overflow(format!(
                    "range value {} + {} exceeds i64::MAX",
                    self.start, self.emitted
                )));
                return;
            };
            if !emitter.try_emit(value) {
                return;
            }
            self.emitted += 1;
        }
        emitter.signal_complete();
    }
}

// --- from_sequence / just ---

pub(crate) struct Sequence<T> {
    items: Arc<[T]>,
}

impl<T> Sequence<T> {
    pub(crate) fn new(items: Vec<T>) -> Self {
        Self {
            items: items.into(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Publisher<T> for Sequence<T> {
    fn subscribe(&self, subscriber: BoxSubscriber<T>) {
        let source = SequenceSource {
            items: self.items.clone(),
            index: 0,
        };
        Emitter::start(subscriber, source);
    }
}

struct SequenceSource<T> {
    items: Arc<[T]>,
    index: usize,
}

impl<T: Clone + Send + Sync + 'static> Source<T> for SequenceSource<T> {
    fn pull(&mut self, emitter: &Emitter<T>) {
        while let Some(item) = self.items.get(self.index) {
            if !emitter.try_emit(item.clone()) {
                return;
            }
            self.index += 1;
        }
        emitter.signal_complete();
    }
}

// --- empty / error ---

pub(crate) struct Empty;

impl<T: Send + 'static> Publisher<T> for Empty {
    fn subscribe(&self, subscriber: BoxSubscriber<T>) {
        Emitter::start(subscriber, Finished(None));
    }
}

pub(crate) struct Failed {
    error: FlowError,
}

impl Failed {
    pub(crate) fn new(error: FlowError) -> Self {
        Self { error }
    }
}

impl<T: Send + 'static> Publisher<T> for Failed {
    fn subscribe(&self, subscriber: BoxSubscriber<T>) {
        Emitter::start(subscriber, Finished(Some(self.error.clone())));
    }
}

/// Terminates on start, without waiting for demand.
struct Finished(Option<FlowError>);

impl<T: Send + 'static> Source<T> for Finished {
    fn start(&mut self, emitter: &Emitter<T>) {
        match self.0.take() {
            Some(error) => emitter.signal_error(error),
            None => emitter.signal_complete(),
        };
    }

    fn pull(&mut self, _emitter: &Emitter<T>) {}
}

// --- from_source ---

pub(crate) struct FromSource<T, F> {
    factory: F,
    _item: PhantomData<fn() -> T>,
}

impl<T, F> FromSource<T, F> {
    pub(crate) fn new(factory: F) -> Self {
        Self {
            factory,
            _item: PhantomData,
        }
    }
}

impl<T, S, F> Publisher<T> for FromSource<T, F>
where
    T: Send + 'static,
    S: Source<T>,
    F: Fn() -> S + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: BoxSubscriber<T>) {
        Emitter::start(subscriber, (self.factory)());
    }
}

// --- interval ---

pub(crate) struct Interval {
    period: Duration,
    clock: ClockRef,
    policy: OverflowPolicy,
}

impl Interval {
    pub(crate) fn new(period: Duration, clock: ClockRef, policy: OverflowPolicy) -> Self {
        Self {
            period,
            clock,
            policy,
        }
    }
}

impl Publisher<u64> for Interval {
    fn subscribe(&self, subscriber: BoxSubscriber<u64>) {
        let source = IntervalSource {
            period: self.period,
            clock: self.clock.clone(),
            policy: self.policy,
        };
        Emitter::start(subscriber, source);
    }

    fn overflow_policy(&self) -> Option<OverflowPolicy> {
        Some(self.policy)
    }
}

struct IntervalSource {
    period: Duration,
    clock: ClockRef,
    policy: OverflowPolicy,
}

impl Source<u64> for IntervalSource {
    fn start(&mut self, emitter: &Emitter<u64>) {
        if self.period.is_zero() {
            emitter.signal_error(FlowError::Protocol(
                "interval period must be greater than zero".into(),
            ));
            return;
        }
        let ticker = Arc::new(Ticker {
            emitter: emitter.clone(),
            clock: self.clock.clone(),
            period: self.period,
            policy: self.policy,
            timer: Mutex::new(None),
        });
        let origin = self.clock.now();
        ticker.arm(0, origin + self.period);
        let hook = ticker.clone();
        emitter.on_cancel(move || hook.disarm());
    }

    /// Ticks are driven by the clock, not by demand.
    fn pull(&mut self, _emitter: &Emitter<u64>) {}
}

/// Schedules tick `k` at `origin + (k + 1) * period`.
struct Ticker {
    emitter: Emitter<u64>,
    clock: ClockRef,
    period: Duration,
    policy: OverflowPolicy,
    timer: Mutex<Option<TimerHandle>>,
}

impl Ticker {
    fn arm(self: &Arc<Self>, tick: u64, due: Duration) {
        let delay = due.saturating_sub(self.clock.now());
        let ticker = self.clone();
        let handle = self
            .clock
            .schedule(delay, Box::new(move || ticker.fire(tick, due)));
        *self.timer.lock() = Some(handle);
    }

    fn fire(self: &Arc<Self>, tick: u64, due: Duration) {
        if !self.emitter.is_active() {
            return;
        }
        if !self.emitter.try_emit(tick) {
            if !self.emitter.is_active() {
                return;
            }
            match self.policy {
                OverflowPolicy::Error => {
                    debug!(tick, "interval overflow: no demand");
                    self.emitter.signal_error(FlowError::Overflow(format!(
                        "could not emit tick {tick} due to lack of requests"
                    )));
                    return;
                }
                OverflowPolicy::Drop => trace!(tick, "interval tick dropped: no demand"),
            }
        }
        if self.emitter.is_active() {
            self.arm(tick + 1, due + self.period);
        }
    }

    fn disarm(&self) {
        let timer = self.timer.lock().take();
        if let Some(timer) = timer {
            timer.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::events::Signal;
    use crate::flux::Flux;
    use crate::subscription::tests::Probe;
    use crate::time::VirtualClock;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn values<T: Clone>(log: &[Signal<T>]) -> Vec<T> {
        log.iter()
            .filter_map(|s| match s {
                Signal::Next(v) => Some(v.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn range_emits_lazily_per_request() {
        let probe = Probe::new(2);
        let (log, sub) = (probe.log.clone(), probe.subscription.clone());
        Flux::range(10, 5).subscribe_with(probe);
        assert_eq!(values(&log.lock()), vec![10, 11]);

        sub.lock().clone().unwrap().request(2);
        assert_eq!(values(&log.lock()), vec![10, 11, 12, 13]);
        assert!(!log.lock().iter().any(Signal::is_terminal));

        sub.lock().clone().unwrap().request(1);
        let log = log.lock();
        assert_eq!(values(&log), vec![10, 11, 12, 13, 14]);
        assert!(matches!(log.last(), Some(Signal::Complete)));
    }

    #[test]
    fn empty_range_completes_without_demand() {
        let probe = Probe::<i64>::new(0);
        let log = probe.log.clone();
        Flux::range(0, 0).subscribe_with(probe);
        let log = log.lock();
        assert_eq!(log.len(), 1);
        assert!(matches!(log[0], Signal::Complete));
    }

    #[test]
    fn range_past_i64_max_overflows() {
        let probe = Probe::new(u64::MAX);
        let log = probe.log.clone();
        Flux::range(i64::MAX - 1, 3).subscribe_with(probe);
        let log = log.lock();
        assert_eq!(values(&log), vec![i64::MAX - 1, i64::MAX]);
        assert!(matches!(log.last(), Some(Signal::Error(e)) if e.kind() == ErrorKind::Overflow));
    }

    #[test]
    fn sequence_respects_demand() {
        let probe = Probe::new(1);
        let (log, sub) = (probe.log.clone(), probe.subscription.clone());
        Flux::just(["a", "b", "c"]).subscribe_with(probe);
        assert_eq!(values(&log.lock()), vec!["a"]);
        sub.lock().clone().unwrap().request(5);
        let log = log.lock();
        assert_eq!(values(&log), vec!["a", "b", "c"]);
        assert!(matches!(log.last(), Some(Signal::Complete)));
    }

    #[test]
    fn error_publisher_fails_without_demand() {
        let probe = Probe::<u8>::new(0);
        let log = probe.log.clone();
        Flux::error(FlowError::upstream(anyhow::anyhow!("connection reset"))).subscribe_with(probe);
        let log = log.lock();
        assert!(matches!(&log[..], [Signal::Error(e)] if e.kind() == ErrorKind::Upstream));
    }

    #[test]
    fn interval_ticks_at_multiples_of_period() {
        let clock = VirtualClock::new();
        let probe = Probe::new(u64::MAX);
        let log = probe.log.clone();
        Flux::interval_on(ms(100), Arc::new(clock.clone())).subscribe_with(probe);

        clock.advance(ms(99));
        assert!(log.lock().is_empty());
        clock.advance(ms(1));
        assert_eq!(values(&log.lock()), vec![0]);
        clock.advance(ms(250));
        assert_eq!(values(&log.lock()), vec![0, 1, 2]);
    }

    #[test]
    fn zero_period_interval_is_rejected() {
        let clock = VirtualClock::new();
        let probe = Probe::new(u64::MAX);
        let log = probe.log.clone();
        Flux::interval_on(Duration::ZERO, Arc::new(clock.clone())).subscribe_with(probe);

        assert_eq!(clock.advance(ms(1)), 0);
        assert_eq!(clock.pending_timers(), 0);
        assert!(matches!(&log.lock()[..], [Signal::Error(e)] if e.kind() == ErrorKind::Protocol));
    }

    #[test]
    fn interval_without_demand_overflows_by_default() {
        let clock = VirtualClock::new();
        let probe = Probe::new(2);
        let log = probe.log.clone();
        Flux::interval_on(ms(10), Arc::new(clock.clone())).subscribe_with(probe);

        clock.advance(ms(100));
        let log = log.lock();
        assert_eq!(values(&log), vec![0, 1]);
        assert!(matches!(log.last(), Some(Signal::Error(e)) if e.kind() == ErrorKind::Overflow));
        assert_eq!(clock.pending_timers(), 0);
    }

    #[test]
    fn interval_drop_policy_skips_ticks() {
        let clock = VirtualClock::new();
        let probe = Probe::new(1);
        let (log, sub) = (probe.log.clone(), probe.subscription.clone());
        Flux::interval_with(ms(10), Arc::new(clock.clone()), OverflowPolicy::Drop)
            .subscribe_with(probe);

        clock.advance(ms(35));
        sub.lock().clone().unwrap().request(1);
        clock.advance(ms(10));

        assert_eq!(values(&log.lock()), vec![0, 3]);
        assert!(!log.lock().iter().any(Signal::is_terminal));
    }
}
