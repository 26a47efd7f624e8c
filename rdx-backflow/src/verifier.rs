//! A scripted step verifier for testing pipelines.
//!
//! A [`Verifier`] subscribes to a `Flux`, records every signal it receives and
//! then checks an ordered script of expectations and actions against that
//! record. With a [`VirtualClock`] the script drives time itself and never
//! blocks: a signal that has not arrived when it is expected is a failure.
//! Against real time, the whole script must finish within the configured
//! timeout; expectations wait for their signals until that deadline.
//!
//! ```
//! use backflow::prelude::*;
//! use std::time::Duration;
//!
//! Verifier::with_virtual_time(|clock| Flux::interval_on(Duration::from_secs(1), clock).take(2))
//!     .expect_subscription()
//!     .expect_no_event(Duration::from_millis(999))
//!     .then_await(Duration::from_millis(1))
//!     .expect_next([0])
//!     .then_await(Duration::from_secs(1))
//!     .expect_next([1])
//!     .verify_complete()
//!     .unwrap();
//! ```

use crate::common::UNBOUNDED;
use crate::config::VerifierConfig;
use crate::error::{ErrorKind, FlowError, VerifyError};
use crate::events::Signal;
use crate::flux::Flux;
use crate::subscription::{Subscriber, Subscription};
use crate::time::{ClockRef, VirtualClock};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

type Predicate<T> = Box<dyn FnMut(&T) -> bool>;
type Action = Box<dyn FnOnce()>;

enum Step<T> {
    Subscription,
    Next(Vec<T>),
    NextCount(u64),
    ConsumeWhile(Predicate<T>),
    Error(Option<ErrorKind>),
    Complete,
    NoEvent(Duration),
    Await(Duration),
    Then(Action),
    Request(u64),
    Cancel,
}

impl<T: fmt::Debug> Step<T> {
    fn describe(&self) -> String {
        match self {
            Step::Subscription => "expectSubscription()".into(),
            Step::Next(values) => format!("expectNext({values:?})"),
            Step::NextCount(n) => format!("expectNextCount({n})"),
            Step::ConsumeWhile(_) => "thenConsumeWhile(..)".into(),
            Step::Error(Some(kind)) => format!("expectError({kind})"),
            Step::Error(None) => "expectError()".into(),
            Step::Complete => "expectComplete()".into(),
            Step::NoEvent(d) => format!("expectNoEvent({d:?})"),
            Step::Await(d) => format!("thenAwait({d:?})"),
            Step::Then(_) => "then(..)".into(),
            Step::Request(n) => format!("thenRequest({n})"),
            Step::Cancel => "thenCancel()".into(),
        }
    }
}

/// Builds and runs a verification script against one subscription.
pub struct Verifier<T> {
    flux: Flux<T>,
    clock: Option<VirtualClock>,
    steps: Vec<Step<T>>,
    initial_request: u64,
    timeout: Duration,
}

impl<T> Verifier<T>
where
    T: Clone + PartialEq + fmt::Debug + Send + 'static,
{
    /// Verifies `flux` against real time.
    pub fn create(flux: Flux<T>) -> Self {
        let defaults = VerifierConfig::default();
        Self {
            flux,
            clock: None,
            steps: Vec::new(),
            initial_request: defaults.initial_request.unwrap_or(UNBOUNDED),
            timeout: defaults.timeout(),
        }
    }

    /// Builds the flux on a fresh virtual clock that the script advances.
    pub fn with_virtual_time(supplier: impl FnOnce(ClockRef) -> Flux<T>) -> Self {
        let clock = VirtualClock::new();
        let flux = supplier(Arc::new(clock.clone()));
        Self::create(flux).with_virtual_clock(clock)
    }

    /// Drives `clock` for `then_await` and `expect_no_event`, and fails
    /// missing signals instead of waiting for them.
    pub fn with_virtual_clock(mut self, clock: VirtualClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Applies the timeout and initial request from configuration.
    pub fn configure(mut self, config: &VerifierConfig) -> Self {
        self.timeout = config.timeout();
        self.initial_request = config.initial_request.unwrap_or(UNBOUNDED);
        self
    }

    /// Demand requested on subscribe. Zero requests nothing.
    pub fn initial_request(mut self, n: u64) -> Self {
        self.initial_request = n;
        self
    }

    /// Bounds the whole real-time script.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn expect_subscription(mut self) -> Self {
        self.steps.push(Step::Subscription);
        self
    }

    pub fn expect_next(mut self, values: impl IntoIterator<Item = T>) -> Self {
        self.steps.push(Step::Next(values.into_iter().collect()));
        self
    }

    pub fn expect_next_count(mut self, n: u64) -> Self {
        self.steps.push(Step::NextCount(n));
        self
    }

    /// Consumes items for as long as `predicate` holds.
    pub fn then_consume_while(mut self, predicate: impl FnMut(&T) -> bool + 'static) -> Self {
        self.steps.push(Step::ConsumeWhile(Box::new(predicate)));
        self
    }

    pub fn expect_error(mut self, kind: ErrorKind) -> Self {
        self.steps.push(Step::Error(Some(kind)));
        self
    }

    /// Expects an error of any kind.
    pub fn expect_any_error(mut self) -> Self {
        self.steps.push(Step::Error(None));
        self
    }

    pub fn expect_complete(mut self) -> Self {
        self.steps.push(Step::Complete);
        self
    }

    /// Lets `duration` pass and fails if any signal arrives meanwhile.
    pub fn expect_no_event(mut self, duration: Duration) -> Self {
        self.steps.push(Step::NoEvent(duration));
        self
    }

    /// Lets `duration` pass: advances the virtual clock, or sleeps.
    pub fn then_await(mut self, duration: Duration) -> Self {
        self.steps.push(Step::Await(duration));
        self
    }

    /// Alias of [`Verifier::then_await`].
    pub fn advance_time(self, duration: Duration) -> Self {
        self.then_await(duration)
    }

    /// Runs an arbitrary action, e.g. connecting a hub.
    pub fn then(mut self, action: impl FnOnce() + 'static) -> Self {
        self.steps.push(Step::Then(Box::new(action)));
        self
    }

    pub fn then_request(mut self, n: u64) -> Self {
        self.steps.push(Step::Request(n));
        self
    }

    pub fn then_cancel(mut self) -> Self {
        self.steps.push(Step::Cancel);
        self
    }

    /// Shorthand for `expect_complete().verify()`.
    pub fn verify_complete(self) -> Result<Duration, VerifyError> {
        self.expect_complete().verify()
    }

    /// Shorthand for `expect_error(kind).verify()`.
    pub fn verify_error(self, kind: ErrorKind) -> Result<Duration, VerifyError> {
        self.expect_error(kind).verify()
    }

    /// Subscribes and runs the script. Returns the wall time it took.
    pub fn verify(self) -> Result<Duration, VerifyError> {
        let started = Instant::now();
        let journal = Arc::new(Journal::default());
        self.flux.subscribe_with(Recorder {
            journal: journal.clone(),
            initial_request: self.initial_request,
        });

        let mut run = Run {
            journal: &journal,
            clock: self.clock.as_ref(),
            timeout: self.timeout,
            deadline: started + self.timeout,
            cursor: 0,
            step: 0,
        };
        let total = self.steps.len();
        let mut outcome = Ok(());
        for (index, step) in self.steps.into_iter().enumerate() {
            run.step = index + 1;
            outcome = run.execute(step);
            if outcome.is_err() {
                break;
            }
        }
        if outcome.is_ok() {
            run.step = total + 1;
            outcome = run
                .within_deadline("end of script")
                .and_then(|()| run.expect_nothing_left());
        }

        if let Err(err) = &outcome {
            debug!("verification failed: {err}");
            journal.cancel();
        }
        outcome.map(|()| started.elapsed())
    }
}

#[derive(Clone)]
enum Entry<T> {
    Subscribed,
    Signal(Signal<T>),
}

impl<T: fmt::Debug> fmt::Display for Entry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entry::Subscribed => f.write_str("onSubscribe"),
            Entry::Signal(Signal::Next(item)) => write!(f, "onNext({item:?})"),
            Entry::Signal(Signal::Error(err)) => write!(f, "onError({}: {err})", err.kind()),
            Entry::Signal(Signal::Complete) => f.write_str("onComplete"),
        }
    }
}

/// What the recorder has seen so far.
struct Journal<T> {
    entries: Mutex<Vec<Entry<T>>>,
    arrived: Condvar,
    subscription: Mutex<Option<Subscription>>,
    cancelled: AtomicBool,
}

impl<T> Default for Journal<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            arrived: Condvar::new(),
            subscription: Mutex::new(None),
            cancelled: AtomicBool::new(false),
        }
    }
}

impl<T> Journal<T> {
    fn record(&self, entry: Entry<T>) {
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        self.entries.lock().push(entry);
        self.arrived.notify_all();
    }

    fn subscription(&self) -> Option<Subscription> {
        self.subscription.lock().clone()
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(subscription) = self.subscription() {
            subscription.cancel();
        }
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

struct Recorder<T> {
    journal: Arc<Journal<T>>,
    initial_request: u64,
}

impl<T: Send + 'static> Subscriber<T> for Recorder<T> {
    fn on_subscribe(&mut self, subscription: Subscription) {
        *self.journal.subscription.lock() = Some(subscription.clone());
        self.journal.record(Entry::Subscribed);
        if self.initial_request > 0 {
            subscription.request(self.initial_request);
        }
    }

    fn on_next(&mut self, item: T) {
        self.journal.record(Entry::Signal(Signal::Next(item)));
    }

    fn on_error(&mut self, error: FlowError) {
        self.journal.record(Entry::Signal(Signal::Error(error)));
    }

    fn on_complete(&mut self) {
        self.journal.record(Entry::Signal(Signal::Complete));
    }
}

/// Cursor over the journal while a script executes.
struct Run<'a, T> {
    journal: &'a Journal<T>,
    clock: Option<&'a VirtualClock>,
    timeout: Duration,
    deadline: Instant,
    cursor: usize,
    step: usize,
}

impl<T> Run<'_, T>
where
    T: Clone + PartialEq + fmt::Debug + Send + 'static,
{
    fn execute(&mut self, step: Step<T>) -> Result<(), VerifyError> {
        let expected = step.describe();
        match step {
            Step::Subscription => match self.entry(self.cursor, &expected)? {
                Some(Entry::Subscribed) => {
                    self.cursor += 1;
                    Ok(())
                }
                _ => Err(self.mismatch("onSubscribe".into())),
            },
            Step::Next(values) => {
                for value in values {
                    let wanted = format!("onNext({value:?}) in {expected}");
                    match self.next_signal(&wanted)? {
                        Signal::Next(item) if item == value => {}
                        _ => return Err(self.mismatch(wanted)),
                    }
                }
                Ok(())
            }
            Step::NextCount(n) => {
                for seen in 0..n {
                    let wanted = format!("onNext #{} in {expected}", seen + 1);
                    if !matches!(self.next_signal(&wanted)?, Signal::Next(_)) {
                        return Err(self.mismatch(wanted));
                    }
                }
                Ok(())
            }
            Step::ConsumeWhile(mut predicate) => {
                while let Some(Signal::Next(item)) = self.peek_signal(&expected)? {
                    if !predicate(&item) {
                        break;
                    }
                    self.cursor += 1;
                }
                Ok(())
            }
            Step::Error(kind) => match self.next_signal(&expected)? {
                Signal::Error(err) if kind.map_or(true, |kind| err.kind() == kind) => Ok(()),
                _ => Err(self.mismatch(expected)),
            },
            Step::Complete => match self.next_signal(&expected)? {
                Signal::Complete => Ok(()),
                _ => Err(self.mismatch(expected)),
            },
            Step::NoEvent(duration) => {
                let before = self.journal.len();
                self.pass_time(duration, &expected)?;
                if self.journal.len() > before {
                    return Err(self.mismatch(format!("no signal during {expected}")));
                }
                Ok(())
            }
            Step::Await(duration) => self.pass_time(duration, &expected),
            Step::Then(action) => {
                action();
                Ok(())
            }
            Step::Request(n) => {
                if let Some(subscription) = self.journal.subscription() {
                    subscription.request(n);
                }
                Ok(())
            }
            Step::Cancel => {
                self.journal.cancel();
                Ok(())
            }
        }
    }

    /// Advances the virtual clock, or sleeps without overrunning the deadline.
    fn pass_time(&self, duration: Duration, expected: &str) -> Result<(), VerifyError> {
        match self.clock {
            Some(clock) => {
                clock.advance(duration);
                Ok(())
            }
            None => {
                let remaining = self.deadline.saturating_duration_since(Instant::now());
                std::thread::sleep(duration.min(remaining));
                if duration > remaining {
                    return Err(self.timed_out(expected));
                }
                Ok(())
            }
        }
    }

    fn within_deadline(&self, expected: &str) -> Result<(), VerifyError> {
        if self.clock.is_none() && Instant::now() > self.deadline {
            return Err(self.timed_out(expected));
        }
        Ok(())
    }

    fn timed_out(&self, expected: &str) -> VerifyError {
        VerifyError::Timeout {
            after: self.timeout,
            expected: expected.to_string(),
            observed: self
                .journal
                .entries
                .lock()
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }

    /// The entry at `index`, waiting for it in real time. `None` means it has
    /// not arrived on a virtual clock.
    fn entry(&self, index: usize, expected: &str) -> Result<Option<Entry<T>>, VerifyError> {
        let mut entries = self.journal.entries.lock();
        loop {
            if let Some(entry) = entries.get(index) {
                return Ok(Some(entry.clone()));
            }
            if self.clock.is_some() {
                return Ok(None);
            }
            if self.journal.arrived.wait_until(&mut entries, self.deadline).timed_out()
                && entries.len() <= index
            {
                return Err(VerifyError::Timeout {
                    after: self.timeout,
                    expected: expected.to_string(),
                    observed: entries.iter().map(ToString::to_string).collect(),
                });
            }
        }
    }

    /// The next signal after the cursor, skipping the subscription marker,
    /// without consuming it.
    fn peek_signal(&mut self, expected: &str) -> Result<Option<Signal<T>>, VerifyError> {
        loop {
            match self.entry(self.cursor, expected)? {
                Some(Entry::Subscribed) => self.cursor += 1,
                Some(Entry::Signal(signal)) => return Ok(Some(signal)),
                None => return Ok(None),
            }
        }
    }

    fn next_signal(&mut self, expected: &str) -> Result<Signal<T>, VerifyError> {
        match self.peek_signal(expected)? {
            Some(signal) => {
                self.cursor += 1;
                Ok(signal)
            }
            None => Err(self.mismatch(expected.to_string())),
        }
    }

    fn expect_nothing_left(&mut self) -> Result<(), VerifyError> {
        let leftover = self.journal.entries.lock()[self.cursor..]
            .iter()
            .any(|entry| matches!(entry, Entry::Signal(_)));
        if leftover {
            return Err(self.mismatch("no further signals".into()));
        }
        Ok(())
    }

    fn mismatch(&self, expected: String) -> VerifyError {
        let observed = self
            .journal
            .entries
            .lock()
            .iter()
            .map(ToString::to_string)
            .collect();
        VerifyError::Assertion {
            step: self.step,
            expected,
            observed,
        }
    }
}
