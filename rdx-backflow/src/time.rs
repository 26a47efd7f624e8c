//! Time sources for timer-driven producers and operators.
//!
//! Every time-based publisher (`interval`) and operator (`delay_elements`)
//! takes its clock by injection, so the same pipeline can run against real
//! time or against a [`VirtualClock`] that a test advances by hand.
//!
//! - [`RealClock`] delegates to tokio timers. It uses the caller's runtime when
//!   there is one, and otherwise a small shared background runtime.
//! - [`VirtualClock`] holds a queue of pending callbacks ordered by fire time
//!   (ties broken by schedule order) and only moves when [`VirtualClock::advance`]
//!   is called.

use crate::common::TimerId;
use parking_lot::Mutex;
use slotmap::SlotMap;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::{Handle, Runtime};
use tracing::{trace, warn};

/// Callbacks a single `advance` may run at one instant before it gives up.
/// A callback that keeps rescheduling itself with zero delay would otherwise
/// never let time move.
const SAME_INSTANT_LIMIT: usize = 65_536;

/// A callback scheduled on a clock.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A shared, type-erased clock.
pub type ClockRef = Arc<dyn Clock>;

/// A source of logical time that can run callbacks after a delay.
pub trait Clock: Send + Sync {
    /// Time elapsed since the clock's origin.
    fn now(&self) -> Duration;

    /// Runs `task` once `delay` has elapsed on this clock.
    ///
    /// Dropping the returned handle does not cancel the timer.
    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle;
}

/// Cancels a scheduled callback.
pub struct TimerHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl TimerHandle {
    pub(crate) fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Prevents the callback from running if it has not started yet.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle")
            .field("armed", &self.cancel.is_some())
            .finish()
    }
}

// --- Virtual time ---

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Pending {
    fire_at: Duration,
    seq: u64,
    id: TimerId,
}

#[derive(Default)]
struct VirtualState {
    now: Duration,
    seq: u64,
    timers: SlotMap<TimerId, Task>,
    queue: BinaryHeap<Reverse<Pending>>,
}

impl VirtualState {
    /// Pops the earliest live timer due at or before `target`.
    fn next_due(&mut self, target: Duration) -> Option<(Duration, Task)> {
        while let Some(Reverse(head)) = self.queue.peek() {
            if head.fire_at > target {
                return None;
            }
            let Some(Reverse(head)) = self.queue.pop() else {
                return None;
            };
            // Cancelled timers leave a stale queue entry behind.
            if let Some(task) = self.timers.remove(head.id) {
                return Some((head.fire_at, task));
            }
        }
        None
    }
}

/// A manually advanced clock for deterministic tests.
///
/// Cloning yields another handle to the same clock.
#[derive(Clone, Default)]
pub struct VirtualClock {
    state: Arc<Mutex<VirtualState>>,
}

impl VirtualClock {
    /// Creates a clock at time zero with an empty timer queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves time forward by `delta`, running every callback that falls due.
    ///
    /// Callbacks run in fire-time order with the clock set to their fire time,
    /// and without the clock's lock held, so they may schedule further timers.
    /// Those fire within this same call when they fall inside the window.
    /// If callbacks keep rescheduling at the same instant, the clock stops
    /// there after a bounded number of runs. Returns the number of callbacks run.
    pub fn advance(&self, delta: Duration) -> usize {
        let target = self.state.lock().now.saturating_add(delta);
        self.run_until(target)
    }

    /// Moves time forward to `target`. Does nothing if `target` is in the past.
    pub fn advance_to(&self, target: Duration) -> usize {
        self.run_until(target)
    }

    /// Number of callbacks still waiting to fire.
    pub fn pending_timers(&self) -> usize {
        self.state.lock().timers.len()
    }

    fn run_until(&self, target: Duration) -> usize {
        let mut fired = 0;
        let mut instant = None;
        let mut at_instant = 0;
        loop {
            let due = {
                let mut state = self.state.lock();
                if at_instant >= SAME_INSTANT_LIMIT {
                    warn!(now = ?state.now, "virtual clock stalled: timers keep firing at the same instant");
                    break;
                }
                match state.next_due(target) {
                    Some((fire_at, task)) => {
                        if instant == Some(fire_at) {
                            at_instant += 1;
                        } else {
                            instant = Some(fire_at);
                            at_instant = 1;
                        }
                        state.now = state.now.max(fire_at);
                        Some(task)
                    }
                    None => {
                        state.now = state.now.max(target);
                        None
                    }
                }
            };
            match due {
                Some(task) => {
                    task();
                    fired += 1;
                }
                None => break,
            }
        }
        trace!(fired, ?target, "virtual clock advanced");
        fired
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> Duration {
        self.state.lock().now
    }

    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle {
        let id = {
            let mut state = self.state.lock();
            let fire_at = state.now.saturating_add(delay);
            let id = state.timers.insert(task);
            state.seq += 1;
            let seq = state.seq;
            state.queue.push(Reverse(Pending { fire_at, seq, id }));
            id
        };
        let state: Weak<Mutex<VirtualState>> = Arc::downgrade(&self.state);
        TimerHandle::new(move || {
            if let Some(state) = state.upgrade() {
                // The removed task is dropped after the lock is released.
                let removed = state.lock().timers.remove(id);
                drop(removed);
            }
        })
    }
}

impl std::fmt::Debug for VirtualClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("VirtualClock")
            .field("now", &state.now)
            .field("pending", &state.timers.len())
            .finish()
    }
}

// --- Real time ---

#[derive(Clone)]
enum Driver {
    Tokio(Handle),
    Threads,
}

/// A wall-clock time source backed by tokio timers.
#[derive(Clone)]
pub struct RealClock {
    driver: Driver,
    origin: Instant,
}

impl RealClock {
    /// Creates a clock whose timers run on the given runtime.
    pub fn with_handle(handle: Handle) -> Self {
        Self {
            driver: Driver::Tokio(handle),
            origin: Instant::now(),
        }
    }

    /// Creates a clock on the caller's tokio runtime, or on the shared
    /// background runtime when called outside of one.
    pub fn current() -> Self {
        let driver = match Handle::try_current() {
            Ok(handle) => Driver::Tokio(handle),
            Err(_) => match background_runtime() {
                Some(runtime) => Driver::Tokio(runtime.handle().clone()),
                None => Driver::Threads,
            },
        };
        Self {
            driver,
            origin: Instant::now(),
        }
    }
}

fn background_runtime() -> Option<&'static Runtime> {
    static RUNTIME: OnceLock<Option<Runtime>> = OnceLock::new();
    RUNTIME
        .get_or_init(|| {
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .thread_name("backflow-timer")
                .enable_time()
                .build()
                .map_err(|err| warn!("falling back to timer threads: {err}"))
                .ok()
        })
        .as_ref()
}

impl Clock for RealClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle {
        match &self.driver {
            Driver::Tokio(handle) => {
                let join = handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    task();
                });
                TimerHandle::new(move || join.abort())
            }
            Driver::Threads => {
                let cancelled = Arc::new(AtomicBool::new(false));
                let flag = cancelled.clone();
                std::thread::spawn(move || {
                    std::thread::sleep(delay);
                    if !flag.load(Ordering::Acquire) {
                        task();
                    }
                });
                TimerHandle::new(move || cancelled.store(true, Ordering::Release))
            }
        }
    }
}

impl std::fmt::Debug for RealClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let driver = match self.driver {
            Driver::Tokio(_) => "tokio",
            Driver::Threads => "threads",
        };
        f.debug_struct("RealClock")
            .field("driver", &driver)
            .field("elapsed", &self.origin.elapsed())
            .finish()
    }
}
