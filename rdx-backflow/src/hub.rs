//! Multicast: one upstream subscription shared by many downstreams.
//!
//! A [`ConnectableFlux`] is a hub. Downstream subscribers attach to it at any
//! time, but nothing is requested from upstream until the hub is connected,
//! either manually with [`ConnectableFlux::connect`] or automatically once
//! enough subscribers have attached ([`ConnectableFlux::auto_connect`]).
//!
//! Once connected, the hub requests unbounded demand from upstream and fans
//! each item out to the attached downstreams in attach order. Each downstream
//! keeps its own demand: a downstream with none is handled by the hub's
//! [`OverflowPolicy`]. Late subscribers only see what happens after they
//! attach; nothing is replayed.

use crate::common::SubscriberId;
use crate::config::OverflowPolicy;
use crate::error::FlowError;
use crate::events::Terminal;
use crate::flux::{Flux, Publisher};
use crate::subscription::{BoxSubscriber, Emitter, Source, Subscriber, Subscription};
use parking_lot::Mutex;
use slotmap::SlotMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

/// Lifecycle of a hub's shared upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubPhase {
    Idle,
    Connecting,
    Connected,
    Terminated,
}

struct HubState<T> {
    phase: HubPhase,
    downstreams: SlotMap<SubscriberId, Emitter<T>>,
    /// Attach order of `downstreams`.
    order: Vec<SubscriberId>,
    upstream: Option<Subscription>,
    terminal: Option<Terminal>,
    /// Bumped on every connect and dispose, so signals from an abandoned
    /// upstream subscription are ignored.
    activation: u64,
}

struct Hub<T> {
    source: Flux<T>,
    policy: OverflowPolicy,
    state: Mutex<HubState<T>>,
    me: Weak<Hub<T>>,
}

/// A hot stream handle wrapping a shared upstream.
pub struct ConnectableFlux<T> {
    hub: Arc<Hub<T>>,
}

impl<T> Clone for ConnectableFlux<T> {
    fn clone(&self) -> Self {
        Self {
            hub: self.hub.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> ConnectableFlux<T> {
    pub(crate) fn new(source: Flux<T>, policy: OverflowPolicy) -> Self {
        let hub = Arc::new_cyclic(|me| Hub {
            source,
            policy,
            state: Mutex::new(HubState {
                phase: HubPhase::Idle,
                downstreams: SlotMap::with_key(),
                order: Vec::new(),
                upstream: None,
                terminal: None,
                activation: 0,
            }),
            me: me.clone(),
        });
        Self { hub }
    }

    /// Subscribes the shared upstream. A no-op while already connecting or
    /// connected; after the upstream has terminated it starts a new
    /// activation.
    pub fn connect(&self) -> Connection<T> {
        self.hub.connect()
    }

    /// A `Flux` that connects this hub once `subscribers` downstreams have
    /// attached through it. Zero connects immediately.
    pub fn auto_connect(&self, subscribers: usize) -> Flux<T> {
        let auto = AutoConnect {
            hub: self.hub.clone(),
            threshold: subscribers,
            attached: AtomicUsize::new(0),
            fired: AtomicBool::new(false),
        };
        if subscribers == 0 {
            auto.fired.store(true, Ordering::Release);
            self.hub.connect();
        }
        Flux::from_publisher(auto)
    }

    /// A `Flux` that attaches to this hub without connecting it.
    pub fn flux(&self) -> Flux<T> {
        Flux::from_publisher(HubFlux {
            hub: self.hub.clone(),
        })
    }

    pub fn subscribe_with(&self, subscriber: impl Subscriber<T>) {
        self.hub.attach(Box::new(subscriber));
    }

    pub fn phase(&self) -> HubPhase {
        self.hub.state.lock().phase
    }

    /// Number of downstreams currently attached.
    pub fn subscriber_count(&self) -> usize {
        self.hub.state.lock().downstreams.len()
    }

    pub fn overflow_policy(&self) -> OverflowPolicy {
        self.hub.policy
    }
}

/// Handle on one activation of a hub.
pub struct Connection<T> {
    hub: Weak<Hub<T>>,
    activation: u64,
}

impl<T: Clone + Send + 'static> Connection<T> {
    /// Cancels the shared upstream and returns the hub to `Idle`. Attached
    /// downstreams stay attached and receive no terminal signal. Does nothing
    /// if this activation has already ended.
    pub fn dispose(&self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.disconnect(self.activation);
        }
    }
}

impl<T: Clone + Send + 'static> Hub<T> {
    fn connect(&self) -> Connection<T> {
        let activation = {
            let mut state = self.state.lock();
            match state.phase {
                HubPhase::Connecting | HubPhase::Connected => {
                    return Connection {
                        hub: self.me.clone(),
                        activation: state.activation,
                    };
                }
                HubPhase::Idle | HubPhase::Terminated => {
                    state.phase = HubPhase::Connecting;
                    state.terminal = None;
                    state.activation += 1;
                    state.activation
                }
            }
        };
        debug!(activation, "hub connecting");
        if let Some(hub) = self.me.upgrade() {
            self.source.subscribe_with(Inlet { hub, activation });
        }
        Connection {
            hub: self.me.clone(),
            activation,
        }
    }

    fn disconnect(&self, activation: u64) {
        let upstream = {
            let mut state = self.state.lock();
            if state.activation != activation
                || !matches!(state.phase, HubPhase::Connecting | HubPhase::Connected)
            {
                return;
            }
            state.phase = HubPhase::Idle;
            state.activation += 1;
            state.upstream.take()
        };
        debug!(activation, "hub disconnected");
        if let Some(upstream) = upstream {
            upstream.cancel();
        }
    }

    fn attach(&self, subscriber: BoxSubscriber<T>) {
        let emitter = Emitter::start(subscriber, Relay);
        if !emitter.is_active() {
            return;
        }
        let registered = {
            let mut state = self.state.lock();
            match (state.phase, state.terminal.clone()) {
                (HubPhase::Terminated, Some(terminal)) => Err(terminal),
                _ => {
                    let id = state.downstreams.insert(emitter.clone());
                    state.order.push(id);
                    Ok(id)
                }
            }
        };
        match registered {
            Ok(id) => {
                trace!(?id, "downstream attached to hub");
                let hub = self.me.clone();
                emitter.on_cancel(move || {
                    if let Some(hub) = hub.upgrade() {
                        hub.detach(id);
                    }
                });
            }
            Err(terminal) => {
                trace!("downstream attached after termination");
                finish(&emitter, terminal);
            }
        }
    }

    fn detach(&self, id: SubscriberId) {
        let mut state = self.state.lock();
        if state.downstreams.remove(id).is_some() {
            state.order.retain(|attached| *attached != id);
            trace!(?id, "downstream detached from hub");
        }
    }

    /// Snapshot of the live downstreams, in attach order, for `activation`.
    fn targets(&self, activation: u64) -> Option<Vec<(SubscriberId, Emitter<T>)>> {
        let state = self.state.lock();
        if state.activation != activation {
            return None;
        }
        let targets = state
            .order
            .iter()
            .filter_map(|id| state.downstreams.get(*id).map(|e| (*id, e.clone())))
            .collect();
        Some(targets)
    }

    fn broadcast(&self, activation: u64, item: T) {
        let Some(targets) = self.targets(activation) else {
            return;
        };
        for (id, emitter) in targets {
            if emitter.try_emit(item.clone()) || !emitter.is_active() {
                continue;
            }
            match self.policy {
                OverflowPolicy::Drop => trace!(?id, "downstream has no demand, item dropped"),
                OverflowPolicy::Error => {
                    debug!(?id, "downstream has no demand, terminating it");
                    self.detach(id);
                    emitter.signal_error(FlowError::Overflow(
                        "hub item arrived for a subscriber without demand".into(),
                    ));
                }
            }
        }
    }

    fn terminate(&self, activation: u64, terminal: Terminal) {
        let targets = {
            let mut state = self.state.lock();
            if state.activation != activation {
                return;
            }
            state.phase = HubPhase::Terminated;
            state.terminal = Some(terminal.clone());
            state.upstream = None;
            let order = std::mem::take(&mut state.order);
            let mut targets = Vec::with_capacity(order.len());
            for id in order {
                if let Some(emitter) = state.downstreams.remove(id) {
                    targets.push(emitter);
                }
            }
            state.downstreams.clear();
            targets
        };
        debug!(downstreams = targets.len(), "hub terminated");
        for emitter in targets {
            finish(&emitter, terminal.clone());
        }
    }
}

fn finish<T: Send + 'static>(emitter: &Emitter<T>, terminal: Terminal) {
    match terminal {
        Terminal::Error(error) => emitter.signal_error(error),
        Terminal::Complete => emitter.signal_complete(),
    };
}

/// The hub's own subscriber on the shared upstream.
struct Inlet<T> {
    hub: Arc<Hub<T>>,
    activation: u64,
}

impl<T: Clone + Send + 'static> Subscriber<T> for Inlet<T> {
    fn on_subscribe(&mut self, subscription: Subscription) {
        let current = {
            let mut state = self.hub.state.lock();
            let current = state.activation == self.activation;
            if current {
                state.upstream = Some(subscription.clone());
                state.phase = HubPhase::Connected;
            }
            current
        };
        if current {
            debug!(activation = self.activation, "hub connected");
            subscription.request_unbounded();
        } else {
            subscription.cancel();
        }
    }

    fn on_next(&mut self, item: T) {
        self.hub.broadcast(self.activation, item);
    }

    fn on_error(&mut self, error: FlowError) {
        self.hub.terminate(self.activation, Terminal::Error(error));
    }

    fn on_complete(&mut self) {
        self.hub.terminate(self.activation, Terminal::Complete);
    }
}

/// Downstream sources are fed by the hub, never pulled.
struct Relay;

impl<T: Send + 'static> Source<T> for Relay {
    fn pull(&mut self, _emitter: &Emitter<T>) {}
}

struct HubFlux<T> {
    hub: Arc<Hub<T>>,
}

impl<T: Clone + Send + 'static> Publisher<T> for HubFlux<T> {
    fn subscribe(&self, subscriber: BoxSubscriber<T>) {
        self.hub.attach(subscriber);
    }

    fn overflow_policy(&self) -> Option<OverflowPolicy> {
        Some(self.hub.policy)
    }
}

struct AutoConnect<T> {
    hub: Arc<Hub<T>>,
    threshold: usize,
    attached: AtomicUsize,
    fired: AtomicBool,
}

impl<T: Clone + Send + 'static> Publisher<T> for AutoConnect<T> {
    fn subscribe(&self, subscriber: BoxSubscriber<T>) {
        self.hub.attach(subscriber);
        let attached = self.attached.fetch_add(1, Ordering::AcqRel) + 1;
        if attached >= self.threshold && !self.fired.swap(true, Ordering::AcqRel) {
            debug!(attached, "auto-connect threshold reached");
            self.hub.connect();
        }
    }

    fn overflow_policy(&self) -> Option<OverflowPolicy> {
        Some(self.hub.policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::events::Signal;
    use crate::subscription::tests::Probe;
    use crate::time::VirtualClock;
    use std::time::Duration;

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
    fn nothing_flows_before_connect() {
        let hub = Flux::range(1, 3).publish();
        let probe = Probe::new(u64::MAX);
        let log = probe.log.clone();
        hub.subscribe_with(probe);

        assert!(log.lock().is_empty());
        assert_eq!(hub.phase(), HubPhase::Idle);

        hub.connect();
        assert_eq!(hub.phase(), HubPhase::Terminated);
        let log = log.lock();
        assert_eq!(values(&log), vec![1, 2, 3]);
        assert!(matches!(log.last(), Some(Signal::Complete)));
    }

    #[test]
    fn auto_connect_waits_for_the_threshold() {
        let clock = VirtualClock::new();
        let hub = Flux::interval_on(ms(10), Arc::new(clock.clone())).publish();
        let shared = hub.auto_connect(2);

        let first = Probe::new(u64::MAX);
        let first_log = first.log.clone();
        shared.subscribe_with(first);
        clock.advance(ms(50));
        assert_eq!(hub.phase(), HubPhase::Idle);
        assert!(first_log.lock().is_empty());

        let second = Probe::new(u64::MAX);
        let second_log = second.log.clone();
        shared.subscribe_with(second);
        assert_eq!(hub.phase(), HubPhase::Connected);

        clock.advance(ms(30));
        assert_eq!(values(&first_log.lock()), vec![0, 1, 2]);
        assert_eq!(values(&second_log.lock()), vec![0, 1, 2]);

        // A third attach does not reconnect.
        shared.subscribe_with(Probe::<u64>::new(u64::MAX));
        clock.advance(ms(10));
        assert_eq!(values(&first_log.lock()), vec![0, 1, 2, 3]);
    }

    #[test]
    fn late_subscriber_gets_no_replay() {
        let clock = VirtualClock::new();
        let hub = Flux::range(1, 10)
            .delay_elements_on(ms(100), Arc::new(clock.clone()))
            .publish();

        let early = Probe::new(u64::MAX);
        let early_log = early.log.clone();
        hub.subscribe_with(early);
        hub.connect();

        clock.advance(ms(300));
        let late = Probe::new(u64::MAX);
        let late_log = late.log.clone();
        hub.subscribe_with(late);
        clock.advance(ms(1000));

        assert_eq!(values(&early_log.lock()), (1..=10).collect::<Vec<i64>>());
        assert_eq!(values(&late_log.lock()), (4..=10).collect::<Vec<i64>>());
        assert!(matches!(late_log.lock().last(), Some(Signal::Complete)));
    }

    #[test]
    fn slow_downstream_drops_by_default() {
        let hub = Flux::range(1, 4).publish();
        let eager = Probe::new(u64::MAX);
        let slow = Probe::new(2);
        let (eager_log, slow_log) = (eager.log.clone(), slow.log.clone());
        hub.subscribe_with(eager);
        hub.subscribe_with(slow);
        hub.connect();

        assert_eq!(values(&eager_log.lock()), vec![1, 2, 3, 4]);
        let slow_log = slow_log.lock();
        assert_eq!(values(&slow_log), vec![1, 2]);
        assert!(matches!(slow_log.last(), Some(Signal::Complete)));
    }

    #[test]
    fn error_policy_terminates_only_the_slow_downstream() {
        let hub = Flux::range(1, 4).publish_with(OverflowPolicy::Error);
        let eager = Probe::new(u64::MAX);
        let slow = Probe::new(1);
        let (eager_log, slow_log) = (eager.log.clone(), slow.log.clone());
        hub.subscribe_with(eager);
        hub.subscribe_with(slow);
        hub.connect();

        assert_eq!(values(&eager_log.lock()), vec![1, 2, 3, 4]);
        let slow_log = slow_log.lock();
        assert_eq!(values(&slow_log), vec![1]);
        assert!(matches!(slow_log.last(), Some(Signal::Error(e)) if e.kind() == ErrorKind::Overflow));
        assert_eq!(slow_log.len(), 2);
    }

    #[test]
    fn attach_after_termination_gets_the_terminal_signal() {
        let hub = Flux::<i64>::error(FlowError::Transform("broken".into())).publish();
        hub.connect();
        assert_eq!(hub.phase(), HubPhase::Terminated);

        let probe = Probe::<i64>::new(1);
        let log = probe.log.clone();
        hub.subscribe_with(probe);
        assert!(matches!(&log.lock()[..], [Signal::Error(e)] if e.kind() == ErrorKind::Transform));
    }

    #[test]
    fn cancelling_one_downstream_keeps_the_others() {
        let clock = VirtualClock::new();
        let hub = Flux::interval_on(ms(10), Arc::new(clock.clone())).publish();
        let a = Probe::new(u64::MAX);
        let b = Probe::new(u64::MAX);
        let (a_log, a_sub, b_log) = (a.log.clone(), a.subscription.clone(), b.log.clone());
        hub.subscribe_with(a);
        hub.subscribe_with(b);
        hub.connect();

        clock.advance(ms(20));
        a_sub.lock().clone().unwrap().cancel();
        assert_eq!(hub.subscriber_count(), 1);
        clock.advance(ms(20));

        assert_eq!(values(&a_log.lock()), vec![0, 1]);
        assert_eq!(values(&b_log.lock()), vec![0, 1, 2, 3]);
        assert_eq!(hub.phase(), HubPhase::Connected);
    }

    #[test]
    fn connect_is_idempotent_and_dispose_stops_upstream() {
        let clock = VirtualClock::new();
        let hub = Flux::interval_on(ms(10), Arc::new(clock.clone())).publish();
        let probe = Probe::new(u64::MAX);
        let log = probe.log.clone();
        hub.subscribe_with(probe);

        let connection = hub.connect();
        hub.connect();
        clock.advance(ms(10));
        assert_eq!(values(&log.lock()), vec![0]);

        connection.dispose();
        assert_eq!(hub.phase(), HubPhase::Idle);
        assert_eq!(clock.pending_timers(), 0);
        clock.advance(ms(100));
        assert_eq!(values(&log.lock()), vec![0]);

        // Reconnecting starts a fresh upstream subscription.
        hub.connect();
        clock.advance(ms(10));
        assert_eq!(values(&log.lock()), vec![0, 0]);
    }

    #[test]
    fn reconnect_after_termination() {
        let hub = Flux::range(1, 2).publish();
        hub.connect();
        assert_eq!(hub.phase(), HubPhase::Terminated);

        let probe = Probe::new(u64::MAX);
        let log = probe.log.clone();
        hub.subscribe_with(probe);
        assert!(matches!(&log.lock()[..], [Signal::Complete]));

        let again = Probe::new(u64::MAX);
        let again_log = again.log.clone();
        hub.connect();
        // Attach after the second run terminated as well.
        hub.subscribe_with(again);
        assert!(matches!(&again_log.lock()[..], [Signal::Complete]));
        assert_eq!(hub.phase(), HubPhase::Terminated);
    }
}
