//! The `limit_rate` operator: bounded prefetch from upstream.
//!
//! Downstream demand is accumulated here and released upstream one chunk at a
//! time. The next chunk is requested only once every item of the previous
//! chunk has been delivered, so upstream never has more than `chunk` items
//! outstanding.

use crate::common::{add_demand, UNBOUNDED};
use crate::error::FlowError;
use crate::flux::{Flux, Publisher};
use crate::subscription::{BoxSubscriber, Link, Subscriber, Subscription};
use parking_lot::Mutex;
use std::sync::Arc;

pub(crate) struct LimitRate<T> {
    upstream: Flux<T>,
    chunk: u64,
}

impl<T> LimitRate<T> {
    pub(crate) fn new(upstream: Flux<T>, chunk: u64) -> Self {
        Self {
            upstream,
            chunk: chunk.max(1),
        }
    }
}

impl<T: Send + 'static> Publisher<T> for LimitRate<T> {
    fn subscribe(&self, subscriber: BoxSubscriber<T>) {
        let link = Arc::new(RateLink {
            chunk: self.chunk,
            state: Mutex::new(RateState::default()),
        });
        self.upstream.subscribe_boxed(Box::new(RateSubscriber {
            downstream: subscriber,
            link,
        }));
    }
}

#[derive(Default)]
struct RateState {
    upstream: Option<Subscription>,
    /// Downstream demand not yet passed upstream.
    wanted: u64,
    /// Items requested upstream and not yet received.
    outstanding: u64,
}

struct RateLink {
    chunk: u64,
    state: Mutex<RateState>,
}

impl RateLink {
    /// Requests the next chunk if the previous one has been fully delivered.
    fn replenish(&self) {
        let (upstream, grant) = {
            let mut state = self.state.lock();
            if state.outstanding > 0 || state.wanted == 0 {
                return;
            }
            let Some(upstream) = state.upstream.clone() else {
                return;
            };
            let grant = self.chunk.min(state.wanted);
            if state.wanted != UNBOUNDED {
                state.wanted -= grant;
            }
            state.outstanding = grant;
            (upstream, grant)
        };
        upstream.request(grant);
    }

    fn received(&self) {
        let mut state = self.state.lock();
        state.outstanding = state.outstanding.saturating_sub(1);
    }
}

impl Link for RateLink {
    fn request(&self, n: u64) {
        if n == 0 {
            let upstream = self.state.lock().upstream.clone();
            if let Some(upstream) = upstream {
                upstream.request(0);
            }
            return;
        }
        {
            let mut state = self.state.lock();
            state.wanted = add_demand(state.wanted, n);
        }
        self.replenish();
    }

    fn cancel(&self) {
        let upstream = self.state.lock().upstream.clone();
        if let Some(upstream) = upstream {
            upstream.cancel();
        }
    }
}

struct RateSubscriber<T> {
    downstream: BoxSubscriber<T>,
    link: Arc<RateLink>,
}

impl<T: Send + 'static> Subscriber<T> for RateSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Subscription) {
        self.link.state.lock().upstream = Some(subscription);
        self.downstream.on_subscribe(Subscription::new(self.link.clone()));
    }

    fn on_next(&mut self, item: T) {
        self.link.received();
        self.downstream.on_next(item);
        self.link.replenish();
    }

    fn on_error(&mut self, error: FlowError) {
        self.downstream.on_error(error);
    }

    fn on_complete(&mut self) {
        self.downstream.on_complete();
    }
}
