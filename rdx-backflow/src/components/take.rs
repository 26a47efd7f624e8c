//! The `take` operator.

use crate::error::FlowError;
use crate::flux::{Flux, Publisher};
use crate::subscription::{BoxSubscriber, Link, Subscriber, Subscription};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::trace;

pub(crate) struct Take<T> {
    upstream: Flux<T>,
    limit: u64,
}

impl<T> Take<T> {
    pub(crate) fn new(upstream: Flux<T>, limit: u64) -> Self {
        Self { upstream, limit }
    }
}

impl<T: Send + 'static> Publisher<T> for Take<T> {
    fn subscribe(&self, subscriber: BoxSubscriber<T>) {
        let link = Arc::new(TakeLink {
            state: Mutex::new(TakeState {
                upstream: None,
                unrequested: self.limit,
            }),
        });
        self.upstream.subscribe_boxed(Box::new(TakeSubscriber {
            downstream: subscriber,
            link,
            remaining: self.limit,
            done: false,
        }));
    }
}

struct TakeState {
    upstream: Option<Subscription>,
    /// How much of the limit has not been requested upstream yet.
    unrequested: u64,
}

/// Caps downstream demand at what is left of the limit.
struct TakeLink {
    state: Mutex<TakeState>,
}

impl TakeLink {
    fn upstream(&self) -> Option<Subscription> {
        self.state.lock().upstream.clone()
    }
}

impl Link for TakeLink {
    fn request(&self, n: u64) {
        let (upstream, grant) = {
            let mut state = self.state.lock();
            let grant = n.min(state.unrequested);
            state.unrequested -= grant;
            (state.upstream.clone(), grant)
        };
        let Some(upstream) = upstream else {
            return;
        };
        if n == 0 {
            // Let the upstream report the protocol violation.
            upstream.request(0);
        } else if grant > 0 {
            upstream.request(grant);
        }
    }

    fn cancel(&self) {
        if let Some(upstream) = self.upstream() {
            upstream.cancel();
        }
    }
}

struct TakeSubscriber<T> {
    downstream: BoxSubscriber<T>,
    link: Arc<TakeLink>,
    remaining: u64,
    done: bool,
}

impl<T: Send + 'static> Subscriber<T> for TakeSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Subscription) {
        self.link.state.lock().upstream = Some(subscription.clone());
        self.downstream.on_subscribe(Subscription::new(self.link.clone()));
        if self.remaining == 0 && !self.done {
            trace!("take(0): completing immediately");
            self.done = true;
            subscription.cancel();
            self.downstream.on_complete();
        }
    }

    fn on_next(&mut self, item: T) {
        if self.done {
            return;
        }
        self.remaining -= 1;
        self.downstream.on_next(item);
        if self.remaining == 0 {
            self.done = true;
            if let Some(upstream) = self.link.upstream() {
                upstream.cancel();
            }
            self.downstream.on_complete();
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
