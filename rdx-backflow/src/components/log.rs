//! The `log` operator: traces every signal, request and cancellation.

use crate::common::UNBOUNDED;
use crate::error::FlowError;
use crate::flux::{Flux, Publisher};
use crate::subscription::{BoxSubscriber, Link, Subscriber, Subscription};
use std::fmt;
use std::sync::Arc;
use tracing::info;

pub(crate) struct Log<T> {
    upstream: Flux<T>,
    category: Arc<str>,
}

impl<T> Log<T> {
    pub(crate) fn new(upstream: Flux<T>, category: String) -> Self {
        Self {
            upstream,
            category: category.into(),
        }
    }
}

impl<T: fmt::Debug + Send + 'static> Publisher<T> for Log<T> {
    fn subscribe(&self, subscriber: BoxSubscriber<T>) {
        self.upstream.subscribe_boxed(Box::new(LogSubscriber {
            downstream: subscriber,
            category: self.category.clone(),
        }));
    }
}

struct LogSubscriber<T> {
    downstream: BoxSubscriber<T>,
    category: Arc<str>,
}

impl<T: fmt::Debug + Send + 'static> Subscriber<T> for LogSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Subscription) {
        info!(category = %self.category, "onSubscribe");
        let link = LogLink {
            upstream: subscription,
            category: self.category.clone(),
        };
        self.downstream.on_subscribe(Subscription::new(Arc::new(link)));
    }

    fn on_next(&mut self, item: T) {
        info!(category = %self.category, "onNext({item:?})");
        self.downstream.on_next(item);
    }

    fn on_error(&mut self, error: FlowError) {
        info!(category = %self.category, kind = %error.kind(), "onError({error})");
        self.downstream.on_error(error);
    }

    fn on_complete(&mut self) {
        info!(category = %self.category, "onComplete()");
        self.downstream.on_complete();
    }
}

struct LogLink {
    upstream: Subscription,
    category: Arc<str>,
}

impl Link for LogLink {
    fn request(&self, n: u64) {
        if n == UNBOUNDED {
            info!(category = %self.category, "request(unbounded)");
        } else {
            info!(category = %self.category, "request({n})");
        }
        self.upstream.request(n);
    }

    fn cancel(&self) {
        info!(category = %self.category, "cancel()");
        self.upstream.cancel();
    }
}
