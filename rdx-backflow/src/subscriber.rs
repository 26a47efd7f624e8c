//! Closure-based consumers for the `subscribe` convenience methods.

use crate::error::FlowError;
use crate::subscription::{Subscriber, Subscription};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::error;

pub type NextHandler<T> = Box<dyn FnMut(T) + Send>;
pub type ErrorHandler = Box<dyn FnMut(FlowError) + Send>;
pub type CompleteHandler = Box<dyn FnMut() + Send>;

/// A handle that cancels a convenience subscription.
///
/// Disposing before the subscription has been established cancels it as soon
/// as it arrives.
#[derive(Clone, Default)]
pub struct Disposable {
    inner: Arc<DisposableInner>,
}

#[derive(Default)]
struct DisposableInner {
    subscription: Mutex<Option<Subscription>>,
    disposed: AtomicBool,
}

impl Disposable {
    pub fn dispose(&self) {
        self.inner.disposed.store(true, Ordering::Release);
        let subscription = self.inner.subscription.lock().take();
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    fn attach(&self, subscription: Subscription) {
        *self.inner.subscription.lock() = Some(subscription);
        if self.is_disposed() {
            self.dispose();
        }
    }
}

/// A subscriber built from closures that requests unlimited demand.
///
/// A panic in `on_next` cancels the subscription and is reported to the error
/// handler as a `Transform` error.
pub struct LambdaSubscriber<T> {
    on_next: NextHandler<T>,
    on_error: Option<ErrorHandler>,
    on_complete: Option<CompleteHandler>,
    disposable: Disposable,
    failed: bool,
}

impl<T> LambdaSubscriber<T> {
    pub fn new(
        on_next: NextHandler<T>,
        on_error: Option<ErrorHandler>,
        on_complete: Option<CompleteHandler>,
    ) -> Self {
        Self {
            on_next,
            on_error,
            on_complete,
            disposable: Disposable::default(),
            failed: false,
        }
    }

    pub fn disposable(&self) -> Disposable {
        self.disposable.clone()
    }
}

impl<T: Send + 'static> Subscriber<T> for LambdaSubscriber<T> {
    fn on_subscribe(&mut self, subscription: Subscription) {
        self.disposable.attach(subscription.clone());
        if !self.disposable.is_disposed() {
            subscription.request_unbounded();
        }
    }

    fn on_next(&mut self, item: T) {
        if self.failed {
            return;
        }
        let on_next = &mut self.on_next;
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| on_next(item))) {
            self.failed = true;
            self.disposable.dispose();
            self.on_error(FlowError::from_panic(payload.as_ref(), "consumer panicked"));
        }
    }

    fn on_error(&mut self, err: FlowError) {
        match self.on_error.as_mut() {
            Some(handler) => handler(err),
            None => error!("unhandled stream error: {err}"),
        }
    }

    fn on_complete(&mut self) {
        if let Some(handler) = self.on_complete.as_mut() {
            handler();
        }
    }
}
