//! Producers and operators behind the `Flux` builder methods.
//!
//! Each operator is a [`Publisher`](crate::flux::Publisher) wrapping its
//! upstream `Flux`. Subscribing to it subscribes an operator-specific
//! subscriber upstream, which in turn forwards adapted signals downstream.

pub(crate) mod delay;
pub(crate) mod limit_rate;
pub(crate) mod log;
pub(crate) mod map;
pub(crate) mod producers;
pub(crate) mod take;
