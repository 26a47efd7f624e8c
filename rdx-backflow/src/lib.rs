//! # Backflow
//!
//! A demand-driven reactive stream engine for Rust.
//!
//! Backflow implements the backpressure protocol between a producer and its
//! consumers, multicast sharing of one upstream among many subscribers, and a
//! virtual-time clock that makes timer-driven pipelines testable without real
//! delays.
//!
//! ## Core Concepts
//!
//! - **Flux**: A cold, cloneable description of a sequence. Nothing runs until
//!   it is subscribed to, and every subscription runs independently.
//! - **Demand**: A consumer grants demand with `Subscription::request`; a
//!   producer never emits more items than were requested.
//! - **Hub**: `Flux::publish` shares one upstream among many subscribers,
//!   connected manually or once enough subscribers have attached.
//! - **Clock**: Timer-driven producers and operators take a clock by
//!   injection. `VirtualClock` moves only when a test advances it.
//! - **Verifier**: A step verifier for scripting expectations against a
//!   stream, in real or virtual time.
//!
//! ## Example Usage
//!
//! ```rust
//! use backflow::prelude::*;
//! use std::sync::{Arc, Mutex};
//! use std::time::Duration;
//!
//! let clock = VirtualClock::new();
//! let seen = Arc::new(Mutex::new(Vec::new()));
//! let sink = seen.clone();
//!
//! // 1. Describe a pipeline on the virtual clock.
//! let ticks = Flux::interval_on(Duration::from_millis(100), Arc::new(clock.clone()))
//!     .map(|tick| tick * 10)
//!     .take(3);
//!
//! // 2. Subscribe with unlimited demand.
//! ticks.subscribe(move |value| sink.lock().unwrap().push(value));
//!
//! // 3. Drive time forward.
//! clock.advance(Duration::from_secs(1));
//! assert_eq!(*seen.lock().unwrap(), vec![0, 10, 20]);
//! ```

pub const ENGINE_NAME: &str = "Backflow";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Declare all the modules in the crate.
pub mod common;
mod components;
pub mod config;
pub mod error;
pub mod events;
pub mod flux;
pub mod hub;
pub mod subscriber;
pub mod subscription;
pub mod telemetry;
pub mod time;
pub mod verifier;

/// A prelude module for easy importing of the most common Backflow types.
pub mod prelude {
    pub use crate::common::{SubscriberId, UNBOUNDED};
    pub use crate::config::{FlowConfig, OverflowPolicy};
    pub use crate::error::{ErrorKind, FlowError, VerifyError};
    pub use crate::events::Signal;
    pub use crate::flux::{Flux, Publisher};
    pub use crate::hub::{ConnectableFlux, Connection, HubPhase};
    pub use crate::subscriber::Disposable;
    pub use crate::subscription::{Emitter, Source, Subscriber, Subscription};
    pub use crate::time::{Clock, ClockRef, RealClock, VirtualClock};
    pub use crate::verifier::Verifier;
}
