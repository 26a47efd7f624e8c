//! Contains common, primitive types shared across the engine.
//!
//! This module defines the identifier types used to track attached downstream
//! subscribers and pending timers, along with the demand constants every
//! `Subscription` is accounted in. Using distinct key types keeps a hub's
//! subscriber registry and a clock's timer queue from being confused.

use slotmap::new_key_type;

/// Demand value meaning "unlimited".
///
/// Once a subscription's outstanding demand reaches this value it stays there;
/// deliveries no longer decrement it.
pub const UNBOUNDED: u64 = u64::MAX;

new_key_type! {
    /// Uniquely identifies a downstream subscriber attached to a hub.
    ///
    /// Keys are never reused for a different subscriber while the old one is
    /// still referenced, so a late cancellation can never detach a newcomer.
    pub struct SubscriberId;

    /// Uniquely identifies a callback waiting in a `VirtualClock`'s queue.
    pub struct TimerId;
}

/// Adds `n` to `current`, saturating at [`UNBOUNDED`].
pub(crate) fn add_demand(current: u64, n: u64) -> u64 {
    if current == UNBOUNDED || n == UNBOUNDED {
        UNBOUNDED
    } else {
        current.saturating_add(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demand_saturates_at_unbounded() {
        assert_eq!(add_demand(3, 4), 7);
        assert_eq!(add_demand(UNBOUNDED, 1), UNBOUNDED);
        assert_eq!(add_demand(1, UNBOUNDED), UNBOUNDED);
        assert_eq!(add_demand(u64::MAX - 1, 5), UNBOUNDED);
    }
}
