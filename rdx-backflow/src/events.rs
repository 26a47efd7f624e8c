//! Defines the signals a subscription delivers to its subscriber.

use crate::error::FlowError;

/// One event delivered through a `Subscription`.
///
/// At most one terminal signal (`Error` or `Complete`) is delivered per
/// subscription, and no `Next` ever follows it.
#[derive(Debug, Clone)]
pub enum Signal<T> {
    Next(T),
    Error(FlowError),
    Complete,
}

impl<T> Signal<T> {
    /// Returns `true` for `Error` and `Complete`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Signal::Next(_))
    }
}

/// A terminal signal without an item type, as remembered by a hub after its
/// upstream has finished.
#[derive(Debug, Clone)]
pub(crate) enum Terminal {
    Error(FlowError),
    Complete,
}

impl<T> From<Terminal> for Signal<T> {
    fn from(terminal: Terminal) -> Self {
        match terminal {
            Terminal::Error(err) => Signal::Error(err),
            Terminal::Complete => Signal::Complete,
        }
    }
}
