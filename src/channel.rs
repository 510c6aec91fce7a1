//! Bidirectional message transports.
//!
//! A [`Channel`] moves [`Envelope`]s between two execution contexts. Delivery is asynchronous and FIFO per
//! direction; no memory is shared between the two ends beyond what is explicitly transferred.
//!
//! Two transports exist: [`ThreadChannel`] talks to a backend running on its own OS thread,
//! [`LoopbackChannel`] connects two ends inside the same runtime and copies payloads on the way.

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::errors::ChannelError;
use crate::message_handler::{Envelope, SharedBuffer};

mod loopback;
mod port;
mod thread;

pub use loopback::LoopbackChannel;
pub use thread::ThreadChannel;

/// Callback invoked for every inbound envelope.
pub type MessageListener = Arc<dyn Fn(Envelope) + Send + Sync>;

/// Callback invoked when the far end fails.
pub type ErrorObserver = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChannelId(Uuid);

impl ChannelId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

pub trait Channel: Send + Sync {
    fn id(&self) -> ChannelId;

    /// Queues `envelope` for delivery. Buffers listed in `transfers` are moved rather than copied.
    fn send(&self, envelope: Envelope, transfers: &[SharedBuffer]) -> Result<(), ChannelError>;

    /// Registers a listener for inbound envelopes. Must be called from within a tokio runtime.
    fn on_message(&self, listener: MessageListener) -> ListenerId;

    fn remove_listener(&self, id: ListenerId);

    /// Registers an observer for failures of the far end. Transports that cannot fail ignore it.
    fn on_error(&self, _observer: ErrorObserver) {}

    fn close(&self);
}
