use std::sync::Arc;

use crate::channel::port::{self, Port};
use crate::channel::{Channel, ChannelId, ListenerId, MessageListener};
use crate::errors::ChannelError;
use crate::message_handler::{Envelope, SharedBuffer};

/// In-process channel used when no worker thread is available.
///
/// Both ends live in the same runtime, but behave like a real cross-thread channel: buffers that are not
/// transferred are copied before they reach the other end, and delivery happens on a separate task after
/// `send` has returned.
pub struct LoopbackChannel {
    port: Port,
}

impl LoopbackChannel {
    /// Creates two connected ends.
    pub fn pair() -> (Arc<LoopbackChannel>, Arc<LoopbackChannel>) {
        let (a, b) = port::pair();
        (Arc::new(Self { port: a }), Arc::new(Self { port: b }))
    }
}

impl Channel for LoopbackChannel {
    fn id(&self) -> ChannelId {
        self.port.id()
    }

    fn send(&self, mut envelope: Envelope, transfers: &[SharedBuffer]) -> Result<(), ChannelError> {
        if let Some(payload) = envelope.payload_mut() {
            port::structured_clone(payload, transfers);
        }
        self.port.post(envelope)
    }

    fn on_message(&self, listener: MessageListener) -> ListenerId {
        self.port.subscribe(listener)
    }

    fn remove_listener(&self, id: ListenerId) {
        self.port.unsubscribe(id);
    }

    fn close(&self) {
        self.port.close();
    }
}
