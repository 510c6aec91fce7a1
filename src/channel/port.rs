use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelId, ListenerId, MessageListener};
use crate::errors::ChannelError;
use crate::message_handler::{Envelope, Payload, SharedBuffer};
use crate::sync::lock;

type Listeners = Arc<Mutex<Vec<(ListenerId, MessageListener)>>>;

/// One end of a pair of unbounded queues. Inbound envelopes are handed to the registered listeners by a
/// pump task, so delivery never happens on the sender's call stack.
pub(crate) struct Port {
    id: ChannelId,
    outbound: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    listeners: Listeners,
    next_listener: AtomicU64,
    closed: CancellationToken,
}

pub(crate) fn pair() -> (Port, Port) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (Port::new(a_tx, b_rx), Port::new(b_tx, a_rx))
}

impl Port {
    fn new(outbound: mpsc::UnboundedSender<Envelope>, inbound: mpsc::UnboundedReceiver<Envelope>) -> Self {
        Self {
            id: ChannelId::new(),
            outbound: Mutex::new(Some(outbound)),
            inbound: Mutex::new(Some(inbound)),
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_listener: AtomicU64::new(1),
            closed: CancellationToken::new(),
        }
    }

    pub(crate) fn id(&self) -> ChannelId {
        self.id
    }

    pub(crate) fn post(&self, envelope: Envelope) -> Result<(), ChannelError> {
        let outbound = lock(&self.outbound);
        match outbound.as_ref() {
            Some(tx) => tx.send(envelope).map_err(|_| ChannelError::Closed),
            None => Err(ChannelError::Closed),
        }
    }

    /// Adds a listener. The first listener starts the pump, so envelopes that arrived earlier are
    /// buffered rather than lost.
    pub(crate) fn subscribe(&self, listener: MessageListener) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        lock(&self.listeners).push((id, listener));

        if let Some(rx) = lock(&self.inbound).take() {
            tokio::spawn(pump(rx, self.listeners.clone(), self.closed.clone()));
        }
        id
    }

    pub(crate) fn unsubscribe(&self, id: ListenerId) {
        lock(&self.listeners).retain(|(listener_id, _)| *listener_id != id);
    }

    pub(crate) fn close(&self) {
        lock(&self.outbound).take();
        lock(&self.inbound).take();
        lock(&self.listeners).clear();
        self.closed.cancel();
    }

    /// Cancelled once this end is closed or the far end hung up.
    pub(crate) fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}

async fn pump(mut rx: mpsc::UnboundedReceiver<Envelope>, listeners: Listeners, closed: CancellationToken) {
    loop {
        let envelope = tokio::select! {
            _ = closed.cancelled() => break,
            envelope = rx.recv() => match envelope {
                Some(envelope) => envelope,
                None => break,
            },
        };

        // Listeners may add or remove listeners while being called.
        let current: Vec<MessageListener> = lock(&listeners).iter().map(|(_, l)| l.clone()).collect();
        for listener in current {
            listener(envelope.clone());
        }
    }
    closed.cancel();
}

/// Copies every buffer of `payload` that is not named in `transfers`. Copies are memoised by address, so a
/// buffer referenced twice is still referenced twice (and not copied twice) on the receiving side.
pub(crate) fn structured_clone(payload: &mut Payload, transfers: &[SharedBuffer]) {
    let mut copies: HashMap<usize, SharedBuffer> = HashMap::new();
    for buffer in payload.buffers.iter_mut() {
        if transfers.iter().any(|t| SharedBuffer::ptr_eq(t, buffer)) {
            continue;
        }
        let copy = copies
            .entry(buffer.address())
            .or_insert_with(|| buffer.deep_copy())
            .clone();
        *buffer = copy;
    }
}
