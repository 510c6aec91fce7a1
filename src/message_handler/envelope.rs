use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::errors::{MessageError, RemoteError};
use crate::message_handler::Action;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId(pub u64);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable, reference counted byte buffer. Buffers travel next to the JSON part of a payload and can be
/// transferred (moved without copying) when named in a send's transfer list.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedBuffer(Arc<[u8]>);

impl SharedBuffer {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether both handles point to the same allocation.
    pub fn ptr_eq(a: &SharedBuffer, b: &SharedBuffer) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    /// Copies the bytes into a new allocation.
    pub fn deep_copy(&self) -> SharedBuffer {
        SharedBuffer(Arc::from(&self.0[..]))
    }

    pub(crate) fn address(&self) -> usize {
        Arc::as_ptr(&self.0) as *const u8 as usize
    }
}

impl From<Vec<u8>> for SharedBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        SharedBuffer(Arc::from(bytes.into_boxed_slice()))
    }
}

impl From<&[u8]> for SharedBuffer {
    fn from(bytes: &[u8]) -> Self {
        SharedBuffer(Arc::from(bytes))
    }
}

impl fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedBuffer({} bytes)", self.0.len())
    }
}

/// Data part of an envelope: structured JSON plus out-of-band binary buffers.
#[derive(Clone, Debug, Default)]
pub struct Payload {
    pub data: Value,
    pub buffers: Vec<SharedBuffer>,
}

impl Payload {
    pub fn new(data: Value) -> Self {
        Self { data, buffers: Vec::new() }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn encode<T: Serialize>(value: &T) -> Result<Self, MessageError> {
        Ok(Self::new(serde_json::to_value(value)?))
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, MessageError> {
        Ok(T::deserialize(&self.data)?)
    }

    pub fn with_buffer(mut self, buffer: SharedBuffer) -> Self {
        self.buffers.push(buffer);
        self
    }

    pub fn buffer(&self, index: usize) -> Option<&SharedBuffer> {
        self.buffers.get(index)
    }
}

impl From<Value> for Payload {
    fn from(data: Value) -> Self {
        Payload::new(data)
    }
}

/// What the sender of a call expects back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplyMode {
    None,
    Promise(CallId),
    Stream { stream_id: StreamId, desired_size: i64 },
}

#[derive(Clone, Debug)]
pub enum StreamEvent {
    Pull { desired_size: i64 },
    PullComplete(Result<(), RemoteError>),
    Enqueue { chunk: Payload },
    Close,
    Error { reason: RemoteError },
    Cancel { reason: RemoteError },
    CancelComplete(Result<(), RemoteError>),
    StartComplete(Result<(), RemoteError>),
}

#[derive(Clone, Debug)]
pub enum Message {
    Call {
        action: Action,
        reply: ReplyMode,
        data: Payload,
    },
    Reply {
        call_id: CallId,
        outcome: Result<Payload, RemoteError>,
    },
    Stream {
        stream_id: StreamId,
        event: StreamEvent,
    },
}

/// One unit on the wire, addressed from one message handler to another.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub source: String,
    pub target: String,
    pub message: Message,
}

impl Envelope {
    /// The payload carried by this envelope, if any.
    pub fn payload_mut(&mut self) -> Option<&mut Payload> {
        match &mut self.message {
            Message::Call { data, .. } => Some(data),
            Message::Reply { outcome: Ok(data), .. } => Some(data),
            Message::Stream { event: StreamEvent::Enqueue { chunk }, .. } => Some(chunk),
            _ => None,
        }
    }
}
