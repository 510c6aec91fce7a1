use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::watch;

use crate::errors::RemoteError;
use crate::message_handler::{MessageHandler, Payload, SharedBuffer, StreamEvent, StreamId};
use crate::sync::lock;

pub(crate) type PullCallback = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
pub(crate) type CancelCallback = Arc<dyn Fn(RemoteError) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Clone, Debug)]
enum Readiness {
    Ready,
    Waiting,
    Cancelled(RemoteError),
}

struct SinkState {
    desired_size: i64,
    is_cancelled: bool,
    on_pull: Option<PullCallback>,
    on_cancel: Option<CancelCallback>,
}

struct SinkInner {
    stream_id: StreamId,
    handler: Weak<MessageHandler>,
    state: Mutex<SinkState>,
    readiness: watch::Sender<Readiness>,
}

/// Producer side of a stream, handed to the stream action's handler.
///
/// `desired_size` is the credit the consumer has granted. Every `enqueue` spends from it and each pull from
/// the consumer resets it. When credit runs out, [`StreamSink::ready`] blocks until the next pull.
#[derive(Clone)]
pub struct StreamSink {
    inner: Arc<SinkInner>,
}

impl StreamSink {
    pub(crate) fn new(stream_id: StreamId, handler: Weak<MessageHandler>, desired_size: i64) -> Self {
        let (readiness, _) = watch::channel(Readiness::Ready);
        Self {
            inner: Arc::new(SinkInner {
                stream_id,
                handler,
                state: Mutex::new(SinkState {
                    desired_size,
                    is_cancelled: false,
                    on_pull: None,
                    on_cancel: None,
                }),
                readiness,
            }),
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.inner.stream_id
    }

    pub fn desired_size(&self) -> i64 {
        lock(&self.inner.state).desired_size
    }

    pub fn is_cancelled(&self) -> bool {
        lock(&self.inner.state).is_cancelled
    }

    /// Resolves once the consumer has credit left. Fails with the consumer's reason when it cancels.
    pub async fn ready(&self) -> Result<(), RemoteError> {
        let mut rx = self.inner.readiness.subscribe();
        let readiness = match rx.wait_for(|r| !matches!(r, Readiness::Waiting)).await {
            Ok(readiness) => readiness.clone(),
            Err(_) => return Err(RemoteError::abort("stream sink dropped")),
        };
        match readiness {
            Readiness::Cancelled(reason) => Err(reason),
            _ => Ok(()),
        }
    }

    /// Sends one chunk of `size` units. Does nothing once the stream is closed or cancelled.
    pub fn enqueue(&self, chunk: Payload, size: i64, transfers: &[SharedBuffer]) {
        let mut state = lock(&self.inner.state);
        if state.is_cancelled {
            return;
        }
        let last_desired_size = state.desired_size;
        state.desired_size -= size;
        if last_desired_size > 0 && state.desired_size <= 0 {
            self.inner.readiness.send_replace(Readiness::Waiting);
        }
        // Posted under the lock so concurrent producers keep their order.
        self.post(StreamEvent::Enqueue { chunk }, transfers);
    }

    pub fn close(&self) {
        if !self.finish() {
            return;
        }
        self.post(StreamEvent::Close, &[]);
        if let Some(handler) = self.inner.handler.upgrade() {
            handler.remove_sink(self.inner.stream_id);
        }
    }

    pub fn error(&self, reason: RemoteError) {
        if !self.finish() {
            return;
        }
        self.post(StreamEvent::Error { reason }, &[]);
        if let Some(handler) = self.inner.handler.upgrade() {
            handler.remove_sink(self.inner.stream_id);
        }
    }

    /// Called for every pull from the consumer, after the credit has been reset.
    pub fn set_on_pull<F, Fut>(&self, f: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        lock(&self.inner.state).on_pull = Some(Arc::new(move || f().boxed()));
    }

    /// Called once when the consumer cancels the stream.
    pub fn set_on_cancel<F, Fut>(&self, f: F)
    where
        F: Fn(RemoteError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        lock(&self.inner.state).on_cancel = Some(Arc::new(move |reason| f(reason).boxed()));
    }

    /// Applies a pull from the consumer and returns the callback to run for it.
    pub(crate) fn apply_pull(&self, desired_size: i64) -> Option<PullCallback> {
        let mut state = lock(&self.inner.state);
        let last_desired_size = state.desired_size;
        state.desired_size = desired_size;
        if last_desired_size <= 0 && desired_size > 0 && !state.is_cancelled {
            self.inner.readiness.send_replace(Readiness::Ready);
        }
        state.on_pull.clone()
    }

    /// Marks the sink cancelled by the consumer and returns the cancel callback, if any.
    pub(crate) fn apply_cancel(&self, reason: RemoteError) -> Option<CancelCallback> {
        let mut state = lock(&self.inner.state);
        state.is_cancelled = true;
        state.on_pull = None;
        self.inner.readiness.send_replace(Readiness::Cancelled(reason));
        state.on_cancel.take()
    }

    /// Marks the sink terminated. Returns false when it already was.
    fn finish(&self) -> bool {
        let mut state = lock(&self.inner.state);
        if state.is_cancelled {
            return false;
        }
        state.is_cancelled = true;
        state.on_pull = None;
        state.on_cancel = None;
        true
    }

    fn post(&self, event: StreamEvent, transfers: &[SharedBuffer]) {
        let Some(handler) = self.inner.handler.upgrade() else {
            return;
        };
        if let Err(err) = handler.post_stream_event(self.inner.stream_id, event, transfers) {
            log::debug!("StreamSink[{}]: cannot post event: {}", self.inner.stream_id, err);
        }
    }
}

impl fmt::Debug for StreamSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("StreamSink")
            .field("stream_id", &self.inner.stream_id)
            .field("desired_size", &state.desired_size)
            .field("is_cancelled", &state.is_cancelled)
            .finish()
    }
}
