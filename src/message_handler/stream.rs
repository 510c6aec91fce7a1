use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use futures::Stream;
use tokio::sync::{oneshot, Notify};

use crate::errors::{MessageError, RemoteError};
use crate::message_handler::{MessageHandler, Payload, StreamEvent, StreamId};
use crate::sync::lock;

pub type SizeFn = Arc<dyn Fn(&Payload) -> i64 + Send + Sync>;

/// How much a consumer is willing to buffer, and how chunks are measured.
#[derive(Clone)]
pub struct QueuingStrategy {
    pub high_water_mark: i64,
    size: Option<SizeFn>,
}

impl QueuingStrategy {
    pub fn new(high_water_mark: i64) -> Self {
        Self { high_water_mark, size: None }
    }

    /// Measures chunks with `size` instead of counting each as one unit.
    pub fn with_size(mut self, size: impl Fn(&Payload) -> i64 + Send + Sync + 'static) -> Self {
        self.size = Some(Arc::new(size));
        self
    }

    pub(crate) fn size_of(&self, chunk: &Payload) -> i64 {
        self.size.as_ref().map_or(1, |size| size(chunk))
    }
}

impl Default for QueuingStrategy {
    fn default() -> Self {
        Self::new(1)
    }
}

impl fmt::Debug for QueuingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuingStrategy")
            .field("high_water_mark", &self.high_water_mark)
            .field("custom_size", &self.size.is_some())
            .finish()
    }
}

enum Phase {
    Readable,
    Closed,
    Errored(MessageError),
}

struct ControllerState {
    queue: VecDeque<(Payload, i64)>,
    queued_size: i64,
    phase: Phase,
    started: bool,
    start_pending: bool,
    pull_pending: bool,
    cancel_pending: bool,
    waiting_readers: usize,
    cancel_tx: Option<oneshot::Sender<Result<(), MessageError>>>,
}

pub(crate) enum ReadStep {
    Chunk(Payload),
    Empty,
    Done,
    Failed(MessageError),
}

/// Consumer side bookkeeping of one stream, owned by the message handler until every pending start, pull and
/// cancel has settled.
pub(crate) struct StreamController {
    stream_id: StreamId,
    strategy: QueuingStrategy,
    state: Mutex<ControllerState>,
    changed: Notify,
}

impl StreamController {
    pub(crate) fn new(stream_id: StreamId, strategy: QueuingStrategy) -> Self {
        Self {
            stream_id,
            strategy,
            state: Mutex::new(ControllerState {
                queue: VecDeque::new(),
                queued_size: 0,
                phase: Phase::Readable,
                started: false,
                start_pending: true,
                pull_pending: false,
                cancel_pending: false,
                waiting_readers: 0,
                cancel_tx: None,
            }),
            changed: Notify::new(),
        }
    }

    pub(crate) fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub(crate) fn desired_size(&self) -> i64 {
        self.strategy.high_water_mark - lock(&self.state).queued_size
    }

    pub(crate) fn handle_event(&self, event: StreamEvent) {
        let mut state = lock(&self.state);
        match event {
            StreamEvent::StartComplete(outcome) => {
                state.start_pending = false;
                state.started = true;
                if let Err(reason) = outcome {
                    Self::error_locked(&mut state, reason.into());
                }
            }
            StreamEvent::PullComplete(outcome) => {
                state.pull_pending = false;
                if let Err(reason) = outcome {
                    Self::error_locked(&mut state, reason.into());
                }
            }
            StreamEvent::Enqueue { chunk } => {
                if !matches!(state.phase, Phase::Readable) {
                    return;
                }
                let size = self.strategy.size_of(&chunk);
                state.queue.push_back((chunk, size));
                state.queued_size += size;
            }
            StreamEvent::Close => {
                if !matches!(state.phase, Phase::Readable) {
                    return;
                }
                state.phase = Phase::Closed;
            }
            StreamEvent::Error { reason } => {
                Self::error_locked(&mut state, reason.into());
            }
            StreamEvent::CancelComplete(outcome) => {
                state.cancel_pending = false;
                if let Some(tx) = state.cancel_tx.take() {
                    let _ = tx.send(outcome.map_err(MessageError::from));
                }
            }
            StreamEvent::Pull { .. } | StreamEvent::Cancel { .. } => {
                log::warn!("Stream[{}]: producer event sent to consumer", self.stream_id);
                return;
            }
        }
        drop(state);
        self.changed.notify_waiters();
    }

    fn error_locked(state: &mut ControllerState, err: MessageError) {
        if !matches!(state.phase, Phase::Readable) {
            return;
        }
        state.queue.clear();
        state.queued_size = 0;
        state.phase = Phase::Errored(err);
    }

    /// Settles everything at once. Used when the message handler goes away.
    pub(crate) fn fail(&self, err: MessageError) {
        let mut state = lock(&self.state);
        Self::error_locked(&mut state, err.clone());
        state.start_pending = false;
        state.pull_pending = false;
        state.cancel_pending = false;
        if let Some(tx) = state.cancel_tx.take() {
            let _ = tx.send(Err(err));
        }
        drop(state);
        self.changed.notify_waiters();
    }

    /// True once the stream is terminal and no start, pull or cancel is outstanding.
    pub(crate) fn is_settled(&self) -> bool {
        let state = lock(&self.state);
        !matches!(state.phase, Phase::Readable) && !state.start_pending && !state.pull_pending && !state.cancel_pending
    }

    /// Returns the credit to advertise if a pull should be sent now, and marks it as in flight.
    pub(crate) fn take_pull_request(&self) -> Option<i64> {
        let mut state = lock(&self.state);
        if !state.started || state.pull_pending || !matches!(state.phase, Phase::Readable) {
            return None;
        }
        let desired_size = self.strategy.high_water_mark - state.queued_size;
        if desired_size <= 0 && state.waiting_readers == 0 {
            return None;
        }
        state.pull_pending = true;
        Some(desired_size)
    }

    pub(crate) fn begin_cancel(&self) -> Option<oneshot::Receiver<Result<(), MessageError>>> {
        let mut state = lock(&self.state);
        if !matches!(state.phase, Phase::Readable) {
            return None;
        }
        state.phase = Phase::Closed;
        state.queue.clear();
        state.queued_size = 0;
        state.cancel_pending = true;
        let (tx, rx) = oneshot::channel();
        state.cancel_tx = Some(tx);
        drop(state);
        self.changed.notify_waiters();
        Some(rx)
    }

    fn try_read(&self) -> ReadStep {
        let mut state = lock(&self.state);
        if let Some((chunk, size)) = state.queue.pop_front() {
            state.queued_size -= size;
            return ReadStep::Chunk(chunk);
        }
        match &state.phase {
            Phase::Readable => ReadStep::Empty,
            Phase::Closed => ReadStep::Done,
            Phase::Errored(err) => ReadStep::Failed(err.clone()),
        }
    }
}

struct WaitingReader<'a>(&'a StreamController);

impl<'a> WaitingReader<'a> {
    fn new(controller: &'a StreamController) -> Self {
        lock(&controller.state).waiting_readers += 1;
        Self(controller)
    }
}

impl Drop for WaitingReader<'_> {
    fn drop(&mut self) {
        lock(&self.0.state).waiting_readers -= 1;
    }
}

/// Consumer side of a stream returned by [`MessageHandler::send_with_stream`].
///
/// Pulls are issued automatically: whenever the queue drops below the high water mark (or a reader is
/// waiting) and no earlier pull is still in flight.
#[derive(Clone)]
pub struct ReadableStream {
    handler: Arc<MessageHandler>,
    controller: Arc<StreamController>,
}

impl ReadableStream {
    pub(crate) fn new(handler: Arc<MessageHandler>, controller: Arc<StreamController>) -> Self {
        Self { handler, controller }
    }

    pub fn stream_id(&self) -> StreamId {
        self.controller.stream_id
    }

    pub fn desired_size(&self) -> i64 {
        self.controller.desired_size()
    }

    /// Next chunk, `None` once the stream is closed or cancelled.
    pub async fn read(&self) -> Option<Result<Payload, MessageError>> {
        loop {
            let changed = self.controller.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            match self.controller.try_read() {
                ReadStep::Chunk(chunk) => {
                    self.handler.pull_if_needed(&self.controller);
                    return Some(Ok(chunk));
                }
                ReadStep::Done => return None,
                ReadStep::Failed(err) => return Some(Err(err)),
                ReadStep::Empty => {}
            }

            let _waiting = WaitingReader::new(&self.controller);
            self.handler.pull_if_needed(&self.controller);
            changed.await;
        }
    }

    /// Cancels the stream and waits for the producer to acknowledge. A no-op once the stream has closed.
    pub async fn cancel(&self, reason: RemoteError) -> Result<(), MessageError> {
        let Some(rx) = self.controller.begin_cancel() else {
            return Ok(());
        };
        let event = StreamEvent::Cancel { reason };
        if let Err(err) = self.handler.post_stream_event(self.controller.stream_id, event, &[]) {
            self.controller.fail(err.clone().into());
            self.handler.release_stream(&self.controller);
            return Err(err.into());
        }
        rx.await.unwrap_or(Err(MessageError::Destroyed))
    }

    /// Adapts the stream to [`futures::Stream`]. The adapter ends after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Payload, MessageError>> + Send {
        futures::stream::unfold(Some(self), |reader| async move {
            let reader = reader?;
            match reader.read().await? {
                Ok(chunk) => Some((Ok(chunk), Some(reader))),
                Err(err) => Some((Err(err), None)),
            }
        })
    }
}

impl fmt::Debug for ReadableStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadableStream")
            .field("stream_id", &self.controller.stream_id)
            .field("desired_size", &self.controller.desired_size())
            .finish()
    }
}
