//! Call, reply and stream protocol on top of a [`Channel`].
//!
//! A `MessageHandler` is addressed by name: it only accepts envelopes whose target is its own
//! `source_name`, and everything it sends is addressed to `target_name`. Several handlers can share one
//! channel this way.
//!
//! Three kinds of exchange are supported, fixed per [`Action`]:
//! - notify: fire-and-forget ([`MessageHandler::send`]),
//! - call: one reply correlated by a [`CallId`] ([`MessageHandler::send_with_promise`]),
//! - stream: chunks with credit based flow control ([`MessageHandler::send_with_stream`]).
//!
//! A reply for an unknown call, or a call for an action nobody registered, means both sides disagree about
//! the conversation. The handler then rejects everything that is still pending and refuses further work.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::oneshot;

use crate::channel::{Channel, ListenerId};
use crate::errors::{wrap_reason, ChannelError, MessageError, ProtocolError, RemoteError};
use crate::sync::lock;

mod action;
mod envelope;
mod sink;
mod stream;

pub use action::{Action, ActionKind};
pub use envelope::{CallId, Envelope, Message, Payload, ReplyMode, SharedBuffer, StreamEvent, StreamId};
pub use sink::StreamSink;
pub use stream::{QueuingStrategy, ReadableStream, SizeFn};

use stream::StreamController;

type NotifyFn = Arc<dyn Fn(Payload) + Send + Sync>;
type CallFn = Arc<dyn Fn(Payload) -> BoxFuture<'static, anyhow::Result<Payload>> + Send + Sync>;
type StreamFn = Arc<dyn Fn(Payload, StreamSink) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Clone)]
enum Handler {
    Notify(NotifyFn),
    Call(CallFn),
    Stream(StreamFn),
}

#[derive(Default)]
struct HandlerState {
    pending_calls: HashMap<CallId, oneshot::Sender<Result<Payload, MessageError>>>,
    sinks: HashMap<StreamId, StreamSink>,
    streams: HashMap<StreamId, Arc<StreamController>>,
    /// Set once the handler is destroyed or out of sync with its peer
    failure: Option<MessageError>,
}

pub struct MessageHandler {
    source_name: String,
    target_name: String,
    channel: Arc<dyn Channel>,
    listener: Mutex<Option<ListenerId>>,
    next_call_id: AtomicU64,
    next_stream_id: AtomicU64,
    actions: Mutex<HashMap<Action, Handler>>,
    state: Mutex<HandlerState>,
}

impl MessageHandler {
    /// Creates a handler and starts listening on `channel`. Must be called from within a tokio runtime.
    pub fn new(
        source_name: impl Into<String>,
        target_name: impl Into<String>,
        channel: Arc<dyn Channel>,
    ) -> Arc<MessageHandler> {
        let handler = Arc::new(MessageHandler {
            source_name: source_name.into(),
            target_name: target_name.into(),
            channel: channel.clone(),
            listener: Mutex::new(None),
            next_call_id: AtomicU64::new(1),
            next_stream_id: AtomicU64::new(1),
            actions: Mutex::new(HashMap::new()),
            state: Mutex::new(HandlerState::default()),
        });

        let weak = Arc::downgrade(&handler);
        let listener = channel.on_message(Arc::new(move |envelope| {
            if let Some(handler) = weak.upgrade() {
                handler.on_message(envelope);
            }
        }));
        *lock(&handler.listener) = Some(listener);

        handler
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    pub fn channel(&self) -> Arc<dyn Channel> {
        self.channel.clone()
    }

    pub fn on_notify<F>(&self, action: Action, f: F) -> Result<(), ProtocolError>
    where
        F: Fn(Payload) + Send + Sync + 'static,
    {
        self.register(action, ActionKind::Notify, Handler::Notify(Arc::new(f)))
    }

    pub fn on_call<F, Fut>(&self, action: Action, f: F) -> Result<(), ProtocolError>
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Payload>> + Send + 'static,
    {
        let f: CallFn = Arc::new(move |data| f(data).boxed());
        self.register(action, ActionKind::Call, Handler::Call(f))
    }

    pub fn on_stream<F, Fut>(&self, action: Action, f: F) -> Result<(), ProtocolError>
    where
        F: Fn(Payload, StreamSink) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let f: StreamFn = Arc::new(move |data, sink| f(data, sink).boxed());
        self.register(action, ActionKind::Stream, Handler::Stream(f))
    }

    fn register(&self, action: Action, kind: ActionKind, handler: Handler) -> Result<(), ProtocolError> {
        check_kind(action, kind)?;
        let mut actions = lock(&self.actions);
        if actions.contains_key(&action) {
            return Err(ProtocolError::DuplicateHandler(action));
        }
        actions.insert(action, handler);
        Ok(())
    }

    /// Fire-and-forget.
    pub fn send(&self, action: Action, data: Payload) -> Result<(), MessageError> {
        self.send_with_transfers(action, data, &[])
    }

    pub fn send_with_transfers(
        &self,
        action: Action,
        data: Payload,
        transfers: &[SharedBuffer],
    ) -> Result<(), MessageError> {
        check_kind(action, ActionKind::Notify)?;
        self.check_usable()?;
        let message = Message::Call { action, reply: ReplyMode::None, data };
        Ok(self.post(message, transfers)?)
    }

    /// Sends a call and waits for the reply with the matching call id.
    pub async fn send_with_promise(&self, action: Action, data: Payload) -> Result<Payload, MessageError> {
        check_kind(action, ActionKind::Call)?;
        let call_id = CallId(self.next_call_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();
        {
            let mut state = lock(&self.state);
            if let Some(failure) = &state.failure {
                return Err(failure.clone());
            }
            state.pending_calls.insert(call_id, tx);
        }

        let message = Message::Call { action, reply: ReplyMode::Promise(call_id), data };
        if let Err(err) = self.post(message, &[]) {
            lock(&self.state).pending_calls.remove(&call_id);
            return Err(err.into());
        }

        rx.await.unwrap_or(Err(MessageError::Destroyed))
    }

    /// Opens a stream. Chunks are read from the returned consumer; the producer is granted
    /// `strategy.high_water_mark` units of credit up front.
    pub fn send_with_stream(
        self: &Arc<Self>,
        action: Action,
        data: Payload,
        strategy: QueuingStrategy,
    ) -> Result<ReadableStream, MessageError> {
        check_kind(action, ActionKind::Stream)?;
        let stream_id = StreamId(self.next_stream_id.fetch_add(1, Ordering::SeqCst));
        let controller = Arc::new(StreamController::new(stream_id, strategy));
        {
            let mut state = lock(&self.state);
            if let Some(failure) = &state.failure {
                return Err(failure.clone());
            }
            state.streams.insert(stream_id, controller.clone());
        }

        let message = Message::Call {
            action,
            reply: ReplyMode::Stream { stream_id, desired_size: controller.desired_size() },
            data,
        };
        if let Err(err) = self.post(message, &[]) {
            lock(&self.state).streams.remove(&stream_id);
            return Err(err.into());
        }

        Ok(ReadableStream::new(self.clone(), controller))
    }

    /// Detaches from the channel and rejects every pending call and stream.
    pub fn destroy(&self) {
        self.shutdown(MessageError::Destroyed);
    }

    pub fn is_destroyed(&self) -> bool {
        lock(&self.state).failure.is_some()
    }

    /// Rejects every pending call and consumer stream with `failure` but stays attached, so calls made
    /// afterwards still work.
    pub(crate) fn reject_pending(&self, failure: MessageError) {
        let (calls, streams) = {
            let mut state = lock(&self.state);
            (std::mem::take(&mut state.pending_calls), std::mem::take(&mut state.streams))
        };
        for (_, tx) in calls {
            let _ = tx.send(Err(failure.clone()));
        }
        for (_, controller) in streams {
            controller.fail(failure.clone());
        }
    }

    fn check_usable(&self) -> Result<(), MessageError> {
        match &lock(&self.state).failure {
            Some(failure) => Err(failure.clone()),
            None => Ok(()),
        }
    }

    fn shutdown(&self, failure: MessageError) {
        let (calls, streams, sinks) = {
            let mut state = lock(&self.state);
            if state.failure.is_some() {
                return;
            }
            state.failure = Some(failure.clone());
            (
                std::mem::take(&mut state.pending_calls),
                std::mem::take(&mut state.streams),
                std::mem::take(&mut state.sinks),
            )
        };
        if let Some(listener) = lock(&self.listener).take() {
            self.channel.remove_listener(listener);
        }

        for (_, tx) in calls {
            let _ = tx.send(Err(failure.clone()));
        }
        for (_, controller) in streams {
            controller.fail(failure.clone());
        }
        for (_, sink) in sinks {
            let _ = sink.apply_cancel(RemoteError::abort(failure.to_string()));
        }
    }

    fn desync(&self, err: ProtocolError) {
        log::error!("MessageHandler[{}]: {}", self.source_name, err);
        self.shutdown(MessageError::Protocol(err));
    }

    fn post(&self, message: Message, transfers: &[SharedBuffer]) -> Result<(), ChannelError> {
        let envelope = Envelope {
            source: self.source_name.clone(),
            target: self.target_name.clone(),
            message,
        };
        self.channel.send(envelope, transfers)
    }

    pub(crate) fn post_stream_event(
        &self,
        stream_id: StreamId,
        event: StreamEvent,
        transfers: &[SharedBuffer],
    ) -> Result<(), ChannelError> {
        self.post(Message::Stream { stream_id, event }, transfers)
    }

    pub(crate) fn remove_sink(&self, stream_id: StreamId) {
        lock(&self.state).sinks.remove(&stream_id);
    }

    pub(crate) fn pull_if_needed(&self, controller: &Arc<StreamController>) {
        let Some(desired_size) = controller.take_pull_request() else {
            return;
        };
        let event = StreamEvent::Pull { desired_size };
        if let Err(err) = self.post_stream_event(controller.stream_id(), event, &[]) {
            controller.fail(err.into());
            self.release_stream(controller);
        }
    }

    pub(crate) fn release_stream(&self, controller: &Arc<StreamController>) {
        if controller.is_settled() {
            lock(&self.state).streams.remove(&controller.stream_id());
        }
    }

    fn on_message(self: &Arc<Self>, envelope: Envelope) {
        if envelope.target != self.source_name {
            return;
        }
        if self.is_destroyed() {
            log::trace!("MessageHandler[{}]: dropping message after shutdown", self.source_name);
            return;
        }

        match envelope.message {
            Message::Stream { stream_id, event } => self.process_stream_event(stream_id, event),
            Message::Reply { call_id, outcome } => {
                let pending = lock(&self.state).pending_calls.remove(&call_id);
                match pending {
                    Some(tx) => {
                        let _ = tx.send(outcome.map_err(MessageError::from));
                    }
                    None => self.desync(ProtocolError::UnknownCallback(call_id)),
                }
            }
            Message::Call { action, reply, data } => self.dispatch(action, reply, data, envelope.source),
        }
    }

    fn dispatch(self: &Arc<Self>, action: Action, reply: ReplyMode, data: Payload, origin: String) {
        let handler = lock(&self.actions).get(&action).cloned();
        let Some(handler) = handler else {
            // Answer the caller before giving up, so it is not left waiting.
            if let ReplyMode::Promise(call_id) = reply {
                let outcome = Err(RemoteError::unknown(format!("Unknown action from worker: {action}")));
                let _ = self.post(Message::Reply { call_id, outcome }, &[]);
            }
            self.desync(ProtocolError::UnknownAction { action, origin });
            return;
        };

        match (handler, reply) {
            (Handler::Notify(f), ReplyMode::None) => f(data),
            (Handler::Call(f), ReplyMode::Promise(call_id)) => {
                let this = self.clone();
                tokio::spawn(async move {
                    let outcome = f(data).await.map_err(wrap_reason);
                    if let Err(err) = this.post(Message::Reply { call_id, outcome }, &[]) {
                        log::debug!("MessageHandler[{}]: cannot reply to {}: {}", this.source_name, action, err);
                    }
                });
            }
            (Handler::Stream(f), ReplyMode::Stream { stream_id, desired_size }) => {
                let sink = StreamSink::new(stream_id, Arc::downgrade(self), desired_size);
                lock(&self.state).sinks.insert(stream_id, sink.clone());
                let this = self.clone();
                tokio::spawn(async move {
                    let outcome = f(data, sink).await.map_err(wrap_reason);
                    let event = StreamEvent::StartComplete(outcome);
                    if let Err(err) = this.post_stream_event(stream_id, event, &[]) {
                        log::debug!("MessageHandler[{}]: cannot start {}: {}", this.source_name, action, err);
                    }
                });
            }
            (_, reply) => {
                log::error!(
                    "MessageHandler[{}]: {} received with reply mode {:?}",
                    self.source_name,
                    action,
                    reply
                );
                self.desync(ProtocolError::WrongKind {
                    action,
                    expected: action.kind(),
                    actual: match reply {
                        ReplyMode::None => ActionKind::Notify,
                        ReplyMode::Promise(_) => ActionKind::Call,
                        ReplyMode::Stream { .. } => ActionKind::Stream,
                    },
                });
            }
        }
    }

    fn process_stream_event(self: &Arc<Self>, stream_id: StreamId, event: StreamEvent) {
        match event {
            StreamEvent::Pull { desired_size } => self.on_pull(stream_id, desired_size),
            StreamEvent::Cancel { reason } => self.on_cancel(stream_id, reason),
            event => {
                let controller = lock(&self.state).streams.get(&stream_id).cloned();
                let Some(controller) = controller else {
                    log::debug!("MessageHandler[{}]: event for released stream {}", self.source_name, stream_id);
                    return;
                };
                let pulled = matches!(event, StreamEvent::StartComplete(_) | StreamEvent::PullComplete(_));
                controller.handle_event(event);
                if pulled {
                    self.pull_if_needed(&controller);
                }
                self.release_stream(&controller);
            }
        }
    }

    fn on_pull(self: &Arc<Self>, stream_id: StreamId, desired_size: i64) {
        let sink = lock(&self.state).sinks.get(&stream_id).cloned();
        let Some(sink) = sink else {
            // Pull after close
            let _ = self.post_stream_event(stream_id, StreamEvent::PullComplete(Ok(())), &[]);
            return;
        };

        let callback = sink.apply_pull(desired_size);
        let this = self.clone();
        tokio::spawn(async move {
            let outcome = match callback {
                Some(on_pull) => on_pull().await.map_err(wrap_reason),
                None => Ok(()),
            };
            if let Err(outcome) = &outcome {
                log::debug!("MessageHandler[{}]: pull on stream {} failed: {}", this.source_name, stream_id, outcome);
            }
            let _ = this.post_stream_event(stream_id, StreamEvent::PullComplete(outcome), &[]);
        });
    }

    fn on_cancel(self: &Arc<Self>, stream_id: StreamId, reason: RemoteError) {
        let sink = lock(&self.state).sinks.remove(&stream_id);
        let Some(sink) = sink else {
            let _ = self.post_stream_event(stream_id, StreamEvent::CancelComplete(Ok(())), &[]);
            return;
        };

        let callback = sink.apply_cancel(reason.clone());
        let this = self.clone();
        tokio::spawn(async move {
            let outcome = match callback {
                Some(on_cancel) => on_cancel(reason).await.map_err(wrap_reason),
                None => Ok(()),
            };
            let _ = this.post_stream_event(stream_id, StreamEvent::CancelComplete(outcome), &[]);
        });
    }
}

impl Drop for MessageHandler {
    fn drop(&mut self) {
        if let Some(listener) = lock(&self.listener).take() {
            self.channel.remove_listener(listener);
        }
    }
}

impl fmt::Debug for MessageHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageHandler")
            .field("source_name", &self.source_name)
            .field("target_name", &self.target_name)
            .finish()
    }
}

fn check_kind(action: Action, expected: ActionKind) -> Result<(), ProtocolError> {
    let actual = action.kind();
    if actual != expected {
        return Err(ProtocolError::WrongKind { action, expected, actual });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::LoopbackChannel;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn within<F: Future>(f: F) -> F::Output {
        tokio::time::timeout(TIMEOUT, f).await.expect("timed out")
    }

    fn pair() -> (Arc<MessageHandler>, Arc<MessageHandler>) {
        let (main_end, worker_end) = LoopbackChannel::pair();
        (
            MessageHandler::new("main", "worker", main_end),
            MessageHandler::new("worker", "main", worker_end),
        )
    }

    fn sized(value: i64, size: i64) -> Payload {
        Payload::new(json!({ "value": value, "size": size }))
    }

    #[tokio::test]
    async fn echo_resolves_with_handler_result() {
        let (main, worker) = pair();
        worker
            .on_call(Action::Echo, |data| async move {
                assert_eq!(data.data, json!({ "v": 1 }));
                Ok(Payload::new(json!({ "v": 2 })))
            })
            .unwrap();

        let reply = within(main.send_with_promise(Action::Echo, json!({ "v": 1 }).into())).await.unwrap();
        assert_eq!(reply.data, json!({ "v": 2 }));
    }

    #[tokio::test]
    async fn concurrent_replies_match_their_calls() {
        let (main, worker) = pair();
        worker
            .on_call(Action::Echo, |data| async move {
                let delay = data.data["delay"].as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(data)
            })
            .unwrap();

        let (slow, medium, fast) = within(async {
            tokio::join!(
                main.send_with_promise(Action::Echo, json!({ "id": 1, "delay": 60 }).into()),
                main.send_with_promise(Action::Echo, json!({ "id": 2, "delay": 30 }).into()),
                main.send_with_promise(Action::Echo, json!({ "id": 3, "delay": 0 }).into()),
            )
        })
        .await;

        assert_eq!(slow.unwrap().data["id"], 1);
        assert_eq!(medium.unwrap().data["id"], 2);
        assert_eq!(fast.unwrap().data["id"], 3);
    }

    #[tokio::test]
    async fn handler_errors_become_remote_errors() {
        let (main, worker) = pair();
        worker
            .on_call(Action::GetData, |_| async move {
                Err::<Payload, _>(anyhow::Error::new(RemoteError::MissingDocument { message: "gone".into() }))
            })
            .unwrap();
        worker
            .on_call(Action::Cleanup, |_| async move { Err::<Payload, _>(anyhow::anyhow!("boom")) })
            .unwrap();

        let err = within(main.send_with_promise(Action::GetData, Payload::empty())).await.unwrap_err();
        assert!(matches!(err, MessageError::Remote(RemoteError::MissingDocument { .. })));

        let err = within(main.send_with_promise(Action::Cleanup, Payload::empty())).await.unwrap_err();
        assert!(matches!(err, MessageError::Remote(RemoteError::Unknown { ref message, .. }) if message == "boom"));
    }

    #[tokio::test]
    async fn registration_is_validated() {
        let (_main, worker) = pair();
        worker.on_call(Action::Echo, |data| async move { Ok(data) }).unwrap();

        let err = worker.on_call(Action::Echo, |data| async move { Ok(data) }).unwrap_err();
        assert_eq!(err, ProtocolError::DuplicateHandler(Action::Echo));

        let err = worker.on_notify(Action::GetPage, |_| {}).unwrap_err();
        assert!(matches!(err, ProtocolError::WrongKind { action: Action::GetPage, .. }));

        let err = worker.send(Action::Echo, Payload::empty()).unwrap_err();
        assert!(matches!(err, MessageError::Protocol(ProtocolError::WrongKind { .. })));
    }

    #[tokio::test]
    async fn unknown_reply_desyncs_the_handler() {
        let (main_end, worker_end) = LoopbackChannel::pair();
        let main = MessageHandler::new("main", "worker", main_end);
        worker_end
            .send(
                Envelope {
                    source: "worker".into(),
                    target: "main".into(),
                    message: Message::Reply { call_id: CallId(42), outcome: Ok(Payload::empty()) },
                },
                &[],
            )
            .unwrap();

        within(async {
            while !main.is_destroyed() {
                tokio::task::yield_now().await;
            }
        })
        .await;

        let err = main.send_with_promise(Action::Echo, Payload::empty()).await.unwrap_err();
        assert!(matches!(err, MessageError::Protocol(ProtocolError::UnknownCallback(CallId(42)))));
    }

    #[tokio::test]
    async fn unknown_action_fails_the_caller() {
        let (main, worker) = pair();
        let err = within(main.send_with_promise(Action::Echo, Payload::empty())).await.unwrap_err();
        assert!(matches!(err, MessageError::Remote(RemoteError::Unknown { .. })));
        assert!(worker.is_destroyed());
    }

    #[tokio::test]
    async fn destroy_rejects_pending_calls() {
        let (main, worker) = pair();
        worker
            .on_call(Action::Echo, |_| async move {
                futures::future::pending::<()>().await;
                Ok(Payload::empty())
            })
            .unwrap();

        let caller = main.clone();
        let call = tokio::spawn(async move { caller.send_with_promise(Action::Echo, Payload::empty()).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        main.destroy();

        let outcome = within(call).await.unwrap();
        assert!(matches!(outcome, Err(MessageError::Destroyed)));
        assert!(matches!(main.send(Action::Test, Payload::empty()), Err(MessageError::Destroyed)));
    }

    #[tokio::test]
    async fn pull_driven_stream_reads_in_order() {
        let (main, worker) = pair();
        let pulls = Arc::new(AtomicUsize::new(0));
        let counter = pulls.clone();
        worker
            .on_stream(Action::GetOperatorList, move |_data, sink: StreamSink| {
                let counter = counter.clone();
                let next = Arc::new(AtomicUsize::new(0));
                let producer = sink.clone();
                sink.set_on_pull(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let n = next.fetch_add(1, Ordering::SeqCst);
                    if n < 3 {
                        producer.enqueue(Payload::new(json!(n)), 1, &[]);
                    } else {
                        producer.close();
                    }
                    async { Ok::<_, anyhow::Error>(()) }
                });
                async { Ok::<_, anyhow::Error>(()) }
            })
            .unwrap();

        let stream = main
            .send_with_stream(Action::GetOperatorList, Payload::empty(), QueuingStrategy::new(1))
            .unwrap();
        let mut values = Vec::new();
        while let Some(chunk) = within(stream.read()).await {
            values.push(chunk.unwrap().data.as_u64().unwrap());
        }

        assert_eq!(values, vec![0, 1, 2]);
        // One pull per read: three that produce a chunk, one that closes.
        assert_eq!(pulls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn chunk_enqueued_at_start_is_read_without_a_pull() {
        let (main, worker) = pair();
        let pulls = Arc::new(AtomicUsize::new(0));
        let counter = pulls.clone();
        worker
            .on_stream(Action::GetOperatorList, move |_data, sink: StreamSink| {
                let counter = counter.clone();
                let next = Arc::new(AtomicUsize::new(1));
                sink.enqueue(Payload::new(json!(0)), 1, &[]);
                let producer = sink.clone();
                sink.set_on_pull(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let n = next.fetch_add(1, Ordering::SeqCst);
                    if n < 3 {
                        producer.enqueue(Payload::new(json!(n)), 1, &[]);
                    } else {
                        producer.close();
                    }
                    async { Ok::<_, anyhow::Error>(()) }
                });
                async { Ok::<_, anyhow::Error>(()) }
            })
            .unwrap();

        let stream = main
            .send_with_stream(Action::GetOperatorList, Payload::empty(), QueuingStrategy::new(1))
            .unwrap();
        let mut values = Vec::new();
        while let Some(chunk) = within(stream.read()).await {
            values.push(chunk.unwrap().data.as_u64().unwrap());
            // Never more pulls than chunks read so far.
            assert!(pulls.load(Ordering::SeqCst) <= values.len());
        }

        assert_eq!(values, vec![0, 1, 2]);
        // The start chunk needs no pull: one per later chunk and one that closes.
        assert_eq!(pulls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn credit_is_spent_by_enqueue_and_reset_by_pull() {
        let (main, worker) = pair();
        let (sink_tx, sink_rx) = oneshot::channel();
        let sink_tx = Mutex::new(Some(sink_tx));
        worker
            .on_stream(Action::GetTextContent, move |_data, sink: StreamSink| {
                sink.enqueue(sized(1, 1), 1, &[]);
                sink.enqueue(sized(2, 1), 1, &[]);
                sink.enqueue(sized(3, 3), 3, &[]);
                if let Some(tx) = sink_tx.lock().unwrap().take() {
                    let _ = tx.send(sink);
                }
                async { Ok::<_, anyhow::Error>(()) }
            })
            .unwrap();

        let strategy = QueuingStrategy::new(2).with_size(|chunk| chunk.data["size"].as_i64().unwrap_or(1));
        let stream = main.send_with_stream(Action::GetTextContent, Payload::empty(), strategy).unwrap();
        let sink = within(sink_rx).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // 2 - (1 + 1 + 3)
        assert_eq!(sink.desired_size(), -3);
        assert!(tokio::time::timeout(Duration::from_millis(50), sink.ready()).await.is_err());

        for expected in 1..=3 {
            let chunk = within(stream.read()).await.unwrap().unwrap();
            assert_eq!(chunk.data["value"], expected);
        }

        // Draining the queue makes the consumer pull with its full credit again.
        within(sink.ready()).await.unwrap();
        assert_eq!(sink.desired_size(), 2);
        assert_eq!(stream.desired_size(), 2);
    }

    #[tokio::test]
    async fn cancel_after_close_is_a_noop() {
        let (main, worker) = pair();
        let (sink_tx, sink_rx) = oneshot::channel();
        let sink_tx = Mutex::new(Some(sink_tx));
        worker
            .on_stream(Action::GetTextContent, move |_data, sink: StreamSink| {
                sink.enqueue(sized(1, 1), 1, &[]);
                sink.close();
                if let Some(tx) = sink_tx.lock().unwrap().take() {
                    let _ = tx.send(sink);
                }
                async { Ok::<_, anyhow::Error>(()) }
            })
            .unwrap();

        let stream = main
            .send_with_stream(Action::GetTextContent, Payload::empty(), QueuingStrategy::new(4))
            .unwrap();
        assert!(within(stream.read()).await.unwrap().is_ok());
        assert!(within(stream.read()).await.is_none());
        within(stream.cancel(RemoteError::abort("too late"))).await.unwrap();

        let sink = within(sink_rx).await.unwrap();
        let credit = sink.desired_size();
        sink.enqueue(sized(2, 1), 1, &[]);
        assert_eq!(sink.desired_size(), credit);
        assert!(sink.is_cancelled());
        assert!(within(stream.read()).await.is_none());
    }

    #[tokio::test]
    async fn consumer_cancel_reaches_the_producer() {
        let (main, worker) = pair();
        let (sink_tx, sink_rx) = oneshot::channel();
        let (reason_tx, reason_rx) = oneshot::channel();
        let sink_tx = Mutex::new(Some(sink_tx));
        let reason_tx = Arc::new(Mutex::new(Some(reason_tx)));
        worker
            .on_stream(Action::GetOperatorList, move |_data, sink: StreamSink| {
                let reason_tx = reason_tx.clone();
                sink.set_on_cancel(move |reason| {
                    if let Some(tx) = reason_tx.lock().unwrap().take() {
                        let _ = tx.send(reason);
                    }
                    async { Ok::<_, anyhow::Error>(()) }
                });
                if let Some(tx) = sink_tx.lock().unwrap().take() {
                    let _ = tx.send(sink);
                }
                async { Ok::<_, anyhow::Error>(()) }
            })
            .unwrap();

        let stream = main
            .send_with_stream(Action::GetOperatorList, Payload::empty(), QueuingStrategy::new(1))
            .unwrap();
        let sink = within(sink_rx).await.unwrap();

        within(stream.cancel(RemoteError::abort("zoomed away"))).await.unwrap();
        assert_eq!(within(reason_rx).await.unwrap(), RemoteError::abort("zoomed away"));
        assert!(sink.is_cancelled());
        assert_eq!(within(sink.ready()).await, Err(RemoteError::abort("zoomed away")));

        let credit = sink.desired_size();
        sink.enqueue(Payload::empty(), 1, &[]);
        assert_eq!(sink.desired_size(), credit);
        assert!(within(stream.read()).await.is_none());
    }

    #[tokio::test]
    async fn producer_errors_reach_every_read() {
        let (main, worker) = pair();
        worker
            .on_stream(Action::GetTextContent, |_data, sink: StreamSink| {
                sink.error(RemoteError::InvalidDocument { message: "bad stream".into() });
                async { Ok::<_, anyhow::Error>(()) }
            })
            .unwrap();

        let stream = main
            .send_with_stream(Action::GetTextContent, Payload::empty(), QueuingStrategy::default())
            .unwrap();
        for _ in 0..2 {
            let err = within(stream.read()).await.unwrap().unwrap_err();
            assert!(matches!(err, MessageError::Remote(RemoteError::InvalidDocument { .. })));
        }
    }

    #[tokio::test]
    async fn stream_adapter_collects_chunks() {
        use futures::StreamExt;

        let (main, worker) = pair();
        worker
            .on_stream(Action::GetTextContent, |_data, sink: StreamSink| async move {
                for n in 0..5 {
                    sink.ready().await?;
                    sink.enqueue(Payload::new(json!(n)), 1, &[]);
                }
                sink.close();
                Ok(())
            })
            .unwrap();

        let stream = main
            .send_with_stream(Action::GetTextContent, Payload::empty(), QueuingStrategy::new(2))
            .unwrap();
        let values: Vec<u64> = within(stream.into_stream().map(|c| c.unwrap().data.as_u64().unwrap()).collect()).await;
        assert_eq!(values, vec![0, 1, 2, 3, 4]);
    }
}
