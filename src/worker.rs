//! Backend execution context.
//!
//! A [`Worker`] starts the backend on its own thread and negotiates with it: the client sends a `Test`
//! probe carrying a one byte buffer, the backend answers with whether transfers survived the trip. The
//! backend also sends `Ready` once it has bootstrapped, which re-sends the probe since either side can be
//! first.
//!
//! When the thread cannot be started, fails, or answers the probe without a buffer, the worker tears the
//! attempt down and runs the backend on a [`LoopbackChannel`] inside the current runtime instead. Callers
//! never see the difference: [`Worker::ready`] eventually yields a message handler either way.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use lazy_static::lazy_static;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::backend::{self, DocumentProvider};
use crate::channel::{Channel, ChannelId, LoopbackChannel, ThreadChannel};
use crate::config::WorkerOptions;
use crate::document::{Configure, ProbeReply};
use crate::errors::{ChannelError, WorkerError};
use crate::message_handler::{Action, MessageHandler, Payload, SharedBuffer};
use crate::sync::lock;

lazy_static! {
    /// Worker bound to each externally supplied port.
    static ref WORKER_PORTS: Mutex<HashMap<ChannelId, Weak<Worker>>> = Mutex::new(HashMap::new());
}

static FAKE_WORKER_ID: AtomicUsize = AtomicUsize::new(0);

/// Starts a backend in a separate execution context and returns the client end of its channel.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, name: &str, provider: Arc<dyn DocumentProvider>) -> Result<Arc<dyn Channel>, ChannelError>;
}

/// Runs the backend on a dedicated OS thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSpawner;

impl WorkerSpawner for ThreadSpawner {
    fn spawn(&self, name: &str, provider: Arc<dyn DocumentProvider>) -> Result<Arc<dyn Channel>, ChannelError> {
        let channel: Arc<dyn Channel> = ThreadChannel::spawn(name, move |endpoint| {
            let handler = MessageHandler::new("worker", "main", endpoint);
            backend::setup(&handler, provider)?;
            handler.send(Action::Ready, Payload::empty())?;
            Ok(handler)
        })?;
        Ok(channel)
    }
}

#[derive(Clone)]
enum Readiness {
    Pending,
    Ready(Arc<MessageHandler>),
    Failed(WorkerError),
}

#[derive(Default)]
struct WorkerInner {
    name: String,
    channel: Option<Arc<dyn Channel>>,
    handler: Option<Arc<MessageHandler>>,
    /// Backend side of a loopback worker
    backend: Option<Arc<MessageHandler>>,
    loopback: bool,
}

pub struct Worker {
    options: WorkerOptions,
    provider: Option<Arc<dyn DocumentProvider>>,
    port: Option<ChannelId>,
    readiness: watch::Sender<Readiness>,
    support_transfers: AtomicBool,
    inner: Mutex<WorkerInner>,
    destroyed: CancellationToken,
    runtime: Handle,
}

impl Worker {
    /// Starts a worker thread for `provider`, falling back to a loopback worker if that fails. Must be
    /// called from within a tokio runtime.
    pub fn new(provider: Arc<dyn DocumentProvider>, options: WorkerOptions) -> Arc<Worker> {
        Self::with_spawner(provider, options, &ThreadSpawner)
    }

    pub fn with_spawner(
        provider: Arc<dyn DocumentProvider>,
        options: WorkerOptions,
        spawner: &dyn WorkerSpawner,
    ) -> Arc<Worker> {
        let worker = Arc::new(Self::create(options, Some(provider.clone()), None));
        if worker.options.disable_worker {
            worker.setup_fake_worker();
            return worker;
        }

        match spawner.spawn(&worker.options.name, provider) {
            Ok(channel) => worker.initialize(channel),
            Err(err) => {
                log::info!("Worker[{}]: the worker has been disabled: {}", worker.options.name, err);
                worker.setup_fake_worker();
            }
        }
        worker
    }

    /// Returns the worker already bound to `channel`, or binds a new one. The backend on the other end of
    /// `channel` is expected to be set up already.
    pub fn from_port(channel: Arc<dyn Channel>, options: WorkerOptions) -> Arc<Worker> {
        let id = channel.id();
        let mut ports = lock(&WORKER_PORTS);
        if let Some(worker) = ports.get(&id).and_then(Weak::upgrade) {
            return worker;
        }
        let worker = Self::bind_port(channel, options);
        ports.insert(id, Arc::downgrade(&worker));
        worker
    }

    /// Binds a new worker to `channel`. Fails if another worker is bound to it.
    pub fn with_port(channel: Arc<dyn Channel>, options: WorkerOptions) -> Result<Arc<Worker>, WorkerError> {
        let id = channel.id();
        let mut ports = lock(&WORKER_PORTS);
        if ports.get(&id).is_some_and(|worker| worker.strong_count() > 0) {
            return Err(WorkerError::PortInUse);
        }
        let worker = Self::bind_port(channel, options);
        ports.insert(id, Arc::downgrade(&worker));
        Ok(worker)
    }

    fn bind_port(channel: Arc<dyn Channel>, options: WorkerOptions) -> Arc<Worker> {
        let worker = Arc::new(Self::create(options, None, Some(channel.id())));
        let handler = MessageHandler::new("main", "worker", channel.clone());
        if let Err(err) = handler.on_notify(Action::Ready, |_| {}) {
            log::warn!("Worker[{}]: {}", worker.options.name, err);
        }
        {
            let mut inner = lock(&worker.inner);
            inner.channel = Some(channel);
            inner.handler = Some(handler.clone());
        }
        worker.settle(Readiness::Ready(handler));
        worker
    }

    fn create(options: WorkerOptions, provider: Option<Arc<dyn DocumentProvider>>, port: Option<ChannelId>) -> Worker {
        let (readiness, _) = watch::channel(Readiness::Pending);
        Worker {
            support_transfers: AtomicBool::new(options.post_message_transfers),
            inner: Mutex::new(WorkerInner { name: options.name.clone(), ..Default::default() }),
            options,
            provider,
            port,
            readiness,
            destroyed: CancellationToken::new(),
            runtime: Handle::current(),
        }
    }

    /// The handler that talks to the backend, once negotiation has finished.
    pub async fn ready(&self) -> Result<Arc<MessageHandler>, WorkerError> {
        let mut rx = self.readiness.subscribe();
        let readiness = rx
            .wait_for(|readiness| !matches!(readiness, Readiness::Pending))
            .await
            .map_err(|_| WorkerError::Destroyed)?
            .clone();
        if self.is_destroyed() {
            return Err(WorkerError::Destroyed);
        }
        match readiness {
            Readiness::Ready(handler) => Ok(handler),
            Readiness::Failed(err) => Err(err),
            Readiness::Pending => Err(WorkerError::Destroyed),
        }
    }

    pub fn name(&self) -> String {
        lock(&self.inner).name.clone()
    }

    /// Whether buffers can be moved to the backend instead of copied.
    pub fn support_transfers(&self) -> bool {
        self.support_transfers.load(Ordering::SeqCst)
    }

    /// Whether the backend runs on a loopback channel in this runtime.
    pub fn is_loopback(&self) -> bool {
        lock(&self.inner).loopback
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.is_cancelled()
    }

    /// Stops the backend and rejects anyone still waiting for readiness.
    pub fn destroy(&self) {
        if self.destroyed.is_cancelled() {
            return;
        }
        self.destroyed.cancel();

        let inner = std::mem::take(&mut *lock(&self.inner));
        if let Some(handler) = inner.handler {
            handler.destroy();
        }
        if let Some(backend) = inner.backend {
            backend.destroy();
        }
        if let Some(channel) = inner.channel {
            channel.close();
        }
        if let Some(port) = self.port {
            let mut ports = lock(&WORKER_PORTS);
            // The port may have been bound again since this worker registered.
            if ports.get(&port).is_some_and(|bound| std::ptr::eq(bound.as_ptr(), self)) {
                ports.remove(&port);
            }
        }
        self.settle(Readiness::Failed(WorkerError::Destroyed));
        log::debug!("Worker[{}]: destroyed", inner.name);
    }

    /// Moves out of `Pending`. Later outcomes are ignored.
    fn settle(&self, outcome: Readiness) -> bool {
        self.readiness.send_if_modified(|current| {
            if !matches!(current, Readiness::Pending) {
                return false;
            }
            *current = outcome;
            true
        })
    }

    fn is_pending(&self) -> bool {
        matches!(*self.readiness.borrow(), Readiness::Pending)
    }

    fn initialize(self: &Arc<Self>, channel: Arc<dyn Channel>) {
        let handler = MessageHandler::new("main", "worker", channel.clone());
        {
            let mut inner = lock(&self.inner);
            inner.channel = Some(channel.clone());
            inner.handler = Some(handler.clone());
        }

        let weak = Arc::downgrade(self);
        let registered = handler
            .on_notify(Action::Test, move |data| {
                let Some(worker) = weak.upgrade() else {
                    return;
                };
                match data.decode::<Option<ProbeReply>>() {
                    Ok(Some(reply)) => worker.on_probe_reply(reply),
                    Ok(None) => worker.fall_back("the worker cannot receive binary data"),
                    Err(err) => worker.fall_back(&format!("invalid probe reply: {err}")),
                }
            })
            .and_then(|_| {
                let weak = Arc::downgrade(self);
                handler.on_notify(Action::Ready, move |_| {
                    if let Some(worker) = weak.upgrade() {
                        worker.send_probe();
                    }
                })
            });
        if let Err(err) = registered {
            self.fall_back(&err.to_string());
            return;
        }

        // Observers may run on the worker thread.
        let weak = Arc::downgrade(self);
        let runtime = self.runtime.clone();
        channel.on_error(Arc::new(move |reason| {
            let weak = weak.clone();
            runtime.spawn(async move {
                if let Some(worker) = weak.upgrade() {
                    worker.fall_back(&reason);
                }
            });
        }));

        self.send_probe();
    }

    fn send_probe(self: &Arc<Self>) {
        if self.is_destroyed() || !self.is_pending() {
            return;
        }
        let Some(handler) = lock(&self.inner).handler.clone() else {
            return;
        };

        let transfers = self.options.post_message_transfers;
        let probe = SharedBuffer::from(vec![if transfers { 255 } else { 0 }]);
        let payload = Payload::empty().with_buffer(probe.clone());
        let sent = if transfers {
            handler.send_with_transfers(Action::Test, payload, &[probe])
        } else {
            handler.send(Action::Test, payload)
        };
        if let Err(err) = sent {
            self.fall_back(&format!("cannot send probe: {err}"));
        }
    }

    fn on_probe_reply(&self, reply: ProbeReply) {
        let handler = {
            let inner = lock(&self.inner);
            if inner.loopback {
                return;
            }
            inner.handler.clone()
        };
        let Some(handler) = handler else {
            return;
        };
        if self.is_destroyed() || !self.is_pending() {
            return;
        }

        if !reply.support_transfers {
            self.support_transfers.store(false, Ordering::SeqCst);
        }
        if self.settle(Readiness::Ready(handler.clone())) {
            log::debug!("Worker[{}]: ready, transfers {}", self.options.name, self.support_transfers());
            self.configure(&handler);
        }
    }

    fn configure(&self, handler: &MessageHandler) {
        let sent = Payload::encode(&Configure { verbosity: self.options.verbosity })
            .and_then(|payload| handler.send(Action::Configure, payload));
        if let Err(err) = sent {
            log::warn!("Worker[{}]: cannot configure backend: {}", self.name(), err);
        }
    }

    /// Abandons the worker thread and starts a loopback worker instead.
    fn fall_back(self: &Arc<Self>, reason: &str) {
        if self.is_destroyed() || !self.is_pending() {
            return;
        }
        let (handler, channel) = {
            let mut inner = lock(&self.inner);
            if inner.loopback {
                return;
            }
            inner.loopback = true;
            (inner.handler.take(), inner.channel.take())
        };
        log::warn!("Worker[{}]: {}, setting up fake worker", self.options.name, reason);

        if let Some(handler) = handler {
            handler.destroy();
        }
        if let Some(channel) = channel {
            channel.close();
        }
        self.setup_fake_worker();
    }

    fn setup_fake_worker(&self) {
        if self.is_destroyed() {
            self.settle(Readiness::Failed(WorkerError::Destroyed));
            return;
        }
        let Some(provider) = self.provider.clone() else {
            self.settle(Readiness::Failed(WorkerError::Setup("no document provider".into())));
            return;
        };

        let id = format!("fake{}", FAKE_WORKER_ID.fetch_add(1, Ordering::SeqCst));
        let backend_id = format!("{id}_worker");
        let (client_end, backend_end) = LoopbackChannel::pair();

        let backend = MessageHandler::new(backend_id.clone(), id.clone(), backend_end);
        if let Err(err) = backend::setup(&backend, provider) {
            self.settle(Readiness::Failed(WorkerError::Setup(err.to_string())));
            return;
        }
        let handler = MessageHandler::new(id.clone(), backend_id, client_end.clone());
        {
            let mut inner = lock(&self.inner);
            inner.name = id.clone();
            inner.channel = Some(client_end);
            inner.handler = Some(handler.clone());
            inner.backend = Some(backend);
            inner.loopback = true;
        }

        log::debug!("Worker[{}]: loopback worker started", id);
        if self.settle(Readiness::Ready(handler.clone())) {
            self.configure(&handler);
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = lock(&self.inner);
        f.debug_struct("Worker")
            .field("name", &inner.name)
            .field("loopback", &inner.loopback)
            .field("destroyed", &self.destroyed.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryDocumentProvider;
    use std::future::Future;
    use std::time::Duration;

    async fn within<F: Future>(f: F) -> F::Output {
        tokio::time::timeout(Duration::from_secs(5), f).await.expect("timed out")
    }

    fn provider() -> Arc<dyn DocumentProvider> {
        Arc::new(MemoryDocumentProvider::new())
    }

    struct FailingSpawner;

    impl WorkerSpawner for FailingSpawner {
        fn spawn(&self, _name: &str, _provider: Arc<dyn DocumentProvider>) -> Result<Arc<dyn Channel>, ChannelError> {
            Err(ChannelError::Spawn("threads are not available".into()))
        }
    }

    /// A backend that cannot handle binary data and answers the probe with null.
    struct NoBuffersSpawner {
        backend: Mutex<Option<Arc<MessageHandler>>>,
    }

    impl WorkerSpawner for NoBuffersSpawner {
        fn spawn(&self, _name: &str, _provider: Arc<dyn DocumentProvider>) -> Result<Arc<dyn Channel>, ChannelError> {
            let (client_end, backend_end) = LoopbackChannel::pair();
            let backend = MessageHandler::new("worker", "main", backend_end);
            let weak = Arc::downgrade(&backend);
            backend
                .on_notify(Action::Test, move |_| {
                    if let Some(backend) = weak.upgrade() {
                        let _ = backend.send(Action::Test, Payload::new(serde_json::Value::Null));
                    }
                })
                .unwrap();
            *self.backend.lock().unwrap() = Some(backend);
            Ok(client_end)
        }
    }

    struct PanickingSpawner;

    impl WorkerSpawner for PanickingSpawner {
        fn spawn(&self, name: &str, _provider: Arc<dyn DocumentProvider>) -> Result<Arc<dyn Channel>, ChannelError> {
            let channel: Arc<dyn Channel> = ThreadChannel::spawn(name, |_endpoint| -> anyhow::Result<()> {
                panic!("backend failed to start");
            })?;
            Ok(channel)
        }
    }

    async fn echo(handler: &MessageHandler) -> serde_json::Value {
        let reply = within(handler.send_with_promise(Action::Echo, serde_json::json!({ "ping": 1 }).into()))
            .await
            .unwrap();
        reply.data
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn negotiates_with_worker_thread() {
        let worker = Worker::new(provider(), WorkerOptions::default());
        let handler = within(worker.ready()).await.unwrap();

        assert!(!worker.is_loopback());
        assert!(worker.support_transfers());
        assert_eq!(handler.source_name(), "main");
        assert_eq!(echo(&handler).await, serde_json::json!({ "ping": 1 }));
        worker.destroy();
    }

    #[tokio::test]
    async fn spawn_failure_falls_back_to_loopback() {
        let worker = Worker::with_spawner(provider(), WorkerOptions::default(), &FailingSpawner);
        let handler = within(worker.ready()).await.unwrap();

        assert!(worker.is_loopback());
        assert!(worker.name().starts_with("fake"));
        assert_eq!(handler.target_name(), format!("{}_worker", worker.name()));
        assert_eq!(echo(&handler).await, serde_json::json!({ "ping": 1 }));
    }

    #[tokio::test]
    async fn probe_without_buffer_support_falls_back() {
        let spawner = NoBuffersSpawner { backend: Mutex::new(None) };
        let worker = Worker::with_spawner(provider(), WorkerOptions::default(), &spawner);
        let handler = within(worker.ready()).await.unwrap();

        assert!(worker.is_loopback());
        assert_eq!(echo(&handler).await, serde_json::json!({ "ping": 1 }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn crashed_worker_thread_falls_back() {
        let worker = Worker::with_spawner(provider(), WorkerOptions::default(), &PanickingSpawner);
        let handler = within(worker.ready()).await.unwrap();

        assert!(worker.is_loopback());
        assert_eq!(echo(&handler).await, serde_json::json!({ "ping": 1 }));
    }

    #[tokio::test]
    async fn disabled_worker_uses_loopback_directly() {
        let options = WorkerOptions { disable_worker: true, ..Default::default() };
        let worker = Worker::with_spawner(provider(), options, &FailingSpawner);
        within(worker.ready()).await.unwrap();
        assert!(worker.is_loopback());
    }

    #[tokio::test]
    async fn destroy_rejects_readiness() {
        let spawner = NoBuffersSpawner { backend: Mutex::new(None) };
        let worker = Worker::with_spawner(provider(), WorkerOptions::default(), &spawner);
        worker.destroy();

        assert_eq!(within(worker.ready()).await.unwrap_err(), WorkerError::Destroyed);
        assert!(worker.is_destroyed());
    }

    #[tokio::test]
    async fn one_worker_per_port() {
        let (client_end, backend_end) = LoopbackChannel::pair();
        let backend = MessageHandler::new("worker", "main", backend_end);
        backend::setup(&backend, provider()).unwrap();
        let port: Arc<dyn Channel> = client_end;

        let first = Worker::from_port(port.clone(), WorkerOptions::default());
        let again = Worker::from_port(port.clone(), WorkerOptions::default());
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(
            Worker::with_port(port.clone(), WorkerOptions::default()).unwrap_err(),
            WorkerError::PortInUse
        );

        let handler = within(first.ready()).await.unwrap();
        assert_eq!(echo(&handler).await, serde_json::json!({ "ping": 1 }));

        first.destroy();
        assert!(!lock(&WORKER_PORTS).contains_key(&port.id()));
    }

    #[tokio::test]
    async fn stale_worker_keeps_newer_port_binding() {
        let (client_end, _backend_end) = LoopbackChannel::pair();
        let port: Arc<dyn Channel> = client_end;

        let stale = Worker::with_port(port.clone(), WorkerOptions::default()).unwrap();
        // Registration already gone, as when the last handle drops while the port is rebound.
        lock(&WORKER_PORTS).remove(&port.id());
        let current = Worker::with_port(port.clone(), WorkerOptions::default()).unwrap();

        stale.destroy();
        drop(stale);
        let bound = lock(&WORKER_PORTS).get(&port.id()).and_then(Weak::upgrade);
        assert!(bound.is_some_and(|bound| Arc::ptr_eq(&bound, &current)));
        assert!(Arc::ptr_eq(&Worker::from_port(port.clone(), WorkerOptions::default()), &current));

        current.destroy();
        assert!(!lock(&WORKER_PORTS).contains_key(&port.id()));
    }
}
