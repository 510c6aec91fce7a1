use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::session::{register_client_handlers, ClientHooks, SessionParts, SharedPages};
use crate::backend::DocumentProvider;
use crate::config::EngineConfig;
use crate::document::{
    DocRequest, DocRequestReply, DocumentHandle, DocumentInfo, DocumentSession, DocumentSource, ObjectCache, Progress,
};
use crate::errors::{LoadError, PasswordReason, WorkerError};
use crate::message_handler::{Action, MessageHandler, Payload};
use crate::worker::Worker;

/// Asked for a password when the document is encrypted. Returning `None` rejects the load.
pub type PasswordCallback = Arc<dyn Fn(PasswordReason) -> BoxFuture<'static, Option<String>> + Send + Sync>;

static NEXT_DOCUMENT_ID: AtomicUsize = AtomicUsize::new(0);

/// Builder for a document load.
///
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use folio_engine::backend::MemoryDocumentProvider;
/// # use folio_engine::document::{DocumentLoader, DocumentSource};
/// # async fn run() -> Result<(), folio_engine::errors::LoadError> {
/// let provider = Arc::new(MemoryDocumentProvider::new());
/// let task = DocumentLoader::new(DocumentSource::Url("report.pdf".into()))
///     .provider(provider)
///     .on_password(|_reason| async { Some("secret".to_string()) })
///     .open();
/// let doc = task.completion().await?;
/// println!("{} pages", doc.num_pages());
/// # Ok(()) }
/// ```
pub struct DocumentLoader {
    source: DocumentSource,
    provider: Option<Arc<dyn DocumentProvider>>,
    worker: Option<Arc<Worker>>,
    config: EngineConfig,
    password: Option<String>,
    hooks: ClientHooks,
}

impl DocumentLoader {
    pub fn new(source: DocumentSource) -> Self {
        Self {
            source,
            provider: None,
            worker: None,
            config: EngineConfig::default(),
            password: None,
            hooks: ClientHooks::default(),
        }
    }

    /// Backend used when no worker is given. The document gets a worker of its own.
    pub fn provider(mut self, provider: Arc<dyn DocumentProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Shares an existing worker. It outlives the document.
    pub fn worker(mut self, worker: Arc<Worker>) -> Self {
        self.worker = Some(worker);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn on_password<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(PasswordReason) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<String>> + Send + 'static,
    {
        let callback: PasswordCallback = Arc::new(move |reason| f(reason).boxed());
        self.hooks.on_password = Some(callback);
        self
    }

    pub fn on_progress<F>(mut self, f: F) -> Self
    where
        F: Fn(Progress) + Send + Sync + 'static,
    {
        self.hooks.on_progress = Some(Arc::new(f));
        self
    }

    pub fn on_unsupported_feature<F>(mut self, f: F) -> Self
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.hooks.on_unsupported_feature = Some(Arc::new(f));
        self
    }

    /// Starts loading. Must be called from within a tokio runtime.
    pub fn open(self) -> LoadingTask {
        let doc_id = format!("d{}", NEXT_DOCUMENT_ID.fetch_add(1, Ordering::SeqCst));
        let (outcome, _) = watch::channel(None);
        let inner = Arc::new(LoadingInner {
            doc_id: doc_id.clone(),
            outcome,
            cancel: CancellationToken::new(),
        });

        let task = inner.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = task.cancel.cancelled() => Err(LoadError::Destroyed),
                outcome = self.load(doc_id) => outcome,
            };
            match &outcome {
                Ok(doc) => log::debug!("Document[{}]: loaded, {} pages", task.doc_id, doc.num_pages()),
                Err(err) => log::debug!("Document[{}]: load failed: {}", task.doc_id, err),
            }
            task.outcome.send_replace(Some(outcome));
        });

        LoadingTask { inner }
    }

    async fn load(self, doc_id: String) -> Result<DocumentHandle, LoadError> {
        let (worker, owns_worker) = match (self.worker, self.provider) {
            (Some(worker), _) => (worker, false),
            (None, Some(provider)) => (Worker::new(provider, self.config.worker.clone()), true),
            (None, None) => return Err(LoadError::NoBackend),
        };
        if worker.is_destroyed() {
            return Err(WorkerError::Destroyed.into());
        }
        let worker_handler = worker.ready().await?;

        let (source, buffer) = self.source.to_wire();
        let mut request = Payload::encode(&DocRequest { doc_id: doc_id.clone(), source, password: self.password })?;
        if let Some(buffer) = buffer {
            request = request.with_buffer(buffer);
        }
        let reply: DocRequestReply = worker_handler.send_with_promise(Action::GetDocRequest, request).await?.decode()?;
        if worker.is_destroyed() {
            return Err(WorkerError::Destroyed.into());
        }

        let handler = MessageHandler::new(doc_id.clone(), reply.worker_id, worker_handler.channel());
        let common_objs = ObjectCache::new();
        let pages = SharedPages::default();
        register_client_handlers(&handler, self.hooks, common_objs.clone(), pages.clone()).map_err(LoadError::Protocol)?;

        let info = handler
            .send_with_promise(Action::GetDoc, Payload::empty())
            .await
            .and_then(|reply| reply.decode::<DocumentInfo>());
        let info = match info {
            Ok(info) => info,
            Err(err) => {
                if !owns_worker {
                    // Lets a shared worker forget the document.
                    let _ = handler.send_with_promise(Action::Terminate, Payload::empty()).await;
                }
                handler.destroy();
                if owns_worker {
                    worker.destroy();
                }
                return Err(err.into());
            }
        };

        let session = DocumentSession::new(SessionParts {
            doc_id,
            handler,
            worker,
            owns_worker,
            config: self.config,
            info,
            common_objs,
            pages,
        });
        Ok(DocumentHandle::new(Arc::new(session)))
    }
}

/// Loads the document at `source` with a worker of its own.
pub fn open_document(source: DocumentSource, provider: Arc<dyn DocumentProvider>) -> LoadingTask {
    DocumentLoader::new(source).provider(provider).open()
}

struct LoadingInner {
    doc_id: String,
    outcome: watch::Sender<Option<Result<DocumentHandle, LoadError>>>,
    cancel: CancellationToken,
}

/// A load in progress. Clones observe the same load.
#[derive(Clone)]
pub struct LoadingTask {
    inner: Arc<LoadingInner>,
}

impl LoadingTask {
    pub fn doc_id(&self) -> &str {
        &self.inner.doc_id
    }

    /// Settles once the document is open or the load failed.
    pub async fn completion(&self) -> Result<DocumentHandle, LoadError> {
        let mut rx = self.inner.outcome.subscribe();
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| LoadError::Destroyed)?
            .clone();
        outcome.unwrap_or(Err(LoadError::Destroyed))
    }

    /// Aborts the load, or destroys the document if it already loaded.
    pub async fn destroy(&self) {
        self.inner.cancel.cancel();
        if let Ok(doc) = self.completion().await {
            doc.destroy().await;
        }
    }
}

impl fmt::Debug for LoadingTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadingTask")
            .field("doc_id", &self.inner.doc_id)
            .field("settled", &self.inner.outcome.borrow().is_some())
            .finish()
    }
}
