use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::{self, BoxFuture, Shared};
use futures::FutureExt;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::document::{
    DocumentInfo, ObjectCache, ObjectHeader, PageHandle, PageInfo, PageRequest, PasswordReply, PasswordRequest,
    Progress, UnsupportedFeature,
};
use crate::errors::{DocumentError, MessageError, PasswordReason, ProtocolError, RemoteError};
use crate::message_handler::{Action, MessageHandler, Payload, SharedBuffer};
use crate::sync::lock;
use crate::worker::Worker;

pub(crate) type PasswordHook = Arc<dyn Fn(PasswordReason) -> BoxFuture<'static, Option<String>> + Send + Sync>;
pub(crate) type ProgressHook = Arc<dyn Fn(Progress) + Send + Sync>;
pub(crate) type FeatureHook = Arc<dyn Fn(String) + Send + Sync>;

type PageFuture = Shared<BoxFuture<'static, Result<PageHandle, DocumentError>>>;

#[derive(Default)]
pub(crate) struct Pages {
    resolved: HashMap<usize, PageHandle>,
    /// Requests still waiting for their `GetPage` reply
    in_flight: HashMap<usize, PageFuture>,
}

pub(crate) type SharedPages = Arc<Mutex<Pages>>;

/// Callbacks the backend can reach while a document is open.
#[derive(Clone, Default)]
pub(crate) struct ClientHooks {
    pub on_password: Option<PasswordHook>,
    pub on_progress: Option<ProgressHook>,
    pub on_unsupported_feature: Option<FeatureHook>,
}

/// Registers the actions the backend calls on the client side of a document.
pub(crate) fn register_client_handlers(
    handler: &Arc<MessageHandler>,
    hooks: ClientHooks,
    common_objs: ObjectCache,
    pages: SharedPages,
) -> Result<(), ProtocolError> {
    let doc_id = handler.source_name().to_string();

    let on_password = hooks.on_password;
    handler.on_call(Action::PasswordRequest, move |data| {
        let on_password = on_password.clone();
        async move {
            let request: PasswordRequest = data.decode()?;
            let password = match on_password {
                Some(on_password) => on_password(request.code).await,
                None => None,
            };
            match password {
                Some(password) => Ok(Payload::encode(&PasswordReply { password: Some(password) })?),
                None => {
                    let message = match request.code {
                        PasswordReason::NeedPassword => "No password given",
                        PasswordReason::IncorrectPassword => "Incorrect Password",
                    };
                    Err(RemoteError::Password { message: message.into(), code: request.code }.into())
                }
            }
        }
    })?;

    let on_progress = hooks.on_progress;
    handler.on_notify(Action::DocProgress, move |data| match data.decode::<Progress>() {
        Ok(progress) => {
            if let Some(on_progress) = &on_progress {
                on_progress(progress);
            }
        }
        Err(err) => log::warn!("Document: invalid progress: {}", err),
    })?;

    let on_unsupported_feature = hooks.on_unsupported_feature;
    let tag = doc_id.clone();
    handler.on_notify(Action::UnsupportedFeature, move |data| match data.decode::<UnsupportedFeature>() {
        Ok(UnsupportedFeature { feature }) => {
            log::info!("Document[{}]: unsupported feature \"{}\"", tag, feature);
            if let Some(on_unsupported_feature) = &on_unsupported_feature {
                on_unsupported_feature(feature);
            }
        }
        Err(err) => log::warn!("Document[{}]: invalid unsupported feature: {}", tag, err),
    })?;

    let tag = doc_id.clone();
    handler.on_notify(Action::CommonObj, move |data| {
        let object = data.decode::<ObjectHeader>().and_then(|header| header.into_data(&data));
        match object {
            Ok((id, object)) => {
                // Fonts are shared by pages and may be sent more than once.
                if !common_objs.has(&id) {
                    common_objs.resolve(id, object);
                }
            }
            Err(err) => log::warn!("Document[{}]: invalid common object: {}", tag, err),
        }
    })?;

    let tag = doc_id;
    handler.on_notify(Action::Obj, move |data| {
        let header = match data.decode::<ObjectHeader>() {
            Ok(header) => header,
            Err(err) => {
                log::warn!("Document[{}]: invalid object: {}", tag, err);
                return;
            }
        };
        let Some(page_number) = header.page_number else {
            log::warn!("Document[{}]: object {} has no page", tag, header.id);
            return;
        };
        let page = lock(&pages).resolved.get(&page_number).cloned();
        let Some(page) = page else {
            log::debug!("Document[{}]: dropping object {} for unknown page {}", tag, header.id, page_number);
            return;
        };
        match header.into_data(&data) {
            Ok((id, object)) => page.resolve_object(id, object),
            Err(err) => log::warn!("Document[{}]: invalid object: {}", tag, err),
        }
    })?;

    Ok(())
}

/// Client side state of one open document.
pub(crate) struct DocumentSession {
    doc_id: String,
    handler: Arc<MessageHandler>,
    worker: Arc<Worker>,
    owns_worker: bool,
    config: EngineConfig,
    info: DocumentInfo,
    common_objs: ObjectCache,
    pages: SharedPages,
    destroyed: CancellationToken,
    runtime: Handle,
}

pub(crate) struct SessionParts {
    pub doc_id: String,
    pub handler: Arc<MessageHandler>,
    pub worker: Arc<Worker>,
    pub owns_worker: bool,
    pub config: EngineConfig,
    pub info: DocumentInfo,
    pub common_objs: ObjectCache,
    pub pages: SharedPages,
}

impl DocumentSession {
    pub(crate) fn new(parts: SessionParts) -> Self {
        Self {
            doc_id: parts.doc_id,
            handler: parts.handler,
            worker: parts.worker,
            owns_worker: parts.owns_worker,
            config: parts.config,
            info: parts.info,
            common_objs: parts.common_objs,
            pages: parts.pages,
            destroyed: CancellationToken::new(),
            runtime: Handle::current(),
        }
    }

    pub(crate) fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub(crate) fn info(&self) -> &DocumentInfo {
        &self.info
    }

    pub(crate) fn common_objs(&self) -> &ObjectCache {
        &self.common_objs
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.is_cancelled()
    }

    #[cfg(test)]
    pub(crate) fn handler(&self) -> &Arc<MessageHandler> {
        &self.handler
    }

    /// Page `page_number` (one based). Concurrent requests for the same page share one `GetPage` call.
    pub(crate) async fn get_page(&self, page_number: usize) -> Result<PageHandle, DocumentError> {
        if self.is_destroyed() {
            return Err(DocumentError::Destroyed);
        }
        if page_number == 0 || page_number > self.info.num_pages {
            return Err(DocumentError::InvalidPageRequest(page_number));
        }

        let request = {
            let mut pages = lock(&self.pages);
            if let Some(page) = pages.resolved.get(&page_number) {
                return Ok(page.clone());
            }
            match pages.in_flight.get(&page_number) {
                Some(request) => request.clone(),
                None => {
                    let request = self.fetch_page(page_number).boxed().shared();
                    pages.in_flight.insert(page_number, request.clone());
                    request
                }
            }
        };
        request.await
    }

    fn fetch_page(&self, page_number: usize) -> impl std::future::Future<Output = Result<PageHandle, DocumentError>> {
        let handler = self.handler.clone();
        let config = self.config.clone();
        let common_objs = self.common_objs.clone();
        let pages = self.pages.clone();
        let destroyed = self.destroyed.clone();
        let runtime = self.runtime.clone();

        async move {
            let outcome = request_page(&handler, page_number).await;
            let mut pages = lock(&pages);
            pages.in_flight.remove(&page_number);
            if destroyed.is_cancelled() {
                return Err(DocumentError::Destroyed);
            }
            let info = outcome?;
            let page = PageHandle::new(page_number, info, handler, config, common_objs, runtime);
            pages.resolved.insert(page_number, page.clone());
            Ok(page)
        }
    }

    pub(crate) async fn get_data(&self) -> Result<SharedBuffer, DocumentError> {
        if self.is_destroyed() {
            return Err(DocumentError::Destroyed);
        }
        let reply = self.handler.send_with_promise(Action::GetData, Payload::empty()).await?;
        reply
            .buffer(0)
            .cloned()
            .ok_or_else(|| MessageError::Payload("GetData reply has no buffer".into()).into())
    }

    /// Asks the backend to drop its caches, then cleans up every page and the common objects. Fails with
    /// [`DocumentError::PageBusy`] while a page is rendering.
    pub(crate) async fn cleanup(&self) -> Result<(), DocumentError> {
        if self.is_destroyed() {
            return Err(DocumentError::Destroyed);
        }
        self.handler.send_with_promise(Action::Cleanup, Payload::empty()).await?;

        let pages: Vec<PageHandle> = lock(&self.pages).resolved.values().cloned().collect();
        for page in pages {
            if !page.cleanup() {
                return Err(DocumentError::PageBusy(page.page_number()));
            }
        }
        self.common_objs.clear();
        Ok(())
    }

    /// Destroys every page, terminates the document on the backend and rejects everything still pending.
    pub(crate) async fn destroy(&self) {
        if self.destroyed.is_cancelled() {
            return;
        }
        self.destroyed.cancel();

        let pages: Vec<PageHandle> = {
            let mut pages = lock(&self.pages);
            pages.in_flight.clear();
            pages.resolved.drain().map(|(_, page)| page).collect()
        };
        future::join_all(pages.iter().map(|page| page.destroy())).await;

        // Calls still waiting on the backend fail now; the backend may never answer them.
        self.handler.reject_pending(MessageError::Destroyed);
        let terminate = self.handler.send_with_promise(Action::Terminate, Payload::empty());
        match tokio::time::timeout(self.config.session.terminate_timeout, terminate).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => log::debug!("Document[{}]: terminate failed: {}", self.doc_id, err),
            Err(_) => log::warn!("Document[{}]: backend did not acknowledge terminate", self.doc_id),
        }
        self.common_objs.clear();
        self.handler.destroy();
        if self.owns_worker {
            self.worker.destroy();
        }
        log::debug!("Document[{}]: destroyed", self.doc_id);
    }
}

async fn request_page(handler: &MessageHandler, page_number: usize) -> Result<PageInfo, DocumentError> {
    let request = Payload::encode(&PageRequest { page_index: page_number - 1 })?;
    let reply = handler.send_with_promise(Action::GetPage, request).await?;
    Ok(reply.decode()?)
}
