use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::document::{
    Annotation, IntentKey, IntentRequest, ObjectCache, ObjectData, ObjectId, PageInfo, PageRequest, RenderIntent,
    TextContent,
};
use crate::errors::{DocumentError, MessageError, RemoteError, RenderError};
use crate::message_handler::{Action, MessageHandler, Payload, QueuingStrategy, ReadableStream};
use crate::render::{
    DrawingParams, InternalRenderTask, ObjectScope, OperatorList, OperatorListBuffer, OperatorListChunk,
    RenderParams, RenderTask, RenderTaskId, SurfaceLock, TaskInit,
};
use crate::sync::lock;

/// State of one rendering intent: its operator list and the tasks executing it.
struct IntentState {
    buffer: Arc<OperatorListBuffer>,
    render_tasks: HashMap<RenderTaskId, Arc<InternalRenderTask>>,
    /// Set while chunks are still arriving
    stream: Option<ReadableStream>,
    /// Grace timer of a cancelled render
    cancel_timeout: Option<CancellationToken>,
}

#[derive(Default)]
struct PageState {
    intents: HashMap<IntentKey, IntentState>,
    pending_cleanup: bool,
    destroyed: bool,
}

struct PageInner {
    page_number: usize,
    info: PageInfo,
    handler: Arc<MessageHandler>,
    config: EngineConfig,
    common_objs: ObjectCache,
    objs: ObjectCache,
    runtime: Handle,
    state: Mutex<PageState>,
}

/// One page of an open document. Clones refer to the same page.
#[derive(Clone)]
pub struct PageHandle {
    inner: Arc<PageInner>,
}

impl PageHandle {
    pub(crate) fn new(
        page_number: usize,
        info: PageInfo,
        handler: Arc<MessageHandler>,
        config: EngineConfig,
        common_objs: ObjectCache,
        runtime: Handle,
    ) -> Self {
        Self {
            inner: Arc::new(PageInner {
                page_number,
                info,
                handler,
                config,
                common_objs,
                objs: ObjectCache::new(),
                runtime,
                state: Mutex::new(PageState::default()),
            }),
        }
    }

    /// One based page number.
    pub fn page_number(&self) -> usize {
        self.inner.page_number
    }

    pub fn info(&self) -> &PageInfo {
        &self.inner.info
    }

    pub fn rotate(&self) -> i32 {
        self.inner.info.rotate
    }

    /// Objects of this page. Emptied whenever the page is cleaned up.
    pub fn objs(&self) -> &ObjectCache {
        &self.inner.objs
    }

    pub fn is_destroyed(&self) -> bool {
        lock(&self.inner.state).destroyed
    }

    /// Starts rendering the page to `params.surface`.
    ///
    /// Render tasks of the same intent share one operator list, requested from the backend by the first of
    /// them. A surface can only be drawn to by one task at a time: rendering to a surface that is still in
    /// use fails with [`RenderError::SurfaceInUse`].
    pub fn render(&self, params: RenderParams) -> Result<RenderTask, RenderError> {
        let inner = &self.inner;
        let surface_lock = SurfaceLock::acquire(params.surface.id())?;
        let key = IntentKey::Render(params.intent);

        let mut state = lock(&inner.state);
        if state.destroyed {
            return Err(RenderError::Destroyed);
        }
        state.pending_cleanup = false;

        let intent = match state.intents.entry(key) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(inner.open_intent(key)?),
        };
        if let Some(timer) = intent.cancel_timeout.take() {
            log::trace!("Page[{}]: reusing operator list of cancelled render ({})", inner.page_number, key);
            timer.cancel();
        }

        let page = Arc::downgrade(inner);
        let task = InternalRenderTask::new(TaskInit {
            page_number: inner.page_number,
            surface: params.surface.clone(),
            drawing: DrawingParams {
                page_number: inner.page_number,
                size: params.surface.size(),
                transform: params.transform,
                background: params.background,
                intent: params.intent,
            },
            buffer: intent.buffer.clone(),
            objects: ObjectScope {
                common: inner.common_objs.clone(),
                page: inner.objs.clone(),
            },
            arbiter: params.arbiter,
            config: inner.config.render.clone(),
            surface_lock,
            on_complete: Box::new(move |id, err| {
                if let Some(page) = page.upgrade() {
                    page.on_task_complete(key, id, err);
                }
            }),
        });
        intent.render_tasks.insert(task.id(), task.clone());
        drop(state);

        log::debug!("Page[{}]: render task {} started ({})", inner.page_number, task.id(), key);
        inner.runtime.spawn(task.clone().run());
        Ok(RenderTask::new(task))
    }

    /// The complete operator list of the page, fetched once and kept until the page is cleaned up.
    pub async fn get_operator_list(&self) -> Result<OperatorList, DocumentError> {
        let buffer = {
            let mut state = lock(&self.inner.state);
            if state.destroyed {
                return Err(DocumentError::Destroyed);
            }
            match state.intents.entry(IntentKey::OperatorList) {
                Entry::Occupied(entry) => entry.get().buffer.clone(),
                Entry::Vacant(entry) => entry.insert(self.inner.open_intent(IntentKey::OperatorList)?).buffer.clone(),
            }
        };
        Ok(buffer.wait_complete().await?)
    }

    /// Streams the text of the page. Credit is counted in text items.
    pub fn stream_text_content(&self) -> Result<BoxStream<'static, Result<TextContent, DocumentError>>, DocumentError> {
        if self.is_destroyed() {
            return Err(DocumentError::Destroyed);
        }
        let strategy = QueuingStrategy::new(self.inner.config.session.text_content_high_water_mark)
            .with_size(|chunk| chunk.data["items"].as_array().map_or(0, |items| items.len() as i64));
        let request = Payload::encode(&PageRequest { page_index: self.inner.page_number - 1 })?;
        let stream = self.inner.handler.send_with_stream(Action::GetTextContent, request, strategy)?;

        Ok(stream
            .into_stream()
            .map(|chunk| -> Result<TextContent, DocumentError> { Ok(chunk?.decode()?) })
            .boxed())
    }

    /// All text of the page.
    pub async fn get_text_content(&self) -> Result<TextContent, DocumentError> {
        let mut chunks = self.stream_text_content()?;
        let mut content = TextContent::default();
        while let Some(chunk) = chunks.next().await {
            content.items.extend(chunk?.items);
        }
        Ok(content)
    }

    pub async fn get_annotations(&self, intent: RenderIntent) -> Result<Vec<Annotation>, DocumentError> {
        if self.is_destroyed() {
            return Err(DocumentError::Destroyed);
        }
        let request = IntentRequest {
            page_index: self.inner.page_number - 1,
            intent: IntentKey::Render(intent).as_str().to_string(),
        };
        let reply = self
            .inner
            .handler
            .send_with_promise(Action::GetAnnotations, Payload::encode(&request)?)
            .await?;
        Ok(reply.decode()?)
    }

    /// Flags the page for cleanup and cleans up right away if nothing is rendering. Cleanup drops every
    /// operator list and the page's objects. Returns whether it happened.
    pub fn cleanup(&self) -> bool {
        let mut state = lock(&self.inner.state);
        state.pending_cleanup = true;
        self.inner.try_cleanup(&mut state)
    }

    pub(crate) fn resolve_object(&self, id: ObjectId, data: ObjectData) {
        if self.is_destroyed() {
            return;
        }
        self.inner.objs.resolve(id, data);
    }

    /// Cancels every render task, aborts every operator list stream and waits for the tasks to settle.
    pub(crate) async fn destroy(&self) {
        let inner = &self.inner;
        let tasks: Vec<Arc<InternalRenderTask>> = {
            let mut state = lock(&inner.state);
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.pending_cleanup = false;

            let mut tasks = Vec::new();
            for (_, intent) in state.intents.drain() {
                if let Some(timer) = intent.cancel_timeout {
                    timer.cancel();
                }
                if let Some(stream) = intent.stream {
                    inner.cancel_stream(stream, "Page was destroyed.");
                }
                intent.buffer.fail(MessageError::Destroyed);
                tasks.extend(intent.render_tasks.into_values());
            }
            tasks
        };
        inner.objs.clear();

        // Completion callbacks lock the page, so cancel outside of it.
        for task in &tasks {
            task.cancel(Duration::ZERO);
        }
        for task in tasks {
            let _ = RenderTask::new(task).completion().await;
        }
        log::debug!("Page[{}]: destroyed", inner.page_number);
    }

    #[cfg(test)]
    pub(crate) fn active_intents(&self) -> Vec<IntentKey> {
        lock(&self.inner.state).intents.keys().copied().collect()
    }

    #[cfg(test)]
    pub(crate) fn is_streaming(&self, key: IntentKey) -> bool {
        lock(&self.inner.state)
            .intents
            .get(&key)
            .is_some_and(|intent| intent.stream.is_some())
    }
}

impl PageInner {
    /// Requests the operator list of `key` from the backend and starts pumping its chunks.
    fn open_intent(self: &Arc<Self>, key: IntentKey) -> Result<IntentState, MessageError> {
        let request = IntentRequest {
            page_index: self.page_number - 1,
            intent: key.as_str().to_string(),
        };
        let strategy = QueuingStrategy::new(self.config.session.operator_list_high_water_mark);
        let stream = self
            .handler
            .send_with_stream(Action::GetOperatorList, Payload::encode(&request)?, strategy)?;

        let buffer = Arc::new(OperatorListBuffer::new());
        self.runtime.spawn(pump_operator_list(
            Arc::downgrade(self),
            key,
            buffer.clone(),
            stream.clone(),
        ));
        Ok(IntentState {
            buffer,
            render_tasks: HashMap::new(),
            stream: Some(stream),
            cancel_timeout: None,
        })
    }

    fn on_task_complete(self: &Arc<Self>, key: IntentKey, id: RenderTaskId, err: Option<&RenderError>) {
        let mut state = lock(&self.state);
        let Some(intent) = state.intents.get_mut(&key) else {
            return;
        };
        intent.render_tasks.remove(&id);
        if key == IntentKey::Render(RenderIntent::Print) || self.config.session.cleanup_after_render {
            state.pending_cleanup = true;
        }
        self.try_cleanup(&mut state);
        if let Some(err) = err {
            self.abort_operator_list(&mut state, key, err, false);
        }
    }

    /// Stops streaming the operator list of `key` once no task needs it.
    ///
    /// A cancelled render keeps the stream for the grace period, so that rendering the page again right
    /// away reuses it. `force` aborts immediately regardless of remaining tasks.
    fn abort_operator_list(self: &Arc<Self>, state: &mut PageState, key: IntentKey, reason: &RenderError, force: bool) {
        let Some(intent) = state.intents.get_mut(&key) else {
            return;
        };
        if intent.stream.is_none() {
            return;
        }
        if let Some(timer) = intent.cancel_timeout.take() {
            timer.cancel();
        }

        if !force {
            if !intent.render_tasks.is_empty() {
                return;
            }
            if reason.is_cancelled() {
                let timer = CancellationToken::new();
                intent.cancel_timeout = Some(timer.clone());
                let mut grace = self.config.session.rendering_cancelled_grace;
                if let RenderError::Cancelled(cancelled) = reason {
                    grace += cancelled.extra_delay;
                }
                let page = Arc::downgrade(self);
                let buffer = intent.buffer.clone();
                let reason = reason.clone();
                self.runtime.spawn(async move {
                    tokio::select! {
                        _ = timer.cancelled() => return,
                        _ = tokio::time::sleep(grace) => {}
                    }
                    if let Some(page) = page.upgrade() {
                        page.expire_grace(key, &buffer, &timer, &reason);
                    }
                });
                return;
            }
        }

        let Some(intent) = state.intents.remove(&key) else {
            return;
        };
        if let Some(stream) = intent.stream {
            self.cancel_stream(stream, &reason.to_string());
        }
        intent.buffer.fail(MessageError::Remote(RemoteError::abort(reason.to_string())));
        log::debug!("Page[{}]: operator list ({}) aborted: {}", self.page_number, key, reason);

        state.pending_cleanup = true;
        self.try_cleanup(state);
    }

    fn expire_grace(self: &Arc<Self>, key: IntentKey, buffer: &Arc<OperatorListBuffer>, timer: &CancellationToken, reason: &RenderError) {
        let mut state = lock(&self.state);
        if timer.is_cancelled() {
            return;
        }
        let current = state
            .intents
            .get(&key)
            .is_some_and(|intent| Arc::ptr_eq(&intent.buffer, buffer));
        if current {
            self.abort_operator_list(&mut state, key, reason, true);
        }
    }

    fn cancel_stream(&self, stream: ReadableStream, message: &str) {
        let reason = RemoteError::abort(message);
        self.runtime.spawn(async move {
            if let Err(err) = stream.cancel(reason).await {
                log::trace!("cancelling operator list stream failed: {}", err);
            }
        });
    }

    /// Drops every intent and the page objects if cleanup was requested and nothing is in progress.
    fn try_cleanup(&self, state: &mut PageState) -> bool {
        if !state.pending_cleanup {
            return false;
        }
        // A stream kept only by the grace window of a cancelled render does not hold cleanup back.
        let busy = state.intents.values().any(|intent| {
            !intent.render_tasks.is_empty() || (!intent.buffer.is_complete() && intent.cancel_timeout.is_none())
        });
        if busy {
            return false;
        }

        for (key, intent) in state.intents.drain() {
            if let Some(timer) = intent.cancel_timeout {
                timer.cancel();
            }
            if let Some(stream) = intent.stream {
                log::trace!("Page[{}]: dropping operator list ({}) on cleanup", self.page_number, key);
                self.cancel_stream(stream, "Page was cleaned up.");
            }
            intent.buffer.fail(MessageError::Remote(RemoteError::abort("Page was cleaned up.")));
        }
        self.objs.clear();
        state.pending_cleanup = false;
        log::trace!("Page[{}]: cleaned up", self.page_number);
        true
    }

    /// Detaches the finished stream of `key`, if `buffer` still belongs to it.
    fn finish_stream(&self, key: IntentKey, buffer: &Arc<OperatorListBuffer>) {
        let mut state = lock(&self.state);
        if let Some(intent) = state.intents.get_mut(&key) {
            if Arc::ptr_eq(&intent.buffer, buffer) {
                intent.stream = None;
            }
        }
        self.try_cleanup(&mut state);
    }

    /// Fails the operator list of `key` and every task still executing it.
    fn fail_stream(&self, key: IntentKey, buffer: &Arc<OperatorListBuffer>, err: MessageError) {
        log::warn!("Page[{}]: operator list ({}) failed: {}", self.page_number, key, err);
        buffer.fail(err.clone());

        let tasks: Vec<Arc<InternalRenderTask>> = {
            let mut state = lock(&self.state);
            let current = state
                .intents
                .get(&key)
                .is_some_and(|intent| Arc::ptr_eq(&intent.buffer, buffer));
            let tasks = match current.then(|| state.intents.remove(&key)).flatten() {
                Some(intent) => intent.render_tasks.into_values().collect(),
                None => Vec::new(),
            };
            self.try_cleanup(&mut state);
            tasks
        };
        for task in tasks {
            task.fail(RenderError::Message(err.clone()));
        }
    }
}

async fn pump_operator_list(
    page: Weak<PageInner>,
    key: IntentKey,
    buffer: Arc<OperatorListBuffer>,
    stream: ReadableStream,
) {
    loop {
        let next = stream.read().await;
        let Some(page) = page.upgrade() else {
            return;
        };
        match next {
            Some(Ok(chunk)) => match chunk.decode::<OperatorListChunk>() {
                Ok(chunk) => {
                    let last_chunk = chunk.last_chunk;
                    buffer.push(chunk);
                    if last_chunk {
                        page.finish_stream(key, &buffer);
                        return;
                    }
                }
                Err(err) => {
                    let _ = stream.cancel(RemoteError::abort(err.to_string())).await;
                    page.fail_stream(key, &buffer, err);
                    return;
                }
            },
            Some(Err(err)) => {
                page.fail_stream(key, &buffer, err);
                return;
            }
            None => {
                // Cancelled by us, or closed early by the backend.
                buffer.fail(MessageError::Payload("operator list ended before its last chunk".into()));
                page.finish_stream(key, &buffer);
                return;
            }
        }
    }
}

impl fmt::Debug for PageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageHandle")
            .field("page_number", &self.inner.page_number)
            .field("info", &self.inner.info)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendObject, MemoryDocument, MemoryDocumentProvider, MemoryPage, ProviderStats};
    use crate::config::EngineConfigBuilder;
    use crate::document::{DocumentHandle, DocumentLoader, DocumentSource};
    use crate::render::backends::recording::RecordingBackend;
    use crate::render::{Color, DisplayItem, RenderState, Surface, SurfaceSize};
    use std::future::Future;

    async fn within<F: Future>(f: F) -> F::Output {
        tokio::time::timeout(Duration::from_secs(5), f).await.expect("timed out")
    }

    fn items(count: usize) -> Vec<DisplayItem> {
        (0..count)
            .map(|n| DisplayItem::Rect {
                x: n as f32,
                y: 0.0,
                w: 1.0,
                h: 1.0,
                color: Color::from_u8(0, 0, 0, 255),
            })
            .collect()
    }

    /// A page whose operator list trickles in, one instruction every `delay`.
    fn slow_page(count: usize, delay: Duration) -> MemoryPage {
        MemoryPage::new(items(count)).chunk_size(1).chunk_delay(delay)
    }

    async fn open(
        page: MemoryPage,
        config: EngineConfigBuilder,
    ) -> (DocumentHandle, PageHandle, Arc<ProviderStats>) {
        let provider = Arc::new(MemoryDocumentProvider::new());
        provider.add_url("a.pdf", MemoryDocument::new("f00d").page(page));
        let config = config.disable_worker(true).build().unwrap();
        let doc = within(
            DocumentLoader::new(DocumentSource::Url("a.pdf".into()))
                .provider(provider.clone())
                .config(config)
                .open()
                .completion(),
        )
        .await
        .unwrap();
        let page = within(doc.get_page(1)).await.unwrap();
        (doc, page, provider.stats())
    }

    fn recording_surface() -> (Surface, RecordingBackend) {
        let backend = RecordingBackend::new();
        (Surface::new(SurfaceSize { width: 100, height: 100 }, backend.clone()), backend)
    }

    fn display() -> IntentKey {
        IntentKey::Render(RenderIntent::Display)
    }

    #[tokio::test]
    async fn renders_streamed_operator_list() {
        let (_doc, page, _stats) = open(MemoryPage::new(items(25)).chunk_size(4), EngineConfig::builder()).await;
        let (surface, recording) = recording_surface();

        let task = page.render(RenderParams::new(surface)).unwrap();
        within(task.completion()).await.unwrap();

        assert_eq!(task.state(), RenderState::Finished);
        assert_eq!(recording.items(), items(25));
        assert_eq!(recording.recording().ended, 1);
        assert!(!page.is_streaming(display()));
    }

    #[tokio::test]
    async fn tasks_of_one_intent_share_the_operator_list() {
        let (_doc, page, stats) = open(slow_page(6, Duration::from_millis(5)), EngineConfig::builder()).await;
        let (first_surface, first) = recording_surface();
        let (second_surface, second) = recording_surface();

        let a = page.render(RenderParams::new(first_surface)).unwrap();
        let b = page.render(RenderParams::new(second_surface)).unwrap();
        within(a.completion()).await.unwrap();
        within(b.completion()).await.unwrap();

        assert_eq!(stats.operator_list_requests(), 1);
        assert_eq!(first.items(), items(6));
        assert_eq!(second.items(), first.items());
    }

    #[tokio::test]
    async fn surface_is_exclusive_while_rendering() {
        let (_doc, page, _stats) = open(slow_page(4, Duration::from_millis(10)), EngineConfig::builder()).await;
        let (surface, _recording) = recording_surface();

        let task = page.render(RenderParams::new(surface.clone())).unwrap();
        let err = page.render(RenderParams::new(surface.clone())).unwrap_err();
        assert!(matches!(err, RenderError::SurfaceInUse(id) if id == surface.id()));

        task.cancel();
        let _ = within(task.completion()).await;
        let again = page.render(RenderParams::new(surface)).unwrap();
        within(again.completion()).await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_task_settles_with_rendering_cancelled() {
        let (_doc, page, _stats) = open(slow_page(4, Duration::from_millis(10)), EngineConfig::builder()).await;
        let (surface, _recording) = recording_surface();

        let task = page.render(RenderParams::new(surface)).unwrap();
        task.cancel();
        let err = within(task.completion()).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.to_string(), "Rendering cancelled, page 1");
        assert_eq!(task.state(), RenderState::Cancelled);
    }

    #[tokio::test]
    async fn rerender_within_grace_window_reuses_stream() {
        let config = EngineConfig::builder().rendering_cancelled_grace(Duration::from_secs(2));
        let (_doc, page, stats) = open(slow_page(5, Duration::from_millis(10)), config).await;

        let (surface, _recording) = recording_surface();
        let cancelled = page.render(RenderParams::new(surface)).unwrap();
        cancelled.cancel();
        let _ = within(cancelled.completion()).await;
        assert!(page.is_streaming(display()));

        let (surface, recording) = recording_surface();
        let task = page.render(RenderParams::new(surface)).unwrap();
        within(task.completion()).await.unwrap();
        assert_eq!(stats.operator_list_requests(), 1);
        assert_eq!(recording.items(), items(5));
    }

    #[tokio::test]
    async fn grace_window_expiry_aborts_stream() {
        let config = EngineConfig::builder().rendering_cancelled_grace(Duration::from_millis(20));
        let (_doc, page, stats) = open(slow_page(20, Duration::from_millis(20)), config).await;

        let (surface, _recording) = recording_surface();
        let cancelled = page.render(RenderParams::new(surface)).unwrap();
        cancelled.cancel();
        let _ = within(cancelled.completion()).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!page.is_streaming(display()));
        assert!(page.active_intents().is_empty());

        let (surface, recording) = recording_surface();
        let task = page.render(RenderParams::new(surface)).unwrap();
        within(task.completion()).await.unwrap();
        assert_eq!(stats.operator_list_requests(), 2);
        assert_eq!(recording.items(), items(20));
    }

    #[tokio::test]
    async fn cleanup_waits_for_running_renders() {
        let (doc, page, _stats) = open(slow_page(3, Duration::from_millis(10)), EngineConfig::builder()).await;
        let (surface, _recording) = recording_surface();

        let task = page.render(RenderParams::new(surface)).unwrap();
        assert!(matches!(within(doc.cleanup()).await, Err(DocumentError::PageBusy(1))));
        assert!(!page.cleanup());

        within(task.completion()).await.unwrap();
        assert!(page.active_intents().is_empty());
    }

    #[tokio::test]
    async fn cleanup_drops_stream_kept_for_grace_window() {
        let config = EngineConfig::builder().rendering_cancelled_grace(Duration::from_secs(5));
        let (doc, page, stats) = open(slow_page(20, Duration::from_millis(20)), config).await;
        let (surface, _recording) = recording_surface();

        let cancelled = page.render(RenderParams::new(surface)).unwrap();
        cancelled.cancel();
        let _ = within(cancelled.completion()).await;
        assert!(page.is_streaming(display()));

        within(doc.cleanup()).await.unwrap();
        assert!(page.active_intents().is_empty());

        let (surface, recording) = recording_surface();
        let task = page.render(RenderParams::new(surface)).unwrap();
        within(task.completion()).await.unwrap();
        assert_eq!(stats.operator_list_requests(), 2);
        assert_eq!(recording.items(), items(20));
    }

    #[tokio::test]
    async fn extra_cancel_delay_extends_grace_window() {
        let config = EngineConfig::builder().rendering_cancelled_grace(Duration::from_millis(10));
        let (_doc, page, stats) = open(slow_page(10, Duration::from_millis(20)), config).await;
        let (surface, _recording) = recording_surface();

        let cancelled = page.render(RenderParams::new(surface)).unwrap();
        cancelled.cancel_with_delay(Duration::from_secs(5));
        let err = within(cancelled.completion()).await.unwrap_err();
        assert!(matches!(
            err,
            RenderError::Cancelled(crate::errors::RenderingCancelled { extra_delay, .. })
                if extra_delay == Duration::from_secs(5)
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(page.is_streaming(display()));

        let (surface, recording) = recording_surface();
        let task = page.render(RenderParams::new(surface)).unwrap();
        within(task.completion()).await.unwrap();
        assert_eq!(stats.operator_list_requests(), 1);
        assert_eq!(recording.items(), items(10));
    }

    #[tokio::test]
    async fn print_renders_clean_up_afterwards() {
        let (_doc, page, _stats) = open(MemoryPage::new(items(3)), EngineConfig::builder()).await;
        let (surface, recording) = recording_surface();

        let task = page.render(RenderParams::new(surface).intent(RenderIntent::Print)).unwrap();
        within(task.completion()).await.unwrap();
        assert_eq!(recording.recording().params[0].intent, RenderIntent::Print);
        assert!(page.active_intents().is_empty());
    }

    #[tokio::test]
    async fn operator_list_is_fetched_once() {
        let (_doc, page, stats) = open(MemoryPage::new(items(7)).chunk_size(2), EngineConfig::builder()).await;

        let list = within(page.get_operator_list()).await.unwrap();
        assert_eq!(list.items, items(7));
        assert!(list.last_chunk);
        within(page.get_operator_list()).await.unwrap();
        assert_eq!(stats.operator_list_requests(), 1);
    }

    #[tokio::test]
    async fn failed_operator_list_rejects_renders() {
        let page = MemoryPage::new(items(3)).fail_operator_list("bad content stream");
        let (_doc, page, _stats) = open(page, EngineConfig::builder()).await;
        let (surface, _recording) = recording_surface();

        let task = page.render(RenderParams::new(surface)).unwrap();
        let err = within(task.completion()).await.unwrap_err();
        assert!(matches!(err, RenderError::Message(_)), "{err:?}");
        assert!(matches!(within(page.get_operator_list()).await, Err(DocumentError::Message(_))));
    }

    #[tokio::test]
    async fn page_objects_arrive_before_instructions() {
        let id = ObjectId::new("img_p0_1");
        let page = MemoryPage::new(vec![
            DisplayItem::Dependency { id: id.clone() },
            DisplayItem::PaintImage { id: id.clone(), x: 0.0, y: 0.0, w: 1.0, h: 1.0 },
        ])
        .with_object(
            "img_p0_1",
            BackendObject::Image { width: 1, height: 1, pixels: vec![0, 0, 0, 255] },
        );
        let (_doc, page, _stats) = open(page, EngineConfig::builder()).await;
        let (surface, recording) = recording_surface();

        let task = page.render(RenderParams::new(surface)).unwrap();
        within(task.completion()).await.unwrap();
        assert!(page.objs().has(&id));
        assert_eq!(recording.items().len(), 2);
    }

    #[tokio::test]
    async fn destroying_document_cancels_renders() {
        let (doc, page, _stats) = open(slow_page(50, Duration::from_millis(20)), EngineConfig::builder()).await;
        let (surface, _recording) = recording_surface();

        let task = page.render(RenderParams::new(surface.clone())).unwrap();
        within(doc.destroy()).await;

        let err = within(task.completion()).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(!crate::render::SurfaceLock::is_locked(surface.id()));
        assert!(matches!(page.render(RenderParams::new(surface)), Err(RenderError::Destroyed)));
    }
}
