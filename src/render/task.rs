//! Render tasks.
//!
//! A render task executes the operator list of one page intent against a [`Surface`], a unit of work at a
//! time. Before every unit it asks its [`PriorityArbiter`] whether it may continue; when refused it pauses
//! and keeps its position until [`RenderTask::resume`]. Between units it yields back to the runtime.
//!
//! ```text
//! Initial --begin_drawing--> Running <--arbiter/resume--> Paused
//!                               |                            |
//!                               +--> Finished   Cancelled <--+
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::RenderConfig;
use crate::document::{ObjectId, RenderIntent};
use crate::errors::{MessageError, RenderError, RenderingCancelled};
use crate::render::backend::{DrawingParams, ObjectScope, Surface, SurfaceLock, WorkBudget};
use crate::render::{Color, DisplayItem, OperatorList, OperatorListChunk};
use crate::sync::{lock, read, write};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct RenderTaskId(Uuid);

impl RenderTaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RenderTaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RenderTaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum RenderState {
    #[default]
    Initial,
    Running,
    Paused,
    Finished,
    Cancelled,
}

impl RenderState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RenderState::Finished | RenderState::Cancelled)
    }
}

/// Decides which render task may use the host's time. Consulted before every unit of work.
pub trait PriorityArbiter: Send + Sync {
    fn is_highest_priority(&self, task: RenderTaskId, page_number: usize) -> bool;
}

/// What to render and where.
#[derive(Clone)]
pub struct RenderParams {
    pub surface: Surface,
    pub intent: RenderIntent,
    pub transform: Option<[f32; 6]>,
    pub background: Option<Color>,
    pub arbiter: Option<Arc<dyn PriorityArbiter>>,
}

impl RenderParams {
    pub fn new(surface: Surface) -> Self {
        Self {
            surface,
            intent: RenderIntent::Display,
            transform: None,
            background: None,
            arbiter: None,
        }
    }

    pub fn intent(mut self, intent: RenderIntent) -> Self {
        self.intent = intent;
        self
    }

    pub fn transform(mut self, transform: [f32; 6]) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn background(mut self, color: Color) -> Self {
        self.background = Some(color);
        self
    }

    pub fn arbiter(mut self, arbiter: Arc<dyn PriorityArbiter>) -> Self {
        self.arbiter = Some(arbiter);
        self
    }
}

impl fmt::Debug for RenderParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderParams")
            .field("surface", &self.surface.id())
            .field("intent", &self.intent)
            .field("arbiter", &self.arbiter.is_some())
            .finish()
    }
}

/// Operator list of one page intent, shared by the stream pump that fills it and the tasks executing it.
pub(crate) struct OperatorListBuffer {
    list: RwLock<OperatorList>,
    failure: Mutex<Option<MessageError>>,
    /// Bumped on every change
    version: watch::Sender<u64>,
}

impl OperatorListBuffer {
    pub(crate) fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            list: RwLock::new(OperatorList::new()),
            failure: Mutex::new(None),
            version,
        }
    }

    pub(crate) fn push(&self, chunk: OperatorListChunk) {
        write(&self.list).push_chunk(chunk);
        self.version.send_modify(|v| *v += 1);
    }

    /// Ends the list early. Tasks still executing it fail once they reach the end of what arrived.
    pub(crate) fn fail(&self, err: MessageError) {
        {
            let mut list = write(&self.list);
            if list.last_chunk {
                return;
            }
            list.last_chunk = true;
        }
        *lock(&self.failure) = Some(err);
        self.version.send_modify(|v| *v += 1);
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, OperatorList> {
        read(&self.list)
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.read().last_chunk
    }

    pub(crate) fn failure(&self) -> Option<MessageError> {
        lock(&self.failure).clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    pub(crate) async fn wait_complete(&self) -> Result<OperatorList, MessageError> {
        let mut version = self.subscribe();
        // The sender lives in `self`, so this only returns once the list is complete.
        let _ = version.wait_for(|_| self.is_complete()).await.map(|_| ());
        match self.failure() {
            Some(err) => Err(err),
            None => Ok(self.read().clone()),
        }
    }
}

pub(crate) type CompletionCallback = Box<dyn FnOnce(RenderTaskId, Option<&RenderError>) + Send>;

pub(crate) struct TaskInit {
    pub page_number: usize,
    pub surface: Surface,
    pub drawing: DrawingParams,
    pub buffer: Arc<OperatorListBuffer>,
    pub objects: ObjectScope,
    pub arbiter: Option<Arc<dyn PriorityArbiter>>,
    pub config: RenderConfig,
    pub surface_lock: SurfaceLock,
    pub on_complete: CompletionCallback,
}

struct TaskState {
    phase: RenderState,
    /// Next instruction to execute
    index: usize,
    began: bool,
    /// Set by `resume`, consumed at the next continue point
    resume_requested: bool,
    surface_lock: Option<SurfaceLock>,
    on_complete: Option<CompletionCallback>,
}

enum Step {
    Yield,
    Dependency(ObjectId),
    NeedChunks,
    Done,
}

pub(crate) struct InternalRenderTask {
    id: RenderTaskId,
    page_number: usize,
    surface: Surface,
    drawing: DrawingParams,
    buffer: Arc<OperatorListBuffer>,
    objects: ObjectScope,
    arbiter: Option<Arc<dyn PriorityArbiter>>,
    config: RenderConfig,
    state: Mutex<TaskState>,
    resumed: Notify,
    cancelled: CancellationToken,
    completion: watch::Sender<Option<Result<(), RenderError>>>,
}

impl InternalRenderTask {
    pub(crate) fn new(init: TaskInit) -> Arc<Self> {
        let (completion, _) = watch::channel(None);
        Arc::new(Self {
            id: RenderTaskId::new(),
            page_number: init.page_number,
            surface: init.surface,
            drawing: init.drawing,
            buffer: init.buffer,
            objects: init.objects,
            arbiter: init.arbiter,
            config: init.config,
            state: Mutex::new(TaskState {
                phase: RenderState::Initial,
                index: 0,
                began: false,
                resume_requested: false,
                surface_lock: Some(init.surface_lock),
                on_complete: Some(init.on_complete),
            }),
            resumed: Notify::new(),
            cancelled: CancellationToken::new(),
            completion,
        })
    }

    pub(crate) fn id(&self) -> RenderTaskId {
        self.id
    }

    fn phase(&self) -> RenderState {
        lock(&self.state).phase
    }

    /// Drives the task to completion. Returns early when the task is cancelled.
    pub(crate) async fn run(self: Arc<Self>) {
        let outcome = tokio::select! {
            biased;
            _ = self.cancelled.cancelled() => return,
            outcome = self.drive() => outcome,
        };
        self.complete(outcome);
    }

    async fn drive(&self) -> Result<(), RenderError> {
        let mut version = self.buffer.subscribe();
        let ready = version.wait_for(|v| *v > 0).await.map(|_| ());
        if ready.is_err() {
            return Err(RenderError::Destroyed);
        }
        if let Some(err) = self.buffer.failure() {
            return Err(RenderError::Message(err));
        }
        self.initialize_graphics()?;

        loop {
            self.wait_for_priority().await?;
            match self.execute_unit()? {
                Step::Yield => tokio::task::yield_now().await,
                Step::Dependency(id) => {
                    log::trace!("Page[{}]: render task {} waits for {}", self.page_number, self.id, id);
                    self.objects
                        .cache_for(&id)
                        .wait(&id)
                        .await
                        .map_err(|err| RenderError::Drawing(err.to_string()))?;
                }
                Step::NeedChunks => {
                    if version.changed().await.is_err() {
                        return Err(RenderError::Destroyed);
                    }
                }
                Step::Done => return Ok(()),
            }
        }
    }

    fn initialize_graphics(&self) -> Result<(), RenderError> {
        let mut state = lock(&self.state);
        if state.phase != RenderState::Initial {
            return Err(self.cancelled_error());
        }
        self.surface
            .with_backend(|backend| backend.begin_drawing(&self.drawing))
            .map_err(drawing_error)?;
        state.began = true;
        state.phase = RenderState::Running;
        state.index = 0;
        Ok(())
    }

    /// Continue point: pauses until resumed for as long as the arbiter refuses.
    async fn wait_for_priority(&self) -> Result<(), RenderError> {
        let Some(arbiter) = &self.arbiter else {
            return Ok(());
        };
        loop {
            let resumed = self.resumed.notified();
            tokio::pin!(resumed);
            resumed.as_mut().enable();

            self.clear_resume_request()?;
            if arbiter.is_highest_priority(self.id, self.page_number) {
                return self.transition(RenderState::Running);
            }
            if !self.pause()? {
                // Resumed while the arbiter was deciding.
                continue;
            }
            log::trace!("Page[{}]: render task {} paused", self.page_number, self.id);
            resumed.await;
        }
    }

    fn clear_resume_request(&self) -> Result<(), RenderError> {
        let mut state = lock(&self.state);
        if !matches!(state.phase, RenderState::Running | RenderState::Paused) {
            return Err(self.cancelled_error());
        }
        state.resume_requested = false;
        Ok(())
    }

    /// Moves to `Paused` unless a resume arrived since the arbiter was asked. Returns whether it paused.
    fn pause(&self) -> Result<bool, RenderError> {
        let mut state = lock(&self.state);
        if !matches!(state.phase, RenderState::Running | RenderState::Paused) {
            return Err(self.cancelled_error());
        }
        if std::mem::take(&mut state.resume_requested) {
            return Ok(false);
        }
        state.phase = RenderState::Paused;
        Ok(true)
    }

    fn transition(&self, to: RenderState) -> Result<(), RenderError> {
        let mut state = lock(&self.state);
        if !matches!(state.phase, RenderState::Running | RenderState::Paused) {
            return Err(self.cancelled_error());
        }
        state.phase = to;
        Ok(())
    }

    fn execute_unit(&self) -> Result<Step, RenderError> {
        let mut state = lock(&self.state);
        if state.phase != RenderState::Running {
            return Err(self.cancelled_error());
        }
        let list = self.buffer.read();
        let mut budget = WorkBudget::from_config(&self.config);
        let start = state.index;
        let next = self
            .surface
            .with_backend(|backend| backend.execute_instructions(&list.items, start, &mut budget, &self.objects))
            .map_err(drawing_error)?;
        state.index = next;

        if let Some(DisplayItem::Dependency { id }) = list.items.get(next) {
            if !self.objects.has(id) {
                return Ok(Step::Dependency(id.clone()));
            }
        }
        if next < list.items.len() {
            Ok(Step::Yield)
        } else if !list.last_chunk {
            Ok(Step::NeedChunks)
        } else if let Some(err) = self.buffer.failure() {
            Err(RenderError::Message(err))
        } else {
            Ok(Step::Done)
        }
    }

    pub(crate) fn resume(&self) {
        {
            let mut state = lock(&self.state);
            if state.phase.is_terminal() {
                return;
            }
            state.resume_requested = true;
        }
        self.resumed.notify_waiters();
    }

    pub(crate) fn cancel(&self, extra_delay: Duration) {
        self.complete(Err(RenderError::Cancelled(RenderingCancelled {
            page: self.page_number,
            extra_delay,
        })));
    }

    /// Settles the task with `err` unless it already finished.
    pub(crate) fn fail(&self, err: RenderError) {
        self.complete(Err(err));
    }

    fn cancelled_error(&self) -> RenderError {
        RenderError::Cancelled(RenderingCancelled {
            page: self.page_number,
            extra_delay: Duration::ZERO,
        })
    }

    /// Settles the task. Only the first call has any effect.
    fn complete(&self, outcome: Result<(), RenderError>) {
        let (surface_lock, began, on_complete) = {
            let mut state = lock(&self.state);
            if state.phase.is_terminal() {
                return;
            }
            state.phase = if outcome.is_ok() {
                RenderState::Finished
            } else {
                RenderState::Cancelled
            };
            (state.surface_lock.take(), std::mem::take(&mut state.began), state.on_complete.take())
        };
        self.cancelled.cancel();

        if began {
            if let Err(err) = self.surface.with_backend(|backend| backend.end_drawing()) {
                log::warn!("Page[{}]: end_drawing failed: {:#}", self.page_number, err);
            }
        }
        drop(surface_lock);

        match &outcome {
            Ok(()) => log::trace!("Page[{}]: render task {} finished", self.page_number, self.id),
            Err(err) if err.is_cancelled() => log::debug!("Page[{}]: {}", self.page_number, err),
            Err(err) => log::error!("Page[{}]: render task {} failed: {}", self.page_number, self.id, err),
        }

        if let Some(on_complete) = on_complete {
            on_complete(self.id, outcome.as_ref().err());
        }
        self.completion.send_replace(Some(outcome));
    }
}

fn drawing_error(err: anyhow::Error) -> RenderError {
    RenderError::Drawing(format!("{err:#}"))
}

/// Handle to a render started by [`crate::document::PageHandle::render`].
#[derive(Clone)]
pub struct RenderTask {
    inner: Arc<InternalRenderTask>,
}

impl RenderTask {
    pub(crate) fn new(inner: Arc<InternalRenderTask>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> RenderTaskId {
        self.inner.id
    }

    pub fn page_number(&self) -> usize {
        self.inner.page_number
    }

    pub fn state(&self) -> RenderState {
        self.inner.phase()
    }

    /// Resolves when the task finishes. A cancelled task fails with [`RenderError::Cancelled`].
    pub async fn completion(&self) -> Result<(), RenderError> {
        let mut rx = self.inner.completion.subscribe();
        let outcome = rx.wait_for(Option::is_some).await.map(|outcome| outcome.clone());
        match outcome {
            Ok(Some(outcome)) => outcome,
            _ => Err(RenderError::Destroyed),
        }
    }

    /// Stops the task, releases its surface and settles the completion with the cancellation. A no-op
    /// once the task has finished.
    pub fn cancel(&self) {
        self.inner.cancel(Duration::ZERO);
    }

    /// Like [`RenderTask::cancel`], but keeps the operator list stream alive for `extra_delay` beyond the
    /// usual grace window, for callers that expect to render the page again shortly.
    pub fn cancel_with_delay(&self, extra_delay: Duration) {
        self.inner.cancel(extra_delay);
    }

    /// Continues a paused task from the instruction where it stopped.
    pub fn resume(&self) {
        self.inner.resume();
    }
}

impl fmt::Debug for RenderTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderTask")
            .field("id", &self.inner.id)
            .field("page_number", &self.inner.page_number)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DecodedImage, ObjectData};
    use crate::message_handler::SharedBuffer;
    use crate::render::backend::SurfaceSize;
    use crate::render::backends::recording::RecordingBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct Allowance(AtomicUsize);

    impl Allowance {
        fn new(units: usize) -> Arc<Self> {
            Arc::new(Self(AtomicUsize::new(units)))
        }

        fn grant(&self, units: usize) {
            self.0.store(units, Ordering::SeqCst);
        }
    }

    impl PriorityArbiter for Allowance {
        fn is_highest_priority(&self, _task: RenderTaskId, _page_number: usize) -> bool {
            self.0.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
        }
    }

    fn rects(count: usize) -> Vec<DisplayItem> {
        (0..count)
            .map(|n| DisplayItem::Rect { x: n as f32, y: 0.0, w: 1.0, h: 1.0, color: Color::BLACK })
            .collect()
    }

    struct Harness {
        task: Arc<InternalRenderTask>,
        backend: RecordingBackend,
        surface: Surface,
        completions: Arc<AtomicUsize>,
    }

    fn start(
        buffer: Arc<OperatorListBuffer>,
        objects: ObjectScope,
        arbiter: Option<Arc<dyn PriorityArbiter>>,
    ) -> Harness {
        let backend = RecordingBackend::new();
        let size = SurfaceSize { width: 10, height: 10 };
        let surface = Surface::new(size, backend.clone());
        let completions = Arc::new(AtomicUsize::new(0));
        let counter = completions.clone();
        let task = InternalRenderTask::new(TaskInit {
            page_number: 1,
            surface: surface.clone(),
            drawing: DrawingParams {
                page_number: 1,
                size,
                transform: None,
                background: None,
                intent: RenderIntent::Display,
            },
            buffer,
            objects,
            arbiter,
            config: RenderConfig { execution_steps: 1, execution_time: Duration::ZERO },
            surface_lock: SurfaceLock::acquire(surface.id()).unwrap(),
            on_complete: Box::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        });
        tokio::spawn(task.clone().run());
        Harness { task, backend, surface, completions }
    }

    async fn wait_for_state(task: &RenderTask, state: RenderState) {
        tokio::time::timeout(TIMEOUT, async {
            while task.state() != state {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("state not reached");
    }

    #[tokio::test]
    async fn finishes_once_last_chunk_is_executed() {
        let buffer = Arc::new(OperatorListBuffer::new());
        let h = start(buffer.clone(), ObjectScope::default(), None);
        let task = RenderTask::new(h.task.clone());

        buffer.push(OperatorListChunk { items: rects(2), last_chunk: false });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(task.state(), RenderState::Running);
        assert_eq!(h.backend.items().len(), 2);

        buffer.push(OperatorListChunk { items: rects(3), last_chunk: true });
        tokio::time::timeout(TIMEOUT, task.completion()).await.unwrap().unwrap();

        assert_eq!(task.state(), RenderState::Finished);
        assert_eq!(h.backend.items().len(), 5);
        assert_eq!(h.backend.recording().ended, 1);
        assert!(!SurfaceLock::is_locked(h.surface.id()));
    }

    #[tokio::test]
    async fn resumes_at_the_instruction_where_it_paused() {
        let buffer = Arc::new(OperatorListBuffer::new());
        buffer.push(OperatorListChunk { items: rects(6), last_chunk: true });
        let arbiter = Allowance::new(2);
        let h = start(buffer, ObjectScope::default(), Some(arbiter.clone()));
        let task = RenderTask::new(h.task.clone());

        wait_for_state(&task, RenderState::Paused).await;
        assert_eq!(h.backend.items(), rects(2));
        assert!(SurfaceLock::is_locked(h.surface.id()));

        arbiter.grant(usize::MAX);
        task.resume();
        tokio::time::timeout(TIMEOUT, task.completion()).await.unwrap().unwrap();
        assert_eq!(h.backend.items(), rects(6));
    }

    /// Refuses once and resumes the task from inside that refusal.
    #[derive(Default)]
    struct ResumesWhileRefusing {
        task: Mutex<Option<Arc<InternalRenderTask>>>,
        refusals: AtomicUsize,
    }

    impl PriorityArbiter for ResumesWhileRefusing {
        fn is_highest_priority(&self, _task: RenderTaskId, _page_number: usize) -> bool {
            if self.refusals.fetch_add(1, Ordering::SeqCst) > 0 {
                return true;
            }
            if let Some(task) = self.task.lock().unwrap().as_ref() {
                task.resume();
            }
            false
        }
    }

    #[tokio::test]
    async fn resume_during_refusal_is_not_lost() {
        let buffer = Arc::new(OperatorListBuffer::new());
        buffer.push(OperatorListChunk { items: rects(3), last_chunk: true });
        let arbiter = Arc::new(ResumesWhileRefusing::default());
        let h = start(buffer, ObjectScope::default(), Some(arbiter.clone()));
        *arbiter.task.lock().unwrap() = Some(h.task.clone());
        let task = RenderTask::new(h.task.clone());

        tokio::time::timeout(Duration::from_secs(2), task.completion()).await.unwrap().unwrap();
        assert_eq!(task.state(), RenderState::Finished);
        assert_eq!(h.backend.items(), rects(3));
        assert!(arbiter.refusals.load(Ordering::SeqCst) >= 2);
        arbiter.task.lock().unwrap().take();
    }

    #[tokio::test]
    async fn cancelled_while_paused_never_resumes() {
        let buffer = Arc::new(OperatorListBuffer::new());
        buffer.push(OperatorListChunk { items: rects(4), last_chunk: true });
        let arbiter = Allowance::new(0);
        let h = start(buffer, ObjectScope::default(), Some(arbiter.clone()));
        let task = RenderTask::new(h.task.clone());

        wait_for_state(&task, RenderState::Paused).await;
        task.cancel();
        arbiter.grant(usize::MAX);
        task.resume();
        task.cancel();

        let err = tokio::time::timeout(TIMEOUT, task.completion()).await.unwrap().unwrap_err();
        assert!(matches!(err, RenderError::Cancelled(RenderingCancelled { page: 1, .. })));
        assert_eq!(err.to_string(), "Rendering cancelled, page 1");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(task.state(), RenderState::Cancelled);
        assert!(h.backend.items().is_empty());
        assert_eq!(h.backend.recording().ended, 1);
        assert_eq!(h.completions.load(Ordering::SeqCst), 1);
        assert!(!SurfaceLock::is_locked(h.surface.id()));
    }

    #[tokio::test]
    async fn waits_for_dependencies() {
        let buffer = Arc::new(OperatorListBuffer::new());
        let id = ObjectId::new("img_p0_1");
        buffer.push(OperatorListChunk {
            items: vec![
                DisplayItem::Dependency { id: id.clone() },
                DisplayItem::PaintImage { id: id.clone(), x: 0.0, y: 0.0, w: 1.0, h: 1.0 },
            ],
            last_chunk: true,
        });
        let objects = ObjectScope::default();
        let h = start(buffer, objects.clone(), None);
        let task = RenderTask::new(h.task.clone());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(task.state(), RenderState::Running);
        assert!(h.backend.items().is_empty());

        let image = DecodedImage::new(1, 1, SharedBuffer::from(vec![0, 0, 0, 255]));
        objects.page.resolve(id, ObjectData::Image(Arc::new(image)));
        tokio::time::timeout(TIMEOUT, task.completion()).await.unwrap().unwrap();
        assert_eq!(h.backend.items().len(), 2);
    }

    #[tokio::test]
    async fn drawing_errors_cancel_the_task() {
        let buffer = Arc::new(OperatorListBuffer::new());
        buffer.push(OperatorListChunk {
            items: vec![DisplayItem::PaintImage { id: ObjectId::new("missing"), x: 0.0, y: 0.0, w: 1.0, h: 1.0 }],
            last_chunk: true,
        });
        let h = start(buffer, ObjectScope::default(), None);
        let task = RenderTask::new(h.task.clone());

        let err = tokio::time::timeout(TIMEOUT, task.completion()).await.unwrap().unwrap_err();
        assert!(matches!(err, RenderError::Drawing(_)));
        assert_eq!(task.state(), RenderState::Cancelled);
        assert!(!SurfaceLock::is_locked(h.surface.id()));
    }

    #[tokio::test]
    async fn failed_list_without_data_rejects() {
        let buffer = Arc::new(OperatorListBuffer::new());
        let h = start(buffer.clone(), ObjectScope::default(), None);
        let task = RenderTask::new(h.task.clone());

        buffer.fail(MessageError::Destroyed);
        let err = tokio::time::timeout(TIMEOUT, task.completion()).await.unwrap().unwrap_err();
        assert!(matches!(err, RenderError::Message(MessageError::Destroyed)));
        assert_eq!(h.backend.recording().params.len(), 0);
    }
}
