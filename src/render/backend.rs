use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use uuid::Uuid;

use crate::config::RenderConfig;
use crate::document::{ObjectCache, ObjectData, ObjectId, RenderIntent};
use crate::errors::{ObjectCacheError, RenderError};
use crate::render::{Color, DisplayItem};
use crate::sync::lock;

/// Size of a surface in pixels. It's a simple struct to hold width and height.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SurfaceSize {
    pub width: u32,
    pub height: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(Uuid);

impl SurfaceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SurfaceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Passed to [`DrawingBackend::begin_drawing`].
#[derive(Clone, Debug, PartialEq)]
pub struct DrawingParams {
    pub page_number: usize,
    pub size: SurfaceSize,
    pub transform: Option<[f32; 6]>,
    pub background: Option<Color>,
    pub intent: RenderIntent,
}

/// Objects visible to a render task: the document wide cache and the cache of the page being rendered.
#[derive(Clone, Debug, Default)]
pub struct ObjectScope {
    pub common: ObjectCache,
    pub page: ObjectCache,
}

impl ObjectScope {
    pub fn cache_for(&self, id: &ObjectId) -> &ObjectCache {
        if id.is_common() {
            &self.common
        } else {
            &self.page
        }
    }

    pub fn has(&self, id: &ObjectId) -> bool {
        self.cache_for(id).has(id)
    }

    pub fn get(&self, id: &ObjectId) -> Result<ObjectData, ObjectCacheError> {
        self.cache_for(id).get(id)
    }
}

/// Bounds one unit of render work: after every `steps` instructions the elapsed time is checked, and the
/// unit ends once `time` has passed.
#[derive(Debug)]
pub struct WorkBudget {
    steps: usize,
    time: Duration,
    started: Instant,
    executed: usize,
}

impl WorkBudget {
    pub fn new(steps: usize, time: Duration) -> Self {
        Self {
            steps: steps.max(1),
            time,
            started: Instant::now(),
            executed: 0,
        }
    }

    pub fn from_config(config: &RenderConfig) -> Self {
        Self::new(config.execution_steps, config.execution_time)
    }

    /// Counts one executed instruction. Returns true when the unit is used up.
    pub fn tick(&mut self) -> bool {
        self.executed += 1;
        self.executed % self.steps == 0 && self.started.elapsed() >= self.time
    }

    pub fn executed(&self) -> usize {
        self.executed
    }
}

/// Drawing backend interface. Calls for one surface never overlap.
pub trait DrawingBackend: Send {
    fn name(&self) -> &str;

    fn begin_drawing(&mut self, params: &DrawingParams) -> anyhow::Result<()>;

    /// Executes a single instruction. Dependencies have been resolved by the time this is called.
    fn execute(&mut self, item: &DisplayItem, objects: &ObjectScope) -> anyhow::Result<()>;

    fn end_drawing(&mut self) -> anyhow::Result<()>;

    /// Executes `items` from `start` until the budget is used up, the list ends, or a dependency is not
    /// resolved yet. Returns the index of the next instruction to execute.
    fn execute_instructions(
        &mut self,
        items: &[DisplayItem],
        start: usize,
        budget: &mut WorkBudget,
        objects: &ObjectScope,
    ) -> anyhow::Result<usize> {
        let mut index = start;
        while index < items.len() {
            let item = &items[index];
            if let DisplayItem::Dependency { id } = item {
                if !objects.has(id) {
                    break;
                }
            }
            self.execute(item, objects)?;
            index += 1;
            if budget.tick() {
                break;
            }
        }
        Ok(index)
    }
}

/// A drawing target. Clones share the same backend.
#[derive(Clone)]
pub struct Surface {
    id: SurfaceId,
    size: SurfaceSize,
    backend: Arc<Mutex<Box<dyn DrawingBackend>>>,
}

impl Surface {
    pub fn new(size: SurfaceSize, backend: impl DrawingBackend + 'static) -> Self {
        Self {
            id: SurfaceId::new(),
            size,
            backend: Arc::new(Mutex::new(Box::new(backend))),
        }
    }

    pub fn id(&self) -> SurfaceId {
        self.id
    }

    pub fn size(&self) -> SurfaceSize {
        self.size
    }

    pub(crate) fn with_backend<R>(&self, f: impl FnOnce(&mut dyn DrawingBackend) -> R) -> R {
        let mut backend = lock(&self.backend);
        f(backend.as_mut())
    }
}

impl fmt::Debug for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let backend = lock(&self.backend);
        f.debug_struct("Surface")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("backend", &backend.name())
            .finish()
    }
}

lazy_static! {
    static ref SURFACES_IN_RENDERING: Mutex<HashSet<SurfaceId>> = Mutex::new(HashSet::new());
}

/// Exclusive claim on a surface, held by the render task drawing to it.
#[derive(Debug)]
pub(crate) struct SurfaceLock(SurfaceId);

impl SurfaceLock {
    pub(crate) fn acquire(id: SurfaceId) -> Result<Self, RenderError> {
        if !lock(&SURFACES_IN_RENDERING).insert(id) {
            return Err(RenderError::SurfaceInUse(id));
        }
        Ok(Self(id))
    }

    pub(crate) fn is_locked(id: SurfaceId) -> bool {
        lock(&SURFACES_IN_RENDERING).contains(&id)
    }
}

impl Drop for SurfaceLock {
    fn drop(&mut self) {
        lock(&SURFACES_IN_RENDERING).remove(&self.0);
    }
}
