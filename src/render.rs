pub mod backend;

/// Drawing backends shipped with the engine.
pub mod backends {
    pub mod null;
    /// Records executed instructions instead of drawing them
    pub mod recording;
}

mod operator_list;
mod task;

pub use backend::{DrawingBackend, DrawingParams, ObjectScope, Surface, SurfaceId, SurfaceSize, WorkBudget};
pub use operator_list::{Color, DisplayItem, OperatorList, OperatorListChunk};
pub use task::{PriorityArbiter, RenderParams, RenderState, RenderTask, RenderTaskId};

pub(crate) use backend::SurfaceLock;
pub(crate) use task::{InternalRenderTask, OperatorListBuffer, TaskInit};
