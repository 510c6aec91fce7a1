use crate::render::backend::{DrawingBackend, DrawingParams, ObjectScope};
use crate::render::DisplayItem;

/// Null backend that executes instructions without drawing anything.
#[derive(Debug, Default)]
pub struct NullBackend {
    /// Number of frames drawn so far.
    frame_id: u64,
}

impl NullBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }
}

impl DrawingBackend for NullBackend {
    fn name(&self) -> &str {
        "NullBackend"
    }

    fn begin_drawing(&mut self, _params: &DrawingParams) -> anyhow::Result<()> {
        Ok(())
    }

    fn execute(&mut self, _item: &DisplayItem, _objects: &ObjectScope) -> anyhow::Result<()> {
        Ok(())
    }

    fn end_drawing(&mut self) -> anyhow::Result<()> {
        self.frame_id = self.frame_id.wrapping_add(1);
        Ok(())
    }
}
