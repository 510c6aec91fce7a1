use std::sync::{Arc, Mutex};

use anyhow::anyhow;

use crate::document::ObjectData;
use crate::render::backend::{DrawingBackend, DrawingParams, ObjectScope};
use crate::render::DisplayItem;
use crate::sync::lock;

/// Everything a [`RecordingBackend`] has seen.
#[derive(Clone, Debug, Default)]
pub struct Recording {
    pub params: Vec<DrawingParams>,
    pub items: Vec<DisplayItem>,
    pub ended: usize,
}

/// Backend that records the instructions it executes. Clones share the same recording, so a test can keep
/// one handle while the surface owns the other.
///
/// Painting an image or a text run whose object is not in the cache fails the render, the way a real
/// rasterizer would.
#[derive(Clone, Debug, Default)]
pub struct RecordingBackend {
    recording: Arc<Mutex<Recording>>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recording(&self) -> Recording {
        lock(&self.recording).clone()
    }

    pub fn items(&self) -> Vec<DisplayItem> {
        lock(&self.recording).items.clone()
    }
}

impl DrawingBackend for RecordingBackend {
    fn name(&self) -> &str {
        "RecordingBackend"
    }

    fn begin_drawing(&mut self, params: &DrawingParams) -> anyhow::Result<()> {
        lock(&self.recording).params.push(params.clone());
        Ok(())
    }

    fn execute(&mut self, item: &DisplayItem, objects: &ObjectScope) -> anyhow::Result<()> {
        match item {
            DisplayItem::PaintImage { id, .. } => match objects.get(id)? {
                ObjectData::Image(image) if !image.is_released() => {}
                _ => return Err(anyhow!("{id} is not a decoded image")),
            },
            DisplayItem::TextRun { font: Some(id), .. } => {
                if !matches!(objects.get(id)?, ObjectData::Font(_)) {
                    return Err(anyhow!("{id} is not a font"));
                }
            }
            _ => {}
        }
        lock(&self.recording).items.push(item.clone());
        Ok(())
    }

    fn end_drawing(&mut self) -> anyhow::Result<()> {
        lock(&self.recording).ended += 1;
        Ok(())
    }
}
