//! Operator lists and display items.
//!
//! The backend turns a page into a flat sequence of [`DisplayItem`] commands, its operator list, and
//! streams it to the client in [`OperatorListChunk`]s. On the client every rendering intent of a page
//! accumulates the chunks into one [`OperatorList`] which render tasks execute incrementally.
//!
//! # Example
//!
//! ```rust
//! use folio_engine::render::{Color, DisplayItem, OperatorList, OperatorListChunk};
//!
//! let mut list = OperatorList::new();
//! list.push_chunk(OperatorListChunk {
//!     items: vec![
//!         DisplayItem::Clear { color: Color::WHITE },
//!         DisplayItem::Rect { x: 10.0, y: 20.0, w: 100.0, h: 50.0, color: Color::from_u8(255, 0, 0, 255) },
//!     ],
//!     last_chunk: true,
//! });
//! assert_eq!(list.len(), 2);
//! assert!(list.last_chunk);
//! ```

use serde::{Deserialize, Serialize};

use crate::document::ObjectId;

/// RGBA color used for drawing commands.
///
/// Channels are represented as `f32` in the range `0.0 ..= 1.0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    pub const WHITE: Color = Color { r: 1.0, g: 1.0, b: 1.0, a: 1.0 };
    pub const BLACK: Color = Color { r: 0.0, g: 0.0, b: 0.0, a: 1.0 };

    /// Creates a new color from `f32` channel values in the range `0.0 ..= 1.0`.
    pub fn new(r: f32, g: f32, b: f32, a: f32) -> Color {
        Color { r, g, b, a }
    }

    /// Creates a new color from `u8` channel values in the range `0 ..= 255`.
    pub fn from_u8(r: u8, g: u8, b: u8, a: u8) -> Color {
        Color {
            r: r as f32 / 255.0,
            g: g as f32 / 255.0,
            b: b as f32 / 255.0,
            a: a as f32 / 255.0,
        }
    }
}

/// A single drawing command.
///
/// Variants:
/// - [`DisplayItem::Save`] / [`DisplayItem::Restore`]: push and pop the graphics state.
/// - [`DisplayItem::Transform`]: multiply the current transform.
/// - [`DisplayItem::Clear`], [`DisplayItem::Rect`], [`DisplayItem::TextRun`], [`DisplayItem::PaintImage`]:
///   paint.
/// - [`DisplayItem::Dependency`]: the following commands need object `id`; execution waits until it has
///   been resolved.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum DisplayItem {
    Save,
    Restore,
    Transform {
        matrix: [f32; 6],
    },
    /// Clear the entire surface with the given color.
    Clear {
        color: Color,
    },
    /// Draw a filled rectangle at `(x, y)` with width `w` and height `h`.
    Rect {
        x: f32,
        y: f32,
        w: f32,
        h: f32,
        color: Color,
    },
    /// Draw a text run at `(x, y)` with font size `size`, using a font object when given.
    TextRun {
        x: f32,
        y: f32,
        text: String,
        size: f32,
        color: Color,
        font: Option<ObjectId>,
    },
    /// Draw image object `id` into the given rectangle.
    PaintImage {
        id: ObjectId,
        x: f32,
        y: f32,
        w: f32,
        h: f32,
    },
    Dependency {
        id: ObjectId,
    },
}

/// One piece of a streamed operator list.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OperatorListChunk {
    pub items: Vec<DisplayItem>,
    /// Set on the final chunk of a page
    pub last_chunk: bool,
}

/// Operator list of one page intent, growing as chunks arrive.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OperatorList {
    pub items: Vec<DisplayItem>,
    pub last_chunk: bool,
}

impl OperatorList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_chunk(&mut self, chunk: OperatorListChunk) {
        self.items.extend(chunk.items);
        self.last_chunk = chunk.last_chunk;
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
