use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{MessageError, PasswordReason};
use crate::message_handler::SharedBuffer;

/// Where a document comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DocumentSource {
    Url(String),
    Data(SharedBuffer),
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum SourceDescriptor {
    Url { url: String },
    /// Bytes travel in the payload's first buffer
    Data,
}

impl DocumentSource {
    pub(crate) fn to_wire(&self) -> (Value, Option<SharedBuffer>) {
        match self {
            DocumentSource::Url(url) => (
                serde_json::json!({ "type": "url", "url": url }),
                None,
            ),
            DocumentSource::Data(bytes) => (serde_json::json!({ "type": "data" }), Some(bytes.clone())),
        }
    }

    pub(crate) fn from_wire(value: &Value, buffer: Option<&SharedBuffer>) -> Result<Self, MessageError> {
        match SourceDescriptor::deserialize(value)? {
            SourceDescriptor::Url { url } => Ok(DocumentSource::Url(url)),
            SourceDescriptor::Data => buffer
                .cloned()
                .map(DocumentSource::Data)
                .ok_or_else(|| MessageError::Payload("document data buffer missing".into())),
        }
    }
}

impl fmt::Display for DocumentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentSource::Url(url) => write!(f, "{url}"),
            DocumentSource::Data(bytes) => write!(f, "<{} bytes>", bytes.len()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentInfo {
    pub num_pages: usize,
    pub fingerprint: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PageInfo {
    /// Clockwise rotation in degrees
    pub rotate: i32,
    /// Backend reference of the page object, e.g. `"12R"`
    pub reference: Option<String>,
    /// `[x0, y0, x1, y1]` in page units
    pub view: [f32; 4],
}

impl Default for PageInfo {
    fn default() -> Self {
        Self {
            rotate: 0,
            reference: None,
            view: [0.0, 0.0, 612.0, 792.0],
        }
    }
}

impl PageInfo {
    pub fn width(&self) -> f32 {
        self.view[2] - self.view[0]
    }

    pub fn height(&self) -> f32 {
        self.view[3] - self.view[1]
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub id: String,
    pub subtype: String,
    pub rect: [f32; 4],
    pub contents: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TextItem {
    pub text: String,
    pub transform: [f32; 6],
    pub width: f32,
    pub height: f32,
    pub font_name: Option<String>,
}

/// Text of a page. Streamed in chunks of the same shape.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TextContent {
    pub items: Vec<TextItem>,
}

/// Loading progress reported by the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub loaded: u64,
    pub total: Option<u64>,
}

/// Named purpose of a render. Every intent has its own operator list.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderIntent {
    #[default]
    Display,
    Print,
}

/// Key of a page's per-intent state. `OperatorList` backs [`crate::document::PageHandle::get_operator_list`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum IntentKey {
    Render(RenderIntent),
    OperatorList,
}

impl IntentKey {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            IntentKey::Render(RenderIntent::Display) => "display",
            IntentKey::Render(RenderIntent::Print) => "print",
            IntentKey::OperatorList => "oplist",
        }
    }
}

impl fmt::Display for IntentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------- Wire messages ----------

#[derive(Serialize, Deserialize)]
pub(crate) struct DocRequest {
    pub doc_id: String,
    pub source: Value,
    pub password: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct DocRequestReply {
    pub worker_id: String,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct PageRequest {
    /// Zero based
    pub page_index: usize,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct IntentRequest {
    pub page_index: usize,
    pub intent: String,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct PasswordRequest {
    pub code: PasswordReason,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct PasswordReply {
    pub password: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct UnsupportedFeature {
    pub feature: String,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct Configure {
    pub verbosity: crate::config::Verbosity,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct ProbeReply {
    pub support_transfers: bool,
}
