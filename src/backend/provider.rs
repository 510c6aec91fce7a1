use std::sync::Arc;

use futures::stream::BoxStream;
use serde_json::Value;

use crate::document::{Annotation, DocumentInfo, DocumentSource, ObjectId, PageInfo, Progress, TextContent};
use crate::errors::RemoteError;
use crate::message_handler::SharedBuffer;
use crate::render::DisplayItem;

/// Object produced while building an operator list.
#[derive(Clone, Debug, PartialEq)]
pub enum BackendObject {
    Font { name: String, bytes: Vec<u8> },
    /// RGBA pixels, `width * 4` bytes per row
    Image { width: u32, height: u32, pixels: Vec<u8> },
    Other(Value),
}

#[derive(Clone, Debug, PartialEq)]
pub struct PageObject {
    pub id: ObjectId,
    pub data: BackendObject,
}

/// Opens documents on the backend side of the channel.
pub trait DocumentProvider: Send + Sync {
    /// Opens `source`. A password protected document fails with [`RemoteError::Password`] until the right
    /// password is given. `progress` may be called any number of times before this returns.
    fn open(
        &self,
        source: &DocumentSource,
        password: Option<&str>,
        progress: &dyn Fn(Progress),
    ) -> Result<Arc<dyn BackendDocument>, RemoteError>;
}

/// An open document. Page indices are zero based.
pub trait BackendDocument: Send + Sync {
    fn info(&self) -> DocumentInfo;

    fn page(&self, page_index: usize) -> Result<PageInfo, RemoteError>;

    /// Objects the operator list of a page refers to. Sent to the client before the first chunk.
    fn page_objects(&self, page_index: usize) -> anyhow::Result<Vec<PageObject>>;

    /// Operator list of a page, in chunks.
    fn operator_list(&self, page_index: usize, intent: &str) -> BoxStream<'static, anyhow::Result<Vec<DisplayItem>>>;

    fn annotations(&self, page_index: usize, intent: &str) -> anyhow::Result<Vec<Annotation>>;

    fn text_content(&self, page_index: usize) -> BoxStream<'static, anyhow::Result<TextContent>>;

    /// Raw bytes of the document.
    fn data(&self) -> anyhow::Result<SharedBuffer>;

    /// Features found while opening that cannot be rendered faithfully.
    fn unsupported_features(&self) -> Vec<String> {
        Vec::new()
    }

    /// Drops caches kept for pages.
    fn cleanup(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
