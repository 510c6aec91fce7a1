//! Client side document API.
//!
//! [`DocumentLoader`] starts a load and returns a [`LoadingTask`]; once it settles, the [`DocumentHandle`]
//! hands out [`PageHandle`]s which render, stream text content and fetch annotations. All of them talk to
//! the backend through the document's own message handler.

mod handle;
mod loading;
mod object_cache;
mod page;
mod session;
mod types;

pub use handle::DocumentHandle;
pub use loading::{open_document, DocumentLoader, LoadingTask, PasswordCallback};
pub use object_cache::{DecodedImage, FontObject, ObjectCache, ObjectData, ObjectId};
pub use page::PageHandle;
pub use types::{
    Annotation, DocumentInfo, DocumentSource, PageInfo, Progress, RenderIntent, TextContent, TextItem,
};

pub(crate) use object_cache::{ObjectHeader, ObjectKind};
pub(crate) use session::DocumentSession;
pub(crate) use types::{
    Configure, DocRequest, DocRequestReply, IntentKey, IntentRequest, PageRequest, PasswordReply, PasswordRequest,
    ProbeReply, UnsupportedFeature,
};
