use std::fmt;
use std::sync::Arc;

use crate::document::{DocumentInfo, DocumentSession, ObjectCache, PageHandle};
use crate::errors::DocumentError;
use crate::message_handler::SharedBuffer;

/// An open document. Clones refer to the same session.
#[derive(Clone)]
pub struct DocumentHandle {
    session: Arc<DocumentSession>,
}

impl DocumentHandle {
    pub(crate) fn new(session: Arc<DocumentSession>) -> Self {
        Self { session }
    }

    /// Id the client uses to address this document, e.g. `"d3"`.
    pub fn doc_id(&self) -> &str {
        self.session.doc_id()
    }

    pub fn num_pages(&self) -> usize {
        self.session.info().num_pages
    }

    pub fn fingerprint(&self) -> &str {
        &self.session.info().fingerprint
    }

    pub fn info(&self) -> &DocumentInfo {
        self.session.info()
    }

    /// Objects shared by every page of the document.
    pub fn common_objs(&self) -> &ObjectCache {
        self.session.common_objs()
    }

    /// One based.
    pub async fn get_page(&self, page_number: usize) -> Result<PageHandle, DocumentError> {
        self.session.get_page(page_number).await
    }

    pub async fn get_data(&self) -> Result<SharedBuffer, DocumentError> {
        self.session.get_data().await
    }

    pub async fn cleanup(&self) -> Result<(), DocumentError> {
        self.session.cleanup().await
    }

    pub async fn destroy(&self) {
        self.session.destroy().await
    }

    pub fn is_destroyed(&self) -> bool {
        self.session.is_destroyed()
    }

    #[cfg(test)]
    pub(crate) fn handler(&self) -> Arc<crate::message_handler::MessageHandler> {
        self.session.handler().clone()
    }
}

impl fmt::Debug for DocumentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentHandle")
            .field("doc_id", &self.session.doc_id())
            .field("info", self.session.info())
            .finish()
    }
}
