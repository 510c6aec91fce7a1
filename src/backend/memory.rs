use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use futures::stream::{self, BoxStream, StreamExt};

use crate::backend::{BackendDocument, BackendObject, DocumentProvider, PageObject};
use crate::document::{Annotation, DocumentInfo, DocumentSource, ObjectId, PageInfo, Progress, TextContent, TextItem};
use crate::errors::{PasswordReason, RemoteError};
use crate::message_handler::SharedBuffer;
use crate::render::DisplayItem;
use crate::sync::lock;

/// A page of a [`MemoryDocument`].
#[derive(Clone, Debug, Default)]
pub struct MemoryPage {
    pub info: PageInfo,
    pub items: Vec<DisplayItem>,
    pub objects: Vec<PageObject>,
    pub text: Vec<TextItem>,
    pub annotations: Vec<Annotation>,
    /// Display items per operator list chunk, everything in one chunk when zero
    pub chunk_size: usize,
    /// Delay before every operator list chunk
    pub chunk_delay: Duration,
    pub operator_list_error: Option<String>,
}

impl MemoryPage {
    pub fn new(items: Vec<DisplayItem>) -> Self {
        Self { items, ..Default::default() }
    }

    pub fn with_object(mut self, id: impl Into<String>, data: BackendObject) -> Self {
        self.objects.push(PageObject { id: ObjectId::new(id), data });
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        let y = 700.0 - 14.0 * self.text.len() as f32;
        self.text.push(TextItem {
            text: text.into(),
            transform: [12.0, 0.0, 0.0, 12.0, 72.0, y],
            width: 0.0,
            height: 12.0,
            font_name: None,
        });
        self
    }

    pub fn with_annotation(mut self, annotation: Annotation) -> Self {
        self.annotations.push(annotation);
        self
    }

    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    pub fn chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub fn fail_operator_list(mut self, message: impl Into<String>) -> Self {
        self.operator_list_error = Some(message.into());
        self
    }
}

/// Document held in memory, mostly useful for tests and embedding pre-built content.
#[derive(Clone, Debug, Default)]
pub struct MemoryDocument {
    pub fingerprint: String,
    pub pages: Vec<MemoryPage>,
    pub password: Option<String>,
    pub data: Vec<u8>,
    pub unsupported_features: Vec<String>,
}

impl MemoryDocument {
    pub fn new(fingerprint: impl Into<String>) -> Self {
        Self { fingerprint: fingerprint.into(), ..Default::default() }
    }

    pub fn page(mut self, page: MemoryPage) -> Self {
        self.pages.push(page);
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    pub fn unsupported_feature(mut self, feature: impl Into<String>) -> Self {
        self.unsupported_features.push(feature.into());
        self
    }
}

/// Counters of the requests a [`MemoryDocumentProvider`] has served.
#[derive(Debug, Default)]
pub struct ProviderStats {
    documents_opened: AtomicUsize,
    page_requests: AtomicUsize,
    operator_list_requests: AtomicUsize,
    text_content_requests: AtomicUsize,
}

impl ProviderStats {
    pub fn documents_opened(&self) -> usize {
        self.documents_opened.load(Ordering::SeqCst)
    }

    pub fn page_requests(&self) -> usize {
        self.page_requests.load(Ordering::SeqCst)
    }

    pub fn operator_list_requests(&self) -> usize {
        self.operator_list_requests.load(Ordering::SeqCst)
    }

    pub fn text_content_requests(&self) -> usize {
        self.text_content_requests.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
enum Entry {
    Document(Arc<MemoryDocument>),
    Invalid(String),
}

#[derive(Clone, PartialEq, Eq, Hash)]
enum SourceKey {
    Url(String),
    Data(Vec<u8>),
}

impl SourceKey {
    fn of(source: &DocumentSource) -> Self {
        match source {
            DocumentSource::Url(url) => SourceKey::Url(url.clone()),
            DocumentSource::Data(bytes) => SourceKey::Data(bytes.as_slice().to_vec()),
        }
    }
}

/// Serves [`MemoryDocument`]s registered by URL or by their bytes.
#[derive(Default)]
pub struct MemoryDocumentProvider {
    entries: Mutex<HashMap<SourceKey, Entry>>,
    stats: Arc<ProviderStats>,
}

impl MemoryDocumentProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_url(&self, url: impl Into<String>, document: MemoryDocument) {
        lock(&self.entries).insert(SourceKey::Url(url.into()), Entry::Document(Arc::new(document)));
    }

    /// Registers a document that is opened from its bytes.
    pub fn add_data(&self, mut document: MemoryDocument) -> SharedBuffer {
        if document.data.is_empty() {
            document.data = format!("%MEM-{}", document.fingerprint).into_bytes();
        }
        let bytes = document.data.clone();
        lock(&self.entries).insert(SourceKey::Data(bytes.clone()), Entry::Document(Arc::new(document)));
        SharedBuffer::from(bytes)
    }

    /// Registers a URL that resolves to something which is not a document.
    pub fn add_invalid(&self, url: impl Into<String>, message: impl Into<String>) {
        lock(&self.entries).insert(SourceKey::Url(url.into()), Entry::Invalid(message.into()));
    }

    pub fn stats(&self) -> Arc<ProviderStats> {
        self.stats.clone()
    }
}

impl DocumentProvider for MemoryDocumentProvider {
    fn open(
        &self,
        source: &DocumentSource,
        password: Option<&str>,
        progress: &dyn Fn(Progress),
    ) -> Result<Arc<dyn BackendDocument>, RemoteError> {
        let entry = lock(&self.entries).get(&SourceKey::of(source)).cloned();
        let document = match entry {
            Some(Entry::Document(document)) => document,
            Some(Entry::Invalid(message)) => return Err(RemoteError::InvalidDocument { message }),
            None => {
                return Err(match source {
                    DocumentSource::Url(url) => RemoteError::MissingDocument {
                        message: format!("Missing PDF \"{url}\"."),
                    },
                    DocumentSource::Data(_) => RemoteError::InvalidDocument {
                        message: "Invalid PDF structure.".into(),
                    },
                })
            }
        };

        let total = document.data.len() as u64;
        progress(Progress { loaded: 0, total: Some(total) });

        match (&document.password, password) {
            (Some(_), None) => {
                return Err(RemoteError::Password {
                    message: "No password given".into(),
                    code: PasswordReason::NeedPassword,
                })
            }
            (Some(expected), Some(given)) if expected != given => {
                return Err(RemoteError::Password {
                    message: "Incorrect Password".into(),
                    code: PasswordReason::IncorrectPassword,
                })
            }
            _ => {}
        }

        progress(Progress { loaded: total, total: Some(total) });
        self.stats.documents_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(OpenDocument {
            document,
            stats: self.stats.clone(),
        }))
    }
}

struct OpenDocument {
    document: Arc<MemoryDocument>,
    stats: Arc<ProviderStats>,
}

impl OpenDocument {
    fn page_at(&self, page_index: usize) -> Result<&MemoryPage, RemoteError> {
        self.document
            .pages
            .get(page_index)
            .ok_or_else(|| RemoteError::unknown(format!("Invalid page index {page_index}")))
    }
}

impl BackendDocument for OpenDocument {
    fn info(&self) -> DocumentInfo {
        DocumentInfo {
            num_pages: self.document.pages.len(),
            fingerprint: self.document.fingerprint.clone(),
        }
    }

    fn page(&self, page_index: usize) -> Result<PageInfo, RemoteError> {
        self.stats.page_requests.fetch_add(1, Ordering::SeqCst);
        Ok(self.page_at(page_index)?.info.clone())
    }

    fn page_objects(&self, page_index: usize) -> anyhow::Result<Vec<PageObject>> {
        Ok(self.page_at(page_index)?.objects.clone())
    }

    fn operator_list(&self, page_index: usize, _intent: &str) -> BoxStream<'static, anyhow::Result<Vec<DisplayItem>>> {
        self.stats.operator_list_requests.fetch_add(1, Ordering::SeqCst);
        let page = match self.page_at(page_index) {
            Ok(page) => page.clone(),
            Err(err) => return stream::once(async move { Err(err.into()) }).boxed(),
        };
        if let Some(message) = page.operator_list_error {
            return stream::once(async move { Err(anyhow!(message)) }).boxed();
        }

        let size = if page.chunk_size == 0 { page.items.len().max(1) } else { page.chunk_size };
        let chunks: Vec<Vec<DisplayItem>> = page.items.chunks(size).map(<[DisplayItem]>::to_vec).collect();
        let delay = page.chunk_delay;
        stream::iter(chunks)
            .then(move |chunk| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok::<_, anyhow::Error>(chunk)
            })
            .boxed()
    }

    fn annotations(&self, page_index: usize, _intent: &str) -> anyhow::Result<Vec<Annotation>> {
        Ok(self.page_at(page_index)?.annotations.clone())
    }

    fn text_content(&self, page_index: usize) -> BoxStream<'static, anyhow::Result<TextContent>> {
        self.stats.text_content_requests.fetch_add(1, Ordering::SeqCst);
        match self.page_at(page_index) {
            // One chunk per text item, so consumers see real backpressure.
            Ok(page) => stream::iter(page.text.clone())
                .map(|item| Ok::<_, anyhow::Error>(TextContent { items: vec![item] }))
                .boxed(),
            Err(err) => stream::once(async move { Err(err.into()) }).boxed(),
        }
    }

    fn data(&self) -> anyhow::Result<SharedBuffer> {
        Ok(SharedBuffer::from(self.document.data.clone()))
    }

    fn unsupported_features(&self) -> Vec<String> {
        self.document.unsupported_features.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ignore(_: Progress) {}

    #[test]
    fn missing_and_invalid_sources() {
        let provider = MemoryDocumentProvider::new();
        provider.add_invalid("broken.pdf", "no header");

        let missing = provider.open(&DocumentSource::Url("nope.pdf".into()), None, &ignore).err();
        assert!(matches!(missing, Some(RemoteError::MissingDocument { .. })));

        let invalid = provider.open(&DocumentSource::Url("broken.pdf".into()), None, &ignore).err();
        assert_eq!(invalid, Some(RemoteError::InvalidDocument { message: "no header".into() }));
    }

    #[test]
    fn password_is_checked() {
        let provider = MemoryDocumentProvider::new();
        provider.add_url("locked.pdf", MemoryDocument::new("abc").password("secret"));
        let source = DocumentSource::Url("locked.pdf".into());

        let err = provider.open(&source, None, &ignore).err();
        assert!(matches!(err, Some(RemoteError::Password { code: PasswordReason::NeedPassword, .. })));
        let err = provider.open(&source, Some("guess"), &ignore).err();
        assert!(matches!(err, Some(RemoteError::Password { code: PasswordReason::IncorrectPassword, .. })));

        assert!(provider.open(&source, Some("secret"), &ignore).is_ok());
        assert_eq!(provider.stats().documents_opened(), 1);
    }

    #[tokio::test]
    async fn operator_list_is_chunked() {
        let provider = MemoryDocumentProvider::new();
        let items = vec![DisplayItem::Save, DisplayItem::Restore, DisplayItem::Save];
        let data = provider.add_data(MemoryDocument::new("abc").page(MemoryPage::new(items).chunk_size(2)));

        let document = provider.open(&DocumentSource::Data(data), None, &ignore).unwrap();
        let chunks: Vec<_> = document.operator_list(0, "display").collect().await;
        let sizes: Vec<usize> = chunks.into_iter().map(|c| c.unwrap().len()).collect();
        assert_eq!(sizes, vec![2, 1]);
        assert_eq!(provider.stats().operator_list_requests(), 1);
    }
}
