//! Backend side of the protocol.
//!
//! [`setup`] registers the worker level actions on the handler that talks to the client. Every
//! `GetDocRequest` creates a document level handler named `<docId>_worker` on the same channel; that
//! handler serves the document until `Terminate`.
//!
//! Documents themselves come from a [`DocumentProvider`]. [`MemoryDocumentProvider`] serves documents
//! built in memory.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};

use anyhow::anyhow;
use futures::StreamExt;
use serde_json::Value;

use crate::config::Verbosity;
use crate::document::{
    Configure, DocRequest, DocRequestReply, DocumentSource, IntentRequest, ObjectHeader, ObjectKind, PageRequest,
    PasswordReply, PasswordRequest, ProbeReply, Progress, TextContent, UnsupportedFeature,
};
use crate::errors::{wrap_reason, MessageError, ProtocolError, RemoteError};
use crate::message_handler::{Action, MessageHandler, Payload, SharedBuffer, StreamSink};
use crate::render::OperatorListChunk;
use crate::sync::lock;

mod memory;
mod provider;

pub use memory::{MemoryDocument, MemoryDocumentProvider, MemoryPage, ProviderStats};
pub use provider::{BackendDocument, BackendObject, DocumentProvider, PageObject};

struct WorkerState {
    provider: Arc<dyn DocumentProvider>,
    /// Document handlers by document id
    documents: Mutex<HashMap<String, Arc<MessageHandler>>>,
    verbosity: Mutex<Verbosity>,
}

impl WorkerState {
    fn verbosity(&self) -> Verbosity {
        *lock(&self.verbosity)
    }
}

/// Registers the worker level actions on `handler`.
pub fn setup(handler: &Arc<MessageHandler>, provider: Arc<dyn DocumentProvider>) -> Result<(), ProtocolError> {
    let state = Arc::new(WorkerState {
        provider,
        documents: Mutex::new(HashMap::new()),
        verbosity: Mutex::new(Verbosity::default()),
    });

    let weak = Arc::downgrade(handler);
    handler.on_notify(Action::Test, move |data| {
        let Some(handler) = weak.upgrade() else {
            return;
        };
        // Without a buffer the client cannot talk to us properly.
        let reply = match data.buffer(0) {
            Some(probe) => Payload::encode(&ProbeReply {
                support_transfers: probe.as_slice().first() == Some(&255),
            }),
            None => Ok(Payload::new(Value::Null)),
        };
        if let Err(err) = reply.and_then(|reply| handler.send(Action::Test, reply)) {
            log::warn!("Worker[{}]: cannot answer probe: {}", handler.source_name(), err);
        }
    })?;

    let configured = state.clone();
    handler.on_notify(Action::Configure, move |data| match data.decode::<Configure>() {
        Ok(config) => {
            log::debug!("Worker: verbosity set to {:?}", config.verbosity);
            *lock(&configured.verbosity) = config.verbosity;
        }
        Err(err) => log::warn!("Worker: invalid configuration: {}", err),
    })?;

    handler.on_call(Action::Echo, |data| async move { Ok(data) })?;

    let weak = Arc::downgrade(handler);
    let docs = state.clone();
    handler.on_call(Action::GetDocRequest, move |data| {
        let handler = weak.upgrade();
        let state = docs.clone();
        async move {
            let handler = handler.ok_or(MessageError::Destroyed)?;
            let request: DocRequest = data.decode()?;
            let source = DocumentSource::from_wire(&request.source, data.buffer(0))?;
            let worker_id = format!("{}_worker", request.doc_id);

            let doc_handler = MessageHandler::new(worker_id.clone(), request.doc_id.clone(), handler.channel());
            let doc = Arc::new(DocState {
                doc_id: request.doc_id.clone(),
                source,
                password: request.password,
                worker: Arc::downgrade(&state),
                handler: Arc::downgrade(&doc_handler),
                document: Mutex::new(None),
            });
            setup_document(&doc_handler, doc)?;
            if state.verbosity() >= Verbosity::Infos {
                log::info!("Worker: serving document {} as {}", request.doc_id, worker_id);
            }
            lock(&state.documents).insert(request.doc_id, doc_handler);

            Ok(Payload::encode(&DocRequestReply { worker_id })?)
        }
    })?;

    Ok(())
}

struct DocState {
    doc_id: String,
    source: DocumentSource,
    password: Option<String>,
    worker: Weak<WorkerState>,
    handler: Weak<MessageHandler>,
    document: Mutex<Option<Arc<dyn BackendDocument>>>,
}

impl DocState {
    fn handler(&self) -> Result<Arc<MessageHandler>, MessageError> {
        self.handler.upgrade().ok_or(MessageError::Destroyed)
    }

    fn document(&self) -> anyhow::Result<Arc<dyn BackendDocument>> {
        lock(&self.document)
            .clone()
            .ok_or_else(|| anyhow!("document {} is not open", self.doc_id))
    }

    async fn open(&self) -> anyhow::Result<Arc<dyn BackendDocument>> {
        let worker = self.worker.upgrade().ok_or(MessageError::Destroyed)?;
        let handler = self.handler()?;
        let report = |progress: Progress| {
            if let Ok(payload) = Payload::encode(&progress) {
                let _ = handler.send(Action::DocProgress, payload);
            }
        };

        let mut password = self.password.clone();
        loop {
            match worker.provider.open(&self.source, password.as_deref(), &report) {
                Ok(document) => return Ok(document),
                Err(RemoteError::Password { message, code }) => {
                    log::debug!("Document[{}]: {}", self.doc_id, message);
                    // Rejected by the client when it has no password to offer.
                    let reply = handler
                        .send_with_promise(Action::PasswordRequest, Payload::encode(&PasswordRequest { code })?)
                        .await?;
                    match reply.decode::<PasswordReply>()?.password {
                        Some(next) => password = Some(next),
                        None => return Err(RemoteError::Password { message, code }.into()),
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn terminate(&self) {
        lock(&self.document).take();
        if let Some(worker) = self.worker.upgrade() {
            lock(&worker.documents).remove(&self.doc_id);
        }
    }
}

fn setup_document(handler: &Arc<MessageHandler>, doc: Arc<DocState>) -> Result<(), ProtocolError> {
    let state = doc.clone();
    handler.on_call(Action::GetDoc, move |_| {
        let state = state.clone();
        async move {
            let document = state.open().await?;
            *lock(&state.document) = Some(document.clone());

            let handler = state.handler()?;
            for feature in document.unsupported_features() {
                handler.send(Action::UnsupportedFeature, Payload::encode(&UnsupportedFeature { feature })?)?;
            }
            Ok(Payload::encode(&document.info())?)
        }
    })?;

    let state = doc.clone();
    handler.on_call(Action::GetPage, move |data| {
        let state = state.clone();
        async move {
            let request: PageRequest = data.decode()?;
            let page = state.document()?.page(request.page_index)?;
            Ok(Payload::encode(&page)?)
        }
    })?;

    let state = doc.clone();
    handler.on_call(Action::GetAnnotations, move |data| {
        let state = state.clone();
        async move {
            let request: IntentRequest = data.decode()?;
            let annotations = state.document()?.annotations(request.page_index, &request.intent)?;
            Ok(Payload::encode(&annotations)?)
        }
    })?;

    let state = doc.clone();
    handler.on_call(Action::GetData, move |_| {
        let state = state.clone();
        async move { Ok(Payload::empty().with_buffer(state.document()?.data()?)) }
    })?;

    let state = doc.clone();
    handler.on_call(Action::Cleanup, move |_| {
        let state = state.clone();
        async move {
            let document = lock(&state.document).clone();
            if let Some(document) = document {
                document.cleanup()?;
            }
            Ok(Payload::empty())
        }
    })?;

    let state = doc.clone();
    handler.on_call(Action::Terminate, move |_| {
        let state = state.clone();
        async move {
            log::debug!("Document[{}]: terminated", state.doc_id);
            state.terminate();
            Ok(Payload::empty())
        }
    })?;

    let state = doc.clone();
    handler.on_stream(Action::GetOperatorList, move |data, sink| {
        let state = state.clone();
        async move {
            let request: IntentRequest = data.decode()?;
            let document = state.document()?;
            let handler = state.handler()?;
            tokio::spawn(async move {
                if let Err(err) = stream_operator_list(&handler, document, request, &sink).await {
                    sink.error(wrap_reason(err));
                }
            });
            Ok(())
        }
    })?;

    let state = doc;
    handler.on_stream(Action::GetTextContent, move |data, sink| {
        let state = state.clone();
        async move {
            let request: PageRequest = data.decode()?;
            let document = state.document()?;
            tokio::spawn(async move {
                if let Err(err) = stream_text_content(document, request, &sink).await {
                    sink.error(wrap_reason(err));
                }
            });
            Ok(())
        }
    })?;

    Ok(())
}

/// Sends the objects of a page, then its operator list. Every chunk waits for credit from the client.
async fn stream_operator_list(
    handler: &MessageHandler,
    document: Arc<dyn BackendDocument>,
    request: IntentRequest,
    sink: &StreamSink,
) -> anyhow::Result<()> {
    let page_number = request.page_index + 1;
    for object in document.page_objects(request.page_index)? {
        let action = if object.id.is_common() { Action::CommonObj } else { Action::Obj };
        let (payload, transfers) = object_message(object, page_number)?;
        handler.send_with_transfers(action, payload, &transfers)?;
    }

    let mut chunks = document.operator_list(request.page_index, &request.intent).peekable();
    let mut sent = false;
    while let Some(items) = chunks.next().await {
        let items = items?;
        let last_chunk = Pin::new(&mut chunks).peek().await.is_none();
        if !wait_for_credit(sink).await {
            return Ok(());
        }
        sink.enqueue(Payload::encode(&OperatorListChunk { items, last_chunk })?, 1, &[]);
        sent = true;
    }
    if !sent {
        if !wait_for_credit(sink).await {
            return Ok(());
        }
        sink.enqueue(Payload::encode(&OperatorListChunk { items: Vec::new(), last_chunk: true })?, 1, &[]);
    }
    sink.close();
    Ok(())
}

async fn stream_text_content(
    document: Arc<dyn BackendDocument>,
    request: PageRequest,
    sink: &StreamSink,
) -> anyhow::Result<()> {
    let mut chunks = document.text_content(request.page_index);
    while let Some(chunk) = chunks.next().await {
        let chunk: TextContent = chunk?;
        if !wait_for_credit(sink).await {
            return Ok(());
        }
        let size = chunk.items.len() as i64;
        sink.enqueue(Payload::encode(&chunk)?, size, &[]);
    }
    sink.close();
    Ok(())
}

/// False once the client has cancelled the stream.
async fn wait_for_credit(sink: &StreamSink) -> bool {
    match sink.ready().await {
        Ok(()) => true,
        Err(reason) => {
            log::debug!("Worker: stream {} cancelled: {}", sink.stream_id(), reason);
            false
        }
    }
}

/// Encodes an object for the `CommonObj`/`Obj` message. Image pixels are transferred, everything else is
/// copied.
fn object_message(object: PageObject, page_number: usize) -> Result<(Payload, Vec<SharedBuffer>), MessageError> {
    let page_number = if object.id.is_common() { None } else { Some(page_number) };
    let (kind, buffer, transfer) = match object.data {
        BackendObject::Font { name, bytes } => (ObjectKind::Font { name }, Some(SharedBuffer::from(bytes)), false),
        BackendObject::Image { width, height, pixels } => {
            (ObjectKind::Image { width, height }, Some(SharedBuffer::from(pixels)), true)
        }
        BackendObject::Other(value) => (ObjectKind::Other { value }, None, false),
    };

    let mut payload = Payload::encode(&ObjectHeader { id: object.id, page_number, kind })?;
    let mut transfers = Vec::new();
    if let Some(buffer) = buffer {
        if transfer {
            transfers.push(buffer.clone());
        }
        payload = payload.with_buffer(buffer);
    }
    Ok((payload, transfers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::LoopbackChannel;
    use crate::document::DocumentInfo;
    use std::future::Future;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn within<F: Future>(f: F) -> F::Output {
        tokio::time::timeout(Duration::from_secs(5), f).await.expect("timed out")
    }

    fn connect(provider: MemoryDocumentProvider) -> (Arc<MessageHandler>, Arc<MessageHandler>) {
        let (main_end, worker_end) = LoopbackChannel::pair();
        let worker = MessageHandler::new("worker", "main", worker_end);
        setup(&worker, Arc::new(provider)).unwrap();
        (MessageHandler::new("main", "worker", main_end), worker)
    }

    #[tokio::test]
    async fn probe_reports_transfer_support() {
        let (main, _worker) = connect(MemoryDocumentProvider::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        main.on_notify(Action::Test, move |data| {
            let _ = tx.send(data.data);
        })
        .unwrap();

        main.send(Action::Test, Payload::empty().with_buffer(SharedBuffer::from(vec![255]))).unwrap();
        assert_eq!(within(rx.recv()).await.unwrap(), serde_json::json!({ "support_transfers": true }));

        main.send(Action::Test, Payload::empty()).unwrap();
        assert_eq!(within(rx.recv()).await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn serves_document_requests() {
        let provider = MemoryDocumentProvider::new();
        provider.add_url("a.pdf", MemoryDocument::new("abc").page(MemoryPage::default()));
        let (main, worker) = connect(provider);
        let channel = main.channel();

        let request = DocRequest {
            doc_id: "d7".into(),
            source: DocumentSource::Url("a.pdf".into()).to_wire().0,
            password: None,
        };
        let reply = within(main.send_with_promise(Action::GetDocRequest, Payload::encode(&request).unwrap()))
            .await
            .unwrap();
        let reply: DocRequestReply = reply.decode().unwrap();
        assert_eq!(reply.worker_id, "d7_worker");

        let doc = MessageHandler::new("d7", "d7_worker", channel);
        doc.on_notify(Action::DocProgress, |_| {}).unwrap();
        let info = within(doc.send_with_promise(Action::GetDoc, Payload::empty())).await.unwrap();
        let info: DocumentInfo = info.decode().unwrap();
        assert_eq!(info, DocumentInfo { num_pages: 1, fingerprint: "abc".into() });

        within(doc.send_with_promise(Action::Terminate, Payload::empty())).await.unwrap();
        let _ = worker;
    }

    #[test]
    fn images_are_transferred() {
        let object = PageObject {
            id: crate::document::ObjectId::new("img_p0_1"),
            data: BackendObject::Image { width: 1, height: 1, pixels: vec![0, 0, 0, 255] },
        };
        let (payload, transfers) = object_message(object, 1).unwrap();
        assert_eq!(transfers.len(), 1);
        assert!(SharedBuffer::ptr_eq(&transfers[0], payload.buffer(0).unwrap()));
        assert_eq!(payload.data["page_number"], 1);
        assert_eq!(payload.data["type"], "Image");
    }
}
