//! Client side core of a document rendering engine.
//!
//! The engine talks to a document backend through a [`message_handler::MessageHandler`], running the
//! backend on a worker thread when possible and on an in-process loopback channel otherwise. Documents are
//! opened with [`document::DocumentLoader`]; pages render incrementally through [`render::RenderTask`]s
//! that pull their instruction lists from the backend as a stream.

pub mod backend;
pub mod channel;
pub mod config;
pub mod document;
pub mod errors;
pub mod logging;
pub mod message_handler;
pub mod render;
mod sync;
pub mod worker;

pub use config::EngineConfig;
pub use document::{open_document, DocumentHandle, DocumentLoader, DocumentSource, LoadingTask, PageHandle};
pub use render::{RenderParams, RenderTask, Surface, SurfaceSize};
pub use worker::Worker;
