use std::sync::Arc;
use std::time::Duration;

use folio_engine::backend::{BackendObject, MemoryDocument, MemoryDocumentProvider, MemoryPage};
use folio_engine::config::{EngineConfig, Verbosity};
use folio_engine::document::{DocumentLoader, DocumentSource, ObjectId};
use folio_engine::errors::LoadError;
use folio_engine::render::backends::null::NullBackend;
use folio_engine::render::backends::recording::RecordingBackend;
use folio_engine::render::{Color, DisplayItem, RenderParams, Surface, SurfaceSize};

#[tokio::main]
async fn main() -> Result<(), LoadError> {
    folio_engine::logging::init(Verbosity::Debug);

    // Documents come from a provider. The memory provider serves documents built in code, which is all
    // we need here.
    let provider = Arc::new(MemoryDocumentProvider::new());
    let logo = ObjectId::new("img_p0_1");
    provider.add_url(
        "hello.pdf",
        MemoryDocument::new("hello-world")
            .password("hunter2")
            .page(
                MemoryPage::new(vec![
                    DisplayItem::Clear { color: Color::from_u8(255, 255, 255, 255) },
                    DisplayItem::TextRun {
                        x: 72.0,
                        y: 72.0,
                        text: "Hello, world".into(),
                        size: 24.0,
                        color: Color::from_u8(0, 0, 0, 255),
                        font: None,
                    },
                    DisplayItem::Dependency { id: logo.clone() },
                    DisplayItem::PaintImage { id: logo, x: 72.0, y: 120.0, w: 2.0, h: 1.0 },
                ])
                .with_object(
                    "img_p0_1",
                    BackendObject::Image { width: 2, height: 1, pixels: vec![255, 0, 0, 255, 0, 0, 255, 255] },
                )
                .with_text("Hello, world")
                .chunk_size(1)
                .chunk_delay(Duration::from_millis(50)),
            )
            .page(MemoryPage::default().with_text("Second page")),
    );

    let config = EngineConfig::builder()
        .verbosity(Verbosity::Infos)
        .build()
        .expect("configuration is not valid");

    // The password callback is asked again as long as the password is wrong.
    let task = DocumentLoader::new(DocumentSource::Url("hello.pdf".into()))
        .provider(provider.clone())
        .config(config)
        .on_password(|reason| async move {
            println!("password requested: {reason:?}");
            Some("hunter2".to_string())
        })
        .on_progress(|progress| println!("loaded {} of {:?} bytes", progress.loaded, progress.total))
        .open();
    let doc = task.completion().await?;
    println!("opened {} ({} pages)", doc.fingerprint(), doc.num_pages());

    let page = doc.get_page(1).await.expect("page 1");
    let recording = RecordingBackend::new();
    let surface = Surface::new(SurfaceSize { width: 612, height: 792 }, recording.clone());

    // Rendering to the same surface twice at once is refused.
    let render = page.render(RenderParams::new(surface.clone())).expect("render");
    if let Err(err) = page.render(RenderParams::new(surface.clone())) {
        println!("second render refused: {err}");
    }
    render.completion().await.expect("render failed");
    println!("executed {} instructions", recording.items().len());

    // A render that is cancelled settles with a distinct error.
    let second = doc.get_page(2).await.expect("page 2");
    let scratch = Surface::new(SurfaceSize { width: 612, height: 792 }, NullBackend::new());
    let cancelled = second.render(RenderParams::new(scratch)).expect("render");
    cancelled.cancel();
    if let Err(err) = cancelled.completion().await {
        println!("{err}");
    }

    let text = second.get_text_content().await.expect("text content");
    for item in text.items {
        println!("text: {}", item.text);
    }

    doc.destroy().await;
    println!("Done. Exiting.");
    Ok(())
}
