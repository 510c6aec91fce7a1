//! Resolve-once cache for objects produced by the backend (fonts, decoded images, ...).
//!
//! Render tasks ask for objects before the backend has sent them: [`ObjectCache::get_with`] parks a
//! continuation on a placeholder entry that fires when [`ObjectCache::resolve`] is called. Resolution is
//! first-wins and entries are never updated, only dropped in bulk by [`ObjectCache::clear`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::errors::{MessageError, ObjectCacheError};
use crate::message_handler::{Payload, SharedBuffer};
use crate::sync::lock;

/// Identifier of a backend object. Ids starting with `g_` live in the document wide cache, all others in
/// the cache of the page that uses them.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub String);

impl ObjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn is_common(&self) -> bool {
        self.0.starts_with("g_")
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug)]
pub struct FontObject {
    pub name: String,
    pub data: SharedBuffer,
}

/// Decoded image owned by the cache. The pixel memory is released explicitly on clear, even when a
/// render task still holds a reference.
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pixels: Mutex<Option<SharedBuffer>>,
}

impl DecodedImage {
    pub fn new(width: u32, height: u32, pixels: SharedBuffer) -> Self {
        Self {
            width,
            height,
            stride: width * 4,
            pixels: Mutex::new(Some(pixels)),
        }
    }

    pub fn pixels(&self) -> Option<SharedBuffer> {
        lock(&self.pixels).clone()
    }

    pub fn release(&self) {
        lock(&self.pixels).take();
    }

    pub fn is_released(&self) -> bool {
        lock(&self.pixels).is_none()
    }
}

impl fmt::Debug for DecodedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("released", &self.is_released())
            .finish()
    }
}

#[derive(Clone, Debug)]
pub enum ObjectData {
    Font(Arc<FontObject>),
    Image(Arc<DecodedImage>),
    Other(Arc<Value>),
}

/// Shape of a `CommonObj`/`Obj` message. Font and image bytes travel in the payload's first buffer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct ObjectHeader {
    pub id: ObjectId,
    pub page_number: Option<usize>,
    #[serde(flatten)]
    pub kind: ObjectKind,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub(crate) enum ObjectKind {
    Font { name: String },
    Image { width: u32, height: u32 },
    Other { value: Value },
}

impl ObjectHeader {
    pub(crate) fn into_data(self, payload: &Payload) -> Result<(ObjectId, ObjectData), MessageError> {
        let buffer = || {
            payload
                .buffer(0)
                .cloned()
                .ok_or_else(|| MessageError::Payload(format!("object {} has no data buffer", self.id)))
        };
        let data = match &self.kind {
            ObjectKind::Font { name } => ObjectData::Font(Arc::new(FontObject {
                name: name.clone(),
                data: buffer()?,
            })),
            ObjectKind::Image { width, height } => ObjectData::Image(Arc::new(DecodedImage::new(*width, *height, buffer()?))),
            ObjectKind::Other { value } => ObjectData::Other(Arc::new(value.clone())),
        };
        Ok((self.id, data))
    }
}

type Continuation = Box<dyn FnOnce(ObjectData) + Send>;

#[derive(Default)]
struct CachedObject {
    data: Option<ObjectData>,
    continuations: Vec<Continuation>,
}

#[derive(Clone, Default)]
pub struct ObjectCache {
    objects: Arc<Mutex<HashMap<ObjectId, CachedObject>>>,
}

impl ObjectCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `continuation` with the object once it is resolved; right away when it already is.
    pub fn get_with<F>(&self, id: &ObjectId, continuation: F)
    where
        F: FnOnce(ObjectData) + Send + 'static,
    {
        let mut objects = lock(&self.objects);
        let entry = objects.entry(id.clone()).or_default();
        match entry.data.clone() {
            Some(data) => {
                drop(objects);
                continuation(data);
            }
            None => entry.continuations.push(Box::new(continuation)),
        }
    }

    /// The resolved object. Check [`ObjectCache::has`] first.
    pub fn get(&self, id: &ObjectId) -> Result<ObjectData, ObjectCacheError> {
        lock(&self.objects)
            .get(id)
            .and_then(|entry| entry.data.clone())
            .ok_or_else(|| ObjectCacheError::NotResolved(id.clone()))
    }

    /// Waits for the object. Fails when the cache is cleared first.
    pub async fn wait(&self, id: &ObjectId) -> Result<ObjectData, ObjectCacheError> {
        let (tx, rx) = oneshot::channel();
        self.get_with(id, move |data| {
            let _ = tx.send(data);
        });
        rx.await.map_err(|_| ObjectCacheError::Cleared(id.clone()))
    }

    pub fn has(&self, id: &ObjectId) -> bool {
        lock(&self.objects).get(id).is_some_and(|entry| entry.data.is_some())
    }

    /// Stores `data` unless the id is already resolved. Returns whether this call resolved it.
    pub fn resolve(&self, id: ObjectId, data: ObjectData) -> bool {
        let continuations = {
            let mut objects = lock(&self.objects);
            let entry = objects.entry(id.clone()).or_default();
            if entry.data.is_some() {
                log::debug!("ObjectCache: {} is already resolved", id);
                return false;
            }
            entry.data = Some(data.clone());
            std::mem::take(&mut entry.continuations)
        };
        for continuation in continuations {
            continuation(data.clone());
        }
        true
    }

    /// Drops every entry. Decoded images are released, pending continuations never run.
    pub fn clear(&self) {
        let objects = std::mem::take(&mut *lock(&self.objects));
        for (_, object) in objects {
            if let Some(ObjectData::Image(image)) = &object.data {
                image.release();
            }
        }
    }

    /// Number of entries, resolved or pending.
    pub fn len(&self) -> usize {
        lock(&self.objects).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ObjectCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectCache").field("len", &self.len()).finish()
    }
}
