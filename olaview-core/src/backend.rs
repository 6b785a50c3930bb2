//! Collaborator contracts: the decoding engine that produces documents and
//! pages, and the drawing backend that paints them.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{LoadError, PageFetchError, RenderError};
use crate::layers::LayerMetadata;

/// Opaque token identifying loadable content (a path or URL).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for SourceId {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

impl From<&Path> for SourceId {
    fn from(path: &Path) -> Self {
        Self::new(path.to_string_lossy().into_owned())
    }
}

/// Page dimensions in document units at scale 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageSize {
    pub width: f32,
    pub height: f32,
}

/// Layout box of a page at a given scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub width: f32,
    pub height: f32,
    pub scale: f32,
}

impl Viewport {
    pub fn pixel_size(&self) -> (u32, u32) {
        (to_pixels(self.width), to_pixels(self.height))
    }
}

fn to_pixels(value: f32) -> u32 {
    let rounded = value.ceil();
    if !rounded.is_finite() || rounded < 1.0 {
        1
    } else if rounded > u32::MAX as f32 {
        u32::MAX
    } else {
        rounded as u32
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// Immutable copy of the layer visibility map handed to a single render.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VisibilitySnapshot(Arc<BTreeMap<String, bool>>);

impl VisibilitySnapshot {
    pub fn new(map: BTreeMap<String, bool>) -> Self {
        Self(Arc::new(map))
    }

    /// Layers the snapshot does not mention are visible.
    pub fn is_visible(&self, layer_id: &str) -> bool {
        self.0.get(layer_id).copied().unwrap_or(true)
    }

    pub fn get(&self, layer_id: &str) -> Option<bool> {
        self.0.get(layer_id).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
        self.0.iter().map(|(id, visible)| (id.as_str(), *visible))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[async_trait]
pub trait DocumentEngine: Send + Sync {
    async fn open_document(&self, source: &SourceId) -> Result<Arc<dyn DocumentHandle>, LoadError>;
}

#[async_trait]
pub trait DocumentHandle: Send + Sync {
    fn page_count(&self) -> usize;
    /// Fetches a page by its 1-based number.
    async fn get_page(&self, page: usize) -> Result<Arc<dyn PageHandle>, PageFetchError>;
    fn layer_metadata(&self) -> LayerMetadata;
}

pub trait PageHandle: Send + Sync {
    fn page(&self) -> usize;
    fn size(&self) -> PageSize;

    fn viewport(&self, scale: f32) -> Viewport {
        let size = self.size();
        Viewport {
            width: size.width * scale,
            height: size.height * scale,
            scale,
        }
    }

    /// Blocking rasterization of the page with the given layer visibility.
    fn rasterize(
        &self,
        viewport: &Viewport,
        visibility: &VisibilitySnapshot,
    ) -> Result<RenderImage, RenderError>;
}

pub trait DrawingBackend: Send + Sync {
    fn clear_surface(&self);
    fn create_render_task(
        &self,
        page: Arc<dyn PageHandle>,
        viewport: Viewport,
        visibility: VisibilitySnapshot,
    ) -> Arc<dyn RenderTask>;
}

#[async_trait]
pub trait RenderTask: Send + Sync {
    /// Paints the page. Resolves to `RenderError::Cancelled` once `cancel` was requested.
    async fn execute(&self) -> Result<(), RenderError>;
    fn cancel(&self);
    /// Releases drawing resources held by the task. The task is not reused afterwards.
    fn dispose(&self);
}
