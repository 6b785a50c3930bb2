//! Page render session controller: one document, one page on screen, at most
//! one render in flight, and a set of toggleable optional-content layers.

use std::sync::Arc;

use parking_lot::Mutex;

pub mod backend;
pub mod config;
pub mod document;
pub mod error;
pub mod layers;
pub mod navigation;
pub mod raster;
pub mod render;

#[cfg(test)]
mod testing;

pub use backend::{
    DocumentEngine, DocumentHandle, DrawingBackend, PageHandle, PageSize, RenderImage,
    RenderTask, SourceId, Viewport, VisibilitySnapshot,
};
pub use config::{BlankTitlePolicy, LayerConfig, NavigationConfig, RenderConfig, ViewerConfig};
pub use document::{DocumentSession, LoadOutcome, LoadReport};
pub use error::{LoadError, PageFetchError, RenderError, SessionError, SessionResult};
pub use layers::{
    DeclaredLayer, DeclaredSection, LayerEntry, LayerGroup, LayerMetadata, LayerModel,
    LayerModelBuilder, LayerVisibility, OrderEntry,
};
pub use navigation::{parse_page_number, NavigationController};
pub use raster::{RasterBackend, SharedSurface, Surface};
pub use render::{RenderFuture, RenderOutcome, RenderSession, RenderTicket, ViewState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    DocumentLoaded { source: SourceId, page_count: usize },
    LoadFailed { source: SourceId, message: String },
    DocumentClosed { source: SourceId },
    PageRendered { page: usize },
    RenderFailed { page: usize, message: String },
}

pub type EventLog = Arc<Mutex<Vec<SessionEvent>>>;
