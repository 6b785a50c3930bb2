//! Drawing backend that rasterizes pages off the async thread and paints the
//! result onto a `Surface`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::backend::{
    DrawingBackend, PageHandle, RenderImage, RenderTask, Viewport, VisibilitySnapshot,
};
use crate::error::RenderError;

/// Where finished pages end up: a terminal, a window, a test recorder.
pub trait Surface: Send {
    fn clear(&mut self) -> Result<()>;
    fn present(&mut self, page: usize, image: &RenderImage) -> Result<()>;
}

pub type SharedSurface = Arc<Mutex<dyn Surface>>;

pub struct RasterBackend {
    surface: SharedSurface,
}

impl RasterBackend {
    pub fn new(surface: SharedSurface) -> Self {
        Self { surface }
    }
}

impl DrawingBackend for RasterBackend {
    fn clear_surface(&self) {
        if let Err(err) = self.surface.lock().clear() {
            warn!(?err, "failed to clear surface");
        }
    }

    fn create_render_task(
        &self,
        page: Arc<dyn PageHandle>,
        viewport: Viewport,
        visibility: VisibilitySnapshot,
    ) -> Arc<dyn RenderTask> {
        Arc::new(RasterTask {
            page,
            viewport,
            visibility,
            surface: Arc::clone(&self.surface),
            cancel: CancellationToken::new(),
            disposed: AtomicBool::new(false),
        })
    }
}

struct RasterTask {
    page: Arc<dyn PageHandle>,
    viewport: Viewport,
    visibility: VisibilitySnapshot,
    surface: SharedSurface,
    cancel: CancellationToken,
    disposed: AtomicBool,
}

impl RasterTask {
    fn abandoned(&self) -> bool {
        self.cancel.is_cancelled() || self.disposed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl RenderTask for RasterTask {
    #[instrument(skip(self), fields(page = self.page.page()))]
    async fn execute(&self) -> Result<(), RenderError> {
        if self.abandoned() {
            return Err(RenderError::Cancelled);
        }
        let number = self.page.page();

        let page = Arc::clone(&self.page);
        let viewport = self.viewport;
        let visibility = self.visibility.clone();
        let job = tokio::task::spawn_blocking(move || page.rasterize(&viewport, &visibility));

        let image = tokio::select! {
            _ = self.cancel.cancelled() => {
                debug!("rasterization abandoned");
                return Err(RenderError::Cancelled);
            }
            joined = job => joined.map_err(|err| RenderError::Failed {
                page: number,
                reason: err.to_string(),
            })??,
        };

        // Checked under the surface lock so a superseded task never paints
        // over a surface the newer render already cleared.
        let mut surface = self.surface.lock();
        if self.abandoned() {
            return Err(RenderError::Cancelled);
        }
        surface
            .present(number, &image)
            .map_err(|err| RenderError::Failed {
                page: number,
                reason: format!("{err:#}"),
            })?;
        debug!(width = image.width, height = image.height, "page presented");
        Ok(())
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        self.cancel.cancel();
    }
}
