use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::backend::{DocumentEngine, DocumentHandle, DrawingBackend, SourceId};
use crate::config::{NavigationConfig, ViewerConfig};
use crate::error::SessionResult;
use crate::layers::{LayerGroup, LayerModelBuilder, LayerVisibility};
use crate::navigation::NavigationController;
use crate::render::{RenderOutcome, RenderSession};
use crate::{EventLog, SessionEvent};

#[derive(Debug)]
pub struct LoadReport {
    pub page_count: usize,
    /// Outcome of rendering page 1; `None` for a document without pages.
    pub first_render: Option<SessionResult<RenderOutcome>>,
}

#[derive(Debug)]
pub enum LoadOutcome {
    /// The source is already loaded; nothing was fetched or rendered.
    Unchanged,
    Loaded(LoadReport),
}

struct LoadedDocument {
    source: SourceId,
    handle: Arc<dyn DocumentHandle>,
    groups: Vec<LayerGroup>,
}

/// Lifecycle of the currently loaded document.
pub struct DocumentSession {
    engine: Arc<dyn DocumentEngine>,
    builder: LayerModelBuilder,
    navigation: NavigationConfig,
    render: RenderSession,
    loaded: Option<LoadedDocument>,
    events: EventLog,
}

impl DocumentSession {
    pub fn new(
        engine: Arc<dyn DocumentEngine>,
        backend: Arc<dyn DrawingBackend>,
        config: &ViewerConfig,
    ) -> Self {
        let events = EventLog::default();
        Self {
            engine,
            builder: LayerModelBuilder::new(config.layers.clone()),
            navigation: config.navigation,
            render: RenderSession::new(backend, config.render, Arc::clone(&events)),
            loaded: None,
            events,
        }
    }

    #[instrument(skip(self), fields(source = %source))]
    pub async fn load(&mut self, source: SourceId) -> SessionResult<LoadOutcome> {
        if self
            .loaded
            .as_ref()
            .is_some_and(|loaded| loaded.source == source)
        {
            debug!("source already loaded");
            return Ok(LoadOutcome::Unchanged);
        }

        self.teardown();

        let handle = match self.engine.open_document(&source).await {
            Ok(handle) => handle,
            Err(err) => {
                warn!(error = %err, "failed to load document");
                self.events.lock().push(SessionEvent::LoadFailed {
                    source,
                    message: err.to_string(),
                });
                return Err(err.into());
            }
        };

        let page_count = handle.page_count();
        let model = self.builder.build(&handle.layer_metadata());
        info!(
            page_count,
            groups = model.groups.len(),
            layers = model.visibility.len(),
            "document loaded"
        );

        self.render.attach(Arc::clone(&handle), model.visibility);
        self.loaded = Some(LoadedDocument {
            source: source.clone(),
            handle,
            groups: model.groups,
        });
        self.events
            .lock()
            .push(SessionEvent::DocumentLoaded { source, page_count });

        let first_render = if page_count > 0 {
            Some(self.render.render_page(1).await)
        } else {
            None
        };

        Ok(LoadOutcome::Loaded(LoadReport {
            page_count,
            first_render,
        }))
    }

    /// Tears the current document down; a later `load` of the same source reopens it.
    pub fn close(&mut self) {
        if let Some(source) = self.teardown() {
            self.events
                .lock()
                .push(SessionEvent::DocumentClosed { source });
        }
    }

    fn teardown(&mut self) -> Option<SourceId> {
        let loaded = self.loaded.take();
        self.render.detach();
        loaded.map(|loaded| loaded.source)
    }

    pub fn source(&self) -> Option<&SourceId> {
        self.loaded.as_ref().map(|loaded| &loaded.source)
    }

    pub fn document(&self) -> Option<Arc<dyn DocumentHandle>> {
        self.loaded.as_ref().map(|loaded| Arc::clone(&loaded.handle))
    }

    pub fn page_count(&self) -> usize {
        self.render.total_pages()
    }

    pub fn layer_groups(&self) -> &[LayerGroup] {
        self.loaded
            .as_ref()
            .map(|loaded| loaded.groups.as_slice())
            .unwrap_or_default()
    }

    pub fn layer_visibility(&self) -> LayerVisibility {
        self.render.layer_visibility()
    }

    pub fn render_session(&self) -> RenderSession {
        self.render.clone()
    }

    pub fn navigator(&self) -> NavigationController {
        NavigationController::new(self.render.clone(), self.navigation)
    }

    pub fn events(&self) -> EventLog {
        Arc::clone(&self.events)
    }

    pub fn take_events(&self) -> Vec<SessionEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl Drop for DocumentSession {
    fn drop(&mut self) {
        self.render.detach();
    }
}
