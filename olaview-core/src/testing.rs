//! In-memory collaborators for unit tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::backend::{
    DocumentEngine, DocumentHandle, DrawingBackend, PageHandle, PageSize, RenderImage,
    RenderTask, SourceId, Viewport, VisibilitySnapshot,
};
use crate::error::{LoadError, PageFetchError, RenderError, SessionResult};
use crate::layers::{DeclaredLayer, DeclaredSection, LayerMetadata, OrderEntry};
use crate::render::{RenderFuture, RenderOutcome};

/// Lets spawned tasks run until they block.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

pub async fn spawn_all(renders: Vec<RenderFuture>) -> Vec<SessionResult<RenderOutcome>> {
    let handles: Vec<_> = renders.into_iter().map(tokio::spawn).collect();
    let mut outcomes = Vec::with_capacity(handles.len());
    for handle in handles {
        outcomes.push(handle.await.expect("render task panicked"));
    }
    outcomes
}

pub struct FakeDocument {
    pages: usize,
    metadata: Mutex<LayerMetadata>,
    failing_fetch: Mutex<HashSet<usize>>,
    fetches: AtomicUsize,
}

impl FakeDocument {
    pub fn new(pages: usize) -> Arc<Self> {
        Arc::new(Self {
            pages,
            metadata: Mutex::new(LayerMetadata::default()),
            failing_fetch: Mutex::new(HashSet::new()),
            fetches: AtomicUsize::new(0),
        })
    }

    pub fn failing_fetch(self: Arc<Self>, page: usize) -> Arc<Self> {
        self.failing_fetch.lock().insert(page);
        self
    }

    /// Declares `layers` as visible members of a single "Layers" section.
    pub fn with_layers(self: Arc<Self>, layers: &[(&str, &str)]) -> Arc<Self> {
        let mut declared = BTreeMap::new();
        for (id, name) in layers {
            declared.insert(
                id.to_string(),
                DeclaredLayer {
                    name: Some(name.to_string()),
                    visible: None,
                },
            );
        }
        *self.metadata.lock() = LayerMetadata {
            order: vec![OrderEntry::Section(DeclaredSection {
                title: Some("Layers".into()),
                members: layers.iter().map(|(id, _)| id.to_string()).collect(),
            })],
            layers: declared,
        };
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentHandle for FakeDocument {
    fn page_count(&self) -> usize {
        self.pages
    }

    async fn get_page(&self, page: usize) -> Result<Arc<dyn PageHandle>, PageFetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.failing_fetch.lock().contains(&page) || page == 0 || page > self.pages {
            return Err(PageFetchError {
                page,
                reason: "page object missing".into(),
            });
        }
        Ok(Arc::new(FakePage::new(page)))
    }

    fn layer_metadata(&self) -> LayerMetadata {
        self.metadata.lock().clone()
    }
}

pub struct FakePage {
    page: usize,
}

impl FakePage {
    pub fn new(page: usize) -> Self {
        Self { page }
    }
}

impl PageHandle for FakePage {
    fn page(&self) -> usize {
        self.page
    }

    fn size(&self) -> PageSize {
        PageSize {
            width: 612.0,
            height: 792.0,
        }
    }

    fn rasterize(
        &self,
        viewport: &Viewport,
        _visibility: &VisibilitySnapshot,
    ) -> Result<RenderImage, RenderError> {
        let (width, height) = viewport.pixel_size();
        Ok(RenderImage {
            width,
            height,
            pixels: vec![self.page as u8; (width * height * 4) as usize],
        })
    }
}

#[derive(Default)]
pub struct FakeEngine {
    documents: Mutex<HashMap<SourceId, Arc<FakeDocument>>>,
    opens: AtomicUsize,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_document(self: Arc<Self>, source: &str, document: Arc<FakeDocument>) -> Arc<Self> {
        self.documents.lock().insert(SourceId::from(source), document);
        self
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentEngine for FakeEngine {
    async fn open_document(&self, source: &SourceId) -> Result<Arc<dyn DocumentHandle>, LoadError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let document = self.documents.lock().get(source).cloned();
        match document {
            Some(document) => Ok(document),
            None => Err(LoadError::Unreachable {
                source_id: source.to_string(),
                reason: "not found".into(),
            }),
        }
    }
}

pub struct FakeTask {
    pub page: usize,
    pub snapshot: VisibilitySnapshot,
    gated: bool,
    ignore_cancel: bool,
    fail: bool,
    gate: Notify,
    cancel: CancellationToken,
    disposed: AtomicBool,
}

impl FakeTask {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RenderTask for FakeTask {
    async fn execute(&self) -> Result<(), RenderError> {
        if self.gated {
            if self.ignore_cancel {
                self.gate.notified().await;
            } else {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(RenderError::Cancelled),
                    _ = self.gate.notified() => {}
                }
            }
        } else if !self.ignore_cancel && self.cancel.is_cancelled() {
            return Err(RenderError::Cancelled);
        }

        if self.fail {
            return Err(RenderError::Failed {
                page: self.page,
                reason: "backend exploded".into(),
            });
        }
        Ok(())
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }
}

pub struct FakeBackend {
    gated: bool,
    ignore_cancel: AtomicBool,
    failing: Mutex<HashSet<usize>>,
    tasks: Mutex<Vec<Arc<FakeTask>>>,
    clears: AtomicUsize,
}

impl FakeBackend {
    fn with_gate(gated: bool) -> Arc<Self> {
        Arc::new(Self {
            gated,
            ignore_cancel: AtomicBool::new(false),
            failing: Mutex::new(HashSet::new()),
            tasks: Mutex::new(Vec::new()),
            clears: AtomicUsize::new(0),
        })
    }

    /// Tasks complete as soon as they are executed.
    pub fn immediate() -> Arc<Self> {
        Self::with_gate(false)
    }

    /// Tasks wait for `release(page)`.
    pub fn gated() -> Arc<Self> {
        Self::with_gate(true)
    }

    pub fn ignoring_cancel(self: Arc<Self>) -> Arc<Self> {
        self.ignore_cancel.store(true, Ordering::SeqCst);
        self
    }

    pub fn failing_render(self: Arc<Self>, page: usize) -> Arc<Self> {
        self.failing.lock().insert(page);
        self
    }

    pub fn release(&self, page: usize) {
        for task in self.tasks.lock().iter().filter(|task| task.page == page) {
            task.gate.notify_one();
        }
    }

    pub fn tasks(&self) -> Vec<Arc<FakeTask>> {
        self.tasks.lock().clone()
    }

    pub fn rendered_pages(&self) -> Vec<usize> {
        self.tasks.lock().iter().map(|task| task.page).collect()
    }

    pub fn snapshots(&self) -> Vec<VisibilitySnapshot> {
        self.tasks
            .lock()
            .iter()
            .map(|task| task.snapshot.clone())
            .collect()
    }

    pub fn clear_count(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }
}

impl DrawingBackend for FakeBackend {
    fn clear_surface(&self) {
        self.clears.fetch_add(1, Ordering::SeqCst);
    }

    fn create_render_task(
        &self,
        page: Arc<dyn PageHandle>,
        _viewport: Viewport,
        visibility: VisibilitySnapshot,
    ) -> Arc<dyn RenderTask> {
        let task = Arc::new(FakeTask {
            page: page.page(),
            snapshot: visibility,
            gated: self.gated,
            ignore_cancel: self.ignore_cancel.load(Ordering::SeqCst),
            fail: self.failing.lock().contains(&page.page()),
            gate: Notify::new(),
            cancel: CancellationToken::new(),
            disposed: AtomicBool::new(false),
        });
        self.tasks.lock().push(Arc::clone(&task));
        task
    }
}
