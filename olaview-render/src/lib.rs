use std::convert::TryFrom;
use std::fs;
use std::mem;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use olaview_core::{
    DocumentEngine, DocumentHandle, LayerMetadata, LoadError, PageFetchError, PageHandle,
    PageSize, RenderError, RenderImage, SourceId, Viewport, VisibilitySnapshot,
};
use parking_lot::Mutex;
use pdfium_render::prelude::*;
use tracing::{debug, info, instrument, warn};

mod optional_content;

pub use optional_content::{
    apply_visibility, layer_id, matches_defaults, parse_layer_id, read_layer_metadata,
};

const LIBRARY_PATH_ENV: &str = "OLAVIEW_PDFIUM_LIBRARY_PATH";

/// Opens PDF files with Pdfium; optional content is read and rewritten with lopdf.
pub struct PdfEngine {
    pdfium: Arc<Pdfium>,
}

impl PdfEngine {
    pub fn new() -> Result<Self> {
        let pdfium = match bind_pdfium_from_env() {
            Some(pdfium) => pdfium,
            None => bind_pdfium_default()?,
        };
        Ok(Self {
            pdfium: Arc::new(pdfium),
        })
    }
}

#[async_trait]
impl DocumentEngine for PdfEngine {
    #[instrument(skip(self), fields(source = %source))]
    async fn open_document(&self, source: &SourceId) -> Result<Arc<dyn DocumentHandle>, LoadError> {
        let bytes = read_source(source)?;
        let document = PdfDocumentHandle::open(Arc::clone(&self.pdfium), source, bytes)?;
        Ok(Arc::new(document))
    }
}

/// Local path named by a source id; `file://` URLs are accepted.
pub fn source_path(source: &SourceId) -> PathBuf {
    let raw = source.as_str();
    PathBuf::from(raw.strip_prefix("file://").unwrap_or(raw))
}

fn read_source(source: &SourceId) -> Result<Vec<u8>, LoadError> {
    let path = source_path(source);
    fs::read(&path).map_err(|err| LoadError::Unreachable {
        source_id: source.to_string(),
        reason: format!("{}: {err}", path.display()),
    })
}

struct PdfDocumentHandle {
    shared: Arc<SharedDocument>,
}

struct Variant {
    snapshot: VisibilitySnapshot,
    document: PdfDocument<'static>,
}

/// Field order matters: both documents borrow `pdfium` and must drop first.
struct SharedDocument {
    bytes: Vec<u8>,
    metadata: LayerMetadata,
    page_count: usize,
    base: Mutex<PdfDocument<'static>>,
    variant: Mutex<Option<Variant>>,
    pdfium: Arc<Pdfium>,
}

impl PdfDocumentHandle {
    fn open(pdfium: Arc<Pdfium>, source: &SourceId, bytes: Vec<u8>) -> Result<Self, LoadError> {
        let undecodable = |reason: String| LoadError::Undecodable {
            source_id: source.to_string(),
            reason,
        };

        let metadata = match lopdf::Document::load_mem(&bytes)
            .map_err(anyhow::Error::from)
            .and_then(|document| read_layer_metadata(&document))
        {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "ignoring unreadable optional content");
                LayerMetadata::default()
            }
        };

        let base = load_static(&pdfium, bytes.clone()).map_err(|err| undecodable(format!("{err:#}")))?;
        let page_count = base.pages().len() as usize;
        info!(page_count, layers = metadata.layers.len(), "pdf opened");

        Ok(Self {
            shared: Arc::new(SharedDocument {
                bytes,
                metadata,
                page_count,
                base: Mutex::new(base),
                variant: Mutex::new(None),
                pdfium,
            }),
        })
    }
}

#[async_trait]
impl DocumentHandle for PdfDocumentHandle {
    fn page_count(&self) -> usize {
        self.shared.page_count
    }

    async fn get_page(&self, page: usize) -> Result<Arc<dyn PageHandle>, PageFetchError> {
        let size = self
            .shared
            .page_size(page)
            .map_err(|err| PageFetchError {
                page,
                reason: format!("{err:#}"),
            })?;
        Ok(Arc::new(PdfPageHandle {
            shared: Arc::clone(&self.shared),
            page,
            size,
        }))
    }

    fn layer_metadata(&self) -> LayerMetadata {
        self.shared.metadata.clone()
    }
}

impl SharedDocument {
    fn page_size(&self, page: usize) -> Result<PageSize> {
        let document = self.base.lock();
        with_page(&document, page, |pdf_page| {
            Ok(PageSize {
                width: pdf_page.width().value,
                height: pdf_page.height().value,
            })
        })
    }

    #[instrument(skip(self, viewport, visibility))]
    fn rasterize(
        &self,
        page: usize,
        viewport: &Viewport,
        visibility: &VisibilitySnapshot,
    ) -> Result<RenderImage> {
        if matches_defaults(&self.metadata, visibility) {
            let document = self.base.lock();
            return render_page(&document, page, viewport);
        }

        let mut slot = self.variant.lock();
        let current = match slot.take() {
            Some(current) if current.snapshot == *visibility => current,
            _ => {
                debug!(layers = visibility.len(), "building document for layer selection");
                Variant {
                    snapshot: visibility.clone(),
                    document: self.load_variant(visibility)?,
                }
            }
        };
        let image = render_page(&current.document, page, viewport);
        *slot = Some(current);
        image
    }

    fn load_variant(&self, visibility: &VisibilitySnapshot) -> Result<PdfDocument<'static>> {
        let mut document =
            lopdf::Document::load_mem(&self.bytes).context("failed to reparse document")?;
        apply_visibility(&mut document, &self.metadata, visibility)?;
        let mut rewritten = Vec::with_capacity(self.bytes.len());
        document
            .save_to(&mut rewritten)
            .context("failed to serialize layer selection")?;
        load_static(&self.pdfium, rewritten)
    }
}

struct PdfPageHandle {
    shared: Arc<SharedDocument>,
    page: usize,
    size: PageSize,
}

impl PageHandle for PdfPageHandle {
    fn page(&self) -> usize {
        self.page
    }

    fn size(&self) -> PageSize {
        self.size
    }

    fn rasterize(
        &self,
        viewport: &Viewport,
        visibility: &VisibilitySnapshot,
    ) -> Result<RenderImage, RenderError> {
        self.shared
            .rasterize(self.page, viewport, visibility)
            .map_err(|err| RenderError::Failed {
                page: self.page,
                reason: format!("{err:#}"),
            })
    }
}

fn load_static(pdfium: &Arc<Pdfium>, bytes: Vec<u8>) -> Result<PdfDocument<'static>> {
    let document = pdfium
        .load_pdf_from_byte_vec(bytes, None)
        .context("pdfium rejected the document")?;
    // SAFETY: the document borrows the bindings behind `pdfium`. Every
    // document produced here is stored in a `SharedDocument`, which also holds
    // a clone of that Arc in a field declared after (and therefore dropped
    // after) the documents, so the bindings outlive the borrow.
    let document = unsafe { mem::transmute::<PdfDocument<'_>, PdfDocument<'static>>(document) };
    Ok(document)
}

fn with_page<R>(
    document: &PdfDocument<'static>,
    page: usize,
    f: impl FnOnce(&PdfPage<'_>) -> Result<R>,
) -> Result<R> {
    let index: PdfPageIndex = page
        .checked_sub(1)
        .and_then(|index| index.try_into().ok())
        .ok_or_else(|| anyhow!("page {} is out of supported range", page))?;
    let pdf_page = document
        .pages()
        .get(index)
        .with_context(|| format!("page {} out of range", page))?;
    f(&pdf_page)
}

fn render_page(
    document: &PdfDocument<'static>,
    page: usize,
    viewport: &Viewport,
) -> Result<RenderImage> {
    let config = PdfRenderConfig::new().scale_page_by_factor(viewport.scale.max(0.1));
    with_page(document, page, |pdf_page| {
        let bitmap = pdf_page
            .render_with_config(&config)
            .with_context(|| format!("failed to render page {}", page))?;
        let pixels = bitmap.as_image().to_rgba8().into_raw();

        Ok(RenderImage {
            width: u32::try_from(bitmap.width()).unwrap_or_default(),
            height: u32::try_from(bitmap.height()).unwrap_or_default(),
            pixels,
        })
    })
}

fn bind_pdfium_from_env() -> Option<Pdfium> {
    match std::env::var(LIBRARY_PATH_ENV) {
        Ok(path) if !path.is_empty() => match Pdfium::bind_to_library(&path) {
            Ok(bindings) => Some(Pdfium::new(bindings)),
            Err(err) => {
                warn!("failed to load Pdfium from {}={}: {}", LIBRARY_PATH_ENV, path, err);
                None
            }
        },
        _ => None,
    }
}

fn bind_pdfium_default() -> Result<Pdfium> {
    let mut errors = Vec::new();

    let cwd_path = Pdfium::pdfium_platform_library_name_at_path("./");
    match Pdfium::bind_to_library(&cwd_path) {
        Ok(bindings) => return Ok(Pdfium::new(bindings)),
        Err(err) => errors.push(format!("{}: {}", cwd_path.display(), err)),
    }

    match Pdfium::bind_to_system_library() {
        Ok(bindings) => Ok(Pdfium::new(bindings)),
        Err(err) => {
            errors.push(format!("system: {err}"));
            Err(anyhow!(
                "failed to bind to a pdfium library; set {} or install it ({})",
                LIBRARY_PATH_ENV,
                errors.join(", ")
            ))
        }
    }
}
