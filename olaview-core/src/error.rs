use thiserror::Error;

/// The source could not be reached or decoded.
#[derive(Debug, Clone, Error)]
pub enum LoadError {
    #[error("source {source_id} could not be read: {reason}")]
    Unreachable { source_id: String, reason: String },
    #[error("source {source_id} is not a decodable document: {reason}")]
    Undecodable { source_id: String, reason: String },
}

#[derive(Debug, Clone, Error)]
#[error("failed to fetch page {page}: {reason}")]
pub struct PageFetchError {
    pub page: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Error)]
pub enum RenderError {
    /// The task was cancelled because a newer render superseded it. This is
    /// control flow, not a failure.
    #[error("render cancelled")]
    Cancelled,
    #[error("failed to render page {page}: {reason}")]
    Failed { page: usize, reason: String },
}

impl RenderError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RenderError::Cancelled)
    }
}

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    PageFetch(#[from] PageFetchError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error("no document is loaded")]
    NoDocument,
    #[error("unknown layer {0}")]
    UnknownLayer(String),
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;
