use std::path::PathBuf;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure categories of a pipeline run.
///
/// `Config` aborts before any processing. `Geometry` is reported per feature
/// and never aborts a batch. `ExternalTool` is always fatal to the run.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("geometry error: {0}")]
    Geometry(String),

    #[error(transparent)]
    ExternalTool(#[from] ExternalToolError),

    #[error("run cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub(crate) fn geometry(msg: impl Into<String>) -> Self {
        Error::Geometry(msg.into())
    }
}

/// Failures of the generalization workspace, in-process or external.
#[derive(Debug, thiserror::Error)]
pub enum ExternalToolError {
    #[error("layer '{name}' already exists in the run workspace")]
    NameCollision { name: String },

    #[error("layer '{name}' does not exist in the run workspace")]
    MissingLayer { name: String },

    #[error("workspace {} is missing", .0.display())]
    MissingWorkspace(PathBuf),

    #[error("failed to start '{tool}': {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{tool}' exited with {status}: {stderr}")]
    Failed {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("'{tool}' timed out after {timeout:?}")]
    Timeout { tool: String, timeout: Duration },
}
