//! Error taxonomy shared by the task engine and the HTTP boundary.

use thiserror::Error;

pub type TaskResult<T> = Result<T, TaskError>;

#[derive(Debug, Error)]
pub enum TaskError {
    /// Bad URL or rendition kind; the caller can fix the request.
    #[error("{0}")]
    InvalidInput(String),

    /// Neither the metadata API nor the extraction tool produced anything.
    #[error("Failed to retrieve video information: {0}")]
    InfoUnavailable(String),

    #[error("{0}")]
    ToolMissing(String),

    #[error("{0}")]
    SubprocessFailure(String),

    #[error("{0}")]
    ArtifactNotFound(String),

    #[error("download id not found: {0}")]
    NotFound(String),

    #[error("download canceled")]
    Canceled,

    #[error("{0}")]
    Http(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TaskError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn not_found(task_id: impl Into<String>) -> Self {
        Self::NotFound(task_id.into())
    }

    /// Short machine-readable label, used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::InfoUnavailable(_) => "info_unavailable",
            Self::ToolMissing(_) => "tool_missing",
            Self::SubprocessFailure(_) => "subprocess_failure",
            Self::ArtifactNotFound(_) => "artifact_not_found",
            Self::NotFound(_) => "not_found",
            Self::Canceled => "canceled",
            Self::Http(_) => "http",
            Self::Io(_) => "io",
        }
    }
}
