use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub type AppResult<T> = Result<T, AppError>;

/// Engine-wide error taxonomy. The retry classification below is what the
/// task engine consults when deciding between requeue and permanent failure.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("model not ready: {0}")]
    ModelNotReady(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("capacity exceeded: {0}")]
    Capacity(String),

    #[error("cancelled")]
    Cancelled,

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Transient failures are retried with backoff, everything else fails
    /// the task permanently.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::Io(_)
                | AppError::Database(_)
                | AppError::Pool(_)
                | AppError::ModelNotReady(_)
                | AppError::Capacity(_)
        )
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Config(_) => 2,
            AppError::ModelNotReady(_) => 3,
            AppError::Integrity(_) => 4,
            _ => 1,
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Other(e.into())
    }
}

/// Cooperative shutdown handle passed to every long-running component.
#[derive(Clone)]
pub struct Shutdown(CancellationToken);

impl Shutdown {
    pub fn new() -> Self {
        Self(CancellationToken::new())
    }

    pub fn shutdown(&self) {
        self.0.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.0.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.0.cancelled().await;
    }

    /// Token for a unit of work that must stop when the process stops but
    /// can also be cancelled on its own.
    pub fn child_token(&self) -> CancellationToken {
        self.0.child_token()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
