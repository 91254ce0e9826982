use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache entry could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server rejected report {report_id}: HTTP {status}")]
    Rejected { report_id: i64, status: u16 },

    #[error("Sync worker has stopped")]
    WorkerStopped,
}

impl SyncError {
    /// Whether pushing the same snapshot again may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Http(_) | SyncError::Io(_) => true,
            SyncError::Rejected { status, .. } => *status >= 500 || *status == 429,
            SyncError::Encode(_) | SyncError::WorkerStopped => false,
        }
    }
}
