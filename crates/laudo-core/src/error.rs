use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid control number: {0}")]
    InvalidControlNumber(String),

    #[error("Unsupported schema version {found} (newest known is {supported})")]
    UnsupportedSchema { found: u64, supported: u64 },

    #[error("Invalid report data: {0}")]
    InvalidData(#[from] serde_json::Error),
}
