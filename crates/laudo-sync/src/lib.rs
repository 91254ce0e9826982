//! Offline-first persistence for the report editor
//!
//! Edits are written to a local cache first and pushed to the server in the
//! background:
//! - `cache`: one JSON file per report, with a `synced` flag
//! - `remote`: the server side of a push ([`Remote`], [`HttpRemote`])
//! - `worker`: debounced push with exponential backoff ([`SyncWorker`])

pub mod cache;
pub mod error;
pub mod remote;
pub mod worker;

pub use cache::{CacheEntry, LocalCache};
pub use error::SyncError;
pub use remote::{HttpRemote, Remote, SyncPayload};
pub use worker::{SyncConfig, SyncHandle, SyncWorker};
