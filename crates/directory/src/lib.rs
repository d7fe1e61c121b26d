//! Extension directory
//!
//! The building directory lives in an external database; this crate owns
//! the access seam (`DirectoryStore`, `DirectoryWatcher`), the row types,
//! fuzzy resident validation, the local snapshot fallback, and the concrete
//! Postgres implementation.

pub mod matching;
pub mod postgres;
pub mod snapshot;
pub mod store;
pub mod types;

pub use matching::{best_resident_score, validate_visit, ValidationOutcome, VALIDATION_THRESHOLD};
pub use postgres::{PgDirectoryStore, PgDirectoryWatcher};
pub use snapshot::SnapshotStore;
pub use store::{ChangeAction, DirectoryChange, DirectoryStore, DirectoryWatcher};
pub use types::{normalize_voip_number, DirectoryEntry, ExtensionRecord};

use thiserror::Error;

/// Directory errors
#[derive(Error, Debug)]
pub enum DirectoryError {
    /// Store unreachable. At startup this triggers the snapshot fallback;
    /// at runtime notifications pause while listeners keep serving.
    #[error("directory unavailable: {0}")]
    Unavailable(String),

    #[error("malformed directory payload: {0}")]
    Malformed(String),

    #[error("snapshot i/o error: {0}")]
    Snapshot(#[from] std::io::Error),
}

impl From<sqlx::Error> for DirectoryError {
    fn from(err: sqlx::Error) -> Self {
        DirectoryError::Unavailable(err.to_string())
    }
}
