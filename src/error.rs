use std::path::PathBuf;

use thiserror::Error;

/// The primary error type for all operations in the `partar` crate.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// An I/O error, with the path on which it happened.
    #[error("I/O error on path '{}': {source}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// A header could not be encoded for an entry (oversized or
    /// unrepresentable metadata).
    #[error("cannot encode header for '{name}': {reason}")]
    Encode { name: String, reason: String },

    /// A malformed tar header or pax record was found while parsing.
    #[error("malformed archive: {0}")]
    Format(String),

    /// A work-queue item failed to parse. The queue is corrupt and the
    /// operation cannot continue.
    #[error("corrupt work-queue item: {0}")]
    Queue(String),

    /// The sidecar offset index disagrees with the archive it points into.
    #[error("offset index does not match archive: {0}")]
    StaleIndex(String),

    /// One or more workers flagged a failure; the whole operation fails.
    #[error("operation failed on one or more of {ranks} workers")]
    Failed { ranks: usize },

    /// A worker thread panicked.
    #[error("a worker thread panicked")]
    Panicked,
}

impl ArchiveError {
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        ArchiveError::Io {
            source,
            path: path.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ArchiveError>;
