//! Error types shared across the Level II pipeline.
//!
//! `LeveliiError` is the typed taxonomy for failures that callers are
//! expected to branch on. Per-radial and per-block validation failures
//! inside the decoder are *not* errors: parsing loops drop the offending
//! item and continue, so those conditions never appear here.

use thiserror::Error;

/// Convenience alias for results using the pipeline error type.
pub type Result<T> = std::result::Result<T, LeveliiError>;

/// Primary error type for the Level II pipeline.
///
/// # Error Categories
///
/// - **Container errors** (`MalformedContainer`, `Decompression`) occur
///   while unpacking an archive file. The archive is abandoned; the
///   station's failure counter is incremented.
/// - **Transport errors** (`RemoteFetch`) occur while listing or
///   fetching from the object store. The batch item is abandoned.
/// - **Persistence errors** (`Storage`) occur while writing artifacts
///   or indexes. The artifact is dropped; processing continues.
/// - **Lifecycle** (`ShutdownInProgress`) is returned by any wait that
///   observes the stop signal; the operation has no side effects.
#[derive(Error, Debug)]
pub enum LeveliiError {
    /// The archive container is structurally invalid: volume header too
    /// small, truncated LDM control word, or a decompressor that could
    /// not be initialized.
    #[error("malformed container: {0}")]
    MalformedContainer(&'static str),

    /// A bzip2 stream inside the container failed to decompress.
    #[error("decompression failed: {0}")]
    Decompression(String),

    /// Object-store listing or fetch failed.
    #[error("remote fetch failed: {0}")]
    RemoteFetch(String),

    /// Artifact or index could not be persisted.
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration value parsed but is semantically invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// A wait observed the stop signal; nothing was done.
    #[error("shutdown in progress")]
    ShutdownInProgress,

    /// Standard I/O failure (file reads/writes, directory creation).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
