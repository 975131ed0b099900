//! Error types for the mirroring engine.

use std::path::PathBuf;

/// Result type alias for mirroring operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the mirroring engine.
///
/// The batch copier is the only component that downgrades failures: it
/// aggregates non-release copy errors into a single [`Error::SafeBatch`]
/// and escalates a release failure into [`Error::UnsafeBatch`]. Every
/// other component fails fast.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Validation Errors
    // =========================================================================
    /// Malformed flags, bad URL prefixes, missing required inputs.
    /// Always reported before any state mutation.
    #[error("invalid configuration: {0}")]
    Validation(String),

    /// Failed to parse an image reference.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidImageReference { reference: String, reason: String },

    // =========================================================================
    // Batch Errors
    // =========================================================================
    /// A release image failed to copy. Fatal: short-circuits the batch.
    #[error("release image '{image}' failed: {reason}")]
    UnsafeBatch { image: String, reason: String },

    /// Aggregated non-fatal batch failures, surfaced at batch end with a
    /// pointer to the detailed error log.
    #[error("{0}")]
    SafeBatch(String),

    /// An operation was cancelled. The batch copier treats this as
    /// fail-safe unless the image type is release.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    // =========================================================================
    // Format Errors
    // =========================================================================
    /// Archive corruption, unparseable manifest, bad JSON/YAML, or a
    /// missing required label. Terminal for the current unit.
    #[error("format error in {context}: {reason}")]
    Format { context: String, reason: String },

    /// A single file exceeds the archive chunk size in strict mode.
    #[error("file {path} ({size} bytes) exceeds the archive chunk size {limit}")]
    ArchiveFileTooLarge {
        path: PathBuf,
        size: u64,
        limit: u64,
    },

    // =========================================================================
    // Lookup Errors
    // =========================================================================
    /// A required file or blob does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A blob is absent from the cache.
    #[error("blob not found: {digest}")]
    BlobNotFound { digest: String },

    /// A filtered channel does not exist in the catalog package.
    #[error("channel '{channel}' not found in package '{package}'")]
    ChannelNotFound { channel: String, package: String },

    // =========================================================================
    // Transfer Errors
    // =========================================================================
    /// A manifest or blob request failed.
    #[error("registry request for '{reference}' failed: {reason}")]
    RegistryRequest { reference: String, reason: String },

    /// An image copy failed.
    #[error("failed to copy '{source_ref}' to '{destination}': {reason}")]
    CopyFailed {
        source_ref: String,
        destination: String,
        reason: String,
    },

    /// Content did not match its expected digest.
    #[error("digest mismatch for {digest}: computed {computed}")]
    DigestMismatch { digest: String, computed: String },

    /// An operation exceeded its deadline.
    #[error("timeout during {operation}")]
    Timeout { operation: String },

    // =========================================================================
    // Infrastructure Errors
    // =========================================================================
    /// The embedded cache registry failed to start or serve.
    #[error("cache registry error: {0}")]
    CacheRegistry(String),

    /// Filesystem initialization or write failure.
    #[error("storage error at {path}: {reason}")]
    Storage { path: PathBuf, reason: String },

    /// Underlying I/O error with context.
    #[error("i/o error during {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Helper for wrapping I/O failures with an operation description.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}
