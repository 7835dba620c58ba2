//! Error types for shmblock.

use thiserror::Error;

/// Result type alias using shmblock's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for shmblock operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Resource registry has been shut down (or was never started).
    #[error("resource registry is not ready")]
    NotReady,

    /// Key or segment absent where presence is required.
    #[error("resource not found: {key}")]
    NotFound {
        /// Registry key or segment path that could not be resolved.
        key: String,
    },

    /// Attempted double-registration in the registry.
    #[error("resource already registered: {key}")]
    DuplicateKey {
        /// Registry key that is already occupied.
        key: String,
    },

    /// A block with this canonical key is already cached.
    #[error("shared block already registered: {key}")]
    AlreadyRegistered {
        /// Canonical registry key of the existing block.
        key: String,
    },

    /// offset + limit exceeds the block's declared capacity.
    #[error(
        "shared block offset + limit incorrect, size={capacity}, offset={offset}, limit={limit}, path=[{path}]"
    )]
    OutOfRange {
        /// Declared block capacity in bytes.
        capacity: usize,
        /// Requested window start.
        offset: usize,
        /// Requested window length.
        limit: usize,
        /// Block path, for diagnostics.
        path: String,
    },

    /// OS mapping or creation failure.
    #[error("mapping failed: {0}")]
    MapFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
