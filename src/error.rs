//! Error types for ionpool.

use thiserror::Error;

/// Result type alias using ionpool's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for ionpool operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A caller-supplied argument was rejected (zero-length allocation,
    /// out-of-range mapping, never-zeroed mmap attempt, foreign import).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No heap in the requested heap-id mask could satisfy the allocation.
    #[error("no heap in the requested mask could satisfy the allocation")]
    NoMatchingHeap,

    /// The resolved heap does not implement the requested capability.
    #[error("heap does not support {0}")]
    Unsupported(&'static str),

    /// Allocation of internal bookkeeping state failed.
    #[error("out of memory")]
    OutOfMemory,

    /// A handle failed validation against the stated client. This indicates
    /// use-after-free or cross-client handle confusion at the call site.
    #[error("handle is not registered with this client")]
    InvalidHandle,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
