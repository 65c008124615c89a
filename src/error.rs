//! Error taxonomy for send/receive operations.
//!
//! Stream-integrity failures (`BadStream`, `BadVersion`) are always hard
//! errors. Reconciliation leftovers surface as the soft `Incomplete` so a
//! partially-renamed destination never blocks the data plane.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or corrupted stream (bad magic, checksum mismatch,
    /// truncated record).
    #[error("invalid stream: {0}")]
    BadStream(String),

    /// The stream declares a header kind or feature flags we do not
    /// understand.
    #[error("stream has unsupported feature or version ({0:#x})")]
    BadVersion(u64),

    #[error("operation not supported: {0}")]
    NotSupported(String),

    /// Target is not a filesystem or volume.
    #[error("'{0}' is not a filesystem or volume")]
    BadType(String),

    #[error("out of memory: {0}")]
    NoMemory(String),

    #[error("failed to set up dedup pipe: {0}")]
    PipeFailed(String),

    #[error("failed to create dedup worker thread: {0}")]
    ThreadCreateFailed(String),

    #[error("destination '{0}' exists")]
    Exists(String),

    #[error("{0}")]
    NotFound(String),

    /// "From" snapshot is not an earlier snapshot from the same
    /// filesystem as the target.
    #[error("'{0}' is not an earlier snapshot from the same fs as '{1}'")]
    CrossTarget(String, String),

    #[error("invalid dataset name '{0}'")]
    InvalidName(String),

    /// Soft: some reconciliation actions could not complete. The
    /// received data itself is intact.
    #[error("some datasets could not be destroyed, renamed, or promoted")]
    Incomplete,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Soft errors report a degraded-but-successful receive.
    pub fn is_soft(&self) -> bool {
        matches!(self, Error::Incomplete)
    }
}
