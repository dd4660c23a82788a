//! Error types for the hns provider.

use std::io;

/// Provider operation errors.
#[derive(Debug)]
pub enum Error {
    /// Kernel command failed (context allocation, queries, verbs).
    Command(io::Error),
    /// mmap of a device or shared region failed. Carries the mapping
    /// command that selected the region.
    Map { command: u8, source: io::Error },
    /// Capability negotiation with the kernel failed, either because the
    /// request was rejected or the response carried unusable values.
    Negotiation(io::Error),
    /// Device or port attribute query failed.
    Query(io::Error),
    /// DCA pool configuration is unusable.
    PoolInit(&'static str),
    /// Caller exceeded a negotiated limit.
    Limit(&'static str),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Command(e) => write!(f, "kernel command failed: {}", e),
            Error::Map { command, source } => {
                write!(f, "mmap failed for command {}: {}", command, source)
            }
            Error::Negotiation(e) => write!(f, "capability negotiation failed: {}", e),
            Error::Query(e) => write!(f, "attribute query failed: {}", e),
            Error::PoolInit(msg) => write!(f, "DCA pool configuration rejected: {}", msg),
            Error::Limit(msg) => write!(f, "limit exceeded: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Command(e) | Error::Negotiation(e) | Error::Query(e) => Some(e),
            Error::Map { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Command(e)
    }
}

/// Errors from DCA pool memory operations.
#[derive(Debug)]
pub enum PoolError {
    /// The pool was configured with a zero unit size and holds no memory.
    Disabled,
    /// Growing would exceed the pool's maximum size.
    LimitReached,
    /// The kernel rejected registration of a new memory segment.
    Register(io::Error),
    /// Queue slot is outside the range the kernel agreed to track.
    BadQueueSlot(u32),
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::Disabled => write!(f, "DCA pool is disabled"),
            PoolError::LimitReached => write!(f, "DCA pool size limit reached"),
            PoolError::Register(e) => write!(f, "DCA segment registration failed: {}", e),
            PoolError::BadQueueSlot(n) => write!(f, "queue slot {} out of range", n),
        }
    }
}

impl std::error::Error for PoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PoolError::Register(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type for provider operations.
pub type Result<T> = std::result::Result<T, Error>;
