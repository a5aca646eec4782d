//! Module subsystem errors

use thiserror::Error;

/// Errors surfaced by the module host API.
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("module not found: {0}")]
    NotFound(String),

    #[error("invalid module: {0}")]
    Invalid(String),

    #[error("operation not supported: {0}")]
    NotSupported(String),

    #[error("channel disconnected")]
    Disconnected,

    #[error("no message ready")]
    NotReady,

    #[error("message routing error: {0}")]
    Routing(String),

    #[error("service already registered: {0}")]
    AlreadyExists(String),

    #[error("thread error: {0}")]
    Thread(String),

    #[error("{topic} request failed: errnum {errnum}")]
    Rpc { topic: String, errnum: i32 },

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ModuleError {
    /// Map to the POSIX errno carried in wire-level error responses.
    pub fn as_errno(&self) -> i32 {
        match self {
            ModuleError::NotFound(_) => libc::ENOENT,
            ModuleError::Invalid(_) => libc::EINVAL,
            ModuleError::NotSupported(_) => libc::ENOSYS,
            ModuleError::Disconnected => libc::ECONNRESET,
            ModuleError::NotReady => libc::EWOULDBLOCK,
            ModuleError::Routing(_) => libc::EPROTO,
            ModuleError::AlreadyExists(_) => libc::EEXIST,
            ModuleError::Thread(_) => libc::EIO,
            ModuleError::Rpc { errnum, .. } => *errnum,
            ModuleError::Serialization(_) => libc::EPROTO,
        }
    }
}

impl From<serde_json::Error> for ModuleError {
    fn from(e: serde_json::Error) -> Self {
        ModuleError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for ModuleError {
    fn from(e: std::io::Error) -> Self {
        ModuleError::Thread(e.to_string())
    }
}
