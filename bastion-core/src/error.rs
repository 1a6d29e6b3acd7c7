//! Error taxonomy shared across the forwarding engine, SSH pool and audit
//! pipeline. The copy path never returns these to callers; they surface on
//! session start, pool dial and audit queries.

use std::fmt;
use std::io;

use crate::system::diagnostics::BindDiagnostics;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug)]
pub enum CoreError {
    /// Malformed SOCKS5/HTTP on accept, unsupported command or version,
    /// bad CIDR at ACL construction.
    InvalidRequest(String),

    /// A referenced record (bastion name, mapping id, log id) does not exist.
    NotFound(String),

    /// Local address in use at bind, or a lifecycle operation raced a
    /// running mapping. Carries listener diagnostics when raised at bind.
    Conflict {
        message: String,
        diagnostics: Option<BindDiagnostics>,
    },

    /// SSH pool at capacity with every entry in active use.
    ResourceBusy(String),

    /// SSH hop failed after retries, or the upstream TCP dial failed.
    UpstreamFailure(String),

    /// A handshake, transfer or probe deadline elapsed.
    Timeout(String),

    Io(io::Error),
}

impl CoreError {
    pub fn conflict(message: impl Into<String>) -> Self {
        CoreError::Conflict {
            message: message.into(),
            diagnostics: None,
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::InvalidRequest(m) => write!(f, "invalid request: {}", m),
            CoreError::NotFound(m) => write!(f, "not found: {}", m),
            CoreError::Conflict { message, .. } => write!(f, "conflict: {}", message),
            CoreError::ResourceBusy(m) => write!(f, "resource busy: {}", m),
            CoreError::UpstreamFailure(m) => write!(f, "upstream failure: {}", m),
            CoreError::Timeout(m) => write!(f, "timeout: {}", m),
            CoreError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CoreError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CoreError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::TimedOut {
            CoreError::Timeout(e.to_string())
        } else {
            CoreError::Io(e)
        }
    }
}

impl From<russh::Error> for CoreError {
    fn from(e: russh::Error) -> Self {
        CoreError::UpstreamFailure(format!("ssh: {}", e))
    }
}

impl From<CoreError> for io::Error {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::Io(inner) => inner,
            CoreError::Timeout(m) => io::Error::new(io::ErrorKind::TimedOut, m),
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}
