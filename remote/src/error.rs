//! Error kinds reported by host and fleet operations.
//!
//! # Logging Convention
//! The `LocalIo` variant wraps an `anyhow::Error` and its Display shows the full
//! context chain, so any format specifier can be used when logging.

use crate::response::Response;
use crate::session::ExitStatus;

/// Alias for `Result<T, remote::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Dial, authentication or session establishment failed.
    #[error("{0}")]
    Connection(String),

    /// The remote command exited with a non-zero status. The response holds
    /// whatever the command printed before exiting.
    #[error("{message}")]
    CommandFailed {
        message: String,
        status: ExitStatus,
        response: Box<Response>,
    },

    /// The peer sent something that does not follow the copy protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A local path could not be stat'ed, opened, created, read or written.
    #[error("{source:#}")]
    LocalIo {
        #[source]
        source: anyhow::Error,
    },

    /// The remote side reported a fatal error line.
    #[error("{0}")]
    Remote(String),

    /// Fleet dispatch referenced a host index that does not exist.
    #[error("host index {index} is out of range for a fleet of {len} hosts")]
    InvalidTarget { index: usize, len: usize },
}

impl Error {
    pub(crate) fn local_io(source: anyhow::Error) -> Self {
        Error::LocalIo { source }
    }

    /// True for the kinds that older callers treated as a single "connection
    /// error": transport failures and non-zero remote exits.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::CommandFailed { .. })
    }

    /// The captured output of a failed remote command, if there is one.
    pub fn response(&self) -> Option<&Response> {
        match self {
            Error::CommandFailed { response, .. } => Some(response.as_ref()),
            _ => None,
        }
    }
}

/// Attaches a description of the local operation to an I/O error, the way
/// `anyhow::Context` does, and turns it into [`Error::LocalIo`].
pub(crate) trait LocalIoContext<T> {
    fn local_context<F, C>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: std::fmt::Display + Send + Sync + 'static;
}

impl<T> LocalIoContext<T> for std::io::Result<T> {
    fn local_context<F, C>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: std::fmt::Display + Send + Sync + 'static,
    {
        use anyhow::Context;
        self.with_context(context).map_err(Error::local_io)
    }
}
