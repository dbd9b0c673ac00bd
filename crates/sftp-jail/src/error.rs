//! Error types for the SFTP jail
//!
//! Errors are split by how far they reach: request-scoped failures are turned
//! into an SFTP STATUS reply for one request, connection-scoped failures end one
//! connection, and configuration failures stop the process at startup.

use std::io::ErrorKind;
use thiserror::Error;

use crate::protocol::StatusCode;

/// Crate-wide result
pub type Result<T> = std::result::Result<T, Error>;

/// Every failure the server can produce
#[derive(Error, Debug)]
pub enum Error {
    // Request scope: answered with a STATUS, the channel stays open.
    /// Filesystem call failed
    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),

    /// Target of a request does not exist
    #[error("not found: {0}")]
    FileNotFound(String),

    /// Request not allowed on this handle or path
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Path refused by the sandbox resolver
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Handle string unknown, closed or of the wrong kind
    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    /// Operation this server never performs; the text is sent as is
    #[error("{0}")]
    NotSupported(String),

    /// Packet body malformed, or packet out of sequence
    #[error("protocol: {0}")]
    Protocol(String),

    // Connection scope: the connection is dropped, the acceptor keeps going.
    /// SSH transport or key handling failed
    #[error("ssh: {0}")]
    Ssh(String),

    /// Credentials refused
    #[error("authentication: {0}")]
    Authentication(String),

    /// Socket-level failure, including bind
    #[error("connection: {0}")]
    Connection(String),

    /// Peer task or queue went away underneath a loop
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    // Startup scope: the process exits.
    /// Configuration, host key or sandbox preparation failed
    #[error("configuration: {0}")]
    Config(String),

    /// Internal inconsistency
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Caused by what the client sent, not by the server
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::FileNotFound(_)
                | Self::PermissionDenied(_)
                | Self::InvalidPath(_)
                | Self::InvalidHandle(_)
                | Self::NotSupported(_)
                | Self::Protocol(_)
        )
    }

    /// Worth a warn-level log line: refused credentials, refused paths,
    /// permission failures
    pub fn is_security_event(&self) -> bool {
        match self {
            Self::Authentication(_) | Self::PermissionDenied(_) | Self::InvalidPath(_) => true,
            Self::Io(e) => e.kind() == ErrorKind::PermissionDenied,
            _ => false,
        }
    }

    /// Status code for the STATUS reply
    pub fn to_status_code(&self) -> StatusCode {
        match self {
            Self::Io(e) => match e.kind() {
                ErrorKind::NotFound => StatusCode::NoSuchFile,
                ErrorKind::PermissionDenied => StatusCode::PermissionDenied,
                _ => StatusCode::Failure,
            },
            Self::FileNotFound(_) => StatusCode::NoSuchFile,
            Self::PermissionDenied(_) => StatusCode::PermissionDenied,
            Self::InvalidPath(_) | Self::InvalidHandle(_) | Self::Protocol(_) => {
                StatusCode::BadMessage
            }
            Self::NotSupported(_) => StatusCode::OpUnsupported,
            Self::Connection(_) | Self::ChannelClosed(_) => StatusCode::ConnectionLost,
            Self::Ssh(_) | Self::Authentication(_) | Self::Config(_) | Self::Other(_) => {
                StatusCode::Failure
            }
        }
    }

    /// Text for the STATUS reply
    ///
    /// Resolved paths, OS error details and configuration stay on the server.
    pub fn sanitized_message(&self) -> String {
        let fixed = match self {
            Self::Io(e) => match e.kind() {
                ErrorKind::NotFound => "No such file",
                ErrorKind::PermissionDenied => "Permission denied",
                _ => "Failure",
            },
            Self::PermissionDenied(_) => "Permission denied",
            Self::InvalidPath(_) => "Invalid path",
            Self::Authentication(_) => "Authentication failed",
            Self::Config(_) => "Server configuration error",
            _ => return self.to_string(),
        };
        fixed.to_string()
    }

    /// [`Error::InvalidHandle`] from any message
    pub fn invalid_handle(context: impl Into<String>) -> Self {
        Self::InvalidHandle(context.into())
    }

    /// [`Error::ChannelClosed`] from any message
    pub fn channel_closed(context: impl Into<String>) -> Self {
        Self::ChannelClosed(context.into())
    }
}

impl From<russh::Error> for Error {
    fn from(err: russh::Error) -> Self {
        Self::Ssh(err.to_string())
    }
}

impl From<russh::keys::Error> for Error {
    fn from(err: russh::keys::Error) -> Self {
        Self::Ssh(err.to_string())
    }
}
