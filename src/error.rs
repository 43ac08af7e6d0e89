use crate::{addr::Endpoint, handle::State};

/// Flat, copyable view of [`Error`] for matching.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ResolutionFailure,
    InvalidAddress,
    BindFailed,
    ConnectFailed,
    TimedOut,
    WouldBlock,
    ConnectionClosedByPeer,
    ConnectionReset,
    MessageTruncated,
    MessageTooLarge,
    InvalidState,
    PermissionDenied,
    AddressInUse,
    Cancelled,
    ResourceExhausted,
    ConfigurationFailed,
    Unknown,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not resolve {host:?}: {reason}")]
    ResolutionFailure { host: String, reason: String },
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("error binding to {addr}: {reason}")]
    BindFailed { addr: Endpoint, reason: &'static str },
    #[error("error connecting to {addr}: {reason}")]
    ConnectFailed { addr: Endpoint, reason: &'static str },
    #[error("{op} timed out")]
    TimedOut { op: &'static str },
    #[error("{op} would block")]
    WouldBlock { op: &'static str },
    #[error("connection closed by peer")]
    ConnectionClosedByPeer,
    #[error("connection reset during {op}")]
    ConnectionReset { op: &'static str },
    #[error("datagram did not fit into the {capacity} byte receive buffer")]
    MessageTruncated { capacity: usize },
    #[error("message too large to send")]
    MessageTooLarge,
    #[error("cannot {op} on a {state} socket")]
    InvalidState { op: &'static str, state: State },
    #[error("permission denied during {op}")]
    PermissionDenied { op: &'static str },
    #[error("address {addr} is already in use")]
    AddressInUse { addr: Endpoint },
    #[error("{op} cancelled: socket was closed")]
    Cancelled { op: &'static str },
    #[error("{op}: {reason}")]
    ResourceExhausted { op: &'static str, reason: &'static str },
    #[error("error setting {option}: {reason}")]
    ConfigurationFailed {
        option: &'static str,
        reason: String,
    },
    #[error("{op} failed{}: {message}", .code.map(|c| format!(" with native code {c}")).unwrap_or_default())]
    Unknown {
        op: &'static str,
        code: Option<i32>,
        message: String,
    },
}

pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ResolutionFailure { .. } => ErrorKind::ResolutionFailure,
            Error::InvalidAddress(..) => ErrorKind::InvalidAddress,
            Error::BindFailed { .. } => ErrorKind::BindFailed,
            Error::ConnectFailed { .. } => ErrorKind::ConnectFailed,
            Error::TimedOut { .. } => ErrorKind::TimedOut,
            Error::WouldBlock { .. } => ErrorKind::WouldBlock,
            Error::ConnectionClosedByPeer => ErrorKind::ConnectionClosedByPeer,
            Error::ConnectionReset { .. } => ErrorKind::ConnectionReset,
            Error::MessageTruncated { .. } => ErrorKind::MessageTruncated,
            Error::MessageTooLarge => ErrorKind::MessageTooLarge,
            Error::InvalidState { .. } => ErrorKind::InvalidState,
            Error::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Error::AddressInUse { .. } => ErrorKind::AddressInUse,
            Error::Cancelled { .. } => ErrorKind::Cancelled,
            Error::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            Error::ConfigurationFailed { .. } => ErrorKind::ConfigurationFailed,
            Error::Unknown { .. } => ErrorKind::Unknown,
        }
    }

    /// Flow-control signal of a non-blocking handle, not a failure.
    pub fn is_would_block(&self) -> bool {
        matches!(self, Error::WouldBlock { .. })
    }

    /// Whether repeating the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::WouldBlock { .. } | Error::TimedOut { .. } | Error::ResourceExhausted { .. }
        )
    }

    /// Raw native error code, only ever present for [`Error::Unknown`].
    pub fn native_code(&self) -> Option<i32> {
        match self {
            Error::Unknown { code, .. } => *code,
            _ => None,
        }
    }

    pub(crate) fn invalid_state(op: &'static str, state: State) -> Self {
        Error::InvalidState { op, state }
    }
}

/// [`Connection::send_all`](crate::Connection::send_all) stopped before the
/// whole buffer was written.
#[derive(thiserror::Error, Debug)]
#[error("{error} after sending {sent} bytes")]
pub struct SendAllError {
    /// Bytes written before the failing send. They are on their way to the
    /// peer and must not be sent again.
    pub sent: usize,
    #[source]
    pub error: Error,
}

impl SendAllError {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

impl From<SendAllError> for Error {
    fn from(e: SendAllError) -> Self {
        e.error
    }
}
