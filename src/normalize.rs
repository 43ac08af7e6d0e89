
use std::io;

use crate::{Error, addr::Endpoint, sys};

/// The native operation a failure came from. Decides how an otherwise
/// ambiguous native class is reported.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Op {
    Create,
    Bind(Endpoint),
    Connect(Endpoint),
    Listen,
    Accept,
    Send,
    Receive { capacity: usize },
    SetOption(&'static str),
    Shutdown,
    LocalAddr,
    #[cfg_attr(not(feature = "tokio"), allow(dead_code))]
    Register,
}

impl Op {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Op::Create => "create socket",
            Op::Bind(..) => "bind",
            Op::Connect(..) => "connect",
            Op::Listen => "listen",
            Op::Accept => "accept",
            Op::Send => "send",
            Op::Receive { .. } => "receive",
            Op::SetOption(option) => *option,
            Op::Shutdown => "shutdown",
            Op::LocalAddr => "read local address",
            Op::Register => "register with tokio",
        }
    }
}

/// Platform independent meaning of a native error code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum NativeClass {
    WouldBlock,
    InProgress,
    Interrupted,
    AddrInUse,
    AddrNotAvailable,
    AccessDenied,
    ConnRefused,
    ConnReset,
    ConnAborted,
    NotConnected,
    AlreadyConnected,
    TimedOut,
    NetUnreachable,
    HostUnreachable,
    MessageSize,
    NoBuffers,
    TooManyDescriptors,
    BadDescriptor,
    InvalidArgument,
    NotSupported,
    Shutdown,
    Other,
}

impl NativeClass {
    pub(crate) fn describe(self) -> &'static str {
        match self {
            NativeClass::WouldBlock => "operation would block",
            NativeClass::InProgress => "operation in progress",
            NativeClass::Interrupted => "interrupted",
            NativeClass::AddrInUse => "address in use",
            NativeClass::AddrNotAvailable => "address not available",
            NativeClass::AccessDenied => "access denied",
            NativeClass::ConnRefused => "connection refused",
            NativeClass::ConnReset => "connection reset",
            NativeClass::ConnAborted => "connection aborted",
            NativeClass::NotConnected => "not connected",
            NativeClass::AlreadyConnected => "already connected",
            NativeClass::TimedOut => "timed out",
            NativeClass::NetUnreachable => "network unreachable",
            NativeClass::HostUnreachable => "host unreachable",
            NativeClass::MessageSize => "message size",
            NativeClass::NoBuffers => "out of buffer space",
            NativeClass::TooManyDescriptors => "too many open descriptors",
            NativeClass::BadDescriptor => "bad descriptor",
            NativeClass::InvalidArgument => "invalid argument",
            NativeClass::NotSupported => "not supported",
            NativeClass::Shutdown => "socket shut down",
            NativeClass::Other => "unrecognized native error",
        }
    }
}

/// Per-call facts about the handle the error happened on.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Context {
    pub blocking: bool,
    pub cancelled: bool,
}

pub(crate) fn classify(err: &io::Error) -> NativeClass {
    err.raw_os_error()
        .and_then(sys::classify)
        .unwrap_or_else(|| classify_kind(err.kind()))
}

fn classify_kind(kind: io::ErrorKind) -> NativeClass {
    use io::ErrorKind as K;
    match kind {
        K::WouldBlock => NativeClass::WouldBlock,
        K::Interrupted => NativeClass::Interrupted,
        K::AddrInUse => NativeClass::AddrInUse,
        K::AddrNotAvailable => NativeClass::AddrNotAvailable,
        K::PermissionDenied => NativeClass::AccessDenied,
        K::ConnectionRefused => NativeClass::ConnRefused,
        K::ConnectionReset | K::BrokenPipe => NativeClass::ConnReset,
        K::ConnectionAborted => NativeClass::ConnAborted,
        K::NotConnected => NativeClass::NotConnected,
        K::TimedOut => NativeClass::TimedOut,
        K::NetworkUnreachable => NativeClass::NetUnreachable,
        K::HostUnreachable => NativeClass::HostUnreachable,
        K::OutOfMemory => NativeClass::NoBuffers,
        K::InvalidInput => NativeClass::InvalidArgument,
        K::Unsupported => NativeClass::NotSupported,
        _ => NativeClass::Other,
    }
}

pub(crate) fn normalize(err: io::Error, op: Op, ctx: Context) -> Error {
    let class = classify(&err);
    let name = op.name();
    if ctx.cancelled {
        return Error::Cancelled { op: name };
    }

    match (op, class) {
        // SO_RCVTIMEO / SO_SNDTIMEO expiry surfaces as EAGAIN on blocking sockets.
        (_, NativeClass::WouldBlock) if ctx.blocking => Error::TimedOut { op: name },
        (_, NativeClass::WouldBlock | NativeClass::InProgress) => Error::WouldBlock { op: name },
        (_, NativeClass::TimedOut) => Error::TimedOut { op: name },
        // Only calls that can't be restarted get here, e.g. a connect that
        // carries on in the background.
        (_, NativeClass::Interrupted) => Error::WouldBlock { op: name },
        (_, NativeClass::AccessDenied) => Error::PermissionDenied { op: name },
        (_, NativeClass::TooManyDescriptors | NativeClass::NoBuffers) => {
            Error::ResourceExhausted {
                op: name,
                reason: class.describe(),
            }
        }
        (Op::Bind(addr), NativeClass::AddrInUse) if addr.port() == 0 => {
            Error::ResourceExhausted {
                op: name,
                reason: "no free ephemeral port",
            }
        }
        (Op::Bind(addr), NativeClass::AddrInUse) => Error::AddressInUse { addr },
        (Op::Bind(addr), _) => Error::BindFailed {
            addr,
            reason: class.describe(),
        },
        (
            Op::Connect(addr),
            NativeClass::ConnRefused
            | NativeClass::ConnReset
            | NativeClass::ConnAborted
            | NativeClass::NetUnreachable
            | NativeClass::HostUnreachable
            | NativeClass::AddrInUse
            | NativeClass::AddrNotAvailable
            | NativeClass::NotConnected
            | NativeClass::AlreadyConnected
            | NativeClass::InvalidArgument,
        ) => Error::ConnectFailed {
            addr,
            reason: class.describe(),
        },
        (Op::Listen, NativeClass::AddrInUse) => Error::ResourceExhausted {
            op: name,
            reason: "no free ephemeral port",
        },
        (Op::Receive { capacity }, NativeClass::MessageSize) => {
            Error::MessageTruncated { capacity }
        }
        (_, NativeClass::MessageSize) => Error::MessageTooLarge,
        (
            Op::Send | Op::Receive { .. } | Op::Accept | Op::Shutdown,
            NativeClass::ConnReset
            | NativeClass::ConnAborted
            | NativeClass::NotConnected
            | NativeClass::Shutdown,
        ) => Error::ConnectionReset { op: name },
        (Op::SetOption(option), class) if class != NativeClass::Other => {
            Error::ConfigurationFailed {
                option,
                reason: class.describe().to_owned(),
            }
        }
        _ => Error::Unknown {
            op: name,
            code: err.raw_os_error(),
            message: err.to_string(),
        },
    }
}
