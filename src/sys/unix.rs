use std::io;

use socket2::Socket;

use crate::{iface::BindDevice, normalize::NativeClass};

// BSD sockets need no process-wide startup.
pub(crate) fn startup() -> io::Result<()> {
    Ok(())
}

pub(crate) fn cleanup() {}

pub(crate) fn classify(code: i32) -> Option<NativeClass> {
    let class = match code {
        libc::EAGAIN => NativeClass::WouldBlock,
        c if c == libc::EWOULDBLOCK => NativeClass::WouldBlock,
        libc::EINPROGRESS | libc::EALREADY => NativeClass::InProgress,
        libc::EINTR => NativeClass::Interrupted,
        libc::EADDRINUSE => NativeClass::AddrInUse,
        libc::EADDRNOTAVAIL => NativeClass::AddrNotAvailable,
        libc::EACCES | libc::EPERM => NativeClass::AccessDenied,
        libc::ECONNREFUSED => NativeClass::ConnRefused,
        libc::ECONNRESET | libc::EPIPE => NativeClass::ConnReset,
        libc::ECONNABORTED => NativeClass::ConnAborted,
        libc::ENOTCONN => NativeClass::NotConnected,
        libc::EISCONN => NativeClass::AlreadyConnected,
        libc::ETIMEDOUT => NativeClass::TimedOut,
        libc::ENETUNREACH | libc::ENETDOWN | libc::ENODEV => NativeClass::NetUnreachable,
        libc::EHOSTUNREACH | libc::EHOSTDOWN => NativeClass::HostUnreachable,
        libc::EMSGSIZE => NativeClass::MessageSize,
        libc::ENOBUFS | libc::ENOMEM => NativeClass::NoBuffers,
        libc::EMFILE | libc::ENFILE => NativeClass::TooManyDescriptors,
        libc::EBADF | libc::ENOTSOCK => NativeClass::BadDescriptor,
        libc::EINVAL | libc::EFAULT => NativeClass::InvalidArgument,
        libc::EOPNOTSUPP | libc::EPROTONOSUPPORT | libc::EAFNOSUPPORT | libc::ENOPROTOOPT => {
            NativeClass::NotSupported
        }
        libc::ESHUTDOWN => NativeClass::Shutdown,
        _ => return None,
    };
    Some(class)
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
pub(crate) fn bind_device(socket: &Socket, device: &BindDevice, is_v6: bool) -> io::Result<()> {
    if is_v6 {
        socket.bind_device_by_index_v6(Some(device.index()))
    } else {
        socket.bind_device_by_index_v4(Some(device.index()))
    }
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "fuchsia"))]
pub(crate) fn bind_device(socket: &Socket, device: &BindDevice, _is_v6: bool) -> io::Result<()> {
    socket.bind_device(Some(device.name().as_bytes()))
}

#[cfg(not(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "linux",
    target_os = "android",
    target_os = "fuchsia"
)))]
pub(crate) fn bind_device(_socket: &Socket, _device: &BindDevice, _is_v6: bool) -> io::Result<()> {
    Err(io::ErrorKind::Unsupported.into())
}
