use std::io;

use socket2::Socket;
use windows_sys::Win32::Networking::WinSock as ws;

use crate::{iface::BindDevice, normalize::NativeClass};

const WINSOCK_2_2: u16 = 0x0202;

pub(crate) fn startup() -> io::Result<()> {
    // SAFETY: WSADATA is plain data and only written by WSAStartup.
    let mut data: ws::WSADATA = unsafe { std::mem::zeroed() };
    let rc = unsafe { ws::WSAStartup(WINSOCK_2_2, &mut data) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    Ok(())
}

pub(crate) fn cleanup() {
    // Balances exactly one successful startup().
    unsafe { ws::WSACleanup() };
}

pub(crate) fn classify(code: i32) -> Option<NativeClass> {
    let class = match code {
        ws::WSAEWOULDBLOCK => NativeClass::WouldBlock,
        ws::WSAEINPROGRESS | ws::WSAEALREADY => NativeClass::InProgress,
        ws::WSAEINTR | ws::WSAECANCELLED | ws::WSA_OPERATION_ABORTED => NativeClass::Interrupted,
        ws::WSAEADDRINUSE => NativeClass::AddrInUse,
        ws::WSAEADDRNOTAVAIL => NativeClass::AddrNotAvailable,
        ws::WSAEACCES => NativeClass::AccessDenied,
        ws::WSAECONNREFUSED => NativeClass::ConnRefused,
        ws::WSAECONNRESET | ws::WSAENETRESET | ws::WSAEDISCON => NativeClass::ConnReset,
        ws::WSAECONNABORTED => NativeClass::ConnAborted,
        ws::WSAENOTCONN => NativeClass::NotConnected,
        ws::WSAEISCONN => NativeClass::AlreadyConnected,
        ws::WSAETIMEDOUT => NativeClass::TimedOut,
        ws::WSAENETUNREACH | ws::WSAENETDOWN => NativeClass::NetUnreachable,
        ws::WSAEHOSTUNREACH | ws::WSAEHOSTDOWN => NativeClass::HostUnreachable,
        ws::WSAEMSGSIZE => NativeClass::MessageSize,
        ws::WSAENOBUFS | ws::WSA_NOT_ENOUGH_MEMORY => NativeClass::NoBuffers,
        ws::WSAEMFILE | ws::WSAETOOMANYREFS => NativeClass::TooManyDescriptors,
        ws::WSAENOTSOCK | ws::WSAEBADF | ws::WSA_INVALID_HANDLE => NativeClass::BadDescriptor,
        ws::WSAEINVAL | ws::WSAEFAULT | ws::WSA_INVALID_PARAMETER => NativeClass::InvalidArgument,
        ws::WSAEOPNOTSUPP
        | ws::WSAEPROTONOSUPPORT
        | ws::WSAEAFNOSUPPORT
        | ws::WSAENOPROTOOPT
        | ws::WSANOTINITIALISED => NativeClass::NotSupported,
        ws::WSAESHUTDOWN => NativeClass::Shutdown,
        _ => return None,
    };
    Some(class)
}

pub(crate) fn bind_device(_socket: &Socket, _device: &BindDevice, _is_v6: bool) -> io::Result<()> {
    Err(io::ErrorKind::Unsupported.into())
}
