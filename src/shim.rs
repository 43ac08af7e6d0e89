//! One pass-through function per native socket operation.
//!
//! Inputs are already resolved addresses, outputs are whatever the native
//! call produced. Errors are returned untouched; interpreting them is the
//! job of [`normalize`](crate::normalize).

use std::{
    io,
    mem::MaybeUninit,
    net::{Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr},
    time::Duration,
};

use socket2::{Domain, MaybeUninitSlice, Protocol as NativeProtocol, SockAddr, Socket, Type};

use crate::{addr::Family, handle::Protocol};

pub(crate) fn create(family: Family, protocol: Protocol) -> io::Result<Socket> {
    let domain = match family {
        Family::V4 => Domain::IPV4,
        Family::V6 => Domain::IPV6,
    };
    let (ty, proto) = match protocol {
        Protocol::Tcp => (Type::STREAM, NativeProtocol::TCP),
        Protocol::Udp => (Type::DGRAM, NativeProtocol::UDP),
    };
    Socket::new(domain, ty, Some(proto))
}

pub(crate) fn bind(socket: &Socket, addr: SocketAddr) -> io::Result<()> {
    socket.bind(&addr.into())
}

/// With a timeout the native connect is started non-blocking and polled
/// until the deadline; the socket is blocking again afterwards.
pub(crate) fn connect(
    socket: &Socket,
    addr: SocketAddr,
    timeout: Option<Duration>,
) -> io::Result<()> {
    let addr = SockAddr::from(addr);
    match timeout {
        Some(timeout) => socket.connect_timeout(&addr, timeout),
        None => socket.connect(&addr),
    }
}

pub(crate) fn listen(socket: &Socket, backlog: i32) -> io::Result<()> {
    socket.listen(backlog)
}

pub(crate) fn accept(socket: &Socket) -> io::Result<(Socket, SocketAddr)> {
    let (accepted, addr) = socket.accept()?;
    Ok((accepted, as_inet(addr)?))
}

// Writing to a connection the peer has reset must fail with EPIPE rather
// than raise SIGPIPE.
#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: i32 = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: i32 = 0;

pub(crate) fn send(socket: &Socket, buf: &[u8]) -> io::Result<usize> {
    socket.send_with_flags(buf, SEND_FLAGS)
}

pub(crate) fn send_to(socket: &Socket, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
    socket.send_to_with_flags(buf, &addr.into(), SEND_FLAGS)
}

pub(crate) fn recv(socket: &Socket, buf: &mut [u8]) -> io::Result<usize> {
    socket.recv(as_uninit(buf))
}

#[derive(Debug)]
pub(crate) struct Datagram {
    pub len: usize,
    pub truncated: bool,
    pub from: SocketAddr,
}

pub(crate) fn recv_from(socket: &Socket, buf: &mut [u8]) -> io::Result<Datagram> {
    let mut bufs = [MaybeUninitSlice::new(as_uninit(buf))];
    let (len, flags, from) = socket.recv_from_vectored(&mut bufs)?;
    Ok(Datagram {
        len,
        truncated: flags.is_truncated(),
        from: as_inet(from)?,
    })
}

pub(crate) fn shutdown(socket: &Socket, how: Shutdown) -> io::Result<()> {
    socket.shutdown(how)
}

pub(crate) fn close(socket: Socket) {
    drop(socket)
}

pub(crate) fn local_addr(socket: &Socket) -> io::Result<SocketAddr> {
    as_inet(socket.local_addr()?)
}

pub(crate) fn peer_addr(socket: &Socket) -> io::Result<SocketAddr> {
    as_inet(socket.peer_addr()?)
}

pub(crate) fn take_error(socket: &Socket) -> io::Result<Option<io::Error>> {
    socket.take_error()
}

/// Every socket option the crate sets, so they all go through [`set_option`].
#[derive(Clone, Copy, Debug)]
pub(crate) enum SockOpt {
    Nonblocking(bool),
    ReuseAddress(bool),
    ReusePort(bool),
    OnlyV6(bool),
    RecvBufferSize(usize),
    SendBufferSize(usize),
    Keepalive(bool),
    ReadTimeout(Option<Duration>),
    WriteTimeout(Option<Duration>),
    MulticastTtlV4(u32),
    MulticastHopsV6(u32),
    MulticastLoopV4(bool),
    MulticastLoopV6(bool),
    MulticastIfV4(Ipv4Addr),
    MulticastIfV6(u32),
    JoinV4 { group: Ipv4Addr, interface: Ipv4Addr },
    LeaveV4 { group: Ipv4Addr, interface: Ipv4Addr },
    JoinV6 { group: Ipv6Addr, index: u32 },
    LeaveV6 { group: Ipv6Addr, index: u32 },
}

impl SockOpt {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            SockOpt::Nonblocking(..) => "nonblocking",
            SockOpt::ReuseAddress(..) => "SO_REUSEADDR",
            SockOpt::ReusePort(..) => "SO_REUSEPORT",
            SockOpt::OnlyV6(..) => "IPV6_V6ONLY",
            SockOpt::RecvBufferSize(..) => "SO_RCVBUF",
            SockOpt::SendBufferSize(..) => "SO_SNDBUF",
            SockOpt::Keepalive(..) => "SO_KEEPALIVE",
            SockOpt::ReadTimeout(..) => "SO_RCVTIMEO",
            SockOpt::WriteTimeout(..) => "SO_SNDTIMEO",
            SockOpt::MulticastTtlV4(..) => "IP_MULTICAST_TTL",
            SockOpt::MulticastHopsV6(..) => "IPV6_MULTICAST_HOPS",
            SockOpt::MulticastLoopV4(..) => "IP_MULTICAST_LOOP",
            SockOpt::MulticastLoopV6(..) => "IPV6_MULTICAST_LOOP",
            SockOpt::MulticastIfV4(..) => "IP_MULTICAST_IF",
            SockOpt::MulticastIfV6(..) => "IPV6_MULTICAST_IF",
            SockOpt::JoinV4 { .. } => "IP_ADD_MEMBERSHIP",
            SockOpt::LeaveV4 { .. } => "IP_DROP_MEMBERSHIP",
            SockOpt::JoinV6 { .. } => "IPV6_JOIN_GROUP",
            SockOpt::LeaveV6 { .. } => "IPV6_LEAVE_GROUP",
        }
    }
}

pub(crate) fn set_option(socket: &Socket, opt: SockOpt) -> io::Result<()> {
    match opt {
        SockOpt::Nonblocking(v) => socket.set_nonblocking(v),
        SockOpt::ReuseAddress(v) => socket.set_reuse_address(v),
        SockOpt::ReusePort(v) => set_reuse_port(socket, v),
        SockOpt::OnlyV6(v) => socket.set_only_v6(v),
        SockOpt::RecvBufferSize(v) => socket.set_recv_buffer_size(v),
        SockOpt::SendBufferSize(v) => socket.set_send_buffer_size(v),
        SockOpt::Keepalive(v) => socket.set_keepalive(v),
        SockOpt::ReadTimeout(v) => socket.set_read_timeout(v),
        SockOpt::WriteTimeout(v) => socket.set_write_timeout(v),
        SockOpt::MulticastTtlV4(v) => socket.set_multicast_ttl_v4(v),
        SockOpt::MulticastHopsV6(v) => socket.set_multicast_hops_v6(v),
        SockOpt::MulticastLoopV4(v) => socket.set_multicast_loop_v4(v),
        SockOpt::MulticastLoopV6(v) => socket.set_multicast_loop_v6(v),
        SockOpt::MulticastIfV4(v) => socket.set_multicast_if_v4(&v),
        SockOpt::MulticastIfV6(v) => socket.set_multicast_if_v6(v),
        SockOpt::JoinV4 { group, interface } => socket.join_multicast_v4(&group, &interface),
        SockOpt::LeaveV4 { group, interface } => socket.leave_multicast_v4(&group, &interface),
        SockOpt::JoinV6 { group, index } => socket.join_multicast_v6(&group, index),
        SockOpt::LeaveV6 { group, index } => socket.leave_multicast_v6(&group, index),
    }
}

#[cfg(not(any(windows, target_os = "solaris", target_os = "illumos")))]
fn set_reuse_port(socket: &Socket, value: bool) -> io::Result<()> {
    socket.set_reuse_port(value)
}

#[cfg(any(windows, target_os = "solaris", target_os = "illumos"))]
fn set_reuse_port(_socket: &Socket, _value: bool) -> io::Result<()> {
    Err(io::ErrorKind::Unsupported.into())
}

fn as_inet(addr: SockAddr) -> io::Result<SocketAddr> {
    addr.as_socket()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "not an IP socket address"))
}

fn as_uninit(buf: &mut [u8]) -> &mut [MaybeUninit<u8>] {
    // SAFETY: MaybeUninit<u8> has the layout of u8, and the native call only
    // ever writes initialized bytes into the buffer.
    unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) }
}
