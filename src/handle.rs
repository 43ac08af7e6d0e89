//! The owning wrapper around one native socket.
//!
//! A [`Handle`] holds at most one descriptor and releases it exactly once,
//! either on [`Handle::close`] or when dropped. Once closed, every operation
//! fails with [`Error::InvalidState`] and never reaches the native API.

use std::{
    fmt, io,
    net::{IpAddr, Ipv6Addr, Shutdown},
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

#[cfg(unix)]
use std::os::fd::{AsRawFd, RawFd};
#[cfg(windows)]
use std::os::windows::io::{AsRawSocket, RawSocket};

use socket2::{SockRef, Socket};
#[cfg(windows)]
use windows_sys::Win32::Networking::WinSock::INVALID_SOCKET;
use tracing::{debug, trace};

use crate::{
    Error,
    addr::{Endpoint, Family},
    normalize::{self, Context, Op},
    opts::SocketOpts,
    platform,
    shim::{self, SockOpt},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("TCP"),
            Protocol::Udp => f.write_str("UDP"),
        }
    }
}

/// Lifecycle of a handle. Everything between `Unopened` and `Closed` counts
/// as open.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum State {
    Unopened,
    Open,
    Bound,
    Connecting,
    Connected,
    Listening,
    Closed,
}

impl State {
    pub fn is_open(self) -> bool {
        !matches!(self, State::Unopened | State::Closed)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Unopened => "unopened",
            State::Open => "open",
            State::Bound => "bound",
            State::Connecting => "connecting",
            State::Connected => "connected",
            State::Listening => "listening",
            State::Closed => "closed",
        };
        f.write_str(s)
    }
}

pub struct Handle {
    socket: Option<Arc<Socket>>,
    protocol: Protocol,
    family: Family,
    state: State,
    nonblocking: bool,
    cancelled: Arc<AtomicBool>,
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("protocol", &self.protocol)
            .field("family", &self.family)
            .field("state", &self.state())
            .field("nonblocking", &self.nonblocking)
            .finish()
    }
}

/// What a bind actually produced.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Bound {
    pub local: Endpoint,
    pub dualstack: bool,
}

impl Handle {
    /// Create a native socket and apply `opts` to it. If any required option
    /// fails the descriptor is released before the error is returned.
    pub(crate) fn open(protocol: Protocol, family: Family, opts: &SocketOpts) -> crate::Result<Self> {
        platform::initialize()?;
        let socket = shim::create(family, protocol)
            .map_err(|e| normalize::normalize(e, Op::Create, Context::default()))?;
        let mut handle = Self {
            socket: Some(Arc::new(socket)),
            protocol,
            family,
            state: State::Open,
            nonblocking: opts.nonblocking,
            cancelled: Default::default(),
        };
        handle.configure(opts)?;
        trace!(%protocol, %family, nonblocking = opts.nonblocking, "opened socket");
        Ok(handle)
    }

    fn configure(&mut self, opts: &SocketOpts) -> crate::Result<()> {
        if opts.nonblocking {
            self.set_option(SockOpt::Nonblocking(true))?;
        }

        // On Windows SO_REUSEADDR lets another process steal a listening port.
        let reuse_address =
            opts.reuse_address && !(cfg!(windows) && self.protocol == Protocol::Tcp);
        if reuse_address {
            self.set_option(SockOpt::ReuseAddress(true))?;
        }
        if opts.reuse_port {
            self.set_option(SockOpt::ReusePort(true))?;
        }

        let hints = [
            opts.recv_buffer_size.map(SockOpt::RecvBufferSize),
            opts.send_buffer_size.map(SockOpt::SendBufferSize),
        ];
        for opt in hints.into_iter().flatten() {
            if let Err(e) = self.set_option(opt) {
                debug!(option = opt.name(), "ignoring buffer size hint: {e:#}");
            }
        }

        if opts.keepalive && self.protocol == Protocol::Tcp {
            self.set_option(SockOpt::Keepalive(true))?;
        }
        if opts.read_timeout.is_some() {
            self.set_option(SockOpt::ReadTimeout(opts.read_timeout))?;
        }
        if opts.write_timeout.is_some() {
            self.set_option(SockOpt::WriteTimeout(opts.write_timeout))?;
        }
        Ok(())
    }

    /// Wrap a socket returned by accept. It inherits the listener's blocking
    /// mode.
    pub(crate) fn from_accepted(
        socket: Socket,
        family: Family,
        nonblocking: bool,
    ) -> crate::Result<Self> {
        let mut handle = Self {
            socket: Some(Arc::new(socket)),
            protocol: Protocol::Tcp,
            family,
            state: State::Connected,
            nonblocking: false,
            cancelled: Default::default(),
        };
        handle.set_nonblocking(nonblocking)?;
        Ok(handle)
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn state(&self) -> State {
        if self.socket.is_some() && self.cancelled.load(Ordering::Acquire) {
            return State::Closed;
        }
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    pub fn is_nonblocking(&self) -> bool {
        self.nonblocking
    }

    pub fn set_nonblocking(&mut self, nonblocking: bool) -> crate::Result<()> {
        self.set_option(SockOpt::Nonblocking(nonblocking))?;
        self.nonblocking = nonblocking;
        Ok(())
    }

    pub(crate) fn set_state(&mut self, state: State) {
        if self.state != state {
            trace!(protocol = %self.protocol, from = %self.state, to = %state, "state change");
            self.state = state;
        }
    }

    /// The native socket, if the handle is open at all.
    pub(crate) fn socket(&self, op: &'static str) -> crate::Result<&Socket> {
        let state = self.state();
        match &self.socket {
            Some(socket) if state.is_open() => Ok(socket),
            _ => Err(Error::invalid_state(op, state)),
        }
    }

    /// The native socket, if the handle is in one of `allowed`.
    pub(crate) fn socket_in(&self, op: &'static str, allowed: &[State]) -> crate::Result<&Socket> {
        let state = self.state();
        if !allowed.contains(&state) {
            return Err(Error::invalid_state(op, state));
        }
        self.socket(op)
    }

    /// Run a native call on the socket if the handle is in one of
    /// `allowed`. A call interrupted by a signal is restarted unless the
    /// handle was cancelled, in which case the interruption is returned.
    pub(crate) fn call<T>(
        &self,
        op: &'static str,
        allowed: &[State],
        mut native: impl FnMut(&Socket) -> io::Result<T>,
    ) -> crate::Result<io::Result<T>> {
        let socket = self.socket_in(op, allowed)?;
        loop {
            match native(socket) {
                Err(e)
                    if e.kind() == io::ErrorKind::Interrupted
                        && !self.cancelled.load(Ordering::Acquire) =>
                {
                    trace!(protocol = %self.protocol, op, "interrupted by a signal, restarting");
                }
                result => return Ok(result),
            }
        }
    }

    /// Borrow the native socket, e.g. for options this crate doesn't wrap.
    /// Ownership stays with the handle.
    pub fn native(&self) -> crate::Result<SockRef<'_>> {
        self.socket("borrow native socket").map(SockRef::from)
    }

    pub(crate) fn context(&self) -> Context {
        Context {
            blocking: !self.nonblocking,
            cancelled: self.cancelled.load(Ordering::Acquire),
        }
    }

    /// Normalize a native failure. Failures that leave the socket unusable
    /// close the handle, so it is never left half alive.
    pub(crate) fn fail(&mut self, err: std::io::Error, op: Op) -> Error {
        let err = normalize::normalize(err, op, self.context());
        let fatal = match err {
            Error::Cancelled { .. } => true,
            // A reset of a pending peer doesn't affect the listener, and
            // Windows reports ICMP port unreachable on UDP sockets this way.
            Error::ConnectionReset { .. } => {
                self.protocol == Protocol::Tcp && !matches!(op, Op::Accept)
            }
            _ => false,
        };
        if fatal {
            debug!(protocol = %self.protocol, "closing after fatal error: {err:#}");
            self.close();
        }
        err
    }

    pub(crate) fn set_option(&mut self, opt: SockOpt) -> crate::Result<()> {
        let name = opt.name();
        let result = shim::set_option(self.socket(name)?, opt);
        result.map_err(|e| self.fail(e, Op::SetOption(name)))
    }

    /// Bind to `addr`. For the IPv6 unspecified address `request_dualstack`
    /// decides whether IPv4 peers are accepted as well; for every other
    /// address it's ignored.
    pub(crate) fn bind(&mut self, addr: Endpoint, request_dualstack: bool) -> crate::Result<Bound> {
        self.socket_in("bind", &[State::Open])?;
        if addr.family() != self.family {
            return Err(Error::InvalidAddress(format!(
                "cannot bind {} socket to {addr}",
                self.family
            )));
        }

        let dualstack = match addr.ip() {
            IpAddr::V6(ip) if ip == Ipv6Addr::UNSPECIFIED => {
                let only_v6 = !request_dualstack;
                trace!(%addr, only_v6, "setting only_v6");
                self.set_option(SockOpt::OnlyV6(only_v6))?;
                request_dualstack
            }
            _ => {
                if request_dualstack {
                    trace!(%addr, "ignored dualstack request as it only applies to [::] address");
                }
                false
            }
        };

        let result = shim::bind(self.socket("bind")?, addr.to_socket_addr());
        if let Err(e) = result {
            trace!(%addr, "error binding: {e:#}");
            return Err(self.fail(e, Op::Bind(addr)));
        }

        let local = self.local_endpoint()?;
        if local.family() != addr.family() {
            debug!(%local, bind_addr = %addr, "mismatch between local_addr() and requested bind_addr");
            return Err(Error::BindFailed {
                addr,
                reason: "bound address has a different family",
            });
        }
        self.set_state(State::Bound);
        Ok(Bound {
            local,
            dualstack,
        })
    }

    /// The address the kernel assigned, e.g. after binding port 0.
    pub fn local_endpoint(&self) -> crate::Result<Endpoint> {
        shim::local_addr(self.socket("read local address")?)
            .map(Endpoint::from)
            .map_err(|e| normalize::normalize(e, Op::LocalAddr, self.context()))
    }

    pub(crate) fn shutdown(&mut self, how: Shutdown) -> crate::Result<()> {
        let result = shim::shutdown(self.socket("shutdown")?, how);
        result.map_err(|e| self.fail(e, Op::Shutdown))
    }

    /// Release the descriptor. Closing twice is a no-op.
    pub fn close(&mut self) {
        if let Some(socket) = self.socket.take() {
            // A canceller may still hold a short-lived strong reference, in
            // which case the descriptor goes away when it lets go.
            if let Ok(socket) = Arc::try_unwrap(socket) {
                shim::close(socket);
            }
            trace!(protocol = %self.protocol, from = %self.state, "closed socket");
        }
        self.state = State::Closed;
    }

    /// A token that can abort blocking operations on this handle from
    /// another thread.
    pub fn canceller(&self) -> Canceller {
        Canceller {
            socket: self.socket.as_ref().map(Arc::downgrade).unwrap_or_default(),
            cancelled: self.cancelled.clone(),
        }
    }

    /// Give up ownership of the descriptor, leaving the handle closed.
    #[cfg_attr(not(feature = "tokio"), allow(dead_code))]
    pub(crate) fn into_socket(mut self, op: &'static str) -> crate::Result<Socket> {
        let state = self.state();
        self.socket(op)?;
        let Some(socket) = self.socket.take() else {
            return Err(Error::invalid_state(op, state));
        };
        self.state = State::Closed;
        Arc::try_unwrap(socket).map_err(|_| Error::invalid_state(op, state))
    }
}

#[cfg(unix)]
impl AsRawFd for Handle {
    /// `-1` once the handle is closed.
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_ref().map_or(-1, |socket| socket.as_raw_fd())
    }
}

#[cfg(windows)]
impl AsRawSocket for Handle {
    /// `INVALID_SOCKET` once the handle is closed.
    fn as_raw_socket(&self) -> RawSocket {
        self.socket
            .as_ref()
            .map_or(INVALID_SOCKET as RawSocket, |socket| socket.as_raw_socket())
    }
}

/// Cancels blocking operations of one [`Handle`] from another thread.
///
/// [`Canceller::cancel`] shuts the socket down, which wakes up a blocked
/// `accept`, `receive` or `send` on platforms that support it (Linux does for
/// all of them; Windows and macOS may not wake a blocked `accept`). The
/// interrupted call fails with [`Error::Cancelled`]; every later call fails
/// with [`Error::InvalidState`].
#[derive(Clone, Debug)]
pub struct Canceller {
    socket: Weak<Socket>,
    cancelled: Arc<AtomicBool>,
}

impl Canceller {
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(socket) = self.socket.upgrade() {
            if let Err(e) = shim::shutdown(&socket, Shutdown::Both) {
                trace!("shutdown on cancel: {e:#}");
            }
        }
        debug!("socket cancelled");
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
