//! TCP client connections and listeners.
//!
//! Client side: `Unopened → Connecting → Connected → Closed`.
//! Server side: `Unopened → Bound → Listening → Closed`, each accepted peer
//! getting its own [`Connection`] that starts out `Connected`.

use std::{net::Shutdown, time::Duration};

use backon::{BlockingRetryable, ExponentialBuilder};
use tracing::{debug, trace};

use crate::{
    Error, ErrorKind, SendAllError,
    addr::{Endpoint, ToEndpoints, TryToV4},
    handle::{Canceller, Handle, Protocol, State},
    normalize::{self, NativeClass, Op},
    opts::{ConnectOpts, SocketOpts},
    resolve::try_candidates,
    shim,
};

#[derive(Debug)]
pub struct Connection {
    handle: Handle,
    remote: Endpoint,
    read_closed: bool,
    write_closed: bool,
}

impl Connection {
    /// Connect to the first candidate of `target` that accepts.
    pub fn connect(target: impl ToEndpoints, opts: &SocketOpts) -> crate::Result<Self> {
        Self::connect_with(target, opts, ConnectOpts::default())
    }

    /// Like [`Connection::connect`], giving every candidate `timeout` to
    /// answer before moving on to the next one.
    pub fn connect_timeout(
        target: impl ToEndpoints,
        timeout: Duration,
        opts: &SocketOpts,
    ) -> crate::Result<Self> {
        Self::connect_with(
            target,
            opts,
            ConnectOpts {
                timeout: Some(timeout),
                ..Default::default()
            },
        )
    }

    /// In non-blocking mode the returned connection may still be
    /// [`State::Connecting`]; poll [`Connection::finish_connect`] until it
    /// stops reporting `WouldBlock`. The same holds in blocking mode when a
    /// signal interrupts the connect.
    pub fn connect_with(
        target: impl ToEndpoints,
        opts: &SocketOpts,
        connect_opts: ConnectOpts<'_>,
    ) -> crate::Result<Self> {
        let candidates = target.to_endpoints(opts.family)?;
        try_candidates("connect", &candidates, |candidate| {
            Self::connect_one(candidate, opts, &connect_opts)
        })
    }

    fn connect_one(
        target: Endpoint,
        opts: &SocketOpts,
        connect_opts: &ConnectOpts<'_>,
    ) -> crate::Result<Self> {
        if let Some(source) = connect_opts.source {
            if source.family() != target.family() {
                return Err(Error::InvalidAddress(format!(
                    "source address {source} cannot reach {target}"
                )));
            }
        }

        let mut handle = Handle::open(Protocol::Tcp, target.family(), opts)?;

        if let Some(device) = connect_opts.bind_device {
            let result = device.bind_socket(handle.socket("bind to device")?, target.is_ipv6());
            result.map_err(|e| handle.fail(e, Op::SetOption("bind to device")))?;
        }
        if let Some(source) = connect_opts.source {
            handle.bind(source, false)?;
        }

        handle.set_state(State::Connecting);
        // Non-blocking connects report progress through finish_connect.
        let timeout = connect_opts.timeout.filter(|_| !handle.is_nonblocking());
        trace!(%target, ?timeout, "connecting");
        let result = shim::connect(handle.socket("connect")?, target.to_socket_addr(), timeout);

        let mut conn = Connection {
            handle,
            remote: target,
            read_closed: false,
            write_closed: false,
        };
        match result {
            Ok(()) => conn.established()?,
            Err(e) => match conn.handle.fail(e, Op::Connect(target)) {
                Error::WouldBlock { .. } => trace!(%target, "connect in progress"),
                err => return Err(err),
            },
        }
        Ok(conn)
    }

    fn established(&mut self) -> crate::Result<()> {
        self.handle.set_state(State::Connected);
        let local = self.handle.local_endpoint()?;
        debug!(%local, remote = %self.remote, "connected");
        Ok(())
    }

    /// Complete a non-blocking connect. Returns `WouldBlock` while the
    /// handshake is still running; a failed handshake closes the connection.
    pub fn finish_connect(&mut self) -> crate::Result<()> {
        match self.handle.state() {
            State::Connected => return Ok(()),
            State::Connecting => {}
            state => return Err(Error::invalid_state("finish connect", state)),
        }

        let socket = self.handle.socket("finish connect")?;
        let result = match shim::take_error(socket) {
            Ok(Some(e)) | Err(e) => Err(e),
            Ok(None) => shim::peer_addr(socket).map(|_| ()),
        };
        match result {
            Ok(()) => self.established(),
            Err(e) if normalize::classify(&e) == NativeClass::NotConnected => {
                Err(Error::WouldBlock { op: "connect" })
            }
            Err(e) => {
                let err = self.handle.fail(e, Op::Connect(self.remote));
                self.handle.close();
                Err(err)
            }
        }
    }

    /// Send some prefix of `buf`, returning how much of it was written.
    pub fn send(&mut self, buf: &[u8]) -> crate::Result<usize> {
        if self.write_closed {
            return Err(Error::invalid_state("send after shutdown", self.handle.state()));
        }
        let result = self
            .handle
            .call("send", &[State::Connected], |socket| shim::send(socket, buf))?;
        result.map_err(|e| self.handle.fail(e, Op::Send))
    }

    /// Keep sending until all of `buf` is written. If a send fails midway,
    /// e.g. with `WouldBlock` or `TimedOut`, the error carries how many bytes
    /// already went out.
    pub fn send_all(&mut self, buf: &[u8]) -> Result<usize, SendAllError> {
        let mut sent = 0;
        while sent < buf.len() {
            match self.send(&buf[sent..]) {
                Ok(n) => sent += n,
                Err(error) => {
                    trace!(sent, len = buf.len(), "send_all stopped: {error:#}");
                    return Err(SendAllError { sent, error });
                }
            }
        }
        Ok(sent)
    }

    /// Receive into `buf`, returning the number of bytes read. An orderly
    /// shutdown by the peer is reported as [`Error::ConnectionClosedByPeer`],
    /// and keeps being reported on every later call.
    pub fn receive(&mut self, buf: &mut [u8]) -> crate::Result<usize> {
        self.handle.socket_in("receive", &[State::Connected])?;
        if buf.is_empty() {
            return Ok(0);
        }
        if self.read_closed {
            return Err(Error::ConnectionClosedByPeer);
        }
        let capacity = buf.len();
        let result = self
            .handle
            .call("receive", &[State::Connected], |socket| shim::recv(socket, buf))?;
        match result {
            Ok(0) if self.handle.context().cancelled => {
                self.handle.close();
                Err(Error::Cancelled { op: "receive" })
            }
            Ok(0) => {
                trace!(remote = %self.remote, "peer closed the connection");
                self.read_closed = true;
                Err(Error::ConnectionClosedByPeer)
            }
            Ok(n) => Ok(n),
            Err(e) => Err(self.handle.fail(e, Op::Receive { capacity })),
        }
    }

    /// Half-close: the peer sees end of stream, receiving keeps working.
    /// Calling it again is a no-op.
    pub fn shutdown_write(&mut self) -> crate::Result<()> {
        self.handle.socket_in("shutdown", &[State::Connected])?;
        if self.write_closed {
            return Ok(());
        }
        self.handle.shutdown(Shutdown::Write)?;
        self.write_closed = true;
        Ok(())
    }

    pub fn close(&mut self) {
        self.handle.close();
    }

    pub fn local_endpoint(&self) -> crate::Result<Endpoint> {
        self.handle.local_endpoint()
    }

    pub fn remote_endpoint(&self) -> crate::Result<Endpoint> {
        self.handle.socket("read remote address")?;
        Ok(self.remote)
    }

    pub fn state(&self) -> State {
        self.handle.state()
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn set_nonblocking(&mut self, nonblocking: bool) -> crate::Result<()> {
        self.handle.set_nonblocking(nonblocking)
    }

    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) -> crate::Result<()> {
        self.handle.set_option(shim::SockOpt::ReadTimeout(timeout))
    }

    pub fn set_write_timeout(&mut self, timeout: Option<Duration>) -> crate::Result<()> {
        self.handle.set_option(shim::SockOpt::WriteTimeout(timeout))
    }

    pub fn canceller(&self) -> Canceller {
        self.handle.canceller()
    }

    /// Hand the connection over to a tokio runtime. Must be called from
    /// within one.
    #[cfg(feature = "tokio")]
    pub fn into_tokio(self) -> crate::Result<tokio::net::TcpStream> {
        if self.handle.state() != State::Connected {
            return Err(Error::invalid_state("convert to tokio", self.handle.state()));
        }
        let nonblocking = self.handle.is_nonblocking();
        let socket = self.handle.into_socket("convert to tokio")?;
        let context = normalize::Context {
            blocking: !nonblocking,
            cancelled: false,
        };
        socket
            .set_nonblocking(true)
            .map_err(|e| normalize::normalize(e, Op::SetOption("nonblocking"), context))?;
        tokio::net::TcpStream::from_std(socket.into())
            .map_err(|e| normalize::normalize(e, Op::Register, context))
    }
}

/// A bound, listening TCP socket.
#[derive(Debug)]
pub struct Listener {
    handle: Handle,
    local: Endpoint,
    dualstack: bool,
}

impl Listener {
    /// Bind to the first candidate of `target` that works and start
    /// listening. `backlog` bounds the kernel queue of pending peers.
    pub fn listen(target: impl ToEndpoints, backlog: i32, opts: &SocketOpts) -> crate::Result<Self> {
        let candidates = target.to_endpoints(opts.family)?;
        try_candidates("listen", &candidates, |candidate| {
            Self::listen_one(candidate, backlog, opts)
        })
    }

    fn listen_one(addr: Endpoint, backlog: i32, opts: &SocketOpts) -> crate::Result<Self> {
        let mut handle = Handle::open(Protocol::Tcp, addr.family(), opts)?;
        let bound = handle.bind(addr, opts.request_dualstack)?;
        let result = shim::listen(handle.socket("listen")?, backlog);
        result.map_err(|e| handle.fail(e, Op::Listen))?;
        handle.set_state(State::Listening);
        debug!(
            addr = %bound.local,
            requested_addr = %addr,
            dualstack = bound.dualstack,
            backlog,
            "listening on TCP"
        );
        Ok(Self {
            handle,
            local: bound.local,
            dualstack: bound.dualstack,
        })
    }

    /// Wait for the next peer. The accepted connection gets its own handle
    /// in the listener's blocking mode.
    pub fn accept(&mut self) -> crate::Result<Connection> {
        let result = self
            .handle
            .call("accept", &[State::Listening], shim::accept)?;
        let (socket, peer) = result.map_err(|e| self.handle.fail(e, Op::Accept))?;
        let remote = Endpoint::from(peer.try_to_ipv4());
        let handle =
            Handle::from_accepted(socket, self.handle.family(), self.handle.is_nonblocking())?;
        trace!(%remote, local = %self.local, "accepted");
        Ok(Connection {
            handle,
            remote,
            read_closed: false,
            write_closed: false,
        })
    }

    /// Accept, retrying failures that only concern a single pending peer or
    /// a momentary shortage of descriptors with exponential backoff capped
    /// at `max_delay`.
    pub fn accept_with_backoff(&mut self, max_delay: Duration) -> crate::Result<Connection> {
        (|| self.accept())
            .retry(
                ExponentialBuilder::default()
                    .without_max_times()
                    .with_max_delay(max_delay),
            )
            .sleep(std::thread::sleep)
            .when(|e: &Error| {
                matches!(
                    e.kind(),
                    ErrorKind::ResourceExhausted | ErrorKind::ConnectionReset
                )
            })
            .notify(|e, retry_in| trace!(?retry_in, "error accepting: {e:#}"))
            .call()
    }

    pub fn local_endpoint(&self) -> crate::Result<Endpoint> {
        self.handle.socket("read local address")?;
        Ok(self.local)
    }

    /// Whether IPv4 peers can reach this listener through an IPv6 socket.
    pub fn is_dualstack(&self) -> bool {
        self.dualstack
    }

    pub fn state(&self) -> State {
        self.handle.state()
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn set_nonblocking(&mut self, nonblocking: bool) -> crate::Result<()> {
        self.handle.set_nonblocking(nonblocking)
    }

    pub fn canceller(&self) -> Canceller {
        self.handle.canceller()
    }

    pub fn close(&mut self) {
        self.handle.close();
    }

    /// Hand the listener over to a tokio runtime. Must be called from within
    /// one.
    #[cfg(feature = "tokio")]
    pub fn into_tokio(self) -> crate::Result<tokio::net::TcpListener> {
        let socket = self.handle.into_socket("convert to tokio")?;
        let context = normalize::Context::default();
        socket
            .set_nonblocking(true)
            .map_err(|e| normalize::normalize(e, Op::SetOption("nonblocking"), context))?;
        tokio::net::TcpListener::from_std(socket.into())
            .map_err(|e| normalize::normalize(e, Op::Register, context))
    }
}
