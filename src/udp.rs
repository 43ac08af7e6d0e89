//! Unicast UDP endpoints.
//!
//! Every send may name its own destination. Setting a default peer puts the
//! endpoint into connected mode: [`DatagramEndpoint::send`] goes to that peer
//! and [`DatagramEndpoint::receive`] only returns datagrams coming from it.
//! The peer filter lives in this crate rather than in the kernel, so the
//! native socket stays unconnected and [`DatagramEndpoint::send_to`] /
//! [`DatagramEndpoint::receive_from`] keep working for any peer.

use std::{net::SocketAddr, time::Duration};

use tracing::{debug, trace};

use crate::{
    Error,
    addr::{Endpoint, Family, FamilyPreference, ToEndpoints, ToV6Mapped, TryToV4},
    handle::{Canceller, Handle, Protocol, State},
    multicast::Memberships,
    normalize::Op,
    opts::SocketOpts,
    resolve::try_candidates,
    shim::{self, SockOpt},
};

#[derive(Debug)]
pub struct DatagramEndpoint {
    pub(crate) handle: Handle,
    local: Endpoint,
    dualstack: bool,
    default_peer: Option<Endpoint>,
    pub(crate) memberships: Memberships,
}

const OPEN_STATES: &[State] = &[State::Bound, State::Connected];

impl DatagramEndpoint {
    /// Bind to the first candidate of `target` that works. Use port 0 for an
    /// ephemeral port.
    pub fn bind(target: impl ToEndpoints, opts: &SocketOpts) -> crate::Result<Self> {
        let candidates = target.to_endpoints(opts.family)?;
        try_candidates("bind", &candidates, |candidate| {
            Self::bind_one(candidate, opts)
        })
    }

    fn bind_one(addr: Endpoint, opts: &SocketOpts) -> crate::Result<Self> {
        let mut handle = Handle::open(Protocol::Udp, addr.family(), opts)?;
        let bound = handle.bind(addr, opts.request_dualstack)?;
        debug!(
            addr = %bound.local,
            requested_addr = %addr,
            dualstack = bound.dualstack,
            "listening on UDP"
        );
        Ok(Self {
            handle,
            local: bound.local,
            dualstack: bound.dualstack,
            default_peer: None,
            memberships: Memberships::default(),
        })
    }

    /// Enter connected mode. The first candidate this endpoint can reach
    /// becomes the default peer.
    pub fn set_default_peer(&mut self, peer: impl ToEndpoints) -> crate::Result<()> {
        self.handle.socket_in("set default peer", OPEN_STATES)?;
        let mut reachable = Err(Error::InvalidAddress("no default peer candidates".to_owned()));
        for candidate in peer.to_endpoints(FamilyPreference::Any)? {
            reachable = self.destination(candidate).map(|_| candidate);
            if reachable.is_ok() {
                break;
            }
        }
        let peer = reachable?;
        trace!(%peer, "default peer set");
        self.default_peer = Some(peer);
        self.handle.set_state(State::Connected);
        Ok(())
    }

    /// Leave connected mode.
    pub fn clear_default_peer(&mut self) -> crate::Result<()> {
        self.handle.socket_in("clear default peer", OPEN_STATES)?;
        self.default_peer = None;
        self.handle.set_state(State::Bound);
        Ok(())
    }

    pub fn default_peer(&self) -> Option<Endpoint> {
        self.default_peer
    }

    /// Send one datagram to the default peer.
    pub fn send(&mut self, buf: &[u8]) -> crate::Result<usize> {
        let peer = self
            .default_peer
            .ok_or_else(|| Error::invalid_state("send without a default peer", self.state()))?;
        self.send_to(buf, peer)
    }

    /// Send one datagram to `target`. Returns the number of bytes sent,
    /// which for UDP is all of `buf` or an error.
    pub fn send_to(&mut self, buf: &[u8], target: impl Into<Endpoint>) -> crate::Result<usize> {
        let target = target.into();
        self.handle.socket_in("send", OPEN_STATES)?;
        let addr = self.destination(target)?;
        trace!(%target, len = buf.len(), "sending");
        let result = self
            .handle
            .call("send", OPEN_STATES, |socket| shim::send_to(socket, buf, addr))?;
        result.map_err(|e| self.handle.fail(e, Op::Send))
    }

    fn destination(&self, target: Endpoint) -> crate::Result<SocketAddr> {
        match (self.handle.family(), target.family()) {
            (local, remote) if local == remote => Ok(target.to_socket_addr()),
            (Family::V6, Family::V4) if self.dualstack => {
                Ok(SocketAddr::V6(target.to_socket_addr().to_ipv6_mapped()))
            }
            (local, _) => Err(Error::InvalidAddress(format!(
                "cannot send to {target} from a non-dualstack {local} socket"
            ))),
        }
    }

    /// Receive one datagram. In connected mode datagrams from anyone but the
    /// default peer are dropped.
    pub fn receive(&mut self, buf: &mut [u8]) -> crate::Result<usize> {
        loop {
            let (len, from) = self.receive_from(buf)?;
            match self.default_peer {
                Some(peer) if peer != from => {
                    trace!(%from, %peer, "dropping datagram from unexpected sender");
                }
                _ => return Ok(len),
            }
        }
    }

    /// Receive one datagram and its sender. A datagram larger than `buf` is
    /// consumed and reported as [`Error::MessageTruncated`].
    pub fn receive_from(&mut self, buf: &mut [u8]) -> crate::Result<(usize, Endpoint)> {
        let capacity = buf.len();
        let result = self
            .handle
            .call("receive", OPEN_STATES, |socket| shim::recv_from(socket, buf))?;
        let datagram = result.map_err(|e| self.handle.fail(e, Op::Receive { capacity }))?;
        let from = Endpoint::from(datagram.from.try_to_ipv4());
        if datagram.truncated {
            debug!(%from, capacity, "datagram truncated");
            return Err(Error::MessageTruncated { capacity });
        }
        Ok((datagram.len, from))
    }

    /// Leave every multicast group and release the socket. Closing twice is
    /// a no-op.
    pub fn close(&mut self) {
        self.leave_all_multicast();
        self.default_peer = None;
        self.handle.close();
    }

    pub fn local_endpoint(&self) -> crate::Result<Endpoint> {
        self.handle.socket("read local address")?;
        Ok(self.local)
    }

    /// Whether this endpoint talks to IPv4 peers through an IPv6 socket.
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

    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) -> crate::Result<()> {
        self.handle.set_option(SockOpt::ReadTimeout(timeout))
    }

    pub fn set_write_timeout(&mut self, timeout: Option<Duration>) -> crate::Result<()> {
        self.handle.set_option(SockOpt::WriteTimeout(timeout))
    }

    pub fn canceller(&self) -> Canceller {
        self.handle.canceller()
    }

    /// Hand the endpoint over to a tokio runtime. Joined multicast groups
    /// stay joined. Must be called from within a runtime.
    #[cfg(feature = "tokio")]
    pub fn into_tokio(self) -> crate::Result<tokio::net::UdpSocket> {
        use crate::normalize::{self, Context};

        let socket = self.handle.into_socket("convert to tokio")?;
        let context = Context::default();
        socket
            .set_nonblocking(true)
            .map_err(|e| normalize::normalize(e, Op::SetOption("nonblocking"), context))?;
        tokio::net::UdpSocket::from_std(socket.into())
            .map_err(|e| normalize::normalize(e, Op::Register, context))
    }
}
