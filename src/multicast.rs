//! Multicast group membership on [`DatagramEndpoint`]s.
//!
//! Joins are tracked per endpoint, keyed by group and resolved interface.
//! Joining a group that is already joined on the same interface hands back
//! the existing [`Membership`] without asking the kernel again, since
//! platforms disagree on whether a second join is an error. Closing the
//! endpoint leaves every group it joined.


use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    str::FromStr,
    sync::atomic::{AtomicU64, Ordering},
};

use tracing::{debug, trace};

use crate::{
    Error,
    addr::{Endpoint, Family},
    constants::{
        IPV4_MULTICAST_NET, IPV4_MULTICAST_PREFIX_LEN, IPV6_LINK_LOCAL_MCAST_NET,
        IPV6_MULTICAST_NET, IPV6_MULTICAST_PREFIX_LEN, IPV6_SCOPE_MASK, IPV6_SITE_LOCAL_MCAST_NET,
    },
    iface::{Interface, list_interfaces},
    opts::SocketOpts,
    resolve::is_unicast_link_local,
    shim::SockOpt,
    udp::DatagramEndpoint,
};

/// Which interface a group is joined on, or multicast is sent through.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum MulticastInterface {
    /// Let the OS pick.
    #[default]
    Any,
    /// The interface that has this address assigned. For IPv4 groups this is
    /// passed to the kernel as is.
    Addr(IpAddr),
    Index(u32),
    Name(String),
}

impl MulticastInterface {
    fn resolve(&self, family: Family) -> crate::Result<ResolvedInterface> {
        let resolved = match (family, self) {
            (Family::V4, MulticastInterface::Any) => ResolvedInterface::V4(Ipv4Addr::UNSPECIFIED),
            (Family::V4, MulticastInterface::Addr(IpAddr::V4(addr))) => {
                ResolvedInterface::V4(*addr)
            }
            (Family::V4, MulticastInterface::Addr(IpAddr::V6(addr))) => {
                return Err(Error::InvalidAddress(format!(
                    "{addr} cannot select an interface for an IPv4 group"
                )));
            }
            (Family::V4, MulticastInterface::Index(index)) => {
                ResolvedInterface::V4(first_v4(Interface::by_index(*index)?)?)
            }
            (Family::V4, MulticastInterface::Name(name)) => {
                ResolvedInterface::V4(first_v4(Interface::by_name(name)?)?)
            }
            (Family::V6, MulticastInterface::Any) => ResolvedInterface::V6(0),
            (Family::V6, MulticastInterface::Addr(addr)) => {
                ResolvedInterface::V6(Interface::by_addr(*addr)?.index)
            }
            (Family::V6, MulticastInterface::Index(index)) => ResolvedInterface::V6(*index),
            (Family::V6, MulticastInterface::Name(name)) => {
                ResolvedInterface::V6(Interface::by_name(name)?.index)
            }
        };
        Ok(resolved)
    }
}

fn first_v4(nic: Interface) -> crate::Result<Ipv4Addr> {
    nic.first_v4().ok_or_else(|| {
        Error::InvalidAddress(format!("interface {} has no IPv4 address", nic.name))
    })
}

/// `""`/`any`, an IP address, an interface index or an interface name.
impl FromStr for MulticastInterface {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("any") {
            return Ok(MulticastInterface::Any);
        }
        if let Ok(addr) = s.parse::<IpAddr>() {
            return Ok(MulticastInterface::Addr(addr));
        }
        if let Ok(index) = s.parse::<u32>() {
            return Ok(MulticastInterface::Index(index));
        }
        Ok(MulticastInterface::Name(s.to_owned()))
    }
}

/// The interface as the kernel sees it: an IPv4 address, or an IPv6
/// interface index (0 meaning "any").
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResolvedInterface {
    V4(Ipv4Addr),
    V6(u32),
}

impl fmt::Display for ResolvedInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolvedInterface::V4(addr) => write!(f, "{addr}"),
            ResolvedInterface::V6(index) => write!(f, "#{index}"),
        }
    }
}

static NEXT_MEMBERSHIP_ID: AtomicU64 = AtomicU64::new(1);

/// One joined group on one interface of one endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Membership {
    id: u64,
    group: IpAddr,
    interface: ResolvedInterface,
}

impl Membership {
    pub fn group(&self) -> IpAddr {
        self.group
    }

    pub fn interface(&self) -> ResolvedInterface {
        self.interface
    }

    fn sockopt(&self, join: bool) -> crate::Result<SockOpt> {
        let opt = match (self.group, self.interface, join) {
            (IpAddr::V4(group), ResolvedInterface::V4(interface), true) => {
                SockOpt::JoinV4 { group, interface }
            }
            (IpAddr::V4(group), ResolvedInterface::V4(interface), false) => {
                SockOpt::LeaveV4 { group, interface }
            }
            (IpAddr::V6(group), ResolvedInterface::V6(index), true) => {
                SockOpt::JoinV6 { group, index }
            }
            (IpAddr::V6(group), ResolvedInterface::V6(index), false) => {
                SockOpt::LeaveV6 { group, index }
            }
            (group, interface, _) => {
                return Err(Error::InvalidAddress(format!(
                    "interface {interface} cannot carry group {group}"
                )));
            }
        };
        Ok(opt)
    }
}

#[derive(Debug, Default)]
pub(crate) struct Memberships {
    joined: Vec<Membership>,
}

impl Memberships {
    fn find(&self, group: IpAddr, interface: ResolvedInterface) -> Option<Membership> {
        self.joined
            .iter()
            .find(|m| m.group == group && m.interface == interface)
            .copied()
    }

    fn position(&self, membership: &Membership) -> Option<usize> {
        self.joined.iter().position(|m| m.id == membership.id)
    }
}

impl DatagramEndpoint {
    /// Create an endpoint for receiving `group`: bound to the unspecified
    /// address at the group's port, joined on `interface`, with loopback of
    /// own datagrams enabled.
    pub fn open_multicast(
        group: Endpoint,
        interface: &MulticastInterface,
        opts: &SocketOpts,
    ) -> crate::Result<Self> {
        check_group(group.ip())?;
        let opts = SocketOpts {
            reuse_address: true,
            request_dualstack: false,
            ..opts.clone()
        };
        let bind_addr = Endpoint::new(group.family().unspecified(), group.port());
        let mut endpoint = DatagramEndpoint::bind(bind_addr, &opts)?;
        endpoint.join_multicast(group.ip(), interface)?;
        endpoint.set_multicast_loopback(true)?;
        Ok(endpoint)
    }

    /// Join `group` on `interface`. Joining again returns the existing
    /// membership.
    pub fn join_multicast(
        &mut self,
        group: IpAddr,
        interface: &MulticastInterface,
    ) -> crate::Result<Membership> {
        self.handle.socket("join multicast group")?;
        check_group(group)?;
        let family = self.handle.family();
        if Family::of(&group) != family {
            return Err(Error::InvalidAddress(format!(
                "cannot join {group} on an {family} socket"
            )));
        }
        let interface = interface.resolve(family)?;

        if let Some(existing) = self.memberships.find(group, interface) {
            trace!(%group, %interface, "multicast group already joined");
            return Ok(existing);
        }

        let membership = Membership {
            id: NEXT_MEMBERSHIP_ID.fetch_add(1, Ordering::Relaxed),
            group,
            interface,
        };
        trace!(multiaddr = %group, %interface, "joining multicast group");
        self.handle.set_option(membership.sockopt(true)?)?;
        self.memberships.joined.push(membership);
        debug!(multiaddr = %group, %interface, "joined multicast group");
        Ok(membership)
    }

    /// Leave a group joined through this endpoint.
    pub fn leave_multicast(&mut self, membership: Membership) -> crate::Result<()> {
        self.handle.socket("leave multicast group")?;
        let Some(pos) = self.memberships.position(&membership) else {
            return Err(Error::InvalidAddress(format!(
                "{} on {} is not a membership of this endpoint",
                membership.group, membership.interface
            )));
        };
        self.handle.set_option(membership.sockopt(false)?)?;
        self.memberships.joined.remove(pos);
        debug!(
            multiaddr = %membership.group,
            interface = %membership.interface,
            "left multicast group"
        );
        Ok(())
    }

    /// Groups currently joined, in join order. Empty once the endpoint is
    /// closed.
    pub fn memberships(&self) -> &[Membership] {
        &self.memberships.joined
    }

    pub(crate) fn leave_all_multicast(&mut self) {
        for membership in std::mem::take(&mut self.memberships.joined) {
            let result = membership
                .sockopt(false)
                .and_then(|opt| self.handle.set_option(opt));
            if let Err(e) = result {
                debug!(
                    multiaddr = %membership.group,
                    interface = %membership.interface,
                    "error leaving multicast group: {e:#}"
                );
            }
        }
    }

    /// Hop limit of outgoing multicast datagrams.
    pub fn set_multicast_ttl(&mut self, ttl: u8) -> crate::Result<()> {
        let opt = match self.handle.family() {
            Family::V4 => SockOpt::MulticastTtlV4(ttl.into()),
            Family::V6 => SockOpt::MulticastHopsV6(ttl.into()),
        };
        self.handle.set_option(opt)
    }

    /// Whether datagrams sent to a group are delivered back to this host.
    pub fn set_multicast_loopback(&mut self, enabled: bool) -> crate::Result<()> {
        let opt = match self.handle.family() {
            Family::V4 => SockOpt::MulticastLoopV4(enabled),
            Family::V6 => SockOpt::MulticastLoopV6(enabled),
        };
        self.handle.set_option(opt)
    }

    /// Interface outgoing multicast datagrams leave through.
    pub fn set_multicast_interface(&mut self, interface: &MulticastInterface) -> crate::Result<()> {
        self.handle.socket("set multicast interface")?;
        let opt = match interface.resolve(self.handle.family())? {
            ResolvedInterface::V4(addr) => SockOpt::MulticastIfV4(addr),
            ResolvedInterface::V6(index) => SockOpt::MulticastIfV6(index),
        };
        self.handle.set_option(opt)
    }

    /// Send one datagram to `group` through `interface`.
    pub fn send_to_group_via(
        &mut self,
        buf: &[u8],
        group: Endpoint,
        interface: &MulticastInterface,
    ) -> crate::Result<usize> {
        check_group(group.ip())?;
        if let Err(e) = self.set_multicast_interface(interface) {
            debug!(?interface, "error setting multicast interface: {e:#}");
            return Err(e);
        }
        self.send_to(buf, group)
    }

    /// Join `group` on every interface that can carry it: for IPv4 the
    /// default interface plus every private, non-loopback address; for IPv6
    /// every interface with an address in the group's scope. Failures on
    /// single interfaces are logged and skipped; it's an error only if no
    /// join succeeded.
    pub fn join_all_interfaces(&mut self, group: IpAddr) -> crate::Result<Vec<Membership>> {
        self.handle.socket("join multicast group")?;
        check_group(group)?;
        let family = self.handle.family();
        if Family::of(&group) != family {
            return Err(Error::InvalidAddress(format!(
                "cannot join {group} on an {family} socket"
            )));
        }

        let mut candidates = Vec::new();
        match group {
            IpAddr::V4(_) => {
                candidates.push(MulticastInterface::Any);
                for nic in list_interfaces() {
                    for addr in nic.addrs {
                        match addr {
                            IpAddr::V4(a) if a.is_private() && !a.is_loopback() => {
                                candidates.push(MulticastInterface::Addr(addr));
                            }
                            _ => trace!(oif_id = nic.index, %addr, "ignoring address"),
                        }
                    }
                }
            }
            IpAddr::V6(group) => {
                let link_local_group = ipv6_is_link_local_mcast(group);
                for nic in list_interfaces() {
                    let mut has_link_local = false;
                    let mut has_wider = false;
                    for addr in nic.addrs.iter() {
                        match addr {
                            IpAddr::V6(a) if a.is_loopback() => continue,
                            IpAddr::V6(a) if is_unicast_link_local(a) => has_link_local = true,
                            IpAddr::V6(_) => has_wider = true,
                            IpAddr::V4(_) => continue,
                        }
                    }
                    let eligible = if link_local_group {
                        has_link_local
                    } else {
                        has_wider
                    };
                    if eligible {
                        candidates.push(MulticastInterface::Index(nic.index));
                    }
                }
            }
        }

        let mut joined = Vec::new();
        for interface in candidates {
            match self.join_multicast(group, &interface) {
                Ok(m) if !joined.contains(&m) => joined.push(m),
                Ok(_) => {}
                Err(e) => {
                    debug!(multiaddr = %group, ?interface, "error joining multicast group: {e:#}")
                }
            }
        }

        if joined.is_empty() {
            return Err(Error::ConfigurationFailed {
                option: match group {
                    IpAddr::V4(_) => "IP_ADD_MEMBERSHIP",
                    IpAddr::V6(_) => "IPV6_JOIN_GROUP",
                },
                reason: format!("could not join {group} on any interface"),
            });
        }
        Ok(joined)
    }
}

fn check_group(group: IpAddr) -> crate::Result<()> {
    if !is_multicast_group(group) {
        return Err(Error::InvalidAddress(format!(
            "{group} is not a multicast group address"
        )));
    }
    Ok(())
}

/// `224.0.0.0/4` for IPv4, `ff00::/8` for IPv6.
pub fn is_multicast_group(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => {
            let shift = 32 - IPV4_MULTICAST_PREFIX_LEN;
            ip.to_bits() >> shift == IPV4_MULTICAST_NET.to_bits() >> shift
        }
        IpAddr::V6(ip) => {
            let shift = 128 - IPV6_MULTICAST_PREFIX_LEN;
            ip.to_bits() >> shift == IPV6_MULTICAST_NET.to_bits() >> shift
        }
    }
}

fn in_scope(ip: Ipv6Addr, net: Ipv6Addr) -> bool {
    let mask = IPV6_SCOPE_MASK.to_bits();
    ip.to_bits() & mask == net.to_bits() & mask
}

/// `ff02::/64`, ignoring the flag bits.
pub fn ipv6_is_link_local_mcast(ip: Ipv6Addr) -> bool {
    in_scope(ip, IPV6_LINK_LOCAL_MCAST_NET)
}

/// `ff05::/64`, ignoring the flag bits.
pub fn ipv6_is_site_local_mcast(ip: Ipv6Addr) -> bool {
    in_scope(ip, IPV6_SITE_LOCAL_MCAST_NET)
}
