use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
    str::FromStr,
};

use crate::{Error, resolve};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    pub fn unspecified(self) -> IpAddr {
        match self {
            Family::V4 => Ipv4Addr::UNSPECIFIED.into(),
            Family::V6 => Ipv6Addr::UNSPECIFIED.into(),
        }
    }

    pub fn loopback(self) -> IpAddr {
        match self {
            Family::V4 => Ipv4Addr::LOCALHOST.into(),
            Family::V6 => Ipv6Addr::LOCALHOST.into(),
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::V4 => f.write_str("IPv4"),
            Family::V6 => f.write_str("IPv6"),
        }
    }
}

/// Which address families resolution may produce.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum FamilyPreference {
    #[default]
    Any,
    V4,
    V6,
}

impl FamilyPreference {
    pub fn admits(self, family: Family) -> bool {
        match self {
            FamilyPreference::Any => true,
            FamilyPreference::V4 => family == Family::V4,
            FamilyPreference::V6 => family == Family::V6,
        }
    }
}

impl FromStr for FamilyPreference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "any" | "" => Ok(FamilyPreference::Any),
            "ipv4" | "v4" | "4" | "inet" => Ok(FamilyPreference::V4),
            "ipv6" | "v6" | "6" | "inet6" => Ok(FamilyPreference::V6),
            other => Err(Error::InvalidAddress(format!(
                "unknown address family {other:?}"
            ))),
        }
    }
}

/// A resolved IP address and port, plus the IPv6 scope (interface index)
/// where one applies. Compared and hashed by value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    ip: IpAddr,
    port: u16,
    scope_id: u32,
}

impl Endpoint {
    pub fn new(ip: impl Into<IpAddr>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
            scope_id: 0,
        }
    }

    /// Attach an IPv6 scope. Ignored for IPv4 addresses.
    pub fn with_scope_id(mut self, scope_id: u32) -> Self {
        if self.ip.is_ipv6() {
            self.scope_id = scope_id;
        }
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn family(&self) -> Family {
        Family::of(&self.ip)
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn scope_id(&self) -> u32 {
        self.scope_id
    }

    pub fn is_ipv4(&self) -> bool {
        self.ip.is_ipv4()
    }

    pub fn is_ipv6(&self) -> bool {
        self.ip.is_ipv6()
    }

    pub fn is_unspecified(&self) -> bool {
        self.ip.is_unspecified()
    }

    /// 224.0.0.0/4 for IPv4, ff00::/8 for IPv6.
    pub fn is_multicast(&self) -> bool {
        crate::multicast::is_multicast_group(self.ip)
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        match self.ip {
            IpAddr::V4(ip) => SocketAddr::V4(SocketAddrV4::new(ip, self.port)),
            IpAddr::V6(ip) => SocketAddr::V6(SocketAddrV6::new(ip, self.port, 0, self.scope_id)),
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(value: SocketAddr) -> Self {
        match value {
            SocketAddr::V4(a) => Endpoint::new(*a.ip(), a.port()),
            SocketAddr::V6(a) => Endpoint::new(*a.ip(), a.port()).with_scope_id(a.scope_id()),
        }
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(value: Endpoint) -> Self {
        value.to_socket_addr()
    }
}

impl From<(IpAddr, u16)> for Endpoint {
    fn from((ip, port): (IpAddr, u16)) -> Self {
        Endpoint::new(ip, port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.to_socket_addr(), f)
    }
}

/// Parses literal `a.b.c.d:port` and `[v6]:port` forms only. Use
/// [`resolve`](crate::resolve::resolve) for names.
impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<SocketAddr>()
            .map(Endpoint::from)
            .map_err(|_| Error::InvalidAddress(format!("{s:?} is not an IP address with port")))
    }
}

/// Anything that can produce an ordered list of candidate endpoints,
/// modelled after [`std::net::ToSocketAddrs`].
pub trait ToEndpoints {
    fn to_endpoints(&self, family: FamilyPreference) -> crate::Result<Vec<Endpoint>>;
}

impl ToEndpoints for Endpoint {
    fn to_endpoints(&self, family: FamilyPreference) -> crate::Result<Vec<Endpoint>> {
        resolve::filter(&self.to_string(), vec![*self], family)
    }
}

impl ToEndpoints for SocketAddr {
    fn to_endpoints(&self, family: FamilyPreference) -> crate::Result<Vec<Endpoint>> {
        Endpoint::from(*self).to_endpoints(family)
    }
}

impl ToEndpoints for (IpAddr, u16) {
    fn to_endpoints(&self, family: FamilyPreference) -> crate::Result<Vec<Endpoint>> {
        Endpoint::from(*self).to_endpoints(family)
    }
}

impl ToEndpoints for (Ipv4Addr, u16) {
    fn to_endpoints(&self, family: FamilyPreference) -> crate::Result<Vec<Endpoint>> {
        Endpoint::new(self.0, self.1).to_endpoints(family)
    }
}

impl ToEndpoints for (Ipv6Addr, u16) {
    fn to_endpoints(&self, family: FamilyPreference) -> crate::Result<Vec<Endpoint>> {
        Endpoint::new(self.0, self.1).to_endpoints(family)
    }
}

impl ToEndpoints for (&str, u16) {
    fn to_endpoints(&self, family: FamilyPreference) -> crate::Result<Vec<Endpoint>> {
        resolve::resolve(self.0, self.1, family)
    }
}

impl ToEndpoints for (String, u16) {
    fn to_endpoints(&self, family: FamilyPreference) -> crate::Result<Vec<Endpoint>> {
        resolve::resolve(&self.0, self.1, family)
    }
}

/// `host:port`, `[v6]:port` or `interface:port`.
impl ToEndpoints for str {
    fn to_endpoints(&self, family: FamilyPreference) -> crate::Result<Vec<Endpoint>> {
        resolve::resolve_host_port(self, family)
    }
}

impl ToEndpoints for String {
    fn to_endpoints(&self, family: FamilyPreference) -> crate::Result<Vec<Endpoint>> {
        self.as_str().to_endpoints(family)
    }
}

impl ToEndpoints for [Endpoint] {
    fn to_endpoints(&self, family: FamilyPreference) -> crate::Result<Vec<Endpoint>> {
        resolve::filter("endpoint list", self.to_vec(), family)
    }
}

impl<T: ToEndpoints + ?Sized> ToEndpoints for &T {
    fn to_endpoints(&self, family: FamilyPreference) -> crate::Result<Vec<Endpoint>> {
        (**self).to_endpoints(family)
    }
}

pub trait TryToV4 {
    fn try_to_ipv4(&self) -> SocketAddr;
}

pub trait ToV6Mapped {
    fn to_ipv6_mapped(&self) -> SocketAddrV6;
}

impl ToV6Mapped for SocketAddr {
    fn to_ipv6_mapped(&self) -> SocketAddrV6 {
        match self {
            SocketAddr::V4(a) => SocketAddrV6::new(a.ip().to_ipv6_mapped(), a.port(), 0, 0),
            SocketAddr::V6(a) => *a,
        }
    }
}

impl TryToV4 for SocketAddr {
    fn try_to_ipv4(&self) -> SocketAddr {
        match self {
            SocketAddr::V4(_) => *self,
            SocketAddr::V6(a) => a.try_to_ipv4(),
        }
    }
}

impl TryToV4 for SocketAddrV6 {
    fn try_to_ipv4(&self) -> SocketAddr {
        self.ip()
            .to_ipv4_mapped()
            .map(|ip| SocketAddr::new(ip.into(), self.port()))
            .unwrap_or(SocketAddr::V6(*self))
    }
}
