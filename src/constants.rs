//! Multicast address blocks and a few well-known groups.

use std::net::{Ipv4Addr, Ipv6Addr};

/// `224.0.0.0/4`.
pub const IPV4_MULTICAST_NET: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 0);
pub const IPV4_MULTICAST_PREFIX_LEN: u32 = 4;

/// `ff00::/8`.
pub const IPV6_MULTICAST_NET: Ipv6Addr = Ipv6Addr::new(0xff00, 0, 0, 0, 0, 0, 0, 0);
pub const IPV6_MULTICAST_PREFIX_LEN: u32 = 8;

/// Keeps the scope nibble and the first 64 bits of an IPv6 group, drops the
/// flag nibble and the group id.
pub(crate) const IPV6_SCOPE_MASK: Ipv6Addr =
    Ipv6Addr::new(0xff0f, 0xffff, 0xffff, 0xffff, 0, 0, 0, 0);
pub const IPV6_LINK_LOCAL_MCAST_NET: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0);
pub const IPV6_SITE_LOCAL_MCAST_NET: Ipv6Addr = Ipv6Addr::new(0xff05, 0, 0, 0, 0, 0, 0, 0);

pub const ALL_HOSTS_IPV4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 1);
pub const ALL_NODES_IPV6: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);

pub const SSDP_PORT: u16 = 1900;
pub const SSDP_MCAST_IPV4: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
pub const SSDP_MCAST_IPV6_LINK_LOCAL: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xc);
pub const SSDP_MCAST_IPV6_SITE_LOCAL: Ipv6Addr = Ipv6Addr::new(0xff05, 0, 0, 0, 0, 0, 0, 0xc);
