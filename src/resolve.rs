//! Turns host specifications into ordered candidate endpoints.
//!
//! A host may be
//! - empty, `any` or `*`: the unspecified address of each admitted family,
//! - `lo`, `localhost` or `loopback`: the loopback address of each family,
//! - a literal IPv4 or IPv6 address, optionally in `[..]` brackets and with a
//!   `%scope` suffix naming an interface or an interface index,
//! - the name of a network interface: the addresses assigned to it,
//! - anything else: a DNS name, looked up through the system resolver.
//!
//! The order of the result is deterministic for a given input on a given
//! host: IPv4 before IPv6 for aliases and interfaces, system resolver order
//! for DNS names. Duplicates are removed keeping the first occurrence.


use std::net::{IpAddr, Ipv6Addr, ToSocketAddrs};

use tracing::{debug, trace};

use crate::{
    Error,
    addr::{Endpoint, Family, FamilyPreference},
    iface::{Interface, list_interfaces},
};

pub fn resolve(host: &str, port: u16, family: FamilyPreference) -> crate::Result<Vec<Endpoint>> {
    let host = host.trim();
    let candidates = if let Some(c) = alias(host, port) {
        c
    } else if let Some(literal) = parse_literal(host) {
        vec![literal?.with_port(port)]
    } else if let Some(c) = interface_endpoints(host, port) {
        c
    } else {
        lookup(host, port)?
    };
    let resolved = filter(host, candidates, family)?;
    trace!(host, port, ?family, candidates = ?resolved, "resolved");
    Ok(resolved)
}

/// Resolve a `host:port` string. IPv6 literals need brackets.
pub fn resolve_host_port(s: &str, family: FamilyPreference) -> crate::Result<Vec<Endpoint>> {
    let (host, port) = split_host_port(s)?;
    resolve(host, port, family)
}

pub(crate) fn split_host_port(s: &str) -> crate::Result<(&str, u16)> {
    let invalid = || Error::InvalidAddress(format!("{s:?} is not of the form host:port"));
    let (host, port) = s.trim().rsplit_once(':').ok_or_else(invalid)?;
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        return Err(invalid());
    }
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    Ok((host, port))
}

/// Keep the admitted families, drop duplicates, fail if nothing is left.
pub(crate) fn filter(
    host: &str,
    candidates: Vec<Endpoint>,
    family: FamilyPreference,
) -> crate::Result<Vec<Endpoint>> {
    let mut result: Vec<Endpoint> = Vec::with_capacity(candidates.len());
    for c in candidates {
        if family.admits(c.family()) && !result.contains(&c) {
            result.push(c);
        }
    }
    if result.is_empty() {
        return Err(Error::ResolutionFailure {
            host: host.to_owned(),
            reason: format!("no {family:?} address candidates"),
        });
    }
    Ok(result)
}

fn alias(host: &str, port: u16) -> Option<Vec<Endpoint>> {
    let make = |f: fn(Family) -> IpAddr| -> Vec<Endpoint> {
        [Family::V4, Family::V6]
            .into_iter()
            .map(|family| Endpoint::new(f(family), port))
            .collect()
    };
    match host.to_ascii_lowercase().as_str() {
        "" | "any" | "*" => Some(make(Family::unspecified)),
        "lo" | "localhost" | "loopback" => Some(make(Family::loopback)),
        _ => None,
    }
}

/// `None` if `host` doesn't look like an IP literal at all.
fn parse_literal(host: &str) -> Option<crate::Result<Endpoint>> {
    let unbracketed = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    let (addr, scope) = match unbracketed.split_once('%') {
        Some((addr, scope)) => (addr, Some(scope)),
        None => (unbracketed, None),
    };

    let ip = addr.parse::<IpAddr>().ok()?;
    let Some(scope) = scope else {
        return Some(Ok(Endpoint::new(ip, 0)));
    };
    if ip.is_ipv4() {
        return Some(Err(Error::InvalidAddress(format!(
            "{host:?}: scope ids only apply to IPv6"
        ))));
    }
    let scope_id = match scope.parse::<u32>() {
        Ok(index) => Ok(index),
        Err(_) => Interface::by_name(scope).map(|nic| nic.index),
    };
    Some(scope_id.map(|id| Endpoint::new(ip, 0).with_scope_id(id)))
}

fn interface_endpoints(host: &str, port: u16) -> Option<Vec<Endpoint>> {
    let nic = list_interfaces()
        .into_iter()
        .find(|nic| nic.name.eq_ignore_ascii_case(host))?;
    let mut endpoints: Vec<Endpoint> = nic
        .addrs
        .iter()
        .map(|ip| {
            let ep = Endpoint::new(*ip, port);
            match ip {
                IpAddr::V6(v6) if is_unicast_link_local(v6) => ep.with_scope_id(nic.index),
                _ => ep,
            }
        })
        .collect();
    endpoints.sort_by_key(|e| e.family());
    debug!(interface = %nic.name, ?endpoints, "resolved interface name");
    Some(endpoints)
}

fn lookup(host: &str, port: u16) -> crate::Result<Vec<Endpoint>> {
    (host, port)
        .to_socket_addrs()
        .map(|addrs| addrs.map(Endpoint::from).collect())
        .map_err(|e| Error::ResolutionFailure {
            host: host.to_owned(),
            reason: e.to_string(),
        })
}

pub(crate) fn is_unicast_link_local(ip: &Ipv6Addr) -> bool {
    const LL: Ipv6Addr = Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0);
    const MASK: Ipv6Addr = Ipv6Addr::new(0xffff, 0xffff, 0xffff, 0xffff, 0, 0, 0, 0);

    ip.to_bits() & MASK.to_bits() == LL.to_bits() & MASK.to_bits()
}

/// Run `attempt` on each candidate in order until one succeeds. Every
/// rejected candidate is logged; if all fail, the last error is returned.
pub(crate) fn try_candidates<T>(
    what: &'static str,
    candidates: &[Endpoint],
    mut attempt: impl FnMut(Endpoint) -> crate::Result<T>,
) -> crate::Result<T> {
    let mut last_error = None;
    for candidate in candidates.iter().copied() {
        match attempt(candidate) {
            Ok(value) => return Ok(value),
            Err(e) => {
                debug!(%candidate, "{what}: rejected candidate: {e:#}");
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| Error::ResolutionFailure {
        host: what.to_owned(),
        reason: "no address candidates".to_owned(),
    }))
}
