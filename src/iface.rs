
use std::{
    io,
    net::{IpAddr, Ipv4Addr},
    num::NonZeroU32,
    str::FromStr,
};

use network_interface::{NetworkInterface, NetworkInterfaceConfig};
use socket2::Socket;

use crate::{Error, sys};

/// A network interface with every IP address assigned to it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub index: u32,
    pub addrs: Vec<IpAddr>,
}

impl Interface {
    /// Case-insensitive lookup by name.
    pub fn by_name(name: &str) -> crate::Result<Self> {
        list_interfaces()
            .into_iter()
            .find(|nic| nic.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| no_such_interface(name))
    }

    pub fn by_index(index: u32) -> crate::Result<Self> {
        list_interfaces()
            .into_iter()
            .find(|nic| nic.index == index)
            .ok_or_else(|| no_such_interface(&format!("#{index}")))
    }

    /// The interface that has `ip` assigned.
    pub fn by_addr(ip: IpAddr) -> crate::Result<Self> {
        list_interfaces()
            .into_iter()
            .find(|nic| nic.addrs.contains(&ip))
            .ok_or_else(|| no_such_interface(&ip.to_string()))
    }

    pub fn first_v4(&self) -> Option<Ipv4Addr> {
        self.addrs.iter().find_map(|a| match a {
            IpAddr::V4(v4) => Some(*v4),
            IpAddr::V6(_) => None,
        })
    }

    pub fn is_loopback(&self) -> bool {
        !self.addrs.is_empty() && self.addrs.iter().all(|a| a.is_loopback())
    }
}

fn no_such_interface(name: &str) -> Error {
    Error::ResolutionFailure {
        host: name.to_owned(),
        reason: "no network interface with that name".to_owned(),
    }
}

/// All IP-capable interfaces, in the order the OS reports them. Entries the
/// OS reports once per address are merged by name.
pub fn list_interfaces() -> Vec<Interface> {
    let mut result: Vec<Interface> = Vec::new();
    for nic in NetworkInterface::show().into_iter().flatten() {
        let addrs = nic.addr.iter().map(|a| a.ip());
        match result.iter_mut().find(|i| i.name == nic.name) {
            Some(existing) => {
                for a in addrs {
                    if !existing.addrs.contains(&a) {
                        existing.addrs.push(a);
                    }
                }
            }
            None => result.push(Interface {
                name: nic.name,
                index: nic.index,
                addrs: addrs.collect(),
            }),
        }
    }
    result
}

/// A network device outgoing connections can be pinned to.
#[derive(Debug, Clone)]
pub struct BindDevice {
    index: NonZeroU32,
    name: String,
}

impl BindDevice {
    pub fn new_from_name(name: &str) -> crate::Result<Self> {
        let nic = Interface::by_name(name)?;
        let index = NonZeroU32::new(nic.index).ok_or_else(|| Error::ConfigurationFailed {
            option: "bind_device",
            reason: format!("interface {name} has no index"),
        })?;
        Ok(Self {
            index,
            name: nic.name,
        })
    }

    pub fn index(&self) -> NonZeroU32 {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn bind_socket(&self, socket: &Socket, is_v6: bool) -> io::Result<()> {
        sys::bind_device(socket, self, is_v6)
    }
}

impl FromStr for BindDevice {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new_from_name(s)
    }
}
