//! Blocking and non-blocking TCP, UDP and multicast sockets with one API
//! over BSD sockets and Winsock.
//!
//! Targets are resolved into candidate [`Endpoint`]s, a [`Handle`] owns the
//! native socket, and [`Connection`], [`Listener`] and [`DatagramEndpoint`]
//! drive it. Native failures come back as one [`Error`] taxonomy on every
//! platform.

#[cfg(test)]
mod tests;

mod error;
mod normalize;
mod shim;
#[cfg_attr(unix, path = "sys/unix.rs")]
#[cfg_attr(windows, path = "sys/windows.rs")]
mod sys;

pub mod addr;
pub mod constants;
pub mod handle;
pub mod iface;
pub mod multicast;
pub mod opts;
pub mod platform;
pub mod resolve;
pub mod tcp;
pub mod udp;

pub use addr::{Endpoint, Family, FamilyPreference, ToEndpoints};
pub use error::{Error, ErrorKind, Result, SendAllError};
pub use handle::{Canceller, Handle, Protocol, State};
pub use iface::{BindDevice, Interface, list_interfaces};
pub use multicast::{Membership, MulticastInterface, ResolvedInterface};
pub use opts::{ConnectOpts, SocketOpts};
pub use tcp::{Connection, Listener};
pub use udp::DatagramEndpoint;
