use std::time::Duration;

use crate::{addr::Endpoint, addr::FamilyPreference, iface::BindDevice};

/// Options applied when a socket is created.
#[derive(Clone, Debug)]
pub struct SocketOpts {
    /// Which resolved candidates may be used.
    pub family: FamilyPreference,
    /// Report `WouldBlock` instead of blocking the calling thread.
    pub nonblocking: bool,
    /// `SO_REUSEADDR`. Not applied to TCP listeners on Windows, where it
    /// allows stealing a port that is in use.
    pub reuse_address: bool,
    /// `SO_REUSEPORT`, ignored on Windows.
    pub reuse_port: bool,
    /// Clear `IPV6_V6ONLY` when binding `[::]`, so IPv4 peers are served too.
    pub request_dualstack: bool,
    /// Best-effort hint, failures are logged and ignored.
    pub recv_buffer_size: Option<usize>,
    /// Best-effort hint, failures are logged and ignored.
    pub send_buffer_size: Option<usize>,
    /// `SO_KEEPALIVE`, TCP only.
    pub keepalive: bool,
    /// Blocking receives give up with `TimedOut` after this long.
    pub read_timeout: Option<Duration>,
    /// Blocking sends give up with `TimedOut` after this long.
    pub write_timeout: Option<Duration>,
}

impl Default for SocketOpts {
    fn default() -> Self {
        Self {
            family: FamilyPreference::Any,
            nonblocking: false,
            reuse_address: true,
            reuse_port: false,
            request_dualstack: true,
            recv_buffer_size: None,
            send_buffer_size: None,
            keepalive: false,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

impl SocketOpts {
    pub fn nonblocking() -> Self {
        Self {
            nonblocking: true,
            ..Default::default()
        }
    }

    pub fn with_family(mut self, family: FamilyPreference) -> Self {
        self.family = family;
        self
    }
}

/// Extra knobs for outgoing TCP connections.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConnectOpts<'a> {
    /// Per-candidate connect timeout, blocking mode only.
    pub timeout: Option<Duration>,
    /// Local endpoint to bind before connecting. Candidates of the other
    /// family are skipped.
    pub source: Option<Endpoint>,
    pub bind_device: Option<&'a BindDevice>,
}
