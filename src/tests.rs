use crate::{
    Connection, DatagramEndpoint, Endpoint, ErrorKind, Listener, SocketOpts, State, platform,
};

use anyhow::Context;
use bstr::BStr;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::thread;
use std::time::Duration;
use tracing::level_filters::LevelFilter;
use tracing::trace;
use tracing_subscriber::EnvFilter;

const TIMEOUT: Duration = Duration::from_secs(10);

fn ipv4_localhost() -> SocketAddr {
    (Ipv4Addr::LOCALHOST, 0).into()
}

fn ipv6_localhost() -> SocketAddr {
    (Ipv6Addr::LOCALHOST, 0).into()
}

fn ipv6_unspecified() -> SocketAddr {
    (Ipv6Addr::UNSPECIFIED, 0).into()
}

fn setup_test_logging() {
    let _ = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::TRACE.into())
                .from_env()
                .unwrap(),
        )
        .try_init();
    unsafe { std::env::set_var("RUST_BACKTRACE", "1") }
}

// Some CI containers run without an IPv6 loopback.
fn ipv6_available() -> bool {
    let available = std::net::UdpSocket::bind(ipv6_localhost()).is_ok();
    if !available {
        println!("no IPv6 loopback, skipping");
    }
    available
}

fn blocking_opts() -> SocketOpts {
    SocketOpts {
        read_timeout: Some(TIMEOUT),
        write_timeout: Some(TIMEOUT),
        ..Default::default()
    }
}

fn local_pair() -> (Connection, Connection) {
    let mut listener = Listener::listen(ipv4_localhost(), 5, &SocketOpts::default()).unwrap();
    let target = listener.local_endpoint().unwrap();
    let client = Connection::connect_timeout(target, TIMEOUT, &blocking_opts()).unwrap();
    let server = listener.accept().unwrap();
    (client, server)
}

fn receive_exact(conn: &mut Connection, len: usize) -> Vec<u8> {
    let mut result = Vec::with_capacity(len);
    let mut buf = [0u8; 4096];
    while result.len() < len {
        let want = (len - result.len()).min(buf.len());
        let n = conn.receive(&mut buf[..want]).unwrap();
        result.extend_from_slice(&buf[..n]);
    }
    result
}

// For both TCP and UDP:
// - IPv6 dualstack sockets: both localhost IPv4 and localhost IPv6 peers
//   work, and the peer address reported matches the protocol.
// - pure IPv6 and pure IPv4 only work with their own family.

struct BindSpec {
    addr: SocketAddr,
    request_dualstack: bool,
    expect_dualstack: bool,
}

impl BindSpec {
    fn opts(&self) -> SocketOpts {
        SocketOpts {
            request_dualstack: self.request_dualstack,
            ..blocking_opts()
        }
    }

    fn bind_tcp(&self) -> Listener {
        let res = Listener::listen(self.addr, 16, &self.opts()).unwrap();
        assert_eq!(res.is_dualstack(), self.expect_dualstack);
        res
    }

    fn bind_udp(&self) -> DatagramEndpoint {
        let res = DatagramEndpoint::bind(self.addr, &self.opts()).unwrap();
        assert_eq!(res.is_dualstack(), self.expect_dualstack);
        res
    }
}

#[derive(Clone, Copy)]
enum SendSpec {
    SendToV4,
    SendToV6,
}

impl SendSpec {
    fn remote(self, port: u16) -> SocketAddr {
        match self {
            SendSpec::SendToV4 => SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            SendSpec::SendToV6 => SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), port),
        }
    }

    fn check_peer(self, addr: Endpoint) {
        match self {
            SendSpec::SendToV4 => assert!(addr.is_ipv4(), "{addr} should be IPv4"),
            SendSpec::SendToV6 => assert!(addr.is_ipv6(), "{addr} should be IPv6"),
        }
    }
}

#[derive(Clone, Copy)]
struct SendAssertion {
    spec: SendSpec,
    should_work: bool,
}

fn test_tcp(server: BindSpec, tests: &[SendAssertion]) {
    for test in tests.iter().copied() {
        let mut server = server.bind_tcp();
        let remote = test.spec.remote(server.local_endpoint().unwrap().port());

        let res = Connection::connect_timeout(remote, TIMEOUT, &blocking_opts());
        if !test.should_work {
            assert!(res.is_err(), "connecting to {remote} should have failed");
            continue;
        }
        let mut client = res
            .with_context(|| format!("error connecting to {remote}"))
            .unwrap();
        trace!(?remote, "connected");
        client.send_all(&42u32.to_be_bytes()).unwrap();

        let mut stream = server.accept().context("error accepting").unwrap();
        let addr = stream.remote_endpoint().unwrap();
        trace!(%addr, "accepted");
        test.spec.check_peer(addr);

        let received = receive_exact(&mut stream, 4);
        assert_eq!(u32::from_be_bytes(received.try_into().unwrap()), 42);
    }
}

fn test_udp(server1: BindSpec, server2: BindSpec, tests: &[SendAssertion]) {
    for test in tests.iter().copied() {
        let mut server1 = server1.bind_udp();
        let mut server2 = server2.bind_udp();
        let remote = test.spec.remote(server2.local_endpoint().unwrap().port());

        let buf = 42u32.to_le_bytes();
        trace!(server_bind_addr = ?server1.local_endpoint(), ?remote, "sending");
        let res = server1.send_to(&buf, remote);
        if !test.should_work {
            assert!(res.is_err(), "sending to {remote} should have failed");
            continue;
        }
        res.with_context(|| format!("error sending to {remote}"))
            .unwrap();

        let mut buf = [0u8; 4];
        let (size, addr) = server2
            .receive_from(&mut buf)
            .context("error receiving")
            .unwrap();
        assert_eq!(size, 4);
        trace!(%addr, "received");
        test.spec.check_peer(addr);
        assert_eq!(u32::from_le_bytes(buf), 42);
    }
}

#[test]
fn test_tcp_ipv6_unspecified_dualstack() {
    setup_test_logging();
    if !ipv6_available() {
        return;
    }
    test_tcp(
        BindSpec {
            addr: ipv6_unspecified(),
            request_dualstack: true,
            expect_dualstack: true,
        },
        &[
            SendAssertion {
                spec: SendSpec::SendToV6,
                should_work: true,
            },
            SendAssertion {
                spec: SendSpec::SendToV4,
                should_work: true,
            },
        ],
    )
}

#[test]
fn test_tcp_ipv6_unspecified_no_dualstack() {
    setup_test_logging();
    if !ipv6_available() {
        return;
    }
    test_tcp(
        BindSpec {
            addr: ipv6_unspecified(),
            request_dualstack: false,
            expect_dualstack: false,
        },
        &[
            SendAssertion {
                spec: SendSpec::SendToV6,
                should_work: true,
            },
            SendAssertion {
                spec: SendSpec::SendToV4,
                should_work: false,
            },
        ],
    )
}

#[test]
fn test_tcp_ipv6_localhost() {
    setup_test_logging();
    if !ipv6_available() {
        return;
    }
    test_tcp(
        BindSpec {
            addr: ipv6_localhost(),
            request_dualstack: true,
            expect_dualstack: false,
        },
        &[
            SendAssertion {
                spec: SendSpec::SendToV6,
                should_work: true,
            },
            SendAssertion {
                spec: SendSpec::SendToV4,
                should_work: false,
            },
        ],
    )
}

#[test]
fn test_tcp_ipv4_localhost() {
    setup_test_logging();
    let mut tests = vec![SendAssertion {
        spec: SendSpec::SendToV4,
        should_work: true,
    }];
    if ipv6_available() {
        tests.push(SendAssertion {
            spec: SendSpec::SendToV6,
            should_work: false,
        });
    }
    test_tcp(
        BindSpec {
            addr: ipv4_localhost(),
            request_dualstack: true,
            expect_dualstack: false,
        },
        &tests,
    )
}

#[test]
fn test_udp_ipv6_unspecified_dualstack() {
    setup_test_logging();
    if !ipv6_available() {
        return;
    }
    test_udp(
        BindSpec {
            addr: ipv6_unspecified(),
            request_dualstack: true,
            expect_dualstack: true,
        },
        BindSpec {
            addr: ipv6_unspecified(),
            request_dualstack: true,
            expect_dualstack: true,
        },
        &[
            SendAssertion {
                spec: SendSpec::SendToV6,
                should_work: true,
            },
            SendAssertion {
                spec: SendSpec::SendToV4,
                should_work: true,
            },
        ],
    )
}

#[test]
fn test_udp_ipv6_unspecified_no_dualstack() {
    setup_test_logging();
    if !ipv6_available() {
        return;
    }
    test_udp(
        BindSpec {
            addr: ipv6_unspecified(),
            request_dualstack: false,
            expect_dualstack: false,
        },
        BindSpec {
            addr: ipv6_unspecified(),
            request_dualstack: false,
            expect_dualstack: false,
        },
        &[
            SendAssertion {
                spec: SendSpec::SendToV6,
                should_work: true,
            },
            SendAssertion {
                spec: SendSpec::SendToV4,
                should_work: false,
            },
        ],
    )
}

#[test]
fn test_udp_ipv4_localhost() {
    setup_test_logging();
    let mut tests = vec![SendAssertion {
        spec: SendSpec::SendToV4,
        should_work: true,
    }];
    if ipv6_available() {
        tests.push(SendAssertion {
            spec: SendSpec::SendToV6,
            should_work: false,
        });
    }
    test_udp(
        BindSpec {
            addr: ipv4_localhost(),
            request_dualstack: true,
            expect_dualstack: false,
        },
        BindSpec {
            addr: ipv4_localhost(),
            request_dualstack: true,
            expect_dualstack: false,
        },
        &tests,
    )
}

#[test]
fn test_ping_pong() {
    setup_test_logging();
    let mut listener = Listener::listen("127.0.0.1:0", 5, &SocketOpts::default()).unwrap();
    let port = listener.local_endpoint().unwrap().port();
    assert_ne!(port, 0);

    thread::scope(|s| {
        let server = s.spawn(|| {
            let mut conn = listener.accept().unwrap();
            let mut buf = [0u8; 16];
            let n = conn.receive(&mut buf).unwrap();
            assert_eq!(BStr::new(&buf[..n]), BStr::new("ping"));
            assert_eq!(n, 4);
            assert_eq!(conn.send(b"pong").unwrap(), 4);
            // Wait for the client to finish before closing.
            assert_eq!(
                conn.receive(&mut buf).unwrap_err().kind(),
                ErrorKind::ConnectionClosedByPeer
            );
            conn.close();
        });

        let mut client =
            Connection::connect_timeout(("127.0.0.1", port), TIMEOUT, &blocking_opts()).unwrap();
        assert_eq!(client.send(b"ping").unwrap(), 4);
        let received = receive_exact(&mut client, 4);
        assert_eq!(BStr::new(&received), BStr::new("pong"));
        client.close();
        server.join().unwrap();
    });
}

#[test]
fn test_accepted_remote_matches_client_local() {
    setup_test_logging();
    let (client, server) = local_pair();
    assert_eq!(
        server.remote_endpoint().unwrap(),
        client.local_endpoint().unwrap()
    );
    assert_eq!(
        client.remote_endpoint().unwrap(),
        server.local_endpoint().unwrap()
    );
    assert_eq!(client.state(), State::Connected);
    assert_eq!(server.state(), State::Connected);
}

#[test]
fn test_split_sends_arrive_in_order() {
    setup_test_logging();
    let (mut client, mut server) = local_pair();
    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();

    thread::scope(|s| {
        s.spawn(|| {
            for chunk in payload.chunks(777) {
                client.send_all(chunk).unwrap();
            }
        });
        let received = receive_exact(&mut server, payload.len());
        assert!(received == payload, "payload corrupted");
    });
}

#[test]
fn test_closed_handles_reject_operations() {
    setup_test_logging();
    let (mut client, mut server) = local_pair();
    client.close();
    client.close();
    assert_eq!(client.state(), State::Closed);
    for err in [
        client.send(b"x").unwrap_err(),
        client.receive(&mut [0u8; 4]).unwrap_err(),
        client.shutdown_write().unwrap_err(),
        client.local_endpoint().unwrap_err(),
        client.remote_endpoint().unwrap_err(),
    ] {
        assert_eq!(err.kind(), ErrorKind::InvalidState, "{err:#}");
    }
    server.close();

    let mut listener = Listener::listen(ipv4_localhost(), 5, &SocketOpts::default()).unwrap();
    listener.close();
    listener.close();
    assert_eq!(
        listener.accept().unwrap_err().kind(),
        ErrorKind::InvalidState
    );
    assert_eq!(
        listener.local_endpoint().unwrap_err().kind(),
        ErrorKind::InvalidState
    );

    let mut udp = DatagramEndpoint::bind(ipv4_localhost(), &SocketOpts::default()).unwrap();
    let target = udp.local_endpoint().unwrap();
    udp.close();
    udp.close();
    assert_eq!(
        udp.send_to(b"x", target).unwrap_err().kind(),
        ErrorKind::InvalidState
    );
    assert_eq!(
        udp.receive_from(&mut [0u8; 4]).unwrap_err().kind(),
        ErrorKind::InvalidState
    );
    assert_eq!(
        udp.set_default_peer(target).unwrap_err().kind(),
        ErrorKind::InvalidState
    );
}

#[test]
fn test_peer_close_is_reported_every_time() {
    setup_test_logging();
    let (mut client, mut server) = local_pair();
    client.send_all(b"last words").unwrap();
    client.close();

    assert_eq!(receive_exact(&mut server, 10), b"last words");
    for _ in 0..2 {
        assert_eq!(
            server.receive(&mut [0u8; 16]).unwrap_err().kind(),
            ErrorKind::ConnectionClosedByPeer
        );
    }
    assert_eq!(server.state(), State::Connected);
}

#[test]
fn test_half_close() {
    setup_test_logging();
    let (mut client, mut server) = local_pair();
    client.send_all(b"request").unwrap();
    client.shutdown_write().unwrap();
    client.shutdown_write().unwrap();
    assert_eq!(
        client.send(b"more").unwrap_err().kind(),
        ErrorKind::InvalidState
    );

    assert_eq!(receive_exact(&mut server, 7), b"request");
    assert_eq!(
        server.receive(&mut [0u8; 16]).unwrap_err().kind(),
        ErrorKind::ConnectionClosedByPeer
    );

    server.send_all(b"response").unwrap();
    assert_eq!(receive_exact(&mut client, 8), b"response");
}

#[test]
fn test_empty_receive_buffer() {
    setup_test_logging();
    let (_client, mut server) = local_pair();
    assert_eq!(server.receive(&mut []).unwrap(), 0);
}

#[test]
fn test_connection_refused() {
    setup_test_logging();
    let mut listener = Listener::listen(ipv4_localhost(), 5, &SocketOpts::default()).unwrap();
    let target = listener.local_endpoint().unwrap();
    listener.close();

    let err = Connection::connect(target, &SocketOpts::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectFailed, "{err:#}");
}

#[test]
fn test_connect_tries_candidates_in_order() {
    setup_test_logging();
    let mut dead = Listener::listen(ipv4_localhost(), 5, &SocketOpts::default()).unwrap();
    let dead_addr = dead.local_endpoint().unwrap();
    dead.close();

    let mut listener = Listener::listen(ipv4_localhost(), 5, &SocketOpts::default()).unwrap();
    let alive = listener.local_endpoint().unwrap();

    let candidates = [dead_addr, alive];
    let client = Connection::connect(&candidates[..], &blocking_opts()).unwrap();
    assert_eq!(client.remote_endpoint().unwrap(), alive);
    listener.accept().unwrap();

    let err = Connection::connect(&[dead_addr, dead_addr][..], &SocketOpts::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectFailed);
}

#[test]
fn test_receive_timeout() {
    setup_test_logging();
    let mut listener = Listener::listen(ipv4_localhost(), 5, &SocketOpts::default()).unwrap();
    let opts = SocketOpts {
        read_timeout: Some(Duration::from_millis(100)),
        ..Default::default()
    };
    let mut client = Connection::connect(listener.local_endpoint().unwrap(), &opts).unwrap();
    let _server = listener.accept().unwrap();

    let err = client.receive(&mut [0u8; 16]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TimedOut, "{err:#}");
    assert_eq!(client.state(), State::Connected);
}

#[test]
fn test_nonblocking_would_block() {
    setup_test_logging();
    let mut listener = Listener::listen(ipv4_localhost(), 5, &SocketOpts::nonblocking()).unwrap();
    let err = listener.accept().unwrap_err();
    assert!(err.is_would_block(), "{err:#}");
    assert_eq!(listener.state(), State::Listening);

    let mut udp = DatagramEndpoint::bind(ipv4_localhost(), &SocketOpts::nonblocking()).unwrap();
    let err = udp.receive_from(&mut [0u8; 16]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WouldBlock);
    assert_eq!(udp.state(), State::Bound);
}

#[test]
fn test_nonblocking_connect() {
    setup_test_logging();
    let mut listener = Listener::listen(ipv4_localhost(), 5, &SocketOpts::default()).unwrap();
    let target = listener.local_endpoint().unwrap();
    let mut client = Connection::connect(target, &SocketOpts::nonblocking()).unwrap();

    let mut attempts = 0;
    loop {
        match client.finish_connect() {
            Ok(()) => break,
            Err(e) if e.is_would_block() && attempts < 500 => {
                attempts += 1;
                thread::sleep(Duration::from_millis(10));
            }
            Err(e) => panic!("connect failed: {e:#}"),
        }
    }
    assert_eq!(client.state(), State::Connected);

    let mut server = listener.accept().unwrap();
    assert!(!server.handle().is_nonblocking());
    server.send_all(b"hi").unwrap();

    let mut buf = [0u8; 2];
    let mut received = 0;
    while received < 2 {
        match client.receive(&mut buf[received..]) {
            Ok(n) => received += n,
            Err(e) if e.is_would_block() => thread::sleep(Duration::from_millis(10)),
            Err(e) => panic!("receive failed: {e:#}"),
        }
    }
    assert_eq!(&buf, b"hi");
}

#[test]
fn test_accept_with_backoff() {
    setup_test_logging();
    let mut listener = Listener::listen(ipv4_localhost(), 5, &SocketOpts::default()).unwrap();
    let client =
        Connection::connect(listener.local_endpoint().unwrap(), &SocketOpts::default()).unwrap();
    let server = listener
        .accept_with_backoff(Duration::from_millis(100))
        .unwrap();
    assert_eq!(
        server.remote_endpoint().unwrap(),
        client.local_endpoint().unwrap()
    );
}

#[cfg(target_os = "linux")]
#[test]
fn test_cancel_blocked_receive() {
    setup_test_logging();
    let (mut client, _server) = local_pair();
    let canceller = client.canceller();

    thread::scope(|s| {
        let blocked = s.spawn(|| client.receive(&mut [0u8; 16]));
        thread::sleep(Duration::from_millis(200));
        canceller.cancel();
        let err = blocked.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled, "{err:#}");
    });

    assert!(canceller.is_cancelled());
    assert_eq!(client.state(), State::Closed);
    assert_eq!(
        client.receive(&mut [0u8; 16]).unwrap_err().kind(),
        ErrorKind::InvalidState
    );
}

#[test]
fn test_udp_payload_and_sender() {
    setup_test_logging();
    let mut receiver = DatagramEndpoint::bind(ipv4_localhost(), &blocking_opts()).unwrap();
    let mut sender = DatagramEndpoint::bind(ipv4_localhost(), &blocking_opts()).unwrap();

    let n = sender
        .send_to(b"datagram", receiver.local_endpoint().unwrap())
        .unwrap();
    assert_eq!(n, 8);

    let mut buf = [0u8; 64];
    let (n, from) = receiver.receive_from(&mut buf).unwrap();
    assert_eq!(BStr::new(&buf[..n]), BStr::new("datagram"));
    assert_eq!(from, sender.local_endpoint().unwrap());
}

#[test]
fn test_udp_default_peer() {
    setup_test_logging();
    let mut a = DatagramEndpoint::bind("127.0.0.1:0", &blocking_opts()).unwrap();
    let mut b = DatagramEndpoint::bind("127.0.0.1:0", &blocking_opts()).unwrap();
    let mut stranger = DatagramEndpoint::bind("127.0.0.1:0", &blocking_opts()).unwrap();

    assert_eq!(a.send(b"x").unwrap_err().kind(), ErrorKind::InvalidState);

    a.set_default_peer(b.local_endpoint().unwrap()).unwrap();
    assert_eq!(a.state(), State::Connected);
    assert_eq!(a.default_peer(), Some(b.local_endpoint().unwrap()));

    stranger
        .send_to(b"noise", a.local_endpoint().unwrap())
        .unwrap();
    b.send_to(b"hello", a.local_endpoint().unwrap()).unwrap();

    let mut buf = [0u8; 16];
    let n = a.receive(&mut buf).unwrap();
    assert_eq!(BStr::new(&buf[..n]), BStr::new("hello"));

    a.send(b"back").unwrap();
    let (n, from) = b.receive_from(&mut buf).unwrap();
    assert_eq!(BStr::new(&buf[..n]), BStr::new("back"));
    assert_eq!(from, a.local_endpoint().unwrap());

    a.clear_default_peer().unwrap();
    assert_eq!(a.state(), State::Bound);
    assert_eq!(a.default_peer(), None);
}

#[test]
fn test_udp_truncation() {
    setup_test_logging();
    let mut receiver = DatagramEndpoint::bind(ipv4_localhost(), &blocking_opts()).unwrap();
    let mut sender = DatagramEndpoint::bind(ipv4_localhost(), &blocking_opts()).unwrap();
    let target = receiver.local_endpoint().unwrap();

    sender.send_to(&[7u8; 16], target).unwrap();
    sender.send_to(b"ok", target).unwrap();

    let err = receiver.receive_from(&mut [0u8; 4]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MessageTruncated, "{err:#}");

    // The truncated datagram was consumed, the next one is intact.
    let mut buf = [0u8; 4];
    let (n, _) = receiver.receive_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"ok");
}

#[test]
fn test_subsystem_lifecycle_is_idempotent() {
    platform::initialize().unwrap();
    platform::initialize().unwrap();
    assert!(platform::is_initialized());
    let _udp = DatagramEndpoint::bind(ipv4_localhost(), &SocketOpts::default()).unwrap();
}

#[cfg(feature = "tokio")]
#[tokio::test]
async fn test_tokio_handoff() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    setup_test_logging();
    let listener = Listener::listen(ipv4_localhost(), 5, &SocketOpts::default()).unwrap();
    let target = listener.local_endpoint().unwrap();
    let listener = listener.into_tokio().unwrap();

    let client = tokio::task::spawn_blocking(move || {
        let mut client = Connection::connect(target, &blocking_opts()).unwrap();
        client.send_all(&42u32.to_be_bytes()).unwrap();
        receive_exact(&mut client, 4)
    });

    let (mut stream, addr) = tokio::time::timeout(TIMEOUT, listener.accept())
        .await
        .context("timeout accepting")
        .unwrap()
        .unwrap();
    trace!(?addr, "accepted");
    assert_eq!(stream.read_u32().await.unwrap(), 42);
    stream.write_u32(43).await.unwrap();

    let reply = client.await.unwrap();
    assert_eq!(u32::from_be_bytes(reply.try_into().unwrap()), 43);

    let udp = DatagramEndpoint::bind(ipv4_localhost(), &SocketOpts::default()).unwrap();
    let udp_addr = udp.local_endpoint().unwrap();
    let udp = udp.into_tokio().unwrap();
    udp.send_to(b"self", SocketAddr::from(udp_addr)).await.unwrap();
    let mut buf = [0u8; 8];
    let (n, _) = tokio::time::timeout(TIMEOUT, udp.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"self");
}

#[cfg(target_os = "linux")]
#[test]
fn test_signal_does_not_cancel_blocked_receive() {
    extern "C" fn on_signal(_: libc::c_int) {}

    setup_test_logging();
    // Without SA_RESTART the blocked recv comes back with EINTR.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        libc::sigemptyset(&mut action.sa_mask);
        assert_eq!(
            libc::sigaction(libc::SIGUSR1, &action, std::ptr::null_mut()),
            0
        );
    }

    let (mut client, mut server) = local_pair();
    let (tx, rx) = std::sync::mpsc::channel();
    thread::scope(|s| {
        let blocked = s.spawn(|| {
            tx.send(unsafe { libc::pthread_self() }).unwrap();
            let mut buf = [0u8; 16];
            let n = client.receive(&mut buf)?;
            Ok::<_, crate::Error>(buf[..n].to_vec())
        });
        let thread_id = rx.recv().unwrap();
        thread::sleep(Duration::from_millis(200));
        assert_eq!(unsafe { libc::pthread_kill(thread_id, libc::SIGUSR1) }, 0);
        thread::sleep(Duration::from_millis(100));
        server.send_all(b"ping").unwrap();

        let received = blocked.join().unwrap().unwrap();
        assert_eq!(BStr::new(&received), BStr::new("ping"));
    });

    assert_eq!(client.state(), State::Connected);
    assert!(!client.canceller().is_cancelled());
}

#[test]
fn test_send_all_reports_partial_progress() {
    setup_test_logging();
    let (mut client, mut server) = local_pair();
    client.set_nonblocking(true).unwrap();

    // Far more than loopback socket buffers hold while nobody reads.
    let payload = vec![0x5au8; 64 * 1024 * 1024];
    let err = client.send_all(&payload).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WouldBlock, "{err:#}");
    assert!(
        err.sent > 0 && err.sent < payload.len(),
        "sent {} bytes",
        err.sent
    );
    assert_eq!(client.state(), State::Connected);

    let received = receive_exact(&mut server, err.sent);
    assert!(received.iter().all(|b| *b == 0x5a));
    server.set_nonblocking(true).unwrap();
    let nothing_more = server.receive(&mut [0u8; 16]).unwrap_err();
    assert!(nothing_more.is_would_block(), "{nothing_more:#}");
}

// Linux drops SYNs aimed at a listener whose accept queue is full, so a
// connect to it hangs until its timeout.
#[cfg(target_os = "linux")]
fn full_listener() -> (Listener, Vec<Connection>) {
    let listener = Listener::listen(ipv4_localhost(), 0, &SocketOpts::default()).unwrap();
    let target = listener.local_endpoint().unwrap();
    let mut queued = Vec::new();
    while queued.len() < 8 {
        match Connection::connect_timeout(
            target,
            Duration::from_millis(300),
            &SocketOpts::default(),
        ) {
            Ok(conn) => queued.push(conn),
            Err(e) if e.kind() == ErrorKind::TimedOut => return (listener, queued),
            Err(e) => panic!("unexpected error filling the accept queue: {e:#}"),
        }
    }
    panic!("accept queue never filled up");
}

#[cfg(target_os = "linux")]
#[test]
fn test_connect_timeout() {
    setup_test_logging();
    let (full, _queued) = full_listener();
    let stuck = full.local_endpoint().unwrap();

    let err =
        Connection::connect_timeout(stuck, Duration::from_millis(300), &SocketOpts::default())
            .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TimedOut, "{err:#}");

    let mut good = Listener::listen(ipv4_localhost(), 5, &SocketOpts::default()).unwrap();
    let good_addr = good.local_endpoint().unwrap();
    let client = Connection::connect_timeout(
        &[stuck, good_addr][..],
        Duration::from_millis(300),
        &SocketOpts::default(),
    )
    .unwrap();
    assert_eq!(client.remote_endpoint().unwrap(), good_addr);
    assert_eq!(
        good.accept().unwrap().remote_endpoint().unwrap(),
        client.local_endpoint().unwrap()
    );
}

#[test]
fn test_listen_on_occupied_port() {
    setup_test_logging();
    let opts = SocketOpts {
        reuse_address: false,
        ..Default::default()
    };
    let first = Listener::listen(ipv4_localhost(), 5, &opts).unwrap();
    let taken = first.local_endpoint().unwrap();

    let err = Listener::listen(taken, 5, &opts).unwrap_err();
    match err {
        crate::Error::AddressInUse { addr } => assert_eq!(addr, taken),
        other => panic!("expected AddressInUse, got {other:#}"),
    }
    assert_eq!(first.state(), State::Listening);
}

#[test]
fn test_native_socket_access() {
    #[cfg(unix)]
    use std::os::fd::AsRawFd;

    setup_test_logging();
    let opts = SocketOpts {
        keepalive: true,
        ..blocking_opts()
    };
    let mut listener = Listener::listen(ipv4_localhost(), 5, &SocketOpts::default()).unwrap();
    let mut client = Connection::connect(listener.local_endpoint().unwrap(), &opts).unwrap();
    let server = listener.accept().unwrap();

    assert!(client.handle().native().unwrap().keepalive().unwrap());
    assert!(!server.handle().native().unwrap().keepalive().unwrap());
    server
        .handle()
        .native()
        .unwrap()
        .set_keepalive(true)
        .unwrap();
    assert!(server.handle().native().unwrap().keepalive().unwrap());

    #[cfg(unix)]
    {
        let mut value: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                client.handle().as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_KEEPALIVE,
                (&mut value as *mut libc::c_int).cast(),
                &mut len,
            )
        };
        assert_eq!(rc, 0);
        assert_ne!(value, 0);
    }

    client.close();
    assert_eq!(
        client.handle().native().unwrap_err().kind(),
        ErrorKind::InvalidState
    );
    #[cfg(unix)]
    assert_eq!(client.handle().as_raw_fd(), -1);
}

#[test]
fn test_udp_default_peer_of_other_family() {
    setup_test_logging();
    let mut udp = DatagramEndpoint::bind(ipv4_localhost(), &SocketOpts::default()).unwrap();
    let err = udp.set_default_peer("[::1]:9").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidAddress, "{err:#}");
    assert_eq!(udp.state(), State::Bound);
    assert_eq!(udp.default_peer(), None);

    if !ipv6_available() {
        return;
    }
    let mut dual = DatagramEndpoint::bind(ipv6_unspecified(), &SocketOpts::default()).unwrap();
    assert!(dual.is_dualstack());
    dual.set_default_peer("127.0.0.1:9").unwrap();
    assert_eq!(dual.default_peer(), Some("127.0.0.1:9".parse().unwrap()));
}
