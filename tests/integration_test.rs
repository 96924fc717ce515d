//! Integration tests for otunnel
//!
//! Tests full links between two endpoints over loopback TCP:
//! - Hello exchange and enciphered framing
//! - Session requests and pings
//! - Forward and reverse tunnels, TCP and UDP
//! - Channel close propagation and idempotent teardown

use bytes::Bytes;
use otunnel::crypto::Role;
use otunnel::link::ECHO_ACTION;
use otunnel::session::Request;
use otunnel::transport::{self, client_hello, server_hello, FramedConn};
use otunnel::tunnel::{ListenKey, ListenRegistry, TunnelMode};
use otunnel::{Link, LinkConfig, LinkError, Proto, TunnelConfig};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Server and client links connected over loopback TCP
async fn link_pair(secret: Option<&'static str>) -> (Link, Link) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut conn = FramedConn::from_stream(stream);
        if let Some(secret) = secret {
            conn = conn.secure(secret.as_bytes(), 10, Role::Responder).unwrap();
        }
        server_hello(&mut conn, 7).await.unwrap();

        let link = Link::new(LinkConfig::server(7)).unwrap();
        link.bind(conn).unwrap();
        link
    });

    let stream = transport::connect(&addr.to_string(), Duration::from_secs(5))
        .await
        .unwrap();
    let mut conn = FramedConn::from_stream(stream);
    if let Some(secret) = secret {
        conn = conn.secure(secret.as_bytes(), 10, Role::Initiator).unwrap();
    }
    let link_id = client_hello(&mut conn).await.unwrap();
    assert_eq!(link_id, 7);

    let client = Link::new(LinkConfig::client(link_id)).unwrap();
    client.bind(conn).unwrap();

    (server.await.unwrap(), client)
}

/// TCP service echoing everything back
async fn spawn_echo_service() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut read, mut write) = socket.into_split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    addr
}

/// TCP service that greets and hangs up
async fn spawn_closing_service(greeting: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let _ = socket.write_all(greeting).await;
        }
    });
    addr
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(TEST_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_echo_request_sizes() {
    let (server, client) = link_pair(None).await;

    for size in [0usize, 1, 4095, 4096, 65536] {
        let body: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let response = client
            .request(Request::new(ECHO_ACTION, body.clone()))
            .await
            .unwrap();
        assert!(response.is_success());
        assert_eq!(response.body, Bytes::from(body), "size {}", size);
    }

    // Both directions serve requests
    let response = server
        .request(Request::new(ECHO_ACTION, Bytes::from_static(b"from server")))
        .await
        .unwrap();
    assert_eq!(&response.body[..], b"from server");
    assert_eq!(client.session_manager().pending(), 0);

    client.close();
    server.close();
}

#[tokio::test]
async fn test_unknown_action_reports_dispatch_failure() {
    let (server, client) = link_pair(None).await;

    let response = client
        .request(Request::new("/nope", Bytes::new()))
        .await
        .unwrap();
    assert_eq!(response.status, otunnel::session::STATUS_DISPATCH_FAILED);
    assert!(!client.is_stopped());

    client.close();
    server.close();
}

#[tokio::test]
async fn test_oversized_request_fails_alone() {
    let (server, client) = link_pair(None).await;

    let err = client
        .request_timeout(
            Request::new(ECHO_ACTION, vec![0u8; 900_000]),
            Duration::from_secs(2),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::MessageTooLarge { .. }));
    assert_eq!(client.session_manager().pending(), 0);

    // The link and its other sessions are unaffected
    assert!(!client.is_stopped() && !server.is_stopped());
    let response = client
        .request(Request::new(ECHO_ACTION, Bytes::from_static(b"small")))
        .await
        .unwrap();
    assert_eq!(&response.body[..], b"small");

    client.close();
    server.close();
}

#[tokio::test]
async fn test_enciphered_link() {
    let (server, client) = link_pair(Some("correct horse")).await;

    let response = client
        .request(Request::new(ECHO_ACTION, Bytes::from_static(b"secret payload")))
        .await
        .unwrap();
    assert_eq!(&response.body[..], b"secret payload");
    client.ping().await.unwrap();

    client.close();
    server.close();
}

#[tokio::test]
async fn test_ping_live_link() {
    let (server, client) = link_pair(None).await;

    for _ in 0..3 {
        let rtt = client.ping().await.unwrap();
        assert!(rtt <= client.config().write_timeout);
    }
    server.ping().await.unwrap();
    assert_eq!(client.pending_pings(), 0);

    client.close();
    server.close();
}

#[tokio::test]
async fn test_session_id_parity_under_concurrency() {
    let (server, client) = link_pair(None).await;

    let mut tasks = Vec::new();
    for link in [server.clone(), client.clone()] {
        for _ in 0..4 {
            let link = link.clone();
            tasks.push(tokio::spawn(async move {
                let sessions: Vec<_> = (0..2500)
                    .map(|_| link.session_manager().new_session().unwrap())
                    .collect();
                let ids: Vec<u32> = sessions.iter().map(|s| s.id()).collect();
                (link.config().is_server_side, ids, sessions)
            }));
        }
    }

    let mut seen = HashSet::new();
    let mut held = Vec::new();
    for task in tasks {
        let (is_server_side, ids, sessions) = task.await.unwrap();
        for id in ids {
            assert_eq!(id % 2 == 1, is_server_side, "id {} has wrong parity", id);
            assert!(seen.insert(id), "id {} allocated twice", id);
        }
        held.push(sessions);
    }
    assert_eq!(seen.len(), 20_000);

    drop(held);
    client.close();
    server.close();
}

#[tokio::test]
async fn test_forward_tunnel_concurrent_channels() {
    let (server, client) = link_pair(None).await;
    let target = spawn_echo_service().await;

    let tunnel = client
        .open_tunnel(TunnelConfig::new(
            Proto::Tcp,
            "127.0.0.1",
            0,
            "127.0.0.1",
            target.port(),
            false,
        ))
        .await
        .unwrap();
    assert_eq!(tunnel.mode(), TunnelMode::Listening);

    let remote = server.tunnel(tunnel.id()).unwrap();
    assert_eq!(remote.mode(), TunnelMode::Dialing);
    assert_eq!(remote.config().local_port, target.port());

    let entry = tunnel.local_addr().unwrap();
    let mut tasks = Vec::new();
    for i in 0..50u32 {
        tasks.push(tokio::spawn(async move {
            let mut stream = TcpStream::connect(entry).await.unwrap();
            let payload = format!("connection-{:02}|", i).repeat(300).into_bytes();
            stream.write_all(&payload).await.unwrap();

            let mut echoed = vec![0u8; payload.len()];
            stream.read_exact(&mut echoed).await.unwrap();
            assert_eq!(echoed, payload, "cross-talk on connection {}", i);
        }));
    }
    for task in tasks {
        tokio::time::timeout(TEST_TIMEOUT, task).await.unwrap().unwrap();
    }

    client.close();
    server.close();
}

#[tokio::test]
async fn test_reverse_tunnel() {
    let (server, client) = link_pair(None).await;
    let target = spawn_echo_service().await;

    // The client reaches the target; the server listens
    let tunnel = client
        .open_tunnel(TunnelConfig::new(
            Proto::Tcp,
            "127.0.0.1",
            target.port(),
            "127.0.0.1",
            0,
            true,
        ))
        .await
        .unwrap();
    assert_eq!(tunnel.mode(), TunnelMode::Dialing);
    assert!(tunnel.local_addr().is_none());

    let remote = server.tunnel(tunnel.id()).unwrap();
    assert_eq!(remote.mode(), TunnelMode::Listening);
    let entry = remote.local_addr().unwrap();

    let mut stream = TcpStream::connect(entry).await.unwrap();
    stream.write_all(b"through the reverse tunnel").await.unwrap();
    let mut echoed = [0u8; 26];
    tokio::time::timeout(TEST_TIMEOUT, stream.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"through the reverse tunnel");

    client.close();
    server.close();
}

#[tokio::test]
async fn test_channel_close_propagates() {
    let (server, client) = link_pair(None).await;
    let target = spawn_closing_service(b"bye").await;

    let tunnel = client
        .open_tunnel(TunnelConfig::new(
            Proto::Tcp,
            "127.0.0.1",
            0,
            "127.0.0.1",
            target.port(),
            false,
        ))
        .await
        .unwrap();
    let remote = server.tunnel(tunnel.id()).unwrap();
    let entry = tunnel.local_addr().unwrap();

    for _ in 0..2 {
        let mut stream = TcpStream::connect(entry).await.unwrap();
        // The dialing side only dials once traffic arrives
        stream.write_all(b"hi").await.unwrap();

        let mut received = Vec::new();
        tokio::time::timeout(TEST_TIMEOUT, stream.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, b"bye");

        eventually(|| tunnel.channels().is_empty() && remote.channels().is_empty()).await;
    }

    client.close();
    server.close();
}

#[tokio::test]
async fn test_dial_failure_closes_accepted_socket() {
    let (server, client) = link_pair(None).await;

    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = unused.local_addr().unwrap().port();
    drop(unused);

    let tunnel = client
        .open_tunnel(TunnelConfig::new(
            Proto::Tcp,
            "127.0.0.1",
            0,
            "127.0.0.1",
            dead_port,
            false,
        ))
        .await
        .unwrap();

    let mut stream = TcpStream::connect(tunnel.local_addr().unwrap()).await.unwrap();
    stream.write_all(b"anyone there?").await.unwrap();

    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(TEST_TIMEOUT, stream.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
    eventually(|| tunnel.channels().is_empty()).await;
    assert!(!client.is_stopped());

    client.close();
    server.close();
}

#[tokio::test]
async fn test_udp_forward_tunnel() {
    let (server, client) = link_pair(None).await;

    let service = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target = service.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        while let Ok((n, peer)) = service.recv_from(&mut buf).await {
            let _ = service.send_to(&buf[..n], peer).await;
        }
    });

    let tunnel = client
        .open_tunnel(TunnelConfig::new(
            Proto::Udp,
            "127.0.0.1",
            0,
            "127.0.0.1",
            target.port(),
            false,
        ))
        .await
        .unwrap();
    let entry = tunnel.local_addr().unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    for datagram in [&b"first"[..], b"second"] {
        socket.send_to(datagram, entry).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, from) = tokio::time::timeout(TEST_TIMEOUT, socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], datagram);
        assert_eq!(from, entry);
    }
    assert_eq!(tunnel.channels().len(), 1);

    client.close();
    server.close();
}

#[tokio::test]
async fn test_duplicate_listen_address_rejected() {
    let (server, client) = link_pair(None).await;
    let target = spawn_echo_service().await;

    let first = client
        .open_tunnel(TunnelConfig::new(
            Proto::Tcp,
            "127.0.0.1",
            0,
            "127.0.0.1",
            target.port(),
            true,
        ))
        .await
        .unwrap();
    let port = server.tunnel(first.id()).unwrap().local_addr().unwrap().port();

    // Same listen address on the server again
    let err = client
        .open_tunnel(TunnelConfig::new(
            Proto::Tcp,
            "127.0.0.1",
            target.port(),
            "127.0.0.1",
            port,
            true,
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::RemoteRejected(_)));
    assert_eq!(server.tunnel_manager().len(), 1);

    client.close();
    server.close();
}

#[tokio::test]
async fn test_link_close_propagates_to_peer() {
    let (server, client) = link_pair(None).await;
    let target = spawn_echo_service().await;

    let tunnel = client
        .open_tunnel(TunnelConfig::new(
            Proto::Tcp,
            "127.0.0.1",
            0,
            "127.0.0.1",
            target.port(),
            false,
        ))
        .await
        .unwrap();
    let entry = tunnel.local_addr().unwrap();

    client.close();
    tokio::time::timeout(TEST_TIMEOUT, server.wait())
        .await
        .unwrap();
    assert!(server.is_stopped());
    assert!(tunnel.is_closed());
    assert!(tunnel.channels().is_empty());

    // Listen address is free for the next link
    let key = ListenKey::new(Proto::Tcp, "127.0.0.1", entry.port());
    assert!(!ListenRegistry::global().contains(&key));

    server.close();
}

#[tokio::test]
async fn test_concurrent_close_is_idempotent() {
    let (server, client) = link_pair(None).await;
    let target = spawn_echo_service().await;

    let tunnel = client
        .open_tunnel(TunnelConfig::new(
            Proto::Tcp,
            "127.0.0.1",
            0,
            "127.0.0.1",
            target.port(),
            false,
        ))
        .await
        .unwrap();

    let mut stream = TcpStream::connect(tunnel.local_addr().unwrap()).await.unwrap();
    stream.write_all(b"x").await.unwrap();
    let mut one = [0u8; 1];
    stream.read_exact(&mut one).await.unwrap();
    let channel = tunnel.channels().get(1).unwrap();

    let mut closers = Vec::new();
    for _ in 0..4 {
        let (client, server, tunnel, channel) =
            (client.clone(), server.clone(), tunnel.clone(), channel.clone());
        closers.push(tokio::spawn(async move {
            channel.close();
            tunnel.close();
            client.close();
            server.close();
        }));
    }
    for closer in closers {
        closer.await.unwrap();
    }

    assert!(channel.is_closed());
    assert!(tunnel.is_closed());
    assert!(client.is_closed() && server.is_closed());
    tokio::time::timeout(TEST_TIMEOUT, client.wait()).await.unwrap();
    tokio::time::timeout(TEST_TIMEOUT, server.wait()).await.unwrap();
}

#[tokio::test]
async fn test_keepalive_detects_dead_peer() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // Completes the hello, then never reads again
    let (held_tx, held_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut conn = FramedConn::from_stream(stream);
        server_hello(&mut conn, 1).await.unwrap();
        let _ = held_rx.await;
        drop(conn);
    });

    let stream = transport::connect(&addr.to_string(), Duration::from_secs(5))
        .await
        .unwrap();
    let mut conn = FramedConn::from_stream(stream);
    let link_id = client_hello(&mut conn).await.unwrap();

    let link = Link::new(LinkConfig {
        keepalive_interval: Duration::from_millis(100),
        keepalive_check_interval: Duration::from_millis(50),
        max_idle: Duration::from_millis(400),
        write_timeout: Duration::from_millis(100),
        ..LinkConfig::client(link_id)
    })
    .unwrap();
    link.bind(conn).unwrap();

    tokio::time::timeout(TEST_TIMEOUT, link.wait())
        .await
        .unwrap();
    assert!(link.is_stopped());

    link.close();
    let _ = held_tx.send(());
}
