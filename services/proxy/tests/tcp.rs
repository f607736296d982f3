
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use harness::{
    eventually, read_until, within, PacketEchoBackend, ProxyHandle, ProxyV2Backend,
    TaggedEchoBackend,
};
use hopper_proxy::transport::PacketCodec;
use hopper_proxy::{Packet, PacketTransport, ProxyConfig, ProxyProtocol, RawTransport};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

#[tokio::test]
async fn raw_client_is_transferred_between_tcp_backends() {
    let lobby = TaggedEchoBackend::spawn("lobby").await.unwrap();
    let survival = TaggedEchoBackend::spawn("survival").await.unwrap();
    let proxy = ProxyHandle::spawn(
        RawTransport::new(),
        vec![lobby.backend("lobby"), survival.backend("survival")],
        ProxyConfig::default(),
    )
    .await
    .unwrap();

    let mut client = TcpStream::connect(proxy.listen_addr).await.unwrap();
    client.write_all(b"hello").await.unwrap();
    read_until(&mut client, "lobby:hello").await;

    client.write_all(b"/transfer survival\n").await.unwrap();
    read_until(&mut client, "Transferred to server survival").await;

    client.write_all(b"again").await.unwrap();
    read_until(&mut client, "survival:again").await;

    assert_eq!(lobby.connection_count(), 1);
    assert_eq!(survival.connection_count(), 1);
    assert_eq!(
        proxy.proxy.stats().transfers_completed.load(Ordering::Relaxed),
        1
    );
}

#[tokio::test]
async fn raw_unknown_target_is_answered_in_band() {
    let lobby = TaggedEchoBackend::spawn("lobby").await.unwrap();
    let proxy = ProxyHandle::spawn(
        RawTransport::new(),
        vec![lobby.backend("lobby")],
        ProxyConfig::default(),
    )
    .await
    .unwrap();

    let mut client = TcpStream::connect(proxy.listen_addr).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    read_until(&mut client, "lobby:ping").await;

    client.write_all(b"/transfer nowhere\n").await.unwrap();
    read_until(&mut client, "Server nowhere not found.").await;

    client.write_all(b"still here").await.unwrap();
    read_until(&mut client, "lobby:still here").await;
}

#[tokio::test]
async fn raw_client_disconnect_removes_session() {
    let lobby = TaggedEchoBackend::spawn("lobby").await.unwrap();
    let proxy = ProxyHandle::spawn(
        RawTransport::new(),
        vec![lobby.backend("lobby")],
        ProxyConfig::default(),
    )
    .await
    .unwrap();

    let mut client = TcpStream::connect(proxy.listen_addr).await.unwrap();
    client.write_all(b"hi").await.unwrap();
    read_until(&mut client, "lobby:hi").await;
    assert_eq!(proxy.proxy.registry().len(), 1);

    drop(client);
    eventually("session removed", || proxy.proxy.registry().is_empty()).await;
    eventually("connection released", || {
        proxy
            .listener
            .stats()
            .connections_active
            .load(Ordering::Relaxed)
            == 0
    })
    .await;
}

#[tokio::test]
async fn raw_unreachable_backend_notifies_and_closes() {
    // Nothing listens on the backend port once the probe listener is gone.
    let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = probe.local_addr().unwrap().port();
    drop(probe);

    let proxy = ProxyHandle::spawn(
        RawTransport::new(),
        vec![hopper_proxy::Backend::new("gone", "127.0.0.1", dead_port)],
        ProxyConfig::default(),
    )
    .await
    .unwrap();

    let mut client = TcpStream::connect(proxy.listen_addr).await.unwrap();
    let text = read_until(&mut client, "Could not connect to server gone").await;
    assert!(text.contains("Could not connect to server gone: "));

    let mut rest = Vec::new();
    let closed = within("client closed", client.read_to_end(&mut rest)).await;
    assert!(closed.is_ok());
}

#[tokio::test]
async fn raw_backend_gets_proxy_v2_header() {
    let mut backend = ProxyV2Backend::spawn().await.unwrap();
    let config = ProxyConfig {
        proxy_protocol: ProxyProtocol::V2,
        ..Default::default()
    };
    let proxy = ProxyHandle::spawn(
        RawTransport::new().with_proxy_protocol(ProxyProtocol::V2),
        vec![backend.backend("lobby")],
        config,
    )
    .await
    .unwrap();

    let client = TcpStream::connect(proxy.listen_addr).await.unwrap();
    let header = backend.header().await;

    assert_eq!(header.src_addr, client.local_addr().unwrap());
    assert_eq!(header.dst_addr, proxy.listen_addr);
}

#[tokio::test]
async fn listener_enforces_connection_limit() {
    let lobby = TaggedEchoBackend::spawn("lobby").await.unwrap();
    let config = ProxyConfig {
        max_connections: 1,
        ..Default::default()
    };
    let proxy = ProxyHandle::spawn(RawTransport::new(), vec![lobby.backend("lobby")], config)
        .await
        .unwrap();

    let mut first = TcpStream::connect(proxy.listen_addr).await.unwrap();
    first.write_all(b"one").await.unwrap();
    read_until(&mut first, "lobby:one").await;

    let mut second = TcpStream::connect(proxy.listen_addr).await.unwrap();
    let mut buf = [0u8; 16];
    let n = within("rejected connection closed", second.read(&mut buf))
        .await
        .unwrap_or(0);
    assert_eq!(n, 0);
    eventually("rejection counted", || {
        proxy
            .listener
            .stats()
            .connections_rejected
            .load(Ordering::Relaxed)
            == 1
    })
    .await;
}

async fn packet_client(addr: std::net::SocketAddr) -> Framed<TcpStream, PacketCodec> {
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut framed = Framed::new(stream, PacketCodec::default());
    framed.send(Packet::login("Steve", "1.21.0")).await.unwrap();
    framed
}

async fn next_packet(framed: &mut Framed<TcpStream, PacketCodec>) -> Packet {
    within("packet", framed.next())
        .await
        .expect("connection closed")
        .expect("decode error")
}

#[tokio::test]
async fn packet_client_is_transferred_with_its_login() {
    let lobby = PacketEchoBackend::spawn("lobby").await.unwrap();
    let survival = PacketEchoBackend::spawn("survival").await.unwrap();
    let proxy = ProxyHandle::spawn(
        PacketTransport::new(),
        vec![lobby.backend("lobby"), survival.backend("survival")],
        ProxyConfig::default(),
    )
    .await
    .unwrap();

    let mut client = packet_client(proxy.listen_addr).await;
    client.send(Packet::new("move", "1,2,3")).await.unwrap();
    assert_eq!(
        next_packet(&mut client).await,
        Packet::new("move", "lobby:1,2,3")
    );

    client.send(Packet::text("/transfer survival")).await.unwrap();
    assert_eq!(
        next_packet(&mut client).await,
        Packet::text("Transferred to server survival")
    );

    client.send(Packet::new("move", "4,5,6")).await.unwrap();
    assert_eq!(
        next_packet(&mut client).await,
        Packet::new("move", "survival:4,5,6")
    );

    let login = ("Steve".to_string(), "1.21.0".to_string());
    assert_eq!(lobby.logins(), [login.clone()]);
    assert_eq!(survival.logins(), [login]);
}

#[tokio::test]
async fn packet_client_without_login_is_dropped() {
    let lobby = PacketEchoBackend::spawn("lobby").await.unwrap();
    let proxy = ProxyHandle::spawn(
        PacketTransport::new().with_handshake_timeout(Duration::from_millis(200)),
        vec![lobby.backend("lobby")],
        ProxyConfig::default(),
    )
    .await
    .unwrap();

    let stream = TcpStream::connect(proxy.listen_addr).await.unwrap();
    let mut framed = Framed::new(stream, PacketCodec::default());
    framed.send(Packet::text("hello")).await.unwrap();

    let next = within("connection dropped", framed.next()).await;
    assert!(!matches!(next, Some(Ok(_))));
    eventually("handshake failure counted", || {
        proxy
            .listener
            .stats()
            .handshakes_failed
            .load(Ordering::Relaxed)
            == 1
    })
    .await;
    assert!(proxy.proxy.registry().is_empty());
}
