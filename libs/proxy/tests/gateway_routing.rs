mod harness;

use std::sync::atomic::Ordering;
use std::time::Duration;

use harness::{client_hello, tls_client_connect, EndpointHandle, ReplyBackend, TlsBackend};
use snigate_proxy::{Endpoint, RouteSource, RoutingTable};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

fn gateway(rules: &[(&str, String)]) -> Endpoint {
    let table = RoutingTable::from_pairs(rules.iter().map(|(p, t)| (*p, t.clone()))).unwrap();
    Endpoint::new("gateway", RouteSource::Sni(table))
}

#[tokio::test]
async fn tls_client_reaches_backend_through_sni_route() {
    let backend = TlsBackend::spawn("svc.internal", b"ok").await.unwrap();
    let gateway = EndpointHandle::spawn(gateway(&[(r"svc\.internal$", backend.addr.to_string())]))
        .await
        .unwrap();

    let mut stream = timeout(
        Duration::from_secs(5),
        tls_client_connect(gateway.listen_addr, "svc.internal", &backend.cert),
    )
    .await
    .unwrap()
    .unwrap();

    stream.write_all(b"hello").await.unwrap();
    stream.flush().await.unwrap();

    let mut reply = [0u8; 2];
    timeout(Duration::from_secs(5), stream.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&reply, b"ok");
    assert_eq!(backend.connection_count(), 1);
}

#[tokio::test]
async fn sniffed_hello_is_replayed_to_backend() {
    let backend = ReplyBackend::spawn(b"ok").await.unwrap();
    let gateway = EndpointHandle::spawn(gateway(&[(r"svc\.internal$", backend.addr.to_string())]))
        .await
        .unwrap();

    let hello = client_hello("svc.internal");
    let mut client = TcpStream::connect(gateway.listen_addr).await.unwrap();
    client.write_all(&hello).await.unwrap();

    let mut response = Vec::new();
    timeout(Duration::from_secs(5), client.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response, b"ok");
    assert_eq!(backend.received().await, vec![hello]);
}

#[tokio::test]
async fn first_declared_rule_wins() {
    let specific = ReplyBackend::spawn(b"specific").await.unwrap();
    let general = ReplyBackend::spawn(b"general").await.unwrap();
    let gateway = EndpointHandle::spawn(gateway(&[
        (r"^a\.example\.com$", specific.addr.to_string()),
        (r"example\.com$", general.addr.to_string()),
    ]))
    .await
    .unwrap();

    for (host, expected) in [
        ("a.example.com", &b"specific"[..]),
        ("b.example.com", &b"general"[..]),
    ] {
        let mut client = TcpStream::connect(gateway.listen_addr).await.unwrap();
        client.write_all(&client_hello(host)).await.unwrap();
        let mut response = Vec::new();
        timeout(Duration::from_secs(5), client.read_to_end(&mut response))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response, expected, "{host}");
    }
}

#[tokio::test]
async fn unroutable_connections_close_without_response() {
    let backend = ReplyBackend::spawn(b"never").await.unwrap();
    let gateway = EndpointHandle::spawn(gateway(&[(r"^svc\.internal$", backend.addr.to_string())]))
        .await
        .unwrap();

    // Unknown server name.
    let mut client = TcpStream::connect(gateway.listen_addr).await.unwrap();
    client.write_all(&client_hello("other.example")).await.unwrap();
    let mut response = Vec::new();
    timeout(Duration::from_secs(5), client.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert!(response.is_empty());

    // Not TLS at all.
    let mut client = TcpStream::connect(gateway.listen_addr).await.unwrap();
    client.write_all(b"GET / HTTP/1.1\r\nHost: svc.internal\r\n\r\n").await.unwrap();
    let mut response = Vec::new();
    timeout(Duration::from_secs(5), client.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert!(response.is_empty());

    gateway.wait_for(|s| &s.routes_failed, 1).await;
    gateway.wait_for(|s| &s.sni_failed, 1).await;
    assert!(backend.received().await.is_empty());
    assert_eq!(gateway.stats.connections_closed.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn unreachable_backend_is_a_dial_failure() {
    let dead = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap();
    let gateway = EndpointHandle::spawn(gateway(&[(".", dead.to_string())]))
        .await
        .unwrap();

    let mut client = TcpStream::connect(gateway.listen_addr).await.unwrap();
    client.write_all(&client_hello("svc.internal")).await.unwrap();
    let mut response = Vec::new();
    let _ = timeout(Duration::from_secs(5), client.read_to_end(&mut response))
        .await
        .unwrap();
    assert!(response.is_empty());

    gateway.wait_for(|s| &s.dial_failed, 1).await;
}
