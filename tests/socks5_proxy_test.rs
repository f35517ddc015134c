//! End-to-end tests for the SOCKS5 listener over real TCP sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use multiproxy::{Credentials, ProxyConfig, ProxyContext, Socks5Server};

/// Start a SOCKS5 server on an ephemeral port.
async fn start_proxy(config: ProxyConfig) -> (SocketAddr, Arc<ProxyContext>) {
    let mut server = Socks5Server::new(config.with_socks5_listen("127.0.0.1:0").with_http_listen(None));
    let addr = server.bind().await.expect("bind proxy");
    let ctx = Arc::clone(server.context());
    tokio::spawn(async move { server.run().await });
    (addr, ctx)
}

/// Upstream that expects `hello`, answers `world` and then waits for EOF.
async fn start_upstream() -> (SocketAddr, tokio::task::JoinHandle<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut hello = [0u8; 5];
        stream.read_exact(&mut hello).await.unwrap();
        stream.write_all(b"world").await.unwrap();
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        let mut received = hello.to_vec();
        received.extend(rest);
        received
    });
    (addr, handle)
}

fn connect_ipv4(addr: SocketAddr) -> Vec<u8> {
    let SocketAddr::V4(v4) = addr else {
        panic!("expected an IPv4 address");
    };
    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&v4.ip().octets());
    request.extend_from_slice(&v4.port().to_be_bytes());
    request
}

async fn wait_until_idle(ctx: &ProxyContext) {
    for _ in 0..100 {
        if ctx.registry.is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("sessions still registered: {:?}", ctx.registry.snapshot());
}

/// Test a full CONNECT exchange relays bytes unchanged both ways.
#[tokio::test]
async fn test_connect_relays_both_directions() {
    let (proxy, ctx) = start_proxy(ProxyConfig::new()).await;
    let (upstream, received) = start_upstream().await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut selection = [0u8; 2];
    client.read_exact(&mut selection).await.unwrap();
    assert_eq!(selection, [0x05, 0x00]);

    client.write_all(&connect_ipv4(upstream)).await.unwrap();
    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[..4], [0x05, 0x00, 0x00, 0x01]);
    assert_eq!(reply[4..8], [127, 0, 0, 1]);

    client.write_all(b"hello").await.unwrap();
    let mut answer = [0u8; 5];
    client.read_exact(&mut answer).await.unwrap();
    assert_eq!(&answer, b"world");

    client.write_all(b" again").await.unwrap();
    client.shutdown().await.unwrap();
    let mut tail = Vec::new();
    client.read_to_end(&mut tail).await.unwrap();
    assert!(tail.is_empty());

    assert_eq!(received.await.unwrap(), b"hello again");
    wait_until_idle(&ctx).await;
}

/// Test a domain name target is resolved at dial time.
#[tokio::test]
async fn test_connect_by_domain_name() {
    let (proxy, _ctx) = start_proxy(ProxyConfig::new()).await;
    let (upstream, received) = start_upstream().await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut selection = [0u8; 2];
    client.read_exact(&mut selection).await.unwrap();

    let mut request = vec![0x05, 0x01, 0x00, 0x03, 9];
    request.extend_from_slice(b"localhost");
    request.extend_from_slice(&upstream.port().to_be_bytes());
    client.write_all(&request).await.unwrap();

    let mut header = [0u8; 4];
    client.read_exact(&mut header).await.unwrap();
    assert_eq!(header[..2], [0x05, 0x00]);
    // Bound address may be IPv4 or IPv6 depending on what localhost resolved to
    let rest = if header[3] == 0x04 { 18 } else { 6 };
    let mut bound = vec![0u8; rest];
    client.read_exact(&mut bound).await.unwrap();

    client.write_all(b"hello").await.unwrap();
    let mut answer = [0u8; 5];
    client.read_exact(&mut answer).await.unwrap();
    assert_eq!(&answer, b"world");
    drop(client);

    assert_eq!(received.await.unwrap(), b"hello");
}

/// Test an unknown address type is answered with 0x08 and a zeroed address.
#[tokio::test]
async fn test_invalid_address_type() {
    let (proxy, ctx) = start_proxy(ProxyConfig::new()).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00, 0x02]).await.unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    assert_eq!(
        response,
        [0x05, 0x00, 0x05, 0x08, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
    );

    wait_until_idle(&ctx).await;
}

/// Test a refused upstream maps to CONNECTION REFUSED.
#[tokio::test]
async fn test_connection_refused() {
    let (proxy, ctx) = start_proxy(ProxyConfig::new()).await;

    let closed = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    client.write_all(&connect_ipv4(closed)).await.unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    assert_eq!(response.len(), 12);
    assert_eq!(response[2..4], [0x05, 0x05]);

    wait_until_idle(&ctx).await;
}

/// Test username/password authentication gates the request phase.
#[tokio::test]
async fn test_userpass_authentication() {
    let creds: Credentials = [("alice", "s3cret")].into_iter().collect();
    let (proxy, _ctx) = start_proxy(ProxyConfig::new().with_credentials(creds)).await;
    let (upstream, received) = start_upstream().await;

    // NoAuth alone is refused once users are configured
    let mut rejected = TcpStream::connect(proxy).await.unwrap();
    rejected.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut response = Vec::new();
    rejected.read_to_end(&mut response).await.unwrap();
    assert_eq!(response, [0x05, 0xFF]);

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(&[0x05, 0x02, 0x00, 0x02]).await.unwrap();
    let mut selection = [0u8; 2];
    client.read_exact(&mut selection).await.unwrap();
    assert_eq!(selection, [0x05, 0x02]);

    let mut login = vec![0x01, 5];
    login.extend_from_slice(b"alice");
    login.push(6);
    login.extend_from_slice(b"s3cret");
    client.write_all(&login).await.unwrap();
    let mut status = [0u8; 2];
    client.read_exact(&mut status).await.unwrap();
    assert_eq!(status, [0x01, 0x00]);

    client.write_all(&connect_ipv4(upstream)).await.unwrap();
    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x00);

    client.write_all(b"hello").await.unwrap();
    let mut answer = [0u8; 5];
    client.read_exact(&mut answer).await.unwrap();
    assert_eq!(&answer, b"world");
    drop(client);

    assert_eq!(received.await.unwrap(), b"hello");
}
