//! End-to-end tests: an in-process proxy, a loopback echo server, and a
//! scripted UDP resolver, exercised over real sockets with raw SOCKS5
//! bytes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use minisocks::ProxyServer;

/// Start the proxy on an ephemeral port, pointed at the given resolver.
async fn start_proxy(resolver: SocketAddr) -> SocketAddr {
    let mut server = ProxyServer::new("127.0.0.1:0").with_resolver(Some(resolver));
    let addr = server.bind().await.unwrap();
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    addr
}

/// Start a TCP echo server on an ephemeral port.
async fn start_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut sock, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = sock.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// A UDP socket nothing will ever answer from; handshake tests that
/// never reach the DNS path still need a resolver address to point at.
async fn silent_resolver() -> (Arc<UdpSocket>, SocketAddr) {
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let addr = socket.local_addr().unwrap();
    (socket, addr)
}

/// Scripted resolver: answers every query with one A record for `ip`,
/// or with NXDOMAIN when `ip` is None. Counts the queries it sees.
fn script_resolver(socket: Arc<UdpSocket>, ip: Option<[u8; 4]>, queries: Arc<AtomicUsize>) {
    tokio::spawn(async move {
        let mut buf = [0u8; 512];
        loop {
            let Ok((n, from)) = socket.recv_from(&mut buf).await else {
                break;
            };
            queries.fetch_add(1, Ordering::SeqCst);
            let reply = dns_reply(&buf[..n], ip);
            let _ = socket.send_to(&reply, from).await;
        }
    });
}

/// Build a response for `query`, echoing its question section.
fn dns_reply(query: &[u8], ip: Option<[u8; 4]>) -> Vec<u8> {
    let mut pkt = query.to_vec();
    pkt[2] = 0x81; // QR + RD
    match ip {
        Some(ip) => {
            pkt[3] = 0;
            pkt[6] = 0;
            pkt[7] = 1; // ANCOUNT=1
            pkt.extend_from_slice(&[0xC0, 0x0C]); // pointer to the qname
            pkt.extend_from_slice(&[0, 1, 0, 1]); // A, IN
            pkt.extend_from_slice(&60u32.to_be_bytes());
            pkt.extend_from_slice(&4u16.to_be_bytes());
            pkt.extend_from_slice(&ip);
        }
        None => pkt[3] = 3, // NXDOMAIN
    }
    pkt
}

/// Perform the no-auth greeting and assert the server accepts it.
async fn greet(stream: &mut TcpStream) {
    stream.write_all(&[5, 1, 0]).await.unwrap();
    let mut resp = [0u8; 2];
    stream.read_exact(&mut resp).await.unwrap();
    assert_eq!(resp, [5, 0]);
}

/// Send a CONNECT request for an IPv4 destination, return the reply.
async fn connect_ipv4(stream: &mut TcpStream, ip: [u8; 4], port: u16) -> [u8; 10] {
    let mut req = vec![5, 1, 0, 1];
    req.extend_from_slice(&ip);
    req.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&req).await.unwrap();

    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    reply
}

/// Send a CONNECT request for a domain destination, return the reply.
async fn connect_domain(stream: &mut TcpStream, domain: &str, port: u16) -> [u8; 10] {
    let mut req = vec![5, 1, 0, 3, domain.len() as u8];
    req.extend_from_slice(domain.as_bytes());
    req.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&req).await.unwrap();

    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    reply
}

async fn assert_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 1];
    let n = stream.read(&mut buf).await.unwrap();
    assert_eq!(n, 0, "expected the server to close the connection");
}

#[tokio::test]
async fn greeting_without_no_auth_is_refused_and_closed() {
    let (_resolver, resolver_addr) = silent_resolver().await;
    let proxy = start_proxy(resolver_addr).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    // offer only GSSAPI and username/password
    stream.write_all(&[5, 2, 1, 2]).await.unwrap();

    let mut resp = [0u8; 2];
    stream.read_exact(&mut resp).await.unwrap();
    assert_eq!(resp, [5, 0xFF]);
    assert_closed(&mut stream).await;
}

#[tokio::test]
async fn wrong_version_greeting_is_closed_without_reply() {
    let (_resolver, resolver_addr) = silent_resolver().await;
    let proxy = start_proxy(resolver_addr).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(&[4, 1, 0]).await.unwrap();
    assert_closed(&mut stream).await;
}

#[tokio::test]
async fn bind_command_is_not_supported() {
    let (_resolver, resolver_addr) = silent_resolver().await;
    let proxy = start_proxy(resolver_addr).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    greet(&mut stream).await;

    // BIND to 127.0.0.1:80
    stream
        .write_all(&[5, 2, 0, 1, 127, 0, 0, 1, 0, 80])
        .await
        .unwrap();
    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x07);
    assert_closed(&mut stream).await;
}

#[tokio::test]
async fn ipv6_destination_is_not_supported() {
    let (_resolver, resolver_addr) = silent_resolver().await;
    let proxy = start_proxy(resolver_addr).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    greet(&mut stream).await;

    let mut req = vec![5, 1, 0, 4];
    req.extend_from_slice(&[0u8; 16]);
    req.extend_from_slice(&80u16.to_be_bytes());
    stream.write_all(&req).await.unwrap();

    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x08);
    assert_closed(&mut stream).await;
}

#[tokio::test]
async fn connect_failure_reports_host_unreachable() {
    let (_resolver, resolver_addr) = silent_resolver().await;
    let proxy = start_proxy(resolver_addr).await;

    // Grab a port with nothing listening on it
    let closed_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    greet(&mut stream).await;
    let reply = connect_ipv4(&mut stream, [127, 0, 0, 1], closed_port).await;
    assert_eq!(reply[1], 0x04);
    assert_closed(&mut stream).await;
}

#[tokio::test]
async fn connect_ipv4_and_relay_both_ways() {
    let (_resolver, resolver_addr) = silent_resolver().await;
    let proxy = start_proxy(resolver_addr).await;
    let echo = start_echo().await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    greet(&mut stream).await;
    let reply = connect_ipv4(&mut stream, [127, 0, 0, 1], echo.port()).await;
    assert_eq!(reply, [5, 0, 0, 1, 0, 0, 0, 0, 0, 0]);

    // Round-trip well past the relay buffer capacity, chunk by chunk,
    // checking byte-exact, in-order delivery
    let chunk: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    let mut back = vec![0u8; chunk.len()];
    for _ in 0..64 {
        stream.write_all(&chunk).await.unwrap();
        stream.read_exact(&mut back).await.unwrap();
        assert_eq!(back, chunk);
    }
}

#[tokio::test]
async fn domain_destination_resolves_and_relays() {
    let queries = Arc::new(AtomicUsize::new(0));
    let (resolver, resolver_addr) = silent_resolver().await;
    script_resolver(resolver, Some([127, 0, 0, 1]), queries.clone());

    let proxy = start_proxy(resolver_addr).await;
    let echo = start_echo().await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    greet(&mut stream).await;
    let reply = connect_domain(&mut stream, "echo.test", echo.port()).await;
    assert_eq!(reply, [5, 0, 0, 1, 0, 0, 0, 0, 0, 0]);

    stream.write_all(b"ping").await.unwrap();
    let mut back = [0u8; 4];
    stream.read_exact(&mut back).await.unwrap();
    assert_eq!(&back, b"ping");

    assert_eq!(queries.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unresolvable_domain_reports_host_unreachable() {
    let queries = Arc::new(AtomicUsize::new(0));
    let (resolver, resolver_addr) = silent_resolver().await;
    script_resolver(resolver, None, queries.clone());

    let proxy = start_proxy(resolver_addr).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    greet(&mut stream).await;
    let reply = connect_domain(&mut stream, "nosuch.test", 80).await;
    assert_eq!(reply[1], 0x04);
    assert_closed(&mut stream).await;
}

#[tokio::test]
async fn handshake_sent_as_one_segment_still_works() {
    let (_resolver, resolver_addr) = silent_resolver().await;
    let proxy = start_proxy(resolver_addr).await;
    let echo = start_echo().await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();

    // greeting and request pipelined into a single write
    let mut bytes = vec![5, 1, 0];
    bytes.extend_from_slice(&[5, 1, 0, 1, 127, 0, 0, 1]);
    bytes.extend_from_slice(&echo.port().to_be_bytes());
    stream.write_all(&bytes).await.unwrap();

    let mut resp = [0u8; 2];
    stream.read_exact(&mut resp).await.unwrap();
    assert_eq!(resp, [5, 0]);

    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0);

    stream.write_all(b"hello").await.unwrap();
    let mut back = [0u8; 5];
    stream.read_exact(&mut back).await.unwrap();
    assert_eq!(&back, b"hello");
}
