//! SOCKS frontend over real TCP
//!
//! Drives the server with a genuine TCP client the way a proxy consumer
//! would: greeting, CONNECT to a hostname, then payload echo through the
//! dialer.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use strato_dns::{CachingResolver, Lookup};
use strato_engine::{BoxedConn, Dialer, SocksServer, TimeoutConn};

struct StaticLookup(IpAddr);

#[async_trait]
impl Lookup for StaticLookup {
    async fn lookup(&self, _host: &str) -> strato_dns::Result<Vec<IpAddr>> {
        Ok(vec![self.0])
    }
}

/// Dialer that records the requested target and echoes the byte stream.
struct EchoDialer {
    targets: std::sync::Mutex<Vec<SocketAddr>>,
}

#[async_trait]
impl Dialer for EchoDialer {
    async fn dial(&self, _network: &str, addr: SocketAddr) -> io::Result<BoxedConn> {
        self.targets.lock().unwrap().push(addr);
        let (near, mut far) = tokio::io::duplex(16 * 1024);
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                match far.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if far.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Ok(Box::new(near))
    }
}

#[tokio::test]
async fn tcp_client_connects_and_round_trips_payload() {
    let dialer = Arc::new(EchoDialer {
        targets: std::sync::Mutex::new(Vec::new()),
    });
    let resolver = Arc::new(CachingResolver::with_lookup(
        Arc::new(StaticLookup("192.0.2.33".parse().unwrap())),
        Duration::from_secs(600),
    ));
    let server = Arc::new(SocksServer::new(
        None,
        resolver,
        dialer.clone(),
        Duration::from_secs(5),
        Duration::from_secs(60),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((conn, _)) = listener.accept().await else {
                break;
            };
            let server = server.clone();
            tokio::spawn(async move {
                let conn = TimeoutConn::new(conn, Duration::from_secs(60));
                let _ = server.serve_conn(conn).await;
            });
        }
    });

    let mut client = TcpStream::connect(local_addr).await.unwrap();

    // Greeting, no authentication.
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut buf = [0u8; 2];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, [0x05, 0x00]);

    // CONNECT ip.example:80.
    let mut request = vec![0x05, 0x01, 0x00, 0x03, 10];
    request.extend_from_slice(b"ip.example");
    request.extend_from_slice(&80u16.to_be_bytes());
    client.write_all(&request).await.unwrap();
    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x00, "CONNECT accepted");

    // The dialer saw the resolved target.
    assert_eq!(
        dialer.targets.lock().unwrap().as_slice(),
        &["192.0.2.33:80".parse::<SocketAddr>().unwrap()]
    );

    // Exact bytes out, exact bytes back.
    let payload = b"GET / HTTP/1.1\r\nHost: ip.example\r\n\r\n";
    client.write_all(payload).await.unwrap();
    let mut echoed = vec![0u8; payload.len()];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(echoed, payload);
}

#[tokio::test]
async fn two_clients_are_served_concurrently() {
    let dialer = Arc::new(EchoDialer {
        targets: std::sync::Mutex::new(Vec::new()),
    });
    let resolver = Arc::new(CachingResolver::with_lookup(
        Arc::new(StaticLookup("192.0.2.33".parse().unwrap())),
        Duration::from_secs(600),
    ));
    let server = Arc::new(SocksServer::new(
        None,
        resolver,
        dialer,
        Duration::from_secs(5),
        Duration::from_secs(60),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((conn, _)) = listener.accept().await else {
                break;
            };
            let server = server.clone();
            tokio::spawn(async move {
                let _ = server.serve_conn(conn).await;
            });
        }
    });

    let mut tasks = Vec::new();
    for i in 0u8..2 {
        tasks.push(tokio::spawn(async move {
            let mut client = TcpStream::connect(local_addr).await.unwrap();
            client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
            let mut buf = [0u8; 2];
            client.read_exact(&mut buf).await.unwrap();

            let mut request = vec![0x05, 0x01, 0x00, 0x03, 10];
            request.extend_from_slice(b"ip.example");
            request.extend_from_slice(&443u16.to_be_bytes());
            client.write_all(&request).await.unwrap();
            let mut reply = [0u8; 10];
            client.read_exact(&mut reply).await.unwrap();
            assert_eq!(reply[1], 0x00);

            let payload = vec![i; 256];
            client.write_all(&payload).await.unwrap();
            let mut echoed = vec![0u8; 256];
            client.read_exact(&mut echoed).await.unwrap();
            assert_eq!(echoed, payload);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
}
