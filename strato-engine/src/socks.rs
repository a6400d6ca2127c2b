//! SOCKS5 frontend
//!
//! RFC 1928 CONNECT with optional RFC 1929 username/password
//! authentication. Targets are resolved through the caching resolver and
//! dialed through the virtual stack; each upstream connection is wrapped
//! with the idle timeout before relaying.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use strato_dns::CachingResolver;

use crate::error::{Error, Result};
use crate::net::TimeoutConn;

const SOCKS_VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;

const METHOD_NONE: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_UNACCEPTABLE: u8 = 0xff;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_SUCCESS: u8 = 0x00;
const REPLY_GENERAL_FAILURE: u8 = 0x01;
const REPLY_HOST_UNREACHABLE: u8 = 0x04;
const REPLY_CONNECTION_REFUSED: u8 = 0x05;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;

/// Boxed byte stream handed back by a dialer.
pub trait StreamConn: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> StreamConn for T {}

pub type BoxedConn = Box<dyn StreamConn>;

/// Dials CONNECT targets; production routes through the virtual stack.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, network: &str, addr: SocketAddr) -> io::Result<BoxedConn>;
}

/// The requested CONNECT target before resolution.
enum TargetHost {
    Ip(IpAddr),
    Domain(String),
}

impl std::fmt::Display for TargetHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetHost::Ip(ip) => write!(f, "{ip}"),
            TargetHost::Domain(domain) => write!(f, "{domain}"),
        }
    }
}

/// SOCKS5 server for one frontend.
pub struct SocksServer {
    credentials: Option<(String, String)>,
    resolver: Arc<CachingResolver>,
    dialer: Arc<dyn Dialer>,
    connection_timeout: Duration,
    idle_timeout: Duration,
}

impl SocksServer {
    pub fn new(
        credentials: Option<(String, String)>,
        resolver: Arc<CachingResolver>,
        dialer: Arc<dyn Dialer>,
        connection_timeout: Duration,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            credentials,
            resolver,
            dialer,
            connection_timeout,
            idle_timeout,
        }
    }

    /// Serve one client connection to completion.
    pub async fn serve_conn<S>(&self, mut stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        self.handshake(&mut stream).await?;

        let (host, port, command) = read_request(&mut stream).await?;
        if command != CMD_CONNECT {
            send_reply(&mut stream, REPLY_COMMAND_NOT_SUPPORTED).await?;
            return Err(Error::Socks(format!("unsupported command {command:#04x}")));
        }

        let ip = match &host {
            TargetHost::Ip(ip) => *ip,
            TargetHost::Domain(domain) => match self.resolver.resolve(domain).await {
                Ok(ip) => ip,
                Err(e) => {
                    debug!("resolve {domain} failed: {e}");
                    send_reply(&mut stream, REPLY_HOST_UNREACHABLE).await?;
                    return Err(e.into());
                }
            },
        };
        let target = SocketAddr::new(ip, port);

        let dialed = tokio::time::timeout(
            self.connection_timeout,
            self.dialer.dial("tcp", target),
        )
        .await;
        let upstream = match dialed {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                debug!("dial {host}:{port} failed: {e}");
                send_reply(&mut stream, REPLY_CONNECTION_REFUSED).await?;
                return Err(Error::Socks(format!("dial {target} failed: {e}")));
            }
            Err(_) => {
                debug!("dial {host}:{port} timed out");
                send_reply(&mut stream, REPLY_GENERAL_FAILURE).await?;
                return Err(Error::Socks(format!("dial {target} timed out")));
            }
        };
        let mut upstream = TimeoutConn::new(upstream, self.idle_timeout);

        // The stack does not expose the local endpoint of a virtual flow;
        // answer with the unspecified bound address.
        send_reply(&mut stream, REPLY_SUCCESS).await?;

        if let Err(e) = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await {
            debug!("relay to {host}:{port} ended: {e}");
        }
        Ok(())
    }

    async fn handshake<S>(&self, stream: &mut S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let mut header = [0u8; 2];
        stream.read_exact(&mut header).await?;
        if header[0] != SOCKS_VERSION {
            return Err(Error::Socks(format!("unsupported version {:#04x}", header[0])));
        }
        let mut methods = vec![0u8; header[1] as usize];
        stream.read_exact(&mut methods).await?;

        match &self.credentials {
            None => {
                if !methods.contains(&METHOD_NONE) {
                    stream.write_all(&[SOCKS_VERSION, METHOD_UNACCEPTABLE]).await?;
                    return Err(Error::Socks("no acceptable auth method".into()));
                }
                stream.write_all(&[SOCKS_VERSION, METHOD_NONE]).await?;
                Ok(())
            }
            Some((username, password)) => {
                if !methods.contains(&METHOD_USER_PASS) {
                    stream.write_all(&[SOCKS_VERSION, METHOD_UNACCEPTABLE]).await?;
                    return Err(Error::Socks("client does not offer username/password".into()));
                }
                stream.write_all(&[SOCKS_VERSION, METHOD_USER_PASS]).await?;

                let mut header = [0u8; 2];
                stream.read_exact(&mut header).await?;
                if header[0] != AUTH_VERSION {
                    return Err(Error::Socks("bad auth negotiation version".into()));
                }
                let mut user = vec![0u8; header[1] as usize];
                stream.read_exact(&mut user).await?;
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                let mut pass = vec![0u8; len[0] as usize];
                stream.read_exact(&mut pass).await?;

                if user == username.as_bytes() && pass == password.as_bytes() {
                    stream.write_all(&[AUTH_VERSION, 0x00]).await?;
                    Ok(())
                } else {
                    stream.write_all(&[AUTH_VERSION, 0x01]).await?;
                    Err(Error::Socks("authentication failed".into()))
                }
            }
        }
    }
}

async fn read_request<S>(stream: &mut S) -> Result<(TargetHost, u16, u8)>
where
    S: AsyncRead + Send + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(Error::Socks(format!("unsupported version {:#04x}", header[0])));
    }
    let command = header[1];

    let host = match header[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            TargetHost::Ip(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            let domain = String::from_utf8(name)
                .map_err(|_| Error::Socks("invalid domain encoding".into()))?;
            TargetHost::Domain(domain)
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            TargetHost::Ip(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        other => return Err(Error::Socks(format!("unsupported address type {other:#04x}"))),
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok((host, u16::from_be_bytes(port), command))
}

async fn send_reply<S>(stream: &mut S, reply: u8) -> Result<()>
where
    S: AsyncWrite + Send + Unpin,
{
    let packet = [
        SOCKS_VERSION,
        reply,
        0x00,
        ATYP_IPV4,
        0,
        0,
        0,
        0, // BND.ADDR 0.0.0.0
        0,
        0, // BND.PORT 0
    ];
    stream.write_all(&packet).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use strato_dns::Lookup;

    /// Dialer double that echoes everything written to the connection.
    struct EchoDialer;

    #[async_trait]
    impl Dialer for EchoDialer {
        async fn dial(&self, _network: &str, _addr: SocketAddr) -> io::Result<BoxedConn> {
            let (near, mut far) = tokio::io::duplex(4096);
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
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

    /// Dialer double that always refuses.
    struct RefusingDialer;

    #[async_trait]
    impl Dialer for RefusingDialer {
        async fn dial(&self, _network: &str, _addr: SocketAddr) -> io::Result<BoxedConn> {
            Err(io::Error::from(io::ErrorKind::ConnectionRefused))
        }
    }

    struct StaticLookup(IpAddr);

    #[async_trait]
    impl Lookup for StaticLookup {
        async fn lookup(&self, _host: &str) -> strato_dns::Result<Vec<IpAddr>> {
            Ok(vec![self.0])
        }
    }

    fn resolver() -> Arc<CachingResolver> {
        Arc::new(CachingResolver::with_lookup(
            Arc::new(StaticLookup("192.0.2.7".parse().unwrap())),
            Duration::from_secs(600),
        ))
    }

    fn server(credentials: Option<(String, String)>, dialer: Arc<dyn Dialer>) -> SocksServer {
        SocksServer::new(
            credentials,
            resolver(),
            dialer,
            Duration::from_secs(5),
            Duration::from_secs(60),
        )
    }

    async fn connect_request(client: &mut tokio::io::DuplexStream, domain: &str, port: u16) {
        let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN, domain.len() as u8];
        request.extend_from_slice(domain.as_bytes());
        request.extend_from_slice(&port.to_be_bytes());
        client.write_all(&request).await.unwrap();
    }

    #[tokio::test]
    async fn connect_and_echo() {
        let server = server(None, Arc::new(EchoDialer));
        let (mut client, service) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move { server.serve_conn(service).await });

        client.write_all(&[SOCKS_VERSION, 1, METHOD_NONE]).await.unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [SOCKS_VERSION, METHOD_NONE]);

        connect_request(&mut client, "ip.example", 80).await;
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REPLY_SUCCESS);

        client.write_all(b"hello through the tunnel").await.unwrap();
        let mut echoed = [0u8; 24];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello through the tunnel");

        drop(client);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn refused_dial_reports_connection_refused() {
        let server = server(None, Arc::new(RefusingDialer));
        let (mut client, service) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move { server.serve_conn(service).await });

        client.write_all(&[SOCKS_VERSION, 1, METHOD_NONE]).await.unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();

        connect_request(&mut client, "ip.example", 443).await;
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REPLY_CONNECTION_REFUSED);

        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn username_password_is_enforced() {
        let server = server(
            Some(("warp".into(), "secret".into())),
            Arc::new(EchoDialer),
        );
        let (mut client, service) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move { server.serve_conn(service).await });

        client
            .write_all(&[SOCKS_VERSION, 2, METHOD_NONE, METHOD_USER_PASS])
            .await
            .unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [SOCKS_VERSION, METHOD_USER_PASS]);

        // RFC 1929 sub-negotiation with the right credentials.
        let mut auth = vec![AUTH_VERSION, 4];
        auth.extend_from_slice(b"warp");
        auth.push(6);
        auth.extend_from_slice(b"secret");
        client.write_all(&auth).await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [AUTH_VERSION, 0x00]);

        connect_request(&mut client, "ip.example", 80).await;
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REPLY_SUCCESS);

        drop(client);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let server = server(
            Some(("warp".into(), "secret".into())),
            Arc::new(EchoDialer),
        );
        let (mut client, service) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move { server.serve_conn(service).await });

        client
            .write_all(&[SOCKS_VERSION, 1, METHOD_USER_PASS])
            .await
            .unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();

        let mut auth = vec![AUTH_VERSION, 4];
        auth.extend_from_slice(b"warp");
        auth.push(5);
        auth.extend_from_slice(b"wrong");
        client.write_all(&auth).await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [AUTH_VERSION, 0x01]);

        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn bind_command_is_rejected() {
        let server = server(None, Arc::new(EchoDialer));
        let (mut client, service) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move { server.serve_conn(service).await });

        client.write_all(&[SOCKS_VERSION, 1, METHOD_NONE]).await.unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();

        // BIND request.
        let request = [
            SOCKS_VERSION,
            0x02,
            0x00,
            ATYP_IPV4,
            127,
            0,
            0,
            1,
            0,
            80,
        ];
        client.write_all(&request).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REPLY_COMMAND_NOT_SUPPORTED);

        assert!(task.await.unwrap().is_err());
    }
}
