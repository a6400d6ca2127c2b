//! Proxy service composition
//!
//! Wires the pieces together: TLS material from the enrolled identity, the
//! virtual network stack, the tunnel maintenance loop, and the SOCKS5
//! frontend dialing through the stack. In per-client mode every accepted
//! connection gets a private stack and tunnel.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use strato_dns::CachingResolver;
use strato_masque::{
    client_tls_config, maintain_tunnel, ConnectionConfig, ExponentialBackoff, MasqueTransport,
    QuicTransport, TunnelStats, DEFAULT_MTU,
};
use strato_netstack::VirtualNet;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::net::TimeoutConn;
use crate::socks::{BoxedConn, Dialer, SocksServer};

/// Reconnection ceiling
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(300);

/// Backoff growth factor
const BACKOFF_FACTOR: f64 = 2.0;

/// Advisory rate hints carried in the connection config
const MAX_PACKET_RATE: f64 = 8192.0;
const MAX_BURST: usize = 1024;

/// Dialer routing CONNECT targets through a virtual stack.
struct StackDialer {
    net: Arc<VirtualNet>,
}

#[async_trait]
impl Dialer for StackDialer {
    async fn dial(&self, network: &str, addr: SocketAddr) -> io::Result<BoxedConn> {
        let stream = self
            .net
            .dial(network, addr)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e.to_string()))?;
        Ok(Box::new(stream))
    }
}

/// Everything the frontend shares between modes.
struct Frontend {
    transport: Arc<dyn MasqueTransport>,
    connection: ConnectionConfig,
    stats: Arc<TunnelStats>,
    resolver: Arc<CachingResolver>,
    credentials: Option<(String, String)>,
    connection_timeout: Duration,
    idle_timeout: Duration,
    locals: Vec<IpAddr>,
    dns_addrs: Vec<IpAddr>,
    mtu: usize,
}

/// The SOCKS-over-MASQUE proxy service.
pub struct ProxyService {
    config: Config,
}

impl ProxyService {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run the proxy until `cancel` fires. Identity and configuration
    /// failures return immediately; everything after startup is handled by
    /// the reconnecting maintenance loop and per-session error paths.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        self.config.validate()?;
        let identity = self.config.identity()?;
        let tls = client_tls_config(&identity)?;

        let (endpoint, locals, dns_addrs) = prepare_network_config(&self.config)?;
        let (connection_timeout, idle_timeout) = self.config.timeout_settings();

        let mtu = self.config.tunnel.mtu;
        if mtu != DEFAULT_MTU {
            warn!("MTU is not the default 1280. Packet loss and other issues may occur");
        }

        let resolver = Arc::new(CachingResolver::new(
            None,
            Duration::from_secs(self.config.tunnel.dns_timeout.as_secs()),
        ));
        let transport: Arc<dyn MasqueTransport> = Arc::new(QuicTransport::new(
            tls,
            self.config.tunnel.sni_address.clone(),
            self.config.tunnel.keepalive_period,
            self.config.tunnel.initial_packet_size,
        ));
        let credentials = match (
            self.config.socks.username.as_str(),
            self.config.socks.password.as_str(),
        ) {
            ("", _) | (_, "") => None,
            (user, pass) => Some((user.to_string(), pass.to_string())),
        };

        let frontend = Frontend {
            transport,
            connection: ConnectionConfig {
                endpoint,
                mtu,
                max_packet_rate: MAX_PACKET_RATE,
                max_burst: MAX_BURST,
                backoff: ExponentialBackoff::new(
                    self.config.tunnel.reconnect_delay,
                    MAX_RECONNECT_DELAY,
                    BACKOFF_FACTOR,
                ),
            },
            stats: Arc::new(TunnelStats::new()),
            resolver,
            credentials,
            connection_timeout,
            idle_timeout,
            locals,
            dns_addrs,
            mtu,
        };

        if self.config.tunnel.per_client {
            self.serve_per_client(&frontend, cancel).await
        } else {
            self.serve_shared(&frontend, cancel).await
        }
    }

    /// One stack and one tunnel shared by all SOCKS clients.
    async fn serve_shared(&self, frontend: &Frontend, cancel: CancellationToken) -> Result<()> {
        let (device, net) = VirtualNet::new(&frontend.locals, &frontend.dns_addrs, frontend.mtu)?;
        let net = Arc::new(net);

        tokio::spawn(maintain_tunnel(
            frontend.transport.clone(),
            frontend.connection.clone(),
            Arc::new(device),
            frontend.stats.clone(),
            cancel.child_token(),
        ));

        let listener = self.bind_listener(frontend).await?;
        let server = Arc::new(SocksServer::new(
            frontend.credentials.clone(),
            frontend.resolver.clone(),
            Arc::new(StackDialer { net: net.clone() }),
            frontend.connection_timeout,
            frontend.idle_timeout,
        ));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((conn, peer)) => {
                        let server = server.clone();
                        let idle_timeout = frontend.idle_timeout;
                        tokio::spawn(async move {
                            let conn = TimeoutConn::new(conn, idle_timeout);
                            if let Err(e) = server.serve_conn(conn).await {
                                debug!("SOCKS session from {peer} ended: {e}");
                            }
                        });
                    }
                    Err(e) => warn!("Failed to accept connection: {e}"),
                },
            }
        }

        net.close();
        Ok(())
    }

    /// A fresh stack and tunnel per accepted connection. Expensive, meant
    /// for traffic isolation and debugging.
    async fn serve_per_client(&self, frontend: &Frontend, cancel: CancellationToken) -> Result<()> {
        let listener = self.bind_listener(frontend).await?;

        loop {
            let (conn, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept connection: {e}");
                        continue;
                    }
                },
            };

            let (device, net) =
                match VirtualNet::new(&frontend.locals, &frontend.dns_addrs, frontend.mtu) {
                    Ok(stack) => stack,
                    Err(e) => {
                        warn!("Failed to create virtual device for {peer}: {e}");
                        continue;
                    }
                };
            let net = Arc::new(net);

            let session_scope = cancel.child_token();
            tokio::spawn(maintain_tunnel(
                frontend.transport.clone(),
                frontend.connection.clone(),
                Arc::new(device),
                frontend.stats.clone(),
                session_scope.clone(),
            ));

            let server = SocksServer::new(
                frontend.credentials.clone(),
                frontend.resolver.clone(),
                Arc::new(StackDialer { net: net.clone() }),
                frontend.connection_timeout,
                frontend.idle_timeout,
            );
            let idle_timeout = frontend.idle_timeout;
            tokio::spawn(async move {
                let conn = TimeoutConn::new(conn, idle_timeout);
                if let Err(e) = server.serve_conn(conn).await {
                    debug!("SOCKS session from {peer} ended: {e}");
                }
                session_scope.cancel();
                net.close();
            });
        }

        Ok(())
    }

    async fn bind_listener(&self, frontend: &Frontend) -> Result<TcpListener> {
        let bind = (
            self.config.socks.bind_address.as_str(),
            self.config.socks.port,
        );
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|e| Error::Config(format!("failed to start SOCKS proxy: {e}")))?;
        info!(
            "SOCKS proxy listening on {} with timeouts (connect: {:?}, idle: {:?})",
            listener.local_addr()?,
            frontend.connection_timeout,
            frontend.idle_timeout
        );
        Ok(listener)
    }
}

/// Endpoint, tunnel-interface and DNS addresses from the configuration.
fn prepare_network_config(config: &Config) -> Result<(SocketAddr, Vec<IpAddr>, Vec<IpAddr>)> {
    let endpoint_ip: IpAddr = if config.tunnel.use_ipv6 {
        &config.endpoint_v6
    } else {
        &config.endpoint_v4
    }
    .parse()
    .map_err(|e| Error::Config(format!("failed to parse endpoint address: {e}")))?;
    let endpoint = SocketAddr::new(endpoint_ip, config.tunnel.connect_port);

    let mut locals = Vec::new();
    if !config.tunnel.no_tunnel_ipv4 {
        locals.push(parse_interface_addr(&config.ipv4)?);
    }
    if !config.tunnel.no_tunnel_ipv6 {
        locals.push(parse_interface_addr(&config.ipv6)?);
    }

    let mut dns_addrs = Vec::new();
    for server in &config.tunnel.dns {
        let addr: IpAddr = server
            .parse()
            .map_err(|e| Error::Config(format!("failed to parse DNS server {server}: {e}")))?;
        dns_addrs.push(addr);
    }

    Ok((endpoint, locals, dns_addrs))
}

/// Parse an assigned interface address, tolerating a CIDR suffix.
fn parse_interface_addr(value: &str) -> Result<IpAddr> {
    let bare = value.split('/').next().unwrap_or(value);
    bare.parse()
        .map_err(|e| Error::Config(format!("failed to parse interface address {value}: {e}")))
}
