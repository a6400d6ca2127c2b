//! QUIC transport for the MASQUE tunnel
//!
//! Dials the Warp edge over QUIC with the identity TLS configuration,
//! issues the CONNECT-IP request on a bidirectional stream and then moves
//! IP packets as QUIC datagrams. Datagram payloads carry the CONNECT-IP
//! context ID as a leading varint; full packets use context zero.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use super::icmp;
use super::{HandshakeResponse, MasqueTransport, TunnelSession};
use crate::error::{Error, Result};
use crate::session::IpSession;

/// CONNECT-IP well-known path requesting the full-tunnel scope
pub const CONNECT_PATH: &str = "/.well-known/masque/ip/*/*/";

/// Context ID for unfragmented IP packets
const CONTEXT_ID_PACKET: u8 = 0;

/// Upper bound on the response head we are willing to buffer
const MAX_RESPONSE_HEAD: usize = 4096;

/// Datagram queue sizes on the QUIC connection
const DATAGRAM_BUFFER: usize = 64 * 1024;

/// Production transport: QUIC + CONNECT-IP against a Warp edge endpoint.
pub struct QuicTransport {
    tls: rustls::ClientConfig,
    sni: String,
    keepalive_period: std::time::Duration,
    initial_packet_size: u16,
}

impl QuicTransport {
    pub fn new(
        tls: rustls::ClientConfig,
        sni: String,
        keepalive_period: std::time::Duration,
        initial_packet_size: u16,
    ) -> Self {
        Self {
            tls,
            sni,
            keepalive_period,
            initial_packet_size,
        }
    }

    fn client_config(&self) -> Result<quinn::ClientConfig> {
        let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(self.tls.clone())
            .map_err(|e| Error::Identity(format!("failed to adapt TLS config for QUIC: {e}")))?;

        let mut transport = quinn::TransportConfig::default();
        if !self.keepalive_period.is_zero() {
            transport.keep_alive_interval(Some(self.keepalive_period));
        }
        transport.initial_mtu(self.initial_packet_size);
        transport.datagram_receive_buffer_size(Some(DATAGRAM_BUFFER));
        transport.datagram_send_buffer_size(DATAGRAM_BUFFER);

        let mut config = quinn::ClientConfig::new(Arc::new(quic_tls));
        config.transport_config(Arc::new(transport));
        Ok(config)
    }
}

#[async_trait]
impl MasqueTransport for QuicTransport {
    async fn connect(&self, endpoint: SocketAddr) -> Result<TunnelSession> {
        let bind: SocketAddr = if endpoint.is_ipv6() {
            "[::]:0".parse().expect("literal addr")
        } else {
            "0.0.0.0:0".parse().expect("literal addr")
        };

        let mut quic_endpoint = quinn::Endpoint::client(bind)
            .map_err(|e| Error::Dial(format!("failed to bind UDP socket: {e}")))?;
        quic_endpoint.set_default_client_config(self.client_config()?);

        let connection = quic_endpoint
            .connect(endpoint, &self.sni)
            .map_err(|e| Error::Dial(format!("failed to start QUIC connection: {e}")))?
            .await
            .map_err(|e| Error::Dial(format!("QUIC handshake failed: {e}")))?;
        debug!(remote = %connection.remote_address(), "QUIC connection established");

        let (mut send, mut recv) = connection
            .open_bi()
            .await
            .map_err(|e| Error::Dial(format!("failed to open request stream: {e}")))?;

        let request = format!(
            "CONNECT-IP {CONNECT_PATH} HTTP/1.1\r\nHost: {}\r\nCapsule-Protocol: ?1\r\n\r\n",
            self.sni
        );
        send.write_all(request.as_bytes())
            .await
            .map_err(|e| Error::Dial(format!("failed to send CONNECT-IP request: {e}")))?;

        let head = read_response_head(&mut recv).await?;
        let response = parse_status_line(&head)?;

        let session = QuicIpSession {
            connection,
            endpoint: quic_endpoint,
            control: tokio::sync::Mutex::new(Some(send)),
        };
        Ok(TunnelSession {
            ip: Arc::new(session),
            response,
        })
    }
}

/// IP-packet session over an established QUIC connection.
///
/// Teardown closes the request stream, then the QUIC connection, then the
/// endpoint holding the UDP socket.
struct QuicIpSession {
    connection: quinn::Connection,
    endpoint: quinn::Endpoint,
    control: tokio::sync::Mutex<Option<quinn::SendStream>>,
}

#[async_trait]
impl IpSession for QuicIpSession {
    async fn read_packet(&self, buf: &mut [u8], _peek_header: bool) -> Result<usize> {
        loop {
            let datagram = self
                .connection
                .read_datagram()
                .await
                .map_err(|e| Error::Forward(format!("failed to read from IP connection: {e}")))?;

            // Packets on other context IDs (compression, future extensions)
            // are not ours to interpret.
            let payload = match datagram.first() {
                Some(&CONTEXT_ID_PACKET) => &datagram[1..],
                _ => continue,
            };
            if payload.is_empty() {
                continue;
            }
            let n = payload.len().min(buf.len());
            buf[..n].copy_from_slice(&payload[..n]);
            return Ok(n);
        }
    }

    async fn write_packet(&self, pkt: &[u8]) -> Result<Vec<u8>> {
        let max = self.connection.max_datagram_size().unwrap_or(0);
        if max == 0 {
            return Err(Error::Forward(
                "peer does not accept datagrams on this connection".into(),
            ));
        }
        if pkt.len() + 1 > max {
            return Ok(icmp::packet_too_big(pkt, max - 1));
        }

        let mut framed = BytesMut::with_capacity(pkt.len() + 1);
        framed.put_u8(CONTEXT_ID_PACKET);
        framed.put_slice(pkt);
        self.connection
            .send_datagram(Bytes::from(framed))
            .map_err(|e| Error::Forward(format!("failed to write to IP connection: {e}")))?;
        Ok(Vec::new())
    }

    async fn close(&self) {
        if let Some(mut control) = self.control.lock().await.take() {
            let _ = control.finish();
        }
        self.connection.close(0u32.into(), b"");
        self.endpoint.close(0u32.into(), b"");
    }
}

/// Read the response head (up to the blank line) from the request stream.
async fn read_response_head(recv: &mut quinn::RecvStream) -> Result<String> {
    let mut head = Vec::new();
    let mut chunk = [0u8; 512];
    loop {
        let n = recv
            .read(&mut chunk)
            .await
            .map_err(|e| Error::Dial(format!("failed to read CONNECT-IP response: {e}")))?
            .ok_or_else(|| Error::Dial("connection closed during CONNECT-IP handshake".into()))?;
        head.extend_from_slice(&chunk[..n]);
        if head.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if head.len() > MAX_RESPONSE_HEAD {
            return Err(Error::Dial("oversized CONNECT-IP response head".into()));
        }
    }
    String::from_utf8(head).map_err(|_| Error::Dial("malformed CONNECT-IP response".into()))
}

/// Parse `HTTP/1.1 200 OK` into a handshake response.
fn parse_status_line(head: &str) -> Result<HandshakeResponse> {
    let line = head
        .lines()
        .next()
        .ok_or_else(|| Error::Dial("empty CONNECT-IP response".into()))?;
    let mut parts = line.splitn(3, ' ');
    let _version = parts
        .next()
        .ok_or_else(|| Error::Dial("malformed status line".into()))?;
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| Error::Dial(format!("malformed status line: {line}")))?;
    let reason = parts.next().unwrap_or("").trim().to_string();
    Ok(HandshakeResponse { status, reason })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_line_parses() {
        let response = parse_status_line("HTTP/1.1 200 OK\r\n\r\n").unwrap();
        assert!(response.is_ok());
        assert_eq!(response.reason, "OK");

        let response = parse_status_line("HTTP/1.1 403 Forbidden\r\nServer: edge\r\n\r\n").unwrap();
        assert_eq!(response.status, 403);
        assert_eq!(response.status_line(), "403 Forbidden");
    }

    #[test]
    fn garbage_status_line_is_dial_error() {
        assert!(parse_status_line("not-http").is_err());
        assert!(parse_status_line("HTTP/1.1 abc Nope").is_err());
    }
}
