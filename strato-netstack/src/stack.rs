//! Virtual network stack
//!
//! A smoltcp interface over the queue-backed device, driven by a reactor
//! task. The stack presents two faces: [`StackDevice`] hands whole IP
//! packets to the tunnel, and [`VirtualNet`] dials TCP connections whose
//! segments travel through those packets.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use smoltcp::iface::{Config as IfaceConfig, Interface, SocketHandle, SocketSet};
use smoltcp::socket::tcp;
use smoltcp::time::Instant as SmolInstant;
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, Ipv4Address, Ipv6Address};
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use strato_masque::{Error as MasqueError, TunnelDevice};

use crate::conn::VirtualTcpStream;
use crate::device::ChannelDevice;
use crate::error::{Error, Result};

/// Per-direction TCP buffer size
const TCP_BUFFER: usize = 64 * 1024;

/// Packet channel depth between reactor and tunnel device
const PACKET_CHANNEL: usize = 256;

/// Byte-chunk channel depth per virtual connection
const CONN_CHANNEL: usize = 32;

/// Dial command channel depth
const CMD_CHANNEL: usize = 16;

/// First ephemeral source port handed out
const EPHEMERAL_BASE: u16 = 49152;

/// Upper bound on how long the reactor sleeps without events
const IDLE_WAIT: Duration = Duration::from_millis(500);

/// Chunk size when draining socket receive buffers
const RECV_CHUNK: usize = 4096;

enum Command {
    DialTcp {
        remote: SocketAddr,
        reply: oneshot::Sender<Result<VirtualTcpStream>>,
    },
}

enum Event {
    Shutdown,
    Command(Command),
    Ingress(Vec<u8>),
    Wake,
}

/// Tunnel-facing half of the stack: one IP packet per operation.
pub struct StackDevice {
    egress_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    ingress_tx: mpsc::Sender<Vec<u8>>,
    notify: Arc<Notify>,
}

#[async_trait]
impl TunnelDevice for StackDevice {
    async fn read_packet(&self, buf: &mut [u8]) -> strato_masque::Result<usize> {
        let mut rx = self.egress_rx.lock().await;
        match rx.recv().await {
            Some(pkt) => {
                let n = pkt.len().min(buf.len());
                buf[..n].copy_from_slice(&pkt[..n]);
                self.notify.notify_one();
                Ok(n)
            }
            None => Err(MasqueError::DeviceClosed),
        }
    }

    async fn write_packet(&self, pkt: &[u8]) -> strato_masque::Result<()> {
        self.ingress_tx
            .send(pkt.to_vec())
            .await
            .map_err(|_| MasqueError::DeviceClosed)?;
        self.notify.notify_one();
        Ok(())
    }
}

/// Application-facing half of the stack: dial TCP through the tunnel.
///
/// Dropping the last handle (or calling [`close`](Self::close)) stops the
/// reactor; the paired [`StackDevice`] then fails with `DeviceClosed`.
pub struct VirtualNet {
    cmd_tx: mpsc::Sender<Command>,
    dns_servers: Vec<IpAddr>,
    notify: Arc<Notify>,
    cancel: CancellationToken,
}

impl VirtualNet {
    /// Build a stack with the given interface addresses and MTU.
    ///
    /// `dns_servers` is the tunnel-internal resolver list pushed down at
    /// enrollment; the stack carries it for consumers that resolve through
    /// the tunnel.
    pub fn new(
        locals: &[IpAddr],
        dns_servers: &[IpAddr],
        mtu: usize,
    ) -> Result<(StackDevice, VirtualNet)> {
        if locals.is_empty() {
            return Err(Error::Setup("no interface addresses configured".into()));
        }

        let mut device = ChannelDevice::new(mtu);
        let mut iface = Interface::new(
            IfaceConfig::new(HardwareAddress::Ip),
            &mut device,
            SmolInstant::now(),
        );
        iface.update_ip_addrs(|addrs| {
            for ip in locals {
                let prefix = if ip.is_ipv4() { 32 } else { 128 };
                let cidr = IpCidr::new(IpAddress::from(*ip), prefix);
                if addrs.push(cidr).is_err() {
                    warn!("interface address capacity exceeded, ignoring {ip}");
                }
            }
        });
        // Everything routes into the tunnel; the gateway value is unused
        // on an IP-medium device.
        iface
            .routes_mut()
            .add_default_ipv4_route(Ipv4Address::UNSPECIFIED)
            .ok();
        iface
            .routes_mut()
            .add_default_ipv6_route(Ipv6Address::UNSPECIFIED)
            .ok();

        let (ingress_tx, ingress_rx) = mpsc::channel(PACKET_CHANNEL);
        let (egress_tx, egress_rx) = mpsc::channel(PACKET_CHANNEL);
        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CHANNEL);
        let notify = Arc::new(Notify::new());
        let cancel = CancellationToken::new();

        let reactor = Reactor {
            iface,
            device,
            sockets: SocketSet::new(Vec::new()),
            cmd_rx,
            ingress_rx,
            egress_tx,
            notify: notify.clone(),
            cancel: cancel.clone(),
            conns: Vec::new(),
            pending: Vec::new(),
            next_port: EPHEMERAL_BASE,
        };
        tokio::spawn(reactor.run());

        let stack_device = StackDevice {
            egress_rx: Mutex::new(egress_rx),
            ingress_tx,
            notify: notify.clone(),
        };
        let net = VirtualNet {
            cmd_tx,
            dns_servers: dns_servers.to_vec(),
            notify,
            cancel,
        };
        Ok((stack_device, net))
    }

    /// Dial a TCP connection through the stack. Only `tcp` networks are
    /// provided; tunnel-side UDP is out of the proxy's CONNECT surface.
    pub async fn dial(&self, network: &str, addr: SocketAddr) -> Result<VirtualTcpStream> {
        match network {
            "tcp" | "tcp4" | "tcp6" => {}
            other => return Err(Error::Unsupported(other.to_string())),
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::DialTcp {
                remote: addr,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::Closed)?;
        self.notify.notify_one();
        reply_rx.await.map_err(|_| Error::Closed)?
    }

    /// Tunnel-internal DNS servers this stack was created with.
    pub fn dns_servers(&self) -> &[IpAddr] {
        &self.dns_servers
    }

    /// Stop the reactor and release the device.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for VirtualNet {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct PendingDial {
    handle: SocketHandle,
    reply: oneshot::Sender<Result<VirtualTcpStream>>,
}

struct Conn {
    handle: SocketHandle,
    /// Delivery towards the application; `None` once EOF was signalled
    to_handle: Option<mpsc::Sender<Vec<u8>>>,
    from_handle: mpsc::Receiver<Vec<u8>>,
    pending_out: Option<(Vec<u8>, usize)>,
    write_closed: bool,
}

struct Reactor {
    iface: Interface,
    device: ChannelDevice,
    sockets: SocketSet<'static>,
    cmd_rx: mpsc::Receiver<Command>,
    ingress_rx: mpsc::Receiver<Vec<u8>>,
    egress_tx: mpsc::Sender<Vec<u8>>,
    notify: Arc<Notify>,
    cancel: CancellationToken,
    conns: Vec<Conn>,
    pending: Vec<PendingDial>,
    next_port: u16,
}

impl Reactor {
    async fn run(mut self) {
        loop {
            self.drain_ingress();
            let _ = self
                .iface
                .poll(SmolInstant::now(), &mut self.device, &mut self.sockets);
            self.service_dials();
            self.service_conns();
            // Emit whatever the service pass queued into socket buffers.
            let _ = self
                .iface
                .poll(SmolInstant::now(), &mut self.device, &mut self.sockets);
            if !self.flush_egress() {
                break;
            }

            let delay = self
                .iface
                .poll_delay(SmolInstant::now(), &self.sockets)
                .map(Duration::from)
                .unwrap_or(IDLE_WAIT)
                .min(IDLE_WAIT);
            if delay.is_zero() {
                tokio::task::yield_now().await;
                continue;
            }

            let event = tokio::select! {
                _ = self.cancel.cancelled() => Event::Shutdown,
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => Event::Command(cmd),
                    None => Event::Shutdown,
                },
                pkt = self.ingress_rx.recv() => match pkt {
                    Some(pkt) => Event::Ingress(pkt),
                    None => Event::Shutdown,
                },
                _ = self.notify.notified() => Event::Wake,
                _ = tokio::time::sleep(delay) => Event::Wake,
            };
            match event {
                Event::Shutdown => break,
                Event::Command(cmd) => self.handle_command(cmd),
                Event::Ingress(pkt) => self.device.enqueue_ingress(pkt),
                Event::Wake => {}
            }
        }
        self.shutdown();
    }

    fn drain_ingress(&mut self) {
        while let Ok(pkt) = self.ingress_rx.try_recv() {
            self.device.enqueue_ingress(pkt);
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::DialTcp { remote, reply } => match self.start_dial(remote) {
                Ok(handle) => self.pending.push(PendingDial { handle, reply }),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
        }
    }

    fn start_dial(&mut self, remote: SocketAddr) -> Result<SocketHandle> {
        let rx = tcp::SocketBuffer::new(vec![0u8; TCP_BUFFER]);
        let tx = tcp::SocketBuffer::new(vec![0u8; TCP_BUFFER]);
        let mut socket = tcp::Socket::new(rx, tx);
        let local_port = self.allocate_port();
        socket
            .connect(
                self.iface.context(),
                (IpAddress::from(remote.ip()), remote.port()),
                local_port,
            )
            .map_err(|e| Error::Connect(format!("{remote}: {e:?}")))?;
        Ok(self.sockets.add(socket))
    }

    fn allocate_port(&mut self) -> u16 {
        let port = self.next_port;
        self.next_port = if self.next_port >= 65500 {
            EPHEMERAL_BASE
        } else {
            self.next_port + 1
        };
        port
    }

    fn service_dials(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        for dial in pending {
            let state = self.sockets.get_mut::<tcp::Socket>(dial.handle).state();
            match state {
                tcp::State::Established => {
                    if dial.reply.is_closed() {
                        // The caller timed out; nobody wants this socket.
                        self.sockets.get_mut::<tcp::Socket>(dial.handle).abort();
                        self.sockets.remove(dial.handle);
                        continue;
                    }
                    let (to_tx, to_rx) = mpsc::channel(CONN_CHANNEL);
                    let (from_tx, from_rx) = mpsc::channel(CONN_CHANNEL);
                    let stream = VirtualTcpStream::new(to_rx, from_tx, self.notify.clone());
                    if dial.reply.send(Ok(stream)).is_err() {
                        self.sockets.get_mut::<tcp::Socket>(dial.handle).abort();
                        self.sockets.remove(dial.handle);
                        continue;
                    }
                    self.conns.push(Conn {
                        handle: dial.handle,
                        to_handle: Some(to_tx),
                        from_handle: from_rx,
                        pending_out: None,
                        write_closed: false,
                    });
                }
                tcp::State::Closed => {
                    self.sockets.remove(dial.handle);
                    let _ = dial.reply.send(Err(Error::Connect("connection refused".into())));
                }
                _ => {
                    if dial.reply.is_closed() {
                        self.sockets.get_mut::<tcp::Socket>(dial.handle).abort();
                        self.sockets.remove(dial.handle);
                    } else {
                        self.pending.push(dial);
                    }
                }
            }
        }
    }

    fn service_conns(&mut self) {
        let mut index = 0;
        while index < self.conns.len() {
            if self.service_conn(index) {
                let conn = self.conns.swap_remove(index);
                self.sockets.remove(conn.handle);
            } else {
                index += 1;
            }
        }
    }

    /// Pump one connection in both directions; returns true when the
    /// socket is finished and should be removed.
    fn service_conn(&mut self, index: usize) -> bool {
        let conn = &mut self.conns[index];
        let socket = self.sockets.get_mut::<tcp::Socket>(conn.handle);

        // Application -> socket.
        while socket.can_send() {
            if conn.pending_out.is_none() {
                match conn.from_handle.try_recv() {
                    Ok(data) => conn.pending_out = Some((data, 0)),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        if !conn.write_closed {
                            socket.close();
                            conn.write_closed = true;
                        }
                        break;
                    }
                }
            }
            let finished = {
                let (data, offset) = conn.pending_out.as_mut().expect("pending chunk");
                match socket.send_slice(&data[*offset..]) {
                    Ok(n) => {
                        *offset += n;
                        *offset >= data.len()
                    }
                    // Send path gone; drop the chunk.
                    Err(_) => true,
                }
            };
            if finished {
                conn.pending_out = None;
            } else {
                break;
            }
        }

        // Socket -> application, as long as the channel has room.
        if let Some(to_handle) = &conn.to_handle {
            while socket.can_recv() {
                match to_handle.try_reserve() {
                    Ok(permit) => {
                        let mut chunk = vec![0u8; RECV_CHUNK];
                        match socket.recv_slice(&mut chunk) {
                            Ok(n) if n > 0 => {
                                chunk.truncate(n);
                                permit.send(chunk);
                            }
                            _ => break,
                        }
                    }
                    Err(_) => break,
                }
            }
        }

        // Remote finished and everything was delivered: signal EOF.
        if conn.to_handle.is_some() && !socket.may_recv() && !socket.can_recv() {
            conn.to_handle = None;
        }

        matches!(socket.state(), tcp::State::Closed | tcp::State::TimeWait)
    }

    fn flush_egress(&mut self) -> bool {
        while let Some(pkt) = self.device.pop_egress() {
            match self.egress_tx.try_send(pkt) {
                Ok(()) => {}
                Err(TrySendError::Full(pkt)) => {
                    self.device.requeue_egress(pkt);
                    break;
                }
                Err(TrySendError::Closed(_)) => return false,
            }
        }
        true
    }

    fn shutdown(&mut self) {
        for dial in std::mem::take(&mut self.pending) {
            let _ = dial.reply.send(Err(Error::Closed));
        }
        for conn in &self.conns {
            self.sockets.get_mut::<tcp::Socket>(conn.handle).abort();
        }
        self.conns.clear();
        debug!("virtual network stack stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn stack() -> (StackDevice, VirtualNet) {
        VirtualNet::new(
            &[IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))],
            &[IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1))],
            1280,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn dial_emits_a_syn_through_the_device() {
        let (device, net) = stack();

        let net = Arc::new(net);
        let dialer = net.clone();
        let dial = tokio::spawn(async move {
            dialer.dial("tcp", "93.184.216.34:80".parse().unwrap()).await
        });

        let mut buf = [0u8; 1500];
        let n = tokio::time::timeout(Duration::from_secs(1), device.read_packet(&mut buf))
            .await
            .expect("no packet emitted")
            .unwrap();
        let pkt = &buf[..n];

        assert_eq!(pkt[0] >> 4, 4, "IPv4");
        assert_eq!(pkt[9], 6, "TCP");
        assert_eq!(&pkt[12..16], &[10, 0, 0, 2], "source address");
        assert_eq!(&pkt[16..20], &[93, 184, 216, 34], "destination address");
        let header_len = ((pkt[0] & 0x0f) as usize) * 4;
        let dst_port = u16::from_be_bytes([pkt[header_len + 2], pkt[header_len + 3]]);
        assert_eq!(dst_port, 80);
        let flags = pkt[header_len + 13];
        assert_eq!(flags & 0x02, 0x02, "SYN set");

        dial.abort();
    }

    #[tokio::test]
    async fn unsupported_network_is_rejected() {
        let (_device, net) = stack();
        match net.dial("udp", "1.2.3.4:53".parse().unwrap()).await {
            Err(Error::Unsupported(network)) => assert_eq!(network, "udp"),
            other => panic!("expected unsupported network, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn closed_stack_rejects_dials_and_fails_the_device() {
        let (device, net) = stack();
        net.close();

        match net.dial("tcp", "1.2.3.4:80".parse().unwrap()).await {
            Err(Error::Closed) => {}
            other => panic!("expected closed stack, got {other:?}"),
        }

        let mut buf = [0u8; 64];
        match tokio::time::timeout(Duration::from_secs(1), device.read_packet(&mut buf)).await {
            Ok(Err(MasqueError::DeviceClosed)) => {}
            other => panic!("expected device closed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stack_requires_addresses() {
        assert!(matches!(
            VirtualNet::new(&[], &[], 1280),
            Err(Error::Setup(_))
        ));
    }
}
