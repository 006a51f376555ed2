//! UDP transport implementation

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::traits::{TransportEvent, TransportReceiver, TransportSender};

/// UDP configuration
#[derive(Debug, Clone)]
pub struct UdpConfig {
    /// Receive channel depth
    pub channel_capacity: usize,
    /// Maximum datagram size accepted
    pub max_packet_size: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 128,
            max_packet_size: 65507, // max UDP payload
        }
    }
}

/// A bound datagram socket (connectionless).
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    config: UdpConfig,
}

impl UdpTransport {
    /// Bind to a local address.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        debug!("udp bound to {}", socket.local_addr()?);

        Ok(Self {
            socket: Arc::new(socket),
            config: UdpConfig::default(),
        })
    }

    /// Bind with config.
    pub async fn bind_with_config(addr: SocketAddr, config: UdpConfig) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        Ok(Self {
            socket: Arc::new(socket),
            config,
        })
    }

    /// Bind a shared listener socket (SO_REUSEADDR), optionally joining an
    /// IPv4 multicast group. Used by the discovery listener so that several
    /// processes on one machine can watch the same discovery port.
    pub fn bind_reuse(addr: SocketAddr, multicast: Option<Ipv4Addr>) -> Result<Self> {
        use socket2::{Domain, Protocol, Socket, Type};

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        if let Some(group) = multicast {
            socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
        }
        socket.bind(&addr.into())?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        info!("udp listener bound to {} (reuse)", addr);

        Ok(Self {
            socket: Arc::new(socket),
            config: UdpConfig::default(),
        })
    }

    /// Get local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Send to a specific address.
    pub async fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<()> {
        self.socket
            .send_to(data, target)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        Ok(())
    }

    /// Enable/disable broadcast on this socket.
    pub fn set_broadcast(&self, enable: bool) -> Result<()> {
        Ok(self.socket.set_broadcast(enable)?)
    }

    /// Create a sender pinned to a specific remote address.
    pub fn sender_to(&self, remote: SocketAddr) -> UdpSender {
        UdpSender {
            socket: self.socket.clone(),
            remote,
            open: Arc::new(Mutex::new(true)),
        }
    }

    /// Spawn the receive task and return its event stream.
    pub fn start_receiver(&self) -> UdpReceiver {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let socket = self.socket.clone();
        let max_size = self.config.max_packet_size;

        tokio::spawn(async move {
            let mut buf = vec![0u8; max_size];

            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, from)) => {
                        let data = Bytes::copy_from_slice(&buf[..len]);
                        if tx.send((TransportEvent::Data(data), from)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        // Transient on most platforms (e.g. ICMP port
                        // unreachable surfacing as ECONNRESET); report and
                        // keep listening.
                        warn!("udp receive error: {}", e);
                        let from = SocketAddr::from(([0, 0, 0, 0], 0));
                        if tx
                            .send((TransportEvent::Error(e.to_string()), from))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
        });

        UdpReceiver { rx }
    }
}

/// Sender pinned to one remote endpoint.
pub struct UdpSender {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    open: Arc<Mutex<bool>>,
}

impl UdpSender {
    /// The remote this sender delivers to.
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }
}

#[async_trait]
impl TransportSender for UdpSender {
    async fn send(&self, data: Bytes) -> Result<()> {
        if !*self.open.lock() {
            return Err(TransportError::Closed);
        }
        self.socket
            .send_to(&data, self.remote)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        *self.open.lock()
    }

    fn close(&self) {
        *self.open.lock() = false;
    }
}

/// Receive side of a bound socket.
pub struct UdpReceiver {
    rx: mpsc::Receiver<(TransportEvent, SocketAddr)>,
}

impl UdpReceiver {
    /// Receive the next event with its source address.
    pub async fn recv_from(&mut self) -> Option<(TransportEvent, SocketAddr)> {
        self.rx.recv().await
    }
}

#[async_trait]
impl TransportReceiver for UdpReceiver {
    async fn recv(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await.map(|(event, _)| event)
    }
}

/// Broadcast/multicast sender for discovery heartbeats.
pub struct UdpBroadcast {
    socket: Arc<UdpSocket>,
    target: SocketAddr,
}

impl UdpBroadcast {
    /// Create a LAN broadcast sender towards 255.255.255.255:`port`.
    pub async fn broadcast(port: u16) -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        socket.set_broadcast(true)?;

        Ok(Self {
            socket: Arc::new(socket),
            target: SocketAddr::from((Ipv4Addr::BROADCAST, port)),
        })
    }

    /// Create a multicast sender towards `group:port`.
    pub async fn multicast(group: Ipv4Addr, port: u16) -> Result<Self> {
        if !group.is_multicast() {
            return Err(TransportError::InvalidAddress(group.to_string()));
        }
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        socket.set_multicast_loop_v4(true)?;

        Ok(Self {
            socket: Arc::new(socket),
            target: SocketAddr::from((group, port)),
        })
    }

    /// Point the sender at an explicit target instead (loopback tests).
    pub async fn unicast(target: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        Ok(Self {
            socket: Arc::new(socket),
            target,
        })
    }

    /// Send one heartbeat datagram.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        self.socket
            .send_to(data, self.target)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        Ok(())
    }

    /// Local address of the sending socket.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}
