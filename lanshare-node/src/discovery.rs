//! LAN discovery: UDP broadcast advertisement, listener that records peers and acks newcomers.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lanshare_core::discovery::MAX_DATAGRAM_LEN;
use lanshare_core::{AddressBook, AdvertiseThrottle, DiscoveryPacket, NodeEvent, PacketKind};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::net;

pub struct DiscoveryService {
    socket: UdpSocket,
    node_id: Uuid,
    chunk_port: u16,
    broadcast: SocketAddr,
    throttle: Mutex<AdvertiseThrottle>,
    address_book: Arc<Mutex<AddressBook>>,
    events: mpsc::UnboundedSender<NodeEvent>,
}

impl DiscoveryService {
    /// Bind the discovery socket. A port already in use is returned as `NodeError::Bind`.
    pub fn bind(
        bind: SocketAddr,
        broadcast: SocketAddr,
        advertise_interval: Duration,
        node_id: Uuid,
        chunk_port: u16,
        address_book: Arc<Mutex<AddressBook>>,
        events: mpsc::UnboundedSender<NodeEvent>,
    ) -> Result<Self> {
        let socket = net::bind_udp(bind)?;
        info!("discovery listening on {}", socket.local_addr()?);
        Ok(Self {
            socket,
            node_id,
            chunk_port,
            broadcast,
            throttle: Mutex::new(AdvertiseThrottle::new(advertise_interval)),
            address_book,
            events,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Broadcast one announcement. Inside the cooldown window this does nothing and
    /// returns `Ok(false)`.
    pub async fn advertise(&self) -> Result<bool> {
        if !self.throttle.lock().await.try_acquire(Instant::now()) {
            debug!("advertise skipped: cooldown");
            return Ok(false);
        }
        let frame = DiscoveryPacket::announce(self.node_id, self.chunk_port).encode()?;
        self.socket.send_to(&frame, self.broadcast).await?;
        debug!("advertised to {}", self.broadcast);
        Ok(true)
    }

    /// Receive datagrams until the socket fails or the task is aborted.
    pub async fn listen(&self) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((n, from)) => self.on_datagram(&buf[..n], from).await,
                // ICMP unreachable from an earlier ack surfaces here on some platforms.
                Err(e) if matches!(e.kind(), ErrorKind::ConnectionReset | ErrorKind::ConnectionRefused) => {
                    debug!("discovery recv: {}", e);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Call [`advertise`](Self::advertise) every `interval`, forever.
    pub async fn run_advertiser(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.advertise().await {
                warn!("discovery broadcast failed: {}", e);
            }
        }
    }

    async fn on_datagram(&self, bytes: &[u8], from: SocketAddr) {
        let packet = match DiscoveryPacket::parse(bytes) {
            Ok(p) => p,
            Err(e) => {
                debug!("dropping datagram from {}: {}", from, e);
                return;
            }
        };
        if packet.node_id == Some(self.node_id) {
            return;
        }
        let added = self.address_book.lock().await.record(from.ip());
        if !added {
            return;
        }
        info!("discovered peer {}", from.ip());
        let _ = self.events.send(NodeEvent::PeerDiscovered { addr: from });
        if packet.kind == PacketKind::Discover {
            if let Err(e) = self.send_ack(from).await {
                warn!("discovery ack to {} failed: {}", from, e);
            }
        }
    }

    async fn send_ack(&self, to: SocketAddr) -> Result<()> {
        let frame = DiscoveryPacket::ack(self.node_id, self.chunk_port).encode()?;
        self.socket.send_to(&frame, to).await?;
        Ok(())
    }
}
