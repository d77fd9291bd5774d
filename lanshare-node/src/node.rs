//! A running node: every listener, the advertiser, the dispatcher and the repair timer.
//!
//! Listeners start independently. One that cannot bind is logged and reported through
//! [`Node::listener_errors`]; the rest keep running.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use lanshare_core::{AddressBook, FileAck, NodeEvent, PeerAddress};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::ack::{self, AckWaiters};
use crate::config::Config;
use crate::control;
use crate::discovery::DiscoveryService;
use crate::error::{NodeError, Result};
use crate::net::{self, Role};
use crate::swarm::{SendReport, Swarm};
use crate::transport;

/// How often incomplete transfers re-request what is still missing.
const REPAIR_INTERVAL: Duration = Duration::from_secs(2);

pub struct Node {
    node_id: Uuid,
    swarm: Arc<Swarm>,
    discovery: Option<Arc<DiscoveryService>>,
    local_addrs: HashMap<Role, SocketAddr>,
    listener_errors: Vec<NodeError>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Bind every listener and spawn the background tasks. Never fails as a whole:
    /// see [`listener_errors`](Self::listener_errors).
    pub async fn start(config: Config) -> (Node, mpsc::UnboundedReceiver<NodeEvent>) {
        let node_id = Uuid::new_v4();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let address_book = Arc::new(Mutex::new(AddressBook::new()));
        let ack_waiters: AckWaiters = Arc::new(Mutex::new(HashMap::new()));
        let swarm = Arc::new(Swarm::new(
            config.clone(),
            address_book.clone(),
            ack_waiters.clone(),
            events_tx.clone(),
        ));

        let mut node = Node {
            node_id,
            swarm: swarm.clone(),
            discovery: None,
            local_addrs: HashMap::new(),
            listener_errors: Vec::new(),
            tasks: Vec::new(),
        };
        info!("node {} starting", node_id);

        let discovery = DiscoveryService::bind(
            SocketAddr::new(config.bind_addr, config.discovery_port),
            SocketAddr::new(config.broadcast_addr, config.discovery_port),
            config.advertise_interval(),
            node_id,
            config.chunk_port,
            address_book,
            events_tx.clone(),
        );
        match discovery {
            Ok(svc) => {
                let svc = Arc::new(svc);
                if let Ok(addr) = svc.local_addr() {
                    node.local_addrs.insert(Role::Discovery, addr);
                }
                let listener = svc.clone();
                node.tasks.push(tokio::spawn(async move {
                    if let Err(e) = listener.listen().await {
                        error!("discovery listener stopped: {}", e);
                    }
                }));
                let advertiser = svc.clone();
                let interval = config.advertise_interval();
                node.tasks.push(tokio::spawn(async move {
                    advertiser.run_advertiser(interval).await
                }));
                node.discovery = Some(svc);
            }
            Err(e) => node.listener_failed(e),
        }

        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel();
        match net::bind_tcp(Role::Chunk, SocketAddr::new(config.bind_addr, config.chunk_port)).await {
            Ok(listener) => {
                node.listener_bound(Role::Chunk, &listener);
                node.tasks.push(tokio::spawn(transport::run_chunk_listener(listener, chunk_tx)));
            }
            Err(e) => node.listener_failed(e),
        }

        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        match net::bind_tcp(Role::Control, SocketAddr::new(config.bind_addr, config.control_port)).await {
            Ok(listener) => {
                node.listener_bound(Role::Control, &listener);
                node.tasks.push(tokio::spawn(control::run_control_listener(listener, control_tx)));
            }
            Err(e) => node.listener_failed(e),
        }

        match net::bind_tcp(Role::Ack, SocketAddr::new(config.bind_addr, config.ack_port)).await {
            Ok(listener) => {
                node.listener_bound(Role::Ack, &listener);
                node.tasks.push(tokio::spawn(ack::run_ack_listener(
                    listener,
                    ack_waiters,
                    events_tx,
                )));
            }
            Err(e) => node.listener_failed(e),
        }

        // One dispatcher serializes all state changes.
        node.tasks.push(tokio::spawn(async move {
            let mut repair = tokio::time::interval(REPAIR_INTERVAL);
            loop {
                tokio::select! {
                    Some(inbound) = chunk_rx.recv() => {
                        // Rejections are already logged by the swarm.
                        let _ = swarm.on_pushed_chunk(inbound).await;
                    }
                    Some((msg, from)) = control_rx.recv() => {
                        let kind = if msg.is_repair() { "repair" } else { "text" };
                        if let Err(e) = swarm.on_control(msg, from).await {
                            warn!("{} message from {} failed: {}", kind, from, e);
                        }
                    }
                    _ = repair.tick() => swarm.repair_tick().await,
                }
            }
        }));

        (node, events_rx)
    }

    fn listener_bound(&mut self, role: Role, listener: &tokio::net::TcpListener) {
        match listener.local_addr() {
            Ok(addr) => {
                info!("{} listening on {}", role, addr);
                self.local_addrs.insert(role, addr);
            }
            Err(e) => warn!("{} listener address unavailable: {}", role, e),
        }
    }

    fn listener_failed(&mut self, e: NodeError) {
        error!("{}", e);
        self.listener_errors.push(e);
    }

    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    /// Bound address of a listener, if it started.
    pub fn local_addr(&self, role: Role) -> Option<SocketAddr> {
        self.local_addrs.get(&role).copied()
    }

    /// Listeners that failed to bind at start.
    pub fn listener_errors(&self) -> &[NodeError] {
        &self.listener_errors
    }

    /// Broadcast one announcement now, subject to the advertise cooldown.
    pub async fn advertise(&self) -> Result<bool> {
        match &self.discovery {
            Some(svc) => svc.advertise().await,
            None => Ok(false),
        }
    }

    pub async fn peers(&self) -> Vec<PeerAddress> {
        self.swarm.peers().await
    }

    pub async fn send_file(&self, path: &Path) -> Result<SendReport> {
        self.swarm.send_file(path).await
    }

    pub async fn send_bytes(&self, file_name: &str, bytes: &[u8]) -> Result<SendReport> {
        self.swarm.send_bytes(file_name, bytes).await
    }

    pub async fn send_text(&self, text: &str) -> Result<SendReport> {
        self.swarm.send_text(text).await
    }

    pub async fn await_ack(&self, file_name: &str, peer: IpAddr) -> Option<FileAck> {
        self.swarm.await_ack(file_name, peer).await
    }

    /// Stop accepting connections and stop background work. Sends already spawned
    /// run to completion or their timeout.
    pub fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        info!("node {} stopped", self.node_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, UdpSocket};

    async fn free_ports() -> (u16, u16, u16, u16) {
        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let a = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let b = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let c = TcpListener::bind("127.0.0.1:0").await.unwrap();
        (
            udp.local_addr().unwrap().port(),
            a.local_addr().unwrap().port(),
            b.local_addr().unwrap().port(),
            c.local_addr().unwrap().port(),
        )
    }

    async fn config(bind: &str, broadcast: &str) -> Config {
        let (discovery_port, chunk_port, control_port, ack_port) = free_ports().await;
        Config {
            bind_addr: bind.parse().unwrap(),
            broadcast_addr: broadcast.parse().unwrap(),
            discovery_port,
            chunk_port,
            control_port,
            ack_port,
            chunk_size: 1024,
            advertise_interval_secs: 3600,
            ..Config::default()
        }
    }

    async fn wait_for<F>(events: &mut mpsc::UnboundedReceiver<NodeEvent>, mut pred: F) -> NodeEvent
    where
        F: FnMut(&NodeEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let ev = events.recv().await.expect("event channel closed");
                if pred(&ev) {
                    return ev;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    #[tokio::test]
    async fn taken_port_only_disables_that_listener() {
        let cfg = config("127.0.0.1", "127.0.0.1").await;
        let _squatter = TcpListener::bind(("127.0.0.1", cfg.chunk_port)).await.unwrap();
        let (node, mut events) = Node::start(cfg.clone()).await;

        assert_eq!(node.listener_errors().len(), 1);
        assert!(matches!(
            node.listener_errors()[0],
            NodeError::Bind { role: Role::Chunk, .. }
        ));
        assert!(node.local_addr(Role::Chunk).is_none());
        let control = node.local_addr(Role::Control).expect("control listener");
        assert!(node.local_addr(Role::Ack).is_some());
        assert!(node.local_addr(Role::Discovery).is_some());

        // The control port still works.
        let opts = net::SendOptions::with_timeout(Duration::from_secs(5));
        control::send_control(control, &lanshare_core::ControlMessage::Text("still here".into()), opts)
            .await
            .unwrap();
        match wait_for(&mut events, |e| matches!(e, NodeEvent::MessageReceived { .. })).await {
            NodeEvent::MessageReceived { text, .. } => assert_eq!(text, "still here"),
            _ => unreachable!(),
        }
        node.shutdown();
    }

    /// Two nodes on 127.0.0.1 and 127.0.0.2. A third address pushes chunk 1 to one and
    /// chunks 0 and 2 to the other; both finish through announce / request / deliver.
    #[tokio::test]
    async fn gap_repair_converges_between_two_nodes() {
        let cfg_a = config("127.0.0.1", "127.0.0.2").await;
        let cfg_b = Config {
            bind_addr: "127.0.0.2".parse().unwrap(),
            broadcast_addr: "127.0.0.1".parse().unwrap(),
            ..cfg_a.clone()
        };
        let (node_a, mut events_a) = Node::start(cfg_a.clone()).await;
        assert!(node_a.listener_errors().is_empty());
        let (node_b, mut events_b) = Node::start(cfg_b.clone()).await;
        assert!(node_b.listener_errors().is_empty());

        // B's first advertisement reaches A; A acks back.
        wait_for(&mut events_a, |e| matches!(e, NodeEvent::PeerDiscovered { .. })).await;
        wait_for(&mut events_b, |e| matches!(e, NodeEvent::PeerDiscovered { .. })).await;

        let sender_ip: IpAddr = "127.0.0.3".parse().unwrap();
        let ack_listener = TcpListener::bind((sender_ip, cfg_a.ack_port)).await.unwrap();
        let opts = net::SendOptions {
            local_ip: Some(sender_ip),
            timeout: Duration::from_secs(5),
        };
        let data: Vec<u8> = (0..2500u32).map(|i| (i * 7 % 256) as u8).collect();
        let parts = lanshare_core::chunk::split_bytes(&data, 1024);
        assert_eq!(parts.len(), 3);

        let a_chunk = SocketAddr::new(cfg_a.bind_addr, cfg_a.chunk_port);
        let b_chunk = SocketAddr::new(cfg_b.bind_addr, cfg_b.chunk_port);
        transport::send_chunk(a_chunk, "lecture.bin", 1, 3, &parts[1], opts)
            .await
            .unwrap();
        transport::send_chunk(b_chunk, "lecture.bin", 0, 3, &parts[0], opts)
            .await
            .unwrap();
        transport::send_chunk(b_chunk, "lecture.bin", 2, 3, &parts[2], opts)
            .await
            .unwrap();

        for events in [&mut events_a, &mut events_b] {
            match wait_for(events, |e| matches!(e, NodeEvent::FileAssembled(_))).await {
                NodeEvent::FileAssembled(file) => {
                    assert_eq!(file.file_name, "lecture.bin");
                    assert_eq!(file.bytes, data);
                    assert_eq!(file.source.ip, sender_ip);
                }
                _ => unreachable!(),
            }
        }

        // Both receivers ack the original sender.
        let mut acked = Vec::new();
        for _ in 0..2 {
            let (stream, from) = tokio::time::timeout(Duration::from_secs(5), ack_listener.accept())
                .await
                .unwrap()
                .unwrap();
            let bytes = net::read_to_end_limited(stream, 1024).await.unwrap();
            let ack = lanshare_core::wire::decode_ack(&bytes).unwrap();
            assert_eq!(ack.file_name, "lecture.bin");
            acked.push(from.ip());
        }
        acked.sort();
        assert_eq!(acked, vec![cfg_a.bind_addr, cfg_b.bind_addr]);

        node_a.shutdown();
        node_b.shutdown();
    }

    #[tokio::test]
    async fn send_file_reaches_discovered_peer_and_is_acked() {
        let cfg_a = config("127.0.0.1", "127.0.0.2").await;
        let cfg_b = Config {
            bind_addr: "127.0.0.2".parse().unwrap(),
            broadcast_addr: "127.0.0.1".parse().unwrap(),
            ..cfg_a.clone()
        };
        let (node_a, mut events_a) = Node::start(cfg_a.clone()).await;
        let (node_b, mut events_b) = Node::start(cfg_b.clone()).await;
        wait_for(&mut events_a, |e| matches!(e, NodeEvent::PeerDiscovered { .. })).await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        let data = vec![b'n'; 3000];
        std::fs::write(&path, &data).unwrap();

        let (ack, report) = tokio::join!(node_a.await_ack("notes.txt", cfg_b.bind_addr), async {
            // Let the ack waiter register first.
            tokio::time::sleep(Duration::from_millis(50)).await;
            node_a.send_file(&path).await
        });
        let report = report.unwrap();
        assert!(report.all_delivered());
        assert_eq!(report.delivered, vec![cfg_b.bind_addr]);
        let ack = ack.expect("ack from receiver");
        assert_eq!(ack.status, lanshare_core::AckStatus::Received);

        match wait_for(&mut events_b, |e| matches!(e, NodeEvent::FileAssembled(_))).await {
            NodeEvent::FileAssembled(file) => {
                assert_eq!(file.file_name, "notes.txt");
                assert_eq!(file.bytes, data);
            }
            _ => unreachable!(),
        }

        node_a.shutdown();
        node_b.shutdown();
    }
}
