//! Per-node transfer state and the handlers that drive it: pushed chunks, control
//! messages (announce / request / deliver / text) and the periodic repair round.
//!
//! Lock order when more than one is needed: address book, store, holders, backoff.
//! No handler holds a lock across a network send; sends run in their own tasks.

use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lanshare_core::chunk::{split_bytes, split_file, total_chunks_for_path};
use lanshare_core::{
    plan_requests, AckStatus, AddressBook, Chunk, ChunkHolderIndex, ChunkStore, ControlMessage,
    FileAck, NodeEvent, PeerAddress, RepairRequest, RequestBackoff,
};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::ack::{self, AckWaiters};
use crate::config::Config;
use crate::control;
use crate::error::{NodeError, Result};
use crate::net::SendOptions;
use crate::transport::{self, InboundChunk};

/// First retry of an unanswered request waits this long; later ones double.
const REQUEST_BACKOFF_BASE: Duration = Duration::from_secs(2);
const REQUEST_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Outcome of a fan-out send: which peers took everything, which failed and why.
#[derive(Debug, Default)]
pub struct SendReport {
    pub delivered: Vec<IpAddr>,
    pub failed: Vec<(IpAddr, NodeError)>,
}

impl SendReport {
    pub fn all_delivered(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct Swarm {
    config: Config,
    address_book: Arc<Mutex<AddressBook>>,
    store: Mutex<ChunkStore>,
    holders: Mutex<ChunkHolderIndex>,
    backoff: Mutex<RequestBackoff>,
    ack_waiters: AckWaiters,
    events: mpsc::UnboundedSender<NodeEvent>,
}

impl Swarm {
    pub fn new(
        config: Config,
        address_book: Arc<Mutex<AddressBook>>,
        ack_waiters: AckWaiters,
        events: mpsc::UnboundedSender<NodeEvent>,
    ) -> Self {
        Self {
            config,
            address_book,
            store: Mutex::new(ChunkStore::new()),
            holders: Mutex::new(ChunkHolderIndex::new()),
            backoff: Mutex::new(RequestBackoff::new(REQUEST_BACKOFF_BASE, REQUEST_BACKOFF_MAX)),
            ack_waiters,
            events,
        }
    }

    fn send_options(&self) -> SendOptions {
        SendOptions {
            local_ip: Some(self.config.bind_addr),
            timeout: self.config.send_timeout(),
        }
    }

    async fn source_of(&self, ip: IpAddr) -> PeerAddress {
        self.address_book
            .lock()
            .await
            .get(&ip)
            .cloned()
            .unwrap_or_else(|| PeerAddress::new(ip))
    }

    /// A chunk pushed on the chunk port.
    pub async fn on_pushed_chunk(&self, inbound: InboundChunk) -> Result<()> {
        let InboundChunk { frame, from } = inbound;
        let chunk = Chunk {
            file_name: frame.header.file_name,
            index: frame.header.chunk_index,
            total_chunks: frame.header.total_chunks,
            payload: frame.payload,
            source: self.source_of(from.ip()).await,
        };
        self.accept_chunk(chunk, false).await
    }

    /// A message on the control port.
    pub async fn on_control(&self, msg: ControlMessage, from: IpAddr) -> Result<()> {
        match msg {
            ControlMessage::Text(text) => {
                info!("message from {}: {}", from, text);
                let _ = self.events.send(NodeEvent::MessageReceived { text, from });
            }
            ControlMessage::Announce { file_name, index } => {
                self.holders.lock().await.add(&file_name, index, from);
                let wanted = match self.store.lock().await.missing_indices(&file_name) {
                    Ok(missing) => missing.contains(&index),
                    Err(_) => false,
                };
                if wanted {
                    debug!("{} announced missing chunk {} of {}", from, index, file_name);
                    self.request_missing(&file_name).await;
                }
            }
            ControlMessage::Request { file_name, index } => {
                let payload = self
                    .store
                    .lock()
                    .await
                    .payload(&file_name, index)
                    .map(<[u8]>::to_vec);
                match payload {
                    Some(payload) => {
                        debug!("serving chunk {} of {} to {}", index, file_name, from);
                        let msg = ControlMessage::Deliver {
                            file_name,
                            index,
                            payload,
                        };
                        self.spawn_control(from, msg);
                    }
                    None => debug!("cannot serve chunk {} of {} to {}", index, file_name, from),
                }
            }
            ControlMessage::Deliver {
                file_name,
                index,
                payload,
            } => {
                let total = self
                    .store
                    .lock()
                    .await
                    .chunk_set(&file_name)
                    .map(|set| set.expected_total());
                let Some(total_chunks) = total else {
                    debug!("ignoring delivery of {}#{}: no active transfer", file_name, index);
                    return Ok(());
                };
                let chunk = Chunk {
                    file_name,
                    index,
                    total_chunks,
                    payload,
                    source: self.source_of(from).await,
                };
                self.accept_chunk(chunk, true).await?;
            }
        }
        Ok(())
    }

    /// Store a chunk and react: announce it, finish the file, or ask for what is missing.
    async fn accept_chunk(&self, chunk: Chunk, delivered: bool) -> Result<()> {
        let info = chunk.info();
        let from = chunk.source.ip;
        let outcome = {
            let mut store = self.store.lock().await;
            let res = if delivered {
                store.ingest_delivered(chunk)
            } else {
                store.ingest(chunk).map(Some)
            };
            match res {
                Ok(Some(outcome)) if !outcome.is_new_chunk && !store.is_active(&info.file_name) => {
                    debug!(
                        "late copy of {}#{} ignored: transfer already complete",
                        info.file_name, info.index
                    );
                    return Ok(());
                }
                Ok(Some(outcome)) => outcome,
                Ok(None) => {
                    debug!("late delivery of {}#{} ignored", info.file_name, info.index);
                    return Ok(());
                }
                Err(e) => {
                    warn!("rejected chunk {}#{} from {}: {}", info.file_name, info.index, from, e);
                    return Err(e.into());
                }
            }
        };
        self.holders.lock().await.add(&info.file_name, info.index, from);
        self.backoff.lock().await.clear(&info.file_name, info.index);

        let file_name = info.file_name.clone();
        let index = info.index;
        let _ = self.events.send(NodeEvent::ChunkReceived { info, from });

        if outcome.is_new_chunk {
            self.announce(&file_name, index, from).await;
        }
        if outcome.is_complete {
            self.finish(&file_name).await;
        } else {
            self.request_missing(&file_name).await;
        }
        Ok(())
    }

    /// Tell every known peer except `skip` that we now hold this chunk.
    async fn announce(&self, file_name: &str, index: u32, skip: IpAddr) {
        let peers = self.address_book.lock().await.all();
        for peer in peers.into_iter().filter(|p| p.ip != skip) {
            let msg = ControlMessage::Announce {
                file_name: file_name.to_string(),
                index,
            };
            self.spawn_control(peer.ip, msg);
        }
    }

    async fn finish(&self, file_name: &str) {
        let completed = self.store.lock().await.complete(file_name);
        self.holders.lock().await.forget_file(file_name);
        self.backoff.lock().await.forget_file(file_name);
        let file = match completed {
            Ok(file) => file,
            Err(e) => {
                warn!("assembling {} failed: {}", file_name, e);
                return;
            }
        };
        info!(
            "assembled {} ({} bytes) from {}",
            file.file_name,
            file.bytes.len(),
            file.source.ip
        );
        let addr = SocketAddr::new(file.source.ip, self.config.ack_port);
        let _ = self.events.send(NodeEvent::FileAssembled(file));

        let ack = FileAck::new(file_name, AckStatus::Received);
        let opts = self.send_options();
        tokio::spawn(async move {
            if let Err(e) = ack::send_ack(addr, &ack, opts).await {
                debug!("ack for {} to {} not delivered: {}", ack.file_name, addr, e);
            }
        });
    }

    /// Request each missing chunk of `file_name` from a random known holder, skipping
    /// chunks still inside their backoff window.
    async fn request_missing(&self, file_name: &str) {
        let missing = match self.store.lock().await.missing_indices(file_name) {
            Ok(missing) if !missing.is_empty() => missing,
            _ => return,
        };
        let mut plan = {
            let holders = self.holders.lock().await;
            let orphans = missing
                .iter()
                .filter(|&&i| !holders.has_holder(file_name, i))
                .count();
            if orphans > 0 {
                debug!(
                    "{} of {} missing chunks of {} have no known holder",
                    orphans,
                    missing.len(),
                    file_name
                );
            }
            pick_holders(file_name, &missing, &holders)
        };
        {
            let now = Instant::now();
            let mut backoff = self.backoff.lock().await;
            plan.retain(|r| backoff.try_schedule(&r.file_name, r.index, now));
        }
        for req in plan {
            debug!("requesting {}#{} from {}", req.file_name, req.index, req.peer);
            self.spawn_control(req.peer, req.message());
        }
    }

    /// One repair round over every incomplete transfer.
    pub async fn repair_tick(&self) {
        let files = self.store.lock().await.active_files();
        for file_name in files {
            self.request_missing(&file_name).await;
        }
    }

    fn spawn_control(&self, peer: IpAddr, msg: ControlMessage) {
        let addr = SocketAddr::new(peer, self.config.control_port);
        let opts = self.send_options();
        tokio::spawn(async move {
            if let Err(e) = control::send_control(addr, &msg, opts).await {
                debug!("control send to {} failed: {}", addr, e);
            }
        });
    }

    /// Split `path` and push every chunk to every known peer. Peers are served
    /// concurrently; chunks to one peer go out in order.
    pub async fn send_file(&self, path: &Path) -> Result<SendReport> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let chunk_size = self.config.chunk_size;
        let owned = path.to_path_buf();
        let parts = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<Vec<u8>>> {
            if total_chunks_for_path(&owned, chunk_size)? == 0 {
                return Ok(Vec::new());
            }
            split_file(&owned, chunk_size)
        })
        .await
        .map_err(|e| NodeError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;
        self.send_parts(&file_name, parts).await
    }

    /// Like [`send_file`](Self::send_file) for bytes already in memory.
    pub async fn send_bytes(&self, file_name: &str, bytes: &[u8]) -> Result<SendReport> {
        self.send_parts(file_name, split_bytes(bytes, self.config.chunk_size))
            .await
    }

    async fn send_parts(&self, file_name: &str, parts: Vec<Vec<u8>>) -> Result<SendReport> {
        if parts.is_empty() {
            return Err(NodeError::EmptyFile(file_name.to_string()));
        }
        let peers = self.address_book.lock().await.all();
        if peers.is_empty() {
            return Err(NodeError::NoPeers);
        }
        let size: usize = parts.iter().map(Vec::len).sum();
        let parts = Arc::new(parts);
        let total = parts.len() as u32;
        info!(
            "sending {} ({} bytes, {} chunks) to {} peers",
            file_name,
            size,
            total,
            peers.len()
        );

        let mut tasks = JoinSet::new();
        for peer in peers {
            let addr = SocketAddr::new(peer.ip, self.config.chunk_port);
            let parts = parts.clone();
            let file_name = file_name.to_string();
            let opts = self.send_options();
            tasks.spawn(async move {
                let mut first_err = None;
                for (index, payload) in parts.iter().enumerate() {
                    let sent =
                        transport::send_chunk(addr, &file_name, index as u32, total, payload, opts)
                            .await;
                    if let Err(e) = sent {
                        warn!("chunk {}/{} of {} to {} failed: {}", index + 1, total, file_name, addr, e);
                        if first_err.is_none() {
                            first_err = Some(e);
                        }
                    }
                }
                (peer.ip, first_err)
            });
        }
        Ok(collect_report(tasks).await)
    }

    /// Send a text message to every known peer.
    pub async fn send_text(&self, text: &str) -> Result<SendReport> {
        let peers = self.address_book.lock().await.all();
        if peers.is_empty() {
            return Err(NodeError::NoPeers);
        }
        let msg = Arc::new(ControlMessage::Text(text.to_string()));
        let mut tasks = JoinSet::new();
        for peer in peers {
            let addr = SocketAddr::new(peer.ip, self.config.control_port);
            let msg = msg.clone();
            let opts = self.send_options();
            tasks.spawn(async move {
                let res = control::send_control(addr, &msg, opts).await;
                (peer.ip, res.err())
            });
        }
        Ok(collect_report(tasks).await)
    }

    /// Wait for `peer` to acknowledge `file_name`, up to the configured ack timeout.
    pub async fn await_ack(&self, file_name: &str, peer: IpAddr) -> Option<FileAck> {
        ack::wait_for_ack(&self.ack_waiters, file_name, peer, self.config.ack_timeout()).await
    }

    pub async fn peers(&self) -> Vec<PeerAddress> {
        self.address_book.lock().await.all()
    }

    /// Indices of `file_name` not yet received, if the transfer is in progress.
    pub async fn missing(&self, file_name: &str) -> Option<BTreeSet<u32>> {
        self.store.lock().await.missing_indices(file_name).ok()
    }
}

fn pick_holders(
    file_name: &str,
    missing: &BTreeSet<u32>,
    holders: &ChunkHolderIndex,
) -> Vec<RepairRequest> {
    plan_requests(file_name, missing, holders, &mut rand::thread_rng())
}

async fn collect_report(mut tasks: JoinSet<(IpAddr, Option<NodeError>)>) -> SendReport {
    let mut report = SendReport::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((ip, None)) => report.delivered.push(ip),
            Ok((ip, Some(e))) => report.failed.push((ip, e)),
            Err(e) => warn!("send task panicked: {}", e),
        }
    }
    report
}
