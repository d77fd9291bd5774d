//! Whole-file acknowledgements: receivers send one JSON line per completed file; senders
//! may wait for it. A missing ack is not a failed transfer.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use lanshare_core::wire::{decode_ack, encode_ack};
use lanshare_core::{FileAck, NodeEvent};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use crate::error::Result;
use crate::net::{self, SendOptions};

const MAX_ACK_LEN: usize = 64 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Pending `await_ack` calls keyed by (file name, receiver IP).
pub type AckWaiters = Arc<Mutex<HashMap<(String, IpAddr), Vec<oneshot::Sender<FileAck>>>>>;

/// Accept ack connections forever: wake matching waiters and emit `NodeEvent::FileAck`.
pub async fn run_ack_listener(
    listener: TcpListener,
    waiters: AckWaiters,
    events: mpsc::UnboundedSender<NodeEvent>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, from)) => {
                let waiters = waiters.clone();
                let events = events.clone();
                tokio::spawn(async move {
                    match read_ack(stream).await {
                        Ok(ack) => {
                            debug!("ack {:?} for {} from {}", ack.status, ack.file_name, from);
                            let key = (ack.file_name.clone(), from.ip());
                            if let Some(txs) = waiters.lock().await.remove(&key) {
                                for tx in txs {
                                    let _ = tx.send(ack.clone());
                                }
                            }
                            let _ = events.send(NodeEvent::FileAck { ack, from: from.ip() });
                        }
                        Err(e) => warn!("dropping ack connection from {}: {}", from, e),
                    }
                });
            }
            Err(e) => {
                warn!("ack accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn read_ack(stream: TcpStream) -> Result<FileAck> {
    let bytes = net::read_to_end_within(stream, MAX_ACK_LEN, READ_TIMEOUT).await?;
    Ok(decode_ack(&bytes)?)
}

pub async fn send_ack(addr: SocketAddr, ack: &FileAck, opts: SendOptions) -> Result<()> {
    net::send_once(addr, &encode_ack(ack)?, opts).await
}

/// Wait up to `timeout` for `peer` to ack `file_name`. `None` on timeout.
pub async fn wait_for_ack(
    waiters: &AckWaiters,
    file_name: &str,
    peer: IpAddr,
    timeout: Duration,
) -> Option<FileAck> {
    let (tx, rx) = oneshot::channel();
    let key = (file_name.to_string(), peer);
    waiters.lock().await.entry(key.clone()).or_default().push(tx);
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(ack)) => Some(ack),
        _ => {
            let mut w = waiters.lock().await;
            if let Some(txs) = w.get_mut(&key) {
                txs.retain(|tx| !tx.is_closed());
                if txs.is_empty() {
                    w.remove(&key);
                }
            }
            None
        }
    }
}
