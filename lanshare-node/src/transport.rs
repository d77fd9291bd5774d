//! Chunk transport: one TCP connection per chunk. Sender writes header line + payload and
//! closes; the listener decodes each connection in its own task.

use std::net::SocketAddr;
use std::time::Duration;

use lanshare_core::wire::encode_chunk_frame;
use lanshare_core::{ChunkFrame, ChunkFrameDecoder};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{NodeError, Result};
use crate::net::{self, SendOptions};

const READ_BUF_LEN: usize = 64 * 1024;
/// A connection silent for this long is dropped.
const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// A decoded chunk and the peer that pushed it.
#[derive(Debug)]
pub struct InboundChunk {
    pub frame: ChunkFrame,
    pub from: SocketAddr,
}

/// Accept chunk connections forever. Bad connections are logged and dropped.
pub async fn run_chunk_listener(listener: TcpListener, inbound: mpsc::UnboundedSender<InboundChunk>) {
    loop {
        match listener.accept().await {
            Ok((stream, from)) => {
                let inbound = inbound.clone();
                tokio::spawn(async move {
                    match receive_chunk(stream).await {
                        Ok(frame) => {
                            debug!(
                                "chunk {}/{} of {} from {}",
                                frame.header.chunk_index + 1,
                                frame.header.total_chunks,
                                frame.header.file_name,
                                from
                            );
                            let _ = inbound.send(InboundChunk { frame, from });
                        }
                        Err(e) => warn!("dropping chunk connection from {}: {}", from, e),
                    }
                });
            }
            Err(e) => {
                warn!("chunk accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Read one chunk frame, looping over partial reads until the declared payload is in.
pub async fn receive_chunk(mut stream: TcpStream) -> Result<ChunkFrame> {
    let mut decoder = ChunkFrameDecoder::new();
    let mut buf = vec![0u8; READ_BUF_LEN];
    loop {
        let n = match tokio::time::timeout(READ_IDLE_TIMEOUT, stream.read(&mut buf)).await {
            Ok(res) => res?,
            Err(_) => {
                return Err(NodeError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "chunk connection idle",
                )))
            }
        };
        if n == 0 {
            return Err(decoder.eof_error().into());
        }
        if let Some(frame) = decoder.push(&buf[..n])? {
            return Ok(frame);
        }
    }
}

/// Push one chunk to `addr` over a fresh connection.
pub async fn send_chunk(
    addr: SocketAddr,
    file_name: &str,
    index: u32,
    total_chunks: u32,
    payload: &[u8],
    opts: SendOptions,
) -> Result<()> {
    let frame = encode_chunk_frame(file_name, index, total_chunks, payload)?;
    net::send_once(addr, &frame, opts).await
}
