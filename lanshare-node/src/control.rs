//! Control/message port: one UTF-8 message per connection, read to EOF.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use lanshare_core::ControlMessage;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::{NodeError, Result};
use crate::net::{self, SendOptions};

/// Fits a base64 delivery of the largest chunk.
const MAX_MESSAGE_LEN: usize = 24 * 1024 * 1024;
/// A sender must finish its message within this long.
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Accept control connections forever, forwarding each parsed message with its sender.
pub async fn run_control_listener(
    listener: TcpListener,
    inbound: mpsc::UnboundedSender<(ControlMessage, IpAddr)>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, from)) => {
                let inbound = inbound.clone();
                tokio::spawn(async move {
                    match read_message(stream).await {
                        Ok(msg) => {
                            let _ = inbound.send((msg, from.ip()));
                        }
                        Err(e) => warn!("dropping control message from {}: {}", from, e),
                    }
                });
            }
            Err(e) => {
                warn!("control accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn read_message(stream: tokio::net::TcpStream) -> Result<ControlMessage> {
    let bytes = net::read_to_end_within(stream, MAX_MESSAGE_LEN, READ_TIMEOUT).await?;
    let text = String::from_utf8(bytes).map_err(|e| {
        NodeError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })?;
    Ok(ControlMessage::parse(&text)?)
}

/// Send one control message to `addr`.
pub async fn send_control(addr: SocketAddr, msg: &ControlMessage, opts: SendOptions) -> Result<()> {
    net::send_once(addr, msg.encode().as_bytes(), opts).await
}
