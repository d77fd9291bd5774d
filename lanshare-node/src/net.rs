//! Socket helpers shared by the services.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};

use crate::error::{NodeError, Result};

/// Listening roles of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Discovery,
    Chunk,
    Control,
    Ack,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Discovery => "discovery",
            Role::Chunk => "chunk",
            Role::Control => "control",
            Role::Ack => "ack",
        })
    }
}

/// Bind the discovery UDP socket with broadcast enabled. No address reuse: a port
/// already taken is reported, not shared.
pub fn bind_udp(addr: SocketAddr) -> Result<UdpSocket> {
    let bind_err = |source| NodeError::Bind {
        role: Role::Discovery,
        addr,
        source,
    };
    let std_sock = std::net::UdpSocket::bind(addr).map_err(bind_err)?;
    std_sock.set_broadcast(true).map_err(bind_err)?;
    std_sock.set_nonblocking(true).map_err(bind_err)?;
    UdpSocket::from_std(std_sock).map_err(bind_err)
}

pub async fn bind_tcp(role: Role, addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| NodeError::Bind { role, addr, source })
}

/// How outbound connections are made.
#[derive(Debug, Clone, Copy)]
pub struct SendOptions {
    /// Source address for outgoing connections; peers identify us by it. `None` or an
    /// unspecified address lets the OS choose.
    pub local_ip: Option<IpAddr>,
    /// Bound on connect + write + close.
    pub timeout: Duration,
}

impl SendOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            local_ip: None,
            timeout,
        }
    }
}

async fn connect(addr: SocketAddr, local_ip: Option<IpAddr>) -> std::io::Result<TcpStream> {
    match local_ip {
        Some(ip) if !ip.is_unspecified() => {
            let socket = if ip.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.bind(SocketAddr::new(ip, 0))?;
            socket.connect(addr).await
        }
        _ => TcpStream::connect(addr).await,
    }
}

/// Open one connection, write `bytes`, close. The whole exchange is bounded by the timeout.
pub async fn send_once(addr: SocketAddr, bytes: &[u8], opts: SendOptions) -> Result<()> {
    let exchange = async {
        let mut stream = connect(addr, opts.local_ip)
            .await
            .map_err(|source| NodeError::Connect { addr, source })?;
        stream.write_all(bytes).await?;
        stream.shutdown().await?;
        Ok(())
    };
    match tokio::time::timeout(opts.timeout, exchange).await {
        Ok(res) => res,
        Err(_) => Err(NodeError::Timeout {
            addr,
            timeout: opts.timeout,
        }),
    }
}

/// [`read_to_end_limited`] that gives up after `deadline`; a peer that never closes
/// its side gets its connection dropped.
pub async fn read_to_end_within<R: AsyncRead + Unpin>(
    reader: R,
    limit: usize,
    deadline: Duration,
) -> Result<Vec<u8>> {
    match tokio::time::timeout(deadline, read_to_end_limited(reader, limit)).await {
        Ok(res) => res,
        Err(_) => Err(NodeError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("no end of message within {:?}", deadline),
        ))),
    }
}

/// Read until EOF, refusing more than `limit` bytes.
pub async fn read_to_end_limited<R: AsyncRead + Unpin>(reader: R, limit: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader.take(limit as u64 + 1).read_to_end(&mut buf).await?;
    if buf.len() > limit {
        return Err(NodeError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("message exceeds {} bytes", limit),
        )));
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_udp_reports_port_in_use() {
        let first = bind_udp("127.0.0.1:0".parse().unwrap()).unwrap();
        let taken = first.local_addr().unwrap();
        match bind_udp(taken) {
            Err(NodeError::Bind { role, addr, .. }) => {
                assert_eq!(role, Role::Discovery);
                assert_eq!(addr, taken);
            }
            other => panic!("expected bind error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_once_to_closed_port_fails_fast() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = send_once(addr, b"hi", SendOptions::with_timeout(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Connect { .. }));
    }

    #[tokio::test]
    async fn send_once_then_read_limited() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let reader = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            read_to_end_limited(stream, 4).await
        });
        send_once(addr, b"hello", SendOptions::with_timeout(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(reader.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn silent_peer_is_cut_off() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();

        let err = read_to_end_within(stream, 1024, Duration::from_millis(100))
            .await
            .unwrap_err();
        match err {
            NodeError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::TimedOut),
            other => panic!("unexpected {other:?}"),
        }
        // The server side was dropped: the client sees EOF.
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn send_once_binds_source_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let (stream, from) = listener.accept().await.unwrap();
            (read_to_end_limited(stream, 16).await.unwrap(), from)
        });
        let opts = SendOptions {
            local_ip: Some("127.0.0.1".parse().unwrap()),
            timeout: Duration::from_secs(5),
        };
        send_once(addr, b"ping", opts).await.unwrap();
        let (bytes, from) = accept.await.unwrap();
        assert_eq!(bytes, b"ping");
        assert_eq!(from.ip(), opts.local_ip.unwrap());
    }
}
