//! Discovery datagrams and broadcast rate limiting.
//!
//! Accepted forms: the bare tokens `DISCOVER_PEER` / `DISCOVER_ACK`, or a JSON
//! object `{"type":"discover"|"ack","token":..,"node_id":..,"port":..}`. Anything
//! else is rejected and must be dropped by the listener.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DISCOVERY_TOKEN: &str = "DISCOVER_PEER";
pub const ACK_TOKEN: &str = "DISCOVER_ACK";
/// Minimum spacing between two broadcasts.
pub const ADVERTISE_INTERVAL: Duration = Duration::from_secs(5);
/// Largest datagram the listener reads.
pub const MAX_DATAGRAM_LEN: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacketKind {
    Discover,
    Ack,
}

impl PacketKind {
    fn token(self) -> &'static str {
        match self {
            PacketKind::Discover => DISCOVERY_TOKEN,
            PacketKind::Ack => ACK_TOKEN,
        }
    }
}

/// A validated discovery datagram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryPacket {
    #[serde(rename = "type")]
    pub kind: PacketKind,
    #[serde(default)]
    pub token: Option<String>,
    /// Sender instance; lets a node drop its own broadcasts.
    #[serde(default)]
    pub node_id: Option<Uuid>,
    /// Sender's chunk port.
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("datagram is not UTF-8")]
    NotUtf8,
    #[error("unrecognised discovery datagram")]
    Unrecognised,
    #[error("token {0:?} does not match packet type")]
    WrongToken(String),
    #[error("malformed announcement: {0}")]
    Json(#[from] serde_json::Error),
}

impl DiscoveryPacket {
    pub fn announce(node_id: Uuid, port: u16) -> Self {
        Self::structured(PacketKind::Discover, node_id, port)
    }

    pub fn ack(node_id: Uuid, port: u16) -> Self {
        Self::structured(PacketKind::Ack, node_id, port)
    }

    fn structured(kind: PacketKind, node_id: Uuid, port: u16) -> Self {
        Self {
            kind,
            token: Some(kind.token().to_string()),
            node_id: Some(node_id),
            port: Some(port),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Validate a received datagram.
    pub fn parse(bytes: &[u8]) -> Result<Self, PacketError> {
        let text = std::str::from_utf8(bytes).map_err(|_| PacketError::NotUtf8)?;
        let text = text.trim();
        for kind in [PacketKind::Discover, PacketKind::Ack] {
            if text == kind.token() {
                return Ok(Self {
                    kind,
                    token: Some(text.to_string()),
                    node_id: None,
                    port: None,
                });
            }
        }
        if !text.starts_with('{') {
            return Err(PacketError::Unrecognised);
        }
        let packet: DiscoveryPacket = serde_json::from_str(text)?;
        if let Some(token) = &packet.token {
            if token != packet.kind.token() {
                return Err(PacketError::WrongToken(token.clone()));
            }
        }
        Ok(packet)
    }
}

/// Lets a broadcast through at most once per interval; calls inside the window are refused.
#[derive(Debug)]
pub struct AdvertiseThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl Default for AdvertiseThrottle {
    fn default() -> Self {
        Self::new(ADVERTISE_INTERVAL)
    }
}

impl AdvertiseThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// True if a broadcast may go out at `now`; records it as sent.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last {
            if now.saturating_duration_since(last) < self.interval {
                return false;
            }
        }
        self.last = Some(now);
        true
    }
}
