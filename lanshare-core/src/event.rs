//! Typed events emitted by a node for the presentation layer.

use std::net::{IpAddr, SocketAddr};

use crate::chunk::{AssembledFile, ChunkInfo};
use crate::wire::FileAck;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// First valid discovery datagram from this IP.
    PeerDiscovered { addr: SocketAddr },
    /// A chunk arrived on the chunk port.
    ChunkReceived { info: ChunkInfo, from: IpAddr },
    /// Plain text on the control port.
    MessageReceived { text: String, from: IpAddr },
    /// Whole-file acknowledgement from a receiver.
    FileAck { ack: FileAck, from: IpAddr },
    /// A transfer completed; emitted once per transfer.
    FileAssembled(AssembledFile),
}
