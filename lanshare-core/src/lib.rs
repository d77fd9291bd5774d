//! LanShare protocol core.
//! Host-driven: no sockets; the node feeds received bytes in and sends what comes out.

pub mod address_book;
pub mod chunk;
pub mod discovery;
pub mod event;
pub mod holders;
pub mod integrity;
pub mod repair;
pub mod wire;

pub use address_book::{AddressBook, PeerAddress};
pub use chunk::{
    AssembledFile, Chunk, ChunkError, ChunkInfo, ChunkSet, ChunkStore, IngestOutcome,
    DEFAULT_CHUNK_SIZE,
};
pub use discovery::{AdvertiseThrottle, DiscoveryPacket, PacketKind};
pub use event::NodeEvent;
pub use holders::ChunkHolderIndex;
pub use repair::{plan_requests, ControlMessage, RepairRequest, RequestBackoff};
pub use wire::{AckStatus, ChunkFrame, ChunkFrameDecoder, ChunkHeader, FileAck, FrameError};
