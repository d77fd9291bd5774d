//! LanShare node: LAN discovery, chunk push, gap repair and acks over tokio.

pub mod ack;
pub mod config;
pub mod control;
pub mod discovery;
pub mod error;
pub mod net;
pub mod node;
pub mod swarm;
pub mod transport;

pub use config::Config;
pub use error::{NodeError, Result};
pub use net::Role;
pub use node::Node;
pub use swarm::SendReport;
