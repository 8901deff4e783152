//! Reliable, ordered datagram transport between the processes of a
//! distributed query. Every process binds one [`Interconnect`]; each query
//! instance gets a [`TransportHandle`] from [`Interconnect::setup`] and uses
//! it to stream chunks along the motion nodes of its [`Topology`].

pub mod config;
pub mod stats;
pub mod topology;

mod conn;
mod consumer;
mod coord;
mod fault;
mod fsm;
mod handle;
mod history;
mod interconnect;
mod pool;
mod registry;
mod rx;
mod setup;
mod tx;

pub use common::{InterconnectError, PeerDirection, PendingPeer, PendingPeers};
pub use config::Config;
pub use coord::LivenessProbe;
pub use handle::{Chunk, Received, ReceivedAny, SendOutcome, TransportHandle};
pub use interconnect::Interconnect;
pub use protocol::{Flags, Header, HEADER_SIZE};
pub use stats::{ConnStats, GlobalStats, NodeStats};
pub use topology::{MotionLink, Peer, Topology};
