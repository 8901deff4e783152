use smol_str::SmolStr;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerDirection {
    Incoming,
    Outgoing,
}

impl fmt::Display for PeerDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerDirection::Incoming => f.write_str("incoming"),
            PeerDirection::Outgoing => f.write_str("outgoing"),
        }
    }
}

/// A connection that did not complete its handshake in time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingPeer {
    pub direction: PeerDirection,
    pub motion_node_id: i32,
    pub route: usize,
    pub content_id: i32,
    pub pid: i32,
    pub address: SmolStr,
}

impl fmt::Display for PendingPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} node {} route {} (content {} pid {} at {})",
            self.direction, self.motion_node_id, self.route, self.content_id, self.pid, self.address
        )
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PendingPeers(pub Vec<PendingPeer>);

impl fmt::Display for PendingPeers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("none");
        }
        for (i, peer) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{peer}")?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum InterconnectError {
    #[error("Malformed packet: {0}")]
    MalformedPacket(SmolStr),
    #[error("Checksum mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { expected: u32, computed: u32 },
    #[error("Payload is too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("{0} not found: {1}")]
    NotFound(SmolStr, SmolStr),
    #[error("Invalid topology: {0}")]
    InvalidTopology(SmolStr),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(SmolStr),
    #[error(
        "Interconnect setup timed out after {elapsed:?}: completed {completed_incoming} of \
         {expected_incoming} incoming and {completed_outgoing} of {expected_outgoing} outgoing \
         connections; pending: {pending}"
    )]
    SetupTimeout {
        elapsed: Duration,
        completed_incoming: usize,
        expected_incoming: usize,
        completed_outgoing: usize,
        expected_outgoing: usize,
        pending: PendingPeers,
    },
    #[error("Interconnect operation cancelled: {0}")]
    Cancelled(SmolStr),
    #[error("Peer {peer} is unreachable after {retransmits} retransmits in {elapsed:?}")]
    PeerUnreachable {
        peer: SmolStr,
        retransmits: u64,
        elapsed: Duration,
    },
    #[error("Lost contact with the coordinator while {0}")]
    CoordinatorLost(SmolStr),
    #[error("Failed to {0}: {1}")]
    FailedTo(SmolStr, SmolStr),
    #[error("Invalid transition in FSM: {0}")]
    InvalidTransition(anyhow::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl InterconnectError {
    /// Errors caused by the caller cancelling the query rather than by the transport.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, InterconnectError::Cancelled(_))
    }
}
