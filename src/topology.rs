//! Process-level description of one query instance: who we are, which motion
//! nodes we receive on (one route per sending process) and the motion node we
//! send on (one route per receiving process).

use common::InterconnectError;
use smol_str::{format_smolstr, SmolStr};
use std::net::SocketAddr;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Peer {
    pub content_id: i32,
    pub pid: i32,
    /// Listening address of the peer's interconnect.
    pub address: SocketAddr,
}

impl Peer {
    pub fn new(content_id: i32, pid: i32, address: SocketAddr) -> Self {
        Self {
            content_id,
            pid,
            address,
        }
    }

    pub(crate) fn label(&self) -> SmolStr {
        format_smolstr!("seg{}:{}@{}", self.content_id, self.pid, self.address)
    }
}

/// One side of a motion node as seen from the local process. The route of a
/// peer is its index; `None` marks a route without a process behind it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MotionLink {
    pub motion_node_id: i32,
    pub send_slice_index: i32,
    pub recv_slice_index: i32,
    pub peers: Vec<Option<Peer>>,
}

impl MotionLink {
    pub fn new(
        motion_node_id: i32,
        send_slice_index: i32,
        recv_slice_index: i32,
        peers: Vec<Option<Peer>>,
    ) -> Self {
        Self {
            motion_node_id,
            send_slice_index,
            recv_slice_index,
            peers,
        }
    }

    pub(crate) fn routes(&self) -> impl Iterator<Item = (usize, &Peer)> {
        self.peers
            .iter()
            .enumerate()
            .filter_map(|(route, peer)| peer.as_ref().map(|peer| (route, peer)))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topology {
    pub session_id: i32,
    pub instance_id: u32,
    pub content_id: i32,
    pub pid: i32,
    /// Number of segments in the cluster; sizes the connection table.
    pub cluster_size: usize,
    pub receiving: Vec<MotionLink>,
    pub sending: Option<MotionLink>,
}

impl Topology {
    pub(crate) fn validate(&self) -> Result<(), InterconnectError> {
        let mut seen = Vec::with_capacity(self.receiving.len());
        for link in &self.receiving {
            if seen.contains(&link.motion_node_id) {
                return Err(InterconnectError::InvalidTopology(format_smolstr!(
                    "motion node {} is listed twice",
                    link.motion_node_id
                )));
            }
            seen.push(link.motion_node_id);
        }
        if let Some(link) = &self.sending {
            if seen.contains(&link.motion_node_id) {
                return Err(InterconnectError::InvalidTopology(format_smolstr!(
                    "motion node {} is both sent and received locally",
                    link.motion_node_id
                )));
            }
            if let Some((route, _)) = link
                .routes()
                .find(|(_, peer)| peer.content_id == self.content_id && peer.pid == self.pid)
            {
                return Err(InterconnectError::InvalidTopology(format_smolstr!(
                    "route {route} of motion node {} points back at the local process",
                    link.motion_node_id
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn expected_connections(&self) -> (usize, usize) {
        let incoming = self.receiving.iter().map(|l| l.routes().count()).sum();
        let outgoing = self.sending.as_ref().map_or(0, |l| l.routes().count());
        (incoming, outgoing)
    }
}
