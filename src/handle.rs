use crate::config::Config;
use crate::coord::LivenessProbe;
use crate::interconnect::Inner;
use crate::registry::ConnKey;
use crate::stats::NodeStats;
use crate::tx::Transmitter;
use common::InterconnectError;
use smol_str::{format_smolstr, SmolStr};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub type Chunk = Vec<u8>;

#[derive(Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    /// Every addressed receiver asked us to stop; the chunk was discarded.
    Stopped,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Received {
    Chunk(Chunk),
    EndOfStream,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReceivedAny {
    Chunk { route: usize, chunk: Chunk },
    EndOfStream,
}

pub(crate) struct InboundRoute {
    pub(crate) key: ConnKey,
    /// Chunks of the last dequeued packet not yet handed out.
    pub(crate) pending: VecDeque<Chunk>,
    /// The packet carrying EOS has been dequeued.
    pub(crate) eos_dequeued: bool,
    pub(crate) end_of_stream: bool,
}

pub(crate) struct InboundNode {
    pub(crate) motion_node_id: i32,
    pub(crate) routes: Vec<Option<InboundRoute>>,
    pub(crate) scan_start: usize,
}

pub(crate) struct OutboundRoute {
    pub(crate) key: ConnKey,
    pub(crate) peer: SocketAddr,
    pub(crate) peer_label: SmolStr,
    pub(crate) xmit: Transmitter,
}

pub(crate) struct OutboundNode {
    pub(crate) motion_node_id: i32,
    pub(crate) routes: Vec<Option<OutboundRoute>>,
    pub(crate) sending_eos: bool,
}

/// What every blocking operation of a handle needs besides the route tables.
pub(crate) struct Context {
    pub(crate) inner: Arc<Inner>,
    pub(crate) cancel: CancellationToken,
    pub(crate) liveness: Option<Arc<dyn LivenessProbe>>,
}

impl Context {
    pub(crate) fn config(&self) -> &Config {
        &self.inner.config
    }

    pub(crate) fn check_cancelled(&self, what: &'static str) -> Result<(), InterconnectError> {
        if self.cancel.is_cancelled() {
            return Err(InterconnectError::Cancelled(format_smolstr!("before {what}")));
        }
        Ok(())
    }

    pub(crate) fn check_liveness(&self, what: &'static str) -> Result<(), InterconnectError> {
        match &self.liveness {
            Some(probe) if !probe.is_alive() => Err(InterconnectError::CoordinatorLost(what.into())),
            _ => Ok(()),
        }
    }

    /// Wait for `check` like `Coordinator::wait`, consulting the liveness
    /// probe every `liveness_check_interval` rounds of `round`.
    pub(crate) async fn wait<T>(
        &self,
        bound: Duration,
        round: &mut u32,
        what: &'static str,
        check: impl FnMut(&mut crate::coord::Shared) -> Option<T>,
    ) -> Result<Option<T>, InterconnectError> {
        let ready = self.inner.coord.wait(&self.cancel, bound, what, check).await?;
        if ready.is_none() {
            *round = round.wrapping_add(1);
            if *round % self.config().liveness_check_interval == 0 {
                self.check_liveness(what)?;
            }
        }
        Ok(ready)
    }
}

/// Per-query view of the interconnect, owned by one executor.
///
/// Dropping a handle without calling [`TransportHandle::teardown`] releases
/// its connections the abrupt way.
pub struct TransportHandle {
    pub(crate) ctx: Context,
    pub(crate) session_id: i32,
    pub(crate) instance_id: u32,
    pub(crate) inbound: Vec<InboundNode>,
    pub(crate) outbound: Option<OutboundNode>,
    pub(crate) released: bool,
}

impl TransportHandle {
    pub fn with_liveness_probe(mut self, probe: Arc<dyn LivenessProbe>) -> Self {
        self.ctx.liveness = Some(probe);
        self
    }

    pub fn session_id(&self) -> i32 {
        self.session_id
    }

    pub fn instance_id(&self) -> u32 {
        self.instance_id
    }

    fn node_keys(&self, motion_node_id: i32) -> Option<Vec<ConnKey>> {
        if let Some(node) = self.inbound.iter().find(|n| n.motion_node_id == motion_node_id) {
            return Some(node.routes.iter().flatten().map(|r| r.key).collect());
        }
        self.outbound
            .as_ref()
            .filter(|node| node.motion_node_id == motion_node_id)
            .map(|node| node.routes.iter().flatten().map(|r| r.key).collect())
    }

    /// Counters of every connection of a motion node, sending or receiving.
    pub fn statistics(&self, motion_node_id: i32) -> Result<NodeStats, InterconnectError> {
        let keys = self
            .node_keys(motion_node_id)
            .ok_or_else(|| unknown_node(motion_node_id))?;
        let shared = self.ctx.inner.coord.lock();
        let mut stats = NodeStats::default();
        for key in &keys {
            if let Some(conn) = shared.registry.get(key) {
                stats.add(&conn.stats);
            }
        }
        Ok(stats)
    }

    fn all_keys(&self) -> Vec<(i32, ConnKey)> {
        let inbound = self.inbound.iter().flat_map(|node| {
            node.routes
                .iter()
                .flatten()
                .map(move |route| (node.motion_node_id, route.key))
        });
        let outbound = self.outbound.iter().flat_map(|node| {
            node.routes
                .iter()
                .flatten()
                .map(move |route| (node.motion_node_id, route.key))
        });
        inbound.chain(outbound).collect()
    }

    /// Remove every descriptor of this instance, return queued buffers to
    /// the pool and retire the instance id.
    pub(crate) fn release(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }
        let keys = self.all_keys();
        let config = self.ctx.config();
        let mut per_node: Vec<(i32, NodeStats)> = Vec::new();
        let mut buffers = 0;
        let global = {
            let mut shared = self.ctx.inner.coord.lock();
            let shared = &mut *shared;
            for (node, key) in &keys {
                let Some(mut conn) = shared.registry.remove(key) else {
                    continue;
                };
                buffers += conn.release_queue(&mut shared.pool);
                match per_node.iter_mut().find(|(id, _)| id == node) {
                    Some((_, stats)) => stats.add(&conn.stats),
                    None => {
                        let mut stats = NodeStats::default();
                        stats.add(&conn.stats);
                        per_node.push((*node, stats));
                    }
                }
            }
            shared.history.retire(self.session_id, self.instance_id);
            if shared.registry.len() == 0 {
                shared.pool.prune(config.queue_depth);
            }
            shared.stats
        };
        self.ctx.inner.coord.wake();
        for (node, stats) in &per_node {
            if config.log_stats {
                info!(
                    instance = self.instance_id,
                    node,
                    connections = stats.connections,
                    acks = stats.acks,
                    mean_ack_us = stats.mean_ack_time().map_or(0, |d| d.as_micros() as u64),
                    max_ack_us = stats.max_ack_time.as_micros() as u64,
                    retransmits = stats.retransmits,
                    dropped = stats.dropped,
                    "motion node statistics"
                );
            }
        }
        let message = "interconnect instance released";
        if config.log_stats {
            info!(
                instance = self.instance_id,
                buffers_returned = buffers,
                packets = global.packets_received,
                dropped_acks = global.dropped_acks,
                retransmits = global.retransmits,
                mismatches = global.mismatches,
                rx_overruns = global.rx_overruns,
                checksum_errors = global.checksum_errors,
                "{message}"
            );
        } else {
            debug!(
                instance = self.instance_id,
                buffers_returned = buffers,
                packets = global.packets_received,
                retransmits = global.retransmits,
                "{message}"
            );
        }
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        self.release();
    }
}

pub(crate) fn unknown_node(motion_node_id: i32) -> InterconnectError {
    InterconnectError::NotFound("motion node".into(), format_smolstr!("{motion_node_id}"))
}

pub(crate) fn unknown_route(motion_node_id: i32, route: usize) -> InterconnectError {
    InterconnectError::NotFound(
        "route".into(),
        format_smolstr!("{route} of motion node {motion_node_id}"),
    )
}
