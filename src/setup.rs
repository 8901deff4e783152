//! Setup and teardown of one query instance.

use crate::config::Config;
use crate::conn::{Connection, Direction};
use crate::coord::Shared;
use crate::fsm::{ConnEvent, ConnState};
use crate::handle::{Context, InboundNode, InboundRoute, OutboundNode, OutboundRoute, TransportHandle};
use crate::interconnect::Inner;
use crate::registry::{ConnKey, Registry};
use crate::topology::{MotionLink, Peer, Topology};
use crate::tx::Transmitter;
use common::{InterconnectError, PeerDirection, PendingPeer, PendingPeers};
use protocol::{Flags, Header};
use smallvec::SmallVec;
use smol_str::format_smolstr;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// A connection setup is waiting for, with what to report if it never completes.
struct Candidate {
    key: ConnKey,
    direction: Direction,
    pending: PendingPeer,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Progress {
    incoming: usize,
    outgoing: usize,
}

impl Progress {
    fn of(shared: &Shared, candidates: &[Candidate]) -> Self {
        let mut progress = Progress::default();
        for candidate in candidates {
            let started = shared
                .registry
                .get(&candidate.key)
                .is_some_and(|conn| conn.state() == ConnState::Started);
            match (started, candidate.direction) {
                (true, Direction::Inbound) => progress.incoming += 1,
                (true, Direction::Outbound) => progress.outgoing += 1,
                (false, _) => {}
            }
        }
        progress
    }
}

fn pending_peer(direction: PeerDirection, link: &MotionLink, route: usize, peer: &Peer) -> PendingPeer {
    PendingPeer {
        direction,
        motion_node_id: link.motion_node_id,
        route,
        content_id: peer.content_id,
        pid: peer.pid,
        address: format_smolstr!("{}", peer.address),
    }
}

/// Header template of a connection; `src` is always the sending process.
fn template(topology: &Topology, link: &MotionLink, src: (i32, i32, u16), dst: (i32, i32, u16)) -> Header {
    Header {
        flags: Flags::empty(),
        motion_node_id: link.motion_node_id,
        recv_slice_index: link.recv_slice_index,
        send_slice_index: link.send_slice_index,
        src_content_id: src.0,
        src_pid: src.1,
        src_listener_port: u32::from(src.2),
        dst_content_id: dst.0,
        dst_pid: dst.1,
        dst_listener_port: u32::from(dst.2),
        session_id: topology.session_id,
        instance_id: topology.instance_id,
        sequence: 0,
        ..Default::default()
    }
}

/// Connection descriptors and per-handle route tables of a topology.
struct Plan {
    conns: Vec<Connection>,
    candidates: Vec<Candidate>,
    inbound: Vec<InboundNode>,
    outbound: Option<OutboundNode>,
}

fn plan(topology: &Topology, local: SocketAddr, max_packet_size: usize) -> Plan {
    let me = (topology.content_id, topology.pid, local.port());
    let mut conns = Vec::new();
    let mut candidates = Vec::new();

    let mut inbound = Vec::with_capacity(topology.receiving.len());
    for link in &topology.receiving {
        let mut routes: Vec<Option<InboundRoute>> = (0..link.peers.len()).map(|_| None).collect();
        for (route, peer) in link.routes() {
            let them = (peer.content_id, peer.pid, peer.address.port());
            let conn = Connection::new(
                Direction::Inbound,
                route,
                template(topology, link, them, me),
                None,
                peer.label(),
            );
            candidates.push(Candidate {
                key: conn.key,
                direction: Direction::Inbound,
                pending: pending_peer(PeerDirection::Incoming, link, route, peer),
            });
            routes[route] = Some(InboundRoute {
                key: conn.key,
                pending: VecDeque::new(),
                eos_dequeued: false,
                end_of_stream: false,
            });
            conns.push(conn);
        }
        inbound.push(InboundNode {
            motion_node_id: link.motion_node_id,
            routes,
            scan_start: 0,
        });
    }

    let outbound = topology.sending.as_ref().map(|link| {
        let mut routes: Vec<Option<OutboundRoute>> = (0..link.peers.len()).map(|_| None).collect();
        for (route, peer) in link.routes() {
            let them = (peer.content_id, peer.pid, peer.address.port());
            let conn = Connection::new(
                Direction::Outbound,
                route,
                template(topology, link, me, them),
                Some(peer.address),
                peer.label(),
            );
            candidates.push(Candidate {
                key: conn.key,
                direction: Direction::Outbound,
                pending: pending_peer(PeerDirection::Outgoing, link, route, peer),
            });
            routes[route] = Some(OutboundRoute {
                key: conn.key,
                peer: peer.address,
                peer_label: peer.label(),
                xmit: Transmitter::new(max_packet_size),
            });
            conns.push(conn);
        }
        OutboundNode {
            motion_node_id: link.motion_node_id,
            routes,
            sending_eos: false,
        }
    });

    Plan {
        conns,
        candidates,
        inbound,
        outbound,
    }
}

fn register(
    shared: &mut Shared,
    topology: &Topology,
    config: &Config,
    conns: Vec<Connection>,
) -> Result<(), InterconnectError> {
    for (i, conn) in conns.iter().enumerate() {
        let twice = conns[..i].iter().any(|other| other.key == conn.key);
        if twice || shared.registry.get(&conn.key).is_some() {
            return Err(InterconnectError::InvalidTopology(format_smolstr!(
                "connection of motion node {} with {} is already registered",
                conn.key.motion_node_id,
                conn.peer_label
            )));
        }
    }
    shared.history.begin(topology.session_id, topology.instance_id);
    let wanted = Registry::default_capacity(
        topology.cluster_size,
        config.hash_table_multiplier,
        config.hash_table_size,
    );
    if shared.registry.capacity() < shared.registry.len() + wanted {
        shared.registry.resize(shared.registry.len() + wanted);
    }
    for mut conn in conns {
        if conn.direction == Direction::Outbound {
            conn.advance(ConnEvent::Connect)?;
        }
        shared.registry.insert(conn)?;
    }
    Ok(())
}

impl Context {
    /// Send the handshake of every outgoing route that is still waiting and
    /// whose retransmit timer has run out. Returns the delay until the next one is due.
    async fn send_handshakes(&self, outbound: &mut Option<OutboundNode>) -> Result<Duration, InterconnectError> {
        let config = self.config();
        let Some(node) = outbound.as_mut() else {
            return Ok(Duration::MAX);
        };
        let mut due: SmallVec<[(usize, Vec<u8>); 8]> = SmallVec::new();
        {
            let mut shared = self.inner.coord.lock();
            for (index, route) in node.routes.iter_mut().enumerate() {
                let Some(route) = route.as_mut() else {
                    continue;
                };
                let Some(conn) = shared.registry.get_mut(&route.key) else {
                    continue;
                };
                if conn.state() != ConnState::AwaitingHandshakeAck {
                    continue;
                }
                if route.xmit.sent_at.elapsed() < config.retransmit_timeout(route.xmit.retry) {
                    continue;
                }
                conn.advance(ConnEvent::Connect)?;
                due.push((index, conn.handshake(config.full_checksum)?));
            }
        }
        for (index, bytes) in due {
            if let Some(route) = node.routes[index].as_mut() {
                self.inner.send_datagram(&bytes, route.peer).await?;
                route.xmit.sent_at = Instant::now();
                route.xmit.retry = route.xmit.retry.saturating_add(1);
            }
        }
        let shared = self.inner.coord.lock();
        let next = node
            .routes
            .iter()
            .flatten()
            .filter(|route| {
                shared
                    .registry
                    .get(&route.key)
                    .is_some_and(|conn| conn.state() == ConnState::AwaitingHandshakeAck)
            })
            .map(|route| {
                config
                    .retransmit_timeout(route.xmit.retry)
                    .saturating_sub(route.xmit.sent_at.elapsed())
            })
            .min()
            .unwrap_or(Duration::MAX);
        Ok(next)
    }
}

impl TransportHandle {
    pub(crate) async fn establish(
        inner: Arc<Inner>,
        topology: Topology,
        cancel: CancellationToken,
    ) -> Result<TransportHandle, InterconnectError> {
        topology.validate()?;
        let config = &inner.config;
        let Plan {
            conns,
            candidates,
            inbound,
            outbound,
        } = plan(&topology, inner.local_addr, config.max_packet_size);
        let (expected_incoming, expected_outgoing) = topology.expected_connections();
        {
            let mut shared = inner.coord.lock();
            let previous = shared.history.last_teardown();
            register(&mut shared, &topology, config, conns)?;
            debug!(
                session = topology.session_id,
                instance = topology.instance_id,
                previous_instance = ?previous,
                incoming = expected_incoming,
                outgoing = expected_outgoing,
                "setting up interconnect"
            );
        }

        // From here on the handle owns the descriptors; dropping it on error releases them.
        let mut handle = TransportHandle {
            ctx: Context {
                inner,
                cancel,
                liveness: None,
            },
            session_id: topology.session_id,
            instance_id: topology.instance_id,
            inbound,
            outbound,
            released: false,
        };
        handle.await_handshakes(&candidates, expected_incoming, expected_outgoing).await?;
        Ok(handle)
    }

    async fn await_handshakes(
        &mut self,
        candidates: &[Candidate],
        expected_incoming: usize,
        expected_outgoing: usize,
    ) -> Result<(), InterconnectError> {
        let TransportHandle { ctx, outbound, .. } = self;
        let config = ctx.config();
        let timeout = config.setup_timeout();
        let started = Instant::now();
        let mut round = 0u32;
        let mut progress;
        loop {
            let next_handshake = ctx.send_handshakes(outbound).await?;
            progress = Progress::of(&ctx.inner.coord.lock(), candidates);
            if progress.incoming == expected_incoming && progress.outgoing == expected_outgoing {
                break;
            }
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                let pending = {
                    let shared = ctx.inner.coord.lock();
                    candidates
                        .iter()
                        .filter(|candidate| {
                            !shared
                                .registry
                                .get(&candidate.key)
                                .is_some_and(|conn| conn.state() == ConnState::Started)
                        })
                        .map(|candidate| candidate.pending.clone())
                        .collect()
                };
                let err = InterconnectError::SetupTimeout {
                    elapsed,
                    completed_incoming: progress.incoming,
                    expected_incoming,
                    completed_outgoing: progress.outgoing,
                    expected_outgoing,
                    pending: PendingPeers(pending),
                };
                warn!(error = %err, "interconnect setup failed");
                return Err(err);
            }
            let bound = config
                .setup_poll()
                .min(timeout - elapsed)
                .min(next_handshake.max(Duration::from_millis(1)));
            let seen = progress;
            let waited = ctx
                .wait(bound, &mut round, "setting up the interconnect", |shared| {
                    (Progress::of(shared, candidates) != seen).then_some(())
                })
                .await;
            if let Err(e) = waited {
                if e.is_cancelled() {
                    return Err(InterconnectError::Cancelled(format_smolstr!(
                        "during setup with {} of {expected_incoming} incoming and {} of \
                         {expected_outgoing} outgoing connections complete",
                        progress.incoming,
                        progress.outgoing
                    )));
                }
                return Err(e);
            }
        }
        info!(
            session = self.session_id,
            instance = self.instance_id,
            incoming = progress.incoming,
            outgoing = progress.outgoing,
            "interconnect set up"
        );
        Ok(())
    }

    /// Finish the query instance. Unless `force` is set (or the query was
    /// cancelled), outgoing routes are closed with end of stream, and senders
    /// still feeding us are asked to stop and waited for before the
    /// descriptors are released.
    pub async fn teardown(mut self, force: bool) -> Result<(), InterconnectError> {
        let force = force || self.ctx.cancel.is_cancelled();
        let graceful = if force { Ok(()) } else { self.close().await };
        let pool_allocated = self.ctx.inner.coord.lock().pool.allocated();
        self.release();
        debug!(
            instance = self.instance_id,
            force,
            pool_allocated,
            "interconnect torn down"
        );
        graceful
    }

    async fn close(&mut self) -> Result<(), InterconnectError> {
        if self.has_active_outbound() {
            if let Some(motion_node_id) = self.outbound.as_ref().map(|node| node.motion_node_id) {
                self.send_eos(motion_node_id).await?;
            }
        }
        let unfinished: SmallVec<[i32; 4]> = {
            let shared = self.ctx.inner.coord.lock();
            self.inbound
                .iter()
                .filter(|node| {
                    node.routes
                        .iter()
                        .flatten()
                        .any(|route| sender_unfinished(&shared, &route.key))
                })
                .map(|node| node.motion_node_id)
                .collect()
        };
        for motion_node_id in &unfinished {
            self.request_stop(*motion_node_id).await?;
        }
        if unfinished.is_empty() {
            return Ok(());
        }
        self.await_stopped().await
    }

    /// Wait until every sender feeding this instance has closed its side,
    /// repeating the stop request whenever a wait interval passes without an
    /// answer. Descriptors stay registered meanwhile so retransmissions keep
    /// getting STOP acknowledgements.
    async fn await_stopped(&self) -> Result<(), InterconnectError> {
        let ctx = &self.ctx;
        let keys: SmallVec<[ConnKey; 8]> = self
            .inbound
            .iter()
            .flat_map(|node| node.routes.iter().flatten().map(|route| route.key))
            .collect();
        let config = ctx.config();
        let bound = config.wait_interval();
        let started = Instant::now();
        let mut last_request = Instant::now();
        let mut round = 0u32;
        loop {
            let done = ctx
                .wait(bound, &mut round, "waiting for senders to stop", |shared| {
                    (!keys.iter().any(|key| sender_unfinished(shared, key))).then_some(())
                })
                .await?;
            if done.is_some() {
                break;
            }
            if last_request.elapsed() < bound {
                continue;
            }
            let mut repeats: SmallVec<[(Vec<u8>, SocketAddr); 8]> = SmallVec::new();
            {
                let shared = ctx.inner.coord.lock();
                for key in keys.iter().filter(|key| sender_unfinished(&shared, key)) {
                    let Some(conn) = shared.registry.get(key) else {
                        continue;
                    };
                    if let Some(peer) = conn.peer {
                        let stop = conn.ack(conn.info.sequence, Flags::STOP, config.full_checksum)?;
                        repeats.push((stop, peer));
                    }
                }
            }
            trace!(senders = repeats.len(), "repeating stop request");
            for (bytes, to) in repeats {
                ctx.inner.send_datagram(&bytes, to).await?;
            }
            last_request = Instant::now();
        }
        debug!(
            instance = self.instance_id,
            waited_ms = started.elapsed().as_millis() as u64,
            "senders stopped"
        );
        Ok(())
    }
}

/// The sender of an inbound connection has neither closed it nor been seen to finish.
fn sender_unfinished(shared: &Shared, key: &ConnKey) -> bool {
    shared
        .registry
        .get(key)
        .is_some_and(|conn| conn.still_active && !conn.eos_acked)
}

impl std::fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportHandle")
            .field("session_id", &self.session_id)
            .field("instance_id", &self.instance_id)
            .field("inbound", &self.inbound.len())
            .field("outbound", &self.outbound.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(content_id: i32, pid: i32, port: u16) -> Option<Peer> {
        Some(Peer::new(content_id, pid, SocketAddr::from(([127, 0, 0, 1], port))))
    }

    fn topology() -> Topology {
        Topology {
            session_id: 3,
            instance_id: 8,
            content_id: 0,
            pid: 100,
            cluster_size: 2,
            receiving: vec![MotionLink::new(1, 1, 2, vec![peer(1, 200, 7001), None])],
            sending: Some(MotionLink::new(2, 2, 3, vec![peer(-1, 300, 7002)])),
        }
    }

    #[test]
    fn test_plan_mirrors_peer_identity() {
        let local = SocketAddr::from(([127, 0, 0, 1], 7000));
        let plan = plan(&topology(), local, 1024);
        assert_eq!(plan.conns.len(), 2);
        assert_eq!(plan.candidates.len(), 2);

        let inbound = &plan.conns[0];
        assert_eq!(inbound.direction, Direction::Inbound);
        assert_eq!((inbound.info.src_pid, inbound.info.dst_pid), (200, 100));
        assert_eq!((inbound.info.src_listener_port, inbound.info.dst_listener_port), (7001, 7000));
        assert_eq!(inbound.peer, None);

        let outbound = &plan.conns[1];
        assert_eq!(outbound.direction, Direction::Outbound);
        assert_eq!((outbound.info.src_pid, outbound.info.dst_pid), (100, 300));
        assert_eq!(outbound.peer, Some(SocketAddr::from(([127, 0, 0, 1], 7002))));

        assert_eq!(plan.inbound[0].routes.len(), 2);
        assert!(plan.inbound[0].routes[1].is_none());
        assert_eq!(plan.candidates[1].pending.direction, PeerDirection::Outgoing);
    }

    #[test]
    fn test_register_rejects_live_duplicate() {
        let config = Config::default();
        let mut shared = Shared::new(&config);
        let local = SocketAddr::from(([127, 0, 0, 1], 7000));
        let first = plan(&topology(), local, 1024);
        register(&mut shared, &topology(), &config, first.conns).unwrap();
        assert_eq!(shared.registry.len(), 2);
        let outbound = first.candidates[1].key;
        assert_eq!(
            shared.registry.get(&outbound).unwrap().state(),
            ConnState::AwaitingHandshakeAck
        );

        let again = plan(&topology(), local, 1024);
        let err = register(&mut shared, &topology(), &config, again.conns).unwrap_err();
        assert!(matches!(err, InterconnectError::InvalidTopology(_)));
        assert_eq!(shared.registry.len(), 2);
    }
}
