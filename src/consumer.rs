//! Receive side of a transport handle: hands out chunks of queued packets in
//! sequence order and drives the stop request towards the senders.

use crate::conn::QueuedPacket;
use crate::coord::Shared;
use crate::handle::{
    unknown_node, unknown_route, Context, InboundNode, InboundRoute, Received, ReceivedAny,
    TransportHandle,
};
use crate::registry::ConnKey;
use common::InterconnectError;
use protocol::{ChunkReader, Flags, HEADER_SIZE};
use smallvec::SmallVec;
use std::net::SocketAddr;
use tracing::debug;

enum Polled {
    Packet(QueuedPacket),
    /// Nothing queued and the sender will not send more.
    Finished,
}

fn poll_route(shared: &mut Shared, key: &ConnKey) -> Option<Polled> {
    let Some(conn) = shared.registry.get_mut(key) else {
        return Some(Polled::Finished);
    };
    if let Some(packet) = conn.queue.pop_front() {
        return Some(Polled::Packet(packet));
    }
    (!conn.still_active).then_some(Polled::Finished)
}

fn find_node(
    inbound: &mut [InboundNode],
    motion_node_id: i32,
) -> Result<&mut InboundNode, InterconnectError> {
    inbound
        .iter_mut()
        .find(|node| node.motion_node_id == motion_node_id)
        .ok_or_else(|| unknown_node(motion_node_id))
}

impl Context {
    /// Move the chunks of a dequeued packet into the route and give the buffer back.
    fn unpack(&self, route: &mut InboundRoute, packet: QueuedPacket) -> Result<(), InterconnectError> {
        let QueuedPacket { header, buffer } = packet;
        let mut unpacked = Ok(());
        for chunk in ChunkReader::new(&buffer.as_slice()[HEADER_SIZE..]) {
            match chunk {
                Ok(chunk) => route.pending.push_back(chunk.to_vec()),
                Err(e) => {
                    unpacked = Err(e.into());
                    break;
                }
            }
        }
        if header.flags.contains(Flags::EOS) {
            route.eos_dequeued = true;
        }
        self.inner.coord.lock().pool.release(buffer);
        unpacked
    }

    fn apply(&self, route: &mut InboundRoute, polled: Polled) -> Result<(), InterconnectError> {
        match polled {
            Polled::Packet(packet) => self.unpack(route, packet),
            Polled::Finished => {
                route.end_of_stream = true;
                Ok(())
            }
        }
    }

    /// The consumer has seen every chunk before EOS; the connection is done.
    fn finish(&self, route: &mut InboundRoute) {
        if let Some(conn) = self.inner.coord.lock().registry.get_mut(&route.key) {
            conn.still_active = false;
        }
        route.end_of_stream = true;
    }
}

impl TransportHandle {
    /// Next chunk from one route of a motion node this process receives on.
    pub async fn receive(
        &mut self,
        motion_node_id: i32,
        route: usize,
    ) -> Result<Received, InterconnectError> {
        self.ctx.check_cancelled("receiving")?;
        let TransportHandle { ctx, inbound, .. } = self;
        let node = find_node(inbound, motion_node_id)?;
        let route = node
            .routes
            .get_mut(route)
            .and_then(Option::as_mut)
            .ok_or_else(|| unknown_route(motion_node_id, route))?;
        let bound = ctx.config().wait_interval();
        let mut round = 0u32;
        loop {
            if let Some(chunk) = route.pending.pop_front() {
                return Ok(Received::Chunk(chunk));
            }
            if route.end_of_stream {
                return Ok(Received::EndOfStream);
            }
            if route.eos_dequeued {
                ctx.finish(route);
                continue;
            }
            let key = route.key;
            let polled = ctx
                .wait(bound, &mut round, "waiting for data", |shared| {
                    poll_route(shared, &key)
                })
                .await?;
            if let Some(polled) = polled {
                ctx.apply(route, polled)?;
            }
        }
    }

    /// Next chunk from whichever route of the motion node has data, scanning
    /// routes round-robin so no sender starves.
    pub async fn receive_any(
        &mut self,
        motion_node_id: i32,
    ) -> Result<ReceivedAny, InterconnectError> {
        self.ctx.check_cancelled("receiving")?;
        let TransportHandle { ctx, inbound, .. } = self;
        let node = find_node(inbound, motion_node_id)?;
        let bound = ctx.config().wait_interval();
        let count = node.routes.len();
        let mut round = 0u32;
        loop {
            for offset in 0..count {
                let index = (node.scan_start + offset) % count;
                let Some(route) = node.routes[index].as_mut() else {
                    continue;
                };
                if let Some(chunk) = route.pending.pop_front() {
                    node.scan_start = (index + 1) % count;
                    return Ok(ReceivedAny::Chunk {
                        route: index,
                        chunk,
                    });
                }
                if route.eos_dequeued && !route.end_of_stream {
                    ctx.finish(route);
                }
            }
            let open: SmallVec<[(usize, ConnKey); 8]> = (0..count)
                .map(|offset| (node.scan_start + offset) % count)
                .filter_map(|index| {
                    let route = node.routes[index].as_ref()?;
                    (!route.end_of_stream).then_some((index, route.key))
                })
                .collect();
            if open.is_empty() {
                return Ok(ReceivedAny::EndOfStream);
            }
            let polled = ctx
                .wait(bound, &mut round, "waiting for data", |shared| {
                    open.iter().find_map(|(index, key)| {
                        poll_route(shared, key).map(|polled| (*index, polled))
                    })
                })
                .await?;
            if let Some((index, polled)) = polled {
                if let Some(route) = node.routes[index].as_mut() {
                    ctx.apply(route, polled)?;
                }
            }
        }
    }

    /// Tell every sender of the motion node that no more data is wanted.
    /// Queued data is discarded; `receive` reports end of stream once each
    /// sender has closed its side.
    pub async fn request_stop(&mut self, motion_node_id: i32) -> Result<(), InterconnectError> {
        let TransportHandle { ctx, inbound, .. } = self;
        let node = find_node(inbound, motion_node_id)?;
        let checksum = ctx.config().full_checksum;
        let mut stops: SmallVec<[(Vec<u8>, SocketAddr); 8]> = SmallVec::new();
        {
            let mut shared = ctx.inner.coord.lock();
            let shared = &mut *shared;
            for route in node.routes.iter_mut().flatten() {
                route.pending.clear();
                let Some(conn) = shared.registry.get_mut(&route.key) else {
                    continue;
                };
                if !conn.still_active {
                    continue;
                }
                conn.release_queue(&mut shared.pool);
                if conn.eos_acked {
                    // The sender already finished; nothing to stop.
                    conn.still_active = false;
                    route.end_of_stream = true;
                    continue;
                }
                conn.stop_requested = true;
                conn.info.flags.insert(Flags::STOP);
                if let Some(peer) = conn.peer {
                    stops.push((conn.ack(conn.info.sequence, Flags::STOP, checksum)?, peer));
                }
            }
        }
        ctx.inner.coord.wake();
        debug!(
            target: "interconnect::consumer",
            node = motion_node_id,
            senders = stops.len(),
            "stop requested"
        );
        for (bytes, to) in stops {
            ctx.inner.send_datagram(&bytes, to).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::fsm::ConnState;
    use crate::handle::SendOutcome;
    use crate::interconnect::Interconnect;
    use crate::topology::{MotionLink, Peer, Topology};
    use anyhow::Result;
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;

    const NODE: i32 = 1;
    const CHUNK: usize = 64;

    /// One chunk per packet, millisecond timers.
    fn config() -> Config {
        Config {
            max_packet_size: HEADER_SIZE + CHUNK + 2 + CHUNK / 2,
            retransmit_base_ms: 1,
            retransmit_cap_ms: 20,
            wait_interval_ms: 20,
            setup_poll_ms: 10,
            socket_buffer_size: None,
            ..Default::default()
        }
    }

    fn topology(content_id: i32, pid: i32, receiving: Vec<MotionLink>, sending: Option<MotionLink>) -> Topology {
        Topology {
            session_id: 1,
            instance_id: 1,
            content_id,
            pid,
            cluster_size: 2,
            receiving,
            sending,
        }
    }

    #[tokio::test]
    async fn test_stop_leaves_both_sides_terminal() -> Result<()> {
        timeout(Duration::from_secs(20), async {
            let sender = Interconnect::bind(config(), "127.0.0.1:0".parse()?).await?;
            let receiver = Interconnect::bind(config(), "127.0.0.1:0".parse()?).await?;
            let to_receiver = Peer::new(-1, 200, receiver.local_addr());
            let from_sender = Peer::new(0, 100, sender.local_addr());
            let (mut tx, mut rx) = tokio::try_join!(
                sender.setup(
                    topology(0, 100, vec![], Some(MotionLink::new(NODE, 1, 0, vec![Some(to_receiver)]))),
                    CancellationToken::new(),
                ),
                receiver.setup(
                    topology(-1, 200, vec![MotionLink::new(NODE, 1, 0, vec![Some(from_sender)])], None),
                    CancellationToken::new(),
                ),
            )?;

            // The first chunk goes out once the second is queued behind it.
            tx.send(NODE, 0, &[1; CHUNK]).await?;
            tx.send(NODE, 0, &[2; CHUNK]).await?;
            assert_eq!(rx.receive(NODE, 0).await?, Received::Chunk(vec![1; CHUNK]));
            rx.request_stop(NODE).await?;

            let mut outcome = SendOutcome::Queued;
            for _ in 0..10_000 {
                outcome = tx.send(NODE, 0, &[3; CHUNK]).await?;
                if outcome == SendOutcome::Stopped {
                    break;
                }
            }
            assert_eq!(outcome, SendOutcome::Stopped);
            assert_eq!(rx.receive(NODE, 0).await?, Received::EndOfStream);

            let tx_key = tx.outbound.as_ref().and_then(|node| node.routes[0].as_ref()).unwrap().key;
            {
                let shared = tx.ctx.inner.coord.lock();
                let conn = shared.registry.get(&tx_key).unwrap();
                assert_eq!(conn.state(), ConnState::EosSent);
                assert!(conn.stop_requested);
                assert!(!conn.still_active);
                assert!(!conn.awaiting_ack);
            }
            let rx_key = rx.inbound[0].routes[0].as_ref().unwrap().key;
            {
                let shared = rx.ctx.inner.coord.lock();
                let conn = shared.registry.get(&rx_key).unwrap();
                assert!(conn.stop_requested);
                assert!(!conn.still_active);
                assert!(conn.queue.is_empty());
                assert_eq!(shared.pool.outstanding(), 0);
            }
            let route = rx.inbound[0].routes[0].as_ref().unwrap();
            assert!(route.pending.is_empty() && route.end_of_stream);

            tx.teardown(false).await?;
            rx.teardown(false).await?;
            assert_eq!(receiver.connection_count(), 0);
            Ok(())
        })
        .await?
    }
}
