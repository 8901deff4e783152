//! Send engine. Chunks are coalesced into the fill buffer of a route; a full
//! buffer is sealed, swapped into the in-flight slot and retransmitted until
//! the receiver acknowledges it. At most one packet per route is in flight.

use crate::conn::Connection;
use crate::fault;
use crate::fsm::{ConnEvent, ConnState};
use crate::handle::{
    unknown_node, unknown_route, Context, OutboundNode, OutboundRoute, SendOutcome,
    TransportHandle,
};
use crate::registry::ConnKey;
use common::InterconnectError;
use protocol::{framed_len, seal, write_chunk, Flags, Header, HEADER_SIZE};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Ping/pong buffers of one outbound route. They are swapped by value, so
/// the packet handed to the socket is never the one being filled.
pub(crate) struct Transmitter {
    fill: Vec<u8>,
    in_flight: Vec<u8>,
    chunks: usize,
    /// Transmission attempts of the in-flight packet (or handshake).
    pub(crate) retry: u32,
    pub(crate) sent_at: Instant,
    max_packet_size: usize,
}

impl Transmitter {
    pub(crate) fn new(max_packet_size: usize) -> Self {
        let mut fill = Vec::with_capacity(max_packet_size);
        fill.resize(HEADER_SIZE, 0);
        Self {
            fill,
            in_flight: Vec::with_capacity(max_packet_size),
            chunks: 0,
            retry: 0,
            sent_at: Instant::now(),
            max_packet_size,
        }
    }

    fn fits(&self, len: usize) -> bool {
        self.fill.len() + framed_len(len) <= self.max_packet_size
    }

    fn append(&mut self, chunk: &[u8]) -> Result<(), InterconnectError> {
        write_chunk(&mut self.fill, chunk)?;
        self.chunks += 1;
        Ok(())
    }

    fn clear(&mut self) {
        self.fill.clear();
        self.fill.resize(HEADER_SIZE, 0);
        self.chunks = 0;
    }

    fn seal(&mut self, header: &mut Header, checksum: bool) -> Result<(), InterconnectError> {
        seal(&mut self.fill, header, checksum)?;
        std::mem::swap(&mut self.fill, &mut self.in_flight);
        self.clear();
        self.retry = 0;
        Ok(())
    }
}

enum AckState {
    Acked,
    Nak,
    Gone,
}

fn route_mut(
    node: &mut OutboundNode,
    index: usize,
) -> Result<&mut OutboundRoute, InterconnectError> {
    let motion_node_id = node.motion_node_id;
    node.routes
        .get_mut(index)
        .and_then(Option::as_mut)
        .ok_or_else(|| unknown_route(motion_node_id, index))
}

fn missing(key: &ConnKey) -> InterconnectError {
    InterconnectError::NotFound(
        "connection".into(),
        smol_str::format_smolstr!("node {} to pid {}", key.motion_node_id, key.dst_pid),
    )
}

impl Context {
    fn with_conn<T>(
        &self,
        key: &ConnKey,
        f: impl FnOnce(&mut Connection) -> T,
    ) -> Result<T, InterconnectError> {
        let mut shared = self.inner.coord.lock();
        let conn = shared.registry.get_mut(key).ok_or_else(|| missing(key))?;
        Ok(f(conn))
    }

    fn is_active(&self, key: &ConnKey) -> bool {
        let shared = self.inner.coord.lock();
        shared
            .registry
            .get(key)
            .is_some_and(|conn| conn.state() == ConnState::Started && conn.still_active)
    }

    fn is_awaiting_ack(&self, key: &ConnKey) -> bool {
        let shared = self.inner.coord.lock();
        shared.registry.get(key).is_some_and(|conn| conn.awaiting_ack)
    }

    /// First route whose receiver asked us to stop and which still needs the closing EOS.
    fn stop_pending(&self, node: &OutboundNode) -> Option<usize> {
        let shared = self.inner.coord.lock();
        node.routes.iter().enumerate().find_map(|(index, route)| {
            let conn = shared.registry.get(&route.as_ref()?.key)?;
            (conn.still_active && conn.stop_requested).then_some(index)
        })
    }

    async fn transmit(&self, route: &mut OutboundRoute) -> Result<(), InterconnectError> {
        route.xmit.sent_at = Instant::now();
        if fault::should_drop(self.config().drop_xmit_percent) {
            trace!(target: "interconnect::tx", peer = %route.peer_label, "fault injection dropped a packet");
            return Ok(());
        }
        self.inner.send_datagram(&route.xmit.in_flight, route.peer).await
    }

    /// Seal the fill buffer with the connection's current sequence and send it once.
    async fn flush(&self, route: &mut OutboundRoute, eos: bool) -> Result<(), InterconnectError> {
        let mut header = {
            let mut shared = self.inner.coord.lock();
            let conn = shared
                .registry
                .get_mut(&route.key)
                .ok_or_else(|| missing(&route.key))?;
            let mut header = conn.info;
            if eos {
                header.flags.insert(Flags::EOS);
            }
            conn.awaiting_ack = true;
            conn.nak_received = false;
            conn.ack_wait_begin = Some(Instant::now());
            header
        };
        let chunks = route.xmit.chunks;
        route.xmit.seal(&mut header, self.config().full_checksum)?;
        trace!(
            target: "interconnect::tx",
            node = header.motion_node_id,
            peer = %route.peer_label,
            seq = header.sequence,
            flags = ?header.flags,
            chunks,
            len = header.total_len,
            "packet sealed"
        );
        self.transmit(route).await?;
        route.xmit.retry = 1;
        Ok(())
    }

    /// Block until the in-flight packet of `route` is acknowledged (or
    /// answered with STOP), retransmitting on the backoff schedule.
    async fn wait_on_xmit(&self, route: &mut OutboundRoute) -> Result<(), InterconnectError> {
        let config = self.config();
        let key = route.key;
        let started = Instant::now();
        let mut timed_out: u64 = 0;
        let mut resent: u64 = 0;
        let mut round = 0u32;
        loop {
            let due = config
                .retransmit_timeout(route.xmit.retry)
                .saturating_sub(route.xmit.sent_at.elapsed());
            let bound = due.max(Duration::from_millis(1)).min(config.wait_interval());
            let state = self
                .wait(bound, &mut round, "waiting for an acknowledgement", |shared| {
                    let Some(conn) = shared.registry.get_mut(&key) else {
                        return Some(AckState::Gone);
                    };
                    if !conn.awaiting_ack {
                        Some(AckState::Acked)
                    } else if std::mem::take(&mut conn.nak_received) {
                        Some(AckState::Nak)
                    } else {
                        None
                    }
                })
                .await?;
            match state {
                Some(AckState::Acked) | Some(AckState::Gone) => break,
                Some(AckState::Nak) => {
                    // The receiver is alive but not ready; retry now, schedule untouched.
                    self.transmit(route).await?;
                    resent += 1;
                    self.inner.coord.lock().stats.retransmits += 1;
                    continue;
                }
                None => {}
            }
            if route.xmit.sent_at.elapsed() < config.retransmit_timeout(route.xmit.retry) {
                continue;
            }
            if let Some(limit) = config.max_retransmits {
                if timed_out >= u64::from(limit) {
                    return Err(InterconnectError::PeerUnreachable {
                        peer: route.peer_label.clone(),
                        retransmits: timed_out,
                        elapsed: started.elapsed(),
                    });
                }
            }
            self.transmit(route).await?;
            route.xmit.retry = route.xmit.retry.saturating_add(1);
            timed_out += 1;
            resent += 1;
            self.inner.coord.lock().stats.retransmits += 1;
            trace!(
                target: "interconnect::tx",
                peer = %route.peer_label,
                retry = route.xmit.retry,
                "retransmitted"
            );
            if timed_out % u64::from(config.liveness_check_interval) == 0 {
                self.check_liveness("retransmitting")?;
            }
        }
        if resent > 0 {
            let mut shared = self.inner.coord.lock();
            if let Some(conn) = shared.registry.get_mut(&key) {
                conn.stats.record_retransmits(resent);
            }
        }
        Ok(())
    }

    /// Answer every pending stop request with an empty EOS packet and retire the route.
    async fn handle_stop_msgs(&self, node: &mut OutboundNode) -> Result<(), InterconnectError> {
        while let Some(index) = self.stop_pending(node) {
            let route = route_mut(node, index)?;
            debug!(
                target: "interconnect::tx",
                node = route.key.motion_node_id,
                peer = %route.peer_label,
                "receiver asked to stop, closing route"
            );
            route.xmit.clear();
            if self.is_awaiting_ack(&route.key) {
                self.wait_on_xmit(route).await?;
            }
            self.flush(route, true).await?;
            self.wait_on_xmit(route).await?;
            self.with_conn(&route.key, |conn| {
                conn.still_active = false;
                conn.advance(ConnEvent::EosAck)
            })??;
        }
        Ok(())
    }

    async fn send_chunk(
        &self,
        node: &mut OutboundNode,
        index: usize,
        chunk: &[u8],
    ) -> Result<SendOutcome, InterconnectError> {
        if self.stop_pending(node).is_some() {
            self.handle_stop_msgs(node).await?;
        }
        let route = route_mut(node, index)?;
        if !self.is_active(&route.key) {
            return Ok(SendOutcome::Stopped);
        }
        if route.xmit.fits(chunk.len()) {
            route.xmit.append(chunk)?;
            return Ok(SendOutcome::Queued);
        }
        if self.is_awaiting_ack(&route.key) {
            self.wait_on_xmit(route).await?;
        }
        if self.stop_pending(node).is_some() {
            self.handle_stop_msgs(node).await?;
        }
        let sending_eos = node.sending_eos;
        let route = route_mut(node, index)?;
        if !self.is_active(&route.key) {
            return Ok(SendOutcome::Stopped);
        }
        self.flush(route, sending_eos).await?;
        route.xmit.append(chunk)?;
        Ok(SendOutcome::Queued)
    }

    async fn send_eos(&self, node: &mut OutboundNode) -> Result<(), InterconnectError> {
        node.sending_eos = true;
        let mut stop_race = false;
        for index in 0..node.routes.len() {
            let Some(route) = node.routes[index].as_mut() else {
                continue;
            };
            let key = route.key;
            if !self.is_active(&key) {
                continue;
            }
            if self.is_awaiting_ack(&key) {
                self.wait_on_xmit(route).await?;
                if self.stop_pending(node).is_some() {
                    self.handle_stop_msgs(node).await?;
                    if !self.is_active(&key) {
                        continue;
                    }
                }
            }
            let route = route_mut(node, index)?;
            self.flush(route, true).await?;
            self.wait_on_xmit(route).await?;
            let stopped = self.with_conn(&key, |conn| {
                if conn.stop_requested {
                    return Ok(true);
                }
                conn.advance(ConnEvent::EosAck)?;
                conn.still_active = false;
                Ok::<_, InterconnectError>(false)
            })??;
            if stopped {
                stop_race = true;
            } else {
                debug!(target: "interconnect::tx", peer = %route.peer_label, "end of stream acknowledged");
            }
        }
        if stop_race {
            self.handle_stop_msgs(node).await?;
        }
        Ok(())
    }
}

fn find_node(
    outbound: &mut Option<OutboundNode>,
    motion_node_id: i32,
) -> Result<&mut OutboundNode, InterconnectError> {
    outbound
        .as_mut()
        .filter(|node| node.motion_node_id == motion_node_id)
        .ok_or_else(|| unknown_node(motion_node_id))
}

impl TransportHandle {
    fn check_chunk(&self, chunk: &[u8]) -> Result<(), InterconnectError> {
        if HEADER_SIZE + framed_len(chunk.len()) > self.ctx.config().max_packet_size {
            return Err(InterconnectError::PayloadTooLarge(chunk.len()));
        }
        Ok(())
    }

    /// Queue one chunk for `route` of the motion node this process sends on.
    pub async fn send(
        &mut self,
        motion_node_id: i32,
        route: usize,
        chunk: &[u8],
    ) -> Result<SendOutcome, InterconnectError> {
        self.ctx.check_cancelled("sending")?;
        self.check_chunk(chunk)?;
        let TransportHandle { ctx, outbound, .. } = self;
        let node = find_node(outbound, motion_node_id)?;
        route_mut(node, route)?;
        ctx.send_chunk(node, route, chunk).await
    }

    /// Queue one chunk for every active route; `Stopped` once no receiver wants data.
    pub async fn send_broadcast(
        &mut self,
        motion_node_id: i32,
        chunk: &[u8],
    ) -> Result<SendOutcome, InterconnectError> {
        self.ctx.check_cancelled("broadcasting")?;
        self.check_chunk(chunk)?;
        let TransportHandle { ctx, outbound, .. } = self;
        let node = find_node(outbound, motion_node_id)?;
        let mut outcome = SendOutcome::Stopped;
        for index in 0..node.routes.len() {
            if node.routes[index].is_none() {
                continue;
            }
            if ctx.send_chunk(node, index, chunk).await? == SendOutcome::Queued {
                outcome = SendOutcome::Queued;
            }
        }
        Ok(outcome)
    }

    /// Flush every route with the end-of-stream flag and wait until each is acknowledged.
    pub async fn send_eos(&mut self, motion_node_id: i32) -> Result<(), InterconnectError> {
        self.ctx.check_cancelled("sending end of stream")?;
        let TransportHandle { ctx, outbound, .. } = self;
        let node = find_node(outbound, motion_node_id)?;
        ctx.send_eos(node).await
    }

    pub(crate) fn has_active_outbound(&self) -> bool {
        self.outbound.as_ref().is_some_and(|node| {
            node.routes
                .iter()
                .flatten()
                .any(|route| self.ctx.is_active(&route.key))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{decode, ChunkReader};

    #[test]
    fn test_transmitter_swaps_buffers() {
        let mut xmit = Transmitter::new(128);
        assert_eq!(xmit.chunks, 0);
        xmit.append(b"one").unwrap();
        xmit.append(b"two").unwrap();
        let mut header = Header {
            sequence: 1,
            ..Default::default()
        };
        xmit.seal(&mut header, true).unwrap();
        assert_eq!(xmit.chunks, 0);
        assert_eq!(xmit.fill.len(), HEADER_SIZE);

        let (decoded, payload) = decode(&xmit.in_flight, true).unwrap();
        assert_eq!(decoded.sequence, 1);
        let chunks: Vec<&[u8]> = ChunkReader::new(payload).map(|c| c.unwrap()).collect();
        assert_eq!(chunks, vec![&b"one"[..], &b"two"[..]]);

        // Filling the next packet leaves the in-flight one untouched.
        xmit.append(b"three").unwrap();
        let (_, payload) = decode(&xmit.in_flight, true).unwrap();
        assert_eq!(ChunkReader::new(payload).count(), 2);
    }

    #[test]
    fn test_transmitter_capacity() {
        let mut xmit = Transmitter::new(HEADER_SIZE + 12);
        assert!(xmit.fits(10));
        assert!(!xmit.fits(11));
        xmit.append(&[0; 4]).unwrap();
        assert!(xmit.fits(4));
        assert!(!xmit.fits(5));
    }
}
