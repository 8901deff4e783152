//! Receive engine: the single task that owns the read side of the socket.
//! It classifies every datagram, updates connection state under the
//! coordinator lock, and answers with acknowledgements once the lock is released.

use crate::config::Config;
use crate::conn::{Connection, Direction, QueuedPacket};
use crate::coord::Shared;
use crate::fault;
use crate::fsm::{ConnAction, ConnEvent, ConnState};
use crate::history::{InstanceHistory, Verdict};
use crate::interconnect::{is_transient, Inner};
use crate::stats::GlobalStats;
use common::InterconnectError;
use protocol::{decode, encode, Flags, Header, HEADER_SIZE};
use smallvec::SmallVec;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

pub(crate) struct Reply {
    pub(crate) bytes: Vec<u8>,
    pub(crate) to: SocketAddr,
}

/// Outcome of one datagram: replies to send and whether waiters must wake.
#[derive(Default)]
pub(crate) struct Dispatch {
    pub(crate) replies: SmallVec<[Reply; 2]>,
    pub(crate) wake: bool,
}

impl Dispatch {
    fn reply(&mut self, bytes: anyhow::Result<Vec<u8>>, to: SocketAddr) {
        match bytes {
            Ok(bytes) => self.replies.push(Reply { bytes, to }),
            Err(e) => warn!(target: "interconnect::rx", %to, error = %e, "failed to encode ack"),
        }
    }
}

pub(crate) async fn run(inner: Arc<Inner>) {
    let mut scratch = vec![0u8; inner.config.max_packet_size.max(HEADER_SIZE)];
    loop {
        let received = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            received = inner.socket.recv_from(&mut scratch) => received,
        };
        let (len, from) = match received {
            Ok(received) => received,
            Err(e) if is_transient(&e) => continue,
            Err(e) => {
                warn!(target: "interconnect::rx", error = %e, "receive failed");
                tokio::time::sleep(Duration::from_millis(1)).await;
                continue;
            }
        };
        let dispatch = {
            let mut shared = inner.coord.lock();
            process_datagram(&mut shared, &inner.config, &scratch[..len], from)
        };
        if dispatch.wake {
            inner.coord.wake();
        }
        for reply in dispatch.replies {
            if fault::should_drop(inner.config.drop_acks_percent) {
                trace!(target: "interconnect::rx", to = %reply.to, "fault injection dropped an ack");
                continue;
            }
            if let Err(e) = inner.send_datagram(&reply.bytes, reply.to).await {
                debug!(target: "interconnect::rx", error = %e, "failed to send ack");
            }
        }
    }
    debug!(target: "interconnect::rx", "receive engine stopped");
}

pub(crate) fn process_datagram(
    shared: &mut Shared,
    config: &Config,
    bytes: &[u8],
    from: SocketAddr,
) -> Dispatch {
    let mut dispatch = Dispatch::default();
    let header = match decode(bytes, config.full_checksum) {
        Ok((header, _)) => header,
        Err(e) => {
            match e.downcast_ref::<InterconnectError>() {
                Some(InterconnectError::ChecksumMismatch { .. }) => {
                    shared.stats.checksum_errors += 1
                }
                _ => shared.stats.malformed += 1,
            }
            debug!(target: "interconnect::rx", %from, error = %e, "discarding datagram");
            return dispatch;
        }
    };
    shared.stats.packets_received += 1;
    if header.flags.contains(Flags::ACK) {
        handle_ack(shared, &header, &mut dispatch);
    } else {
        handle_data(shared, config, &header, bytes, from, &mut dispatch);
    }
    dispatch
}

fn handle_data(
    shared: &mut Shared,
    config: &Config,
    header: &Header,
    packet: &[u8],
    from: SocketAddr,
    dispatch: &mut Dispatch,
) {
    let Shared {
        registry,
        pool,
        history,
        stats,
    } = shared;
    let checksum = config.full_checksum;
    let conn = match registry.find_mut(header) {
        Some(conn) if conn.direction == Direction::Inbound => conn,
        _ => return handle_mismatch(history, stats, header, from, checksum, dispatch),
    };

    if header.is_handshake() {
        return handle_handshake(conn, stats, header, from, checksum, dispatch);
    }
    if conn.state() != ConnState::Started {
        trace!(
            target: "interconnect::rx",
            node = header.motion_node_id,
            route = conn.route,
            seq = header.sequence,
            "data before handshake, asking peer to retry"
        );
        dispatch.reply(conn.ack(header.sequence, Flags::NAK, checksum), from);
        return;
    }

    let eos = header.flags.contains(Flags::EOS);
    if header.flags.contains(Flags::STOP) && !conn.stop_requested {
        trace!(target: "interconnect::rx", seq = header.sequence, "unrequested stop flag ignored");
        return;
    }
    if conn.stop_requested && conn.still_active {
        if eos {
            conn.info.flags.insert(Flags::EOS);
        }
        conn.info.sequence = header.sequence;
        dispatch.reply(conn.ack(header.sequence, Flags::STOP, checksum), from);
        if eos {
            debug!(
                target: "interconnect::rx",
                node = header.motion_node_id,
                route = conn.route,
                "stop acknowledged by sender"
            );
            conn.still_active = false;
            dispatch.wake = true;
        }
        return;
    }
    if header.sequence < conn.info.sequence {
        // Our acknowledgement was lost; repeat it.
        stats.dropped_acks += 1;
        dispatch.reply(conn.ack(header.sequence, Flags::empty(), checksum), from);
        return;
    }
    if !conn.still_active {
        conn.info.sequence = header.sequence;
        dispatch.reply(conn.ack(header.sequence, Flags::STOP, checksum), from);
        return;
    }
    if header.sequence > conn.info.sequence {
        debug!(
            target: "interconnect::rx",
            node = header.motion_node_id,
            route = conn.route,
            seq = header.sequence,
            expected = conn.info.sequence,
            "sequence ahead of expected, dropping"
        );
        return;
    }
    if header.payload_len() == 0 && !eos {
        return;
    }
    if conn.queue.len() >= config.queue_depth {
        stats.rx_overruns += 1;
        conn.stats.dropped += 1;
        trace!(target: "interconnect::rx", route = conn.route, seq = header.sequence, "queue full, dropping");
        return;
    }
    let Ok(mut buffer) = pool.acquire() else {
        stats.rx_overruns += 1;
        conn.stats.dropped += 1;
        trace!(target: "interconnect::rx", route = conn.route, seq = header.sequence, "buffer pool exhausted, dropping");
        return;
    };
    buffer.fill(packet);
    dispatch.reply(conn.ack(header.sequence, Flags::empty(), checksum), from);
    conn.queue.push_back(QueuedPacket {
        header: *header,
        buffer,
    });
    conn.info.sequence += 1;
    if eos {
        conn.info.flags.insert(Flags::EOS);
        conn.eos_acked = true;
    }
    dispatch.wake = true;
    trace!(
        target: "interconnect::rx",
        node = header.motion_node_id,
        route = conn.route,
        seq = header.sequence,
        queued = conn.queue.len(),
        eos,
        "packet queued"
    );
}

fn handle_handshake(
    conn: &mut Connection,
    stats: &mut GlobalStats,
    header: &Header,
    from: SocketAddr,
    checksum: bool,
    dispatch: &mut Dispatch,
) {
    conn.peer = Some(from);
    match conn.advance(ConnEvent::HandshakeRequest) {
        Ok(Some(ConnAction::AckHandshake)) => {
            conn.info.src_listener_port = header.src_listener_port;
            conn.still_active = true;
            dispatch.reply(conn.ack(0, Flags::empty(), checksum), from);
            conn.info.sequence = 1;
            dispatch.wake = true;
            debug!(
                target: "interconnect::rx",
                node = header.motion_node_id,
                route = conn.route,
                peer = %conn.peer_label,
                "incoming connection established"
            );
        }
        Ok(_) => {
            stats.dropped_acks += 1;
            dispatch.reply(conn.ack(header.sequence, Flags::empty(), checksum), from);
        }
        Err(e) => debug!(target: "interconnect::rx", error = %e, "unexpected handshake"),
    }
}

fn handle_mismatch(
    history: &InstanceHistory,
    stats: &mut GlobalStats,
    header: &Header,
    from: SocketAddr,
    checksum: bool,
    dispatch: &mut Dispatch,
) {
    stats.mismatches += 1;
    let verdict = if header.is_handshake() {
        Verdict::Unknown
    } else {
        history.verdict(header.session_id, header.instance_id)
    };
    let extra = match verdict {
        Verdict::Retired => Flags::STOP,
        Verdict::NotYetSetUp => Flags::NAK,
        Verdict::Unknown => {
            trace!(
                target: "interconnect::rx",
                %from,
                node = header.motion_node_id,
                instance = header.instance_id,
                seq = header.sequence,
                "no connection for packet, discarding"
            );
            return;
        }
    };
    let ack = Header {
        flags: header.flags | Flags::ACK | extra,
        ..*header
    };
    dispatch.reply(encode(&ack, &[], checksum), from);
    debug!(
        target: "interconnect::rx",
        %from,
        instance = header.instance_id,
        last_teardown = ?history.last_teardown(),
        seq = header.sequence,
        ?verdict,
        "answering packet without a connection"
    );
}

fn handle_ack(shared: &mut Shared, header: &Header, dispatch: &mut Dispatch) {
    let Shared {
        registry, stats, ..
    } = shared;
    let conn = match registry.find_mut(header) {
        Some(conn) if conn.direction == Direction::Outbound => conn,
        _ => {
            stats.mismatches += 1;
            trace!(target: "interconnect::rx", seq = header.sequence, "ack for unknown connection");
            return;
        }
    };
    match conn.state() {
        ConnState::Null => return,
        ConnState::AwaitingHandshakeAck => {
            if header.is_handshake() && !header.flags.contains(Flags::NAK) {
                if let Ok(Some(ConnAction::Activate)) = conn.advance(ConnEvent::HandshakeAck) {
                    conn.still_active = true;
                    conn.info.sequence = 1;
                    dispatch.wake = true;
                    debug!(
                        target: "interconnect::rx",
                        node = header.motion_node_id,
                        route = conn.route,
                        peer = %conn.peer_label,
                        "outgoing connection established"
                    );
                }
            }
            return;
        }
        ConnState::Started | ConnState::EosSent => {}
    }
    if header.sequence != conn.info.sequence {
        trace!(
            target: "interconnect::rx",
            route = conn.route,
            seq = header.sequence,
            expected = conn.info.sequence,
            "stale ack"
        );
        return;
    }
    let flags = header.flags;
    if !conn.awaiting_ack && !flags.contains(Flags::STOP) {
        return;
    }
    if flags.contains(Flags::NAK) {
        conn.nak_received = true;
        dispatch.wake = true;
        return;
    }
    if conn.stop_requested {
        // Only the acknowledgement of our closing EOS matters now.
        if flags.contains(Flags::EOS) && conn.awaiting_ack {
            complete(conn, false);
            dispatch.wake = true;
        }
        return;
    }
    if flags.contains(Flags::STOP) {
        debug!(
            target: "interconnect::rx",
            node = header.motion_node_id,
            route = conn.route,
            "receiver requested stop"
        );
        conn.stop_requested = true;
        conn.info.flags.insert(Flags::STOP);
        complete(conn, false);
        dispatch.wake = true;
        return;
    }
    complete(conn, true);
    dispatch.wake = true;
}

fn complete(conn: &mut Connection, record: bool) {
    conn.info.sequence += 1;
    conn.awaiting_ack = false;
    conn.nak_received = false;
    if let Some(begin) = conn.ack_wait_begin.take() {
        if record {
            conn.stats.record_ack(begin.elapsed());
        }
    }
}
