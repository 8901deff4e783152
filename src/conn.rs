use crate::fsm::{connection, ConnAction, ConnEvent, ConnState};
use crate::pool::{RxBuffer, RxBufferPool};
use crate::registry::ConnKey;
use crate::stats::ConnStats;
use anyhow::anyhow;
use common::InterconnectError;
use protocol::{encode, Flags, Header};
use smol_str::SmolStr;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Direction {
    Inbound,
    Outbound,
}

pub(crate) struct QueuedPacket {
    pub(crate) header: Header,
    pub(crate) buffer: RxBuffer,
}

/// Shared connection descriptor, only reachable through the coordinator lock.
///
/// `info` is the header template of the connection. Its `sequence` is the
/// next expected sequence on inbound connections and the in-flight (or next)
/// sequence on outbound ones.
pub(crate) struct Connection {
    pub(crate) key: ConnKey,
    pub(crate) direction: Direction,
    pub(crate) route: usize,
    pub(crate) info: Header,
    fsm: connection::StateMachine,
    pub(crate) peer: Option<SocketAddr>,
    pub(crate) peer_label: SmolStr,
    pub(crate) still_active: bool,
    pub(crate) stop_requested: bool,
    /// An end-of-stream packet has been accepted into the queue.
    pub(crate) eos_acked: bool,
    pub(crate) queue: VecDeque<QueuedPacket>,
    pub(crate) awaiting_ack: bool,
    pub(crate) nak_received: bool,
    pub(crate) ack_wait_begin: Option<Instant>,
    pub(crate) stats: ConnStats,
}

impl Connection {
    pub(crate) fn new(
        direction: Direction,
        route: usize,
        info: Header,
        peer: Option<SocketAddr>,
        peer_label: SmolStr,
    ) -> Self {
        Self {
            key: ConnKey::of(&info),
            direction,
            route,
            info,
            fsm: connection::StateMachine::new(),
            peer,
            peer_label,
            still_active: false,
            stop_requested: false,
            eos_acked: false,
            queue: VecDeque::new(),
            awaiting_ack: false,
            nak_received: false,
            ack_wait_begin: None,
            stats: ConnStats::default(),
        }
    }

    pub(crate) fn state(&self) -> ConnState {
        *self.fsm.state()
    }

    pub(crate) fn advance(
        &mut self,
        event: ConnEvent,
    ) -> Result<Option<ConnAction>, InterconnectError> {
        self.fsm.consume(&event).map_err(|_| {
            InterconnectError::InvalidTransition(anyhow!(
                "{event:?} in state {:?} for {}",
                self.fsm.state(),
                self.peer_label
            ))
        })
    }

    /// Acknowledgement of `sequence`, carrying the connection flags plus `extra`.
    pub(crate) fn ack(
        &self,
        sequence: u32,
        extra: Flags,
        checksum: bool,
    ) -> anyhow::Result<Vec<u8>> {
        let header = Header {
            flags: self.info.flags | Flags::ACK | extra,
            sequence,
            ..self.info
        };
        encode(&header, &[], checksum)
    }

    pub(crate) fn handshake(&self, checksum: bool) -> anyhow::Result<Vec<u8>> {
        let header = Header {
            flags: Flags::empty(),
            sequence: 0,
            ..self.info
        };
        encode(&header, &[], checksum)
    }

    /// Hand every queued buffer back to the pool.
    pub(crate) fn release_queue(&mut self, pool: &mut RxBufferPool) -> usize {
        let released = self.queue.len();
        for packet in self.queue.drain(..) {
            pool.release(packet.buffer);
        }
        released
    }
}
