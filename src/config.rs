use common::InterconnectError;
use protocol::{framed_len, Header, HEADER_SIZE, MAX_DATAGRAM_SIZE};
use serde::{Deserialize, Serialize};
use smol_str::format_smolstr;
use std::time::Duration;

/// Transport tuning. Every knob has a usable default; durations are stored
/// as integer milliseconds so the struct reads naturally from config files.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Largest datagram the transport emits, header included.
    pub max_packet_size: usize,
    /// Packets a single inbound connection may hold before new ones are dropped.
    pub queue_depth: usize,
    /// Ceiling of the process-wide receive-buffer pool.
    pub rx_buffer_pool_size: usize,
    pub setup_timeout_ms: u64,
    /// Smallest non-zero retransmit interval; doubled on every retry.
    pub retransmit_base_ms: u64,
    pub retransmit_cap_ms: u64,
    /// Retransmits of one packet before the peer is declared unreachable.
    pub max_retransmits: Option<u32>,
    /// Upper bound of a single blocking wait; cancellation is always seen sooner.
    pub wait_interval_ms: u64,
    /// Upper bound of one handshake polling round during setup.
    pub setup_poll_ms: u64,
    /// Consult the liveness probe every this many waits or retransmits.
    pub liveness_check_interval: u32,
    pub full_checksum: bool,
    pub hash_table_size: usize,
    pub hash_table_multiplier: usize,
    /// Requested kernel send/receive buffer size of the socket.
    pub socket_buffer_size: Option<usize>,
    pub drop_xmit_percent: u8,
    pub drop_acks_percent: u8,
    pub log_stats: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_packet_size: 8192,
            queue_depth: 4,
            rx_buffer_pool_size: 256,
            setup_timeout_ms: 7_200_000,
            retransmit_base_ms: 1,
            retransmit_cap_ms: 512,
            max_retransmits: None,
            wait_interval_ms: 250,
            setup_poll_ms: 100,
            liveness_check_interval: 64,
            full_checksum: false,
            hash_table_size: 16,
            hash_table_multiplier: 2,
            socket_buffer_size: Some(2 * 1024 * 1024),
            drop_xmit_percent: 0,
            drop_acks_percent: 0,
            log_stats: false,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), InterconnectError> {
        let invalid = |msg| Err(InterconnectError::InvalidConfig(msg));
        if self.max_packet_size < HEADER_SIZE + framed_len(1) {
            return invalid(format_smolstr!(
                "max_packet_size {} cannot hold a header and a chunk",
                self.max_packet_size
            ));
        }
        if self.max_packet_size > MAX_DATAGRAM_SIZE {
            return invalid(format_smolstr!(
                "max_packet_size {} exceeds the datagram limit {MAX_DATAGRAM_SIZE}",
                self.max_packet_size
            ));
        }
        if self.queue_depth == 0 {
            return invalid("queue_depth must be positive".into());
        }
        if self.rx_buffer_pool_size == 0 {
            return invalid("rx_buffer_pool_size must be positive".into());
        }
        if self.retransmit_base_ms == 0 || self.retransmit_cap_ms < self.retransmit_base_ms {
            return invalid(format_smolstr!(
                "retransmit schedule {}..{} ms is empty",
                self.retransmit_base_ms,
                self.retransmit_cap_ms
            ));
        }
        if self.wait_interval_ms == 0 || self.setup_poll_ms == 0 {
            return invalid("wait intervals must be positive".into());
        }
        if self.liveness_check_interval == 0 {
            return invalid("liveness_check_interval must be positive".into());
        }
        if self.hash_table_size == 0 || self.hash_table_multiplier == 0 {
            return invalid("hash table sizing must be positive".into());
        }
        if self.drop_xmit_percent > 100 || self.drop_acks_percent > 100 {
            return invalid("drop percentages must be within 0..=100".into());
        }
        Ok(())
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_millis(self.setup_timeout_ms)
    }

    pub fn wait_interval(&self) -> Duration {
        Duration::from_millis(self.wait_interval_ms)
    }

    pub fn setup_poll(&self) -> Duration {
        Duration::from_millis(self.setup_poll_ms)
    }

    /// Delay before transmission attempt `retry`: zero for the first
    /// attempt, then `base * 2^(retry - 1)` capped.
    pub fn retransmit_timeout(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let shift = (retry - 1).min(31);
        let ms = self
            .retransmit_base_ms
            .saturating_mul(1u64 << shift)
            .min(self.retransmit_cap_ms);
        Duration::from_millis(ms)
    }

    /// Largest chunk that fits into an otherwise empty packet.
    pub fn max_chunk_size(&self) -> usize {
        let room = Header::payload_max_size(self.max_packet_size);
        let mut len = room.saturating_sub(5);
        while len < room && framed_len(len + 1) <= room {
            len += 1;
        }
        len
    }
}
