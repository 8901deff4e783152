use std::time::Duration;

/// Per-connection counters, kept in the shared descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnStats {
    pub acks: u64,
    pub total_ack_time: Duration,
    pub min_ack_time: Option<Duration>,
    pub max_ack_time: Duration,
    pub retransmits: u64,
    /// Most retransmits any single packet needed.
    pub max_retransmits: u64,
    /// Packets refused because the queue or the buffer pool was full.
    pub dropped: u64,
}

impl ConnStats {
    pub(crate) fn record_ack(&mut self, latency: Duration) {
        self.acks += 1;
        self.total_ack_time += latency;
        self.max_ack_time = self.max_ack_time.max(latency);
        self.min_ack_time = Some(self.min_ack_time.map_or(latency, |min| min.min(latency)));
    }

    pub(crate) fn record_retransmits(&mut self, count: u64) {
        self.retransmits += count;
        self.max_retransmits = self.max_retransmits.max(count);
    }
}

/// Aggregate over every connection of one motion node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeStats {
    pub connections: usize,
    pub acks: u64,
    pub total_ack_time: Duration,
    pub min_ack_time: Option<Duration>,
    pub max_ack_time: Duration,
    pub retransmits: u64,
    pub max_retransmits: u64,
    pub dropped: u64,
}

impl NodeStats {
    pub(crate) fn add(&mut self, conn: &ConnStats) {
        self.connections += 1;
        self.acks += conn.acks;
        self.total_ack_time += conn.total_ack_time;
        self.max_ack_time = self.max_ack_time.max(conn.max_ack_time);
        self.min_ack_time = match (self.min_ack_time, conn.min_ack_time) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.retransmits += conn.retransmits;
        self.max_retransmits = self.max_retransmits.max(conn.max_retransmits);
        self.dropped += conn.dropped;
    }

    pub fn mean_ack_time(&self) -> Option<Duration> {
        u32::try_from(self.acks)
            .ok()
            .filter(|acks| *acks > 0)
            .map(|acks| self.total_ack_time / acks)
    }
}

/// Process-wide counters of the receive engine and the send engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GlobalStats {
    pub packets_received: u64,
    /// Duplicates answered with a repeated acknowledgement.
    pub dropped_acks: u64,
    pub retransmits: u64,
    /// Packets for which no connection exists.
    pub mismatches: u64,
    pub rx_overruns: u64,
    pub checksum_errors: u64,
    pub malformed: u64,
}
