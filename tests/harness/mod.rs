#![allow(dead_code)]

use anyhow::Result;
use interconnect::{Config, Interconnect, MotionLink, Peer, Topology, TransportHandle};
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(20);
pub const SESSION: i32 = 42;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Short timers so loss recovery runs in milliseconds.
pub fn fast_config() -> Config {
    Config {
        retransmit_base_ms: 1,
        retransmit_cap_ms: 20,
        wait_interval_ms: 20,
        setup_poll_ms: 10,
        setup_timeout_ms: 5_000,
        full_checksum: true,
        socket_buffer_size: None,
        ..Default::default()
    }
}

pub fn loopback() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

/// One worker process of the simulated cluster.
pub struct Process {
    pub interconnect: Interconnect,
    pub content_id: i32,
    pub pid: i32,
}

impl Process {
    pub async fn bind(config: &Config, content_id: i32, pid: i32) -> Result<Self> {
        let interconnect = Interconnect::bind(config.clone(), loopback()).await?;
        Ok(Self {
            interconnect,
            content_id,
            pid,
        })
    }

    pub fn peer(&self) -> Peer {
        Peer::new(self.content_id, self.pid, self.interconnect.local_addr())
    }

    /// Same process identity, reached through another address (a proxy).
    pub fn peer_via(&self, address: SocketAddr) -> Peer {
        Peer::new(self.content_id, self.pid, address)
    }

    pub fn topology(
        &self,
        instance_id: u32,
        receiving: Vec<MotionLink>,
        sending: Option<MotionLink>,
    ) -> Topology {
        Topology {
            session_id: SESSION,
            instance_id,
            content_id: self.content_id,
            pid: self.pid,
            cluster_size: 4,
            receiving,
            sending,
        }
    }

    pub async fn setup(&self, topology: Topology) -> Result<TransportHandle> {
        Ok(self
            .interconnect
            .setup(topology, CancellationToken::new())
            .await?)
    }
}

/// Motion node `node` fed by `senders`, one route each.
pub fn recv_link(node: i32, senders: &[Peer]) -> MotionLink {
    MotionLink::new(node, 1, 0, senders.iter().cloned().map(Some).collect())
}

/// Motion node `node` feeding `receivers`, one route each.
pub fn send_link(node: i32, receivers: &[Peer]) -> MotionLink {
    MotionLink::new(node, 1, 0, receivers.iter().cloned().map(Some).collect())
}

/// Config whose packets hold exactly one chunk of `chunk` bytes.
pub fn one_chunk_per_packet(chunk: usize) -> Config {
    Config {
        max_packet_size: interconnect::HEADER_SIZE + chunk + 2 + chunk / 2,
        ..fast_config()
    }
}

/// Poll `cond` until it holds or `limit` elapses.
pub async fn eventually(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}
