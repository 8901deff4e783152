use crate::config::Config;
use crate::coord::{Coordinator, Shared};
use crate::handle::TransportHandle;
use crate::rx;
use crate::stats::GlobalStats;
use crate::topology::Topology;
use common::InterconnectError;
use smol_str::format_smolstr;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// State shared by the receive engine and every transport handle of the process.
pub(crate) struct Inner {
    pub(crate) config: Config,
    pub(crate) socket: UdpSocket,
    pub(crate) local_addr: SocketAddr,
    pub(crate) coord: Coordinator,
    pub(crate) shutdown: CancellationToken,
}

pub(crate) fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
    )
}

impl Inner {
    /// Fire one datagram. Losses are recovered by retransmission, so only
    /// hard socket failures are reported.
    pub(crate) async fn send_datagram(
        &self,
        bytes: &[u8],
        to: SocketAddr,
    ) -> Result<(), InterconnectError> {
        match self.socket.send_to(bytes, to).await {
            Ok(_) => Ok(()),
            Err(e) if is_transient(&e) => {
                trace!(target: "interconnect::net", %to, error = %e, "datagram lost on send");
                Ok(())
            }
            Err(e) => Err(InterconnectError::FailedTo(
                "send datagram".into(),
                format_smolstr!("{to}: {e}"),
            )),
        }
    }
}

fn open_socket(config: &Config, addr: SocketAddr) -> Result<UdpSocket, InterconnectError> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if let Some(size) = config.socket_buffer_size {
        // The kernel clamps oversized requests; a refusal only costs throughput.
        if let Err(e) = socket.set_recv_buffer_size(size) {
            warn!(size, error = %e, "could not set socket receive buffer size");
        }
        if let Err(e) = socket.set_send_buffer_size(size) {
            warn!(size, error = %e, "could not set socket send buffer size");
        }
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// Process-level transport endpoint: one UDP socket, one receive engine,
/// one buffer pool and one connection table shared by every query instance.
pub struct Interconnect {
    inner: Arc<Inner>,
    receiver: Option<JoinHandle<()>>,
}

impl Interconnect {
    pub async fn bind(config: Config, addr: SocketAddr) -> Result<Self, InterconnectError> {
        config.validate()?;
        let socket = open_socket(&config, addr)?;
        let local_addr = socket.local_addr()?;
        let inner = Arc::new(Inner {
            coord: Coordinator::new(Shared::new(&config)),
            config,
            socket,
            local_addr,
            shutdown: CancellationToken::new(),
        });
        let receiver = tokio::spawn(rx::run(Arc::clone(&inner)));
        info!(%local_addr, "interconnect listening");
        Ok(Self {
            inner,
            receiver: Some(receiver),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Establish every connection of one query instance.
    pub async fn setup(
        &self,
        topology: Topology,
        cancel: CancellationToken,
    ) -> Result<TransportHandle, InterconnectError> {
        TransportHandle::establish(Arc::clone(&self.inner), topology, cancel).await
    }

    pub fn statistics(&self) -> GlobalStats {
        self.inner.coord.lock().stats
    }

    /// Receive buffers currently queued on connections.
    pub fn buffers_in_use(&self) -> usize {
        self.inner.coord.lock().pool.outstanding()
    }

    /// Live connection descriptors across all query instances.
    pub fn connection_count(&self) -> usize {
        self.inner.coord.lock().registry.len()
    }

    /// Stop the receive engine and wait for it to exit.
    pub async fn shutdown(mut self) -> Result<(), InterconnectError> {
        self.inner.shutdown.cancel();
        if let Some(receiver) = self.receiver.take() {
            receiver.await.map_err(|e| {
                InterconnectError::FailedTo("stop receive engine".into(), format_smolstr!("{e}"))
            })?;
        }
        debug!(local_addr = %self.inner.local_addr, "interconnect shut down");
        Ok(())
    }
}

impl Drop for Interconnect {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}
