use crate::config::Config;
use crate::history::InstanceHistory;
use crate::pool::RxBufferPool;
use crate::registry::Registry;
use crate::stats::GlobalStats;
use common::InterconnectError;
use smol_str::format_smolstr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Coordinator liveness check consulted during long waits. Returning
/// `false` aborts the wait with `CoordinatorLost`.
pub trait LivenessProbe: Send + Sync {
    fn is_alive(&self) -> bool;
}

/// Everything the receive engine and the executors share.
pub(crate) struct Shared {
    pub(crate) registry: Registry,
    pub(crate) pool: RxBufferPool,
    pub(crate) history: InstanceHistory,
    pub(crate) stats: GlobalStats,
}

impl Shared {
    pub(crate) fn new(config: &Config) -> Self {
        Self {
            registry: Registry::new(config.hash_table_size),
            pool: RxBufferPool::new(config.max_packet_size, config.rx_buffer_pool_size),
            history: InstanceHistory::default(),
            stats: GlobalStats::default(),
        }
    }
}

pub(crate) struct Coordinator {
    state: Mutex<Shared>,
    wakeup: Notify,
}

impl Coordinator {
    pub(crate) fn new(shared: Shared) -> Self {
        Self {
            state: Mutex::new(shared),
            wakeup: Notify::new(),
        }
    }

    /// The only way to reach shared state. A panic while the guard was held
    /// leaves the data consistent enough to tear down, so poisoning is ignored.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Shared> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn wake(&self) {
        self.wakeup.notify_waiters();
    }

    /// Evaluate `check` under the lock until it yields a value, a wakeup
    /// arrives, `bound` elapses or `cancel` fires. Returns `None` when woken
    /// or timed out without the condition holding; callers loop.
    pub(crate) async fn wait<T>(
        &self,
        cancel: &CancellationToken,
        bound: Duration,
        what: &'static str,
        mut check: impl FnMut(&mut Shared) -> Option<T>,
    ) -> Result<Option<T>, InterconnectError> {
        let notified = self.wakeup.notified();
        tokio::pin!(notified);
        // Register before checking so a wakeup between check and sleep is not lost.
        notified.as_mut().enable();
        let ready = {
            let mut shared = self.lock();
            check(&mut shared)
        };
        if ready.is_some() {
            return Ok(ready);
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(InterconnectError::Cancelled(format_smolstr!("while {what}")));
            }
            _ = &mut notified => {}
            _ = tokio::time::sleep(bound) => {}
        }
        let ready = {
            let mut shared = self.lock();
            check(&mut shared)
        };
        Ok(ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::sync::Arc;
    use std::time::Instant;
    use tokio::time::timeout;

    fn coordinator() -> Arc<Coordinator> {
        Arc::new(Coordinator::new(Shared::new(&Config::default())))
    }

    #[tokio::test]
    async fn test_wakeup_is_not_lost() -> Result<()> {
        let coord = coordinator();
        let cancel = CancellationToken::new();
        let waker = Arc::clone(&coord);
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            waker.lock().stats.packets_received = 1;
            waker.wake();
        });
        let started = Instant::now();
        loop {
            let seen = coord
                .wait(&cancel, Duration::from_secs(5), "testing", |shared| {
                    (shared.stats.packets_received == 1).then_some(())
                })
                .await?;
            if seen.is_some() {
                break;
            }
        }
        assert!(started.elapsed() < Duration::from_secs(5));
        task.await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_bounded_wait_times_out() -> Result<()> {
        let coord = coordinator();
        let cancel = CancellationToken::new();
        let seen = coord
            .wait(&cancel, Duration::from_millis(10), "testing", |_| None::<()>)
            .await?;
        assert!(seen.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_interrupts_wait() -> Result<()> {
        let coord = coordinator();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let err = timeout(
            Duration::from_secs(1),
            coord.wait(&cancel, Duration::from_secs(60), "testing", |_| None::<()>),
        )
        .await?
        .unwrap_err();
        assert!(err.is_cancelled());
        Ok(())
    }
}
