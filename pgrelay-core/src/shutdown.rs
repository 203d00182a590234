//! Process-wide teardown: drain every relay, then close the pool.
//!
//! A relay whose teardown overruns the bound is aborted, which drops its
//! dedicated connection; the pool close would otherwise wait for it.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::timeout;

use crate::driver::Driver;
use crate::error::{DbError, DbResult};
use crate::registry::{ActiveListener, ListenerId, ListenerRegistry};
use crate::relay::StopReason;

/// Outcome of one shutdown run
#[derive(Debug)]
pub struct ShutdownReport {
    /// Listeners that reached `Closed` within the bound
    pub drained: usize,
    /// Listeners whose teardown did not finish in time
    pub failed: Vec<ListenerId>,
    /// Result of closing the pool; decides the exit status
    pub close: DbResult<()>,
}

impl ShutdownReport {
    pub fn is_success(&self) -> bool {
        self.close.is_ok()
    }
}

pub struct ShutdownCoordinator {
    registry: Arc<ListenerRegistry>,
    driver: Arc<dyn Driver>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    /// `timeout` bounds each listener's teardown and, separately, the pool close.
    pub fn new(registry: Arc<ListenerRegistry>, driver: Arc<dyn Driver>, timeout: Duration) -> Self {
        Self {
            registry,
            driver,
            timeout,
        }
    }

    /// Stop accepting subscriptions, drive every active listener through
    /// Draining (continuing past individual failures), then close the pool.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.registry.close();

        let listeners = self.registry.snapshot();
        tracing::info!(active = listeners.len(), "draining listeners");

        let outcomes = join_all(listeners.into_iter().map(|l| self.drain(l))).await;

        let mut drained = 0;
        let mut failed = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(()) => drained += 1,
                Err(id) => failed.push(id),
            }
        }

        if !failed.is_empty() {
            tracing::warn!(failed = failed.len(), "some listeners did not drain cleanly");
        }

        let close = match timeout(self.timeout, self.driver.close()).await {
            Ok(result) => result,
            Err(_) => Err(DbError::CloseTimedOut(self.timeout)),
        };
        match &close {
            Ok(()) => tracing::info!(drained, "shutdown complete"),
            Err(e) => tracing::error!(error = %e, "error closing database pool"),
        }

        ShutdownReport {
            drained,
            failed,
            close,
        }
    }

    async fn drain(&self, listener: ActiveListener) -> Result<(), ListenerId> {
        // Losing the race means another trigger is already draining it.
        listener.handle.stop(StopReason::Shutdown);

        match timeout(self.timeout, listener.handle.closed()).await {
            Ok(()) => {
                tracing::debug!(listener_id = %listener.id, "listener drained");
                Ok(())
            }
            Err(_) => {
                tracing::warn!(
                    listener_id = %listener.id,
                    channel = %listener.channel,
                    timeout = ?self.timeout,
                    "listener teardown timed out, aborting"
                );
                listener.handle.abort();
                if timeout(self.timeout, listener.handle.closed()).await.is_err() {
                    self.registry.unregister(&listener.id);
                }
                Err(listener.id)
            }
        }
    }
}
