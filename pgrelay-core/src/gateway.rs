//! The two gateway operations over one shared pool and registry.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::{GatewayConfig, RelayConfig};
use crate::error::{DbResult, Result};
use crate::executor::{QueryExecutor, QueryRequest, QueryResult};
use crate::pool::{ConnectionPool, PoolStatus};
use crate::registry::{ListenerId, ListenerRegistry};
use crate::relay::{self, NotificationEvent, StopReason, Subscription};
use crate::shutdown::{ShutdownCoordinator, ShutdownReport};

/// Shared state behind the RPC surface
pub struct Gateway {
    pool: Arc<ConnectionPool>,
    registry: Arc<ListenerRegistry>,
    executor: QueryExecutor,
    relay: RelayConfig,
    shutdown_timeout: Duration,
}

impl Gateway {
    pub fn new(pool: Arc<ConnectionPool>, config: &GatewayConfig) -> Self {
        Self {
            executor: QueryExecutor::new(Arc::clone(&pool)),
            pool,
            registry: Arc::new(ListenerRegistry::new()),
            relay: config.relay,
            shutdown_timeout: config.shutdown_timeout,
        }
    }

    /// Open the pool described by `config` and build the gateway on it.
    pub async fn connect(config: &GatewayConfig) -> DbResult<Self> {
        let pool = ConnectionPool::connect(&config.database).await?;
        Ok(Self::new(Arc::new(pool), config))
    }

    pub async fn execute_query(&self, request: &QueryRequest) -> Result<QueryResult> {
        self.executor.execute(request).await
    }

    /// Subscribe to `channel`. Events arrive on the returned receiver, which
    /// yields `None` once the relay is closed; dropping it cancels the
    /// subscription.
    pub async fn listen(
        &self,
        channel: &str,
    ) -> Result<(Subscription, mpsc::Receiver<NotificationEvent>)> {
        let (tx, rx) = mpsc::channel(self.relay.outbound_buffer.max(1));
        let subscription =
            relay::start(self.pool.as_ref(), &self.registry, channel, tx, self.relay).await?;
        Ok((subscription, rx))
    }

    /// End a subscription by id and wait for its teardown.
    ///
    /// Returns `false` for unknown (or already finished) listeners.
    pub async fn unsubscribe(&self, id: &ListenerId) -> bool {
        let Some(listener) = self.registry.get(id) else {
            return false;
        };
        listener.handle.stop(StopReason::Unsubscribed);
        listener.handle.closed().await;
        true
    }

    pub async fn health_check(&self) -> bool {
        self.pool.health_check().await
    }

    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.registry
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    pub fn shutdown_coordinator(&self) -> ShutdownCoordinator {
        ShutdownCoordinator::new(
            Arc::clone(&self.registry),
            self.pool.clone(),
            self.shutdown_timeout,
        )
    }

    /// Drain every subscription, then close the pool.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.shutdown_coordinator().shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatabaseConfig, PoolConfig};
    use crate::error::GatewayError;

    fn offline_gateway() -> Gateway {
        let config = GatewayConfig {
            database: DatabaseConfig {
                host: "127.0.0.1".into(),
                user: "nobody".into(),
                password: String::new(),
                database: "nothing".into(),
                port: 1,
                pool: PoolConfig {
                    min: 0,
                    max: 1,
                    idle_timeout: Duration::from_secs(30),
                    acquire_timeout: Duration::from_millis(300),
                },
            },
            port: 0,
            relay: RelayConfig::default(),
            shutdown_timeout: Duration::from_secs(1),
        };
        let pool = Arc::new(ConnectionPool::connect_lazy(&config.database));
        Gateway::new(pool, &config)
    }

    #[tokio::test]
    async fn malformed_channel_touches_no_connection() {
        let gateway = offline_gateway();

        let err = gateway.listen("bad;name").await.unwrap_err();

        assert!(matches!(err, GatewayError::Validation(_)));
        assert_eq!(gateway.pool_status().size, 0);
        assert!(gateway.registry().is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_unknown_listener_is_false() {
        let gateway = offline_gateway();
        assert!(!gateway.unsubscribe(&ListenerId::from("orders_1")).await);
    }

    #[tokio::test]
    async fn shutdown_without_listeners_closes_pool() {
        let gateway = offline_gateway();

        let report = gateway.shutdown().await;

        assert!(report.is_success());
        assert_eq!(report.drained, 0);
        assert!(gateway.pool_status().closed);
        assert!(!gateway.health_check().await);
    }

    // Integration tests require a real database
    // Run with: DB_HOST=... DB_USER=... DB_NAME=... cargo test -p pgrelay-core -- --ignored

    #[tokio::test]
    #[ignore = "requires database"]
    async fn published_notification_reaches_subscriber_and_cancel_cleans_up() {
        let config = GatewayConfig::from_env().expect("DB_* settings required");
        let gateway = Gateway::connect(&config).await.expect("connect failed");

        let (sub, mut rx) = gateway.listen("orders").await.expect("listen failed");
        gateway
            .execute_query(&QueryRequest::new(
                "SELECT pg_notify('orders', $1)",
                vec![r#""{\"id\":1}""#.into()],
            ))
            .await
            .expect("notify failed");

        let event = rx.recv().await.expect("notification");
        assert_eq!(event.channel_name, "orders");
        assert_eq!(event.data, r#""{\"id\":1}""#);

        drop(rx);
        sub.handle.closed().await;
        assert!(!gateway.registry().contains(&sub.listener_id));

        assert!(gateway.shutdown().await.is_success());
    }

    #[tokio::test]
    #[ignore = "requires database"]
    async fn explicit_unsubscribe_ends_the_stream() {
        let config = GatewayConfig::from_env().expect("DB_* settings required");
        let gateway = Gateway::connect(&config).await.expect("connect failed");

        let (sub, mut rx) = gateway.listen("orders").await.expect("listen failed");
        assert!(gateway.unsubscribe(&sub.listener_id).await);
        assert!(rx.recv().await.is_none());
        assert!(!gateway.unsubscribe(&sub.listener_id).await);

        gateway.shutdown().await;
    }
}
