//! Database connection pool management
//!
//! Wraps a sqlx `PgPool` configured from [`PoolConfig`]: bounded by
//! `{min, max}`, idle connections recycled after `idle_timeout`, and every
//! idle connection pinged before it is handed out so a connection that broke
//! while idle is evicted instead of returned.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgListener, PgPoolOptions};
use sqlx::{Executor, PgPool, Postgres};

use crate::config::{DatabaseConfig, PoolConfig};
use crate::driver::{Driver, ListenSession, RawNotification};
use crate::error::{DbError, DbResult};
use crate::relay::ChannelName;

/// A live database session checked out of the pool.
pub type PooledConnection = PoolConnection<Postgres>;

/// Point-in-time view of the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Open connections, idle or checked out
    pub size: u32,
    pub idle: usize,
    pub closed: bool,
}

/// Bounded set of reusable database connections.
pub struct ConnectionPool {
    inner: PgPool,
    closed: AtomicBool,
}

impl ConnectionPool {
    fn options(config: &PoolConfig) -> PgPoolOptions {
        PgPoolOptions::new()
            .min_connections(config.min)
            .max_connections(config.max)
            .idle_timeout(Some(config.idle_timeout))
            .acquire_timeout(config.acquire_timeout)
            .test_before_acquire(true)
            .after_connect(|_conn, _meta| {
                Box::pin(async move {
                    tracing::debug!("new client connected to database");
                    Ok(())
                })
            })
    }

    /// Create the pool and open the first connection.
    pub async fn connect(config: &DatabaseConfig) -> DbResult<Self> {
        let inner = Self::options(&config.pool)
            .connect_with(config.connect_options())
            .await?;
        tracing::info!(
            host = %config.host,
            database = %config.database,
            max = config.pool.max,
            "database pool initialized"
        );
        Ok(Self::from_pool(inner))
    }

    /// Create the pool without connecting; connections open on first use.
    pub fn connect_lazy(config: &DatabaseConfig) -> Self {
        let inner = Self::options(&config.pool).connect_lazy_with(config.connect_options());
        Self::from_pool(inner)
    }

    /// Wrap an already configured sqlx pool.
    pub fn from_pool(inner: PgPool) -> Self {
        Self {
            inner,
            closed: AtomicBool::new(false),
        }
    }

    /// Check a connection out of the pool.
    ///
    /// Waits up to the configured acquire timeout when every slot is in use,
    /// then fails with [`DbError::PoolExhausted`].
    pub async fn acquire(&self) -> DbResult<PooledConnection> {
        if self.is_closed() {
            return Err(DbError::PoolClosed);
        }
        Ok(self.inner.acquire().await?)
    }

    /// Return a connection to the free list.
    pub fn release(&self, conn: PooledConnection) {
        drop(conn);
    }

    /// Destroy a connection instead of returning it; the pool opens a
    /// replacement on demand.
    pub async fn discard(&self, conn: PooledConnection) {
        if let Err(e) = conn.close().await {
            tracing::debug!(error = %e, "error while closing discarded connection");
        }
        tracing::info!("client removed from pool");
    }

    /// Trivial round-trip probe. Never fails; returns `false` instead.
    pub async fn health_check(&self) -> bool {
        match sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.inner)
            .await
        {
            Ok(one) => one == 1,
            Err(e) => {
                tracing::error!(error = %e, "database health check failed");
                false
            }
        }
    }

    /// Drain and terminate every connection. Idempotent.
    ///
    /// Waits for checked-out connections to come back before finishing.
    pub async fn close(&self) {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        if first {
            let status = self.status();
            tracing::info!(size = status.size, idle = status.idle, "closing database pool");
        }
        self.inner.close().await;
        if first {
            tracing::info!("database pool closed successfully");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.inner.is_closed()
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            size: self.inner.size(),
            idle: self.inner.num_idle(),
            closed: self.is_closed(),
        }
    }

    pub fn as_pg_pool(&self) -> &PgPool {
        &self.inner
    }
}

#[async_trait]
impl Driver for ConnectionPool {
    async fn dedicated(&self) -> DbResult<Box<dyn ListenSession>> {
        if self.is_closed() {
            return Err(DbError::PoolClosed);
        }
        let listener = PgListener::connect_with(&self.inner).await?;
        Ok(Box::new(PgListenSession { listener }))
    }

    async fn close(&self) -> DbResult<()> {
        ConnectionPool::close(self).await;
        Ok(())
    }
}

/// Dedicated session backed by a pooled connection inside a `PgListener`.
///
/// The listener keeps the connection checked out of the pool until the
/// session is released.
struct PgListenSession {
    listener: PgListener,
}

#[async_trait]
impl ListenSession for PgListenSession {
    async fn listen(&mut self, channel: &ChannelName) -> DbResult<()> {
        // Unquoted on purpose: the server folds the identifier like NOTIFY does.
        let sql = format!("LISTEN {channel}");
        (&mut self.listener).execute(sql.as_str()).await?;
        Ok(())
    }

    async fn unlisten(&mut self, channel: &ChannelName) -> DbResult<()> {
        let sql = format!("UNLISTEN {channel}");
        (&mut self.listener).execute(sql.as_str()).await?;
        Ok(())
    }

    async fn recv(&mut self) -> DbResult<RawNotification> {
        match self.listener.try_recv().await? {
            Some(notification) => Ok(RawNotification {
                channel: notification.channel().to_owned(),
                payload: notification.payload().to_owned(),
                process_id: notification.process_id(),
            }),
            None => Err(DbError::ConnectionLost),
        }
    }

    async fn release(self: Box<Self>) -> DbResult<()> {
        // Dropping the listener hands its connection back to the pool.
        drop(self);
        Ok(())
    }
}
