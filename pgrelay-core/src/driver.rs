//! Seam between the relay and the database driver
//!
//! The relay only ever talks to a [`Driver`] (which hands out dedicated
//! sessions and closes the pool at shutdown) and to the [`ListenSession`] it
//! got back. `ConnectionPool` implements both on top of sqlx.

use async_trait::async_trait;

use crate::error::DbResult;
use crate::relay::ChannelName;

/// A notification as observed by the driver, before the relay stamps it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawNotification {
    pub channel: String,
    pub payload: String,
    pub process_id: u32,
}

/// A connection withdrawn from general query service for one subscription.
#[async_trait]
pub trait ListenSession: Send + 'static {
    /// Issue `LISTEN <channel>`.
    async fn listen(&mut self, channel: &ChannelName) -> DbResult<()>;

    /// Issue `UNLISTEN <channel>`.
    async fn unlisten(&mut self, channel: &ChannelName) -> DbResult<()>;

    /// Wait for the next notification. Cancel-safe: dropping the future
    /// loses no notification.
    ///
    /// A dropped connection is reported as `DbError::ConnectionLost`.
    async fn recv(&mut self) -> DbResult<RawNotification>;

    /// Hand the connection back to the pool (or destroy it).
    async fn release(self: Box<Self>) -> DbResult<()>;
}

/// Source of dedicated sessions, and owner of the pool lifecycle.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// Check a dedicated connection out of the pool.
    async fn dedicated(&self) -> DbResult<Box<dyn ListenSession>>;

    /// Drain and terminate every pooled connection. Idempotent.
    async fn close(&self) -> DbResult<()>;
}
