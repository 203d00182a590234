//! In-memory driver for relay and shutdown tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use crate::driver::{Driver, ListenSession, RawNotification};
use crate::error::{DbError, DbResult};
use crate::relay::ChannelName;

#[derive(Default)]
pub struct Counters {
    pub dedicated: AtomicUsize,
    pub listens: AtomicUsize,
    pub unlistens: AtomicUsize,
    pub releases: AtomicUsize,
    pub closes: AtomicUsize,
    /// Sessions handed out and not yet dropped
    pub outstanding: AtomicUsize,
    returned: Notify,
}

pub fn count(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}

/// Scripted behaviour of the next session handed out.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionBehaviour {
    pub fail_listen: bool,
    pub fail_unlisten: bool,
    /// `release` never completes
    pub hang_release: bool,
}

type Feed = mpsc::UnboundedSender<DbResult<RawNotification>>;

#[derive(Default)]
pub struct FakeDriver {
    pub counters: Arc<Counters>,
    scripts: Mutex<VecDeque<SessionBehaviour>>,
    feeds: Mutex<Vec<Feed>>,
    refuse: AtomicBool,
    hang_close: AtomicBool,
}

impl FakeDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, behaviour: SessionBehaviour) {
        self.scripts.lock().unwrap().push_back(behaviour);
    }

    pub fn refuse_connections(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }

    pub fn hang_close(&self) {
        self.hang_close.store(true, Ordering::SeqCst);
    }

    /// Deliver a notification on the `session`-th session handed out.
    pub fn notify(&self, session: usize, channel: &str, payload: &str) {
        let feeds = self.feeds.lock().unwrap();
        let _ = feeds[session].send(Ok(RawNotification {
            channel: channel.to_owned(),
            payload: payload.to_owned(),
            process_id: 1234,
        }));
    }

    pub fn fail_stream(&self, session: usize, err: DbError) {
        let feeds = self.feeds.lock().unwrap();
        let _ = feeds[session].send(Err(err));
    }
}

#[async_trait]
impl Driver for FakeDriver {
    async fn dedicated(&self) -> DbResult<Box<dyn ListenSession>> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(DbError::Connection("connection refused".into()));
        }
        self.counters.dedicated.fetch_add(1, Ordering::SeqCst);
        self.counters.outstanding.fetch_add(1, Ordering::SeqCst);

        let behaviour = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds.lock().unwrap().push(tx);

        Ok(Box::new(FakeSession {
            behaviour,
            counters: Arc::clone(&self.counters),
            feed: rx,
        }))
    }

    /// Like a real pool, waits for every checked-out session to come back.
    async fn close(&self) -> DbResult<()> {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        if self.hang_close.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        loop {
            let returned = self.counters.returned.notified();
            if count(&self.counters.outstanding) == 0 {
                return Ok(());
            }
            returned.await;
        }
    }
}

struct FakeSession {
    behaviour: SessionBehaviour,
    counters: Arc<Counters>,
    feed: mpsc::UnboundedReceiver<DbResult<RawNotification>>,
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        self.counters.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.counters.returned.notify_waiters();
    }
}

#[async_trait]
impl ListenSession for FakeSession {
    async fn listen(&mut self, channel: &ChannelName) -> DbResult<()> {
        self.counters.listens.fetch_add(1, Ordering::SeqCst);
        if self.behaviour.fail_listen {
            return Err(DbError::Query {
                message: format!("cannot listen on {channel}"),
                code: Some("XX000".into()),
            });
        }
        Ok(())
    }

    async fn unlisten(&mut self, channel: &ChannelName) -> DbResult<()> {
        self.counters.unlistens.fetch_add(1, Ordering::SeqCst);
        if self.behaviour.fail_unlisten {
            return Err(DbError::Query {
                message: format!("cannot unlisten {channel}"),
                code: None,
            });
        }
        Ok(())
    }

    async fn recv(&mut self) -> DbResult<RawNotification> {
        match self.feed.recv().await {
            Some(next) => next,
            // Every sender is held by the driver, which outlives the session.
            None => std::future::pending().await,
        }
    }

    async fn release(self: Box<Self>) -> DbResult<()> {
        if self.behaviour.hang_release {
            std::future::pending::<()>().await;
        }
        self.counters.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
