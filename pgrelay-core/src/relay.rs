//! Per-subscription notification relay
//!
//! One relay binds one channel subscription to one dedicated connection and
//! one outbound stream:
//!
//! ```text
//! Initializing ──LISTEN + register──▶ Listening ──first trigger──▶ Draining ──▶ Closed
//! ```
//!
//! The driver side runs in a pump task that pushes notifications into a
//! bounded channel; the forwarding loop consumes it and writes to the
//! outbound stream. Four independent triggers end a subscription (client
//! cancellation, stream error, explicit unsubscribe, shutdown). Only the one
//! that wins the `Listening → Draining` compare-and-set counts, and teardown
//! runs exactly once, on the forwarding task, after its loop exits.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::{SecondsFormat, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::RelayConfig;
use crate::driver::{Driver, ListenSession, RawNotification};
use crate::error::{CleanupError, DbResult, Result, ValidationError};
use crate::registry::{ListenerId, ListenerRegistry};

/// Identifier grammar for channel names. LISTEN is built by interpolation,
/// so nothing outside this grammar may reach it.
static CHANNEL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("invalid channel regex"));

/// Validated channel name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelName(String);

impl ChannelName {
    /// Validate a channel name against the identifier grammar.
    ///
    /// # Example
    /// ```
    /// use pgrelay_core::relay::ChannelName;
    ///
    /// assert!(ChannelName::parse("orders").is_ok());
    /// assert!(ChannelName::parse("_private").is_ok());
    /// assert!(ChannelName::parse("bad;name").is_err());
    /// assert!(ChannelName::parse("1leading").is_err());
    /// ```
    pub fn parse(raw: &str) -> std::result::Result<Self, ValidationError> {
        if raw.is_empty() {
            return Err(ValidationError::Empty {
                field: "channel name",
            });
        }
        if !CHANNEL_RE.is_match(raw) {
            return Err(ValidationError::InvalidFormat {
                field: "channel name",
                value: raw.to_owned(),
            });
        }
        Ok(Self(raw.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ChannelName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Event written to the outbound stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    pub channel_name: String,
    /// JSON text: the payload as a JSON string, or a JSON object describing
    /// the notification when the payload is empty
    pub data: String,
    /// RFC 3339, UTC, millisecond precision
    pub timestamp: String,
}

impl NotificationEvent {
    /// Stamp a driver notification for delivery.
    ///
    /// `data` is always valid JSON. A payload of `{"id":1}` arrives as the
    /// string `"{\"id\":1}"`; clients decode twice for structured payloads.
    pub fn from_raw(channel: &ChannelName, raw: RawNotification) -> Self {
        let data = if raw.payload.is_empty() {
            serde_json::json!({
                "channel": raw.channel,
                "payload": raw.payload,
                "processId": raw.process_id,
            })
        } else {
            serde_json::Value::String(raw.payload)
        };

        Self {
            channel_name: channel.to_string(),
            data: data.to_string(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelayState {
    Initializing = 0,
    Listening = 1,
    Draining = 2,
    Closed = 3,
}

impl RelayState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Initializing,
            1 => Self::Listening,
            2 => Self::Draining,
            _ => Self::Closed,
        }
    }
}

/// Why a relay left `Listening`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The client dropped the outbound stream
    Cancelled,
    /// The driver reported an error or the connection dropped
    StreamError,
    /// Explicit unsubscribe by listener id
    Unsubscribed,
    /// Process shutdown
    Shutdown,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::Cancelled => "client cancelled",
            Self::StreamError => "stream error",
            Self::Unsubscribed => "unsubscribed",
            Self::Shutdown => "shutdown",
        };
        f.write_str(reason)
    }
}

struct Control {
    state: AtomicU8,
    reason: OnceLock<StopReason>,
    stop: CancellationToken,
    abort: CancellationToken,
    closed: CancellationToken,
}

/// Shared control block of one relay
#[derive(Clone)]
pub struct RelayHandle {
    inner: Arc<Control>,
}

impl RelayHandle {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Control {
                state: AtomicU8::new(RelayState::Initializing as u8),
                reason: OnceLock::new(),
                stop: CancellationToken::new(),
                abort: CancellationToken::new(),
                closed: CancellationToken::new(),
            }),
        }
    }

    pub fn state(&self) -> RelayState {
        RelayState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// The trigger that won the transition into `Draining`, if any.
    pub fn stop_reason(&self) -> Option<StopReason> {
        self.inner.reason.get().copied()
    }

    /// Move `Listening → Draining`.
    ///
    /// Returns `true` only for the first trigger; every later (or
    /// concurrent) call is a no-op returning `false`.
    pub fn stop(&self, reason: StopReason) -> bool {
        if !self.transition(RelayState::Listening, RelayState::Draining) {
            return false;
        }
        let _ = self.inner.reason.set(reason);
        self.inner.stop.cancel();
        true
    }

    /// Give up on a teardown that is stuck in `Draining`.
    ///
    /// The dedicated connection is dropped instead of released, which hands
    /// it back to the pool without waiting on the server; the relay is then
    /// unregistered and `Closed`. No effect before `Draining` or after `Closed`.
    pub fn abort(&self) {
        if self.state() == RelayState::Draining {
            self.inner.abort.cancel();
        }
    }

    /// Resolves once the relay reached `Closed`.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    fn transition(&self, from: RelayState, to: RelayState) -> bool {
        self.inner
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn finish(&self) {
        self.inner
            .state
            .store(RelayState::Closed as u8, Ordering::Release);
        self.inner.closed.cancel();
    }
}

impl fmt::Debug for RelayHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayHandle")
            .field("state", &self.state())
            .field("stop_reason", &self.stop_reason())
            .finish()
    }
}

/// A live subscription, as returned to the caller
#[derive(Debug, Clone)]
pub struct Subscription {
    pub listener_id: ListenerId,
    pub channel: ChannelName,
    pub handle: RelayHandle,
}

/// Run `Initializing → Listening` and spawn the relay.
///
/// The channel name is validated before any connection is touched. On any
/// failure after the dedicated connection was checked out, it is released
/// before the error is returned. Events are written to `outbound` until the
/// relay closes, at which point the sender is dropped and the stream ends.
pub async fn start(
    driver: &dyn Driver,
    registry: &Arc<ListenerRegistry>,
    channel: &str,
    outbound: mpsc::Sender<NotificationEvent>,
    config: RelayConfig,
) -> Result<Subscription> {
    let channel = ChannelName::parse(channel)?;
    let handle = RelayHandle::new();

    let mut session = driver.dedicated().await?;

    if let Err(e) = session.listen(&channel).await {
        tracing::error!(channel = %channel, error = %e, "channel listen error");
        release_after_failed_start(session, &channel).await;
        return Err(e.into());
    }

    handle.transition(RelayState::Initializing, RelayState::Listening);

    let listener_id = match registry.register(&channel, handle.clone()) {
        Ok(id) => id,
        Err(e) => {
            tracing::warn!(channel = %channel, error = %e, "listener registration refused");
            if let Err(source) = session.unlisten(&channel).await {
                let err = CleanupError::Unlisten {
                    channel: channel.to_string(),
                    source,
                };
                tracing::warn!(error = %err, "cleanup error");
            }
            release_after_failed_start(session, &channel).await;
            handle.finish();
            return Err(e.into());
        }
    };

    let (events_tx, events_rx) = mpsc::channel(config.event_buffer.max(1));
    let (detach_tx, detach_rx) = oneshot::channel();
    let pump = tokio::spawn(pump(session, events_tx, detach_rx));

    tracing::info!(listener_id = %listener_id, channel = %channel, "relay listening");

    let relay = RunningRelay {
        listener_id: listener_id.clone(),
        channel: channel.clone(),
        handle: handle.clone(),
        registry: Arc::clone(registry),
        pump,
        detach: detach_tx,
    };
    tokio::spawn(relay.run(events_rx, outbound));

    Ok(Subscription {
        listener_id,
        channel,
        handle,
    })
}

async fn release_after_failed_start(session: Box<dyn ListenSession>, channel: &ChannelName) {
    if let Err(e) = session.release().await {
        tracing::warn!(channel = %channel, error = %e, "failed to release connection after failed listen");
    }
}

/// Driver side: read notifications off the dedicated session and push them
/// into the relay's bounded channel until detached. Hands the session back.
async fn pump(
    mut session: Box<dyn ListenSession>,
    events: mpsc::Sender<DbResult<RawNotification>>,
    mut detach: oneshot::Receiver<()>,
) -> Box<dyn ListenSession> {
    loop {
        let received = tokio::select! {
            biased;
            _ = &mut detach => return session,
            received = session.recv() => received,
        };
        let failed = received.is_err();

        tokio::select! {
            biased;
            _ = &mut detach => return session,
            sent = events.send(received) => {
                if sent.is_err() || failed {
                    return session;
                }
            }
        }
    }
}

struct RunningRelay {
    listener_id: ListenerId,
    channel: ChannelName,
    handle: RelayHandle,
    registry: Arc<ListenerRegistry>,
    pump: JoinHandle<Box<dyn ListenSession>>,
    detach: oneshot::Sender<()>,
}

impl RunningRelay {
    async fn run(
        self,
        mut events: mpsc::Receiver<DbResult<RawNotification>>,
        outbound: mpsc::Sender<NotificationEvent>,
    ) {
        let stop = self.handle.inner.stop.clone();

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = outbound.closed() => {
                    self.trigger(StopReason::Cancelled);
                    break;
                }
                received = events.recv() => match received {
                    Some(Ok(raw)) => self.forward(&outbound, raw),
                    Some(Err(e)) => {
                        tracing::error!(listener_id = %self.listener_id, error = %e, "stream error");
                        self.trigger(StopReason::StreamError);
                        break;
                    }
                    None => {
                        self.trigger(StopReason::StreamError);
                        break;
                    }
                },
            }
        }

        tracing::info!(
            listener_id = %self.listener_id,
            channel = %self.channel,
            reason = %self.handle.stop_reason().unwrap_or(StopReason::StreamError),
            "relay draining"
        );

        drop(events);

        let abort = self.handle.inner.abort.clone();
        let pump = self.pump.abort_handle();
        let handle = self.handle.clone();
        let registry = Arc::clone(&self.registry);
        let listener_id = self.listener_id.clone();

        tokio::select! {
            _ = self.drain() => {}
            _ = abort.cancelled() => {
                // Dropping the drain future (or the pump) drops the session.
                pump.abort();
                registry.unregister(&listener_id);
                handle.finish();
                tracing::warn!(listener_id = %listener_id, "relay teardown aborted, connection dropped");
            }
        }
        // The outbound stream ends only once the relay is Closed.
        drop(outbound);
    }

    fn trigger(&self, reason: StopReason) {
        if !self.handle.stop(reason) {
            tracing::debug!(listener_id = %self.listener_id, reason = %reason, "relay already draining");
        }
    }

    /// Best-effort write. A full outbound buffer drops the event; a closed
    /// one is client cancellation.
    fn forward(&self, outbound: &mpsc::Sender<NotificationEvent>, raw: RawNotification) {
        if self.handle.state() != RelayState::Listening {
            return;
        }

        let event = NotificationEvent::from_raw(&self.channel, raw);
        match outbound.try_send(event) {
            Ok(()) => {
                tracing::debug!(listener_id = %self.listener_id, "notification forwarded");
            }
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    listener_id = %self.listener_id,
                    channel = %self.channel,
                    "outbound buffer full, notification dropped"
                );
            }
            Err(TrySendError::Closed(_)) => self.trigger(StopReason::Cancelled),
        }
    }

    /// Draining: detach the pump (taking the connection back), UNLISTEN,
    /// release, unregister. Every step is best-effort.
    async fn drain(self) {
        let RunningRelay {
            listener_id,
            channel,
            handle,
            registry,
            pump,
            detach,
        } = self;

        let _ = detach.send(());
        let session = match pump.await {
            Ok(session) => Some(session),
            Err(e) => {
                let err = CleanupError::Detach {
                    listener_id: listener_id.to_string(),
                    reason: e.to_string(),
                };
                tracing::warn!(error = %err, "cleanup error");
                None
            }
        };

        if let Some(mut session) = session {
            if let Err(source) = session.unlisten(&channel).await {
                let err = CleanupError::Unlisten {
                    channel: channel.to_string(),
                    source,
                };
                tracing::warn!(listener_id = %listener_id, error = %err, "cleanup error");
            }

            if let Err(source) = session.release().await {
                let err = CleanupError::Release {
                    listener_id: listener_id.to_string(),
                    source,
                };
                tracing::warn!(error = %err, "cleanup error");
            }
        }

        registry.unregister(&listener_id);
        handle.finish();
        tracing::info!(listener_id = %listener_id, channel = %channel, "relay closed");
    }
}
