//! Live transaction feed: one pubsub connection subscribed to every active wallet.
//!
//! The [`ConnectionManager`] owns the socket, the subscription bookkeeping and
//! the reconnect schedule. Everything else sees it through a
//! [`ConnectionHandle`] (state + shutdown) and the bounded notification queue.

pub mod backoff;
pub mod protocol;
pub mod transport;

use crate::config::FeedConfig;
use crate::registry::WalletSnapshot;
use backoff::ReconnectBackoff;
use protocol::FeedMessage;
pub use protocol::LogNotification;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
pub use transport::{FeedConnection, FeedTransport, WsTransport};
use transport::{Frame, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribing,
    Active,
    Reconnecting,
    Shutdown,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Subscribing => "SUBSCRIBING",
            Self::Active => "ACTIVE",
            Self::Reconnecting => "RECONNECTING",
            Self::Shutdown => "SHUTDOWN",
        }
    }

    fn gauge_value(self) -> f64 {
        match self {
            Self::Disconnected => 0.0,
            Self::Connecting => 1.0,
            Self::Subscribing => 2.0,
            Self::Active => 3.0,
            Self::Reconnecting => 4.0,
            Self::Shutdown => 5.0,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("gave up after {attempts} consecutive reconnect attempts")]
    ReconnectsExhausted { attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct FeedSettings {
    pub commitment: String,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub max_reconnect_attempts: Option<u32>,
    pub subscribe_timeout: Duration,
    pub connect_timeout: Duration,
    pub ping_interval: Duration,
    /// A session that receives no frame at all for this long is treated as lost.
    pub idle_timeout: Duration,
}

impl From<&FeedConfig> for FeedSettings {
    fn from(config: &FeedConfig) -> Self {
        Self {
            commitment: config.commitment.clone(),
            backoff_initial: Duration::from_millis(config.backoff_initial_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
            max_reconnect_attempts: config.max_reconnect_attempts,
            subscribe_timeout: config.subscribe_timeout(),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            ping_interval: Duration::from_secs(config.ping_interval_secs),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
        }
    }
}

/// Observer and shutdown switch for a running manager.
#[derive(Clone)]
pub struct ConnectionHandle {
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Close the connection and stop reconnecting. Safe to call repeatedly.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

enum SessionEnd {
    Shutdown,
    Lost(String),
}

struct PendingSubscribe {
    request_id: u64,
    wallets: usize,
    deadline: Instant,
}

/// Per-connection subscription bookkeeping.
#[derive(Default)]
struct Subscriptions {
    pending: Option<PendingSubscribe>,
    live: Option<u64>,
    /// Unsubscribe request id -> subscription being retired.
    retiring: HashMap<u64, u64>,
    active: bool,
}

impl Subscriptions {
    /// Notifications keep flowing for a retiring subscription until its
    /// unsubscribe is acknowledged, so a resubscribe never opens a gap.
    fn accepts(&self, subscription: u64) -> bool {
        self.live == Some(subscription) || self.retiring.values().any(|s| *s == subscription)
    }
}

pub struct ConnectionManager<T: FeedTransport> {
    transport: T,
    settings: FeedSettings,
    wallets: watch::Receiver<Arc<WalletSnapshot>>,
    sink: mpsc::Sender<LogNotification>,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
    next_request_id: u64,
}

impl<T: FeedTransport> ConnectionManager<T> {
    pub fn new(
        transport: T,
        settings: FeedSettings,
        wallets: watch::Receiver<Arc<WalletSnapshot>>,
        sink: mpsc::Sender<LogNotification>,
    ) -> (Self, ConnectionHandle) {
        let (state, state_rx) = watch::channel(ConnectionState::Disconnected);
        let cancel = CancellationToken::new();
        let handle = ConnectionHandle {
            state: state_rx,
            cancel: cancel.clone(),
        };
        let manager = Self {
            transport,
            settings,
            wallets,
            sink,
            state,
            cancel,
            next_request_id: 1,
        };
        (manager, handle)
    }

    /// Drive the connection until shutdown. Returns an error only when the
    /// reconnect budget is exhausted.
    pub async fn run(mut self) -> Result<(), FeedError> {
        let mut backoff = ReconnectBackoff::new(
            self.settings.backoff_initial,
            self.settings.backoff_max,
            self.settings.max_reconnect_attempts,
        );
        let result = self.run_loop(&mut backoff).await;
        self.set_state(ConnectionState::Shutdown);
        info!("feed connection manager stopped");
        result
    }

    async fn run_loop(&mut self, backoff: &mut ReconnectBackoff) -> Result<(), FeedError> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            if self.wallets.borrow().active_addresses().is_empty() {
                self.set_state(ConnectionState::Disconnected);
                info!("no active wallets, waiting for the tracked set to change");
                tokio::select! {
                    () = self.cancel.cancelled() => return Ok(()),
                    changed = self.wallets.changed() => {
                        if changed.is_err() {
                            return Ok(());
                        }
                        continue;
                    }
                }
            }

            self.set_state(ConnectionState::Connecting);
            let connect_timeout = self.settings.connect_timeout;
            let connected = tokio::select! {
                () = self.cancel.cancelled() => return Ok(()),
                result = tokio::time::timeout(connect_timeout, self.transport.connect()) => {
                    result.unwrap_or(Err(TransportError::ConnectTimeout(connect_timeout)))
                }
            };
            match connected {
                Ok(conn) => match self.run_session(conn, backoff).await {
                    SessionEnd::Shutdown => return Ok(()),
                    SessionEnd::Lost(reason) => warn!(reason = %reason, "feed connection lost"),
                },
                Err(e) => warn!(error = %e, attempt = backoff.attempt() + 1, "feed connect failed"),
            }

            self.set_state(ConnectionState::Reconnecting);
            metrics::counter!("watcher_reconnects_total").increment(1);
            let Some(delay) = backoff.next_delay() else {
                error!(
                    attempts = backoff.attempt(),
                    "feed reconnect attempts exhausted"
                );
                return Err(FeedError::ReconnectsExhausted {
                    attempts: backoff.attempt(),
                });
            };
            info!(delay = ?delay, attempt = backoff.attempt(), "reconnecting feed");
            tokio::select! {
                () = self.cancel.cancelled() => return Ok(()),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn run_session(
        &mut self,
        mut conn: T::Conn,
        backoff: &mut ReconnectBackoff,
    ) -> SessionEnd {
        self.set_state(ConnectionState::Subscribing);
        let mut subs = Subscriptions::default();
        let addresses = self.wallets.borrow_and_update().active_addresses().clone();

        let end = match self.send_subscribe(&mut conn, &mut subs, &addresses).await {
            Ok(()) => self.session_loop(&mut conn, &mut subs, backoff).await,
            Err(end) => end,
        };
        conn.close().await;
        end
    }

    async fn session_loop(
        &mut self,
        conn: &mut T::Conn,
        subs: &mut Subscriptions,
        backoff: &mut ReconnectBackoff,
    ) -> SessionEnd {
        let mut ping = tokio::time::interval_at(
            Instant::now() + self.settings.ping_interval,
            self.settings.ping_interval,
        );
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut idle_deadline = Instant::now() + self.settings.idle_timeout;

        loop {
            let deadline = subs.pending.as_ref().map(|p| p.deadline);
            let follow_wallets = subs.active && subs.pending.is_none();

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return SessionEnd::Shutdown,
                () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    warn!(timeout = ?self.settings.subscribe_timeout, "subscription ack timed out");
                    return SessionEnd::Lost("subscription ack timed out".to_string());
                }
                () = tokio::time::sleep_until(idle_deadline) => {
                    warn!(timeout = ?self.settings.idle_timeout, "no frames from feed, treating connection as dead");
                    return SessionEnd::Lost("idle timeout".to_string());
                }
                _ = ping.tick() => {
                    if let Err(e) = conn.send_ping().await {
                        return SessionEnd::Lost(e.to_string());
                    }
                }
                changed = self.wallets.changed(), if follow_wallets => {
                    if changed.is_err() {
                        return SessionEnd::Shutdown;
                    }
                    if let Err(end) = self.resubscribe(conn, subs).await {
                        return end;
                    }
                }
                frame = conn.next_frame() => {
                    let text = match frame {
                        None => return SessionEnd::Lost("closed by peer".to_string()),
                        Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                        Some(Ok(frame)) => {
                            idle_deadline = Instant::now() + self.settings.idle_timeout;
                            match frame {
                                Frame::Text(text) => text,
                                Frame::Heartbeat => continue,
                            }
                        }
                    };
                    if let Err(end) = self.handle_frame(conn, subs, backoff, &text).await {
                        return end;
                    }
                }
            }
        }
    }

    async fn handle_frame(
        &mut self,
        conn: &mut T::Conn,
        subs: &mut Subscriptions,
        backoff: &mut ReconnectBackoff,
        text: &str,
    ) -> Result<(), SessionEnd> {
        match protocol::parse_message(text) {
            FeedMessage::Response { id, result } => {
                let Some(pending) = subs.pending.take_if(|p| p.request_id == id) else {
                    match subs.retiring.remove(&id) {
                        Some(old) => debug!(subscription = old, ok = result.is_ok(), "unsubscribed"),
                        None => debug!(id, "response for unknown request"),
                    }
                    return Ok(());
                };

                let subscription = match result {
                    Ok(value) => value.as_u64().ok_or_else(|| {
                        SessionEnd::Lost(format!("subscribe ack without subscription id: {value}"))
                    })?,
                    Err(e) => {
                        error!(error = %e, "subscription rejected by feed");
                        return Err(SessionEnd::Lost(format!("subscription rejected: {e}")));
                    }
                };

                if let Some(old) = subs.live.replace(subscription) {
                    self.send_unsubscribe(conn, subs, old).await?;
                }
                if !subs.active {
                    subs.active = true;
                    backoff.reset();
                    self.set_state(ConnectionState::Active);
                }
                info!(
                    subscription,
                    wallets = pending.wallets,
                    "feed subscription active"
                );
            }
            FeedMessage::Notification(notification) => self.forward(notification, subs)?,
            FeedMessage::Other => {}
        }
        Ok(())
    }

    async fn resubscribe(
        &mut self,
        conn: &mut T::Conn,
        subs: &mut Subscriptions,
    ) -> Result<(), SessionEnd> {
        let addresses = self.wallets.borrow_and_update().active_addresses().clone();
        if addresses.is_empty() {
            if let Some(old) = subs.live.take() {
                info!("active wallet set is empty, dropping subscription");
                self.send_unsubscribe(conn, subs, old).await?;
            }
            return Ok(());
        }
        info!(wallets = addresses.len(), "wallet set changed, resubscribing");
        self.send_subscribe(conn, subs, &addresses).await
    }

    async fn send_subscribe(
        &mut self,
        conn: &mut T::Conn,
        subs: &mut Subscriptions,
        addresses: &BTreeSet<String>,
    ) -> Result<(), SessionEnd> {
        let request_id = self.next_id();
        let request =
            protocol::subscribe_request(request_id, addresses, &self.settings.commitment);
        conn.send_text(request)
            .await
            .map_err(|e| SessionEnd::Lost(e.to_string()))?;
        debug!(request_id, wallets = addresses.len(), "sent logsSubscribe");
        subs.pending = Some(PendingSubscribe {
            request_id,
            wallets: addresses.len(),
            deadline: Instant::now() + self.settings.subscribe_timeout,
        });
        Ok(())
    }

    async fn send_unsubscribe(
        &mut self,
        conn: &mut T::Conn,
        subs: &mut Subscriptions,
        subscription: u64,
    ) -> Result<(), SessionEnd> {
        let request_id = self.next_id();
        conn.send_text(protocol::unsubscribe_request(request_id, subscription))
            .await
            .map_err(|e| SessionEnd::Lost(e.to_string()))?;
        subs.retiring.insert(request_id, subscription);
        Ok(())
    }

    fn forward(
        &self,
        notification: LogNotification,
        subs: &Subscriptions,
    ) -> Result<(), SessionEnd> {
        if !subs.accepts(notification.subscription) {
            debug!(
                subscription = notification.subscription,
                "notification for stale subscription"
            );
            return Ok(());
        }
        metrics::counter!("watcher_notifications_received_total").increment(1);
        if notification.failed {
            debug!(signature = %notification.signature, "skipping failed transaction");
            return Ok(());
        }

        match self.sink.try_send(notification) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(dropped)) => {
                metrics::counter!("watcher_notifications_dropped_total").increment(1);
                warn!(signature = %dropped.signature, "pipeline queue full, dropping notification");
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(SessionEnd::Shutdown),
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            metrics::gauge!("watcher_connection_state").set(next.gauge_value());
            debug!(from = previous.as_str(), to = next.as_str(), "feed state change");
        }
    }
}
