#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::sync::Arc;

use futures::Stream;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use super::config::Config;
#[cfg(feature = "tracing")]
use super::error::WsError;
use super::reconnect::ReconnectPolicy;
use super::transport::{Heartbeat, TransportEvent, TransportEvents, TransportHandle};
use crate::error::{Error, Kind};
use crate::router::{Callback, EventRouter, Subscription};
use crate::types::{CONNECTION, ConnectionEvent, ERROR, ErrorEvent, Request};
use crate::Result;

/// Connection state as seen by consumers.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum ConnectionState {
    /// No channel attached, no attempt pending
    Disconnected,
    /// Opening a transport, or waiting out a reconnect delay
    Connecting,
    /// Transport open
    Open,
    /// `disconnect()` was called on an open transport and its close is in flight
    Closing,
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Open)
    }
}

/// Snapshot of the manager's session, published through a watch channel.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub state: ConnectionState,
    /// Channel the current session is attached to
    pub channel: Option<String>,
    /// Reconnect attempts scheduled since the last successful open. Left as is by
    /// `disconnect()`, reset by the next `connect()`.
    pub reconnect_attempts: u32,
    /// Advanced by every `connect`/`disconnect`. Work scheduled under an older epoch is void.
    epoch: u64,
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            channel: None,
            reconnect_attempts: 0,
            epoch: 0,
        }
    }
}

#[derive(Debug)]
enum Command {
    Connect { epoch: u64, channel: String },
    Disconnect { epoch: u64 },
    Send(String),
}

/// The single entry point consumers use to reach the event server.
///
/// A manager owns at most one transport, attached to one channel, plus the reconnection
/// policy and the event router. All lifecycle handling and every subscriber callback run on
/// one background task; the methods here only post work to it and return immediately.
///
/// Construct one per application and hand clones to the components that need it.
///
/// # Example
///
/// ```rust, no_run
/// use vision_realtime::ws::ConnectionManager;
/// use vision_realtime::ws::config::Config;
///
/// # async fn example() -> vision_realtime::Result<()> {
/// let manager = ConnectionManager::new(Config::from_env())?;
///
/// let detections = manager.on("detection_result", |payload| {
///     println!("detections: {}", payload["detections"]);
/// });
///
/// manager.connect("detections");
/// // ...
/// detections.unsubscribe();
/// manager.disconnect();
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    router: Arc<EventRouter>,
    status: watch::Sender<ConnectionInfo>,
    commands: mpsc::UnboundedSender<Command>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("info", &*self.inner.status.borrow())
            .field("router", &self.inner.router)
            .finish()
    }
}

impl ConnectionManager {
    /// Create a manager and start its event loop on the current tokio runtime.
    ///
    /// Nothing is connected until [`ConnectionManager::connect`] is called.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::with_source(Kind::Internal, e))?;

        let heartbeat = match config.heartbeat_interval {
            Some(interval) if !interval.is_zero() => Some(Heartbeat {
                interval,
                payload: serde_json::to_string(&Request::Ping)?,
            }),
            _ => None,
        };

        let router = EventRouter::new();
        let (status, _) = watch::channel(ConnectionInfo::default());
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();

        let event_loop = EventLoop {
            policy: ReconnectPolicy::new(&config.reconnect),
            config,
            heartbeat,
            router: Arc::clone(&router),
            status: status.clone(),
            active: None,
            closing: None,
            pending_retry: None,
            next_transport_id: 0,
            transport_tx,
            retry_tx,
        };
        runtime.spawn(event_loop.run(commands_rx, transport_rx, retry_rx));

        Ok(Self {
            inner: Arc::new(Inner {
                router,
                status,
                commands,
            }),
        })
    }

    fn post(&self, command: Command) {
        _ = self.inner.commands.send(command).inspect_err(|e| {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %WsError::Unreachable, command = ?e.0, "Dropping command");
            #[cfg(not(feature = "tracing"))]
            let _: &mpsc::error::SendError<Command> = e;
        });
    }

    /// Attach to `channel`.
    ///
    /// A no-op when already open, or opening, on the same channel. Any other session is
    /// closed first without triggering a reconnect. Failures are reported through `error`
    /// and `connection` events, never returned.
    pub fn connect(&self, channel: &str) {
        let mut issued = None;
        self.inner.status.send_if_modified(|info| {
            if info.channel.as_deref() == Some(channel)
                && matches!(info.state, ConnectionState::Open | ConnectionState::Connecting)
            {
                return false;
            }

            info.epoch += 1;
            info.state = ConnectionState::Connecting;
            info.channel = Some(channel.to_owned());
            info.reconnect_attempts = 0;
            issued = Some(info.epoch);
            true
        });

        if let Some(epoch) = issued {
            #[cfg(feature = "tracing")]
            tracing::debug!(%channel, epoch, "Connect requested");

            self.post(Command::Connect {
                epoch,
                channel: channel.to_owned(),
            });
        }
    }

    /// Close the current session. Pending and future reconnect attempts of that session are
    /// suppressed; a later [`ConnectionManager::connect`] starts a fresh one.
    pub fn disconnect(&self) {
        let mut epoch = 0;
        self.inner.status.send_modify(|info| {
            info.epoch += 1;
            info.state = match info.state {
                ConnectionState::Open => ConnectionState::Closing,
                _ => ConnectionState::Disconnected,
            };
            info.channel = None;
            epoch = info.epoch;
        });

        #[cfg(feature = "tracing")]
        tracing::debug!(epoch, "Disconnect requested");

        self.post(Command::Disconnect { epoch });
    }

    /// Send `payload` over the open transport.
    ///
    /// Strings are sent verbatim, anything else as JSON text. When not connected the
    /// message is dropped: delivery is at most once and never buffered. The only error is a
    /// payload that fails to serialize.
    pub fn send<R: Serialize + ?Sized>(&self, payload: &R) -> Result<()> {
        let text = match serde_json::to_value(payload)? {
            Value::String(text) => text,
            other => other.to_string(),
        };
        self.send_text(text);
        Ok(())
    }

    /// Send already encoded text. Dropped when not connected.
    pub fn send_text<S: Into<String>>(&self, text: S) {
        if !self.is_connected() {
            #[cfg(feature = "tracing")]
            tracing::trace!("Not connected, dropping outbound message");
            return;
        }
        self.post(Command::Send(text.into()));
    }

    /// Ask the server for a `pong`.
    pub fn ping(&self) -> Result<()> {
        self.send(&Request::Ping)
    }

    /// Join an additional server-side channel on the current connection.
    pub fn join_channel(&self, channel: &str) -> Result<()> {
        self.send(&Request::subscribe(channel))
    }

    /// Request detection on an encoded image; the answer arrives as `detection_result`.
    pub fn detect(&self, image: &[u8]) -> Result<()> {
        self.send(&Request::detect(image))
    }

    /// Publish `payload` to an MQTT topic through the server.
    pub fn publish(&self, topic: &str, payload: Value) -> Result<()> {
        self.send(&Request::mqtt_publish(topic, payload))
    }

    /// Relay `message` to every client on the current channel.
    pub fn broadcast(&self, message: Value) -> Result<()> {
        self.send(&Request::broadcast(message))
    }

    /// Register `callback` for `event_type`. Use `"*"` for every decoded message, `"raw"`
    /// for frames that are not JSON.
    pub fn on<F>(&self, event_type: &str, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.router.subscribe(event_type, Arc::new(callback))
    }

    /// Register a shared callback, which can later be removed with [`ConnectionManager::off`].
    pub fn subscribe(&self, event_type: &str, callback: Callback) -> Subscription {
        self.inner.router.subscribe(event_type, callback)
    }

    /// Remove every registration of `callback` under `event_type`. Idempotent.
    pub fn off(&self, event_type: &str, callback: &Callback) -> usize {
        self.inner.router.unsubscribe(event_type, callback)
    }

    /// Stream of the payloads delivered for `event_type`.
    ///
    /// The registration lives as long as the stream.
    pub fn events(&self, event_type: &str) -> impl Stream<Item = Value> + use<> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = self.on(event_type, move |payload| {
            _ = tx.send(payload.clone());
        });
        let guard = SubscriptionGuard(subscription);

        async_stream::stream! {
            let _guard = guard;
            while let Some(payload) = rx.recv().await {
                yield payload;
            }
        }
    }

    /// `true` only while the transport is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.status.borrow().state.is_connected()
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.status.borrow().state
    }

    /// Channel of the current session.
    #[must_use]
    pub fn channel(&self) -> Option<String> {
        self.inner.status.borrow().channel.clone()
    }

    /// Reconnect attempts scheduled since the last successful open.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.status.borrow().reconnect_attempts
    }

    /// Subscribe to session changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionInfo> {
        self.inner.status.subscribe()
    }

    /// Number of callbacks registered for `event_type`.
    #[must_use]
    pub fn subscriber_count(&self, event_type: &str) -> usize {
        self.inner.router.subscriber_count(event_type)
    }
}

struct SubscriptionGuard(Subscription);

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.0.unsubscribe();
    }
}

/// Transport owned by the event loop, with the session epoch it was opened under.
struct Active {
    handle: TransportHandle,
    epoch: u64,
    /// Whether `connected` was announced for this transport
    announced: bool,
}

/// Owns every piece of mutable connection state. Runs as one task; transports and timers
/// only post events back into it.
struct EventLoop {
    config: Config,
    heartbeat: Option<Heartbeat>,
    router: Arc<EventRouter>,
    status: watch::Sender<ConnectionInfo>,
    policy: ReconnectPolicy,
    active: Option<Active>,
    /// Transport being shut down by `disconnect()`, with the epoch of that disconnect
    closing: Option<(u64, u64)>,
    pending_retry: Option<JoinHandle<()>>,
    next_transport_id: u64,
    transport_tx: TransportEvents,
    retry_tx: mpsc::UnboundedSender<u64>,
}

impl EventLoop {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut transport_rx: mpsc::UnboundedReceiver<(u64, TransportEvent)>,
        mut retry_rx: mpsc::UnboundedReceiver<u64>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    // Every ConnectionManager clone is gone
                    None => break,
                },

                Some((id, event)) = transport_rx.recv() => self.handle_transport(id, event),

                Some(epoch) = retry_rx.recv() => self.handle_retry(epoch),
            }
        }

        self.cancel_retry();
        if let Some(active) = self.active.take() {
            active.handle.close();
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("Connection manager dropped, event loop stopped");
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.status.borrow().epoch == epoch
    }

    /// Apply `update` only if `epoch` is still the session epoch.
    fn update_status<F>(&self, epoch: u64, update: F) -> bool
    where
        F: FnOnce(&mut ConnectionInfo),
    {
        self.status.send_if_modified(|info| {
            if info.epoch == epoch {
                update(info);
                true
            } else {
                false
            }
        })
    }

    fn announce<T: Serialize>(&self, event_type: &str, payload: &T) {
        match serde_json::to_value(payload) {
            Ok(payload) => self.router.emit(event_type, &payload),
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(%event_type, error = %e, "Unable to encode local event");
                #[cfg(not(feature = "tracing"))]
                let _: &serde_json::Error = &e;
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { epoch, channel } => self.handle_connect(epoch, &channel),
            Command::Disconnect { epoch } => self.handle_disconnect(epoch),
            Command::Send(text) => self.handle_send(text),
        }
    }

    fn handle_connect(&mut self, epoch: u64, channel: &str) {
        if !self.is_current(epoch) {
            // Superseded by a later connect or disconnect that is already queued
            return;
        }

        self.cancel_retry();
        self.policy.reset();

        if let Some(active) = &mut self.active
            && active.handle.is_attached_to(channel)
        {
            active.epoch = epoch;
            if active.announced {
                self.update_status(epoch, |info| info.state = ConnectionState::Open);
            }
            return;
        }

        self.close_active();
        self.open(epoch, channel);
    }

    /// Tear down whatever the loop holds. Everything it holds predates this command, so this
    /// runs even when a later `connect()` already moved the epoch on.
    fn handle_disconnect(&mut self, epoch: u64) {
        self.cancel_retry();
        self.policy.reset();

        let announced = self.active.as_ref().map(|active| (active.handle.id(), active.announced));
        self.close_active();

        match announced {
            Some((id, true)) => self.closing = Some((id, epoch)),
            _ => {
                self.update_status(epoch, |info| info.state = ConnectionState::Disconnected);
            }
        }
    }

    fn handle_send(&self, text: String) {
        let Some(active) = self
            .active
            .as_ref()
            .filter(|active| self.is_current(active.epoch))
        else {
            #[cfg(feature = "tracing")]
            tracing::trace!("No transport, outbound message dropped");
            return;
        };

        // Dropped by the handle unless open
        _ = active.handle.send(text);
    }

    /// Intentionally close the active transport. Its own close signal is ignored afterwards,
    /// so no reconnect follows.
    fn close_active(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(channel = %active.handle.channel(), "Closing transport intentionally");

        active.handle.close();
        if active.announced {
            self.announce(
                CONNECTION,
                &ConnectionEvent::disconnected(Some(active.handle.channel())),
            );
        }
    }

    fn open(&mut self, epoch: u64, channel: &str) {
        let url = match self.config.channel_url(channel) {
            Ok(url) => url,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(%channel, error = %e, "Cannot build channel URL");

                self.announce(ERROR, &ErrorEvent::new(e.to_string()));
                self.update_status(epoch, |info| info.state = ConnectionState::Disconnected);
                return;
            }
        };

        self.next_transport_id += 1;
        let handle = TransportHandle::open(
            self.next_transport_id,
            channel,
            url,
            self.heartbeat.clone(),
            self.transport_tx.clone(),
        );
        self.active = Some(Active {
            handle,
            epoch,
            announced: false,
        });
    }

    fn handle_transport(&mut self, id: u64, event: TransportEvent) {
        if let Some((closing_id, epoch)) = self.closing
            && closing_id == id
        {
            if matches!(event, TransportEvent::Closed) {
                self.closing = None;
                self.update_status(epoch, |info| info.state = ConnectionState::Disconnected);
            }
            return;
        }

        let Some((epoch, channel)) = self
            .active
            .as_ref()
            .filter(|active| active.handle.id() == id)
            .map(|active| (active.epoch, active.handle.channel().to_owned()))
        else {
            // Late signal from a transport that was already replaced or closed
            return;
        };

        match event {
            TransportEvent::Opened => {
                let current = self.update_status(epoch, |info| {
                    info.state = ConnectionState::Open;
                    info.reconnect_attempts = 0;
                });
                if !current {
                    return;
                }

                if let Some(active) = &mut self.active {
                    active.announced = true;
                }
                self.policy.reset();

                #[cfg(feature = "tracing")]
                tracing::debug!(%channel, "Transport open");

                self.announce(CONNECTION, &ConnectionEvent::connected(&channel));
            }
            TransportEvent::Message(text) => {
                if self.is_current(epoch) {
                    self.router.dispatch(&text);
                }
            }
            TransportEvent::Errored(e) => {
                if self.is_current(epoch) {
                    self.announce(ERROR, &ErrorEvent::new(Error::from(e).to_string()));
                }
            }
            TransportEvent::Closed => {
                let Some(closed) = self.active.take() else {
                    return;
                };

                if closed.announced {
                    self.announce(CONNECTION, &ConnectionEvent::disconnected(Some(&channel)));
                }
                if self.is_current(epoch) {
                    self.schedule_retry(epoch, &channel);
                }
            }
        }
    }

    fn schedule_retry(&mut self, epoch: u64, channel: &str) {
        let Some(delay) = self.policy.next_delay() else {
            let attempts = self.policy.attempts();

            #[cfg(feature = "tracing")]
            tracing::warn!(%channel, attempts, "Reconnection attempts exhausted, giving up");

            self.update_status(epoch, |info| info.state = ConnectionState::Disconnected);
            self.announce(CONNECTION, &ConnectionEvent::gave_up(channel, attempts));
            return;
        };

        let attempt = self.policy.attempts();

        #[cfg(feature = "tracing")]
        tracing::debug!(%channel, attempt, ?delay, "Scheduling reconnect");

        self.update_status(epoch, |info| {
            info.state = ConnectionState::Connecting;
            info.reconnect_attempts = attempt;
        });

        let retry_tx = self.retry_tx.clone();
        self.cancel_retry();
        self.pending_retry = Some(tokio::spawn(async move {
            sleep(delay).await;
            _ = retry_tx.send(epoch);
        }));
    }

    fn cancel_retry(&mut self) {
        if let Some(timer) = self.pending_retry.take() {
            timer.abort();
        }
    }

    fn handle_retry(&mut self, epoch: u64) {
        // A timer that fired after connect/disconnect belongs to a finished session
        if !self.is_current(epoch) {
            return;
        }
        self.pending_retry = None;
        if self.active.is_some() {
            return;
        }

        let Some(channel) = self.status.borrow().channel.clone() else {
            return;
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(%channel, attempt = self.policy.attempts(), "Reconnecting");

        self.open(epoch, &channel);
    }
}
