use std::time::Duration;

use futures::{SinkExt as _, StreamExt as _};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, interval_at};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::error::WsError;

/// Lifecycle signals of one transport, tagged with the id of the handle that produced them.
pub(crate) type TransportEvents = mpsc::UnboundedSender<(u64, TransportEvent)>;

#[derive(Debug)]
pub(crate) enum TransportEvent {
    Opened,
    Message(String),
    Errored(WsError),
    /// Always the last signal of a handle, whether the close was requested or not
    Closed,
}

/// Ready state of a single transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Keep-alive request written on a fixed interval while open.
#[derive(Debug, Clone)]
pub(crate) struct Heartbeat {
    pub(crate) interval: Duration,
    pub(crate) payload: String,
}

/// One WebSocket connection to one channel.
///
/// The handle performs no payload interpretation and never retries; it only reports what
/// happened through [`TransportEvent`]s. Dropping the handle closes the connection.
#[derive(Debug)]
pub(crate) struct TransportHandle {
    id: u64,
    channel: String,
    ready: watch::Sender<ReadyState>,
    outbound: mpsc::UnboundedSender<String>,
    shutdown: CancellationToken,
}

impl TransportHandle {
    /// Start connecting to `url`. Progress is reported on `events`.
    pub(crate) fn open(
        id: u64,
        channel: &str,
        url: Url,
        heartbeat: Option<Heartbeat>,
        events: TransportEvents,
    ) -> Self {
        let (ready, _) = watch::channel(ReadyState::Connecting);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let task = Connection {
            id,
            url,
            ready: ready.clone(),
            outbound_rx,
            shutdown: shutdown.clone(),
            heartbeat,
            events,
        };
        tokio::spawn(task.run());

        Self {
            id,
            channel: channel.to_owned(),
            ready,
            outbound,
            shutdown,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn channel(&self) -> &str {
        &self.channel
    }

    pub(crate) fn ready_state(&self) -> ReadyState {
        *self.ready.borrow()
    }

    /// Open or still connecting to `channel`.
    pub(crate) fn is_attached_to(&self, channel: &str) -> bool {
        self.channel == channel
            && matches!(self.ready_state(), ReadyState::Connecting | ReadyState::Open)
    }

    /// Transmit `text` if open. Anything sent in another state is dropped, not queued.
    pub(crate) fn send(&self, text: String) -> bool {
        self.ready_state() == ReadyState::Open && self.outbound.send(text).is_ok()
    }

    /// Request an orderly shutdown. [`TransportEvent::Closed`] still follows.
    pub(crate) fn close(&self) {
        self.ready.send_if_modified(|state| {
            if matches!(state, ReadyState::Connecting | ReadyState::Open) {
                *state = ReadyState::Closing;
                true
            } else {
                false
            }
        });
        self.shutdown.cancel();
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// The task side of a [`TransportHandle`].
struct Connection {
    id: u64,
    url: Url,
    ready: watch::Sender<ReadyState>,
    outbound_rx: mpsc::UnboundedReceiver<String>,
    shutdown: CancellationToken,
    heartbeat: Option<Heartbeat>,
    events: TransportEvents,
}

impl Connection {
    fn emit(&self, event: TransportEvent) {
        // The owner may already be gone, in which case nobody is interested
        _ = self.events.send((self.id, event));
    }

    async fn run(mut self) {
        #[cfg(feature = "tracing")]
        tracing::debug!(id = self.id, url = %self.url, "Opening transport");

        let connected = tokio::select! {
            biased;
            () = self.shutdown.cancelled() => None,
            result = connect_async(self.url.as_str()) => Some(result),
        };

        let ws_stream = match connected {
            Some(Ok((ws_stream, _))) => ws_stream,
            Some(Err(e)) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(id = self.id, url = %self.url, error = %e, "Unable to connect");
                self.finish(Some(WsError::Connection(e)));
                return;
            }
            None => {
                self.finish(None);
                return;
            }
        };

        let opened = self.ready.send_if_modified(|state| {
            if *state == ReadyState::Connecting {
                *state = ReadyState::Open;
                true
            } else {
                false
            }
        });
        if !opened {
            // close() raced the handshake
            let (mut write, _) = ws_stream.split();
            _ = write.send(Message::Close(None)).await;
            self.finish(None);
            return;
        }

        self.emit(TransportEvent::Opened);

        let (mut write, mut read) = ws_stream.split();
        let mut heartbeat = self.heartbeat.as_ref().map(|heartbeat| {
            interval_at(Instant::now() + heartbeat.interval, heartbeat.interval)
        });

        let error = loop {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    // The peer may already be gone; the close frame is best effort
                    _ = write.send(Message::Close(None)).await;
                    break None;
                }

                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            #[cfg(feature = "tracing")]
                            tracing::trace!(id = self.id, %text, "Received WebSocket text message");
                            self.emit(TransportEvent::Message(text.to_string()));
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            self.emit(TransportEvent::Message(
                                String::from_utf8_lossy(&bytes).into_owned(),
                            ));
                        }
                        Some(Ok(Message::Close(_))) | None => break None,
                        Some(Ok(_)) => {
                            // Ping/pong frames are answered by tungstenite itself
                        }
                        Some(Err(e)) => break Some(WsError::Connection(e)),
                    }
                }

                Some(text) = self.outbound_rx.recv() => {
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        break Some(WsError::Connection(e));
                    }
                }

                () = tick(heartbeat.as_mut()) => {
                    if let Some(beat) = &self.heartbeat
                        && let Err(e) = write.send(Message::Text(beat.payload.clone().into())).await
                    {
                        break Some(WsError::Connection(e));
                    }
                }
            }
        };

        self.finish(error);
    }

    fn finish(&self, error: Option<WsError>) {
        self.ready.send_replace(ReadyState::Closed);
        if let Some(error) = error {
            self.emit(TransportEvent::Errored(error));
        }
        self.emit(TransportEvent::Closed);

        #[cfg(feature = "tracing")]
        tracing::debug!(id = self.id, "Transport closed");
    }
}

async fn tick(heartbeat: Option<&mut Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
