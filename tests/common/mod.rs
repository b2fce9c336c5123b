#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]
#![allow(
    dead_code,
    reason = "Not every test binary uses every helper"
)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt as _, StreamExt as _};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use vision_realtime::ws::{Config, ReconnectConfig};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(3);

/// Mock event server.
///
/// Records the path of every accepted upgrade, forwards client frames to the test and can
/// drop all live connections without a close handshake.
pub struct MockWsServer {
    addr: SocketAddr,
    /// Broadcast messages to ALL connected clients
    message_tx: broadcast::Sender<String>,
    /// Request paths of accepted connections, in accept order
    path_rx: mpsc::UnboundedReceiver<String>,
    /// Text frames sent by clients
    client_rx: mpsc::UnboundedReceiver<String>,
    /// Bumped to make every live connection hang up
    kick_tx: watch::Sender<u64>,
    live: Arc<AtomicUsize>,
}

impl MockWsServer {
    /// Start a mock server on a random port.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (message_tx, _) = broadcast::channel::<String>(100);
        let (path_tx, path_rx) = mpsc::unbounded_channel::<String>();
        let (client_tx, client_rx) = mpsc::unbounded_channel::<String>();
        let (kick_tx, _) = watch::channel(0_u64);
        let live = Arc::new(AtomicUsize::new(0));

        let broadcast_tx = message_tx.clone();
        let kick = kick_tx.clone();
        let live_count = Arc::clone(&live);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };

                let path_tx = path_tx.clone();
                let record_path = move |request: &Request, response: Response| {
                    drop(path_tx.send(request.uri().path().to_owned()));
                    Ok::<_, ErrorResponse>(response)
                };
                let Ok(ws_stream) = tokio_tungstenite::accept_hdr_async(stream, record_path).await
                else {
                    continue;
                };

                let (mut write, mut read) = ws_stream.split();
                let client_tx = client_tx.clone();
                let mut msg_rx = broadcast_tx.subscribe();
                let mut kicked = kick.subscribe();
                let live = Arc::clone(&live_count);
                live.fetch_add(1, Ordering::SeqCst);

                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            msg = read.next() => {
                                match msg {
                                    Some(Ok(Message::Text(text))) => {
                                        drop(client_tx.send(text.to_string()));
                                    }
                                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                                    Some(Ok(_)) => {}
                                }
                            }
                            msg = msg_rx.recv() => {
                                match msg {
                                    Ok(text) => {
                                        if write.send(Message::Text(text.into())).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(_) => break,
                                }
                            }
                            _ = kicked.changed() => break,
                        }
                    }
                    live.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        Self {
            addr,
            message_tx,
            path_rx,
            client_rx,
            kick_tx,
            live,
        }
    }

    /// `host:port` of the server, suitable for [`Config::host`].
    pub fn host(&self) -> String {
        self.addr.to_string()
    }

    /// Config pointing at this server with the given reconnect settings.
    pub fn config(&self, reconnect: ReconnectConfig) -> Config {
        Config::builder()
            .host(self.host())
            .reconnect(reconnect)
            .build()
    }

    /// Send a text frame to all connected clients.
    pub fn send(&self, message: &str) {
        drop(self.message_tx.send(message.to_owned()));
    }

    pub fn send_json(&self, message: &Value) {
        self.send(&message.to_string());
    }

    /// Hang up on every live connection.
    pub fn drop_connections(&self) {
        self.kick_tx.send_modify(|generation| *generation += 1);
    }

    pub fn live_connections(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Wait until exactly `count` connections are live.
    pub async fn wait_for_live(&self, count: usize) -> bool {
        timeout(RECV_TIMEOUT, async {
            while self.live_connections() != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok()
    }

    /// Receive the path of the next accepted connection.
    pub async fn recv_path(&mut self) -> Option<String> {
        timeout(RECV_TIMEOUT, self.path_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Wait up to `wait` for another connection; `None` if none arrived.
    pub async fn expect_no_connection(&mut self, wait: Duration) -> Option<String> {
        timeout(wait, self.path_rx.recv()).await.ok().flatten()
    }

    /// Receive the next text frame sent by any client.
    pub async fn recv_message(&mut self) -> Option<String> {
        timeout(RECV_TIMEOUT, self.client_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Wait up to `wait` for a client frame; `None` if none arrived.
    pub async fn try_recv_message(&mut self, wait: Duration) -> Option<String> {
        timeout(wait, self.client_rx.recv()).await.ok().flatten()
    }
}

/// Reconnect settings scaled down for tests.
pub fn fast_reconnect(initial: Duration, max_attempts: Option<u32>) -> ReconnectConfig {
    let mut reconnect = ReconnectConfig::default();
    reconnect.initial_backoff = initial;
    reconnect.max_attempts = max_attempts;
    reconnect
}

/// A `host:port` nobody is listening on.
pub async fn refused_host() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}
