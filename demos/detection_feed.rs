//! Live feed of detection results and device telemetry.
//!
//! Connects to the `detections` channel, logs every detection and sensor reading, and
//! reports connection changes until interrupted or the reconnect budget is spent.
//!
//! Run with tracing enabled:
//! ```sh
//! VISION_WS_HOST=localhost:8000 RUST_LOG=info,vision_realtime=debug \
//!     cargo run --example detection_feed --features tracing
//! ```

use std::time::Duration;

use futures::StreamExt as _;
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vision_realtime::types::{CONNECTION, ConnectionEvent, ConnectionStatus, ERROR};
use vision_realtime::ws::{Config, ConnectionManager};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut config = Config::from_env();
    config.heartbeat_interval = Some(Duration::from_secs(30));
    let manager = ConnectionManager::new(config)?;

    let detections = manager.on("detection_result", |payload: &Value| {
        let count = payload["detections"].as_array().map_or(0, Vec::len);
        info!(stream = "detection_result", count, detections = %payload["detections"]);
    });
    let telemetry = manager.on("sensor_data", |payload: &Value| {
        info!(stream = "sensor_data", payload = %payload);
    });
    let errors = manager.on(ERROR, |payload: &Value| {
        warn!(error = %payload["error"]);
    });

    let mut connection = Box::pin(manager.events(CONNECTION));
    manager.connect("detections");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = connection.next() => {
                let Some(event) = event.as_ref().and_then(ConnectionEvent::from_payload) else {
                    break;
                };
                info!(status = %event.status, channel = ?event.channel);

                match event.status {
                    ConnectionStatus::Connected => manager.ping()?,
                    ConnectionStatus::GaveUp => break,
                    _ => {}
                }
            }
        }
    }

    detections.unsubscribe();
    telemetry.unsubscribe();
    errors.unsubscribe();
    manager.disconnect();

    Ok(())
}
