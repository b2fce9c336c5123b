use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status carried by a synthesized `connection` event.
#[non_exhaustive]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionStatus {
    /// The transport for `channel` opened
    Connected,
    /// The transport closed, planned or not
    Disconnected,
    /// The reconnection budget is spent; no further attempts until `connect` is called
    GaveUp,
}

/// Payload of the synthesized `connection` event.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionEvent {
    pub status: ConnectionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Attempts made before giving up. Only present on [`ConnectionStatus::GaveUp`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
}

impl ConnectionEvent {
    #[must_use]
    pub fn connected(channel: &str) -> Self {
        Self {
            status: ConnectionStatus::Connected,
            channel: Some(channel.to_owned()),
            attempts: None,
        }
    }

    #[must_use]
    pub fn disconnected(channel: Option<&str>) -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            channel: channel.map(ToOwned::to_owned),
            attempts: None,
        }
    }

    #[must_use]
    pub fn gave_up(channel: &str, attempts: u32) -> Self {
        Self {
            status: ConnectionStatus::GaveUp,
            channel: Some(channel.to_owned()),
            attempts: Some(attempts),
        }
    }

    /// Try to read a delivered `connection` payload back into this type.
    #[must_use]
    pub fn from_payload(payload: &Value) -> Option<Self> {
        Self::deserialize(payload).ok()
    }
}

/// Payload of the synthesized `error` event.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub error: String,
}

impl ErrorEvent {
    #[must_use]
    pub fn new<S: Into<String>>(error: S) -> Self {
        Self {
            error: error.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn connected_event_shape() {
        let value = serde_json::to_value(ConnectionEvent::connected("alerts")).unwrap();
        assert_eq!(value, json!({"status": "connected", "channel": "alerts"}));
    }

    #[test]
    fn disconnected_without_channel_omits_it() {
        let value = serde_json::to_value(ConnectionEvent::disconnected(None)).unwrap();
        assert_eq!(value, json!({"status": "disconnected"}));
    }

    #[test]
    fn gave_up_reads_back() {
        let payload = json!({"status": "gave_up", "channel": "detections", "attempts": 10});
        let event = ConnectionEvent::from_payload(&payload).unwrap();

        assert_eq!(event, ConnectionEvent::gave_up("detections", 10));
        assert_eq!(event.status.to_string(), "gave_up");
    }
}
