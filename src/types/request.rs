use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use serde_json::Value;

/// Commands understood by the event server, tagged by their `type` field.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Liveness probe; answered with a `pong` event
    Ping,
    /// Join an additional server-side channel on the same connection
    Subscribe { channel: String },
    /// Run detection on a base64-encoded image; answered with `detection_result`
    Detect { image: String },
    /// Forward a payload to an MQTT topic
    MqttPublish { topic: String, payload: Value },
    /// Relay a message to every client on the current channel
    Broadcast { message: Value },
}

impl Request {
    #[must_use]
    pub fn subscribe<S: Into<String>>(channel: S) -> Self {
        Self::Subscribe {
            channel: channel.into(),
        }
    }

    /// Encode raw image bytes (JPEG, PNG, ...) for a detection request.
    #[must_use]
    pub fn detect(image: &[u8]) -> Self {
        Self::Detect {
            image: STANDARD.encode(image),
        }
    }

    #[must_use]
    pub fn mqtt_publish<S: Into<String>>(topic: S, payload: Value) -> Self {
        Self::MqttPublish {
            topic: topic.into(),
            payload,
        }
    }

    #[must_use]
    pub fn broadcast(message: Value) -> Self {
        Self::Broadcast { message }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn ping_is_bare_type() {
        assert_eq!(
            serde_json::to_value(Request::Ping).unwrap(),
            json!({"type": "ping"})
        );
    }

    #[test]
    fn detect_encodes_image() {
        let value = serde_json::to_value(Request::detect(b"\xff\xd8\xff")).unwrap();
        assert_eq!(value, json!({"type": "detect", "image": "/9j/"}));
    }

    #[test]
    fn mqtt_publish_keeps_payload() {
        let request = Request::mqtt_publish("devices/cam-1/cmd", json!({"led": true}));
        assert_eq!(
            serde_json::to_value(request).unwrap(),
            json!({"type": "mqtt_publish", "topic": "devices/cam-1/cmd", "payload": {"led": true}})
        );
    }

    #[test]
    fn subscribe_names_channel() {
        assert_eq!(
            serde_json::to_string(&Request::subscribe("alerts")).unwrap(),
            r#"{"type":"subscribe","channel":"alerts"}"#
        );
    }
}
