#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;

/// WebSocket error variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum WsError {
    /// Error connecting to or communicating with the WebSocket server
    Connection(tokio_tungstenite::tungstenite::Error),
    /// The configured host or channel does not form a valid WebSocket URL
    InvalidEndpoint(String),
    /// The connection manager's event loop is no longer running
    Unreachable,
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "WebSocket connection error: {e}"),
            Self::InvalidEndpoint(reason) => write!(f, "Invalid WebSocket endpoint: {reason}"),
            Self::Unreachable => write!(f, "WebSocket event loop is not running"),
        }
    }
}

impl StdError for WsError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Connection(e) => Some(e),
            _ => None,
        }
    }
}

// Integration with main Error type
impl From<WsError> for crate::error::Error {
    fn from(e: WsError) -> Self {
        crate::error::Error::with_source(crate::error::Kind::WebSocket, e)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for crate::error::Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        crate::error::Error::with_source(crate::error::Kind::WebSocket, WsError::Connection(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Kind};

    #[test]
    fn converts_into_websocket_kind() {
        let error: Error = WsError::InvalidEndpoint("channel must not be empty".to_owned()).into();

        assert_eq!(error.kind(), Kind::WebSocket);
        assert_eq!(
            error.to_string(),
            "WebSocket: Invalid WebSocket endpoint: channel must not be empty"
        );
        assert!(error.downcast_ref::<WsError>().is_some());
    }
}
