//! Message types exchanged with the event server.
//!
//! Inbound payloads are opaque JSON; only the events synthesized locally by the
//! [`ConnectionManager`](crate::ws::ConnectionManager) have fixed shapes here.

pub mod request;
pub mod response;

pub use request::Request;
pub use response::{ConnectionEvent, ConnectionStatus, ErrorEvent};

/// Subscribers of this type receive every decoded message.
pub const WILDCARD: &str = "*";
/// Frames that are not valid JSON are delivered verbatim under this type.
pub const RAW: &str = "raw";
/// Type assumed for decoded messages without a string `type` field.
pub const DEFAULT_TYPE: &str = "message";
/// Synthesized connection status changes.
pub const CONNECTION: &str = "connection";
/// Synthesized transport failures.
pub const ERROR: &str = "error";
