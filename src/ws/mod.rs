//! WebSocket session management.
//!
//! # Architecture
//!
//! - [`ConnectionManager`]: the façade consumers hold. Owns at most one transport and drives
//!   reconnection from a single background task.
//! - [`config::Config`]: endpoint and [`config::ReconnectConfig`] settings.
//! - [`reconnect::ReconnectPolicy`]: attempt counting and exponential delays.
//!
//! Inbound frames are handed to the [`crate::router::EventRouter`], which fans them out by
//! their `type` field.

pub mod config;
pub mod connection;
pub mod error;
pub mod reconnect;
mod transport;

pub use config::{Config, ReconnectConfig};
pub use connection::{ConnectionInfo, ConnectionManager, ConnectionState};
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
