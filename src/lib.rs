#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod error;
pub mod router;
pub mod types;
pub mod ws;

use crate::error::Error;

pub use router::{Callback, EventRouter, Subscription};
pub use ws::{Config, ConnectionManager, ConnectionState, ReconnectConfig};

pub type Result<T> = std::result::Result<T, Error>;
