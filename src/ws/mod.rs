//! Core WebSocket infrastructure.
//!
//! This module owns the physical channel to the push endpoint and
//! multiplexes it between any number of consumers.
//!
//! # Architecture
//!
//! - [`ConnectionManager`]: one channel, status state machine, capped linear
//!   reconnect, dispatch of inbound envelopes by `type`
//! - [`MessageParser`]: Trait for parsing incoming WebSocket frames
//! - [`Disposer`]: handle returned by every registration
//!
//! # Example
//!
//! ```rust, no_run
//! use runboard_live::ws::{ConnectionManager, WILDCARD};
//! use runboard_live::ws::config::Config;
//!
//! # async fn run() -> runboard_live::Result<()> {
//! let manager = ConnectionManager::new("ws://localhost:8000/ws", None, Config::default())?;
//! let _status = manager.on_status_change(|status| println!("{status}"));
//! let _everything = manager.on_message(WILDCARD, |envelope| println!("{envelope}"));
//! manager.connect();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod registry;
pub mod traits;

pub use connection::{ConnectionManager, ConnectionStatus};
pub use envelope::{Envelope, WILDCARD};
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use registry::{Disposer, MessageHandler};
pub use traits::*;
