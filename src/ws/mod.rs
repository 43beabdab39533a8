//! Core WebSocket client infrastructure.
//!
//! This module carries an application-level request/response protocol over a
//! single long-lived frame channel: a charging station dials a central
//! system, keeps the session alive with ping/pong deadlines, and recovers
//! from failures with jittered exponential backoff.
//!
//! # Architecture
//!
//! - [`Client`]: Handshake, session ownership, reconnection policy and the
//!   public callback surface
//! - [`Session`]: One live frame channel with its outbound queue, I/O task
//!   and pinger
//! - [`TimeoutConfig`]: Durations and retry caps consumed by both
//!
//! # Example
//!
//! ```ignore
//! let client = Client::new();
//! client.set_message_handler(|data| {
//!     println!("received {} bytes", data.len());
//!     Ok(())
//! });
//! client.start("ws://localhost:8887/ws/CP001").await?;
//! client.write(b"[2,\"1\",\"Heartbeat\",{}]".to_vec())?;
//! ```

pub mod client;
pub mod config;
pub mod dialer;
pub mod error;
mod reconnect;
pub mod session;

pub use client::Client;
pub use config::TimeoutConfig;
pub use dialer::{DialOption, Dialer};
pub use error::WsError;
pub use session::Session;
