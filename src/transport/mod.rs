//! Real-time transport.
//!
//! Keeps exactly one live websocket to the server and feeds every decoded
//! frame into the [`Bus`](crate::Bus). Failures never reach callers: a drop
//! degrades to "messages stop arriving" until the next successful reconnect.
//!
//! - [`Connection`]       the reconnecting loop (spawned)
//! - [`TransportHandle`]  state, outbound `send`, shutdown
//! - [`ConnectionState`]  `Connecting → Open → Reconnecting → ... → Closed`
//!
//! There is no buffering or replay: frames the server sends while the channel
//! is down are lost, and reconciliation does not depend on seeing every one.

mod connection;
mod handle;

pub use connection::Connection;
pub use handle::{ConnectionState, TransportHandle};
