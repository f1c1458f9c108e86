//! Caller-facing side of the transport: state, outbound sends and shutdown.

use std::fmt;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::events::Message;

/// Lifecycle of the real-time connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// A handshake is in flight.
    Connecting,
    /// The channel is live; frames flow both ways.
    Open,
    /// The channel dropped; waiting `reconnect_delay` before the next attempt.
    Reconnecting,
    /// The loop has stopped for good.
    Closed,
}

/// Handle to a running connection loop.
pub struct TransportHandle {
    pub(super) uri: String,
    pub(super) outbound: mpsc::Sender<String>,
    pub(super) state: watch::Receiver<ConnectionState>,
    pub(super) token: CancellationToken,
    pub(super) join: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHandle")
            .field("uri", &self.uri)
            .field("state", &self.state())
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}

impl TransportHandle {
    /// Server URI.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Waits until the connection reaches `wanted`.
    ///
    /// Fails with [`TransportError::Closed`] if the loop stops first.
    pub async fn wait_for(&self, wanted: ConnectionState) -> Result<(), TransportError> {
        let mut rx = self.state.clone();
        rx.wait_for(|s| *s == wanted)
            .await
            .map(|_| ())
            .map_err(|_| TransportError::Closed)
    }

    /// Queues `message` on the live connection.
    ///
    /// Nothing is buffered across disconnections: while the channel is not
    /// [`ConnectionState::Open`] the call fails with [`TransportError::Disconnected`].
    pub fn send(&self, message: &Message) -> Result<(), TransportError> {
        match self.state() {
            ConnectionState::Open => {}
            ConnectionState::Closed => return Err(TransportError::Closed),
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                return Err(TransportError::Disconnected)
            }
        }
        let frame = message.encode()?;
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Full,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    /// True once [`shutdown`](Self::shutdown) was requested or the parent token
    /// passed to [`Connection::spawn`](super::Connection::spawn) was cancelled.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stops the loop, closing the live connection, and waits for it to exit.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let join = self.join.lock().take();
        if let Some(join) = join {
            if let Err(err) = join.await {
                tracing::error!(uri = %self.uri, error = %err, "transport loop panicked");
            }
        }
    }
}
