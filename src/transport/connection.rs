//! # Connection loop: one websocket, reconnected forever.
//!
//! ```text
//! Connection::spawn() ──► run()
//!
//! loop {
//!   ├─► state = Connecting
//!   ├─► connect_async(uri) (bounded by connect_timeout, cancellable)
//!   │       ├─ Err ──► warn
//!   │       └─ Ok  ──► state = Open ──► pump() until close/error/shutdown
//!   │                     ├─ inbound text/binary ──► Message::decode ──► bus.dispatch
//!   │                     │                          (bad frame: warn, drop, keep reading)
//!   │                     └─ outbound queue     ──► sink.send
//!   ├─► state = Reconnecting (Closed on shutdown)
//!   ├─► drop whatever is still queued outbound
//!   └─► sleep(reconnect_delay) (cancellable)
//! }
//! state = Closed
//! ```
//!
//! ## Rules
//! - One loop owns the socket, so at most one connection attempt is ever in flight.
//! - A read error is reported and ends the pump; the close that follows is the
//!   only thing that schedules a reconnect.
//! - Subscriptions live on the [`Bus`], not on the connection, and survive
//!   reconnects untouched.
//! - The state leaves `Open` before the outbound queue is drained, and the queue
//!   is drained again before the next `Open`, so a frame accepted for one
//!   connection is never written to the next.
//! - The loop runs on a child of the caller's token: shutting one transport down
//!   never cancels the caller's other work.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::{select, time};
use tokio_tungstenite::tungstenite::Message as Frame;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::handle::{ConnectionState, TransportHandle};
use crate::config::Config;
use crate::error::{DecodeError, TransportError};
use crate::events::{Bus, Message};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Why a live connection ended.
enum PumpExit {
    /// Peer closed or the stream ended or failed.
    Dropped,
    /// Shutdown was requested.
    Shutdown,
}

/// The reconnecting websocket loop.
pub struct Connection {
    uri: String,
    bus: Bus,
    reconnect_delay: Duration,
    connect_timeout: Option<Duration>,
    token: CancellationToken,
    state: watch::Sender<ConnectionState>,
}

impl Connection {
    /// Validates `uri` and spawns the connection loop on the current runtime.
    ///
    /// Every decoded frame is dispatched on `bus`. The loop stops when `token`
    /// is cancelled or [`TransportHandle::shutdown`] is called.
    pub fn spawn(
        uri: &str,
        bus: Bus,
        cfg: &Config,
        token: CancellationToken,
    ) -> Result<TransportHandle, TransportError> {
        let parsed = url::Url::parse(uri).map_err(|e| TransportError::InvalidUri {
            uri: uri.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(TransportError::InvalidUri {
                uri: uri.to_string(),
                reason: format!("expected ws:// or wss://, got {}://", parsed.scheme()),
            });
        }

        let token = token.child_token();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (out_tx, out_rx) = mpsc::channel(cfg.outbound_capacity_clamped());

        let conn = Connection {
            uri: uri.to_string(),
            bus,
            reconnect_delay: cfg.reconnect_delay,
            connect_timeout: cfg.connect_timeout(),
            token: token.clone(),
            state: state_tx,
        };
        let join = tokio::spawn(conn.run(out_rx));

        Ok(TransportHandle {
            uri: uri.to_string(),
            outbound: out_tx,
            state: state_rx,
            token,
            join: Mutex::new(Some(join)),
        })
    }

    async fn run(self, mut outbound: mpsc::Receiver<String>) {
        let mut attempt: u64 = 0;

        loop {
            if self.token.is_cancelled() {
                break;
            }
            attempt += 1;
            self.state.send_replace(ConnectionState::Connecting);

            let res = select! {
                _ = self.token.cancelled() => break,
                res = self.connect() => res,
            };

            match res {
                Ok(socket) => {
                    tracing::info!(uri = %self.uri, attempt, "transport connected");
                    let stale = drain(&mut outbound);
                    if stale > 0 {
                        tracing::debug!(uri = %self.uri, dropped_outbound = stale, "stale frames discarded");
                    }
                    self.state.send_replace(ConnectionState::Open);
                    let exit = self.pump(socket, &mut outbound).await;

                    if let PumpExit::Shutdown = exit {
                        self.state.send_replace(ConnectionState::Closed);
                        break;
                    }
                    self.state.send_replace(ConnectionState::Reconnecting);
                    let dropped = drain(&mut outbound);
                    tracing::info!(uri = %self.uri, dropped_outbound = dropped, "transport closed");
                }
                Err(reason) => {
                    tracing::warn!(uri = %self.uri, attempt, error = %reason, "transport connect failed");
                }
            }

            self.state.send_replace(ConnectionState::Reconnecting);
            tracing::debug!(
                uri = %self.uri,
                delay_ms = u64::try_from(self.reconnect_delay.as_millis()).unwrap_or(u64::MAX),
                "reconnect scheduled"
            );
            let sleep = time::sleep(self.reconnect_delay);
            tokio::pin!(sleep);
            select! {
                _ = &mut sleep => {}
                _ = self.token.cancelled() => break,
            }
        }

        self.state.send_replace(ConnectionState::Closed);
        tracing::info!(uri = %self.uri, "transport stopped");
    }

    async fn connect(&self) -> Result<Socket, String> {
        let handshake = connect_async(self.uri.as_str());
        let res = match self.connect_timeout {
            Some(dur) => match time::timeout(dur, handshake).await {
                Ok(res) => res,
                Err(_elapsed) => return Err(format!("handshake timed out after {dur:?}")),
            },
            None => handshake.await,
        };
        res.map(|(socket, _response)| socket).map_err(|e| e.to_string())
    }

    async fn pump(&self, socket: Socket, outbound: &mut mpsc::Receiver<String>) -> PumpExit {
        let (mut sink, mut stream) = socket.split();

        loop {
            select! {
                _ = self.token.cancelled() => {
                    let _ = sink.send(Frame::Close(None)).await;
                    return PumpExit::Shutdown;
                }
                frame = stream.next() => match frame {
                    Some(Ok(Frame::Text(text))) => self.deliver(Message::decode(&text)),
                    Some(Ok(Frame::Binary(bytes))) => self.deliver(Message::decode_slice(&bytes)),
                    Some(Ok(Frame::Close(reason))) => {
                        tracing::debug!(uri = %self.uri, reason = ?reason, "close frame received");
                        return PumpExit::Dropped;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::warn!(uri = %self.uri, error = %err, "transport read failed");
                        return PumpExit::Dropped;
                    }
                    None => return PumpExit::Dropped,
                },
                Some(text) = outbound.recv() => {
                    if let Err(err) = sink.send(Frame::Text(text)).await {
                        tracing::warn!(uri = %self.uri, error = %err, "transport write failed");
                        return PumpExit::Dropped;
                    }
                }
            }
        }
    }

    fn deliver(&self, decoded: Result<Message, DecodeError>) {
        match decoded {
            Ok(message) => {
                self.bus.dispatch(&message);
            }
            Err(err) => {
                tracing::warn!(
                    uri = %self.uri,
                    error = %err,
                    label = err.as_label(),
                    "dropping malformed frame"
                );
            }
        }
    }
}

/// Empties the outbound queue, returning how many frames were dropped.
fn drain(outbound: &mut mpsc::Receiver<String>) -> usize {
    let mut dropped = 0usize;
    while outbound.try_recv().is_ok() {
        dropped += 1;
    }
    dropped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Topic;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    #[derive(Default)]
    struct ServerStats {
        accepted: AtomicUsize,
        live: AtomicUsize,
        max_live: AtomicUsize,
    }

    /// Accepts connections, sends `frames`, echoes client text for `hold`, then closes.
    async fn ws_server(frames: Vec<String>, hold: Duration) -> (String, Arc<ServerStats>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stats = Arc::new(ServerStats::default());
        let stats_srv = Arc::clone(&stats);

        tokio::spawn(async move {
            loop {
                let Ok((tcp, _)) = listener.accept().await else { break };
                let stats = Arc::clone(&stats_srv);
                let frames = frames.clone();
                tokio::spawn(async move {
                    let Ok(mut ws) = accept_async(tcp).await else { return };
                    stats.accepted.fetch_add(1, Ordering::SeqCst);
                    let live = stats.live.fetch_add(1, Ordering::SeqCst) + 1;
                    stats.max_live.fetch_max(live, Ordering::SeqCst);

                    for f in frames {
                        let _ = ws.send(Frame::Text(f)).await;
                    }
                    let deadline = time::sleep(hold);
                    tokio::pin!(deadline);
                    loop {
                        select! {
                            _ = &mut deadline => break,
                            msg = ws.next() => match msg {
                                Some(Ok(Frame::Text(t))) => { let _ = ws.send(Frame::Text(t)).await; }
                                Some(Ok(_)) => {}
                                _ => break,
                            },
                        }
                    }
                    let _ = ws.close(None).await;
                    stats.live.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        (format!("ws://{addr}"), stats)
    }

    fn fast_config() -> Config {
        Config {
            reconnect_delay: Duration::from_millis(50),
            connect_timeout: Duration::from_secs(2),
            ..Config::default()
        }
    }

    async fn eventually(mut cond: impl FnMut() -> bool) {
        time::timeout(Duration::from_secs(5), async {
            while !cond() {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn log_frame(text: &str) -> String {
        json!({"topic": "log", "body": {"text": text}}).to_string()
    }

    #[tokio::test]
    async fn test_reconnects_and_keeps_subscriptions() {
        let (uri, stats) = ws_server(vec![log_frame("hello")], Duration::from_millis(20)).await;
        let bus = Bus::new();
        let received = Arc::new(AtomicUsize::new(0));
        let received_h = Arc::clone(&received);
        bus.subscribe_fn(Topic::Log, move |_| {
            received_h.fetch_add(1, Ordering::SeqCst);
        });

        let handle = Connection::spawn(&uri, bus, &fast_config(), CancellationToken::new()).unwrap();

        eventually(|| received.load(Ordering::SeqCst) >= 3).await;
        assert!(stats.accepted.load(Ordering::SeqCst) >= 3);
        assert_eq!(stats.max_live.load(Ordering::SeqCst), 1);

        handle.shutdown().await;
        assert_eq!(handle.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_malformed_frames_are_dropped_without_reconnect() {
        let frames = vec![
            "not json".to_string(),
            json!({"topic": "entity-updated", "body": {"entityId": "gke"}}).to_string(),
            json!({"type": "build", "data": {"status": "started"}}).to_string(),
        ];
        let (uri, stats) = ws_server(frames, Duration::from_secs(30)).await;
        let bus = Bus::new();
        let builds = Arc::new(AtomicUsize::new(0));
        let builds_h = Arc::clone(&builds);
        bus.subscribe_fn(Topic::Build, move |_| {
            builds_h.fetch_add(1, Ordering::SeqCst);
        });

        let handle = Connection::spawn(&uri, bus, &fast_config(), CancellationToken::new()).unwrap();
        eventually(|| builds.load(Ordering::SeqCst) == 1).await;

        assert_eq!(handle.state(), ConnectionState::Open);
        assert_eq!(stats.accepted.load(Ordering::SeqCst), 1);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_round_trips_while_open() {
        let (uri, _stats) = ws_server(Vec::new(), Duration::from_secs(30)).await;
        let bus = Bus::new();
        let echoed = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let echoed_h = Arc::clone(&echoed);
        bus.subscribe_fn(Topic::Echo, move |m| echoed_h.lock().push(m.clone()));

        let handle = Connection::spawn(&uri, bus, &fast_config(), CancellationToken::new()).unwrap();
        time::timeout(Duration::from_secs(5), handle.wait_for(ConnectionState::Open))
            .await
            .unwrap()
            .unwrap();

        let msg = Message::from_parts("echo", json!({"text": "ping"})).unwrap();
        handle.send(&msg).unwrap();
        eventually(|| !echoed.lock().is_empty()).await;
        assert_eq!(echoed.lock()[0], msg);

        handle.shutdown().await;
        assert!(matches!(handle.send(&msg), Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_send_fails_while_disconnected() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let cfg = Config {
            reconnect_delay: Duration::from_secs(30),
            ..fast_config()
        };
        let handle =
            Connection::spawn(&format!("ws://{addr}"), Bus::new(), &cfg, CancellationToken::new())
                .unwrap();
        time::timeout(Duration::from_secs(5), handle.wait_for(ConnectionState::Reconnecting))
            .await
            .unwrap()
            .unwrap();

        let msg = Message::from_parts("echo", json!({})).unwrap();
        assert!(matches!(handle.send(&msg), Err(TransportError::Disconnected)));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejects_non_websocket_uri() {
        let res = Connection::spawn(
            "http://localhost/ws",
            Bus::new(),
            &Config::default(),
            CancellationToken::new(),
        );
        assert!(matches!(res, Err(TransportError::InvalidUri { .. })));
        let res = Connection::spawn("::nope", Bus::new(), &Config::default(), CancellationToken::new());
        assert!(matches!(res, Err(TransportError::InvalidUri { .. })));
    }

    #[tokio::test]
    async fn test_parent_token_stops_loop() {
        let (uri, _stats) = ws_server(Vec::new(), Duration::from_secs(30)).await;
        let token = CancellationToken::new();
        let handle = Connection::spawn(&uri, Bus::new(), &fast_config(), token.clone()).unwrap();
        time::timeout(Duration::from_secs(5), handle.wait_for(ConnectionState::Open))
            .await
            .unwrap()
            .unwrap();

        token.cancel();
        time::timeout(Duration::from_secs(5), handle.wait_for(ConnectionState::Closed))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_leaves_parent_token_alone() {
        let (uri, _stats) = ws_server(Vec::new(), Duration::from_secs(30)).await;
        let parent = CancellationToken::new();
        let handle = Connection::spawn(&uri, Bus::new(), &fast_config(), parent.clone()).unwrap();
        time::timeout(Duration::from_secs(5), handle.wait_for(ConnectionState::Open))
            .await
            .unwrap()
            .unwrap();

        handle.shutdown().await;
        assert_eq!(handle.state(), ConnectionState::Closed);
        assert!(handle.is_shutting_down());
        assert!(!parent.is_cancelled());
        assert!(format!("{handle:?}").contains("Closed"));
    }

    #[tokio::test]
    async fn test_frames_queued_for_a_dropped_connection_are_not_replayed() {
        let (uri, stats) = ws_server(Vec::new(), Duration::from_millis(400)).await;
        let bus = Bus::new();
        let echoed = Arc::new(parking_lot::Mutex::new(Vec::<Message>::new()));
        let echoed_h = Arc::clone(&echoed);
        bus.subscribe_fn(Topic::Echo, move |m| echoed_h.lock().push(m.clone()));
        let cfg = Config {
            reconnect_delay: Duration::from_millis(300),
            ..fast_config()
        };

        let handle = Connection::spawn(&uri, bus, &cfg, CancellationToken::new()).unwrap();
        time::timeout(Duration::from_secs(5), handle.wait_for(ConnectionState::Open))
            .await
            .unwrap()
            .unwrap();
        time::timeout(Duration::from_secs(5), handle.wait_for(ConnectionState::Reconnecting))
            .await
            .unwrap()
            .unwrap();

        // A send that passed the Open check just before the drop.
        let stale = Message::from_parts("echo", json!({"text": "stale"})).unwrap();
        handle.outbound.try_send(stale.encode().unwrap()).unwrap();
        let msg = Message::from_parts("echo", json!({"text": "ping"})).unwrap();
        assert!(matches!(handle.send(&msg), Err(TransportError::Disconnected)));

        time::timeout(Duration::from_secs(5), handle.wait_for(ConnectionState::Open))
            .await
            .unwrap()
            .unwrap();
        let fresh = Message::from_parts("echo", json!({"text": "fresh"})).unwrap();
        handle.send(&fresh).unwrap();
        eventually(|| !echoed.lock().is_empty()).await;

        assert_eq!(*echoed.lock(), vec![fresh]);
        assert_eq!(stats.accepted.load(Ordering::SeqCst), 2);
        handle.shutdown().await;
    }
}
