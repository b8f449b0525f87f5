//! WebSocket session lifecycle. Handles a single connected client from
//! upgrade through disconnect.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, Stream, StreamExt};
use metrics::{counter, gauge, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::connection::ClientConnection;
use super::dispatcher::Dispatcher;
use super::identity::Identity;
use super::protocol;
use crate::metrics::{
    RELAY_MESSAGES_DROPPED_TOTAL, RELAY_MESSAGES_TOTAL, WS_CONNECTIONS_ACTIVE,
    WS_CONNECTIONS_TOTAL, WS_CONNECTION_DURATION_SECONDS, WS_DISCONNECTIONS_TOTAL,
};
use crate::server::AppState;

/// How long the writer gets to flush queued frames after the loop ends.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Why a relay loop stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The client sent a Close frame.
    PeerClosed,
    /// The inbound stream ended without a Close frame.
    StreamEnded,
    /// Reading from the transport failed.
    Transport(String),
    /// The client sent a frame that is not a JSON object.
    ProtocolViolation(String),
    /// The outbound writer stopped (socket write failed).
    WriterClosed,
    /// The server is shutting down.
    Shutdown,
}

impl CloseReason {
    /// Short label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::PeerClosed => "peer_closed",
            Self::StreamEnded => "stream_ended",
            Self::Transport(_) => "transport",
            Self::ProtocolViolation(_) => "protocol_violation",
            Self::WriterClosed => "writer_closed",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(detail) | Self::ProtocolViolation(detail) => {
                write!(f, "{}: {detail}", self.label())
            }
            _ => f.write_str(self.label()),
        }
    }
}

/// Receive, decode and dispatch frames until the connection should close.
///
/// Frames are handled strictly one at a time in arrival order. Non-fatal
/// decode failures drop the frame and keep reading.
pub async fn relay_loop<S, E>(
    mut inbound: S,
    connection: &ClientConnection,
    identity: &Identity,
    dispatcher: &Dispatcher,
    shutdown: &CancellationToken,
) -> CloseReason
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    loop {
        let frame = tokio::select! {
            biased;
            () = shutdown.cancelled() => return CloseReason::Shutdown,
            frame = inbound.next() => frame,
        };

        let msg = match frame {
            None => return CloseReason::StreamEnded,
            Some(Err(e)) => return CloseReason::Transport(e.to_string()),
            Some(Ok(msg)) => msg,
        };

        // Binary frames are accepted when they carry UTF-8 text.
        let text = match &msg {
            Message::Text(t) => t.as_str(),
            Message::Binary(data) => match std::str::from_utf8(data) {
                Ok(s) => s,
                Err(_) => {
                    return CloseReason::ProtocolViolation(format!(
                        "non-UTF-8 binary frame ({} bytes)",
                        data.len()
                    ));
                }
            },
            Message::Close(_) => return CloseReason::PeerClosed,
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        match protocol::decode(text) {
            Ok(message) => {
                counter!(RELAY_MESSAGES_TOTAL, "event" => message.event_name()).increment(1);
                let _ = dispatcher.dispatch(connection, identity, message);
            }
            Err(e) => {
                counter!(RELAY_MESSAGES_DROPPED_TOTAL, "reason" => e.kind()).increment(1);
                if e.is_fatal() {
                    warn!(conn_id = %connection.id, error = %e, "closing on malformed frame");
                    return CloseReason::ProtocolViolation(e.to_string());
                }
                warn!(conn_id = %connection.id, kind = e.kind(), error = %e, "dropping frame");
            }
        }
    }
}

/// Run a WebSocket session for a connected client.
///
/// 1. Registers the connection under `identity`
/// 2. Spawns the single outbound writer
/// 3. Runs the relay loop until the peer, the writer or shutdown ends it
/// 4. Unregisters, whichever way the session ends
#[instrument(skip_all, fields(identity = %identity))]
pub async fn run_ws_session(socket: WebSocket, identity: Identity, state: AppState) {
    let (mut ws_tx, ws_rx) = socket.split();
    let (connection, mut send_rx) = ClientConnection::open(state.config.send_queue_capacity);

    let Some(registration) = state.directory.join(Arc::clone(&connection), identity.clone())
    else {
        warn!(conn_id = %connection.id, "connection already registered");
        return;
    };

    info!(
        conn_id = %registration.connection_id(),
        mailbox = %registration.identity(),
        "client connected"
    );
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    // Only this task writes to the socket.
    let mut writer = tokio::spawn(async move {
        while let Some(frame) = send_rx.recv().await {
            if ws_tx.send(Message::Text(String::clone(&frame).into())).await.is_err() {
                return;
            }
        }
        let _ = ws_tx.close().await;
    });

    let shutdown = state.shutdown.token();
    let reason = tokio::select! {
        reason = relay_loop(ws_rx, &connection, &identity, &state.dispatcher, &shutdown) => reason,
        _ = &mut writer => CloseReason::WriterClosed,
    };

    let conn_id = connection.id.clone();
    let dropped = connection.drop_count();
    let duration = connection.age();

    // Last owner of the send half goes away here, so the writer sees the
    // queue close once any in-flight snapshots are released.
    drop(registration);
    drop(connection);
    if !writer.is_finished()
        && tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
            .await
            .is_err()
    {
        debug!(%conn_id, "writer did not drain in time");
        writer.abort();
    }

    info!(
        %conn_id,
        reason = %reason,
        dropped,
        duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        "client disconnected"
    );
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(duration.as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::directory::RelayDirectory;
    use futures::stream;
    use serde_json::{Value, json};
    use tokio::sync::mpsc;

    type Frame = Result<Message, std::io::Error>;

    struct Harness {
        directory: Arc<RelayDirectory>,
        dispatcher: Dispatcher,
        shutdown: CancellationToken,
    }

    impl Harness {
        fn new() -> Self {
            let directory = Arc::new(RelayDirectory::new());
            Self {
                dispatcher: Dispatcher::new(directory.clone()),
                directory,
                shutdown: CancellationToken::new(),
            }
        }

        fn join(&self, name: &str) -> (Arc<ClientConnection>, mpsc::Receiver<Arc<String>>) {
            let (conn, rx) = ClientConnection::open(16);
            assert!(self.directory.register(conn.clone(), ident(name)));
            (conn, rx)
        }

        async fn run(&self, conn: &ClientConnection, name: &str, frames: Vec<Frame>) -> CloseReason {
            relay_loop(
                stream::iter(frames),
                conn,
                &ident(name),
                &self.dispatcher,
                &self.shutdown,
            )
            .await
        }
    }

    fn ident(name: &str) -> Identity {
        Identity::parse(name).unwrap()
    }

    fn text(s: &str) -> Frame {
        Ok(Message::Text(s.to_owned().into()))
    }

    fn drain(rx: &mut mpsc::Receiver<Arc<String>>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(serde_json::from_str(&frame).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn ping_is_answered_then_stream_ends() {
        let h = Harness::new();
        let (conn, mut rx) = h.join("alice");

        let reason = h
            .run(&conn, "alice", vec![text(r#"{"event":"ping","data":{"x":1}}"#)])
            .await;
        assert_eq!(reason, CloseReason::StreamEnded);
        assert_eq!(drain(&mut rx), vec![json!({"event": "pong", "data": {"x": 1}})]);
    }

    #[tokio::test]
    async fn call_is_forwarded_to_callee() {
        let h = Harness::new();
        let (alice, _rx_alice) = h.join("alice");
        let (_bob, mut rx_bob) = h.join("bob");

        let _ = h
            .run(
                &alice,
                "alice",
                vec![text(r#"{"event":"call","calleeId":"bob","rtcMessage":{"sdp":"o"}}"#)],
            )
            .await;
        assert_eq!(
            drain(&mut rx_bob),
            vec![json!({"event": "newCall", "data": {"callerId": "alice", "rtcMessage": {"sdp": "o"}}})]
        );
    }

    #[tokio::test]
    async fn frames_are_handled_in_order() {
        let h = Harness::new();
        let (conn, mut rx) = h.join("alice");

        let frames = (0..5)
            .map(|i| text(&format!(r#"{{"event":"ping","data":{i}}}"#)))
            .collect();
        let _ = h.run(&conn, "alice", frames).await;
        let data: Vec<Value> = drain(&mut rx).into_iter().map(|v| v["data"].clone()).collect();
        assert_eq!(data, vec![json!(0), json!(1), json!(2), json!(3), json!(4)]);
    }

    #[tokio::test]
    async fn malformed_frame_closes_without_processing_rest() {
        let h = Harness::new();
        let (conn, mut rx) = h.join("alice");

        let reason = h
            .run(
                &conn,
                "alice",
                vec![text("not json"), text(r#"{"event":"ping","data":1}"#)],
            )
            .await;
        assert!(matches!(reason, CloseReason::ProtocolViolation(_)));
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn non_fatal_errors_keep_reading() {
        let h = Harness::new();
        let (conn, mut rx) = h.join("alice");

        let reason = h
            .run(
                &conn,
                "alice",
                vec![
                    text(r#"{"event":"call","rtcMessage":{}}"#),
                    text(r#"{"event":"dance"}"#),
                    text(r#"{"calleeId":"bob"}"#),
                    text(r#"{"event":"ping","data":"still here"}"#),
                ],
            )
            .await;
        assert_eq!(reason, CloseReason::StreamEnded);
        assert_eq!(
            drain(&mut rx),
            vec![json!({"event": "pong", "data": "still here"})]
        );
    }

    #[tokio::test]
    async fn close_frame_stops_loop() {
        let h = Harness::new();
        let (conn, mut rx) = h.join("alice");

        let reason = h
            .run(
                &conn,
                "alice",
                vec![Ok(Message::Close(None)), text(r#"{"event":"ping","data":1}"#)],
            )
            .await;
        assert_eq!(reason, CloseReason::PeerClosed);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn transport_error_stops_loop() {
        let h = Harness::new();
        let (conn, _rx) = h.join("alice");

        let reason = h
            .run(
                &conn,
                "alice",
                vec![Err(std::io::Error::other("connection reset"))],
            )
            .await;
        assert_eq!(reason, CloseReason::Transport("connection reset".into()));
    }

    #[tokio::test]
    async fn utf8_binary_frame_is_accepted() {
        let h = Harness::new();
        let (conn, mut rx) = h.join("alice");

        let frame = Ok(Message::Binary(br#"{"event":"ping","data":2}"#.to_vec().into()));
        let _ = h.run(&conn, "alice", vec![frame]).await;
        assert_eq!(drain(&mut rx), vec![json!({"event": "pong", "data": 2})]);
    }

    #[tokio::test]
    async fn non_utf8_binary_frame_is_a_violation() {
        let h = Harness::new();
        let (conn, _rx) = h.join("alice");

        let frame = Ok(Message::Binary(vec![0xff, 0xfe, 0x00].into()));
        let reason = h.run(&conn, "alice", vec![frame]).await;
        assert_eq!(reason.label(), "protocol_violation");
    }

    #[tokio::test]
    async fn control_frames_are_ignored() {
        let h = Harness::new();
        let (conn, mut rx) = h.join("alice");

        let reason = h
            .run(
                &conn,
                "alice",
                vec![
                    Ok(Message::Ping(Vec::new().into())),
                    Ok(Message::Pong(Vec::new().into())),
                    text(r#"{"event":"ping","data":null}"#),
                ],
            )
            .await;
        assert_eq!(reason, CloseReason::StreamEnded);
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn shutdown_ends_idle_loop() {
        let h = Harness::new();
        let (conn, _rx) = h.join("alice");
        h.shutdown.cancel();

        let reason = relay_loop(
            stream::pending::<Frame>(),
            &conn,
            &ident("alice"),
            &h.dispatcher,
            &h.shutdown,
        )
        .await;
        assert_eq!(reason, CloseReason::Shutdown);
    }

    #[test]
    fn close_reason_display() {
        assert_eq!(CloseReason::PeerClosed.to_string(), "peer_closed");
        assert_eq!(
            CloseReason::ProtocolViolation("bad".into()).to_string(),
            "protocol_violation: bad"
        );
    }
}
