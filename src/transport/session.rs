//! One authenticated WebSocket session per chat identity.
//!
//! `StreamSession::open` resolves the credential, dials, and hands back an
//! owned [`SessionHandle`] plus the event receiver. Failures materialize as
//! events on the receiver, never as an `Err`, and there is no automatic
//! reconnection: policy lives with the caller.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, info, trace, warn};

use crate::auth::TokenProvider;
use crate::core::config::StreamConfig;
use crate::transport::frames::{self, FrameDecoder, StreamEvent};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const OUTBOUND_CHANNEL_CAPACITY: usize = 64;

/// Reason attached to client-initiated close frames.
const CLOSE_REASON: &str = "client disconnect";

/// Owned handle to one live streaming session.
///
/// All senders are best-effort and never block: a frame is dropped, with a
/// log line, when the queue is full or the session is closed. The close
/// signal bypasses the queue entirely.
#[derive(Debug)]
pub struct SessionHandle {
    outbound: mpsc::Sender<String>,
    shutdown: watch::Sender<bool>,
    connected: watch::Receiver<bool>,
}

impl SessionHandle {
    /// Whether the session currently has a connected socket.
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.connected.borrow()
    }

    /// Observable connection state; flips to `true` after the handshake
    /// and back to `false` when the session ends.
    #[must_use]
    pub fn connected(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }

    /// Queue a raw text frame; dropped when the queue is full or closed.
    pub fn send_raw(&self, frame: String) {
        match self.outbound.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("Outbound queue full; dropping frame");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Streaming session closed; dropping frame");
            }
        }
    }

    /// Queue a `chat_message` frame carrying user text.
    pub fn send_chat_message(&self, text: &str, conversation_id: Option<&str>, stream: bool) {
        self.send_raw(frames::chat_message_frame(text, conversation_id, stream));
    }

    /// Tell the server the user started composing.
    pub fn send_typing_start(&self) {
        self.send_raw(frames::typing_frame(true));
    }

    /// Tell the server the user stopped composing.
    pub fn send_typing_stop(&self) {
        self.send_raw(frames::typing_frame(false));
    }

    /// Queue a keepalive ping.
    pub fn send_ping(&self) {
        self.send_raw(frames::ping_frame());
    }

    /// Close the session with a normal-closure frame. The signal goes
    /// around the outbound queue, so it reaches the writer even when the
    /// queue is full. Safe to call on an already closed session.
    pub fn close(&self) {
        if self.shutdown.send(true).is_err() {
            debug!("Streaming session already closed");
        }
    }
}

/// Opener for streaming sessions.
pub struct StreamSession;

impl StreamSession {
    /// Open a session for `identity`.
    ///
    /// Resolves the access credential first; when none is available the
    /// receiver yields one terminal `Error` event and closes without any
    /// dial attempt. The credential travels as the `token` query parameter
    /// and is elided from every log line.
    pub async fn open(
        config: &StreamConfig,
        identity: &str,
        tokens: Arc<dyn TokenProvider>,
    ) -> (SessionHandle, mpsc::Receiver<StreamEvent>) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (connected_tx, connected_rx) = watch::channel(false);

        let handle = SessionHandle {
            outbound: outbound_tx,
            shutdown: shutdown_tx,
            connected: connected_rx,
        };

        let Some(token) = tokens.access_token().await else {
            warn!("Cannot open streaming session for {identity}: no access token");
            let _ = event_tx
                .send(StreamEvent::Error("No access token available".to_string()))
                .await;
            return (handle, event_rx);
        };

        // Token goes in the query string, never the path.
        let url = format!("{}?token={}", config.url, token.as_str());
        info!(
            "Streaming session for {identity} connecting to {}?token=***",
            config.url
        );

        tokio::spawn(run_session(
            url,
            event_tx,
            outbound_rx,
            shutdown_rx,
            connected_tx,
        ));

        (handle, event_rx)
    }
}

async fn run_session(
    url: String,
    events: mpsc::Sender<StreamEvent>,
    mut outbound: mpsc::Receiver<String>,
    mut shutdown: watch::Receiver<bool>,
    connected: watch::Sender<bool>,
) {
    let stream = match connect_async(url.as_str()).await {
        Ok((stream, response)) => {
            debug!("Streaming handshake completed: {:?}", response.status());
            stream
        }
        Err(err) => {
            warn!("Streaming handshake failed: {err}");
            let _ = events
                .send(StreamEvent::Error(format!("Connection failed: {err}")))
                .await;
            let _ = events.send(StreamEvent::Disconnected).await;
            return;
        }
    };

    let _ = connected.send(true);
    let _ = events.send(StreamEvent::Connected).await;

    let (mut sink, mut source) = stream.split();

    // Writer task: drains queued frames. The shutdown watch bypasses the
    // queue, so close() lands even when the queue is backed up behind a
    // stalled peer. Dropping the handle counts as close(). Biased toward
    // the queue: frames accepted before close() still go out.
    tokio::spawn(async move {
        let say_goodbye = loop {
            tokio::select! {
                biased;
                item = outbound.recv() => match item {
                    Some(text) => {
                        trace!("Outbound frame: {text}");
                        if let Err(err) = sink.send(Message::Text(text)).await {
                            warn!("Failed to send frame: {err}");
                            break false;
                        }
                    }
                    None => break true,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break true;
                    }
                }
            }
        };
        if say_goodbye {
            debug!("Closing streaming session");
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: CLOSE_REASON.into(),
            };
            if let Err(err) = sink.send(Message::Close(Some(frame))).await {
                debug!("Close frame not delivered: {err}");
            }
        }
    });

    // Reader loop: decodes text frames until the socket ends. Ping/pong
    // replies happen inside the WebSocket layer.
    let mut decoder = FrameDecoder::new();
    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                trace!("Inbound frame: {text}");
                if let Some(event) = decoder.decode(&text) {
                    if events.send(event).await.is_err() {
                        debug!("Event receiver dropped; ending session reader");
                        let _ = connected.send(false);
                        return;
                    }
                }
            }
            Ok(Message::Close(frame)) => {
                info!("Streaming session closed by server: {frame:?}");
                break;
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {
                trace!("Control frame");
            }
            Ok(other) => {
                trace!("Ignoring non-text frame: {other:?}");
            }
            Err(err) => {
                warn!("Streaming transport error: {err}");
                let _ = events
                    .send(StreamEvent::Error(format!("Transport error: {err}")))
                    .await;
                break;
            }
        }
    }

    let _ = connected.send(false);
    let _ = events.send(StreamEvent::Disconnected).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenProvider;
    use crate::core::ids::StreamId;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    /// One-shot scripted server: sends `frames`, then records inbound text
    /// frames until the client closes.
    async fn scripted_server(
        frames: Vec<String>,
    ) -> (StreamConfig, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            for frame in frames {
                ws.send(Message::Text(frame)).await.unwrap();
            }
            let mut seen = Vec::new();
            while let Some(Ok(message)) = ws.next().await {
                match message {
                    Message::Text(text) => seen.push(text),
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            // Complete the close handshake before dropping the socket, so
            // the client sees a clean close instead of a reset. Sink::close
            // (not the inherent close) flushes the queued close reply.
            let _ = SinkExt::close(&mut ws).await;
            seen
        });
        let config = StreamConfig {
            url: format!("ws://{addr}/"),
            request_streaming: true,
        };
        (config, server)
    }

    #[tokio::test]
    async fn test_delivers_decoded_events_in_order() {
        let (config, server) = scripted_server(vec![
            r#"{"type":"ai_typing","data":{"is_typing":true}}"#.to_string(),
            r#"{"type":"stream_start","data":{"stream_id":"s1"}}"#.to_string(),
        ])
        .await;
        let tokens = Arc::new(StaticTokenProvider::new("tok"));
        let (handle, mut events) = StreamSession::open(&config, "tester", tokens).await;

        assert_eq!(events.recv().await, Some(StreamEvent::Connected));
        assert!(handle.is_open());
        assert_eq!(events.recv().await, Some(StreamEvent::AiTyping(true)));
        assert_eq!(
            events.recv().await,
            Some(StreamEvent::StreamStart(StreamId::from_raw("s1")))
        );

        handle.close();
        assert_eq!(events.recv().await, Some(StreamEvent::Disconnected));
        assert_eq!(events.recv().await, None);
        assert!(!handle.is_open());
        assert!(server.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_outbound_frames_reach_the_server() {
        let (config, server) = scripted_server(Vec::new()).await;
        let tokens = Arc::new(StaticTokenProvider::new("tok"));
        let (handle, mut events) = StreamSession::open(&config, "tester", tokens).await;
        assert_eq!(events.recv().await, Some(StreamEvent::Connected));

        handle.send_chat_message("hi", Some("c1"), true);
        handle.send_typing_start();
        handle.send_ping();
        handle.close();
        while events.recv().await.is_some() {}

        let seen = server.await.unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen[0].contains(r#""type":"chat_message""#));
        assert!(seen[0].contains(r#""conversation_id":"c1""#));
        assert!(seen[1].contains("typing_start"));
        assert!(seen[2].contains("ping"));
    }

    #[tokio::test]
    async fn test_missing_token_is_a_terminal_error() {
        let config = StreamConfig::default();
        let tokens = Arc::new(StaticTokenProvider::signed_out());
        let (handle, mut events) = StreamSession::open(&config, "tester", tokens).await;

        assert_eq!(
            events.recv().await,
            Some(StreamEvent::Error("No access token available".to_string()))
        );
        assert_eq!(events.recv().await, None);
        assert!(!handle.is_open());
        // Sends against the never-opened session are logged no-ops.
        handle.send_ping();
        handle.close();
    }

    #[tokio::test]
    async fn test_failed_handshake_reports_error_then_disconnected() {
        // Bind then drop so the port actively refuses the dial.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = StreamConfig {
            url: format!("ws://{addr}"),
            request_streaming: true,
        };
        let tokens = Arc::new(StaticTokenProvider::new("tok"));
        let (_handle, mut events) = StreamSession::open(&config, "tester", tokens).await;

        match events.recv().await {
            Some(StreamEvent::Error(message)) => {
                assert!(message.starts_with("Connection failed:"));
            }
            other => panic!("expected a connection error, got {other:?}"),
        }
        assert_eq!(events.recv().await, Some(StreamEvent::Disconnected));
        assert_eq!(events.recv().await, None);
    }
}
