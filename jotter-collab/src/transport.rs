//! Pluggable session transport.
//!
//! The supervisor is written against [`SessionTransport`] so that the
//! connection state machine can be exercised without a network; the default
//! implementation, [`WebSocketTransport`], speaks WebSocket via
//! tokio-tungstenite.
//!
//! A transport link is a pair of channels: frames out, events in. Close
//! frames are mapped to [`TransportEvent::Closed`] with the server-provided
//! code and reason; a stream that ends without a close frame reports
//! [`CLOSE_ABNORMAL`](crate::protocol::CLOSE_ABNORMAL).

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{CLOSE_ABNORMAL, CLOSE_NORMAL};

/// Inbound transport events.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A binary protocol frame.
    Frame(Vec<u8>),
    /// The connection closed, gracefully or not.
    Closed { code: u16, reason: String },
}

/// A live, bidirectional connection to the collaboration server.
pub struct TransportLink {
    /// Frames to the server.
    pub outgoing: mpsc::Sender<Vec<u8>>,
    /// Frames and lifecycle events from the server.
    pub incoming: mpsc::Receiver<TransportEvent>,
}

/// Transport-level connection failure.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportError(pub String);

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "transport error: {}", self.0)
    }
}

impl std::error::Error for TransportError {}

/// Strategy interface for opening a session connection.
pub trait SessionTransport: Send + Sync {
    /// Open a connection to `session` at `url`.
    ///
    /// Resolves once the underlying connection is established; the protocol
    /// handshake happens on top of the returned link.
    fn open(
        &self,
        url: &str,
        session: &str,
    ) -> BoxFuture<'static, Result<TransportLink, TransportError>>;
}

/// Default WebSocket transport.
pub struct WebSocketTransport;

impl SessionTransport for WebSocketTransport {
    fn open(
        &self,
        url: &str,
        session: &str,
    ) -> BoxFuture<'static, Result<TransportLink, TransportError>> {
        let target = format!("{}/{}", url.trim_end_matches('/'), session);
        Box::pin(async move {
            let (ws_stream, _) = tokio_tungstenite::connect_async(&target)
                .await
                .map_err(|e| TransportError(e.to_string()))?;
            log::debug!("websocket open: {target}");

            let (mut ws_writer, mut ws_reader) = ws_stream.split();
            let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
            let (in_tx, in_rx) = mpsc::channel::<TransportEvent>(256);

            // Writer task: forward the outgoing channel to the socket.
            tokio::spawn(async move {
                while let Some(data) = out_rx.recv().await {
                    if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                        break;
                    }
                }
            });

            // Reader task: surface frames and the close handshake.
            tokio::spawn(async move {
                while let Some(msg) = ws_reader.next().await {
                    match msg {
                        Ok(Message::Binary(data)) => {
                            let bytes: Vec<u8> = data.into();
                            if in_tx.send(TransportEvent::Frame(bytes)).await.is_err() {
                                return;
                            }
                        }
                        Ok(Message::Close(frame)) => {
                            let (code, reason) = match frame {
                                Some(f) => (u16::from(f.code), f.reason.to_string()),
                                None => (CLOSE_NORMAL, String::new()),
                            };
                            let _ = in_tx.send(TransportEvent::Closed { code, reason }).await;
                            return;
                        }
                        Ok(_) => {}
                        Err(_) => break,
                    }
                }
                let _ = in_tx
                    .send(TransportEvent::Closed {
                        code: CLOSE_ABNORMAL,
                        reason: String::new(),
                    })
                    .await;
            });

            Ok(TransportLink {
                outgoing: out_tx,
                incoming: in_rx,
            })
        })
    }
}
