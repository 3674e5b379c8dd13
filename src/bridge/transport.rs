//! Duplex socket transport
//!
//! The connection layer talks to the peer through the [`Transport`] trait. The
//! production implementation is [`WebSocketTransport`]: JSON text frames of the form
//! `{"event": ..., "data": ...}` over a WebSocket, with one writer task owning the
//! sink and one reader task forwarding inbound frames.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use super::auth::AUTH_HEADER;
use super::envelope::Frame;
use crate::error::{BridgeError, ErrorCode};
use crate::{Error, Result};

/// Connection parameters handed to [`Transport::connect`]
#[derive(Clone)]
pub struct Handshake {
    pub endpoint: String,
    pub auth_token: Option<String>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the channel and start forwarding inbound frames to `inbound`.
    /// Dropping the sender side signals that the channel closed.
    async fn connect(&self, handshake: &Handshake, inbound: mpsc::UnboundedSender<Frame>) -> Result<()>;

    async fn emit(&self, frame: Frame) -> Result<()>;

    fn is_connected(&self) -> bool;

    async fn disconnect(&self);
}

struct Session {
    writer: mpsc::Sender<String>,
    reader_handle: JoinHandle<()>,
    writer_handle: JoinHandle<()>,
}

/// WebSocket transport backed by tokio-tungstenite
#[derive(Default)]
pub struct WebSocketTransport {
    connected: Arc<AtomicBool>,
    session: Mutex<Option<Session>>,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

fn map_connect_error(endpoint: &str, error: tokio_tungstenite::tungstenite::Error) -> Error {
    use tokio_tungstenite::tungstenite::Error as WsError;

    if let WsError::Http(response) = &error {
        let status = response.status().as_u16();
        if status == 401 || status == 403 {
            return Error::Bridge(
                BridgeError::new(
                    ErrorCode::Unauthorized,
                    format!("Bridge at {endpoint} rejected the handshake token (HTTP {status})."),
                )
                .recoverable(false)
                .with_hint("Check MAXBRIDGE_AUTH_TOKEN or the token file against the bridge's token.")
                .with_detail("endpoint", endpoint)
                .with_detail("status", status),
            );
        }
    }
    Error::Transport(format!("Failed to connect to {endpoint}: {error}"))
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, handshake: &Handshake, inbound: mpsc::UnboundedSender<Frame>) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        let mut request = handshake
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| Error::Transport(format!("Invalid endpoint {}: {}", handshake.endpoint, e)))?;
        if let Some(token) = &handshake.auth_token {
            let value = HeaderValue::from_str(token)
                .map_err(|e| Error::Transport(format!("Invalid auth token header: {}", e)))?;
            request.headers_mut().insert(AUTH_HEADER, value);
        }

        let (ws_stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| map_connect_error(&handshake.endpoint, e))?;
        let (mut ws_sink, mut ws_read) = ws_stream.split();

        let (writer_tx, mut writer_rx) = mpsc::channel::<String>(256);

        let connected = self.connected.clone();
        let writer_handle = tokio::spawn(async move {
            while let Some(text) = writer_rx.recv().await {
                if let Err(e) = ws_sink.send(Message::Text(text)).await {
                    tracing::error!("Bridge WebSocket write error: {}", e);
                    connected.store(false, Ordering::SeqCst);
                    break;
                }
            }
            let _ = ws_sink.close().await;
        });

        let connected = self.connected.clone();
        let reader_handle = tokio::spawn(async move {
            while let Some(message) = ws_read.next().await {
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str::<Frame>(&text) {
                        Ok(frame) => {
                            if inbound.send(frame).is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!("Ignoring malformed bridge frame: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("Bridge WebSocket closed by peer");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("Bridge WebSocket read error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            connected.store(false, Ordering::SeqCst);
        });

        // Auth handshake frame before anything else
        let hello = Frame::new(
            "handshake",
            serde_json::json!({
                "protocol_version": super::envelope::PROTOCOL_VERSION,
                "auth": {"token": handshake.auth_token},
            }),
        );
        let text = serde_json::to_string(&hello)?;
        writer_tx
            .send(text)
            .await
            .map_err(|_| Error::Transport("Bridge writer closed during handshake".to_string()))?;

        self.connected.store(true, Ordering::SeqCst);
        *self.session.lock() = Some(Session {
            writer: writer_tx,
            reader_handle,
            writer_handle,
        });
        tracing::info!("Connected to bridge at {}", handshake.endpoint);
        Ok(())
    }

    async fn emit(&self, frame: Frame) -> Result<()> {
        let writer = self
            .session
            .lock()
            .as_ref()
            .map(|s| s.writer.clone())
            .ok_or_else(|| Error::Transport("Bridge is not connected".to_string()))?;
        let text = serde_json::to_string(&frame)?;
        writer
            .send(text)
            .await
            .map_err(|_| Error::Transport("Bridge writer task has stopped".to_string()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        let session = self.session.lock().take();
        self.connected.store(false, Ordering::SeqCst);
        if let Some(session) = session {
            // Dropping the writer lets the writer task close the sink
            drop(session.writer);
            let _ = tokio::time::timeout(std::time::Duration::from_secs(2), session.writer_handle).await;
            session.reader_handle.abort();
            tracing::info!("Disconnected from bridge");
        }
    }
}
