//! Transport seam: a connector opens a sink/stream pair of [`WireFrame`]s.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use voxline_core::error::{Result, VoxlineError};

/// One frame on the persistent connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    /// Structured JSON envelope.
    Text(String),
    /// Raw PCM audio.
    Binary(Vec<u8>),
    Close,
}

pub type WireSink = Pin<Box<dyn Sink<WireFrame, Error = VoxlineError> + Send>>;
pub type WireStream = Pin<Box<dyn Stream<Item = Result<WireFrame>> + Send>>;

/// Opens the persistent connection for a session.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection to `url`. The URL carries the credential and must not be logged.
    async fn open(&self, url: &str) -> Result<(WireSink, WireStream)>;
}

/// WebSocket transport (tokio-tungstenite, rustls for `wss://`).
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, url: &str) -> Result<(WireSink, WireStream)> {
        let (ws, response) = connect_async(url)
            .await
            .map_err(|e| VoxlineError::Transport(e.to_string()))?;
        debug!(status = %response.status(), "WebSocket handshake complete");

        let (sink, stream) = ws.split();

        let sink = sink
            .sink_map_err(|e| VoxlineError::Transport(e.to_string()))
            .with(|frame: WireFrame| {
                futures::future::ready(Ok::<_, VoxlineError>(match frame {
                    WireFrame::Text(text) => Message::Text(text.into()),
                    WireFrame::Binary(bytes) => Message::Binary(bytes.into()),
                    WireFrame::Close => Message::Close(None),
                }))
            });

        let stream = stream.filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(text)) => Some(Ok(WireFrame::Text(text.as_str().to_owned()))),
                Ok(Message::Binary(bytes)) => Some(Ok(WireFrame::Binary(bytes.to_vec()))),
                Ok(Message::Close(_)) => Some(Ok(WireFrame::Close)),
                // Ping/pong are answered by tungstenite itself
                Ok(_) => None,
                Err(e) => Some(Err(VoxlineError::Transport(e.to_string()))),
            }
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

/// Append the credential to the endpoint as the `key` query parameter.
pub fn session_url(endpoint: &str, credential: &str) -> String {
    let sep = if endpoint.contains('?') { '&' } else { '?' };
    format!("{endpoint}{sep}key={credential}")
}

/// Replace every occurrence of the credential in `text`.
pub fn redact(text: &str, credential: &str) -> String {
    if credential.is_empty() {
        return text.to_string();
    }
    text.replace(credential, "***")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_url() {
        assert_eq!(
            session_url("wss://host/path", "abc"),
            "wss://host/path?key=abc"
        );
        assert_eq!(
            session_url("wss://host/path?alt=json", "abc"),
            "wss://host/path?alt=json&key=abc"
        );
    }

    #[test]
    fn test_redact() {
        let url = session_url("wss://host/path", "secret-key");
        assert_eq!(redact(&url, "secret-key"), "wss://host/path?key=***");
        assert_eq!(redact("nothing here", ""), "nothing here");
    }

    #[tokio::test]
    async fn test_websocket_refused_is_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = WebSocketConnector
            .open(&format!("ws://127.0.0.1:{port}/ws?key=k"))
            .await;
        assert!(matches!(result, Err(VoxlineError::Transport(_))));
    }
}
