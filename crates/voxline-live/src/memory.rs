//! In-process loopback transport for tests and offline runs.
//!
//! Every successful [`MemoryConnector::open`] produces a [`MemoryPeer`]: the
//! service side of the connection. Peers are either handed out through the
//! receiver returned by [`MemoryConnector::new`], or served by a built-in
//! echo service ([`MemoryConnector::echo`]).

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::channel::mpsc as fmpsc;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use voxline_core::error::{Result, VoxlineError};

use crate::transport::{Connector, WireFrame, WireSink, WireStream};

enum Mode {
    Accept(mpsc::UnboundedSender<MemoryPeer>),
    Echo,
    Refuse(String),
    Hang,
}

/// Loopback [`Connector`].
pub struct MemoryConnector {
    mode: Mode,
    opens: AtomicUsize,
}

impl MemoryConnector {
    /// Accept every open and hand the service side to the returned receiver.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::with_mode(Mode::Accept(tx)), rx)
    }

    /// Accept every open and serve it with [`MemoryPeer::serve_echo`].
    pub fn echo() -> Self {
        Self::with_mode(Mode::Echo)
    }

    /// Fail every open with a transport error.
    pub fn refusing(reason: impl Into<String>) -> Self {
        Self::with_mode(Mode::Refuse(reason.into()))
    }

    /// Never complete an open (exercises the connect timeout).
    pub fn hanging() -> Self {
        Self::with_mode(Mode::Hang)
    }

    fn with_mode(mode: Mode) -> Self {
        Self {
            mode,
            opens: AtomicUsize::new(0),
        }
    }

    /// Number of transport opens attempted so far.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, url: &str) -> Result<(WireSink, WireStream)> {
        self.opens.fetch_add(1, Ordering::SeqCst);

        match &self.mode {
            Mode::Refuse(reason) => return Err(VoxlineError::Transport(reason.clone())),
            Mode::Hang => std::future::pending::<()>().await,
            Mode::Accept(_) | Mode::Echo => {}
        }

        let (client_tx, peer_rx) = fmpsc::unbounded::<WireFrame>();
        let (peer_tx, client_rx) = mpsc::unbounded_channel::<Result<WireFrame>>();

        let peer = MemoryPeer {
            url: url.to_string(),
            outbound: peer_rx,
            inbound: peer_tx,
        };

        match &self.mode {
            Mode::Accept(peers) => {
                peers
                    .send(peer)
                    .map_err(|_| VoxlineError::Transport("memory service is gone".into()))?;
            }
            _ => {
                tokio::spawn(peer.serve_echo());
            }
        }

        let sink = client_tx.sink_map_err(|e| VoxlineError::Transport(e.to_string()));
        let stream = UnboundedReceiverStream::new(client_rx);
        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

/// Service side of one loopback connection.
pub struct MemoryPeer {
    url: String,
    outbound: fmpsc::UnboundedReceiver<WireFrame>,
    inbound: mpsc::UnboundedSender<Result<WireFrame>>,
}

impl MemoryPeer {
    /// URL the client opened (includes the credential).
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Next frame written by the client; `None` once the client dropped its sink.
    pub async fn recv(&mut self) -> Option<WireFrame> {
        self.outbound.next().await
    }

    /// Next structured frame from the client, parsed. `None` on close or end of stream.
    pub async fn recv_json(&mut self) -> Option<Value> {
        loop {
            match self.recv().await? {
                WireFrame::Text(text) => return serde_json::from_str(&text).ok(),
                WireFrame::Binary(_) => continue,
                WireFrame::Close => return None,
            }
        }
    }

    /// Consume the setup envelope and acknowledge it. Returns the setup envelope.
    pub async fn complete_setup(&mut self) -> Option<Value> {
        let setup = self.recv_json().await?;
        self.send_json(&json!({ "setupComplete": {} }));
        Some(setup)
    }

    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self.inbound.send(Ok(WireFrame::Text(text.into())));
    }

    pub fn send_json(&self, value: &Value) {
        self.send_text(value.to_string());
    }

    pub fn send_binary(&self, bytes: Vec<u8>) {
        let _ = self.inbound.send(Ok(WireFrame::Binary(bytes)));
    }

    /// Confirm or initiate closure.
    pub fn close(&self) {
        let _ = self.inbound.send(Ok(WireFrame::Close));
    }

    /// Break the connection with a transport error.
    pub fn fail(&self, reason: impl Into<String>) {
        let _ = self.inbound.send(Err(VoxlineError::Transport(reason.into())));
    }

    /// Echo service: acknowledges setup, answers each text turn with the same
    /// text, returns each audio chunk as a binary frame, and confirms close.
    pub async fn serve_echo(mut self) {
        while let Some(frame) = self.recv().await {
            match frame {
                WireFrame::Close => {
                    self.close();
                    break;
                }
                WireFrame::Binary(bytes) => self.send_binary(bytes),
                WireFrame::Text(text) => {
                    let Ok(value) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };
                    if value.get("setup").is_some() {
                        self.send_json(&json!({ "setupComplete": {} }));
                    } else if let Some(turn) = value.pointer("/clientContent/turns/0/parts/0/text") {
                        self.send_json(&json!({
                            "serverContent": { "modelTurn": { "parts": [{ "text": turn }] } }
                        }));
                    } else if let Some(data) = value
                        .pointer("/realtimeInput/mediaChunks/0/data")
                        .and_then(Value::as_str)
                    {
                        if let Ok(bytes) = STANDARD.decode(data) {
                            self.send_binary(bytes);
                        }
                    }
                }
            }
        }
        debug!("memory echo service finished");
    }
}
