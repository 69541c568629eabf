//! One persistent connection to the live service.
//!
//! Outbound audio and text each have their own FIFO queue and worker. Workers
//! hold their frames until the session is Active. A single writer task owns
//! the transport sink, so envelopes never interleave on the wire. The reader
//! task turns inbound frames into [`SessionEvent`]s on one ordered channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use futures::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use voxline_core::config::LiveConfig;
use voxline_core::error::{Result, VoxlineError};
use voxline_core::protocol::{ClientMessage, ServerSignal, parse_server_message};
use voxline_core::types::{AudioFrame, SessionEvent};

use crate::state::SessionState;
use crate::transport::{Connector, WireFrame, WireSink, WireStream, redact, session_url};

/// Log one warning per this many shed audio frames.
const SHED_WARN_EVERY: u64 = 250;

/// A one-shot streaming session.
///
/// Created with [`StreamingSession::new`], which also returns the receiver for
/// every [`SessionEvent`] the session produces. Dropping the session aborts
/// its background tasks; call [`disconnect`](Self::disconnect) for an orderly close.
pub struct StreamingSession {
    shared: Arc<Shared>,
}

struct Shared {
    config: LiveConfig,
    connector: Arc<dyn Connector>,
    state: watch::Sender<SessionState>,
    events: mpsc::UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
    /// Set once `Connected` has been emitted.
    announced: AtomicBool,
    audio_tx: mpsc::UnboundedSender<AudioFrame>,
    text_tx: mpsc::UnboundedSender<String>,
    queued_audio: AtomicUsize,
    shed_audio: AtomicU64,
    /// Queue receivers, taken by the workers on connect.
    queues: Mutex<Option<Queues>>,
    wire: Mutex<Option<mpsc::UnboundedSender<WireFrame>>>,
    tasks: Mutex<Tasks>,
}

struct Queues {
    audio: mpsc::UnboundedReceiver<AudioFrame>,
    text: mpsc::UnboundedReceiver<String>,
}

#[derive(Default)]
struct Tasks {
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl Tasks {
    fn abort_all(&mut self) {
        for handle in self
            .reader
            .take()
            .into_iter()
            .chain(self.writer.take())
            .chain(self.workers.drain(..))
        {
            handle.abort();
        }
    }
}

impl StreamingSession {
    pub fn new(
        config: LiveConfig,
        connector: Arc<dyn Connector>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (audio_tx, audio) = mpsc::unbounded_channel();
        let (text_tx, text) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(SessionState::Disconnected);

        let shared = Arc::new(Shared {
            config,
            connector,
            state,
            events,
            cancel: CancellationToken::new(),
            announced: AtomicBool::new(false),
            audio_tx,
            text_tx,
            queued_audio: AtomicUsize::new(0),
            shed_audio: AtomicU64::new(0),
            queues: Mutex::new(Some(Queues { audio, text })),
            wire: Mutex::new(None),
            tasks: Mutex::new(Tasks::default()),
        });

        (Self { shared }, events_rx)
    }

    /// Current connection state.
    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Outbound audio frames waiting for the wire.
    pub fn queued_audio_frames(&self) -> usize {
        self.shared.queued_audio.load(Ordering::SeqCst)
    }

    /// Wait until the service acknowledged setup. Fails if the session closes first.
    ///
    /// Waits indefinitely on a session that was never connected.
    pub async fn wait_until_active(&self) -> Result<()> {
        let mut rx = self.shared.state.subscribe();
        let state = rx
            .wait_for(|s| *s == SessionState::Active || s.is_closing())
            .await
            .map(|s| *s)
            .map_err(|_| VoxlineError::Closed)?;
        if state == SessionState::Active {
            Ok(())
        } else {
            Err(VoxlineError::Closed)
        }
    }

    /// Open the transport, send the setup envelope and emit `Connected`.
    ///
    /// An empty credential fails with a configuration error before any
    /// transport is opened. Connecting a live session is a no-op; connecting
    /// a closed one is an error.
    pub async fn connect(&self, credential: &str) -> Result<()> {
        let shared = &self.shared;
        let credential = credential.trim();
        if credential.is_empty() {
            let message = "credential is missing or empty".to_string();
            error!("Cannot connect live session: {message}");
            shared.emit(SessionEvent::ConfigurationError(message.clone()));
            return Err(VoxlineError::Configuration(message));
        }

        let setup = ClientMessage::setup(
            &shared.config.model,
            &shared.config.voice,
            &shared.config.system_instruction,
        )
        .to_json()?;

        let mut previous = SessionState::Disconnected;
        let claimed = shared.state.send_if_modified(|state| {
            previous = *state;
            if *state == SessionState::Disconnected {
                *state = SessionState::Connecting;
                true
            } else {
                false
            }
        });
        if !claimed {
            if previous.is_closing() {
                return Err(VoxlineError::Closed);
            }
            warn!(state = %previous, "connect called on a live session; ignoring");
            return Ok(());
        }

        info!(
            endpoint = %shared.config.endpoint,
            model = %shared.config.model,
            "Connecting to live service"
        );
        let url = session_url(&shared.config.endpoint, credential);
        let timeout = shared.config.connect_timeout();
        let (mut sink, stream) =
            match tokio::time::timeout(timeout, shared.connector.open(&url)).await {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => {
                    let message = redact(&transport_message(e), credential);
                    return Err(shared.fail_connect(message).await);
                }
                Err(_) => {
                    let message = format!("connect timed out after {}s", timeout.as_secs());
                    return Err(shared.fail_connect(message).await);
                }
            };

        // Held until every task is registered so disconnect() sees a complete set.
        let mut tasks = shared.tasks.lock().await;

        let configured = shared.state.send_if_modified(|state| {
            if *state == SessionState::Connecting {
                *state = SessionState::Configuring;
                true
            } else {
                false
            }
        });
        if !configured {
            debug!("Session closed while the transport was opening");
            let _ = sink.send(WireFrame::Close).await;
            let _ = sink.close().await;
            return Err(VoxlineError::Closed);
        }

        if let Err(e) = sink.send(WireFrame::Text(setup)).await {
            drop(tasks);
            let message = redact(&transport_message(e), credential);
            return Err(shared.fail_connect(message).await);
        }

        shared.announced.store(true, Ordering::SeqCst);
        info!("Live transport open; setup sent");
        shared.emit(SessionEvent::Connected);

        let (wire_tx, wire_rx) = mpsc::unbounded_channel();
        *shared.wire.lock().await = Some(wire_tx.clone());

        tasks.writer = Some(tokio::spawn(write_loop(sink, wire_rx)));
        tasks.reader = Some(tokio::spawn(read_loop(shared.clone(), stream)));
        if let Some(queues) = shared.queues.lock().await.take() {
            tasks.workers.push(tokio::spawn(audio_worker(
                shared.clone(),
                queues.audio,
                wire_tx.clone(),
            )));
            tasks
                .workers
                .push(tokio::spawn(text_worker(shared.clone(), queues.text, wire_tx)));
        }

        Ok(())
    }

    /// Queue one PCM frame. Dropped with a warning unless the session is live.
    pub fn send_audio(&self, frame: AudioFrame) {
        let shared = &self.shared;
        let state = self.state();
        if !state.is_live() {
            warn!(state = %state, bytes = frame.len(), "Dropping outbound audio: session not connected");
            return;
        }

        let max = shared.config.max_queued_audio_frames;
        if max > 0 && shared.queued_audio.load(Ordering::SeqCst) >= max {
            let shed = shared.shed_audio.fetch_add(1, Ordering::SeqCst) + 1;
            if shed % SHED_WARN_EVERY == 1 {
                warn!(shed, max, "Outbound audio queue full; shedding frames");
            }
            return;
        }

        shared.queued_audio.fetch_add(1, Ordering::SeqCst);
        if shared.audio_tx.send(frame).is_err() {
            shared.queued_audio.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Queue one complete user turn. Dropped with a warning unless the session is live.
    pub fn send_text(&self, text: impl Into<String>) {
        let state = self.state();
        if !state.is_live() {
            warn!(state = %state, "Dropping outbound text: session not connected");
            return;
        }
        let _ = self.shared.text_tx.send(text.into());
    }

    /// Close the session. Idempotent, and a no-op on a session that was never
    /// connected, which stays Disconnected and may still connect.
    ///
    /// Queued outbound frames are discarded. Waits up to `close_timeout` for
    /// the service to confirm closure, then emits `Disconnected` (if
    /// `Connected` was emitted).
    pub async fn disconnect(&self) {
        let shared = &self.shared;
        let mut previous = SessionState::Disconnected;
        let claimed = shared.state.send_if_modified(|state| {
            previous = *state;
            if state.is_closing() || *state == SessionState::Disconnected {
                false
            } else {
                *state = SessionState::Closing;
                true
            }
        });
        if !claimed {
            debug!(state = %previous, "disconnect: nothing to close");
            return;
        }

        info!(from = %previous, "Disconnecting live session");
        shared.cancel.cancel();

        let (reader, writer) = {
            let mut tasks = shared.tasks.lock().await;
            if let Some(wire) = shared.wire.lock().await.take() {
                let _ = wire.send(WireFrame::Close);
            }
            (tasks.reader.take(), tasks.writer.take())
        };

        if let Some(mut reader) = reader {
            let close_timeout = shared.config.close_timeout();
            match tokio::time::timeout(close_timeout, &mut reader).await {
                Ok(_) => debug!("Live service confirmed close"),
                Err(_) => {
                    warn!(
                        timeout_ms = shared.config.close_timeout_ms,
                        "No close confirmation from live service; dropping transport"
                    );
                    reader.abort();
                    if let Some(writer) = &writer {
                        writer.abort();
                    }
                }
            }
        }

        shared.finish_closed().await;
    }
}

impl Drop for StreamingSession {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
        if let Ok(mut tasks) = self.shared.tasks.try_lock() {
            tasks.abort_all();
        }
    }
}

impl Shared {
    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn emit(&self, event: SessionEvent) {
        debug!(kind = event.kind(), "Session event");
        let _ = self.events.send(event);
    }

    async fn fail_connect(&self, message: String) -> VoxlineError {
        error!(error = %message, "Live transport failed to open");
        self.emit(SessionEvent::TransportError(message.clone()));
        self.finish_closed().await;
        VoxlineError::Transport(message)
    }

    /// Enter Closed. Emits `Disconnected` exactly once, and only after `Connected`.
    async fn finish_closed(&self) {
        self.cancel.cancel();
        self.wire.lock().await.take();
        let closed = self.state.send_if_modified(|state| {
            if *state == SessionState::Closed {
                false
            } else {
                *state = SessionState::Closed;
                true
            }
        });
        if closed {
            info!("Live session closed");
            if self.announced.load(Ordering::SeqCst) {
                self.emit(SessionEvent::Disconnected);
            }
        }
    }

    /// Resolves true once Active, false if the session closes first.
    async fn wait_for_active(&self) -> bool {
        let mut rx = self.state.subscribe();
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            state = rx.wait_for(|s| *s == SessionState::Active || s.is_closing()) => {
                state.map(|s| *s == SessionState::Active).unwrap_or(false)
            }
        }
    }

    fn dispatch(&self, text: &str) {
        let signals = match parse_server_message(text) {
            Ok(signals) => signals,
            Err(e) => {
                warn!(error = %e, bytes = text.len(), "Unparseable message from live service");
                self.emit(SessionEvent::ProtocolError(e.to_string()));
                return;
            }
        };

        if signals.is_empty() {
            debug!("Ignoring message without recognised keys");
        }

        let with_audio = signals.iter().any(|s| matches!(s, ServerSignal::Audio(_)));
        for signal in signals {
            match signal {
                ServerSignal::Text(text) => self.emit(SessionEvent::TextResponse { text, with_audio }),
                ServerSignal::Audio(frame) => self.emit(SessionEvent::AudioResponse(frame)),
                ServerSignal::SetupComplete => {
                    let advanced = self.state.send_if_modified(|state| {
                        if *state == SessionState::Configuring {
                            *state = SessionState::Active;
                            true
                        } else {
                            false
                        }
                    });
                    if advanced {
                        info!("Live setup complete; session active");
                    } else {
                        debug!("Ignoring repeated setupComplete");
                    }
                }
                ServerSignal::Error(message) => {
                    warn!(error = %message, "Live service reported an error");
                    self.emit(SessionEvent::ServerError(message));
                }
            }
        }
    }
}

fn transport_message(e: VoxlineError) -> String {
    match e {
        VoxlineError::Transport(message) => message,
        other => other.to_string(),
    }
}

async fn write_loop(mut sink: WireSink, mut wire: mpsc::UnboundedReceiver<WireFrame>) {
    while let Some(frame) = wire.recv().await {
        let is_close = frame == WireFrame::Close;
        if let Err(e) = sink.send(frame).await {
            warn!(error = %e, "Live transport write failed");
            break;
        }
        if is_close {
            break;
        }
    }
    let _ = sink.close().await;
    debug!("Live writer finished");
}

async fn read_loop(shared: Arc<Shared>, mut stream: WireStream) {
    while let Some(item) = stream.next().await {
        match item {
            Ok(WireFrame::Binary(bytes)) => {
                shared.emit(SessionEvent::AudioResponse(AudioFrame::from(bytes)));
            }
            Ok(WireFrame::Text(text)) => shared.dispatch(&text),
            Ok(WireFrame::Close) => {
                debug!("Close frame from live service");
                break;
            }
            Err(e) => {
                if !shared.state().is_closing() {
                    let message = transport_message(e);
                    error!(error = %message, "Live transport failed");
                    shared.emit(SessionEvent::TransportError(message));
                }
                break;
            }
        }
    }

    if !shared.state().is_closing() {
        info!("Live service ended the session");
    }
    shared.finish_closed().await;
}

async fn audio_worker(
    shared: Arc<Shared>,
    mut audio: mpsc::UnboundedReceiver<AudioFrame>,
    wire: mpsc::UnboundedSender<WireFrame>,
) {
    if !shared.wait_for_active().await {
        return;
    }
    debug!(queued = shared.queued_audio.load(Ordering::SeqCst), "Flushing outbound audio");
    loop {
        let frame = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            frame = audio.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        shared.queued_audio.fetch_sub(1, Ordering::SeqCst);

        match ClientMessage::audio(&frame).to_json() {
            Ok(envelope) => {
                if wire.send(WireFrame::Text(envelope)).is_err() {
                    break;
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode audio frame"),
        }
    }
}

async fn text_worker(
    shared: Arc<Shared>,
    mut text: mpsc::UnboundedReceiver<String>,
    wire: mpsc::UnboundedSender<WireFrame>,
) {
    if !shared.wait_for_active().await {
        return;
    }
    loop {
        let turn = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            turn = text.recv() => match turn {
                Some(turn) => turn,
                None => break,
            },
        };

        match ClientMessage::text(&turn).to_json() {
            Ok(envelope) => {
                debug!(chars = turn.chars().count(), "Sending text turn");
                if wire.send(WireFrame::Text(envelope)).is_err() {
                    break;
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode text turn"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{Value, json};
    use voxline_core::protocol::decode_realtime_audio;

    use super::*;
    use crate::memory::{MemoryConnector, MemoryPeer};

    const WAIT: Duration = Duration::from_secs(2);

    fn test_config() -> LiveConfig {
        LiveConfig {
            endpoint: "ws://memory/live".into(),
            close_timeout_ms: 200,
            ..LiveConfig::default()
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    async fn peer_json(peer: &mut MemoryPeer) -> Value {
        tokio::time::timeout(WAIT, peer.recv_json())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed")
    }

    /// Connected session with the setup envelope already consumed by the peer.
    async fn connected(
        config: LiveConfig,
    ) -> (
        StreamingSession,
        mpsc::UnboundedReceiver<SessionEvent>,
        MemoryPeer,
    ) {
        let (connector, mut peers) = MemoryConnector::new();
        let (session, mut events) = StreamingSession::new(config, Arc::new(connector));
        session.connect("test-key").await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        let setup = peer_json(&mut peer).await;
        assert!(setup.get("setup").is_some());
        assert_eq!(next_event(&mut events).await, SessionEvent::Connected);
        (session, events, peer)
    }

    async fn activate(session: &StreamingSession, peer: &MemoryPeer) {
        peer.send_json(&json!({ "setupComplete": {} }));
        tokio::time::timeout(WAIT, session.wait_until_active())
            .await
            .expect("timed out waiting for Active")
            .unwrap();
    }

    #[tokio::test]
    async fn test_empty_credential_fails_without_transport() {
        let (connector, _peers) = MemoryConnector::new();
        let connector = Arc::new(connector);
        let (session, mut events) = StreamingSession::new(test_config(), connector.clone());

        let result = session.connect("   ").await;
        assert!(matches!(result, Err(VoxlineError::Configuration(_))));
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::ConfigurationError(_)
        ));
        assert_eq!(connector.opens(), 0);
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_sends_setup_and_embeds_credential() {
        let (connector, mut peers) = MemoryConnector::new();
        let (session, mut events) = StreamingSession::new(test_config(), Arc::new(connector));
        session.connect("secret").await.unwrap();

        let mut peer = peers.recv().await.unwrap();
        assert_eq!(peer.url(), "ws://memory/live?key=secret");

        let setup = peer_json(&mut peer).await;
        assert_eq!(setup["setup"]["model"]["model"], "models/gemini-2.0-flash-exp");
        assert_eq!(
            setup["setup"]["generationConfig"]["responseModalities"],
            json!(["AUDIO", "TEXT"])
        );
        assert_eq!(
            setup["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]
                ["prebuiltVoiceConfig"]["voiceName"],
            "Aoede"
        );

        // Connected is signalled before any acknowledgment
        assert_eq!(next_event(&mut events).await, SessionEvent::Connected);
        assert_eq!(session.state(), SessionState::Configuring);
    }

    #[tokio::test]
    async fn test_setup_complete_activates_once() {
        let (session, mut events, peer) = connected(test_config()).await;
        let mut states = session.subscribe_state();
        states.borrow_and_update();

        activate(&session, &peer).await;
        assert!(states.has_changed().unwrap());
        states.borrow_and_update();

        peer.send_json(&json!({ "setupComplete": {} }));
        peer.send_json(&json!({
            "serverContent": { "modelTurn": { "parts": [{ "text": "after" }] } }
        }));

        // The repeated marker produced no event and no transition
        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::text("after")
        );
        assert!(!states.has_changed().unwrap());
        assert_eq!(session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_frames_held_until_active() {
        let (session, _events, mut peer) = connected(test_config()).await;

        session.send_audio(AudioFrame::from(vec![1u8, 1]));
        session.send_audio(AudioFrame::from(vec![2u8, 2]));
        session.send_text("queued turn");

        let early = tokio::time::timeout(Duration::from_millis(100), peer.recv()).await;
        assert!(early.is_err(), "nothing may be transmitted before Active");
        assert_eq!(session.queued_audio_frames(), 2);

        activate(&session, &peer).await;

        let mut audio = Vec::new();
        let mut turns = Vec::new();
        while audio.len() < 2 || turns.is_empty() {
            let frame = peer_json(&mut peer).await;
            if frame.get("realtimeInput").is_some() {
                audio.push(decode_realtime_audio(&frame.to_string()).unwrap());
            } else {
                turns.push(frame);
            }
        }
        assert_eq!(audio[0].as_bytes(), &[1, 1]);
        assert_eq!(audio[1].as_bytes(), &[2, 2]);
        assert_eq!(
            turns[0]["clientContent"]["turns"][0]["parts"][0]["text"],
            "queued turn"
        );
    }

    #[tokio::test]
    async fn test_three_frames_in_capture_order() {
        let (session, _events, mut peer) = connected(test_config()).await;
        activate(&session, &peer).await;

        let frames: Vec<AudioFrame> = (0..3u8)
            .map(|i| AudioFrame::from(vec![i; 640]))
            .collect();
        for frame in &frames {
            session.send_audio(frame.clone());
        }

        for expected in &frames {
            let envelope = peer_json(&mut peer).await;
            let chunks = envelope["realtimeInput"]["mediaChunks"].as_array().unwrap();
            assert_eq!(chunks.len(), 1);
            assert_eq!(chunks[0]["mimeType"], "audio/pcm;rate=16000");
            let decoded = decode_realtime_audio(&envelope.to_string()).unwrap();
            assert_eq!(&decoded, expected);
        }
    }

    #[tokio::test]
    async fn test_text_turn_envelope() {
        let (session, _events, mut peer) = connected(test_config()).await;
        activate(&session, &peer).await;

        session.send_text("Hello");
        let envelope = peer_json(&mut peer).await;
        assert_eq!(
            envelope,
            json!({
                "clientContent": {
                    "turns": [{ "role": "user", "parts": [{ "text": "Hello" }] }],
                    "turnComplete": true
                }
            })
        );
    }

    #[tokio::test]
    async fn test_binary_frame_is_audio_response() {
        let (_session, mut events, peer) = connected(test_config()).await;

        peer.send_binary(vec![7u8; 4000]);
        match next_event(&mut events).await {
            SessionEvent::AudioResponse(frame) => assert_eq!(frame.len(), 4000),
            other => panic!("expected audio, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_inbound_dispatch_order_and_resilience() {
        let (session, mut events, peer) = connected(test_config()).await;

        peer.send_json(&json!({ "usageMetadata": { "totalTokenCount": 3 } }));
        peer.send_text("{not json");
        peer.send_json(&json!({ "error": { "message": "quota" } }));
        peer.send_json(&json!({ "error": {} }));
        peer.send_json(&json!({
            "serverContent": { "modelTurn": { "parts": [
                { "text": "one" },
                { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": "AQID" } }
            ] } }
        }));
        peer.send_binary(vec![9u8; 10]);

        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::ProtocolError(_)
        ));
        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::ServerError("quota".into())
        );
        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::ServerError("Unknown error".into())
        );
        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::TextResponse {
                text: "one".into(),
                with_audio: true,
            }
        );
        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::AudioResponse(AudioFrame::from(vec![1u8, 2, 3]))
        );
        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::AudioResponse(AudioFrame::from(vec![9u8; 10]))
        );
        // errors never close the connection
        assert!(session.state().is_live());
    }

    #[tokio::test]
    async fn test_disconnect_twice() {
        let (session, mut events, mut peer) = connected(test_config()).await;
        activate(&session, &peer).await;

        let service = tokio::spawn(async move {
            while let Some(frame) = peer.recv().await {
                if frame == WireFrame::Close {
                    peer.close();
                    return true;
                }
            }
            false
        });

        session.disconnect().await;
        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Closed);
        assert!(service.await.unwrap(), "close frame not received");

        assert_eq!(next_event(&mut events).await, SessionEvent::Disconnected);
        assert!(
            tokio::time::timeout(Duration::from_millis(100), events.recv())
                .await
                .map_or(true, |e| e.is_none()),
            "Disconnected must be emitted exactly once"
        );
    }

    #[tokio::test]
    async fn test_disconnect_without_confirmation_times_out() {
        let (session, mut events, _peer) = connected(test_config()).await;

        let started = std::time::Instant::now();
        session.disconnect().await;
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(next_event(&mut events).await, SessionEvent::Disconnected);
    }

    #[tokio::test]
    async fn test_queued_frames_discarded_on_close() {
        let (session, _events, mut peer) = connected(test_config()).await;
        session.send_audio(AudioFrame::from(vec![5u8; 4]));
        session.send_text("never sent");

        let closer = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(frame) = peer.recv().await {
                let done = frame == WireFrame::Close;
                seen.push(frame);
                if done {
                    peer.close();
                    break;
                }
            }
            seen
        });

        session.disconnect().await;
        assert_eq!(closer.await.unwrap(), vec![WireFrame::Close]);

        // closed sessions drop sends and refuse to reconnect
        session.send_audio(AudioFrame::from(vec![1u8, 2]));
        assert!(matches!(
            session.connect("test-key").await,
            Err(VoxlineError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_connect_twice_is_noop() {
        let (connector, mut peers) = MemoryConnector::new();
        let connector = Arc::new(connector);
        let (session, _events) = StreamingSession::new(test_config(), connector.clone());
        session.connect("k").await.unwrap();
        session.connect("k").await.unwrap();
        assert_eq!(connector.opens(), 1);
        let _peer = peers.recv().await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_before_connect_is_noop() {
        let (connector, mut peers) = MemoryConnector::new();
        let (session, mut events) = StreamingSession::new(test_config(), Arc::new(connector));

        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(events.try_recv().is_err());

        session.connect("test-key").await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        assert!(peer_json(&mut peer).await.get("setup").is_some());
        assert_eq!(next_event(&mut events).await, SessionEvent::Connected);
        activate(&session, &peer).await;
    }

    #[tokio::test]
    async fn test_send_before_connect_is_dropped() {
        let (connector, _peers) = MemoryConnector::new();
        let (session, _events) = StreamingSession::new(test_config(), Arc::new(connector));
        session.send_audio(AudioFrame::from(vec![0u8; 4]));
        session.send_text("hello");
        assert_eq!(session.queued_audio_frames(), 0);
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_refused_transport() {
        let connector = Arc::new(MemoryConnector::refusing("connection refused"));
        let (session, mut events) = StreamingSession::new(test_config(), connector.clone());

        let result = session.connect("test-key").await;
        assert!(matches!(result, Err(VoxlineError::Transport(_))));
        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::TransportError("connection refused".into())
        );
        assert_eq!(session.state(), SessionState::Closed);
        // never Connected, so no Disconnected either
        assert!(events.try_recv().is_err());
        assert_eq!(connector.opens(), 1);
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let config = LiveConfig {
            connect_timeout_secs: 1,
            ..test_config()
        };
        let (session, mut events) =
            StreamingSession::new(config, Arc::new(MemoryConnector::hanging()));

        let result = session.connect("k").await;
        assert!(matches!(result, Err(VoxlineError::Transport(_))));
        match next_event(&mut events).await {
            SessionEvent::TransportError(message) => assert!(message.contains("timed out")),
            other => panic!("expected transport error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_abrupt_failure_then_disconnected() {
        let (session, mut events, peer) = connected(test_config()).await;
        activate(&session, &peer).await;

        peer.fail("connection reset");
        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::TransportError("connection reset".into())
        );
        assert_eq!(next_event(&mut events).await, SessionEvent::Disconnected);
        assert_eq!(session.state(), SessionState::Closed);

        // no-op after the fact
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_outbound_audio_shedding() {
        let config = LiveConfig {
            max_queued_audio_frames: 2,
            ..test_config()
        };
        let (session, _events, mut peer) = connected(config).await;

        for i in 0..5u8 {
            session.send_audio(AudioFrame::from(vec![i; 2]));
        }
        assert_eq!(session.queued_audio_frames(), 2);

        activate(&session, &peer).await;
        let first = peer_json(&mut peer).await;
        let second = peer_json(&mut peer).await;
        assert_eq!(decode_realtime_audio(&first.to_string()).unwrap().as_bytes(), &[0, 0]);
        assert_eq!(decode_realtime_audio(&second.to_string()).unwrap().as_bytes(), &[1, 1]);
        let extra = tokio::time::timeout(Duration::from_millis(100), peer.recv()).await;
        assert!(extra.is_err(), "shed frames must not be sent");
    }
}
