//! Call orchestrator: one actor task per call.
//!
//! The actor owns the call state, the streaming session and the audio
//! pipeline. Lifecycle commands arrive over the [`CallHandle`]; session events
//! arrive from the session's event channel; a single deadline drives the
//! auto-answer and dial delays. Everything the outside world should see goes
//! out as [`CallEvent`]s.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use voxline_core::config::Config;
use voxline_core::credentials::CredentialProvider;
use voxline_core::error::{Result, VoxlineError};
use voxline_core::types::{AudioFrame, CallDirection, SessionEvent};
use voxline_live::{Connector, StreamingSession};
use voxline_media::{AudioDevices, AudioPipeline, AudioUplink, SpeechSynthesizer};

use crate::metrics;
use crate::types::{CallCommand, CallEvent, CallInfo, CallState, DisconnectCause};

/// Collaborators shared by every call.
#[derive(Clone)]
pub struct CallServices {
    pub config: Arc<Config>,
    pub connector: Arc<dyn Connector>,
    pub devices: Arc<dyn AudioDevices>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
}

/// Control surface of one call. Cheap to clone; when every clone is dropped
/// the call is hung up.
#[derive(Clone)]
pub struct CallHandle {
    id: Uuid,
    direction: CallDirection,
    address: Arc<str>,
    created_at: DateTime<Utc>,
    commands: mpsc::UnboundedSender<CallCommand>,
    state: watch::Receiver<CallState>,
}

impl CallHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> CallState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<CallState> {
        self.state.clone()
    }

    pub fn info(&self) -> CallInfo {
        CallInfo {
            id: self.id,
            direction: self.direction,
            address: self.address.to_string(),
            state: self.state(),
            created_at: self.created_at,
        }
    }

    /// Wait until the call state satisfies `f`; returns the state seen.
    pub async fn wait_for(&self, f: impl FnMut(&CallState) -> bool) -> CallState {
        let mut rx = self.state.clone();
        let seen = rx.wait_for(f).await.map(|s| *s).ok();
        seen.unwrap_or_else(|| self.state())
    }

    pub fn send(&self, command: CallCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| VoxlineError::Call(format!("call {} has ended", self.id)))
    }

    pub fn answer(&self) -> Result<()> {
        self.send(CallCommand::Answer)
    }

    pub fn hold(&self) -> Result<()> {
        self.send(CallCommand::Hold)
    }

    pub fn unhold(&self) -> Result<()> {
        self.send(CallCommand::Unhold)
    }

    pub fn mute(&self, muted: bool) -> Result<()> {
        self.send(CallCommand::Mute(muted))
    }

    pub fn reject(&self) -> Result<()> {
        self.send(CallCommand::Reject)
    }

    pub fn abort(&self) -> Result<()> {
        self.send(CallCommand::Abort)
    }

    pub fn hangup(&self) -> Result<()> {
        self.send(CallCommand::Hangup)
    }

    pub fn remote_hangup(&self) -> Result<()> {
        self.send(CallCommand::RemoteHangup)
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(CallCommand::SendText(text.into()))
    }

    pub fn play_dtmf(&self, digit: char) -> Result<()> {
        self.send(CallCommand::Dtmf(digit))
    }
}

pub struct CallOrchestrator;

impl CallOrchestrator {
    /// Create a call and spawn its actor. Incoming calls start Ringing,
    /// outgoing calls start Dialing.
    pub fn start(
        services: CallServices,
        direction: CallDirection,
        address: impl Into<String>,
    ) -> (CallHandle, mpsc::UnboundedReceiver<CallEvent>) {
        let id = Uuid::new_v4();
        let address: Arc<str> = Arc::from(address.into());
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(CallState::Idle);

        let handle = CallHandle {
            id,
            direction,
            address: address.clone(),
            created_at: Utc::now(),
            commands: commands_tx,
            state: state_rx,
        };

        let actor = CallActor {
            id,
            direction,
            services,
            state,
            events,
            session: None,
            session_events: None,
            connecting: None,
            pipeline: None,
            deadline: None,
            answered_at: None,
            muted: false,
            last_session_error: None,
        };

        let span = info_span!("call", %id, %direction);
        tokio::spawn(
            async move {
                info!(address = %address, "Call created");
                actor.run(commands).await;
            }
            .instrument(span),
        );

        (handle, events_rx)
    }
}

/// Forwards captured audio to the session.
struct SessionUplink(Arc<StreamingSession>);

impl AudioUplink for SessionUplink {
    fn send_audio(&self, frame: AudioFrame) {
        self.0.send_audio(frame);
    }
}

struct CallActor {
    id: Uuid,
    direction: CallDirection,
    services: CallServices,
    state: watch::Sender<CallState>,
    events: mpsc::UnboundedSender<CallEvent>,
    session: Option<Arc<StreamingSession>>,
    session_events: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    /// In-flight `connect`; session events wait until it resolves.
    connecting: Option<JoinHandle<Result<()>>>,
    pipeline: Option<AudioPipeline>,
    /// Pending auto-answer or dial completion.
    deadline: Option<Instant>,
    answered_at: Option<Instant>,
    muted: bool,
    last_session_error: Option<String>,
}

enum Step {
    Deadline,
    Command(Option<CallCommand>),
    Session(Option<SessionEvent>),
    Connected(Result<()>),
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn connect_result(task: &mut Option<JoinHandle<Result<()>>>) -> Result<()> {
    match task {
        Some(task) => match task.await {
            Ok(result) => result,
            Err(e) => Err(VoxlineError::Other(anyhow::anyhow!("connect task failed: {e}"))),
        },
        None => std::future::pending().await,
    }
}

async fn next_session_event(
    events: &mut Option<mpsc::UnboundedReceiver<SessionEvent>>,
) -> Option<SessionEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

impl CallActor {
    fn state(&self) -> CallState {
        *self.state.borrow()
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<CallCommand>) {
        metrics::record_call_start(self.direction);
        let call = &self.services.config.call;
        match self.direction {
            CallDirection::Incoming => {
                self.deadline = Some(Instant::now() + call.answer_grace());
                self.set_state(CallState::Ringing);
            }
            CallDirection::Outgoing => {
                self.deadline = Some(Instant::now() + call.dial_delay());
                self.set_state(CallState::Dialing);
            }
        }

        while self.state() != CallState::Disconnected {
            let connecting = self.connecting.is_some();
            let step = tokio::select! {
                _ = sleep_until(self.deadline) => Step::Deadline,
                command = commands.recv() => Step::Command(command),
                result = connect_result(&mut self.connecting) => Step::Connected(result),
                event = next_session_event(&mut self.session_events), if !connecting => {
                    Step::Session(event)
                }
            };

            match step {
                Step::Deadline => {
                    self.deadline = None;
                    match self.state() {
                        CallState::Ringing => {
                            info!("Auto-answering incoming call");
                            self.enter_active().await;
                        }
                        CallState::Dialing => {
                            info!("Outgoing call established");
                            self.enter_active().await;
                        }
                        _ => {}
                    }
                }
                Step::Command(Some(command)) => self.handle_command(command).await,
                Step::Command(None) => {
                    info!("All call handles dropped; hanging up");
                    self.end(DisconnectCause::Local).await;
                }
                Step::Session(Some(event)) => self.route(event).await,
                Step::Session(None) => {
                    debug!("Session event channel closed");
                    self.session_events = None;
                }
                Step::Connected(result) => {
                    self.connecting = None;
                    if let Err(e) = self.start_pipeline(result).await {
                        self.fail_start(e).await;
                    }
                }
            }
        }

        info!("Call actor finished");
    }

    async fn handle_command(&mut self, command: CallCommand) {
        let state = self.state();
        debug!(?command, %state, "Call command");

        match command {
            CallCommand::Answer => {
                if state == CallState::Ringing {
                    self.deadline = None;
                    self.enter_active().await;
                } else {
                    warn!(%state, "Answer ignored: call is not ringing");
                }
            }
            CallCommand::Hold => {
                if state == CallState::Active {
                    if let Some(pipeline) = &self.pipeline {
                        pipeline.pause();
                    }
                    self.set_state(CallState::Held);
                } else {
                    warn!(%state, "Hold ignored: call is not active");
                }
            }
            CallCommand::Unhold => {
                if state == CallState::Held {
                    self.enter_active().await;
                } else {
                    warn!(%state, "Unhold ignored: call is not held");
                }
            }
            CallCommand::Mute(muted) => {
                self.muted = muted;
                if let Some(pipeline) = &self.pipeline {
                    pipeline.set_muted(muted);
                }
                info!(muted, "Microphone mute changed");
            }
            CallCommand::Reject => {
                if state == CallState::Ringing {
                    self.end(DisconnectCause::Rejected).await;
                } else {
                    warn!(%state, "Reject ignored: only valid while ringing");
                }
            }
            CallCommand::Abort => self.end(DisconnectCause::Canceled).await,
            CallCommand::Hangup => self.end(DisconnectCause::Local).await,
            CallCommand::RemoteHangup => self.end(DisconnectCause::Remote).await,
            CallCommand::SendText(text) => match &self.session {
                Some(session) => session.send_text(text),
                None => warn!(%state, "Text ignored: no live session"),
            },
            CallCommand::Dtmf(digit) => {
                info!(%digit, "DTMF tone requested");
            }
        }
    }

    /// Enter Active. The first entry starts connecting the session; the
    /// pipeline follows once the connect resolves. Re-entry from Held only
    /// resumes capture.
    async fn enter_active(&mut self) {
        if self.state() == CallState::Held {
            if let Some(pipeline) = &self.pipeline {
                pipeline.resume();
            }
            self.set_state(CallState::Active);
            return;
        }

        self.set_state(CallState::Active);
        self.answered_at = Some(Instant::now());

        self.begin_connect();
    }

    async fn fail_start(&mut self, e: VoxlineError) {
        error!(error = %e, kind = e.kind(), "Call start-up failed");
        metrics::record_error(e.kind());
        self.end(DisconnectCause::Error(e.to_string())).await;
    }

    /// Spawn the session connect so commands keep flowing while it runs.
    fn begin_connect(&mut self) {
        if self.session.is_some() {
            return;
        }

        let credential = self.services.credentials.credential().unwrap_or_default();
        let (session, session_events) = StreamingSession::new(
            self.services.config.live.clone(),
            self.services.connector.clone(),
        );
        let session = Arc::new(session);
        self.session = Some(session.clone());
        self.session_events = Some(session_events);
        self.connecting = Some(tokio::spawn(
            async move { session.connect(&credential).await }.in_current_span(),
        ));
    }

    async fn start_pipeline(&mut self, connected: Result<()>) -> Result<()> {
        connected?;
        let Some(session) = self.session.clone() else {
            return Ok(());
        };

        let pipeline = AudioPipeline::new(
            self.services.config.audio.clone(),
            self.services.devices.clone(),
            self.services.synthesizer.clone(),
            Arc::new(SessionUplink(session)),
        );
        pipeline.set_muted(self.muted);
        pipeline.start().await?;
        // held while the connect was in flight
        if self.state() == CallState::Held {
            pipeline.pause();
        }
        self.pipeline = Some(pipeline);
        Ok(())
    }

    async fn route(&mut self, event: SessionEvent) {
        metrics::record_session_event(&event);
        match event {
            SessionEvent::AudioResponse(frame) => {
                if let Some(pipeline) = &self.pipeline {
                    pipeline.play(frame);
                }
            }
            SessionEvent::TextResponse { text, with_audio } => {
                if !with_audio {
                    if let Some(pipeline) = &self.pipeline {
                        pipeline.speak_fallback(&text).await;
                    }
                }
                self.emit(CallEvent::Session(SessionEvent::TextResponse {
                    text,
                    with_audio,
                }));
            }
            SessionEvent::Disconnected => {
                self.emit(CallEvent::Session(SessionEvent::Disconnected));
                let reason = self
                    .last_session_error
                    .take()
                    .unwrap_or_else(|| "live session closed".to_string());
                warn!(%reason, "Live session ended during the call");
                self.end(DisconnectCause::Error(reason)).await;
            }
            other => {
                if let SessionEvent::TransportError(message) = &other {
                    self.last_session_error = Some(message.clone());
                }
                self.emit(CallEvent::Session(other));
            }
        }
    }

    /// Tear down and enter Disconnected. No-op once disconnected.
    async fn end(&mut self, cause: DisconnectCause) {
        if self.state() == CallState::Disconnected {
            return;
        }
        info!(%cause, "Ending call");
        self.deadline = None;

        if let Some(connecting) = self.connecting.take() {
            debug!("Dropping in-flight connect");
            connecting.abort();
        }

        if let Some(pipeline) = self.pipeline.take() {
            pipeline.stop().await;
        }
        if let Some(session) = self.session.take() {
            session.disconnect().await;
        }
        // Flush what the session said while shutting down.
        if let Some(mut events) = self.session_events.take() {
            while let Ok(event) = events.try_recv() {
                if !matches!(event, SessionEvent::AudioResponse(_)) {
                    metrics::record_session_event(&event);
                    self.emit(CallEvent::Session(event));
                }
            }
        }

        self.set_state(CallState::Disconnected);
        let duration = self
            .answered_at
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO);
        metrics::record_call_end(&cause, duration.as_secs_f64());
        info!(id = %self.id, duration_ms = duration.as_millis() as u64, "Call ended");
        self.emit(CallEvent::Ended { cause, duration });
    }

    fn set_state(&mut self, to: CallState) {
        let from = self.state.send_replace(to);
        if from != to {
            info!(%from, %to, "Call state");
            self.emit(CallEvent::StateChanged { from, to });
        }
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }
}
