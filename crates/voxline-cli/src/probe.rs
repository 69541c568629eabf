//! `voxline probe`: open a live session, send one greeting, print the first reply.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;

use voxline_core::config::LiveConfig;
use voxline_core::error::VoxlineError;
use voxline_core::types::SessionEvent;
use voxline_live::{Connector, StreamingSession};

pub const DEFAULT_GREETING: &str = "Reply with 'Hello, I am working!' if you receive this.";

pub async fn run(
    live: LiveConfig,
    connector: Arc<dyn Connector>,
    credential: &str,
    greeting: &str,
    wait: Duration,
) -> anyhow::Result<()> {
    let (session, mut events) = StreamingSession::new(live, connector);

    println!("Connecting...");
    session.connect(credential).await?;
    tokio::time::timeout(wait, session.wait_until_active())
        .await
        .context("timed out waiting for setup completion")??;
    println!("Setup complete");

    session.send_text(greeting);
    info!(greeting, "Greeting sent");

    let outcome = tokio::time::timeout(wait, async {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::TextResponse { text, .. } => return Ok(format!("text: {text}")),
                // one frame is enough to prove the round trip
                SessionEvent::AudioResponse(frame) => {
                    return Ok(format!("audio: {} bytes", frame.len()));
                }
                SessionEvent::ServerError(message) => {
                    return Err(anyhow::Error::from(VoxlineError::Server(message)));
                }
                SessionEvent::TransportError(message) => {
                    return Err(anyhow::Error::from(VoxlineError::Transport(message)));
                }
                SessionEvent::ConfigurationError(message) => {
                    return Err(anyhow::Error::from(VoxlineError::Configuration(message)));
                }
                SessionEvent::Disconnected => anyhow::bail!("session closed before replying"),
                SessionEvent::Connected | SessionEvent::ProtocolError(_) => {}
            }
        }
        anyhow::bail!("session event stream ended")
    })
    .await;

    session.disconnect().await;

    match outcome {
        Ok(Ok(reply)) => {
            println!("Reply {reply}");
            Ok(())
        }
        Ok(Err(e)) => Err(e.context("probe failed")),
        Err(_) => anyhow::bail!("no reply within {}s", wait.as_secs()),
    }
}
