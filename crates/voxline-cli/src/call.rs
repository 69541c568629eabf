//! `voxline call`: one simulated call driven from stdin.

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

use voxline_call::{CallEvent, CallHandle, CallRegistry, CallState};
use voxline_core::types::{CallDirection, SessionEvent};

/// One line typed by the user.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Hold,
    Unhold,
    Mute(bool),
    Dtmf(char),
    Answer,
    Reject,
    Hangup,
    Text(String),
    Empty,
    Unknown(String),
}

pub fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Input::Text(line.to_string());
    };

    let mut words = command.split_whitespace();
    match (words.next().unwrap_or(""), words.next()) {
        ("hold", None) => Input::Hold,
        ("unhold", None) => Input::Unhold,
        ("mute", None) => Input::Mute(true),
        ("unmute", None) => Input::Mute(false),
        ("answer", None) => Input::Answer,
        ("reject", None) => Input::Reject,
        ("hangup" | "quit", None) => Input::Hangup,
        ("dtmf", Some(digit)) => {
            let mut chars = digit.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) if c.is_ascii_digit() || matches!(c, '*' | '#' | 'A'..='D') => {
                    Input::Dtmf(c)
                }
                _ => Input::Unknown(line.to_string()),
            }
        }
        _ => Input::Unknown(line.to_string()),
    }
}

fn apply(call: &CallHandle, input: Input) -> voxline_core::error::Result<()> {
    match input {
        Input::Hold => call.hold(),
        Input::Unhold => call.unhold(),
        Input::Mute(muted) => call.mute(muted),
        Input::Dtmf(digit) => call.play_dtmf(digit),
        Input::Answer => call.answer(),
        Input::Reject => call.reject(),
        Input::Hangup => call.hangup(),
        Input::Text(text) => call.send_text(text),
        Input::Empty => Ok(()),
        Input::Unknown(line) => {
            eprintln!("unknown command {line:?} (try /hold /unhold /mute /unmute /dtmf N /hangup)");
            Ok(())
        }
    }
}

fn describe(event: &CallEvent) -> Option<String> {
    match event {
        CallEvent::StateChanged { from, to } => Some(format!("[call] {from} -> {to}")),
        CallEvent::Session(SessionEvent::TextResponse { text, .. }) => Some(format!("assistant: {text}")),
        CallEvent::Session(SessionEvent::AudioResponse(_)) => None,
        CallEvent::Session(event) if event.is_error() => Some(format!("[session] {event:?}")),
        CallEvent::Session(event) => Some(format!("[session] {}", event.kind())),
        CallEvent::Ended { cause, duration } => Some(format!(
            "[call] ended: {cause} after {:.1}s",
            duration.as_secs_f64()
        )),
    }
}

pub async fn run(registry: &CallRegistry, direction: CallDirection, address: &str) -> anyhow::Result<()> {
    let (call, mut events) = match direction {
        CallDirection::Incoming => registry.incoming(address).await?,
        CallDirection::Outgoing => registry.outgoing(address).await,
    };
    println!("Call {} ({direction}) with {address}", call.id());
    println!("Type to talk; /hold /unhold /mute /unmute /dtmf N /hangup");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if let Some(line) = describe(&event) {
                    println!("{line}");
                }
                if matches!(event, CallEvent::Ended { .. }) {
                    break;
                }
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if let Err(e) = apply(&call, parse_input(&line)) {
                        warn!(error = %e, "Command not delivered");
                    }
                }
                Ok(None) | Err(_) => {
                    // stdin closed: let the call run until ended elsewhere
                    stdin_open = false;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                println!();
                let _ = call.hangup();
            }
        }
    }

    // the registry prunes ended calls asynchronously
    call.wait_for(|s| *s == CallState::Disconnected).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse_input("/hold"), Input::Hold);
        assert_eq!(parse_input(" /unhold "), Input::Unhold);
        assert_eq!(parse_input("/mute"), Input::Mute(true));
        assert_eq!(parse_input("/unmute"), Input::Mute(false));
        assert_eq!(parse_input("/dtmf 7"), Input::Dtmf('7'));
        assert_eq!(parse_input("/dtmf #"), Input::Dtmf('#'));
        assert_eq!(parse_input("/hangup"), Input::Hangup);
        assert_eq!(parse_input(""), Input::Empty);
    }

    #[test]
    fn test_plain_lines_are_text() {
        assert_eq!(
            parse_input("what's the weather?"),
            Input::Text("what's the weather?".into())
        );
    }

    #[test]
    fn test_malformed_commands() {
        assert!(matches!(parse_input("/dtmf"), Input::Unknown(_)));
        assert!(matches!(parse_input("/dtmf 12"), Input::Unknown(_)));
        assert!(matches!(parse_input("/dtmf x"), Input::Unknown(_)));
        assert!(matches!(parse_input("/hold now"), Input::Unknown(_)));
        assert!(matches!(parse_input("/transfer"), Input::Unknown(_)));
    }

    #[test]
    fn test_describe_hides_audio() {
        use voxline_core::types::AudioFrame;
        let audio = CallEvent::Session(SessionEvent::AudioResponse(AudioFrame::from(&[0u8; 4][..])));
        assert_eq!(describe(&audio), None);
        let text = CallEvent::Session(SessionEvent::text("hi"));
        assert_eq!(describe(&text).as_deref(), Some("assistant: hi"));
    }
}
