//! Terminal front-end: command-line arguments, the interactive call loop and
//! the rendering of session events.

use calllink_core::{
    CallKind, CallRecord, CallSessionManager, CallStatus, Counselor, SessionEvent, TurnState,
};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(version, about = "Place and drive real-time calls from the terminal.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start a call and talk through stdin.
    Call {
        #[arg(long, value_enum)]
        kind: KindArg,
        /// Counselor to ring; required for counselor calls.
        #[arg(long)]
        callee: Option<String>,
        #[arg(long, default_value = "en")]
        language: String,
    },
    /// List past calls.
    History {
        #[arg(long, value_enum)]
        kind: Option<KindArg>,
    },
    /// List counselors available for a language.
    Counselors {
        #[arg(long, default_value = "en")]
        language: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum KindArg {
    Counselor,
    AiPractice,
    Emergency,
}

impl From<KindArg> for CallKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Counselor => CallKind::Counselor,
            KindArg::AiPractice => CallKind::AiPractice,
            KindArg::Emergency => CallKind::Emergency,
        }
    }
}

/// One line typed during a call.
#[derive(Debug, PartialEq, Eq)]
pub enum Input {
    Text(String),
    Voice(PathBuf),
    End,
    Empty,
}

pub fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        Input::Empty
    } else if line == "/end" {
        Input::End
    } else if let Some(path) = line.strip_prefix("/voice ") {
        Input::Voice(PathBuf::from(path.trim()))
    } else {
        Input::Text(line.to_string())
    }
}

/// How an event is shown to the user, if at all.
pub fn render(event: &SessionEvent) -> Option<String> {
    match event {
        SessionEvent::StatusChanged { current, .. } => Some(format!("[call {current}]")),
        SessionEvent::TurnClosed(turn) => match (&turn.state, &turn.reply) {
            (TurnState::Completed, Some(reply)) => {
                let mut line = String::new();
                if let Some(heard) = &reply.user_text {
                    line.push_str(&format!("you: {heard}\n"));
                }
                line.push_str(&format!("bot: {}", reply.text));
                if let Some(audio) = &reply.audio {
                    line.push_str(&format!(" [{} bytes of audio]", audio.len()));
                }
                Some(line)
            }
            (state, _) => Some(format!("[turn {} {:?}]", turn.index, state).to_lowercase()),
        },
        SessionEvent::RemoteError { message, .. } => Some(format!("[error] {message}")),
        SessionEvent::Negotiation { .. } => None,
    }
}

pub fn format_record(record: &CallRecord) -> String {
    let started = record
        .started_at
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string());
    let duration = record
        .duration
        .map(|d| format!("{d}s"))
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{}  {:<12} {:<10} {}  {}  {}",
        record.call_id,
        record.kind.as_str(),
        record.status,
        record.language,
        started,
        duration
    )
}

pub fn format_counselor(counselor: &Counselor) -> String {
    let name = counselor
        .name
        .as_deref()
        .or(counselor.username.as_deref())
        .unwrap_or("unnamed");
    format!(
        "{}  {}  [{}]  rating {:.1}",
        counselor.id,
        name,
        counselor.languages.join(", "),
        counselor.rating
    )
}

/// Creates a call and relays `input` lines as turns until the call
/// terminates, the input ends, the user types `/end` or presses Ctrl+C.
/// Returns the call's final status.
pub async fn run_call<R>(
    manager: &CallSessionManager,
    kind: CallKind,
    callee: Option<String>,
    language: &str,
    input: R,
) -> anyhow::Result<CallStatus>
where
    R: AsyncBufRead + Unpin,
{
    let mut events = manager.subscribe();
    let session_id = manager.create_call(kind, callee, language).await?;
    info!(%session_id, %kind, "Call started.");

    let mut lines = input.lines();
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if let Some(text) = render(&event) {
                    println!("{text}");
                }
                if matches!(event, SessionEvent::StatusChanged { current, .. } if current.is_terminal()) {
                    break;
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse_input(&line) {
                    Input::Empty => {}
                    Input::End => break,
                    Input::Text(text) => {
                        if let Err(e) = manager.submit_text_turn(text).await {
                            warn!(error = %e, "Text turn was not sent.");
                            eprintln!("Not sent: {e}");
                        }
                    }
                    Input::Voice(path) => match tokio::fs::read(&path).await {
                        Ok(audio) => {
                            if let Err(e) = manager.submit_voice_turn(audio).await {
                                warn!(error = %e, "Voice turn was not sent.");
                                eprintln!("Not sent: {e}");
                            }
                        }
                        Err(e) => eprintln!("Could not read {}: {e}", path.display()),
                    },
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted; ending the call.");
                break;
            }
        }
    }

    let status = manager.end_call().await;
    while let Some(event) = events.try_recv() {
        if let Some(text) = render(&event) {
            println!("{text}");
        }
    }
    Ok(status)
}
