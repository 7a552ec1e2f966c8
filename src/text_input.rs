//! Operator text input
//!
//! Lines typed by the operator go straight to the session, bypassing the
//! outbound queues. `q` quits the run. A closed input (EOF) does not; the
//! task keeps polling so the conversation can continue headless.

use crate::events::TextTurn;
use crate::retry::sleep_or_cancel;
use crate::run_state::{RunState, StopReason};
use crate::session::Session;
use crate::supervisor::TaskError;
use async_trait::async_trait;
use std::io::{BufRead, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const PROMPT: &str = "message > ";

#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("input closed")]
    Closed,

    #[error("input read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// A source of operator lines.
#[async_trait]
pub trait LineSource: Send {
    /// Next line without its line terminator.
    async fn next_line(&mut self) -> Result<String, InputError>;
}

/// Reads stdin on a dedicated thread. The thread is detached so a pending
/// read never holds up runtime shutdown.
pub struct StdinLines {
    lines: mpsc::Receiver<std::io::Result<String>>,
}

impl StdinLines {
    pub fn spawn() -> Self {
        let (tx, lines) = mpsc::channel(1);
        let spawned = std::thread::Builder::new()
            .name("stdin-reader".to_string())
            .spawn(move || read_stdin(tx));
        if let Err(e) = spawned {
            warn!("Could not start stdin reader: {}", e);
        }
        Self { lines }
    }
}

fn read_stdin(tx: mpsc::Sender<std::io::Result<String>>) {
    let stdin = std::io::stdin();
    loop {
        {
            let mut stdout = std::io::stdout().lock();
            let _ = stdout.write_all(PROMPT.as_bytes());
            let _ = stdout.flush();
        }
        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => {
                debug!("stdin reached EOF");
                return;
            }
            Ok(_) => {
                if tx.blocking_send(Ok(line)).is_err() {
                    return;
                }
            }
            Err(e) => {
                let _ = tx.blocking_send(Err(e));
                return;
            }
        }
    }
}

#[async_trait]
impl LineSource for StdinLines {
    async fn next_line(&mut self) -> Result<String, InputError> {
        match self.lines.recv().await {
            Some(Ok(line)) => Ok(strip_line_ending(&line).to_string()),
            Some(Err(e)) => Err(InputError::Io(e)),
            None => Err(InputError::Closed),
        }
    }
}

fn strip_line_ending(line: &str) -> &str {
    line.trim_end_matches(['\r', '\n'])
}

pub fn is_quit_command(line: &str) -> bool {
    line.eq_ignore_ascii_case("q")
}

/// Returns once the operator quits or the run stops for another reason.
pub async fn run_text_input(
    session: Arc<dyn Session>,
    mut lines: Box<dyn LineSource>,
    run: RunState,
    retry_delay: Duration,
) -> Result<(), TaskError> {
    info!("Text input ready (type 'q' to quit)");

    while run.is_running() {
        let line = tokio::select! {
            _ = run.stopped() => break,
            line = lines.next_line() => line,
        };

        match line {
            Ok(line) => {
                if is_quit_command(&line) {
                    run.stop(StopReason::Quit);
                    break;
                }
                let sent = tokio::select! {
                    _ = run.stopped() => break,
                    sent = session.send(TextTurn::complete(line).into()) => sent,
                };
                if let Err(e) = sent {
                    warn!("Failed to send text: {}", e);
                    if !sleep_or_cancel(retry_delay, run.token()).await {
                        break;
                    }
                }
            }
            Err(InputError::Closed) => {
                if !sleep_or_cancel(retry_delay, run.token()).await {
                    break;
                }
            }
            Err(e) => {
                warn!("{}", e);
                if !sleep_or_cancel(retry_delay, run.token()).await {
                    break;
                }
            }
        }
    }

    info!("Text input stopped");
    Ok(())
}
