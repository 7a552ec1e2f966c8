//! Inbound receiver task
//!
//! Reads the session one remote turn at a time. Audio goes to the playback
//! channel, text is echoed to the console and checked for a termination
//! phrase. When a turn ends, any audio still waiting for playback is dropped.

use crate::channel::{Channel, TryPutError};
use crate::events::SessionReply;
use crate::retry::{Backoff, RetryPolicy};
use crate::run_state::{RunState, StopReason};
use crate::session::{Session, SessionError};
use crate::supervisor::TaskError;
use futures_util::StreamExt;
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What one remote turn produced.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    /// Audio payloads handed to playback.
    pub audio_chunks: usize,
    /// Audio payloads dropped because the playback channel was full.
    pub overflow: usize,
    pub text: String,
    pub terminated: bool,
    /// Payloads drained from the playback channel at the end of the turn.
    pub discarded: usize,
}

pub async fn run_receiver(
    session: Arc<dyn Session>,
    playback: Channel<Vec<u8>>,
    run: RunState,
    phrases: Vec<String>,
    policy: RetryPolicy,
) -> Result<(), TaskError> {
    info!("Inbound receiver started");
    let mut backoff = Backoff::new(policy);
    let mut turns = 0u64;

    while run.is_running() {
        let outcome = tokio::select! {
            _ = run.stopped() => break,
            outcome = receive_turn(session.as_ref(), &playback, &run, &phrases) => outcome,
        };

        match outcome {
            Ok(turn) => {
                backoff.record_success();
                turns += 1;
                debug!(
                    "Turn {}: {} audio chunks, {} chars, {} discarded",
                    turns,
                    turn.audio_chunks,
                    turn.text.len(),
                    turn.discarded
                );
            }
            Err(e) => {
                warn!("Receive failed: {}", e);
                if !backoff.fail_and_wait("receive", run.token()).await {
                    break;
                }
            }
        }
    }

    info!("Inbound receiver stopped after {} turns", turns);
    Ok(())
}

/// Consume one reply stream. Stops early, after stopping the run, if the
/// turn's text contains a termination phrase.
pub async fn receive_turn(
    session: &dyn Session,
    playback: &Channel<Vec<u8>>,
    run: &RunState,
    phrases: &[String],
) -> Result<TurnOutcome, SessionError> {
    let mut outcome = TurnOutcome::default();
    let mut replies = session.receive();

    while let Some(reply) = replies.next().await {
        match reply? {
            SessionReply::Audio(pcm) => match playback.try_put(pcm) {
                Ok(()) => outcome.audio_chunks += 1,
                Err(TryPutError::Full(_)) => {
                    outcome.overflow += 1;
                    warn!("Playback queue full, dropping audio");
                }
                Err(TryPutError::Closed(_)) => {}
            },
            SessionReply::Text(text) => {
                echo(&text);
                outcome.text.push_str(&text);
                // Transcripts arrive in fragments; check the whole turn so far.
                if contains_termination_phrase(&outcome.text, phrases) {
                    info!("Termination phrase received");
                    run.stop(StopReason::Terminated);
                    outcome.terminated = true;
                    break;
                }
            }
        }
    }
    drop(replies);

    if !outcome.text.is_empty() {
        echo("\n");
    }
    outcome.discarded = playback.try_drain();
    if outcome.discarded > 0 {
        debug!("Discarded {} stale audio chunks", outcome.discarded);
    }
    Ok(outcome)
}

/// Case-insensitive substring match against any phrase.
pub fn contains_termination_phrase(text: &str, phrases: &[String]) -> bool {
    let text = text.to_lowercase();
    phrases
        .iter()
        .filter(|p| !p.is_empty())
        .any(|p| text.contains(&p.to_lowercase()))
}

fn echo(text: &str) {
    let mut stdout = std::io::stdout().lock();
    let _ = stdout.write_all(text.as_bytes());
    let _ = stdout.flush();
}
