//! Outbound dispatcher
//!
//! Forwards the audio and frame channels to the session. The two loops run
//! side by side and share nothing; each has its own [`Backoff`]. A message
//! whose send fails is dropped, not requeued.

use crate::channel::Channel;
use crate::events::Outbound;
use crate::retry::{Backoff, RetryPolicy};
use crate::run_state::RunState;
use crate::session::Session;
use crate::supervisor::TaskError;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Per-loop delivery counts, logged when the loop exits.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ForwardStats {
    pub sent: u64,
    pub dropped: u64,
}

pub async fn run_dispatcher(
    session: Arc<dyn Session>,
    audio: Channel<Outbound>,
    frames: Channel<Outbound>,
    run: RunState,
    policy: RetryPolicy,
) -> Result<(), TaskError> {
    info!("Outbound dispatcher started");
    let (audio_stats, frame_stats) = tokio::join!(
        forward("audio", session.as_ref(), &audio, &run, policy),
        forward("frame", session.as_ref(), &frames, &run, policy),
    );
    info!(
        "Outbound dispatcher stopped (audio {:?}, frames {:?})",
        audio_stats, frame_stats
    );
    Ok(())
}

/// Drain `channel` into the session until the run stops.
pub async fn forward(
    label: &str,
    session: &dyn Session,
    channel: &Channel<Outbound>,
    run: &RunState,
    policy: RetryPolicy,
) -> ForwardStats {
    let mut backoff = Backoff::new(policy);
    let mut stats = ForwardStats::default();

    while run.is_running() {
        let msg = tokio::select! {
            _ = run.stopped() => break,
            msg = channel.get() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        let sent = tokio::select! {
            _ = run.stopped() => break,
            sent = session.send(msg) => sent,
        };

        match sent {
            Ok(()) => {
                if backoff.failures() > 0 {
                    debug!("{} send recovered", label);
                }
                backoff.record_success();
                stats.sent += 1;
            }
            Err(e) => {
                stats.dropped += 1;
                warn!("Dropping {} message: {}", label, e);
                if !backoff.fail_and_wait(label, run.token()).await {
                    break;
                }
            }
        }
    }

    stats
}
