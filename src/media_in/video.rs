//! Screen frame task
//!
//! Captures and encodes one frame, waits the cadence interval, then queues
//! it. The wait is measured after encoding, so the real period is the
//! interval plus capture time. A failed capture only waits the retry delay.

use crate::channel::Channel;
use crate::events::Outbound;
use crate::retry::sleep_or_cancel;
use crate::run_state::RunState;
use crate::screen::FrameSource;
use crate::supervisor::TaskError;
use std::time::Duration;
use tokio::task;
use tracing::{debug, info, warn};

pub async fn run_frame_capture(
    mut source: Box<dyn FrameSource>,
    out: Channel<Outbound>,
    run: RunState,
    interval: Duration,
    retry_delay: Duration,
) -> Result<(), TaskError> {
    info!("Starting frame capture every {:?}", interval);
    let mut frames = 0u64;

    while run.is_running() {
        // The source moves to the blocking pool and back each round.
        let (returned, captured) = task::spawn_blocking(move || {
            let captured = source.capture();
            (source, captured)
        })
        .await?;
        source = returned;

        match captured {
            Ok(frame) => {
                frames += 1;
                debug!("Frame #{}: {} KB", frames, frame.data.len() / 1024);
                if !sleep_or_cancel(interval, run.token()).await {
                    break;
                }
                tokio::select! {
                    _ = run.stopped() => break,
                    queued = out.put(frame.into()) => {
                        if queued.is_err() {
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                warn!("Frame capture failed: {}", e);
                if !sleep_or_cancel(retry_delay, run.token()).await {
                    break;
                }
            }
        }
    }

    info!("Frame capture stopped after {} frames", frames);
    Ok(())
}
