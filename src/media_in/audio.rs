//! Microphone capture task
//!
//! Opens the input device, then reads fixed-size PCM chunks on the blocking
//! pool and queues them for the dispatcher. Device errors never end the task;
//! it logs, waits one time unit and tries again.

use crate::audio::{AudioBackend, InputSlot, StreamSpec};
use crate::channel::Channel;
use crate::events::{AudioChunk, Outbound};
use crate::retry::sleep_or_cancel;
use crate::run_state::RunState;
use crate::supervisor::TaskError;
use std::sync::Arc;
use std::time::Duration;
use tokio::task;
use tracing::{error, info, warn};

pub async fn run_audio_capture(
    backend: Arc<dyn AudioBackend>,
    spec: StreamSpec,
    slot: InputSlot,
    out: Channel<Outbound>,
    run: RunState,
    retry_delay: Duration,
) -> Result<(), TaskError> {
    info!(
        "Starting audio capture at {}Hz, {} frame chunks",
        spec.sample_rate, spec.chunk_frames
    );

    if !open_input(&backend, spec, &slot, &run, retry_delay).await? {
        return Ok(());
    }

    let chunk_bytes = spec.chunk_bytes();
    let mut chunks = 0u64;
    while run.is_running() {
        let reader = slot.clone();
        // Not cancellable once started; at most one chunk of latency on stop.
        let read = task::spawn_blocking(move || {
            let mut buf = vec![0u8; chunk_bytes];
            reader.with(|input| input.read(&mut buf)).map(|r| r.map(|()| buf))
        })
        .await?;

        match read {
            Some(Ok(pcm)) => {
                chunks += 1;
                tokio::select! {
                    _ = run.stopped() => break,
                    queued = out.put(AudioChunk::new(pcm).into()) => {
                        if queued.is_err() {
                            break;
                        }
                    }
                }
            }
            Some(Err(e)) => {
                error!("Audio read failed: {}", e);
                if !sleep_or_cancel(retry_delay, run.token()).await {
                    break;
                }
            }
            // Released by teardown.
            None => break,
        }
    }

    info!("Audio capture stopped after {} chunks", chunks);
    Ok(())
}

/// Keep trying to open the input device. `false` if the run stopped first.
async fn open_input(
    backend: &Arc<dyn AudioBackend>,
    spec: StreamSpec,
    slot: &InputSlot,
    run: &RunState,
    retry_delay: Duration,
) -> Result<bool, TaskError> {
    while run.is_running() {
        let backend = Arc::clone(backend);
        match task::spawn_blocking(move || backend.open_input(&spec)).await? {
            Ok(input) => {
                slot.fill(input);
                return Ok(true);
            }
            Err(e) => {
                warn!("Audio input unavailable: {}", e);
                if !sleep_or_cancel(retry_delay, run.token()).await {
                    break;
                }
            }
        }
    }
    Ok(false)
}
