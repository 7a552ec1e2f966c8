//! Playback task: inbound audio to the output device, in arrival order.
//!
//! Any output failure ends the run; there is nowhere else to send the audio.

use crate::audio::{AudioBackend, DeviceError, OutputSlot, StreamSpec};
use crate::channel::Channel;
use crate::run_state::RunState;
use crate::supervisor::TaskError;
use std::sync::Arc;
use tokio::task;
use tracing::{error, info};

#[derive(Debug, thiserror::Error)]
pub enum FatalPlaybackError {
    #[error("could not open output device: {0}")]
    Open(#[source] DeviceError),

    #[error("output device write failed: {0}")]
    Write(#[source] DeviceError),
}

pub async fn run_playback(
    backend: Arc<dyn AudioBackend>,
    spec: StreamSpec,
    slot: OutputSlot,
    inbound: Channel<Vec<u8>>,
    run: RunState,
) -> Result<(), TaskError> {
    let output = task::spawn_blocking(move || backend.open_output(&spec))
        .await?
        .map_err(FatalPlaybackError::Open)?;
    slot.fill(output);
    info!("Playback started at {}Hz", spec.sample_rate);

    let mut chunks = 0u64;
    while run.is_running() {
        let pcm = tokio::select! {
            _ = run.stopped() => break,
            pcm = inbound.get() => match pcm {
                Some(pcm) => pcm,
                None => break,
            },
        };

        let writer = slot.clone();
        match task::spawn_blocking(move || writer.with(|out| out.write(&pcm))).await? {
            Some(Ok(())) => chunks += 1,
            Some(Err(e)) => {
                error!("Playback write failed: {}", e);
                return Err(FatalPlaybackError::Write(e).into());
            }
            None => break,
        }
    }

    info!("Playback stopped after {} chunks", chunks);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_state::StopReason;
    use crate::testing::FakeAudio;

    #[tokio::test]
    async fn writes_in_arrival_order() {
        let backend = Arc::new(FakeAudio::new());
        let inbound = Channel::unbounded();
        let run = RunState::new();
        let slot = OutputSlot::new();
        for n in 1..=3u8 {
            inbound.put(vec![n; 4]).await.unwrap();
        }

        let task = tokio::spawn(run_playback(
            backend.clone(),
            StreamSpec::playback(),
            slot.clone(),
            inbound.clone(),
            run.clone(),
        ));
        while backend.written().len() < 3 {
            tokio::task::yield_now().await;
        }
        run.stop(StopReason::Quit);
        task.await.unwrap().unwrap();

        assert_eq!(backend.written(), vec![vec![1; 4], vec![2; 4], vec![3; 4]]);
        assert!(slot.is_open());
    }

    #[tokio::test]
    async fn write_failure_is_fatal() {
        let backend = Arc::new(FakeAudio::new().fail_writes());
        let inbound = Channel::unbounded();
        inbound.put(vec![0; 4]).await.unwrap();

        let result = run_playback(
            backend,
            StreamSpec::playback(),
            OutputSlot::new(),
            inbound,
            RunState::new(),
        )
        .await;
        assert!(matches!(
            result,
            Err(TaskError::Playback(FatalPlaybackError::Write(_)))
        ));
    }

    #[tokio::test]
    async fn closed_channel_ends_playback() {
        let backend = Arc::new(FakeAudio::new());
        let inbound: Channel<Vec<u8>> = Channel::unbounded();
        let slot = OutputSlot::new();
        inbound.close();

        run_playback(
            backend.clone(),
            StreamSpec::playback(),
            slot.clone(),
            inbound,
            RunState::new(),
        )
        .await
        .unwrap();
        assert!(backend.written().is_empty());
        // Still open; closing it is teardown's job.
        assert!(slot.is_open());
    }

    #[tokio::test]
    async fn open_failure_is_fatal() {
        let backend = Arc::new(FakeAudio::new().fail_output_open());
        let slot = OutputSlot::new();
        let result = run_playback(
            backend,
            StreamSpec::playback(),
            slot.clone(),
            Channel::unbounded(),
            RunState::new(),
        )
        .await;
        assert!(matches!(
            result,
            Err(TaskError::Playback(FatalPlaybackError::Open(_)))
        ));
        assert!(!slot.is_open());
    }
}
