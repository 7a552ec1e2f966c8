//! Run supervisor
//!
//! Owns one run from connect to teardown:
//!
//! * `Connecting`: open the session (bounded by the connect timeout). A
//!   failure ends the run before any task starts.
//! * `Running`: all tasks share one [`RunState`]. The run stops when text
//!   input returns, a task fails, the remote says a termination phrase, or the
//!   operator interrupts.
//! * `Draining`: close the queues between tasks and wait for every task to
//!   return.
//! * `Closed`: close the session and every device handle that was actually
//!   opened. Every step is attempted; errors are collected into the report.

use crate::audio::{AudioBackend, DeviceError, InputSlot, OutputSlot, StreamSpec};
use crate::channel::Channel;
use crate::dispatcher::run_dispatcher;
use crate::events::Outbound;
use crate::media_in::audio::run_audio_capture;
use crate::media_in::video::run_frame_capture;
use crate::playback::{run_playback, FatalPlaybackError};
use crate::receiver::run_receiver;
use crate::retry::RetryPolicy;
use crate::run_state::{RunState, StopReason};
use crate::screen::FrameSource;
use crate::session::{Connector, Session, SessionError};
use crate::text_input::{run_text_input, LineSource};
use futures_util::FutureExt;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    Running,
    Draining,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    AudioCapture,
    FrameCapture,
    Dispatcher,
    Receiver,
    Playback,
    TextInput,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskKind::AudioCapture => "audio capture",
            TaskKind::FrameCapture => "frame capture",
            TaskKind::Dispatcher => "dispatcher",
            TaskKind::Receiver => "receiver",
            TaskKind::Playback => "playback",
            TaskKind::TextInput => "text input",
        };
        f.write_str(name)
    }
}

/// Unrecoverable failure of a supervised task.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error(transparent)]
    Playback(#[from] FatalPlaybackError),

    #[error("blocking call failed: {0}")]
    Join(#[from] JoinError),

    #[error("task panicked: {0}")]
    Panicked(String),
}

#[derive(Debug)]
pub struct TaskFailure {
    pub task: TaskKind,
    pub error: TaskError,
}

#[derive(Debug, thiserror::Error)]
pub enum TeardownError {
    #[error("closing session: {0}")]
    Session(#[source] SessionError),

    #[error("closing {0}: {1}")]
    Device(&'static str, #[source] DeviceError),

    #[error("closing {0}: {1}")]
    Join(&'static str, #[source] JoinError),
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("could not open session: {0}")]
    Connect(#[source] SessionError),
}

/// How a run ended.
#[derive(Debug)]
pub struct RunReport {
    pub reason: Option<StopReason>,
    pub failures: Vec<TaskFailure>,
    pub teardown_errors: Vec<TeardownError>,
}

impl RunReport {
    /// Whether the process should exit with a failure status.
    pub fn is_fatal(&self) -> bool {
        !self.failures.is_empty() || self.reason == Some(StopReason::Failure)
    }
}

/// Tunables for one run. Durations derive from a single time unit.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub time_unit: Duration,
    pub connect_timeout: Duration,
    pub outbound_capacity: usize,
    /// `None` keeps the playback queue unbounded.
    pub inbound_capacity: Option<usize>,
    pub frame_interval_units: u32,
    pub capture: StreamSpec,
    pub playback: StreamSpec,
    pub termination_phrases: Vec<String>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            time_unit: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(10),
            outbound_capacity: 5,
            inbound_capacity: None,
            frame_interval_units: 2,
            capture: StreamSpec::capture(),
            playback: StreamSpec::playback(),
            termination_phrases: vec!["goodbye".to_string()],
        }
    }
}

impl RunSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_unit(self.time_unit)
    }

    pub fn frame_interval(&self) -> Duration {
        self.time_unit * self.frame_interval_units
    }
}

/// The queues between tasks.
struct Pipes {
    audio_out: Channel<Outbound>,
    frames_out: Channel<Outbound>,
    inbound: Channel<Vec<u8>>,
}

impl Pipes {
    fn new(settings: &RunSettings) -> Self {
        Self {
            audio_out: Channel::bounded(settings.outbound_capacity),
            frames_out: Channel::bounded(settings.outbound_capacity),
            inbound: Channel::with_capacity(settings.inbound_capacity),
        }
    }

    /// Wake every task blocked on a queue; queued items are abandoned.
    fn close(&self) {
        self.audio_out.close();
        self.frames_out.close();
        self.inbound.close();
    }
}

pub struct Supervisor {
    connector: Arc<dyn Connector>,
    audio: Arc<dyn AudioBackend>,
    screen: Option<Box<dyn FrameSource>>,
    lines: Option<Box<dyn LineSource>>,
    settings: RunSettings,
    phase: Phase,
}

impl Supervisor {
    pub fn new(
        connector: Arc<dyn Connector>,
        audio: Arc<dyn AudioBackend>,
        screen: Option<Box<dyn FrameSource>>,
        lines: Box<dyn LineSource>,
        settings: RunSettings,
    ) -> Self {
        Self {
            connector,
            audio,
            screen,
            lines: Some(lines),
            settings,
            phase: Phase::Connecting,
        }
    }

    /// Drive the run to completion. `interrupt` resolving stops the run the
    /// same way `q` does.
    pub async fn run<I>(mut self, interrupt: I) -> Result<RunReport, RunError>
    where
        I: Future<Output = ()>,
    {
        info!("Phase: {:?}", self.phase);
        let session = match connect(self.connector.as_ref(), self.settings.connect_timeout).await {
            Ok(session) => session,
            Err(e) => {
                self.enter(Phase::Closed);
                return Err(RunError::Connect(e));
            }
        };
        self.enter(Phase::Running);

        let run = RunState::new();
        let input_slot = InputSlot::new();
        let output_slot = OutputSlot::new();
        let pipes = Pipes::new(&self.settings);
        let mut tasks = self.spawn_tasks(&session, &run, &pipes, &input_slot, &output_slot);

        let mut failures = Vec::new();
        tokio::pin!(interrupt);
        loop {
            tokio::select! {
                _ = &mut interrupt, if run.is_running() => {
                    info!("Interrupted");
                    run.stop(StopReason::Interrupted);
                }
                joined = tasks.join_next() => match joined {
                    Some(Ok((kind, result))) => {
                        on_task_exit(kind, result, &run, &mut failures)
                    }
                    Some(Err(e)) => {
                        // Tasks are never aborted, so this is a runtime shutdown.
                        error!("Task lost: {}", e);
                        run.stop(StopReason::Failure);
                    }
                    None => break,
                },
            }
            if !run.is_running() && self.phase == Phase::Running {
                self.enter(Phase::Draining);
                pipes.close();
            }
        }

        self.enter(Phase::Closed);
        let teardown_errors = teardown(session.as_ref(), &input_slot, &output_slot).await;

        Ok(RunReport {
            reason: run.reason(),
            failures,
            teardown_errors,
        })
    }

    fn enter(&mut self, phase: Phase) {
        info!("Phase: {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    fn spawn_tasks(
        &mut self,
        session: &Arc<dyn Session>,
        run: &RunState,
        pipes: &Pipes,
        input_slot: &InputSlot,
        output_slot: &OutputSlot,
    ) -> JoinSet<(TaskKind, Result<(), TaskError>)> {
        let settings = &self.settings;
        let unit = settings.time_unit;
        let policy = settings.retry_policy();

        let mut tasks = JoinSet::new();
        tasks.spawn(supervised(
            TaskKind::AudioCapture,
            run_audio_capture(
                Arc::clone(&self.audio),
                settings.capture,
                input_slot.clone(),
                pipes.audio_out.clone(),
                run.clone(),
                unit,
            ),
        ));
        match self.screen.take() {
            Some(screen) => {
                tasks.spawn(supervised(
                    TaskKind::FrameCapture,
                    run_frame_capture(
                        screen,
                        pipes.frames_out.clone(),
                        run.clone(),
                        settings.frame_interval(),
                        unit,
                    ),
                ));
            }
            None => info!("Screen capture disabled"),
        }
        tasks.spawn(supervised(
            TaskKind::Dispatcher,
            run_dispatcher(
                Arc::clone(session),
                pipes.audio_out.clone(),
                pipes.frames_out.clone(),
                run.clone(),
                policy,
            ),
        ));
        tasks.spawn(supervised(
            TaskKind::Receiver,
            run_receiver(
                Arc::clone(session),
                pipes.inbound.clone(),
                run.clone(),
                settings.termination_phrases.clone(),
                policy,
            ),
        ));
        tasks.spawn(supervised(
            TaskKind::Playback,
            run_playback(
                Arc::clone(&self.audio),
                settings.playback,
                output_slot.clone(),
                pipes.inbound.clone(),
                run.clone(),
            ),
        ));

        if let Some(lines) = self.lines.take() {
            tasks.spawn(supervised(
                TaskKind::TextInput,
                run_text_input(Arc::clone(session), lines, run.clone(), unit),
            ));
        }
        tasks
    }
}

async fn connect(
    connector: &dyn Connector,
    limit: Duration,
) -> Result<Arc<dyn Session>, SessionError> {
    match tokio::time::timeout(limit, connector.connect()).await {
        Ok(result) => result,
        Err(_) => Err(SessionError::ConnectTimeout(limit)),
    }
}

fn on_task_exit(
    kind: TaskKind,
    result: Result<(), TaskError>,
    run: &RunState,
    failures: &mut Vec<TaskFailure>,
) {
    match result {
        Ok(()) => {
            info!("{} task finished", kind);
            if kind == TaskKind::TextInput {
                run.stop(StopReason::Quit);
            }
        }
        Err(error) => {
            error!("{} task failed: {}", kind, error);
            run.stop(StopReason::Failure);
            failures.push(TaskFailure { task: kind, error });
        }
    }
}

/// Run a task, turning a panic into a [`TaskError`].
async fn supervised<F>(kind: TaskKind, task: F) -> (TaskKind, Result<(), TaskError>)
where
    F: Future<Output = Result<(), TaskError>>,
{
    let result = AssertUnwindSafe(task)
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(TaskError::Panicked(panic_message(panic.as_ref()))));
    (kind, result)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Release everything the run acquired, in order: session, input, output.
async fn teardown(
    session: &dyn Session,
    input: &InputSlot,
    output: &OutputSlot,
) -> Vec<TeardownError> {
    let mut errors = Vec::new();

    if let Err(e) = session.close().await {
        errors.push(TeardownError::Session(e));
    }

    if let Some(mut stream) = input.take() {
        info!("Closing audio input");
        match tokio::task::spawn_blocking(move || stream.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => errors.push(TeardownError::Device("audio input", e)),
            Err(e) => errors.push(TeardownError::Join("audio input", e)),
        }
    }

    if let Some(mut stream) = output.take() {
        info!("Closing audio output");
        match tokio::task::spawn_blocking(move || stream.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => errors.push(TeardownError::Device("audio output", e)),
            Err(e) => errors.push(TeardownError::Join("audio output", e)),
        }
    }

    for e in &errors {
        warn!("Teardown: {}", e);
    }
    info!("Teardown complete");
    errors
}
