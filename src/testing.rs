//! In-memory collaborators for tests.

use crate::audio::{AudioBackend, DeviceError, InputStream, OutputStream, StreamSpec};
use crate::events::{ImageFrame, Outbound, SessionReply};
use crate::gemini::GeminiError;
use crate::screen::{CaptureError, FrameSource};
use crate::session::{Connector, ReplyStream, Session, SessionError};
use crate::text_input::{InputError, LineSource};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

struct Turn {
    replies: Vec<Result<SessionReply, SessionError>>,
    /// Keep the stream open after the last reply instead of ending the turn.
    held_open: bool,
}

/// Records sends, replays scripted turns. A `receive` with no turn queued
/// waits for the next `push_*` call.
#[derive(Default)]
pub struct FakeSession {
    sent: Mutex<Vec<Outbound>>,
    attempts: Mutex<Vec<Instant>>,
    fail_sends: AtomicUsize,
    turns: Mutex<VecDeque<Turn>>,
    pushed: Notify,
    receive_calls: AtomicUsize,
    closes: AtomicUsize,
}

impl FakeSession {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next_sends(&self, n: usize) {
        self.fail_sends.store(n, Ordering::SeqCst);
    }

    pub fn push_turn(&self, replies: Vec<SessionReply>) {
        self.push(Turn {
            replies: replies.into_iter().map(Ok).collect(),
            held_open: false,
        });
    }

    /// A turn that delivers `replies` and then never completes.
    pub fn push_open_turn(&self, replies: Vec<SessionReply>) {
        self.push(Turn {
            replies: replies.into_iter().map(Ok).collect(),
            held_open: true,
        });
    }

    pub fn push_failed_turn(&self, error: GeminiError) {
        self.push(Turn {
            replies: vec![Err(SessionError::Receive(error))],
            held_open: false,
        });
    }

    fn push(&self, turn: Turn) {
        self.turns.lock().unwrap().push_back(turn);
        self.pushed.notify_one();
    }

    async fn next_turn(&self) -> Turn {
        loop {
            let pushed = self.pushed.notified();
            let turn = self.turns.lock().unwrap().pop_front();
            if let Some(turn) = turn {
                return turn;
            }
            pushed.await;
        }
    }

    /// Successfully delivered messages, in order.
    pub fn sent(&self) -> Vec<Outbound> {
        self.sent.lock().unwrap().clone()
    }

    /// When each send was attempted, including failed ones.
    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn receive_calls(&self) -> usize {
        self.receive_calls.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Session for FakeSession {
    async fn send(&self, msg: Outbound) -> Result<(), SessionError> {
        self.attempts.lock().unwrap().push(Instant::now());
        let failing = self
            .fail_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SessionError::Send(GeminiError::ConnectionClosed));
        }
        self.sent.lock().unwrap().push(msg);
        Ok(())
    }

    fn receive(&self) -> ReplyStream<'_> {
        self.receive_calls.fetch_add(1, Ordering::SeqCst);
        stream::once(self.next_turn())
            .flat_map(|turn| {
                let replies = stream::iter(turn.replies);
                if turn.held_open {
                    replies.chain(stream::pending()).boxed()
                } else {
                    replies.boxed()
                }
            })
            .boxed()
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub enum FakeConnector {
    Ready(Arc<FakeSession>),
    Failing,
    Hanging,
}

impl FakeConnector {
    pub fn new(session: Arc<FakeSession>) -> Self {
        FakeConnector::Ready(session)
    }

    pub fn failing() -> Self {
        FakeConnector::Failing
    }

    pub fn hanging() -> Self {
        FakeConnector::Hanging
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self) -> Result<Arc<dyn Session>, SessionError> {
        match self {
            FakeConnector::Ready(session) => Ok(session.clone()),
            FakeConnector::Failing => Err(SessionError::Connect(GeminiError::SetupNotComplete)),
            FakeConnector::Hanging => std::future::pending().await,
        }
    }
}

#[derive(Default)]
struct AudioCounters {
    input_opens: AtomicUsize,
    input_closes: AtomicUsize,
    output_closes: AtomicUsize,
    reads: AtomicUsize,
    written: Mutex<Vec<Vec<u8>>>,
}

/// Audio backend whose input yields chunks filled with a running counter
/// (1, 2, 3, ...) and whose output records every write.
#[derive(Default)]
pub struct FakeAudio {
    counters: Arc<AudioCounters>,
    input_open_failures: AtomicUsize,
    chunk_limit: Option<usize>,
    fail_output_open: bool,
    fail_writes: Arc<AtomicBool>,
}

impl FakeAudio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_input_opens(self, n: usize) -> Self {
        self.input_open_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Reads fail once `n` chunks have been produced.
    pub fn chunk_limit(mut self, n: usize) -> Self {
        self.chunk_limit = Some(n);
        self
    }

    pub fn fail_output_open(mut self) -> Self {
        self.fail_output_open = true;
        self
    }

    pub fn fail_writes(self) -> Self {
        self.fail_writes.store(true, Ordering::SeqCst);
        self
    }

    pub fn input_opens(&self) -> usize {
        self.counters.input_opens.load(Ordering::SeqCst)
    }

    pub fn input_closes(&self) -> usize {
        self.counters.input_closes.load(Ordering::SeqCst)
    }

    pub fn output_closes(&self) -> usize {
        self.counters.output_closes.load(Ordering::SeqCst)
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.counters.written.lock().unwrap().clone()
    }
}

impl AudioBackend for FakeAudio {
    fn open_input(&self, _spec: &StreamSpec) -> Result<Box<dyn InputStream>, DeviceError> {
        self.counters.input_opens.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .input_open_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DeviceError::Unavailable("no input".into()));
        }
        Ok(Box::new(FakeInput {
            counters: Arc::clone(&self.counters),
            limit: self.chunk_limit,
        }))
    }

    fn open_output(&self, _spec: &StreamSpec) -> Result<Box<dyn OutputStream>, DeviceError> {
        if self.fail_output_open {
            return Err(DeviceError::Unavailable("no output".into()));
        }
        Ok(Box::new(FakeOutput {
            counters: Arc::clone(&self.counters),
            fail_writes: Arc::clone(&self.fail_writes),
        }))
    }
}

struct FakeInput {
    counters: Arc<AudioCounters>,
    limit: Option<usize>,
}

impl InputStream for FakeInput {
    fn read(&mut self, buf: &mut [u8]) -> Result<(), DeviceError> {
        if self
            .limit
            .is_some_and(|limit| self.counters.reads.load(Ordering::SeqCst) >= limit)
        {
            return Err(DeviceError::Unavailable("input exhausted".into()));
        }
        std::thread::sleep(Duration::from_millis(1));
        let n = self.counters.reads.fetch_add(1, Ordering::SeqCst) + 1;
        buf.fill(n as u8);
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        self.counters.input_closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeOutput {
    counters: Arc<AudioCounters>,
    fail_writes: Arc<AtomicBool>,
}

impl OutputStream for FakeOutput {
    fn write(&mut self, pcm: &[u8]) -> Result<(), DeviceError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DeviceError::Unavailable("output gone".into()));
        }
        self.counters.written.lock().unwrap().push(pcm.to_vec());
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        self.counters.output_closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Frame source following a success/failure script; fails once the script
/// runs out. Successful frames carry their sequence number as data.
pub struct FakeFrames {
    script: VecDeque<bool>,
    produced: u8,
}

impl FakeFrames {
    pub fn new(script: Vec<bool>) -> Self {
        Self {
            script: script.into(),
            produced: 0,
        }
    }
}

impl FrameSource for FakeFrames {
    fn capture(&mut self) -> Result<ImageFrame, CaptureError> {
        match self.script.pop_front() {
            Some(true) => {
                self.produced += 1;
                Ok(ImageFrame::jpeg(vec![self.produced]))
            }
            _ => Err(CaptureError::NoMonitor),
        }
    }
}

/// Lines fed from the test through a channel. Dropping the sender closes
/// the input.
pub struct ScriptedLines {
    lines: mpsc::UnboundedReceiver<String>,
}

impl ScriptedLines {
    pub fn new() -> (Self, mpsc::UnboundedSender<String>) {
        let (tx, lines) = mpsc::unbounded_channel();
        (Self { lines }, tx)
    }
}

#[async_trait]
impl LineSource for ScriptedLines {
    async fn next_line(&mut self) -> Result<String, InputError> {
        self.lines.recv().await.ok_or(InputError::Closed)
    }
}
