//! Audio devices
//!
//! The orchestrator only sees the [`AudioBackend`] / [`InputStream`] /
//! [`OutputStream`] traits. [`PulseBackend`] implements them with PulseAudio's
//! simple API. All calls block and are meant to run on the blocking pool.

use crate::events::{CAPTURE_SAMPLE_RATE, CHANNELS, CHUNK_FRAMES, PLAYBACK_SAMPLE_RATE};
use libpulse_binding::callbacks::ListResult;
use libpulse_binding::context::{Context, FlagSet as ContextFlagSet, State};
use libpulse_binding::def::Retval;
use libpulse_binding::error::PAErr;
use libpulse_binding::mainloop::standard::{IterateResult, Mainloop};
use libpulse_binding::proplist::{properties, Proplist};
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("failed to open {direction} stream: {source}")]
    Open {
        direction: &'static str,
        #[source]
        source: PAErr,
    },

    #[error("audio read failed: {0}")]
    Read(#[source] PAErr),

    #[error("audio write failed: {0}")]
    Write(#[source] PAErr),

    #[error("audio drain failed: {0}")]
    Drain(#[source] PAErr),

    #[error("PulseAudio context error: {0}")]
    Context(String),

    #[error("audio device unavailable: {0}")]
    Unavailable(String),
}

/// PCM stream parameters. Samples are always S16LE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSpec {
    pub sample_rate: u32,
    pub channels: u8,
    pub chunk_frames: usize,
}

impl StreamSpec {
    pub fn capture() -> Self {
        Self {
            sample_rate: CAPTURE_SAMPLE_RATE,
            channels: CHANNELS,
            chunk_frames: CHUNK_FRAMES,
        }
    }

    pub fn playback() -> Self {
        Self {
            sample_rate: PLAYBACK_SAMPLE_RATE,
            channels: CHANNELS,
            chunk_frames: CHUNK_FRAMES,
        }
    }

    /// Bytes in one read of `chunk_frames` frames.
    pub fn chunk_bytes(&self) -> usize {
        self.chunk_frames * self.channels as usize * 2
    }

    fn pulse_spec(&self) -> Spec {
        Spec {
            format: Format::S16le,
            channels: self.channels,
            rate: self.sample_rate,
        }
    }
}

pub trait AudioBackend: Send + Sync {
    fn open_input(&self, spec: &StreamSpec) -> Result<Box<dyn InputStream>, DeviceError>;
    fn open_output(&self, spec: &StreamSpec) -> Result<Box<dyn OutputStream>, DeviceError>;
}

pub trait InputStream: Send {
    /// Fill `buf` completely with captured PCM.
    fn read(&mut self, buf: &mut [u8]) -> Result<(), DeviceError>;
    fn close(&mut self) -> Result<(), DeviceError>;
}

pub trait OutputStream: Send {
    fn write(&mut self, pcm: &[u8]) -> Result<(), DeviceError>;
    /// Play out whatever is buffered, then release the device.
    fn close(&mut self) -> Result<(), DeviceError>;
}

/// Holds a stream once it has been opened, so teardown can reach it even
/// though a task owns the I/O loop.
pub struct DeviceSlot<T: ?Sized> {
    inner: Arc<Mutex<Option<Box<T>>>>,
}

pub type InputSlot = DeviceSlot<dyn InputStream>;
pub type OutputSlot = DeviceSlot<dyn OutputStream>;

impl<T: ?Sized> Clone for DeviceSlot<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: ?Sized> Default for DeviceSlot<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
        }
    }
}

impl<T: ?Sized> DeviceSlot<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fill(&self, stream: Box<T>) {
        *self.lock() = Some(stream);
    }

    pub fn is_open(&self) -> bool {
        self.lock().is_some()
    }

    /// Run `f` against the stream; `None` if it was never opened or has
    /// already been taken for teardown.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.lock().as_mut().map(|stream| f(stream))
    }

    pub fn take(&self) -> Option<Box<T>> {
        self.lock().take()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Box<T>>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// PulseAudio simple-API backend.
#[derive(Debug, Clone)]
pub struct PulseBackend {
    app_name: String,
    input_device: Option<String>,
    output_device: Option<String>,
}

impl PulseBackend {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            input_device: None,
            output_device: None,
        }
    }

    pub fn with_input_device(mut self, device: Option<String>) -> Self {
        self.input_device = device;
        self
    }

    pub fn with_output_device(mut self, device: Option<String>) -> Self {
        self.output_device = device;
        self
    }

    fn open(
        &self,
        direction: Direction,
        device: Option<&str>,
        stream_name: &str,
        spec: &StreamSpec,
    ) -> Result<Simple, PAErr> {
        Simple::new(
            None,
            &self.app_name,
            direction,
            device,
            stream_name,
            &spec.pulse_spec(),
            None,
            None,
        )
    }
}

impl AudioBackend for PulseBackend {
    fn open_input(&self, spec: &StreamSpec) -> Result<Box<dyn InputStream>, DeviceError> {
        let device = self.input_device.as_deref();
        let simple = self
            .open(Direction::Record, device, "record", spec)
            .map_err(|source| DeviceError::Open {
                direction: "input",
                source,
            })?;
        info!(
            "Audio input open ({}, {} Hz)",
            device.unwrap_or("default"),
            spec.sample_rate
        );
        Ok(Box::new(PulseInput::new(simple)))
    }

    fn open_output(&self, spec: &StreamSpec) -> Result<Box<dyn OutputStream>, DeviceError> {
        let device = self.output_device.as_deref();
        let simple = self
            .open(Direction::Playback, device, "playback", spec)
            .map_err(|source| DeviceError::Open {
                direction: "output",
                source,
            })?;
        info!(
            "Audio output open ({}, {} Hz)",
            device.unwrap_or("default"),
            spec.sample_rate
        );
        Ok(Box::new(PulseOutput::new(simple)))
    }
}

/// The blocking calls the device wrappers need from a simple-API stream.
trait PcmStream: Send {
    fn read(&self, buf: &mut [u8]) -> Result<(), PAErr>;
    fn write(&self, pcm: &[u8]) -> Result<(), PAErr>;
    fn drain(&self) -> Result<(), PAErr>;
}

impl PcmStream for Simple {
    fn read(&self, buf: &mut [u8]) -> Result<(), PAErr> {
        Simple::read(self, buf)
    }

    fn write(&self, pcm: &[u8]) -> Result<(), PAErr> {
        Simple::write(self, pcm)
    }

    fn drain(&self) -> Result<(), PAErr> {
        Simple::drain(self)
    }
}

/// Record stream. `close` drops the connection; later reads fail and later
/// closes do nothing.
struct PulseInput<S = Simple> {
    stream: Option<S>,
}

impl<S> PulseInput<S> {
    fn new(stream: S) -> Self {
        Self {
            stream: Some(stream),
        }
    }
}

impl<S: PcmStream> InputStream for PulseInput<S> {
    fn read(&mut self, buf: &mut [u8]) -> Result<(), DeviceError> {
        match &self.stream {
            Some(stream) => stream.read(buf).map_err(DeviceError::Read),
            None => Err(DeviceError::Unavailable("input closed".into())),
        }
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        if self.stream.take().is_some() {
            debug!("Audio input closed");
        }
        Ok(())
    }
}

/// Playback stream. `close` drains queued audio, then drops the connection
/// even if the drain failed.
struct PulseOutput<S = Simple> {
    stream: Option<S>,
}

impl<S> PulseOutput<S> {
    fn new(stream: S) -> Self {
        Self {
            stream: Some(stream),
        }
    }
}

impl<S: PcmStream> OutputStream for PulseOutput<S> {
    fn write(&mut self, pcm: &[u8]) -> Result<(), DeviceError> {
        match &self.stream {
            Some(stream) => stream.write(pcm).map_err(DeviceError::Write),
            None => Err(DeviceError::Unavailable("output closed".into())),
        }
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        let Some(stream) = self.stream.take() else {
            return Ok(());
        };
        debug!("Draining audio output");
        let drained = stream.drain().map_err(DeviceError::Drain);
        drop(stream);
        drained
    }
}

/// A PulseAudio source as reported by the server.
#[derive(Debug, Clone)]
pub struct AudioDevice {
    pub name: String,
    pub description: String,
    pub sample_rate: u32,
    pub channels: u8,
    /// Monitor of a sink (system playback) rather than a microphone
    pub is_monitor: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Microphone,
    Monitor,
    Any,
}

impl DeviceType {
    fn accepts(self, is_monitor: bool) -> bool {
        match self {
            DeviceType::Microphone => !is_monitor,
            DeviceType::Monitor => is_monitor,
            DeviceType::Any => true,
        }
    }
}

/// Enumerate PulseAudio sources.
pub fn list_devices(device_type: DeviceType) -> Result<Vec<AudioDevice>, DeviceError> {
    let mut proplist =
        Proplist::new().ok_or_else(|| DeviceError::Context("failed to create proplist".into()))?;
    proplist
        .set_str(properties::APPLICATION_NAME, "screenchat-device-lister")
        .map_err(|_| DeviceError::Context("failed to set application name".into()))?;

    let mut mainloop =
        Mainloop::new().ok_or_else(|| DeviceError::Context("failed to create mainloop".into()))?;
    let mut context = Context::new_with_proplist(&mainloop, "screenchat-context", &proplist)
        .ok_or_else(|| DeviceError::Context("failed to create context".into()))?;
    context
        .connect(None, ContextFlagSet::NOFLAGS, None)
        .map_err(|e| DeviceError::Context(ToString::to_string(&e)))?;

    loop {
        iterate(&mut mainloop)?;
        match context.get_state() {
            State::Ready => break,
            State::Failed | State::Terminated => {
                return Err(DeviceError::Context("connection failed".into()))
            }
            _ => {}
        }
    }

    let devices = Rc::new(RefCell::new(Vec::new()));
    let done = Rc::new(Cell::new(false));
    let failed = Rc::new(Cell::new(false));
    {
        let devices = Rc::clone(&devices);
        let done_cb = Rc::clone(&done);
        let failed = Rc::clone(&failed);
        let _op = context
            .introspect()
            .get_source_info_list(move |result| match result {
                ListResult::Item(source) => {
                    let is_monitor = source.monitor_of_sink.is_some()
                        || source
                            .name
                            .as_deref()
                            .is_some_and(|name| name.contains("monitor"));
                    if !device_type.accepts(is_monitor) {
                        return;
                    }
                    if let (Some(name), Some(description)) = (&source.name, &source.description) {
                        devices.borrow_mut().push(AudioDevice {
                            name: name.to_string(),
                            description: description.to_string(),
                            sample_rate: source.sample_spec.rate,
                            channels: source.sample_spec.channels,
                            is_monitor,
                        });
                    }
                }
                ListResult::End => done_cb.set(true),
                ListResult::Error => {
                    failed.set(true);
                    done_cb.set(true);
                }
            });

        while !done.get() {
            iterate(&mut mainloop)?;
        }
    }

    context.disconnect();
    mainloop.quit(Retval(0));

    if failed.get() {
        return Err(DeviceError::Context("source listing failed".into()));
    }
    let devices = devices.take();
    Ok(devices)
}

fn iterate(mainloop: &mut Mainloop) -> Result<(), DeviceError> {
    match mainloop.iterate(false) {
        IterateResult::Quit(_) | IterateResult::Err(_) => {
            Err(DeviceError::Context("mainloop iterate failed".into()))
        }
        IterateResult::Success(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(u32);

    impl InputStream for Counting {
        fn read(&mut self, buf: &mut [u8]) -> Result<(), DeviceError> {
            self.0 += 1;
            buf.fill(self.0 as u8);
            Ok(())
        }

        fn close(&mut self) -> Result<(), DeviceError> {
            Ok(())
        }
    }

    /// Stand-in for a server connection; counts drops and drains.
    #[derive(Default)]
    struct FakePcm {
        released: Arc<AtomicUsize>,
        drains: Arc<AtomicUsize>,
        fail_drain: bool,
    }

    impl PcmStream for FakePcm {
        fn read(&self, buf: &mut [u8]) -> Result<(), PAErr> {
            buf.fill(7);
            Ok(())
        }

        fn write(&self, _pcm: &[u8]) -> Result<(), PAErr> {
            Ok(())
        }

        fn drain(&self) -> Result<(), PAErr> {
            self.drains.fetch_add(1, Ordering::SeqCst);
            if self.fail_drain {
                Err(PAErr(-1))
            } else {
                Ok(())
            }
        }
    }

    impl Drop for FakePcm {
        fn drop(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn input_close_releases_the_stream_once() {
        let pcm = FakePcm::default();
        let released = Arc::clone(&pcm.released);
        let mut input = PulseInput::new(pcm);

        let mut buf = [0u8; 2];
        input.read(&mut buf).unwrap();
        assert_eq!(buf, [7; 2]);

        input.close().unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(matches!(input.read(&mut buf), Err(DeviceError::Unavailable(_))));

        input.close().unwrap();
        drop(input);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn output_close_drains_then_releases_even_on_drain_error() {
        let mut pcm = FakePcm::default();
        pcm.fail_drain = true;
        let released = Arc::clone(&pcm.released);
        let drains = Arc::clone(&pcm.drains);
        let mut output = PulseOutput::new(pcm);
        output.write(&[0; 4]).unwrap();

        assert!(matches!(output.close(), Err(DeviceError::Drain(_))));
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(matches!(output.write(&[0; 4]), Err(DeviceError::Unavailable(_))));

        output.close().unwrap();
        assert_eq!(drains.load(Ordering::SeqCst), 1);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn capture_chunk_is_2048_bytes() {
        assert_eq!(StreamSpec::capture().chunk_bytes(), 2048);
        assert_eq!(StreamSpec::playback().sample_rate, 24_000);
    }

    #[test]
    fn slot_is_empty_until_filled_and_after_take() {
        let slot: InputSlot = DeviceSlot::new();
        assert!(!slot.is_open());
        assert!(slot.with(|_| ()).is_none());

        slot.fill(Box::new(Counting(0)));
        let other = slot.clone();
        let mut buf = [0u8; 4];
        other.with(|s| s.read(&mut buf)).unwrap().unwrap();
        assert_eq!(buf, [1; 4]);

        assert!(slot.take().is_some());
        assert!(!other.is_open());
        assert!(slot.take().is_none());
    }

    #[test]
    fn device_type_filter() {
        assert!(DeviceType::Microphone.accepts(false));
        assert!(!DeviceType::Microphone.accepts(true));
        assert!(DeviceType::Monitor.accepts(true));
        assert!(DeviceType::Any.accepts(true));
    }
}
