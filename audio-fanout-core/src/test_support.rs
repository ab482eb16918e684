//! Test doubles for capture sources, pumps and sinks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::models::audio_format::AudioFormat;
use crate::models::error::FanOutError;
use crate::traits::capture_pump::{AudioSink, CapturePump};
use crate::traits::capture_source::{CaptureSource, ReadStatus, SharedSource};

#[derive(Default)]
struct CounterState {
    opens: AtomicUsize,
    closes: AtomicUsize,
    fail_next_open: AtomicBool,
    open_thread: Mutex<Option<String>>,
}

/// Open/close counts of a [`ScriptedSource`], readable after the source moved.
#[derive(Clone, Default)]
pub(crate) struct SourceCounters(Arc<CounterState>);

impl SourceCounters {
    pub(crate) fn opens(&self) -> usize {
        self.0.opens.load(Ordering::SeqCst)
    }

    pub(crate) fn closes(&self) -> usize {
        self.0.closes.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_next_open(&self) {
        self.0.fail_next_open.store(true, Ordering::SeqCst);
    }

    /// Name of the thread that last opened the source.
    pub(crate) fn open_thread(&self) -> Option<String> {
        self.0.open_thread.lock().clone()
    }
}

/// Spin until `condition` holds, failing the test after five seconds.
pub(crate) fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        thread::sleep(Duration::from_millis(1));
    }
}

enum Script {
    Finite,
    Endless,
    Failing(String),
}

/// Capture source that replays queued chunks.
pub(crate) struct ScriptedSource {
    format_blob: Vec<u8>,
    chunks: VecDeque<Vec<u8>>,
    properties: Vec<(String, String)>,
    script: Script,
    counters: SourceCounters,
}

impl ScriptedSource {
    /// Replays `chunks` once, then ends.
    pub(crate) fn new(chunks: Vec<Vec<u8>>) -> Self {
        Self {
            format_blob: AudioFormat::pcm(16000, 16, 1).to_wave_format_bytes().to_vec(),
            chunks: chunks.into(),
            properties: Vec::new(),
            script: Script::Finite,
            counters: SourceCounters::default(),
        }
    }

    /// Never produces data and never ends.
    pub(crate) fn endless() -> Self {
        Self {
            script: Script::Endless,
            ..Self::new(Vec::new())
        }
    }

    /// Every read fails with `message`.
    pub(crate) fn failing(message: &str) -> Self {
        Self {
            script: Script::Failing(message.to_string()),
            ..Self::new(Vec::new())
        }
    }

    pub(crate) fn with_format(mut self, format: AudioFormat) -> Self {
        self.format_blob = format.to_wave_format_bytes().to_vec();
        self
    }

    pub(crate) fn with_format_blob(mut self, blob: Vec<u8>) -> Self {
        self.format_blob = blob;
        self
    }

    pub(crate) fn queue_property(&mut self, name: &str, value: &str) {
        self.properties.push((name.to_string(), value.to_string()));
    }

    pub(crate) fn counters(&self) -> SourceCounters {
        self.counters.clone()
    }
}

impl CaptureSource for ScriptedSource {
    fn format_description(&self, out: &mut [u8]) -> usize {
        if out.len() >= self.format_blob.len() {
            out[..self.format_blob.len()].copy_from_slice(&self.format_blob);
        }
        self.format_blob.len()
    }

    fn open(&mut self) -> Result<(), FanOutError> {
        *self.counters.0.open_thread.lock() = thread::current().name().map(str::to_string);
        if self.counters.0.fail_next_open.swap(false, Ordering::SeqCst) {
            return Err(FanOutError::UpstreamFailure("open failed".into()));
        }
        self.counters.0.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<ReadStatus, FanOutError> {
        if let Script::Failing(message) = &self.script {
            return Err(FanOutError::UpstreamFailure(message.clone()));
        }

        match self.chunks.pop_front() {
            Some(mut chunk) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    self.chunks.push_front(chunk.split_off(n));
                }
                Ok(ReadStatus::Data(n))
            }
            None => match self.script {
                Script::Endless => Ok(ReadStatus::Idle),
                _ => Ok(ReadStatus::Ended),
            },
        }
    }

    fn take_properties(&mut self) -> Vec<(String, String)> {
        std::mem::take(&mut self.properties)
    }

    fn close(&mut self) -> Result<(), FanOutError> {
        self.counters.0.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SinkEvent {
    Write(Vec<u8>),
    Property(String, String),
    End,
    Error(String),
}

/// Sink that records everything pushed into it.
#[derive(Default)]
pub(crate) struct SinkLog {
    events: Mutex<Vec<SinkEvent>>,
}

impl SinkLog {
    pub(crate) fn writes(&self) -> Vec<Vec<u8>> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                SinkEvent::Write(data) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn errors(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                SinkEvent::Error(message) => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn ended(&self) -> bool {
        self.events.lock().contains(&SinkEvent::End)
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .map(|event| match event {
                SinkEvent::Write(data) => format!("write {:?}", data),
                SinkEvent::Property(name, value) => format!("property {}={}", name, value),
                SinkEvent::End => "end".to_string(),
                SinkEvent::Error(message) => format!("error {}", message),
            })
            .collect()
    }
}

impl AudioSink for SinkLog {
    fn write(&self, data: &[u8]) {
        self.events.lock().push(SinkEvent::Write(data.to_vec()));
    }

    fn set_property(&self, name: &str, value: &str) {
        self.events
            .lock()
            .push(SinkEvent::Property(name.to_string(), value.to_string()));
    }

    fn end_of_stream(&self) {
        self.events.lock().push(SinkEvent::End);
    }

    fn error(&self, message: &str) {
        self.events.lock().push(SinkEvent::Error(message.to_string()));
    }
}

#[derive(Default)]
struct ManualPumpState {
    source: Option<SharedSource>,
    sink: Option<Arc<dyn AudioSink>>,
    starts: usize,
    stops: usize,
    fail_next_start: bool,
}

/// Pump driven by the test thread. Clones share state, so a test keeps one
/// clone to push data after handing another to the adapter.
#[derive(Clone, Default)]
pub(crate) struct ManualPump {
    state: Arc<Mutex<ManualPumpState>>,
}

impl ManualPump {
    fn sink(&self) -> Option<Arc<dyn AudioSink>> {
        self.state.lock().sink.clone()
    }

    /// Push a chunk if the pump is running. Returns whether it was delivered.
    pub(crate) fn emit(&self, data: &[u8]) -> bool {
        match self.sink() {
            Some(sink) => {
                sink.write(data);
                true
            }
            None => false,
        }
    }

    pub(crate) fn emit_property(&self, name: &str, value: &str) {
        if let Some(sink) = self.sink() {
            sink.set_property(name, value);
        }
    }

    pub(crate) fn emit_end_of_stream(&self) {
        if let Some(sink) = self.sink() {
            sink.end_of_stream();
        }
    }

    pub(crate) fn emit_error(&self, message: &str) {
        if let Some(sink) = self.sink() {
            sink.error(message);
        }
    }

    pub(crate) fn starts(&self) -> usize {
        self.state.lock().starts
    }

    pub(crate) fn stops(&self) -> usize {
        self.state.lock().stops
    }

    pub(crate) fn fail_next_start(&self) {
        self.state.lock().fail_next_start = true;
    }
}

impl CapturePump for ManualPump {
    fn set_source(&mut self, source: SharedSource) {
        self.state.lock().source = Some(source);
    }

    fn start(&mut self, sink: Arc<dyn AudioSink>) -> Result<(), FanOutError> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next_start) {
            return Err(FanOutError::UpstreamFailure("pump refused to start".into()));
        }
        if state.sink.is_some() {
            return Err(FanOutError::ConfigurationFailed("pump already running".into()));
        }
        let source = state.source.clone().ok_or(FanOutError::NotBound)?;
        source.lock().open()?;
        state.sink = Some(sink);
        state.starts += 1;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), FanOutError> {
        let mut state = self.state.lock();
        if state.sink.take().is_some() {
            state.stops += 1;
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.state.lock().sink.is_some()
    }
}
