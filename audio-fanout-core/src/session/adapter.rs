use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::models::audio_format::AudioFormat;
use crate::models::config::FanOutConfig;
use crate::models::diagnostics::{AdapterDiagnostics, UpstreamFailure};
use crate::models::error::FanOutError;
use crate::models::state::AdapterState;
use crate::pump::buffer_writer::BufferWriter;
use crate::pump::threaded::ThreadedPump;
use crate::session::reader::{ClientId, ClientReader, ClientSite};
use crate::traits::capture_pump::{AudioSink, CapturePump, PumpSite};
use crate::traits::capture_source::{CaptureSource, SharedSource};
use crate::traits::delegate::FanOutDelegate;
use crate::traits::services::{BufferServices, Capability, Service, ServiceProvider};

/// Everything created when a capture session is bound.
struct Binding {
    source: SharedSource,
    pump: Box<dyn CapturePump>,
    sink: Arc<dyn AudioSink>,
    format: Arc<AudioFormat>,
    services: BufferServices,
    capturing: bool,
}

impl Binding {
    /// Stop the pump, close the source and end the buffer. Returns whether
    /// capture was running.
    fn stop_capture(&mut self) -> bool {
        if !self.capturing {
            return false;
        }

        if let Err(e) = self.pump.stop() {
            log::error!("Failed to stop pump: {}", e);
        }
        if let Err(e) = self.source.lock().close() {
            log::error!("Failed to close capture source: {}", e);
        }
        self.services.buffer.close();
        self.capturing = false;
        true
    }
}

/// Client-count bookkeeping, guarded by the adapter's lifetime lock.
struct Lifetime {
    state: AdapterState,
    binding: Option<Binding>,
    live_clients: usize,
    pump_starts: u64,
    pump_stops: u64,
    protocol_violations: u64,
}

/// Delegate events collected under the lifetime lock, delivered after it.
enum Notice {
    State(AdapterState),
    Connected(ClientId, usize),
    Disconnected(ClientId, usize),
    ProtocolViolation(ClientId),
    UpstreamFailure(UpstreamFailure),
}

type SharedDelegate = Arc<Mutex<Option<Arc<dyn FanOutDelegate>>>>;

struct AdapterInner {
    id: Uuid,
    config: FanOutConfig,
    delegate: SharedDelegate,
    lifetime: Mutex<Lifetime>,
    next_client_id: AtomicU64,
    last_upstream_failure: Mutex<Option<UpstreamFailure>>,
    /// Upstream failures reported from the pump thread, delivered to the
    /// delegate by the notifier thread. `None` once torn down.
    pump_failures: Mutex<Option<Sender<UpstreamFailure>>>,
}

impl AdapterInner {
    fn notify(&self, notices: Vec<Notice>) {
        if notices.is_empty() {
            return;
        }
        let Some(delegate) = self.delegate.lock().clone() else {
            return;
        };

        for notice in notices {
            match notice {
                Notice::State(state) => delegate.on_state_changed(state),
                Notice::Connected(id, live) => delegate.on_client_connected(id, live),
                Notice::Disconnected(id, live) => delegate.on_client_disconnected(id, live),
                Notice::ProtocolViolation(id) => delegate.on_protocol_violation(id),
                Notice::UpstreamFailure(failure) => delegate.on_upstream_failure(&failure),
            }
        }
    }

    fn record_failure(&self, message: String, notices: &mut Vec<Notice>) {
        let failure = UpstreamFailure::now(message);
        *self.last_upstream_failure.lock() = Some(failure.clone());
        notices.push(Notice::UpstreamFailure(failure));
    }

    fn connect(&self, client_id: ClientId) -> Result<(), FanOutError> {
        let mut notices = Vec::new();
        let result = self.connect_locked(&mut self.lifetime.lock(), client_id, &mut notices);
        self.notify(notices);
        result
    }

    fn connect_locked(
        &self,
        lifetime: &mut Lifetime,
        client_id: ClientId,
        notices: &mut Vec<Notice>,
    ) -> Result<(), FanOutError> {
        let binding = lifetime.binding.as_mut().ok_or(FanOutError::NotBound)?;

        if lifetime.live_clients == 0 {
            binding.services.buffer.reopen();
            if let Err(e) = binding.pump.start(Arc::clone(&binding.sink)) {
                log::error!("[{}] Failed to start capture for client {}: {}", self.id, client_id, e);
                let message = format!("failed to start capture: {}", e);
                self.record_failure(message.clone(), notices);
                return Err(FanOutError::UpstreamFailure(message));
            }
            binding.capturing = true;
            lifetime.pump_starts += 1;
            lifetime.state = AdapterState::Active;
            notices.push(Notice::State(AdapterState::Active));
            log::info!("[{}] Capture started", self.id);
        }

        lifetime.live_clients += 1;
        log::debug!(
            "[{}] Client {} connected ({} live)",
            self.id,
            client_id,
            lifetime.live_clients
        );
        notices.push(Notice::Connected(client_id, lifetime.live_clients));
        Ok(())
    }

    fn disconnect(&self, client_id: ClientId) {
        let mut notices = Vec::new();
        {
            let mut lifetime = self.lifetime.lock();

            if lifetime.live_clients == 0 {
                lifetime.protocol_violations += 1;
                log::error!(
                    "[{}] {}; ignored",
                    self.id,
                    FanOutError::ProtocolViolation { client_id }
                );
                notices.push(Notice::ProtocolViolation(client_id));
            } else {
                lifetime.live_clients -= 1;
                log::debug!(
                    "[{}] Client {} disconnected ({} live)",
                    self.id,
                    client_id,
                    lifetime.live_clients
                );
                notices.push(Notice::Disconnected(client_id, lifetime.live_clients));

                if lifetime.live_clients == 0 {
                    let stopped = lifetime
                        .binding
                        .as_mut()
                        .map(Binding::stop_capture)
                        .unwrap_or(false);
                    if stopped {
                        lifetime.pump_stops += 1;
                        log::info!("[{}] Capture stopped", self.id);
                    }
                    lifetime.state = AdapterState::Idle;
                    notices.push(Notice::State(AdapterState::Idle));
                }
            }
        }
        self.notify(notices);
    }
}

impl ClientSite for AdapterInner {
    fn on_client_disconnect(&self, client_id: ClientId) {
        self.disconnect(client_id);
    }
}

impl PumpSite for AdapterInner {
    /// Runs on the pump thread, which the last disconnect joins while holding
    /// the lifetime lock. Must not take that lock or call the delegate.
    fn on_pump_error(&self, message: &str) {
        if message.is_empty() {
            return;
        }
        log::error!("[{}] Upstream failure: {}", self.id, message);

        let failure = UpstreamFailure::now(message);
        *self.last_upstream_failure.lock() = Some(failure.clone());
        if let Some(sender) = self.pump_failures.lock().as_ref() {
            let _ = sender.send(failure);
        }
    }
}

fn spawn_notifier(
    delegate: SharedDelegate,
    failures: Receiver<UpstreamFailure>,
) -> Result<thread::JoinHandle<()>, FanOutError> {
    thread::Builder::new()
        .name("audio-fanout-notify".into())
        .spawn(move || {
            for failure in failures.iter() {
                let Some(delegate) = delegate.lock().clone() else {
                    continue;
                };
                delegate.on_upstream_failure(&failure);
            }
        })
        .map_err(|e| {
            FanOutError::ConfigurationFailed(format!("failed to spawn notifier thread: {}", e))
        })
}

/// Query the source's format description with the two-call sizing pattern.
fn derive_format(source: &dyn CaptureSource) -> Result<AudioFormat, FanOutError> {
    let required = source.format_description(&mut []);
    if required == 0 {
        return Err(FanOutError::InvalidFormat("capture source reported no format".into()));
    }

    let mut blob = vec![0u8; required];
    let written = source.format_description(&mut blob);
    if written > blob.len() {
        return Err(FanOutError::InvalidFormat(format!(
            "format description grew from {} to {} bytes",
            required, written
        )));
    }
    AudioFormat::from_wave_format_bytes(&blob)
}

/// Presents one exclusive capture session to many independent readers.
///
/// Owns the capture source, the pump bound to it and the shared buffer the
/// pump fills. Capture runs exactly while at least one reader is live:
/// the first reader starts the pump, the last one to close stops it and
/// closes the source.
///
/// ```text
/// [CaptureSource] → [CapturePump] → [BufferWriter] → [SharedAudioBuffer] ─┬→ [ClientReader]
///                                                                        ├→ [ClientReader]
///                                                                        └→ ...
/// ```
///
/// Upstream failures reach the delegate on a dedicated notifier thread, so a
/// delegate may call back into the adapter from any callback.
///
/// Dropping the adapter while readers are still live is a programming error
/// and panics after capture has been shut down.
pub struct FanOutAdapter {
    inner: Arc<AdapterInner>,
    notifier: Option<thread::JoinHandle<()>>,
}

impl FanOutAdapter {
    pub fn new(config: FanOutConfig) -> Result<Self, FanOutError> {
        config.validate().map_err(FanOutError::ConfigurationFailed)?;

        let delegate: SharedDelegate = Arc::new(Mutex::new(None));
        let (failure_tx, failure_rx) = unbounded();
        let notifier = spawn_notifier(Arc::clone(&delegate), failure_rx)?;

        Ok(Self {
            notifier: Some(notifier),
            inner: Arc::new(AdapterInner {
                id: Uuid::new_v4(),
                config,
                delegate,
                lifetime: Mutex::new(Lifetime {
                    state: AdapterState::Unbound,
                    binding: None,
                    live_clients: 0,
                    pump_starts: 0,
                    pump_stops: 0,
                    protocol_violations: 0,
                }),
                next_client_id: AtomicU64::new(0),
                last_upstream_failure: Mutex::new(None),
                pump_failures: Mutex::new(Some(failure_tx)),
            }),
        })
    }

    pub fn set_delegate(&self, delegate: Arc<dyn FanOutDelegate>) {
        *self.inner.delegate.lock() = Some(delegate);
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn config(&self) -> &FanOutConfig {
        &self.inner.config
    }

    pub fn state(&self) -> AdapterState {
        self.inner.lifetime.lock().state
    }

    pub fn live_clients(&self) -> usize {
        self.inner.lifetime.lock().live_clients
    }

    /// Format of the bound session.
    pub fn format(&self) -> Result<Arc<AudioFormat>, FanOutError> {
        self.inner
            .lifetime
            .lock()
            .binding
            .as_ref()
            .map(|binding| Arc::clone(&binding.format))
            .ok_or(FanOutError::NotBound)
    }

    /// Bind the capture session, driven by a [`ThreadedPump`].
    ///
    /// Fails with `ConfigurationFailed` if the configured read size cannot
    /// hold one frame of the session's format.
    pub fn bind_session<S: CaptureSource + 'static>(&self, source: S) -> Result<(), FanOutError> {
        let pump = Box::new(ThreadedPump::new(&self.inner.config));
        self.bind(source, pump, Some(self.inner.config.pump_read_size))
    }

    /// Bind the capture session with a custom pump.
    ///
    /// Derives the format and creates the buffer, but does not start capture.
    pub fn bind_session_with_pump<S: CaptureSource + 'static>(
        &self,
        source: S,
        pump: Box<dyn CapturePump>,
    ) -> Result<(), FanOutError> {
        self.bind(source, pump, None)
    }

    fn bind<S: CaptureSource + 'static>(
        &self,
        source: S,
        mut pump: Box<dyn CapturePump>,
        read_size: Option<usize>,
    ) -> Result<(), FanOutError> {
        let source: SharedSource = Arc::new(Mutex::new(source));

        {
            let mut lifetime = self.inner.lifetime.lock();
            if lifetime.binding.is_some() {
                return Err(FanOutError::AlreadyBound);
            }

            let format = derive_format(&*source.lock())?;
            if let Some(read_size) = read_size {
                if read_size < usize::from(format.block_align()) {
                    return Err(FanOutError::ConfigurationFailed(format!(
                        "pump read size {} is smaller than one {}-byte frame",
                        read_size,
                        format.block_align()
                    )));
                }
            }

            let services = BufferServices::new();
            let inner = Arc::downgrade(&self.inner);
            let site: Weak<dyn PumpSite> = inner;
            let sink: Arc<dyn AudioSink> = Arc::new(BufferWriter::from_services(&services, site)?);
            pump.set_source(Arc::clone(&source));

            log::info!(
                "[{}] Bound capture session: {} Hz, {} bit, {} channel(s), {:?}",
                self.inner.id,
                format.sample_rate,
                format.bits_per_sample,
                format.channels,
                format.encoding
            );

            lifetime.binding = Some(Binding {
                source,
                pump,
                sink,
                format: Arc::new(format),
                services,
                capturing: false,
            });
            lifetime.state = AdapterState::Idle;
        }

        self.inner.notify(vec![Notice::State(AdapterState::Idle)]);
        Ok(())
    }

    /// Create a reader positioned at the buffer tail and connect it, starting
    /// capture if it is the first live reader.
    pub fn create_reader(&self) -> Result<ClientReader, FanOutError> {
        let (format, services) = {
            let lifetime = self.inner.lifetime.lock();
            let binding = lifetime.binding.as_ref().ok_or(FanOutError::NotBound)?;
            (Arc::clone(&binding.format), binding.services.clone())
        };

        let client_id = self.inner.next_client_id.fetch_add(1, Ordering::SeqCst);
        let cursor = services.buffer.register_cursor();

        if let Err(e) = self.inner.connect(client_id) {
            services.buffer.unregister_cursor(cursor);
            return Err(e);
        }

        let inner = Arc::downgrade(&self.inner);
        let site: Weak<dyn ClientSite> = inner;
        Ok(ClientReader::new(
            client_id,
            format,
            services.buffer,
            services.properties,
            cursor,
            site,
        ))
    }

    /// Count a client in; the 0→1 transition starts capture.
    ///
    /// Every connect must be paired with exactly one
    /// [`FanOutAdapter::on_client_disconnect`]. Readers from
    /// [`FanOutAdapter::create_reader`] do this themselves.
    pub fn on_client_connect(&self, client_id: ClientId) -> Result<(), FanOutError> {
        self.inner.connect(client_id)
    }

    /// Count a client out; the 1→0 transition stops capture and closes the
    /// source. A disconnect with no live clients is logged and ignored.
    pub fn on_client_disconnect(&self, client_id: ClientId) {
        self.inner.disconnect(client_id);
    }

    /// Record an upstream error and queue it for the delegate. Readers are
    /// not notified; they observe failure as end of stream.
    pub fn on_pump_error(&self, message: &str) {
        self.inner.on_pump_error(message);
    }

    pub fn diagnostics(&self) -> AdapterDiagnostics {
        let lifetime = self.inner.lifetime.lock();
        AdapterDiagnostics {
            adapter_id: self.inner.id.to_string(),
            state: lifetime.state,
            live_clients: lifetime.live_clients,
            clients_created: self.inner.next_client_id.load(Ordering::SeqCst),
            pump_starts: lifetime.pump_starts,
            pump_stops: lifetime.pump_stops,
            protocol_violations: lifetime.protocol_violations,
            last_upstream_failure: self.inner.last_upstream_failure.lock().clone(),
            buffer: lifetime
                .binding
                .as_ref()
                .map(|binding| binding.services.buffer.stats()),
        }
    }
}

impl ServiceProvider for FanOutAdapter {
    fn query_service(&self, capability: Capability) -> Option<Service> {
        self.inner
            .lifetime
            .lock()
            .binding
            .as_ref()
            .and_then(|binding| binding.services.query_service(capability))
    }
}

impl Drop for FanOutAdapter {
    fn drop(&mut self) {
        let live_clients = {
            let mut guard = self.inner.lifetime.lock();
            let lifetime = &mut *guard;
            if let Some(binding) = lifetime.binding.as_mut() {
                if binding.stop_capture() {
                    lifetime.pump_stops += 1;
                }
                binding.services.buffer.close();
            }
            lifetime.state = AdapterState::TornDown;
            lifetime.live_clients
        };
        self.inner.notify(vec![Notice::State(AdapterState::TornDown)]);

        // Closing the channel ends the notifier once it has drained.
        self.inner.pump_failures.lock().take();
        if let Some(notifier) = self.notifier.take() {
            // The last handle may be dropped from a delegate callback.
            if notifier.thread().id() != thread::current().id() && notifier.join().is_err() {
                log::error!("[{}] Notifier thread panicked", self.inner.id);
            }
        }
        log::info!("[{}] Adapter torn down", self.inner.id);

        if !thread::panicking() {
            assert_eq!(
                live_clients, 0,
                "fan-out adapter dropped with {} live client(s)",
                live_clients
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{wait_until, ManualPump, ScriptedSource, SourceCounters};
    use std::sync::atomic::AtomicBool;
    use std::time::{Duration, Instant};

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn speech_format() -> AudioFormat {
        AudioFormat::pcm(16000, 16, 1)
    }

    /// Adapter bound to a scripted source and a manual pump.
    fn bound() -> (FanOutAdapter, ManualPump, SourceCounters) {
        init_logging();
        let adapter = FanOutAdapter::new(FanOutConfig::default()).unwrap();
        let source = ScriptedSource::endless().with_format(speech_format());
        let counters = source.counters();
        let pump = ManualPump::default();
        adapter
            .bind_session_with_pump(source, Box::new(pump.clone()))
            .unwrap();
        (adapter, pump, counters)
    }

    #[derive(Default)]
    struct RecordingDelegate {
        states: Mutex<Vec<AdapterState>>,
        failures: Mutex<Vec<String>>,
        violations: Mutex<Vec<ClientId>>,
        connected: Mutex<Vec<(ClientId, usize)>>,
        disconnected: Mutex<Vec<(ClientId, usize)>>,
    }

    impl FanOutDelegate for RecordingDelegate {
        fn on_state_changed(&self, state: AdapterState) {
            self.states.lock().push(state);
        }

        fn on_upstream_failure(&self, failure: &UpstreamFailure) {
            self.failures.lock().push(failure.message.clone());
        }

        fn on_client_connected(&self, client_id: ClientId, live_clients: usize) {
            self.connected.lock().push((client_id, live_clients));
        }

        fn on_client_disconnected(&self, client_id: ClientId, live_clients: usize) {
            self.disconnected.lock().push((client_id, live_clients));
        }

        fn on_protocol_violation(&self, client_id: ClientId) {
            self.violations.lock().push(client_id);
        }
    }

    #[test]
    fn rejects_invalid_config() {
        let config = FanOutConfig {
            pump_read_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            FanOutAdapter::new(config),
            Err(FanOutError::ConfigurationFailed(_))
        ));
    }

    #[test]
    fn operations_before_bind_fail() {
        let adapter = FanOutAdapter::new(FanOutConfig::default()).unwrap();
        assert_eq!(adapter.state(), AdapterState::Unbound);
        assert_eq!(adapter.create_reader().unwrap_err(), FanOutError::NotBound);
        assert_eq!(adapter.on_client_connect(1), Err(FanOutError::NotBound));
        assert_eq!(adapter.format().unwrap_err(), FanOutError::NotBound);
        assert!(adapter.buffer_data().is_none());
    }

    #[test]
    fn bind_twice_fails() {
        let (adapter, _pump, _counters) = bound();
        let err = adapter
            .bind_session_with_pump(ScriptedSource::endless(), Box::new(ManualPump::default()))
            .unwrap_err();
        assert_eq!(err, FanOutError::AlreadyBound);
    }

    #[test]
    fn bind_rejects_bad_format() {
        let adapter = FanOutAdapter::new(FanOutConfig::default()).unwrap();

        let empty = ScriptedSource::endless().with_format_blob(Vec::new());
        let err = adapter
            .bind_session_with_pump(empty, Box::new(ManualPump::default()))
            .unwrap_err();
        assert!(matches!(err, FanOutError::InvalidFormat(_)));

        let truncated = ScriptedSource::endless().with_format_blob(vec![1, 0, 1, 0]);
        let err = adapter
            .bind_session_with_pump(truncated, Box::new(ManualPump::default()))
            .unwrap_err();
        assert!(matches!(err, FanOutError::InvalidFormat(_)));
        assert_eq!(adapter.state(), AdapterState::Unbound);
    }

    #[test]
    fn bind_rejects_read_size_below_one_frame() {
        init_logging();
        let adapter = FanOutAdapter::new(FanOutConfig {
            pump_read_size: 3,
            ..Default::default()
        })
        .unwrap();
        let stereo = ScriptedSource::endless().with_format(AudioFormat::pcm(16000, 16, 2));

        let err = adapter.bind_session(stereo).unwrap_err();
        assert!(matches!(err, FanOutError::ConfigurationFailed(_)));
        assert_eq!(adapter.state(), AdapterState::Unbound);

        let mono = ScriptedSource::endless().with_format(speech_format());
        adapter.bind_session(mono).unwrap();
        assert_eq!(adapter.state(), AdapterState::Idle);
    }

    #[test]
    fn bind_does_not_start_capture() {
        let (adapter, pump, counters) = bound();
        assert_eq!(adapter.state(), AdapterState::Idle);
        assert_eq!(*adapter.format().unwrap(), speech_format());
        assert_eq!(pump.starts(), 0);
        assert_eq!(counters.opens(), 0);
    }

    #[test]
    fn two_reader_lifecycle() {
        let (adapter, pump, counters) = bound();

        let a = adapter.create_reader().unwrap();
        assert_eq!(pump.starts(), 1);
        assert_eq!(counters.opens(), 1);
        assert_eq!(adapter.state(), AdapterState::Active);
        assert_eq!(*a.format(), speech_format());

        pump.emit(&[1, 1]);
        let b = adapter.create_reader().unwrap();
        assert_eq!(pump.starts(), 1);
        assert_ne!(a.client_id(), b.client_id());
        assert!(Arc::ptr_eq(&a.shared_format(), &b.shared_format()));

        pump.emit(&[2, 2]);
        assert_eq!(b.read_bytes(16).unwrap(), vec![2, 2]);

        a.close();
        assert_eq!(adapter.live_clients(), 1);
        assert_eq!(pump.stops(), 0);
        assert_eq!(adapter.state(), AdapterState::Active);

        b.close();
        assert_eq!(adapter.live_clients(), 0);
        assert_eq!(pump.stops(), 1);
        assert_eq!(counters.closes(), 1);
        assert_eq!(adapter.state(), AdapterState::Idle);
    }

    #[test]
    fn late_reader_sees_no_earlier_chunks() {
        let (adapter, pump, _counters) = bound();
        let early = adapter.create_reader().unwrap();

        for chunk in 1..=5u8 {
            pump.emit(&[chunk]);
        }
        let late = adapter.create_reader().unwrap();
        pump.emit(&[6]);

        assert_eq!(late.read_bytes(16).unwrap(), vec![6]);
        assert_eq!(early.read_bytes(16).unwrap(), vec![1]);
    }

    #[test]
    fn readers_progress_independently() {
        let (adapter, pump, _counters) = bound();
        let fast = adapter.create_reader().unwrap();
        let slow = adapter.create_reader().unwrap();

        for chunk in 0..10u8 {
            pump.emit(&[chunk, chunk]);
        }

        let fast_seen: Vec<u8> = (0..10).map(|_| fast.read_bytes(2).unwrap()[0]).collect();
        assert_eq!(fast_seen, (0..10).collect::<Vec<u8>>());
        assert_eq!(fast.try_read(&mut [0u8; 2]), Ok(None));

        // The slow reader still has everything, in the same order.
        let slow_seen: Vec<u8> = (0..10).map(|_| slow.read_bytes(2).unwrap()[0]).collect();
        assert_eq!(slow_seen, fast_seen);
    }

    #[test]
    fn close_is_idempotent() {
        let (adapter, pump, _counters) = bound();
        let keep = adapter.create_reader().unwrap();
        let reader = adapter.create_reader().unwrap();

        reader.close();
        reader.close();
        drop(reader);

        assert_eq!(adapter.live_clients(), 1);
        assert_eq!(pump.stops(), 0);
        assert_eq!(adapter.diagnostics().protocol_violations, 0);
        drop(keep);
    }

    #[test]
    fn unmatched_disconnect_is_ignored() {
        let (adapter, pump, _counters) = bound();
        let delegate = Arc::new(RecordingDelegate::default());
        adapter.set_delegate(delegate.clone());

        adapter.on_client_disconnect(42);

        assert_eq!(adapter.live_clients(), 0);
        assert_eq!(pump.stops(), 0);
        assert_eq!(adapter.diagnostics().protocol_violations, 1);
        assert_eq!(delegate.violations.lock().as_slice(), &[42]);
    }

    #[test]
    fn manual_connect_and_disconnect() {
        let (adapter, pump, _counters) = bound();

        adapter.on_client_connect(100).unwrap();
        adapter.on_client_connect(101).unwrap();
        assert_eq!(pump.starts(), 1);

        adapter.on_client_disconnect(100);
        adapter.on_client_disconnect(101);
        adapter.on_client_disconnect(101);
        assert_eq!(pump.stops(), 1);
        assert_eq!(adapter.live_clients(), 0);
        assert_eq!(adapter.diagnostics().protocol_violations, 1);
    }

    #[test]
    fn reconnect_restarts_capture_at_fresh_tail() {
        let (adapter, pump, counters) = bound();

        let first = adapter.create_reader().unwrap();
        pump.emit(&[1]);
        drop(first);
        assert!(!pump.emit(&[2]));

        let second = adapter.create_reader().unwrap();
        assert_eq!(pump.starts(), 2);
        assert_eq!(counters.opens(), 2);
        assert_eq!(counters.closes(), 1);

        pump.emit(&[3]);
        assert_eq!(second.read_bytes(16).unwrap(), vec![3]);
    }

    #[test]
    fn pump_start_failure_leaves_adapter_idle() {
        let (adapter, pump, _counters) = bound();
        let delegate = Arc::new(RecordingDelegate::default());
        adapter.set_delegate(delegate.clone());
        pump.fail_next_start();

        let err = adapter.create_reader().unwrap_err();
        assert!(matches!(err, FanOutError::UpstreamFailure(_)));
        assert_eq!(adapter.live_clients(), 0);
        assert_eq!(adapter.state(), AdapterState::Idle);

        let diagnostics = adapter.diagnostics();
        assert!(diagnostics.last_upstream_failure.is_some());
        assert_eq!(diagnostics.buffer.map(|b| b.live_cursors), Some(0));
        assert_eq!(delegate.failures.lock().len(), 1);

        let reader = adapter.create_reader().unwrap();
        assert_eq!(adapter.live_clients(), 1);
        drop(reader);
    }

    #[test]
    fn source_open_failure_is_upstream_failure() {
        let (adapter, _pump, counters) = bound();
        counters.fail_next_open();
        assert!(matches!(
            adapter.create_reader(),
            Err(FanOutError::UpstreamFailure(_))
        ));
        assert_eq!(adapter.live_clients(), 0);
    }

    #[test]
    fn pump_errors_are_recorded_not_propagated() {
        let (adapter, pump, _counters) = bound();
        let delegate = Arc::new(RecordingDelegate::default());
        adapter.set_delegate(delegate.clone());
        let reader = adapter.create_reader().unwrap();

        pump.emit_error("buffer overrun");
        pump.emit(&[5]);

        let failure = adapter.diagnostics().last_upstream_failure.unwrap();
        assert_eq!(failure.message, "buffer overrun");
        wait_until(|| !delegate.failures.lock().is_empty());
        assert_eq!(delegate.failures.lock().as_slice(), &["buffer overrun".to_string()]);
        assert_eq!(reader.read_bytes(16).unwrap(), vec![5]);

        adapter.on_pump_error("");
        assert_eq!(delegate.failures.lock().len(), 1);
    }

    #[test]
    fn upstream_end_of_stream_reaches_readers() {
        let (adapter, pump, _counters) = bound();
        let reader = adapter.create_reader().unwrap();

        pump.emit(&[1, 2]);
        pump.emit_end_of_stream();

        assert_eq!(reader.read_bytes(16).unwrap(), vec![1, 2]);
        assert!(reader.read_bytes(16).unwrap().is_empty());

        let late = adapter.create_reader().unwrap();
        assert!(late.read_bytes(16).unwrap().is_empty());
    }

    #[test]
    fn close_wakes_blocked_read() {
        let (adapter, _pump, _counters) = bound();
        let reader = Arc::new(adapter.create_reader().unwrap());

        let blocked = {
            let reader = Arc::clone(&reader);
            thread::spawn(move || reader.read_bytes(16))
        };

        thread::sleep(Duration::from_millis(50));
        reader.close();

        assert_eq!(blocked.join().unwrap(), Ok(Vec::new()));
        assert_eq!(adapter.live_clients(), 0);
    }

    #[test]
    fn read_waits_for_pumped_data() {
        let (adapter, pump, _counters) = bound();
        let reader = Arc::new(adapter.create_reader().unwrap());

        let waiting = {
            let reader = Arc::clone(&reader);
            thread::spawn(move || reader.read_bytes(16))
        };

        thread::sleep(Duration::from_millis(50));
        pump.emit(&[8, 9]);
        assert_eq!(waiting.join().unwrap(), Ok(vec![8, 9]));
    }

    #[test]
    fn properties_follow_reader_position() {
        let (adapter, pump, _counters) = bound();
        let reader = adapter.create_reader().unwrap();

        pump.emit_property("speaker", "alice");
        pump.emit(&[1]);
        pump.emit_property("speaker", "bob");
        pump.emit(&[2]);

        assert_eq!(reader.property("speaker").as_deref(), Some("alice"));
        reader.read_bytes(16).unwrap();
        assert_eq!(reader.property("speaker").as_deref(), Some("bob"));
    }

    #[test]
    fn concurrent_connects_and_disconnects_balance() {
        let (adapter, pump, counters) = bound();
        let adapter = Arc::new(adapter);

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let adapter = Arc::clone(&adapter);
                thread::spawn(move || {
                    for _ in 0..200 {
                        let reader = adapter.create_reader().expect("create reader");
                        reader.close();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let diagnostics = adapter.diagnostics();
        assert_eq!(diagnostics.live_clients, 0);
        assert_eq!(diagnostics.clients_created, 1600);
        assert_eq!(diagnostics.protocol_violations, 0);
        assert_eq!(diagnostics.pump_starts, diagnostics.pump_stops);
        assert_eq!(pump.starts(), pump.stops());
        assert_eq!(counters.opens(), counters.closes());
        assert_eq!(adapter.state(), AdapterState::Idle);
    }

    #[test]
    fn delegate_sees_lifecycle() {
        let (adapter, _pump, _counters) = bound();
        let delegate = Arc::new(RecordingDelegate::default());
        adapter.set_delegate(delegate.clone());

        let a = adapter.create_reader().unwrap();
        let b = adapter.create_reader().unwrap();
        let (a_id, b_id) = (a.client_id(), b.client_id());
        drop(a);
        drop(b);
        drop(adapter);

        assert_eq!(
            delegate.states.lock().as_slice(),
            &[AdapterState::Active, AdapterState::Idle, AdapterState::TornDown]
        );
        assert_eq!(delegate.connected.lock().as_slice(), &[(a_id, 1), (b_id, 2)]);
        assert_eq!(delegate.disconnected.lock().as_slice(), &[(a_id, 1), (b_id, 0)]);
    }

    #[test]
    fn services_resolve_after_bind() {
        let (adapter, pump, _counters) = bound();
        let reader = adapter.create_reader().unwrap();

        let buffer = adapter.buffer_data().unwrap();
        assert!(adapter.buffer_properties().is_some());
        assert!(matches!(
            adapter.query_service_by_name("audiosourcebufferdata"),
            Some(Service::BufferData(_))
        ));

        pump.emit(&[4, 4, 4]);
        assert_eq!(buffer.stats().bytes_appended, 3);
        drop(reader);
    }

    #[test]
    fn drop_stops_capture() {
        let (adapter, pump, counters) = bound();
        let buffer = adapter.buffer_data().unwrap();
        adapter.on_client_connect(1).unwrap();
        adapter.on_client_disconnect(1);
        drop(adapter);

        assert_eq!(pump.stops(), 1);
        assert_eq!(counters.closes(), 1);
        assert!(buffer.is_closed());
    }

    #[test]
    #[should_panic(expected = "live client")]
    fn drop_with_live_reader_panics() {
        let (adapter, _pump, _counters) = bound();
        let reader = adapter.create_reader().unwrap();
        drop(adapter);
        drop(reader);
    }

    #[test]
    fn threaded_pump_end_to_end() {
        init_logging();
        let adapter = FanOutAdapter::new(FanOutConfig {
            pump_read_size: 3,
            pump_idle_interval_ms: 1,
            ..Default::default()
        })
        .unwrap();
        let source = ScriptedSource::new(vec![vec![1, 2, 3, 4], vec![5, 6]]);
        let counters = source.counters();
        adapter.bind_session(source).unwrap();

        let reader = adapter.create_reader().unwrap();
        let mut received = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let bytes = reader.read_bytes(64).unwrap();
            if bytes.is_empty() {
                break;
            }
            received.extend(bytes);
            assert!(Instant::now() < deadline, "stream did not end");
        }

        assert_eq!(received, vec![1, 2, 3, 4, 5, 6]);
        drop(reader);
        assert_eq!(counters.opens(), 1);
        assert_eq!(counters.closes(), 1);
        assert_eq!(adapter.diagnostics().pump_stops, 1);
    }

    /// Queries the adapter from inside the failure callback.
    #[derive(Default)]
    struct QueryingDelegate {
        adapter: Mutex<Weak<FanOutAdapter>>,
        entered: AtomicBool,
        observed_live: Mutex<Option<usize>>,
    }

    impl FanOutDelegate for QueryingDelegate {
        fn on_state_changed(&self, _state: AdapterState) {}

        fn on_upstream_failure(&self, _failure: &UpstreamFailure) {
            self.entered.store(true, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(100));
            let adapter = self.adapter.lock().upgrade();
            if let Some(adapter) = adapter {
                *self.observed_live.lock() = Some(adapter.live_clients());
            }
        }
    }

    #[test]
    fn delegate_may_query_adapter_while_last_reader_closes() {
        init_logging();
        let adapter = Arc::new(
            FanOutAdapter::new(FanOutConfig {
                pump_idle_interval_ms: 1,
                ..Default::default()
            })
            .unwrap(),
        );
        let delegate = Arc::new(QueryingDelegate::default());
        *delegate.adapter.lock() = Arc::downgrade(&adapter);
        adapter.set_delegate(delegate.clone());
        adapter
            .bind_session(ScriptedSource::failing("device unplugged"))
            .unwrap();

        let reader = adapter.create_reader().unwrap();
        wait_until(|| delegate.entered.load(Ordering::SeqCst));

        let closed = Arc::new(AtomicBool::new(false));
        let closer = {
            let closed = Arc::clone(&closed);
            thread::spawn(move || {
                reader.close();
                closed.store(true, Ordering::SeqCst);
            })
        };
        wait_until(|| closed.load(Ordering::SeqCst));
        closer.join().unwrap();

        wait_until(|| delegate.observed_live.lock().is_some());
        assert_eq!(adapter.live_clients(), 0);
        assert_eq!(adapter.state(), AdapterState::Idle);
        assert_eq!(
            adapter.diagnostics().last_upstream_failure.map(|f| f.message),
            Some("upstream failure: device unplugged".to_string())
        );
    }
}
