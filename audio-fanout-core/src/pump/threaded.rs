use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::bounded;

use crate::models::config::FanOutConfig;
use crate::models::error::FanOutError;
use crate::traits::capture_pump::{AudioSink, CapturePump};
use crate::traits::capture_source::{ReadStatus, SharedSource};

/// Pump that polls its capture source on a dedicated thread.
///
/// `start` spawns the worker, which opens the source and reports the outcome
/// back before pumping; open failures are still returned from `start`, and a
/// source is never left open without a worker to close it. The worker stops on `stop`, when the source ends,
/// or when a read fails; the last two mark the sink end-of-stream.
pub struct ThreadedPump {
    source: Option<SharedSource>,
    read_size: usize,
    idle_interval: Duration,
    thread_name: String,
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ThreadedPump {
    pub fn new(config: &FanOutConfig) -> Self {
        Self {
            source: None,
            read_size: config.pump_read_size,
            idle_interval: config.pump_idle_interval(),
            thread_name: config.pump_thread_name.clone(),
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    fn join_worker(&mut self) -> Result<(), FanOutError> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| FanOutError::UpstreamFailure("pump thread panicked".into())),
            None => Ok(()),
        }
    }
}

impl CapturePump for ThreadedPump {
    fn set_source(&mut self, source: SharedSource) {
        self.source = Some(source);
    }

    fn start(&mut self, sink: Arc<dyn AudioSink>) -> Result<(), FanOutError> {
        let source = self.source.clone().ok_or(FanOutError::NotBound)?;

        if self.running.load(Ordering::SeqCst) {
            return Err(FanOutError::ConfigurationFailed("pump already running".into()));
        }
        // A worker that finished on its own (end of stream) is still joinable.
        self.join_worker()?;

        self.running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        let read_size = self.read_size;
        let idle_interval = self.idle_interval;
        let (opened_tx, opened_rx) = bounded::<Result<(), FanOutError>>(1);

        let spawned = thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || {
                let opened = source.lock().open();
                let ok = opened.is_ok();
                let _ = opened_tx.send(opened);
                if ok {
                    pump_loop(&running, &source, sink.as_ref(), read_size, idle_interval);
                }
                running.store(false, Ordering::SeqCst);
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(FanOutError::UpstreamFailure(format!(
                    "failed to spawn pump thread: {}",
                    e
                )));
            }
        };

        let opened = opened_rx.recv().unwrap_or_else(|_| {
            Err(FanOutError::UpstreamFailure("pump thread exited before opening the source".into()))
        });
        match opened {
            Ok(()) => {
                self.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                if handle.join().is_err() {
                    log::error!("Pump thread panicked while opening the source");
                }
                self.running.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn stop(&mut self) -> Result<(), FanOutError> {
        self.running.store(false, Ordering::SeqCst);
        self.join_worker()
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for ThreadedPump {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::error!("Failed to stop pump: {}", e);
        }
    }
}

fn pump_loop(
    running: &AtomicBool,
    source: &SharedSource,
    sink: &dyn AudioSink,
    read_size: usize,
    idle_interval: Duration,
) {
    let mut buf = vec![0u8; read_size];

    while running.load(Ordering::SeqCst) {
        let (status, properties) = {
            let mut source = source.lock();
            let status = source.read(&mut buf);
            (status, source.take_properties())
        };

        for (name, value) in &properties {
            sink.set_property(name, value);
        }

        match status {
            Ok(ReadStatus::Data(n)) => sink.write(&buf[..n.min(buf.len())]),
            Ok(ReadStatus::Idle) => thread::sleep(idle_interval),
            Ok(ReadStatus::Ended) => {
                log::info!("Capture source ended");
                sink.end_of_stream();
                break;
            }
            Err(e) => {
                log::error!("Capture source read failed: {}", e);
                sink.error(&e.to_string());
                sink.end_of_stream();
                break;
            }
        }
    }
}
