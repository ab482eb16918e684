//! WASAPI microphone capture source.
//!
//! Captures from a WASAPI capture endpoint (microphone) in shared mode and
//! presents it to the fan-out adapter as 16-bit PCM at the device's mix rate
//! and channel count.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use windows::core::PCWSTR;
use windows::Win32::Media::Audio::*;
use windows::Win32::System::Com::*;
use windows::Win32::System::Threading::*;

use audio_fanout_core::models::audio_format::AudioFormat;
use audio_fanout_core::models::error::FanOutError;
use audio_fanout_core::traits::capture_source::{CaptureSource, ReadStatus};

use crate::capture_queue::CaptureQueue;
use crate::permissions::check_microphone_permission;

/// Audio kept between the capture thread and the pump before dropping.
const MAX_BUFFERED: Duration = Duration::from_secs(2);

/// WASAPI microphone capture.
///
/// `open` starts a dedicated capture thread registered with MMCSS; the
/// thread owns every COM object. `read` drains what it has queued.
pub struct WasapiMicSource {
    device_id: Option<String>,
    format: AudioFormat,
    queue: Arc<Mutex<CaptureQueue>>,
    running: Arc<AtomicBool>,
    capture_handle: Option<thread::JoinHandle<()>>,
    pending_properties: Vec<(String, String)>,
}

impl WasapiMicSource {
    /// Capture from the system default microphone.
    pub fn default_device() -> Result<Self, FanOutError> {
        Self::create(None)
    }

    /// Capture from a specific microphone by endpoint ID.
    pub fn with_device(id: String) -> Result<Self, FanOutError> {
        Self::create(Some(id))
    }

    fn create(device_id: Option<String>) -> Result<Self, FanOutError> {
        let (sample_rate, channels) = query_mix_format(device_id.as_deref())?;
        let format = AudioFormat::pcm(sample_rate, 16, channels);
        format.validate()?;

        log::info!(
            "WASAPI mic {}: {} Hz, {} channel(s)",
            device_id.as_deref().unwrap_or("default"),
            sample_rate,
            channels
        );

        Ok(Self {
            device_id,
            queue: Arc::new(Mutex::new(CaptureQueue::new(&format, MAX_BUFFERED))),
            format,
            running: Arc::new(AtomicBool::new(false)),
            capture_handle: None,
            pending_properties: Vec::new(),
        })
    }

    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    fn stop_thread(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.capture_handle.take() {
            if handle.join().is_err() {
                log::error!("Mic capture thread panicked");
            }
        }
    }
}

impl CaptureSource for WasapiMicSource {
    fn format_description(&self, out: &mut [u8]) -> usize {
        let blob = self.format.to_wave_format_bytes();
        if out.len() >= blob.len() {
            out[..blob.len()].copy_from_slice(&blob);
        }
        blob.len()
    }

    fn open(&mut self) -> Result<(), FanOutError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(FanOutError::ConfigurationFailed("mic capture already running".into()));
        }
        // A thread that stopped on its own still needs joining.
        self.stop_thread();

        if !check_microphone_permission()? {
            return Err(FanOutError::PermissionDenied);
        }

        self.queue.lock().reset();
        self.running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        let queue = Arc::clone(&self.queue);
        let device_id = self.device_id.clone();

        let handle = thread::Builder::new()
            .name("wasapi-mic-capture".into())
            .spawn(move || {
                match mic_capture_loop(&running, device_id.as_deref(), &queue) {
                    Ok(()) => queue.lock().finish(),
                    Err(e) => {
                        log::error!("Mic capture error: {}", e);
                        queue.lock().fail(e.to_string());
                    }
                }
                running.store(false, Ordering::SeqCst);
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                FanOutError::UpstreamFailure(format!("failed to spawn mic thread: {}", e))
            })?;

        self.capture_handle = Some(handle);
        self.pending_properties.push((
            "capture.device".into(),
            self.device_id.clone().unwrap_or_else(|| "default-mic".into()),
        ));
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<ReadStatus, FanOutError> {
        self.queue.lock().read(buf)
    }

    fn take_properties(&mut self) -> Vec<(String, String)> {
        std::mem::take(&mut self.pending_properties)
    }

    fn close(&mut self) -> Result<(), FanOutError> {
        self.stop_thread();

        let dropped = self.queue.lock().dropped_bytes();
        if dropped > 0 {
            log::warn!(
                "Mic capture dropped {:?} of audio on overflow",
                self.format.duration_of(dropped as usize)
            );
        }
        Ok(())
    }
}

impl Drop for WasapiMicSource {
    fn drop(&mut self) {
        self.stop_thread();
    }
}

/// Sample rate and channel count of the endpoint's shared-mode mix format.
fn query_mix_format(device_id: Option<&str>) -> Result<(u32, u16), FanOutError> {
    unsafe {
        CoInitializeEx(None, COINIT_MULTITHREADED)
            .ok()
            .map_err(|e| FanOutError::UpstreamFailure(format!("CoInitializeEx failed: {}", e)))?;
        let _com_guard = CoUninitializeGuard;

        let audio_client = activate_client(device_id)?;
        let mix_format_ptr = audio_client
            .GetMixFormat()
            .map_err(|e| FanOutError::ConfigurationFailed(format!("GetMixFormat failed: {}", e)))?;

        let mix_format = &*mix_format_ptr;
        let result = (mix_format.nSamplesPerSec, mix_format.nChannels);
        CoTaskMemFree(Some(mix_format_ptr as *const _));
        Ok(result)
    }
}

/// Resolve the endpoint and activate its `IAudioClient`. COM must be
/// initialized on the calling thread.
unsafe fn activate_client(device_id: Option<&str>) -> Result<IAudioClient, FanOutError> {
    let enumerator: IMMDeviceEnumerator = CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL)
        .map_err(|_| FanOutError::DeviceNotAvailable)?;

    let device = match device_id {
        Some(id) => {
            let wide_id: Vec<u16> = id.encode_utf16().chain(std::iter::once(0)).collect();
            enumerator
                .GetDevice(PCWSTR(wide_id.as_ptr()))
                .map_err(|_| FanOutError::DeviceNotAvailable)?
        }
        None => enumerator
            .GetDefaultAudioEndpoint(eCapture, eConsole)
            .map_err(|_| FanOutError::DeviceNotAvailable)?,
    };

    device
        .Activate(CLSCTX_ALL, None)
        .map_err(|e| FanOutError::ConfigurationFailed(format!("Activate failed: {}", e)))
}

/// Capture loop running on the dedicated thread.
///
/// Sequence:
/// 1. CoInitializeEx (MTA)
/// 2. Activate IAudioClient on the endpoint
/// 3. Initialize in shared mode with the mix format
/// 4. Get IAudioCaptureClient service
/// 5. Register with MMCSS for real-time priority
/// 6. Start capture, poll for packets until `running` clears
fn mic_capture_loop(
    running: &AtomicBool,
    device_id: Option<&str>,
    queue: &Mutex<CaptureQueue>,
) -> Result<(), FanOutError> {
    unsafe {
        CoInitializeEx(None, COINIT_MULTITHREADED)
            .ok()
            .map_err(|e| FanOutError::UpstreamFailure(format!("CoInitializeEx failed: {}", e)))?;
        let _com_guard = CoUninitializeGuard;

        let audio_client = activate_client(device_id)?;
        let mix_format_ptr = audio_client
            .GetMixFormat()
            .map_err(|e| FanOutError::ConfigurationFailed(format!("GetMixFormat failed: {}", e)))?;
        let channels = usize::from((*mix_format_ptr).nChannels);

        // 100ms in 100-nanosecond units
        let buffer_duration = 1_000_000;
        let initialized = audio_client.Initialize(
            AUDCLNT_SHAREMODE_SHARED,
            AUDCLNT_STREAMFLAGS_NOPERSIST,
            buffer_duration,
            0,
            mix_format_ptr,
            None,
        );
        CoTaskMemFree(Some(mix_format_ptr as *const _));
        initialized.map_err(|e| {
            FanOutError::ConfigurationFailed(format!("IAudioClient::Initialize failed: {}", e))
        })?;

        let capture_client: IAudioCaptureClient = audio_client
            .GetService()
            .map_err(|e| FanOutError::ConfigurationFailed(format!("GetService failed: {}", e)))?;

        let mut task_index: u32 = 0;
        let task_name: Vec<u16> = "Pro Audio\0".encode_utf16().collect();
        if let Err(e) = AvSetMmThreadCharacteristicsW(PCWSTR(task_name.as_ptr()), &mut task_index) {
            log::warn!("MMCSS registration failed: {}", e);
        }

        audio_client
            .Start()
            .map_err(|e| FanOutError::UpstreamFailure(format!("IAudioClient::Start failed: {}", e)))?;

        let result = drain_packets(running, &capture_client, channels, queue);
        let _ = audio_client.Stop();
        result
    }
}

unsafe fn drain_packets(
    running: &AtomicBool,
    capture_client: &IAudioCaptureClient,
    channels: usize,
    queue: &Mutex<CaptureQueue>,
) -> Result<(), FanOutError> {
    let packet_size = || {
        capture_client
            .GetNextPacketSize()
            .map_err(|e| FanOutError::UpstreamFailure(format!("GetNextPacketSize failed: {}", e)))
    };

    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(10));

        let mut packet_length = packet_size()?;
        while packet_length > 0 {
            let mut buffer_ptr: *mut u8 = std::ptr::null_mut();
            let mut num_frames: u32 = 0;
            let mut flags: u32 = 0;

            capture_client
                .GetBuffer(&mut buffer_ptr, &mut num_frames, &mut flags, None, None)
                .map_err(|e| FanOutError::UpstreamFailure(format!("GetBuffer failed: {}", e)))?;

            if num_frames > 0 && !buffer_ptr.is_null() {
                let total_samples = num_frames as usize * channels;
                if flags & (AUDCLNT_BUFFERFLAGS_SILENT.0 as u32) != 0 {
                    queue.lock().push_silence(total_samples);
                } else {
                    // WASAPI delivers Float32 in shared mode
                    let samples = std::slice::from_raw_parts(buffer_ptr as *const f32, total_samples);
                    queue.lock().push_samples(samples);
                }
            }

            capture_client
                .ReleaseBuffer(num_frames)
                .map_err(|e| FanOutError::UpstreamFailure(format!("ReleaseBuffer failed: {}", e)))?;

            packet_length = packet_size()?;
        }
    }
    Ok(())
}

/// RAII guard to call CoUninitialize when dropped.
struct CoUninitializeGuard;

impl Drop for CoUninitializeGuard {
    fn drop(&mut self) {
        unsafe {
            CoUninitialize();
        }
    }
}
