//! Hand-off between a WASAPI capture thread and the fan-out pump.
//!
//! The capture thread converts shared-mode Float32 packets to 16-bit PCM and
//! pushes them here; the pump drains whole frames through
//! `CaptureSource::read`.

use std::collections::VecDeque;

use audio_fanout_core::models::audio_format::AudioFormat;
use audio_fanout_core::models::error::FanOutError;
use audio_fanout_core::traits::capture_source::ReadStatus;

/// Convert one Float32 sample to little-endian 16-bit PCM.
pub fn f32_to_pcm16(sample: f32) -> [u8; 2] {
    let scaled = (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
    scaled.to_le_bytes()
}

/// Byte queue of 16-bit PCM frames.
///
/// Overflow behavior: drops the oldest whole frames.
pub(crate) struct CaptureQueue {
    bytes: VecDeque<u8>,
    frame_size: usize,
    capacity: usize,
    failure: Option<String>,
    finished: bool,
    dropped_bytes: u64,
}

impl CaptureQueue {
    /// Queue holding at most `max_buffered` worth of audio in `format`.
    pub(crate) fn new(format: &AudioFormat, max_buffered: std::time::Duration) -> Self {
        let frame_size = usize::from(format.block_align()).max(1);
        let wanted = (format.byte_rate() as f64 * max_buffered.as_secs_f64()) as usize;
        let capacity = (wanted / frame_size).max(1) * frame_size;

        Self {
            bytes: VecDeque::with_capacity(capacity),
            frame_size,
            capacity,
            failure: None,
            finished: false,
            dropped_bytes: 0,
        }
    }

    /// Clear everything for a new capture run.
    pub(crate) fn reset(&mut self) {
        self.bytes.clear();
        self.failure = None;
        self.finished = false;
        self.dropped_bytes = 0;
    }

    pub(crate) fn push_samples(&mut self, samples: &[f32]) {
        for &sample in samples {
            self.bytes.extend(f32_to_pcm16(sample));
        }
        self.enforce_capacity();
    }

    pub(crate) fn push_silence(&mut self, samples: usize) {
        self.bytes.extend(std::iter::repeat(0u8).take(samples * 2));
        self.enforce_capacity();
    }

    /// Record a capture-thread failure; reported once the queue drains.
    pub(crate) fn fail(&mut self, message: String) {
        self.failure.get_or_insert(message);
        self.finished = true;
    }

    pub(crate) fn finish(&mut self) {
        self.finished = true;
    }

    pub(crate) fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes
    }

    pub(crate) fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Drain whole frames into `buf`, which must hold at least one frame.
    pub(crate) fn read(&mut self, buf: &mut [u8]) -> Result<ReadStatus, FanOutError> {
        if !self.bytes.is_empty() {
            if buf.len() < self.frame_size {
                return Err(FanOutError::ConfigurationFailed(format!(
                    "read buffer of {} bytes is smaller than one {}-byte frame",
                    buf.len(),
                    self.frame_size
                )));
            }
            let n = buf.len().min(self.bytes.len()) / self.frame_size * self.frame_size;

            for (slot, byte) in buf.iter_mut().zip(self.bytes.drain(..n)) {
                *slot = byte;
            }
            return Ok(ReadStatus::Data(n));
        }

        if let Some(message) = self.failure.take() {
            return Err(FanOutError::UpstreamFailure(message));
        }
        if self.finished {
            Ok(ReadStatus::Ended)
        } else {
            Ok(ReadStatus::Idle)
        }
    }

    fn enforce_capacity(&mut self) {
        if self.bytes.len() <= self.capacity {
            return;
        }
        let excess = self.bytes.len() - self.capacity;
        let excess = excess.div_ceil(self.frame_size) * self.frame_size;
        let excess = excess.min(self.bytes.len());
        self.bytes.drain(..excess);

        if self.dropped_bytes == 0 {
            log::warn!("Capture queue overflow; dropping oldest audio");
        }
        self.dropped_bytes += excess as u64;
    }
}
