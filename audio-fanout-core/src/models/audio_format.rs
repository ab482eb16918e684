use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::FanOutError;

/// Size of the format-description blob exchanged with capture sources.
pub const WAVE_FORMAT_SIZE: usize = 18;

const WAVE_FORMAT_PCM: u16 = 1;
const WAVE_FORMAT_IEEE_FLOAT: u16 = 3;

/// Sample encoding of the upstream stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioEncoding {
    Pcm,
    IeeeFloat,
    /// Any other WAVE format tag, carried through untouched.
    Other(u16),
}

impl AudioEncoding {
    pub fn format_tag(self) -> u16 {
        match self {
            Self::Pcm => WAVE_FORMAT_PCM,
            Self::IeeeFloat => WAVE_FORMAT_IEEE_FLOAT,
            Self::Other(tag) => tag,
        }
    }

    pub fn from_format_tag(tag: u16) -> Self {
        match tag {
            WAVE_FORMAT_PCM => Self::Pcm,
            WAVE_FORMAT_IEEE_FLOAT => Self::IeeeFloat,
            other => Self::Other(other),
        }
    }
}

/// Immutable description of the upstream sample format.
///
/// Derived once when a capture session is bound and shared by reference with
/// every client reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub channels: u16,
    pub encoding: AudioEncoding,
}

impl AudioFormat {
    /// Integer PCM at the given rate, depth and channel count.
    pub fn pcm(sample_rate: u32, bits_per_sample: u16, channels: u16) -> Self {
        Self {
            sample_rate,
            bits_per_sample,
            channels,
            encoding: AudioEncoding::Pcm,
        }
    }

    /// Bytes per interleaved frame. Saturates for formats `validate` rejects.
    pub fn block_align(&self) -> u16 {
        self.checked_block_align().unwrap_or(u16::MAX)
    }

    /// Bytes per second of audio. Saturates for formats `validate` rejects.
    pub fn byte_rate(&self) -> u32 {
        self.checked_byte_rate().unwrap_or(u32::MAX)
    }

    fn checked_block_align(&self) -> Option<u16> {
        let bytes = u32::from(self.channels) * u32::from(self.bits_per_sample) / 8;
        u16::try_from(bytes).ok()
    }

    fn checked_byte_rate(&self) -> Option<u32> {
        let block_align = self.checked_block_align()?;
        self.sample_rate.checked_mul(u32::from(block_align))
    }

    /// Playback duration of `bytes` of audio in this format.
    pub fn duration_of(&self, bytes: usize) -> Duration {
        let byte_rate = self.byte_rate();
        if byte_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(bytes as f64 / byte_rate as f64)
    }

    pub fn validate(&self) -> Result<(), FanOutError> {
        if self.sample_rate == 0 {
            return Err(FanOutError::InvalidFormat("sample rate must be positive".into()));
        }
        if self.channels == 0 {
            return Err(FanOutError::InvalidFormat("channel count must be positive".into()));
        }
        if self.bits_per_sample == 0 || self.bits_per_sample % 8 != 0 {
            return Err(FanOutError::InvalidFormat(format!(
                "unsupported bit depth: {}",
                self.bits_per_sample
            )));
        }
        if self.checked_block_align().is_none() {
            return Err(FanOutError::InvalidFormat(format!(
                "{} channel(s) of {} bits overflow the frame size",
                self.channels, self.bits_per_sample
            )));
        }
        if self.checked_byte_rate().is_none() {
            return Err(FanOutError::InvalidFormat(format!(
                "byte rate overflows at {} Hz",
                self.sample_rate
            )));
        }
        Ok(())
    }

    /// Encode as an 18-byte WAVEFORMATEX-style blob.
    ///
    /// Layout (little-endian):
    /// ```text
    /// [0-1]    format tag
    /// [2-3]    channels
    /// [4-7]    sample_rate
    /// [8-11]   byte_rate = sample_rate * block_align
    /// [12-13]  block_align = channels * bits / 8
    /// [14-15]  bits_per_sample
    /// [16-17]  extra size (always 0)
    /// ```
    pub fn to_wave_format_bytes(&self) -> [u8; WAVE_FORMAT_SIZE] {
        let mut blob = [0u8; WAVE_FORMAT_SIZE];
        blob[0..2].copy_from_slice(&self.encoding.format_tag().to_le_bytes());
        blob[2..4].copy_from_slice(&self.channels.to_le_bytes());
        blob[4..8].copy_from_slice(&self.sample_rate.to_le_bytes());
        blob[8..12].copy_from_slice(&self.byte_rate().to_le_bytes());
        blob[12..14].copy_from_slice(&self.block_align().to_le_bytes());
        blob[14..16].copy_from_slice(&self.bits_per_sample.to_le_bytes());
        blob
    }

    /// Decode a blob produced by [`AudioFormat::to_wave_format_bytes`] or by a
    /// capture source. Trailing extension bytes are ignored.
    pub fn from_wave_format_bytes(blob: &[u8]) -> Result<Self, FanOutError> {
        if blob.len() < WAVE_FORMAT_SIZE {
            return Err(FanOutError::InvalidFormat(format!(
                "format description is {} bytes, need {}",
                blob.len(),
                WAVE_FORMAT_SIZE
            )));
        }

        let tag = u16::from_le_bytes([blob[0], blob[1]]);
        let channels = u16::from_le_bytes([blob[2], blob[3]]);
        let sample_rate = u32::from_le_bytes([blob[4], blob[5], blob[6], blob[7]]);
        let block_align = u16::from_le_bytes([blob[12], blob[13]]);
        let bits_per_sample = u16::from_le_bytes([blob[14], blob[15]]);

        let format = Self {
            sample_rate,
            bits_per_sample,
            channels,
            encoding: AudioEncoding::from_format_tag(tag),
        };
        format.validate()?;

        if block_align != format.block_align() {
            return Err(FanOutError::InvalidFormat(format!(
                "block align {} does not match {} channel(s) of {} bits",
                block_align, channels, bits_per_sample
            )));
        }
        Ok(format)
    }
}
