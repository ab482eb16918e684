//! # audio-fanout-windows
//!
//! Windows WASAPI capture session for audio-fanout.
//!
//! Provides:
//! - `WasapiMicSource`: microphone capture via a WASAPI capture endpoint,
//!   presented as 16-bit PCM
//! - `permissions`: Windows microphone privacy check
//!
//! ## Platform Requirements
//! - Visual Studio Build Tools 2022 + Windows SDK for linking
//!
//! ## Usage
//! ```ignore
//! use audio_fanout_core::{FanOutAdapter, FanOutConfig};
//! use audio_fanout_windows::WasapiMicSource;
//!
//! let adapter = FanOutAdapter::new(FanOutConfig::default())?;
//! adapter.bind_session(WasapiMicSource::default_device()?)?;
//!
//! let reader = adapter.create_reader()?;
//! let chunk = reader.read_bytes(3200)?;
//! ```

pub mod capture_queue;
#[cfg(target_os = "windows")]
pub mod permissions;
#[cfg(target_os = "windows")]
pub mod wasapi_mic;

pub use capture_queue::f32_to_pcm16;
#[cfg(target_os = "windows")]
pub use wasapi_mic::WasapiMicSource;
