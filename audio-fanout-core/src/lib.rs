//! # audio-fanout-core
//!
//! Platform-agnostic single-to-many audio capture fan-out.
//!
//! One exclusive capture session is pumped into a shared buffer and presented
//! to any number of independent readers. Capture runs exactly while at least
//! one reader is live. Platform backends (Windows WASAPI) implement the
//! `CaptureSource` trait and plug into the generic `FanOutAdapter`.
//!
//! ## Architecture
//!
//! ```text
//! audio-fanout-core (this crate)
//! ├── traits/   ← CaptureSource, CapturePump, AudioSink, FanOutDelegate, ServiceProvider
//! ├── models/   ← FanOutError, AdapterState, FanOutConfig, AudioFormat, diagnostics
//! ├── buffer/   ← SharedAudioBuffer (per-cursor reads), BufferProperties
//! ├── pump/     ← ThreadedPump, BufferWriter
//! └── session/  ← FanOutAdapter (lifecycle orchestrator), ClientReader
//! ```

pub mod buffer;
pub mod models;
pub mod pump;
pub mod session;
pub mod traits;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export key types at crate root for convenience.
pub use buffer::properties::BufferProperties;
pub use buffer::shared::{AudioChunk, ChunkSlice, CursorId, ReadNext, SharedAudioBuffer};
pub use models::audio_format::{AudioEncoding, AudioFormat};
pub use models::config::FanOutConfig;
pub use models::diagnostics::{AdapterDiagnostics, BufferStats, UpstreamFailure};
pub use models::error::FanOutError;
pub use models::state::AdapterState;
pub use pump::buffer_writer::BufferWriter;
pub use pump::threaded::ThreadedPump;
pub use session::adapter::FanOutAdapter;
pub use session::reader::{ClientId, ClientReader};
pub use traits::capture_pump::{AudioSink, CapturePump, PumpSite};
pub use traits::capture_source::{CaptureSource, ReadStatus, SharedSource};
pub use traits::delegate::FanOutDelegate;
pub use traits::services::{BufferServices, Capability, Service, ServiceProvider};
