use std::sync::Arc;

use parking_lot::Mutex;

use crate::models::error::FanOutError;

/// Capture source shared between the adapter (which closes it) and the pump
/// (which opens and reads it).
pub type SharedSource = Arc<Mutex<dyn CaptureSource>>;

/// Outcome of a single [`CaptureSource::read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// `n` bytes were written to the front of the buffer.
    Data(usize),
    /// No data right now; poll again later.
    Idle,
    /// The source has no more data until it is closed and reopened.
    Ended,
}

/// The single upstream capture session (microphone handle, hardware stream).
///
/// Only one reader may be active at a time, which is why the fan-out adapter
/// exists. `read` must return within a bounded time so the pump can be stopped.
pub trait CaptureSource: Send {
    /// Write the 18-byte format description into `out` and return the size
    /// required. Call with an empty slice first to learn the size.
    fn format_description(&self, out: &mut [u8]) -> usize;

    /// Open or reactivate the physical source.
    fn open(&mut self) -> Result<(), FanOutError>;

    /// Read captured bytes into `buf`.
    fn read(&mut self, buf: &mut [u8]) -> Result<ReadStatus, FanOutError>;

    /// Property updates observed since the last call, in order.
    fn take_properties(&mut self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Release the physical source.
    fn close(&mut self) -> Result<(), FanOutError>;
}
