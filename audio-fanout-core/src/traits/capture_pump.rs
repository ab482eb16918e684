use std::sync::Arc;

use crate::models::error::FanOutError;
use crate::traits::capture_source::SharedSource;

/// Destination the pump pushes captured audio into.
///
/// Called from the pump thread.
pub trait AudioSink: Send + Sync {
    /// Forward a run of captured bytes.
    fn write(&self, data: &[u8]);

    /// Forward a property update that applies to data written after it.
    fn set_property(&self, name: &str, value: &str);

    /// The source stopped producing data.
    fn end_of_stream(&self);

    /// The source or pump failed.
    fn error(&self, message: &str);
}

/// Drives reads from a capture source into an [`AudioSink`].
pub trait CapturePump: Send {
    /// Bind the source this pump reads from.
    fn set_source(&mut self, source: SharedSource);

    /// Open the source and start delivering into `sink`.
    fn start(&mut self, sink: Arc<dyn AudioSink>) -> Result<(), FanOutError>;

    /// Stop delivering. Does not close the source.
    fn stop(&mut self) -> Result<(), FanOutError>;

    fn is_running(&self) -> bool;
}

/// Receives upstream errors routed through the sink.
pub trait PumpSite: Send + Sync {
    fn on_pump_error(&self, message: &str);
}
