use std::sync::{Arc, Weak};

use crate::buffer::properties::BufferProperties;
use crate::buffer::shared::SharedAudioBuffer;
use crate::models::error::FanOutError;
use crate::traits::capture_pump::{AudioSink, PumpSite};
use crate::traits::services::{Capability, ServiceProvider};

/// Sink that writes pumped audio into a shared buffer.
///
/// Resolves the buffer and its property store through a [`ServiceProvider`]
/// and reports upstream errors to a [`PumpSite`] it does not keep alive.
pub struct BufferWriter {
    buffer: Arc<SharedAudioBuffer>,
    properties: Arc<BufferProperties>,
    site: Weak<dyn PumpSite>,
}

impl BufferWriter {
    pub fn from_services(services: &dyn ServiceProvider, site: Weak<dyn PumpSite>) -> Result<Self, FanOutError> {
        let buffer = services
            .buffer_data()
            .ok_or_else(|| FanOutError::UnknownCapability(Capability::BufferData.to_string()))?;
        let properties = services
            .buffer_properties()
            .ok_or_else(|| FanOutError::UnknownCapability(Capability::BufferProperties.to_string()))?;

        Ok(Self {
            buffer,
            properties,
            site,
        })
    }
}

impl AudioSink for BufferWriter {
    fn write(&self, data: &[u8]) {
        self.buffer.append(data);
    }

    fn set_property(&self, name: &str, value: &str) {
        self.properties.set(name, value);
    }

    fn end_of_stream(&self) {
        log::debug!("Capture source reached end of stream");
        self.buffer.close();
    }

    fn error(&self, message: &str) {
        match self.site.upgrade() {
            Some(site) => site.on_pump_error(message),
            None => log::error!("Pump error with no site attached: {}", message),
        }
    }
}
