use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::buffer::properties::BufferProperties;
use crate::buffer::shared::SharedAudioBuffer;
use crate::models::error::FanOutError;

/// Capabilities a collaborator can resolve from a [`ServiceProvider`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    BufferData,
    BufferProperties,
}

impl Capability {
    /// Legacy lookup name.
    pub fn name(self) -> &'static str {
        match self {
            Self::BufferData => "AudioSourceBufferData",
            Self::BufferProperties => "AudioSourceBufferProperties",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Capability {
    type Err = FanOutError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        [Self::BufferData, Self::BufferProperties]
            .into_iter()
            .find(|capability| capability.name().eq_ignore_ascii_case(name))
            .ok_or_else(|| FanOutError::UnknownCapability(name.to_string()))
    }
}

/// A resolved capability.
#[derive(Clone)]
pub enum Service {
    BufferData(Arc<SharedAudioBuffer>),
    BufferProperties(Arc<BufferProperties>),
}

/// Late-bound access to the shared buffer and its property store.
pub trait ServiceProvider {
    fn query_service(&self, capability: Capability) -> Option<Service>;

    /// Resolve by legacy name. Unknown names resolve to nothing.
    fn query_service_by_name(&self, name: &str) -> Option<Service> {
        match name.parse::<Capability>() {
            Ok(capability) => self.query_service(capability),
            Err(e) => {
                log::warn!("Service lookup failed: {}", e);
                None
            }
        }
    }

    fn buffer_data(&self) -> Option<Arc<SharedAudioBuffer>> {
        match self.query_service(Capability::BufferData)? {
            Service::BufferData(buffer) => Some(buffer),
            Service::BufferProperties(_) => None,
        }
    }

    fn buffer_properties(&self) -> Option<Arc<BufferProperties>> {
        match self.query_service(Capability::BufferProperties)? {
            Service::BufferProperties(properties) => Some(properties),
            Service::BufferData(_) => None,
        }
    }
}

/// The buffer and property store of one bound session.
#[derive(Clone)]
pub struct BufferServices {
    pub buffer: Arc<SharedAudioBuffer>,
    pub properties: Arc<BufferProperties>,
}

impl BufferServices {
    /// A fresh, empty buffer with its property store.
    pub fn new() -> Self {
        let buffer = Arc::new(SharedAudioBuffer::new());
        let properties = Arc::new(BufferProperties::new(Arc::clone(&buffer)));
        Self { buffer, properties }
    }
}

impl Default for BufferServices {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceProvider for BufferServices {
    fn query_service(&self, capability: Capability) -> Option<Service> {
        Some(match capability {
            Capability::BufferData => Service::BufferData(Arc::clone(&self.buffer)),
            Capability::BufferProperties => Service::BufferProperties(Arc::clone(&self.properties)),
        })
    }
}
