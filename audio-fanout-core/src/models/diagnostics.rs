use serde::Serialize;

use super::error::FanOutError;
use super::state::AdapterState;

/// Upstream error reported by the pump or capture session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpstreamFailure {
    pub message: String,
    /// RFC 3339 timestamp of when the failure was recorded.
    pub recorded_at: String,
}

impl UpstreamFailure {
    pub fn now(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            recorded_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Point-in-time view of a shared audio buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    /// Sequence number the next appended chunk will receive.
    pub next_sequence: u64,
    pub retained_chunks: usize,
    pub retained_bytes: usize,
    pub live_cursors: usize,
    pub bytes_appended: u64,
    pub closed: bool,
}

/// Diagnostics snapshot of a fan-out adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdapterDiagnostics {
    pub adapter_id: String,
    pub state: AdapterState,
    pub live_clients: usize,
    pub clients_created: u64,
    pub pump_starts: u64,
    pub pump_stops: u64,
    pub protocol_violations: u64,
    pub last_upstream_failure: Option<UpstreamFailure>,
    pub buffer: Option<BufferStats>,
}

impl AdapterDiagnostics {
    pub fn to_json(&self) -> Result<String, FanOutError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| FanOutError::ConfigurationFailed(format!("failed to serialize diagnostics: {}", e)))
    }
}
