use serde::Serialize;

/// Fan-out adapter lifecycle.
///
/// State transitions:
/// ```text
/// unbound → idle ⇄ active
///             ↓      ↓
///          torn_down (only with zero live clients)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterState {
    /// No capture session bound yet.
    Unbound,
    /// Session bound, no live clients, capture stopped.
    Idle,
    /// At least one live client, pump running.
    Active,
    TornDown,
}

impl AdapterState {
    pub fn is_bound(&self) -> bool {
        matches!(self, Self::Idle | Self::Active)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TornDown)
    }
}
