use crate::models::diagnostics::UpstreamFailure;
use crate::models::state::AdapterState;
use crate::session::reader::ClientId;

/// Diagnostics capability injected into a fan-out adapter.
///
/// Called after the adapter's lifetime lock is released. Connect, disconnect
/// and state notices arrive on the consumer thread that caused them; upstream
/// failures from the pump arrive on the adapter's notifier thread. A delegate
/// may call back into the adapter from any callback.
pub trait FanOutDelegate: Send + Sync {
    /// Called when the adapter changes state.
    fn on_state_changed(&self, state: AdapterState);

    /// Called when the pump or capture source reports an error.
    fn on_upstream_failure(&self, failure: &UpstreamFailure);

    fn on_client_connected(&self, _client_id: ClientId, _live_clients: usize) {}

    fn on_client_disconnected(&self, _client_id: ClientId, _live_clients: usize) {}

    /// Called when a disconnect arrives with no live clients.
    fn on_protocol_violation(&self, _client_id: ClientId) {}
}
