//! Event hub implementation
//!
//! Each event kind gets its own `tokio::sync::broadcast` channel so
//! subscribers only pay for what they watch and ordering within a kind is
//! the channel's ordering. Publishing never fails: a kind nobody subscribes
//! to is simply dropped.

use crate::error::ControllerError;
use crate::machine::status::StatusSnapshot;
use tokio::sync::broadcast;

/// Configuration for the event hub
#[derive(Debug, Clone)]
pub struct EventHubConfig {
    /// Capacity of each per-kind broadcast channel
    pub channel_capacity: usize,
}

impl Default for EventHubConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
        }
    }
}

/// Controller-wide observation channels
///
/// One broadcast channel per event kind:
/// - `status_update` — the state vector changed (carries a full snapshot)
/// - `connected` — transport opened (carries the port/device description)
/// - `ready` — device idle and un-alarmed
/// - `sent` — raw line transmitted
/// - `received` — raw line received
/// - `error` — controller-level error
#[derive(Debug, Clone)]
pub struct EventHub {
    status_update: broadcast::Sender<StatusSnapshot>,
    connected: broadcast::Sender<String>,
    ready: broadcast::Sender<()>,
    sent: broadcast::Sender<String>,
    received: broadcast::Sender<String>,
    error: broadcast::Sender<ControllerError>,
}

impl EventHub {
    /// Create a hub with default configuration
    pub fn new() -> Self {
        Self::with_config(EventHubConfig::default())
    }

    /// Create a hub with custom configuration
    pub fn with_config(config: EventHubConfig) -> Self {
        let capacity = config.channel_capacity;
        Self {
            status_update: broadcast::channel(capacity).0,
            connected: broadcast::channel(capacity).0,
            ready: broadcast::channel(capacity).0,
            sent: broadcast::channel(capacity).0,
            received: broadcast::channel(capacity).0,
            error: broadcast::channel(capacity).0,
        }
    }

    /// Subscribe to state vector changes
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusSnapshot> {
        self.status_update.subscribe()
    }

    /// Subscribe to transport-open notifications
    pub fn subscribe_connected(&self) -> broadcast::Receiver<String> {
        self.connected.subscribe()
    }

    /// Subscribe to device-ready notifications
    pub fn subscribe_ready(&self) -> broadcast::Receiver<()> {
        self.ready.subscribe()
    }

    /// Subscribe to transmitted raw lines
    pub fn subscribe_sent(&self) -> broadcast::Receiver<String> {
        self.sent.subscribe()
    }

    /// Subscribe to received raw lines
    pub fn subscribe_received(&self) -> broadcast::Receiver<String> {
        self.received.subscribe()
    }

    /// Subscribe to controller-level errors
    pub fn subscribe_error(&self) -> broadcast::Receiver<ControllerError> {
        self.error.subscribe()
    }

    /// Publish a state vector change
    pub fn publish_status(&self, snapshot: StatusSnapshot) {
        let _ = self.status_update.send(snapshot);
    }

    /// Publish a transport-open notification
    pub fn publish_connected(&self, port: impl Into<String>) {
        let _ = self.connected.send(port.into());
    }

    /// Publish a device-ready notification
    pub fn publish_ready(&self) {
        let _ = self.ready.send(());
    }

    /// Publish a transmitted raw line
    pub fn publish_sent(&self, raw: impl Into<String>) {
        let _ = self.sent.send(raw.into());
    }

    /// Publish a received raw line
    pub fn publish_received(&self, raw: impl Into<String>) {
        let _ = self.received.send(raw.into());
    }

    /// Publish a controller-level error
    pub fn publish_error(&self, error: ControllerError) {
        tracing::warn!(kind = %error.kind(), "controller error: {}", error);
        let _ = self.error.send(error);
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::MachineState;

    #[test]
    fn publish_without_subscribers_is_fine() {
        let hub = EventHub::new();
        hub.publish_ready();
        hub.publish_sent("G0 X0");
        hub.publish_error(ControllerError::comm("nobody listening"));
    }

    #[tokio::test]
    async fn channels_are_independent_and_ordered() {
        let hub = EventHub::new();
        let mut sent = hub.subscribe_sent();
        let mut ready = hub.subscribe_ready();

        hub.publish_sent("G0 X1");
        hub.publish_ready();
        hub.publish_sent("G0 X2");

        assert_eq!(sent.recv().await.unwrap(), "G0 X1");
        assert_eq!(sent.recv().await.unwrap(), "G0 X2");
        ready.recv().await.unwrap();
    }

    #[tokio::test]
    async fn status_updates_carry_full_snapshots() {
        let hub = EventHub::new();
        let mut status = hub.subscribe_status();

        let mut state = MachineState::default();
        state.mpos = vec![1.0, 2.0, 3.0];
        hub.publish_status(StatusSnapshot::capture(&state));

        let snap = status.recv().await.unwrap();
        assert_eq!(snap.mpos, vec![1.0, 2.0, 3.0]);
        assert_eq!(snap.pos, vec![1.0, 2.0, 3.0]);
    }

    #[tokio::test]
    async fn late_subscribers_miss_earlier_events() {
        let hub = EventHub::new();
        hub.publish_sent("early");
        let mut sent = hub.subscribe_sent();
        hub.publish_sent("late");
        assert_eq!(sent.recv().await.unwrap(), "late");
    }
}
