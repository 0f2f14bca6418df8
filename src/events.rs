use crate::registry::ConnectionStats;
use serde::Serialize;
use tokio::sync::broadcast;

/// Lifecycle events emitted by a proxy server. Subscribers observe
/// connections opening and closing (with their final byte counts), request
/// failures, and TLS handshake failures.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerEvent {
  #[serde(rename_all = "camelCase")]
  Connection { id: u64 },
  #[serde(rename_all = "camelCase")]
  ConnectionClosed { id: u64, stats: ConnectionStats },
  #[serde(rename_all = "camelCase")]
  RequestFailed { id: u64, error: String },
  #[serde(rename_all = "camelCase")]
  TlsError { error: String },
}

/// Broadcast fan-out for server events. Subscribing is optional; emitting
/// with no subscribers is a no-op.
pub struct EventBus {
  tx: broadcast::Sender<ServerEvent>,
}

impl EventBus {
  pub fn new(capacity: usize) -> Self {
    let (tx, _) = broadcast::channel(capacity);
    Self { tx }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
    self.tx.subscribe()
  }

  pub fn emit(&self, event: ServerEvent) {
    // Send fails only when nobody is listening.
    let _ = self.tx.send(event);
  }
}

impl Default for EventBus {
  fn default() -> Self {
    Self::new(256)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_events_reach_subscribers() {
    let bus = EventBus::default();
    let mut rx = bus.subscribe();
    bus.emit(ServerEvent::Connection { id: 7 });
    match rx.recv().await.unwrap() {
      ServerEvent::Connection { id } => assert_eq!(id, 7),
      other => panic!("unexpected event: {other:?}"),
    }
  }

  #[test]
  fn test_emit_without_subscribers() {
    let bus = EventBus::default();
    bus.emit(ServerEvent::TlsError {
      error: "handshake failed".to_string(),
    });
  }
}
