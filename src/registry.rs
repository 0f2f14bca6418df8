use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Connection IDs are unique and monotonic across every server instance in
/// the process.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Live byte counters for one proxied connection. `src` is the client-side
/// socket, `trg` the target-side socket; `tx`/`rx` are bytes written to and
/// read from that socket at the application layer. Each slot is an `Arc` so
/// the counting stream wrappers and the registry share the same cells.
#[derive(Debug, Default)]
pub struct ConnectionCounters {
  pub src_tx: Arc<AtomicU64>,
  pub src_rx: Arc<AtomicU64>,
  pub trg_tx: Arc<AtomicU64>,
  pub trg_rx: Arc<AtomicU64>,
}

impl ConnectionCounters {
  pub fn snapshot(&self) -> ConnectionStats {
    ConnectionStats {
      src_tx_bytes: self.src_tx.load(Ordering::Relaxed),
      src_rx_bytes: self.src_rx.load(Ordering::Relaxed),
      trg_tx_bytes: self.trg_tx.load(Ordering::Relaxed),
      trg_rx_bytes: self.trg_rx.load(Ordering::Relaxed),
    }
  }
}

/// Point-in-time view of a connection's four byte counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
  pub src_tx_bytes: u64,
  pub src_rx_bytes: u64,
  pub trg_tx_bytes: u64,
  pub trg_rx_bytes: u64,
}

/// Handle held by the task that owns a registered connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
  pub id: u64,
  pub counters: Arc<ConnectionCounters>,
  /// Cancelled to force-destroy this connection (operator close or forced
  /// server shutdown).
  pub abort: CancellationToken,
}

struct ConnectionEntry {
  counters: Arc<ConnectionCounters>,
  abort: CancellationToken,
}

/// Tracks the live connections of one server instance.
#[derive(Default)]
pub struct ConnectionRegistry {
  connections: Mutex<HashMap<u64, ConnectionEntry>>,
}

impl ConnectionRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&self) -> ConnectionHandle {
    let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    let counters = Arc::new(ConnectionCounters::default());
    let abort = CancellationToken::new();
    self.connections.lock().unwrap().insert(
      id,
      ConnectionEntry {
        counters: counters.clone(),
        abort: abort.clone(),
      },
    );
    ConnectionHandle { id, counters, abort }
  }

  /// Remove a connection and return its final stats. Returns None on a
  /// repeated unregister, which lets callers emit the closed event exactly
  /// once.
  pub fn unregister(&self, id: u64) -> Option<ConnectionStats> {
    self
      .connections
      .lock()
      .unwrap()
      .remove(&id)
      .map(|entry| entry.counters.snapshot())
  }

  pub fn connection_ids(&self) -> Vec<u64> {
    let mut ids: Vec<u64> = self.connections.lock().unwrap().keys().copied().collect();
    ids.sort_unstable();
    ids
  }

  pub fn stats(&self, id: u64) -> Option<ConnectionStats> {
    self
      .connections
      .lock()
      .unwrap()
      .get(&id)
      .map(|entry| entry.counters.snapshot())
  }

  /// Force-destroy one connection. Returns false for unknown IDs.
  pub fn abort(&self, id: u64) -> bool {
    match self.connections.lock().unwrap().get(&id) {
      Some(entry) => {
        entry.abort.cancel();
        true
      }
      None => false,
    }
  }

  pub fn abort_all(&self) {
    for entry in self.connections.lock().unwrap().values() {
      entry.abort.cancel();
    }
  }

  pub fn len(&self) -> usize {
    self.connections.lock().unwrap().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_ids_are_monotonic_and_unique() {
    let registry = ConnectionRegistry::new();
    let a = registry.register();
    let b = registry.register();
    assert!(b.id > a.id);
    assert_eq!(registry.connection_ids(), vec![a.id, b.id]);
  }

  #[test]
  fn test_ids_unique_across_registries() {
    let first = ConnectionRegistry::new();
    let second = ConnectionRegistry::new();
    let a = first.register();
    let b = second.register();
    assert_ne!(a.id, b.id);
  }

  #[test]
  fn test_stats_follow_counters() {
    let registry = ConnectionRegistry::new();
    let handle = registry.register();
    handle.counters.src_rx.fetch_add(120, Ordering::Relaxed);
    handle.counters.trg_tx.fetch_add(100, Ordering::Relaxed);

    let stats = registry.stats(handle.id).unwrap();
    assert_eq!(stats.src_rx_bytes, 120);
    assert_eq!(stats.trg_tx_bytes, 100);
    assert_eq!(stats.src_tx_bytes, 0);
  }

  #[test]
  fn test_unregister_once() {
    let registry = ConnectionRegistry::new();
    let handle = registry.register();
    assert!(registry.unregister(handle.id).is_some());
    assert!(registry.unregister(handle.id).is_none());
    assert!(registry.stats(handle.id).is_none());
  }

  #[test]
  fn test_abort_unknown_id() {
    let registry = ConnectionRegistry::new();
    assert!(!registry.abort(9999));
  }
}
