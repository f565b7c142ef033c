//! Per-backend gateway registry.
//!
//! A concurrent map from gateway id to live connection state, shared
//! by both backends (the UDP variant stores addresses and evicts on
//! silence, the WebSocket variant stores connections and removes on
//! socket close — the operations are the same). Connect and
//! disconnect transitions are delivered on capacity-1 channels to a
//! single consumer; a slow consumer back-pressures the caller, which
//! for eviction is the dedicated sweeper task.

use std::collections::HashMap;
use std::sync::RwLock;

use tokio::sync::mpsc;

use crate::gateway::GatewayId;

/// Returned when a downlink or lookup targets an id with no live entry.
#[derive(Debug, thiserror::Error)]
#[error("gateway does not exist")]
pub struct GatewayDoesNotExist;

pub struct Registry<T> {
    entries: RwLock<HashMap<GatewayId, T>>,
    connect_tx: mpsc::Sender<GatewayId>,
    disconnect_tx: mpsc::Sender<GatewayId>,
}

impl<T: Clone> Registry<T> {
    /// Create a registry and its connect/disconnect event streams.
    pub fn new() -> (Self, mpsc::Receiver<GatewayId>, mpsc::Receiver<GatewayId>) {
        let (connect_tx, connect_rx) = mpsc::channel(1);
        let (disconnect_tx, disconnect_rx) = mpsc::channel(1);
        (
            Registry {
                entries: RwLock::new(HashMap::new()),
                connect_tx,
                disconnect_tx,
            },
            connect_rx,
            disconnect_rx,
        )
    }

    pub fn get(&self, id: GatewayId) -> Result<T, GatewayDoesNotExist> {
        self.entries
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(GatewayDoesNotExist)
    }

    pub fn contains(&self, id: GatewayId) -> bool {
        self.entries.read().unwrap().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or replace the entry for `id`. Emits a connect event
    /// exactly when the id transitions from absent to present.
    pub async fn set(&self, id: GatewayId, entry: T) {
        let was_present = {
            let mut entries = self.entries.write().unwrap();
            entries.insert(id, entry).is_some()
        };
        if !was_present {
            // Lock is released before the send; a slow consumer only
            // stalls this caller.
            let _ = self.connect_tx.send(id).await;
        }
    }

    /// Mutate the entry for `id` in place; a no-op when absent (an
    /// entry is only ever created by `set`).
    pub fn update<F: FnOnce(&mut T)>(&self, id: GatewayId, f: F) {
        if let Some(entry) = self.entries.write().unwrap().get_mut(&id) {
            f(entry);
        }
    }

    /// Remove the entry for `id`. Emits a disconnect event exactly
    /// when the id transitions from present to absent.
    pub async fn remove(&self, id: GatewayId) {
        let was_present = self.entries.write().unwrap().remove(&id).is_some();
        if was_present {
            let _ = self.disconnect_tx.send(id).await;
        }
    }

    /// Evict every entry for which `stale` returns true, emitting one
    /// disconnect event per eviction.
    pub async fn cleanup<F: Fn(&T) -> bool>(&self, stale: F) {
        let evicted: Vec<GatewayId> = {
            let mut entries = self.entries.write().unwrap();
            let ids: Vec<GatewayId> = entries
                .iter()
                .filter(|(_, e)| stale(e))
                .map(|(id, _)| *id)
                .collect();
            for id in &ids {
                entries.remove(id);
            }
            ids
        };
        for id in evicted {
            let _ = self.disconnect_tx.send(id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    #[derive(Clone)]
    struct Entry {
        last_seen: DateTime<Utc>,
    }

    fn id(n: u8) -> GatewayId {
        GatewayId::new([0, 0, 0, 0, 0, 0, 0, n])
    }

    #[tokio::test]
    async fn test_set_emits_connect_once() {
        let (registry, mut connects, _disconnects) = Registry::new();

        registry.set(id(1), Entry { last_seen: Utc::now() }).await;
        assert_eq!(connects.try_recv().unwrap(), id(1));

        // Replacing the entry is not a new connection.
        registry.set(id(1), Entry { last_seen: Utc::now() }).await;
        assert!(connects.try_recv().is_err());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_emits_disconnect_once() {
        let (registry, _connects, mut disconnects) = Registry::new();

        registry.set(id(1), Entry { last_seen: Utc::now() }).await;
        registry.remove(id(1)).await;
        assert_eq!(disconnects.try_recv().unwrap(), id(1));

        registry.remove(id(1)).await;
        assert!(disconnects.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_get_unknown_fails() {
        let (registry, _connects, _disconnects) = Registry::<Entry>::new();
        assert!(registry.get(id(9)).is_err());
    }

    #[tokio::test]
    async fn test_cleanup_evicts_stale_entries() {
        let (registry, connects, mut disconnects) = Registry::new();
        // Connect events are not under test here; close the channel so
        // the capacity-1 sends cannot block the single test task.
        drop(connects);
        let now = Utc::now();

        registry
            .set(id(1), Entry { last_seen: now - chrono::Duration::seconds(60) })
            .await;
        registry.set(id(2), Entry { last_seen: now }).await;

        registry
            .cleanup(|e| (now - e.last_seen).num_seconds() > 30)
            .await;

        assert_eq!(registry.len(), 1);
        assert_eq!(disconnects.try_recv().unwrap(), id(1));
        assert!(disconnects.try_recv().is_err());
        assert!(registry.contains(id(2)));
    }

    #[tokio::test]
    async fn test_distinct_ids_counted() {
        let (registry, connects, _disconnects) = Registry::new();
        drop(connects);
        for n in 1..=5 {
            registry.set(id(n), Entry { last_seen: Utc::now() }).await;
        }
        assert_eq!(registry.len(), 5);
    }
}
