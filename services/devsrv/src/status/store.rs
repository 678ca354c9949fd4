//! Latest merged snapshot per device

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::types::{AlertKey, Health, StatusSnapshot};

/// Result of applying a snapshot
#[derive(Debug, Clone, PartialEq)]
pub enum StoreUpdate {
    /// Stored; carries the merged snapshot now current
    Changed(StatusSnapshot),
    /// Same health and alert keys as before; nothing stored
    Unchanged,
}

#[derive(Debug, Default)]
pub struct StatusStore {
    snapshots: DashMap<String, StatusSnapshot>,
    mutations: AtomicU64,
}

impl StatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<StatusSnapshot> {
        self.snapshots.get(name).map(|s| s.value().clone())
    }

    pub fn all(&self) -> Vec<StatusSnapshot> {
        let mut all: Vec<StatusSnapshot> = self.snapshots.iter().map(|s| s.value().clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Alert keys of the current entry
    pub fn key_set(&self, name: &str) -> BTreeSet<AlertKey> {
        self.snapshots
            .get(name)
            .map(|s| s.key_set())
            .unwrap_or_default()
    }

    /// Number of accepted updates since creation
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Merge `incoming` into the device entry, replacing only its scope's alerts
    pub fn apply(&self, incoming: StatusSnapshot) -> StoreUpdate {
        match self.snapshots.entry(incoming.name.clone()) {
            Entry::Vacant(entry) => {
                entry.insert(incoming.clone());
                self.mutations.fetch_add(1, Ordering::SeqCst);
                StoreUpdate::Changed(incoming)
            },
            Entry::Occupied(mut entry) => {
                let merged = merge(entry.get(), incoming);
                let previous = entry.get();
                if previous.health == merged.health && previous.key_set() == merged.key_set() {
                    return StoreUpdate::Unchanged;
                }
                entry.insert(merged.clone());
                self.mutations.fetch_add(1, Ordering::SeqCst);
                StoreUpdate::Changed(merged)
            },
        }
    }
}

/// Keep the other scopes' alerts; an offline-forcing alert outlives other-scope updates
fn merge(previous: &StatusSnapshot, incoming: StatusSnapshot) -> StatusSnapshot {
    let retained: Vec<_> = previous
        .alerts
        .iter()
        .filter(|a| a.scope != incoming.scope)
        .cloned()
        .collect();

    let health = if retained.iter().any(|a| a.forces_offline) {
        Health::Offline
    } else {
        incoming.health
    };

    let mut alerts = retained;
    alerts.extend(incoming.alerts);

    StatusSnapshot {
        name: incoming.name,
        model: incoming.model,
        health,
        alerts,
        scope: incoming.scope,
        timestamp: incoming.timestamp,
    }
}
