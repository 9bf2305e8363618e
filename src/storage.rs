//! Values held by this node: the ones it created and publishes, and the ones other nodes stored
//! here.

use crate::{
    id::NodeId,
    value::{Value, ValueError, ValueType},
};
use std::{collections::HashMap, time::Duration};
use tokio::time::Instant;

/// Decides whether local values are still worth publishing. Supplied by the file-sharing layer.
pub trait PublishPolicy: Send + Sync + 'static {
    /// Whether the file with this SHA-1 key is rare enough to keep announcing alternate
    /// locations for it.
    fn is_rare(&self, key: &NodeId) -> bool;

    /// Whether the local host currently cannot accept incoming connections.
    fn is_firewalled(&self) -> bool;
}

/// Where a stored value came from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Origin {
    /// Created by this node; republished every cycle while its policy allows.
    Local,
    /// Stored here by another node or picked up by a lookup; expires.
    Remote,
}

#[derive(Clone, Debug)]
pub struct StoredValue {
    pub value: Value,
    pub origin: Origin,
    stored_at: Instant,
}

impl StoredValue {
    pub fn is_local(&self) -> bool {
        self.origin == Origin::Local
    }

    pub fn age(&self) -> Duration {
        self.stored_at.elapsed()
    }
}

/// Values keyed by `(key, creator id)`.
pub struct ValueStore {
    entries: HashMap<(NodeId, NodeId), StoredValue>,
    remote_lifetime: Duration,
}

impl ValueStore {
    pub fn new(remote_lifetime: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            remote_lifetime,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Validate and store a value, replacing the previous value of its creator for the same key.
    ///
    /// Tombstones are refused here; they go through [`ValueStore::add`].
    pub fn store(&mut self, value: Value, origin: Origin) -> Result<(), ValueError> {
        if value.is_tombstone() {
            return Err(ValueError::Tombstone);
        }

        value.validate()?;
        self.add(value, origin);
        Ok(())
    }

    /// Write the value without validation. Returns false if a remote value would have replaced a
    /// local one.
    pub fn add(&mut self, value: Value, origin: Origin) -> bool {
        let entry_key = (value.key, value.creator.id);

        if origin == Origin::Remote {
            if let Some(existing) = self.entries.get(&entry_key) {
                if existing.is_local() {
                    log::debug!(
                        "Refusing remote {:?} value for {} that would replace a local one",
                        value.value_type,
                        value.key
                    );
                    return false;
                }
            }
        }

        self.entries.insert(
            entry_key,
            StoredValue {
                value,
                origin,
                stored_at: Instant::now(),
            },
        );

        true
    }

    /// Replace the local value of `creator` under `key` with its tombstone. The next publish cycle
    /// announces the deletion and erases the entry.
    pub fn remove_local(&mut self, key: &NodeId, creator: &NodeId) -> bool {
        let tombstone = match self.entries.get(&(*key, *creator)) {
            Some(entry) if entry.is_local() && !entry.value.is_tombstone() => {
                entry.value.to_tombstone()
            }
            _ => return false,
        };

        self.add(tombstone, Origin::Local)
    }

    /// Live values under `key`. Tombstones and expired values are left out.
    pub fn get(&self, key: &NodeId) -> Vec<Value> {
        self.entries
            .iter()
            .filter(|((k, _), entry)| {
                k == key && !entry.value.is_tombstone() && !self.is_expired(entry)
            })
            .map(|(_, entry)| entry.value.clone())
            .collect()
    }

    pub fn entry(&self, key: &NodeId, creator: &NodeId) -> Option<&StoredValue> {
        self.entries.get(&(*key, *creator))
    }

    /// Whether anything, tombstones included, is stored under `key`.
    pub fn contains_key(&self, key: &NodeId) -> bool {
        self.entries.keys().any(|(k, _)| k == key)
    }

    /// Local values due for publishing this cycle.
    ///
    /// An alternate location stays published while its file is rare and push proxies while the
    /// host is firewalled. Otherwise the value is turned into its tombstone. Tombstones are
    /// returned once and erased in the same pass.
    pub fn values_to_publish(&mut self, policy: &dyn PublishPolicy) -> Vec<Value> {
        let mut publish = Vec::new();
        let mut erase = Vec::new();

        for (entry_key, entry) in self.entries.iter().filter(|(_, e)| e.is_local()) {
            let value = &entry.value;

            if value.is_tombstone() {
                publish.push(value.clone());
                erase.push(*entry_key);
                continue;
            }

            let keep = match value.value_type {
                ValueType::AltLoc => policy.is_rare(&value.key),
                ValueType::PushProxies => policy.is_firewalled(),
                ValueType::Other(_) => false,
            };

            if keep {
                publish.push(value.clone());
            } else {
                log::debug!(
                    "{:?} value for {} no longer wanted, publishing its tombstone",
                    value.value_type,
                    value.key
                );
                publish.push(value.to_tombstone());
                erase.push(*entry_key);
            }
        }

        for entry_key in erase {
            self.entries.remove(&entry_key);
        }

        publish
    }

    /// Drop expired remote values. Returns how many were dropped.
    pub fn evict_expired(&mut self) -> usize {
        let before = self.entries.len();
        let lifetime = self.remote_lifetime;

        self.entries
            .retain(|_, entry| !expired(entry, lifetime));

        before - self.entries.len()
    }

    /// Local values never expire. Remote values expire after the fixed lifetime and remote
    /// tombstones right away.
    pub fn is_expired(&self, entry: &StoredValue) -> bool {
        expired(entry, self.remote_lifetime)
    }
}

fn expired(entry: &StoredValue, lifetime: Duration) -> bool {
    match entry.origin {
        Origin::Local => false,
        Origin::Remote => entry.value.is_tombstone() || entry.age() >= lifetime,
    }
}
