//! Two-tier session state store.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use log::{debug, warn};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use super::scope::{Scope, is_ephemeral_key};
use crate::error::{CodeloopError, Result};
use crate::id::now_ms;
use crate::storage::{Filter, HasId, SESSION_STATE_COLLECTION, Storage};

/// A stored value or the deletion sentinel.
#[derive(Debug, Clone, PartialEq)]
enum Slot {
    Value(serde_json::Value),
    Tombstone,
}

impl Slot {
    fn value(&self) -> Option<&serde_json::Value> {
        match self {
            Slot::Value(v) => Some(v),
            Slot::Tombstone => None,
        }
    }
}

/// One pending change to the durable tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum StateChange {
    Set { key: String, value: serde_json::Value },
    Delete { key: String },
}

impl StateChange {
    pub fn key(&self) -> &str {
        match self {
            StateChange::Set { key, .. } | StateChange::Delete { key } => key,
        }
    }
}

/// Durable changes produced by one invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DurableDelta {
    pub session_id: String,
    pub changes: Vec<StateChange>,
}

impl DurableDelta {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.changes.iter().map(StateChange::key)
    }
}

/// Persisted form of a durable entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateRow {
    id: String,
    session_id: String,
    key: String,
    value: serde_json::Value,
    updated_at: i64,
}

impl HasId for StateRow {
    fn id(&self) -> &str {
        &self.id
    }
}

fn row_id(session_id: &str, key: &str) -> String {
    format!("{}/{}", session_id, key)
}

fn to_slots(values: &BTreeMap<String, serde_json::Value>) -> BTreeMap<String, Slot> {
    values.iter().map(|(k, v)| (k.clone(), Slot::Value(v.clone()))).collect()
}

/// Per-session key/value store with a durable and an ephemeral tier.
///
/// Durable writes are queued in a delta and only reach storage through
/// [`StateStore::commit_delta`]. Ephemeral entries live in memory and are
/// dropped by [`StateStore::prune_ephemeral`]; they have no code path to storage.
pub struct StateStore<S: Storage> {
    storage: Arc<S>,
    session_id: String,
    durable: BTreeMap<String, Slot>,
    /// Durable view as of the last successful commit
    committed: BTreeMap<String, serde_json::Value>,
    ephemeral: HashMap<String, Slot>,
    delta: Vec<StateChange>,
}

impl<S: Storage> std::fmt::Debug for StateStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("session_id", &self.session_id)
            .field("durable_keys", &self.durable.len())
            .field("ephemeral_keys", &self.ephemeral.len())
            .field("pending", &self.delta.len())
            .finish()
    }
}

impl<S: Storage> StateStore<S> {
    /// Load the durable snapshot of `session_id` from storage.
    pub fn open(storage: Arc<S>, session_id: &str) -> Result<Self> {
        let rows: Vec<StateRow> =
            storage.query(SESSION_STATE_COLLECTION, &[Filter::eq("session_id", session_id)])?;

        let mut committed = BTreeMap::new();
        for row in rows {
            if is_ephemeral_key(&row.key) {
                warn!("Ignoring persisted ephemeral key {} for session {}", row.key, session_id);
                continue;
            }
            committed.insert(row.key, row.value);
        }
        debug!("Opened state for session {} with {} durable keys", session_id, committed.len());

        Ok(Self {
            storage,
            session_id: session_id.to_string(),
            durable: to_slots(&committed),
            committed,
            ephemeral: HashMap::new(),
            delta: Vec::new(),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Read a raw value. Deleted keys read as `None`.
    pub fn get(&self, key: &str, scope: Scope) -> Option<&serde_json::Value> {
        match scope {
            Scope::Durable => self.durable.get(key).and_then(Slot::value),
            Scope::Ephemeral => self.ephemeral.get(key).and_then(Slot::value),
        }
    }

    /// Read and deserialize a value.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str, scope: Scope) -> Result<Option<T>> {
        match self.get(key, scope) {
            Some(v) => Ok(Some(serde_json::from_value(v.clone())?)),
            None => Ok(None),
        }
    }

    /// Write a value into the given tier.
    pub fn set(&mut self, key: &str, scope: Scope, value: impl Serialize) -> Result<()> {
        let value = serde_json::to_value(value)?;
        match scope {
            Scope::Ephemeral => {
                self.ephemeral.insert(key.to_string(), Slot::Value(value));
            }
            Scope::Durable => {
                if is_ephemeral_key(key) {
                    return Err(CodeloopError::EphemeralLeak(key.to_string()));
                }
                self.durable.insert(key.to_string(), Slot::Value(value.clone()));
                self.delta.push(StateChange::Set {
                    key: key.to_string(),
                    value,
                });
            }
        }
        Ok(())
    }

    /// Delete by writing the deletion sentinel.
    pub fn delete(&mut self, key: &str, scope: Scope) -> Result<()> {
        match scope {
            Scope::Ephemeral => {
                self.ephemeral.insert(key.to_string(), Slot::Tombstone);
            }
            Scope::Durable => {
                if is_ephemeral_key(key) {
                    return Err(CodeloopError::EphemeralLeak(key.to_string()));
                }
                self.durable.insert(key.to_string(), Slot::Tombstone);
                self.delta.push(StateChange::Delete { key: key.to_string() });
            }
        }
        Ok(())
    }

    /// Queue externally produced durable changes (e.g. from a collaborator).
    ///
    /// Changes to marked keys are queued but never enter the durable view;
    /// [`StateStore::commit_delta`] rejects them.
    pub fn merge_delta(&mut self, changes: Vec<StateChange>) {
        for change in changes {
            match &change {
                change if is_ephemeral_key(change.key()) => {
                    warn!("Queued ephemeral key {} as a durable change", change.key());
                }
                StateChange::Set { key, value } => {
                    self.durable.insert(key.clone(), Slot::Value(value.clone()));
                }
                StateChange::Delete { key } => {
                    self.durable.insert(key.clone(), Slot::Tombstone);
                }
            }
            self.delta.push(change);
        }
    }

    /// Durable changes not yet committed.
    pub fn pending_delta(&self) -> &[StateChange] {
        &self.delta
    }

    /// Persist the durable changes of this invocation and return them.
    ///
    /// Fails with `EphemeralLeak` and persists nothing if any pending change
    /// touches an ephemeral key. The pending delta is then discarded and the
    /// durable view rolls back to the last successful commit.
    pub fn commit_delta(&mut self) -> Result<DurableDelta> {
        if let Some(leak) = self.delta.iter().find(|c| is_ephemeral_key(c.key())) {
            let key = leak.key().to_string();
            warn!(
                "Rejecting commit of {} changes for session {}: ephemeral key {}",
                self.delta.len(),
                self.session_id,
                key
            );
            self.delta.clear();
            self.durable = to_slots(&self.committed);
            return Err(CodeloopError::EphemeralLeak(key));
        }

        // Last write per key wins, in first-touch order.
        let mut order: Vec<String> = Vec::new();
        let mut latest: HashMap<String, StateChange> = HashMap::new();
        for change in &self.delta {
            if !latest.contains_key(change.key()) {
                order.push(change.key().to_string());
            }
            latest.insert(change.key().to_string(), change.clone());
        }

        let mut changes = Vec::with_capacity(order.len());
        for key in order {
            let Some(change) = latest.remove(&key) else {
                continue;
            };
            let id = row_id(&self.session_id, &key);
            match &change {
                StateChange::Set { value, .. } => {
                    let row = StateRow {
                        id,
                        session_id: self.session_id.clone(),
                        key: key.clone(),
                        value: value.clone(),
                        updated_at: now_ms(),
                    };
                    self.storage.upsert(SESSION_STATE_COLLECTION, &row)?;
                }
                StateChange::Delete { .. } => {
                    let existing: Option<StateRow> = self.storage.get(SESSION_STATE_COLLECTION, &id)?;
                    if existing.is_some() {
                        self.storage.delete(SESSION_STATE_COLLECTION, &id)?;
                    }
                }
            }
            changes.push(change);
        }

        self.delta.clear();
        self.durable.retain(|_, slot| !matches!(slot, Slot::Tombstone));
        self.committed = self.snapshot();
        debug!("Committed {} durable changes for session {}", changes.len(), self.session_id);

        Ok(DurableDelta {
            session_id: self.session_id.clone(),
            changes,
        })
    }

    /// Drop every ephemeral entry. Returns how many keys were removed.
    pub fn prune_ephemeral(&mut self) -> usize {
        let count = self.ephemeral.len();
        self.ephemeral.clear();
        if count > 0 {
            debug!("Pruned {} ephemeral keys for session {}", count, self.session_id);
        }
        count
    }

    /// Current durable view with deletions applied.
    pub fn snapshot(&self) -> BTreeMap<String, serde_json::Value> {
        self.durable
            .iter()
            .filter_map(|(k, slot)| slot.value().map(|v| (k.clone(), v.clone())))
            .collect()
    }

    /// Live ephemeral keys (deleted keys excluded).
    pub fn ephemeral_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .ephemeral
            .iter()
            .filter(|(_, slot)| slot.value().is_some())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }
}
