use std::collections::HashMap;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use crate::database::Database;
use crate::error::StoreError;
use crate::tier::{StoreQuotas, Tier, TierQuota};

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Emitted for every successful mutation, to all subscribers of the tier,
/// the mutator included. Delivery order matches mutation order per tier.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub tier: Tier,
    pub key: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

/// Current consumption of one tier, for the diagnostics surface.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TierUsage {
    pub tier: Tier,
    pub used_bytes: usize,
    pub entry_count: usize,
    pub quota: TierQuota,
}

struct StoredEntry {
    value: Value,
    size_bytes: usize,
}

#[derive(Default)]
struct TierState {
    entries: HashMap<String, StoredEntry>,
    used_bytes: usize,
}

struct TierSlot {
    state: Mutex<TierState>,
    changes: broadcast::Sender<ChangeEvent>,
}

/// Quota-bounded key-value store with three isolation tiers.
///
/// Durable tiers write through to SQLite; the volatile-session tier lives in
/// memory only, so a full restart drops it by construction. Writes to a tier
/// are serialized by the tier's mutex; tiers proceed independently.
pub struct StateStore {
    db: Database,
    quotas: StoreQuotas,
    slots: [TierSlot; 3],
}

fn slot_index(tier: Tier) -> usize {
    match tier {
        Tier::DurableLocal => 0,
        Tier::DurableSynced => 1,
        Tier::VolatileSession => 2,
    }
}

/// The billed size of an entry: key length plus serialized value length.
fn entry_size(key: &str, value: &Value) -> usize {
    key.len() + value.to_string().len()
}

impl StateStore {
    /// Open the store, loading durable tiers from the database.
    pub fn open(db: Database, quotas: StoreQuotas) -> Result<Self, StoreError> {
        let slots = [Tier::DurableLocal, Tier::DurableSynced, Tier::VolatileSession].map(|_| {
            let (tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
            TierSlot {
                state: Mutex::new(TierState::default()),
                changes: tx,
            }
        });
        let store = Self { db, quotas, slots };

        for tier in [Tier::DurableLocal, Tier::DurableSynced] {
            store.load_tier(tier)?;
        }
        Ok(store)
    }

    fn load_tier(&self, tier: Tier) -> Result<(), StoreError> {
        let rows: Vec<(String, String, usize)> = self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT key, value, size_bytes FROM entries WHERE tier = ?1")?;
            let rows = stmt
                .query_map([tier.as_str()], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get::<_, i64>(2)? as usize))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        let mut state = self.slots[slot_index(tier)].state.lock();
        for (key, raw, size_bytes) in rows {
            let value: Value = serde_json::from_str(&raw)?;
            state.used_bytes += size_bytes;
            state.entries.insert(key, StoredEntry { value, size_bytes });
        }
        debug!(tier = %tier, entries = state.entries.len(), "tier loaded");
        Ok(())
    }

    /// Read the given keys. Missing keys are simply absent from the result.
    pub fn get(&self, tier: Tier, keys: &[&str]) -> HashMap<String, Value> {
        let state = self.slots[slot_index(tier)].state.lock();
        keys.iter()
            .filter_map(|k| {
                state
                    .entries
                    .get(*k)
                    .map(|e| ((*k).to_string(), e.value.clone()))
            })
            .collect()
    }

    /// Write a batch of entries atomically.
    ///
    /// If any entry would push the tier over quota (or over its per-entry
    /// cap), nothing in the call is written and the prior state is untouched.
    pub fn set(
        &self,
        tier: Tier,
        entries: Vec<(String, Value)>,
    ) -> Result<(), StoreError> {
        let quota = self.quotas.for_tier(tier);
        let slot = &self.slots[slot_index(tier)];
        let mut state = slot.state.lock();

        // Validate the whole batch before touching anything. A key repeated
        // within the batch is last-write-wins: only the surviving value is
        // written, sized, and notified.
        let mut projected = state.used_bytes;
        let mut sized: Vec<(String, Value, usize)> = Vec::with_capacity(entries.len());
        let mut positions: HashMap<String, usize> = HashMap::new();
        for (key, value) in entries {
            let size = entry_size(&key, &value);
            if let Some(cap) = quota.max_entry_bytes {
                if size > cap {
                    return Err(StoreError::EntryTooLarge { tier, key, size, cap });
                }
            }
            if let Some(&i) = positions.get(&key) {
                projected -= sized[i].2;
                projected += size;
                sized[i].1 = value;
                sized[i].2 = size;
                continue;
            }
            projected += size;
            if let Some(existing) = state.entries.get(&key) {
                projected -= existing.size_bytes;
            }
            positions.insert(key.clone(), sized.len());
            sized.push((key, value, size));
        }
        if projected > quota.max_total_bytes {
            return Err(StoreError::QuotaExceeded {
                tier,
                attempted: projected,
                quota: quota.max_total_bytes,
            });
        }

        // Durable tiers persist first, in one transaction.
        if tier.is_durable() {
            let now = Utc::now().to_rfc3339();
            self.db.with_conn(|conn| {
                let tx = conn.unchecked_transaction()?;
                for (key, value, size) in &sized {
                    tx.execute(
                        "INSERT INTO entries (tier, key, value, size_bytes, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)
                         ON CONFLICT(tier, key) DO UPDATE SET
                             value = excluded.value,
                             size_bytes = excluded.size_bytes,
                             updated_at = excluded.updated_at",
                        rusqlite::params![
                            tier.as_str(),
                            key,
                            value.to_string(),
                            *size as i64,
                            now,
                        ],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })?;
        }

        // Apply to memory and notify, still under the tier lock so change
        // order matches mutation order.
        for (key, value, size_bytes) in sized {
            let old = state.entries.insert(
                key.clone(),
                StoredEntry {
                    value: value.clone(),
                    size_bytes,
                },
            );
            if let Some(old) = &old {
                state.used_bytes -= old.size_bytes;
            }
            state.used_bytes += size_bytes;
            let _ = slot.changes.send(ChangeEvent {
                tier,
                key,
                old_value: old.map(|e| e.value),
                new_value: Some(value),
            });
        }
        Ok(())
    }

    /// Remove the given keys. Keys that are absent are ignored.
    pub fn remove(&self, tier: Tier, keys: &[&str]) -> Result<(), StoreError> {
        let slot = &self.slots[slot_index(tier)];
        let mut state = slot.state.lock();

        if tier.is_durable() {
            self.db.with_conn(|conn| {
                let tx = conn.unchecked_transaction()?;
                for key in keys {
                    tx.execute(
                        "DELETE FROM entries WHERE tier = ?1 AND key = ?2",
                        rusqlite::params![tier.as_str(), key],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })?;
        }

        for key in keys {
            if let Some(old) = state.entries.remove(*key) {
                state.used_bytes -= old.size_bytes;
                let _ = slot.changes.send(ChangeEvent {
                    tier,
                    key: (*key).to_string(),
                    old_value: Some(old.value),
                    new_value: None,
                });
            }
        }
        Ok(())
    }

    /// Subscribe to change events for one tier.
    pub fn subscribe(&self, tier: Tier) -> broadcast::Receiver<ChangeEvent> {
        self.slots[slot_index(tier)].changes.subscribe()
    }

    /// Change events as a Stream, for select-driven consumers.
    pub fn subscribe_stream(&self, tier: Tier) -> BroadcastStream<ChangeEvent> {
        BroadcastStream::new(self.subscribe(tier))
    }

    pub fn usage(&self, tier: Tier) -> TierUsage {
        let state = self.slots[slot_index(tier)].state.lock();
        TierUsage {
            tier,
            used_bytes: state.used_bytes,
            entry_count: state.entries.len(),
            quota: self.quotas.for_tier(tier),
        }
    }
}
