//! Identity map: user id → enrolled voiceprint slot and metadata

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;

use super::index::Slot;

/// Enrollment record for one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub user_id: String,
    pub slot: Slot,
    pub enrolled_at: DateTime<Utc>,
    /// Audio quality metrics captured at enrollment (duration, amplitude, SNR)
    #[serde(default)]
    pub quality_metrics: BTreeMap<String, f64>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IdentityError {
    #[error("User '{0}' is already enrolled")]
    AlreadyEnrolled(String),

    #[error("Slot {0} is claimed by more than one user")]
    DuplicateSlot(Slot),
}

/// Typed user map with a uniqueness invariant enforced at insert time
#[derive(Default)]
pub struct IdentityMap {
    records: RwLock<HashMap<String, IdentityRecord>>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a map from persisted records, rejecting duplicate users or slots
    pub fn from_records(records: Vec<IdentityRecord>) -> Result<Self, IdentityError> {
        let mut map = HashMap::with_capacity(records.len());
        let mut slots = HashSet::with_capacity(records.len());

        for record in records {
            if !slots.insert(record.slot) {
                return Err(IdentityError::DuplicateSlot(record.slot));
            }
            match map.entry(record.user_id.clone()) {
                Entry::Occupied(_) => return Err(IdentityError::AlreadyEnrolled(record.user_id)),
                Entry::Vacant(v) => {
                    v.insert(record);
                }
            }
        }

        Ok(Self {
            records: RwLock::new(map),
        })
    }

    /// Create the record for `user_id`; exactly one concurrent insert wins
    pub fn insert(
        &self,
        user_id: &str,
        slot: Slot,
        quality_metrics: BTreeMap<String, f64>,
    ) -> Result<IdentityRecord, IdentityError> {
        let record = self.prepare(user_id, slot, quality_metrics)?;
        self.publish(record)
    }

    /// Build the record `insert` would create without making it visible
    pub fn prepare(
        &self,
        user_id: &str,
        slot: Slot,
        quality_metrics: BTreeMap<String, f64>,
    ) -> Result<IdentityRecord, IdentityError> {
        let records = self.records.read();
        if records.contains_key(user_id) {
            return Err(IdentityError::AlreadyEnrolled(user_id.to_string()));
        }
        if records.values().any(|r| r.slot == slot) {
            return Err(IdentityError::DuplicateSlot(slot));
        }

        Ok(IdentityRecord {
            user_id: user_id.to_string(),
            slot,
            enrolled_at: Utc::now(),
            quality_metrics,
        })
    }

    /// Make a prepared record visible to lookups
    pub fn publish(&self, record: IdentityRecord) -> Result<IdentityRecord, IdentityError> {
        let mut records = self.records.write();
        if records.values().any(|r| r.slot == record.slot) {
            return Err(IdentityError::DuplicateSlot(record.slot));
        }

        match records.entry(record.user_id.clone()) {
            Entry::Occupied(_) => Err(IdentityError::AlreadyEnrolled(record.user_id)),
            Entry::Vacant(v) => {
                v.insert(record.clone());
                Ok(record)
            }
        }
    }

    pub fn lookup(&self, user_id: &str) -> Option<IdentityRecord> {
        self.records.read().get(user_id).cloned()
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.records.read().contains_key(user_id)
    }

    pub fn size(&self) -> usize {
        self.records.read().len()
    }

    /// User owning `slot`, if any (rolled-back slots have no owner)
    pub fn owner_of(&self, slot: Slot) -> Option<String> {
        self.records
            .read()
            .values()
            .find(|r| r.slot == slot)
            .map(|r| r.user_id.clone())
    }

    /// Enrolled user ids, sorted
    pub fn user_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.records.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Records sorted by slot
    pub fn snapshot(&self) -> Vec<IdentityRecord> {
        let mut records: Vec<IdentityRecord> = self.records.read().values().cloned().collect();
        records.sort_by_key(|r| r.slot);
        records
    }

    /// Records sorted by slot, as they would be once `pending` is published
    pub fn snapshot_with(&self, pending: &IdentityRecord) -> Vec<IdentityRecord> {
        let mut records = self.snapshot();
        records.push(pending.clone());
        records.sort_by_key(|r| r.slot);
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn test_insert_and_lookup() {
        let map = IdentityMap::new();
        let mut metrics = BTreeMap::new();
        metrics.insert("duration".to_string(), 4.2);

        let record = map.insert("alice", Slot(0), metrics.clone()).unwrap();
        assert_eq!(record.user_id, "alice");
        assert_eq!(record.slot, Slot(0));

        let found = map.lookup("alice").unwrap();
        assert_eq!(found, record);
        assert_eq!(found.quality_metrics, metrics);
        assert_eq!(map.size(), 1);
        assert!(map.lookup("bob").is_none());
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let map = IdentityMap::new();
        map.insert("alice", Slot(0), BTreeMap::new()).unwrap();

        assert_eq!(
            map.insert("alice", Slot(1), BTreeMap::new()),
            Err(IdentityError::AlreadyEnrolled("alice".to_string()))
        );
        assert_eq!(map.lookup("alice").unwrap().slot, Slot(0));
    }

    #[test]
    fn test_concurrent_insert_single_winner() {
        let map = Arc::new(IdentityMap::new());
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8u64)
            .map(|i| {
                let map = Arc::clone(&map);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    map.insert("carol", Slot(i), BTreeMap::new()).is_ok()
                })
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(wins, 1);
        assert_eq!(map.size(), 1);
    }

    #[test]
    fn test_owner_of() {
        let map = IdentityMap::new();
        map.insert("alice", Slot(0), BTreeMap::new()).unwrap();
        map.insert("bob", Slot(2), BTreeMap::new()).unwrap();

        assert_eq!(map.owner_of(Slot(2)).as_deref(), Some("bob"));
        assert!(map.owner_of(Slot(1)).is_none());
        assert_eq!(map.user_ids(), vec!["alice".to_string(), "bob".to_string()]);
    }

    #[test]
    fn test_prepared_record_invisible_until_published() {
        let map = IdentityMap::new();
        map.insert("alice", Slot(0), BTreeMap::new()).unwrap();

        let pending = map.prepare("bob", Slot(1), BTreeMap::new()).unwrap();
        assert!(map.lookup("bob").is_none());
        assert!(map.owner_of(Slot(1)).is_none());
        assert_eq!(map.size(), 1);

        let staged = map.snapshot_with(&pending);
        let users: Vec<&str> = staged.iter().map(|r| r.user_id.as_str()).collect();
        assert_eq!(users, vec!["alice", "bob"]);
        assert_eq!(map.size(), 1);

        map.publish(pending.clone()).unwrap();
        assert_eq!(map.lookup("bob"), Some(pending));
    }

    #[test]
    fn test_prepare_rejects_taken_user_or_slot() {
        let map = IdentityMap::new();
        map.insert("alice", Slot(0), BTreeMap::new()).unwrap();

        assert_eq!(
            map.prepare("alice", Slot(1), BTreeMap::new()),
            Err(IdentityError::AlreadyEnrolled("alice".to_string()))
        );
        assert_eq!(
            map.prepare("bob", Slot(0), BTreeMap::new()),
            Err(IdentityError::DuplicateSlot(Slot(0)))
        );
    }

    #[test]
    fn test_from_records_rejects_duplicates() {
        let record = IdentityRecord {
            user_id: "alice".to_string(),
            slot: Slot(0),
            enrolled_at: Utc::now(),
            quality_metrics: BTreeMap::new(),
        };

        let mut same_user = record.clone();
        same_user.slot = Slot(1);
        assert!(matches!(
            IdentityMap::from_records(vec![record.clone(), same_user]),
            Err(IdentityError::AlreadyEnrolled(_))
        ));

        let mut same_slot = record.clone();
        same_slot.user_id = "bob".to_string();
        assert!(matches!(
            IdentityMap::from_records(vec![record, same_slot]),
            Err(IdentityError::DuplicateSlot(Slot(0)))
        ));
    }
}
