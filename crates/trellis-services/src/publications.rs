//! Publication index — which nodes claim to serve which objects.
//!
//! Routing maintenance hands publish records around during Join and Ping.
//! The index is capacity-bounded; a merge that would add a new object to a
//! full index fails with `OutOfSpace` and the caller drops that object.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use trellis_core::envelope::unix_millis;
use trellis_core::message::{Publications, PublishRecord};
use trellis_core::ObjectId;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("publication index is full ({capacity} objects)")]
pub struct OutOfSpace {
    pub capacity: usize,
}

pub trait PublicationIndex: Send + Sync {
    fn keys(&self) -> Vec<ObjectId>;

    fn publishers_of(&self, object_id: &ObjectId) -> HashSet<PublishRecord>;

    /// Fold `records` into the set held for `object_id`.
    fn merge(&self, object_id: ObjectId, records: HashSet<PublishRecord>) -> Result<(), OutOfSpace>;

    fn remove(&self, object_id: &ObjectId);

    /// Every object with its records.
    fn snapshot(&self) -> Publications {
        self.keys()
            .into_iter()
            .map(|id| {
                let records = self.publishers_of(&id);
                (id, records)
            })
            .filter(|(_, records)| !records.is_empty())
            .collect()
    }
}

/// Fold a received publication map into `index`, dropping any object the
/// index has no room for.
pub fn merge_all(index: &dyn PublicationIndex, publications: Publications) {
    for (object_id, records) in publications {
        if let Err(e) = index.merge(object_id, records) {
            tracing::debug!(object = %object_id.short(), error = %e, "dropping publication");
            index.remove(&object_id);
        }
    }
}

pub struct MemoryPublicationIndex {
    records: Arc<DashMap<ObjectId, HashSet<PublishRecord>>>,
    capacity: usize,
}

impl MemoryPublicationIndex {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Arc::new(DashMap::new()),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl PublicationIndex for MemoryPublicationIndex {
    fn keys(&self) -> Vec<ObjectId> {
        self.records.iter().map(|e| *e.key()).collect()
    }

    fn publishers_of(&self, object_id: &ObjectId) -> HashSet<PublishRecord> {
        let now = unix_millis();
        self.records
            .get(object_id)
            .map(|set| set.iter().filter(|r| !r.is_expired(now)).cloned().collect())
            .unwrap_or_default()
    }

    fn merge(&self, object_id: ObjectId, records: HashSet<PublishRecord>) -> Result<(), OutOfSpace> {
        let now = unix_millis();
        let fresh: Vec<PublishRecord> = records
            .into_iter()
            .filter(|r| r.object_id == object_id && !r.is_expired(now))
            .collect();
        if fresh.is_empty() {
            return Ok(());
        }
        if !self.records.contains_key(&object_id) && self.records.len() >= self.capacity {
            return Err(OutOfSpace {
                capacity: self.capacity,
            });
        }
        let mut set = self.records.entry(object_id).or_default();
        set.retain(|r| !r.is_expired(now));
        set.extend(fresh);
        Ok(())
    }

    fn remove(&self, object_id: &ObjectId) {
        self.records.remove(object_id);
    }
}
