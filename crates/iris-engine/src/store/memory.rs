use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use iris_core::Template;
use parking_lot::{Mutex, RwLock};

use super::{
    new_template_id, EnrollPolicy, IdentityRecord, StoreError, StoredTemplate, TemplateId,
    TemplateStore,
};

/// Current record of one identity. `None` once every template is gone.
type Slot = Arc<Mutex<Option<Arc<IdentityRecord>>>>;

/// In-process store.
///
/// The map lock is held only to find or create an identity's slot; each
/// write then holds that identity's slot lock while it swaps in a fresh
/// record. Readers clone the current `Arc` and never see a half-built record.
///
/// Removals prune empty slots that no request holds. Handles are only cloned
/// under the map lock, so a pruned slot can not be written afterwards; an
/// empty slot still held elsewhere is left for the next removal to prune.
#[derive(Default)]
pub struct MemoryTemplateStore {
    slots: RwLock<HashMap<String, Slot>>,
}

impl MemoryTemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, identity: &str) -> Slot {
        if let Some(slot) = self.slots.read().get(identity) {
            return slot.clone();
        }
        self.slots
            .write()
            .entry(identity.to_string())
            .or_default()
            .clone()
    }

    fn existing_slot(&self, identity: &str) -> Option<Slot> {
        self.slots.read().get(identity).cloned()
    }

    /// Drop empty slots that only the map references.
    /// Lock order is map, then slot.
    fn prune(&self) {
        self.slots
            .write()
            .retain(|_, slot| Arc::strong_count(slot) > 1 || slot.lock().is_some());
    }

    fn snapshot(&self, identity: &str) -> Option<Arc<IdentityRecord>> {
        self.existing_slot(identity)
            .and_then(|slot| slot.lock().clone())
    }
}

#[async_trait]
impl TemplateStore for MemoryTemplateStore {
    async fn upsert(
        &self,
        identity: &str,
        template: &Template,
        policy: EnrollPolicy,
    ) -> Result<TemplateId, StoreError> {
        let slot = self.slot(identity);
        let mut current = slot.lock();

        let now = Utc::now();
        let stored = StoredTemplate {
            id: new_template_id(),
            template: template.clone(),
            created_at: now,
        };
        let id = stored.id.clone();

        let next = match (current.as_deref(), policy) {
            (Some(_), EnrollPolicy::Single) => {
                return Err(StoreError::AlreadyEnrolled(identity.to_string()));
            }
            (Some(record), EnrollPolicy::Append) => {
                let mut next = record.clone();
                next.templates.push(stored);
                next
            }
            (Some(record), EnrollPolicy::Replace) => IdentityRecord {
                templates: vec![stored],
                ..record.clone()
            },
            (None, _) => IdentityRecord {
                identity: identity.to_string(),
                templates: vec![stored],
                created_at: now,
                last_verified_at: None,
            },
        };
        *current = Some(Arc::new(next));
        Ok(id)
    }

    async fn get(&self, identity: &str) -> Result<Vec<StoredTemplate>, StoreError> {
        Ok(self
            .snapshot(identity)
            .map(|r| r.templates.clone())
            .unwrap_or_default())
    }

    async fn exists(&self, identity: &str) -> Result<bool, StoreError> {
        Ok(self.snapshot(identity).is_some())
    }

    async fn record(&self, identity: &str) -> Result<Option<IdentityRecord>, StoreError> {
        Ok(self.snapshot(identity).map(|r| (*r).clone()))
    }

    async fn identities(&self) -> Result<Vec<String>, StoreError> {
        let slots: Vec<(String, Slot)> = self
            .slots
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut ids: Vec<String> = slots
            .into_iter()
            .filter(|(_, slot)| slot.lock().is_some())
            .map(|(k, _)| k)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn mark_verified(&self, identity: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let Some(slot) = self.existing_slot(identity) else {
            return Ok(false);
        };
        let mut current = slot.lock();
        let Some(record) = current.as_deref() else {
            return Ok(false);
        };
        let next = IdentityRecord {
            last_verified_at: Some(at),
            ..record.clone()
        };
        *current = Some(Arc::new(next));
        Ok(true)
    }

    async fn remove_template(&self, identity: &str, id: &str) -> Result<bool, StoreError> {
        let Some(slot) = self.existing_slot(identity) else {
            return Ok(false);
        };
        let emptied = {
            let mut current = slot.lock();
            let Some(record) = current.as_deref() else {
                return Ok(false);
            };
            if !record.templates.iter().any(|t| t.id == id) {
                return Ok(false);
            }
            let mut next = record.clone();
            next.templates.retain(|t| t.id != id);
            if next.templates.is_empty() {
                *current = None;
                true
            } else {
                *current = Some(Arc::new(next));
                false
            }
        };
        drop(slot);
        if emptied {
            self.prune();
        }
        Ok(true)
    }

    async fn remove_identity(&self, identity: &str) -> Result<bool, StoreError> {
        let Some(slot) = self.existing_slot(identity) else {
            return Ok(false);
        };
        let removed = slot.lock().take().is_some();
        drop(slot);
        if removed {
            self.prune();
        }
        Ok(removed)
    }

    async fn count_templates(&self) -> Result<u64, StoreError> {
        let slots: Vec<Slot> = self.slots.read().values().cloned().collect();
        Ok(slots
            .iter()
            .filter_map(|slot| slot.lock().clone())
            .map(|r| r.templates.len() as u64)
            .sum())
    }
}
