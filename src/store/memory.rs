use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::assignment::{AssignmentRecord, AssignmentStatus};
use crate::store::{AssignmentStore, CasOutcome, Expectation, Mutation};

type Deadlines = BTreeSet<(DateTime<Utc>, String)>;

/// DashMap-backed store. Per-order atomicity comes from the shard write lock
/// held by `get_mut`/`entry` for the duration of a transition; reads never
/// block writers of other orders.
#[derive(Default)]
pub struct InMemoryAssignmentStore {
    records: DashMap<String, AssignmentRecord>,
    archive: DashMap<String, Vec<AssignmentRecord>>,
    by_courier: DashMap<Uuid, BTreeSet<String>>,
    // (timeout_at, order_id) for every record currently in `offered`.
    deadlines: Mutex<Deadlines>,
}

impl InMemoryAssignmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_deadlines(&self) -> Result<MutexGuard<'_, Deadlines>, StoreError> {
        self.deadlines
            .lock()
            .map_err(|_| StoreError::Unavailable("deadline index lock poisoned".to_string()))
    }

    fn index_assignee(&self, record: &AssignmentRecord) {
        if let Some(courier_id) = record.assigned_to() {
            self.by_courier
                .entry(courier_id)
                .or_default()
                .insert(record.order_id().to_string());
        }
    }
}

fn reindex_deadline(deadlines: &mut Deadlines, before: Option<&AssignmentRecord>, after: &AssignmentRecord) {
    if let Some(timeout_at) = before.and_then(AssignmentRecord::timeout_at) {
        deadlines.remove(&(timeout_at, after.order_id().to_string()));
    }
    if let Some(timeout_at) = after.timeout_at() {
        deadlines.insert((timeout_at, after.order_id().to_string()));
    }
}

fn offered_to(record: &AssignmentRecord, courier_id: Uuid) -> bool {
    record
        .offers()
        .iter()
        .any(|offer| offer.courier_id == courier_id)
}

#[async_trait]
impl AssignmentStore for InMemoryAssignmentStore {
    async fn create(&self, record: AssignmentRecord) -> Result<AssignmentRecord, StoreError> {
        let order_id = record.order_id().to_string();

        match self.records.entry(order_id.clone()) {
            Entry::Occupied(mut slot) => {
                if !slot.get().is_terminal() {
                    return Err(StoreError::AlreadyActive(order_id));
                }
                let mut deadlines = self.lock_deadlines()?;
                reindex_deadline(&mut deadlines, None, &record);
                let previous = slot.insert(record.clone());
                self.archive.entry(order_id).or_default().push(previous);
            }
            Entry::Vacant(slot) => {
                let mut deadlines = self.lock_deadlines()?;
                reindex_deadline(&mut deadlines, None, &record);
                slot.insert(record.clone());
            }
        }

        self.index_assignee(&record);
        Ok(record)
    }

    async fn get(&self, order_id: &str) -> Result<Option<AssignmentRecord>, StoreError> {
        Ok(self.records.get(order_id).map(|entry| entry.value().clone()))
    }

    async fn compare_and_transition(
        &self,
        order_id: &str,
        expected: Expectation,
        mutation: Mutation,
    ) -> Result<CasOutcome, StoreError> {
        let Some(mut slot) = self.records.get_mut(order_id) else {
            return Ok(CasOutcome::NotFound);
        };

        if !expected.matches(&slot) {
            return Ok(CasOutcome::Conflict(slot.clone()));
        }

        let mut next = slot.clone();
        if let Err(reason) = mutation(&mut next) {
            return Ok(CasOutcome::Rejected {
                current: slot.clone(),
                reason,
            });
        }

        // Take the index lock before writing so a failure here leaves
        // neither the record nor the index changed.
        let mut deadlines = self.lock_deadlines()?;
        reindex_deadline(&mut deadlines, Some(slot.value()), &next);
        *slot = next.clone();
        drop(deadlines);
        drop(slot);

        self.index_assignee(&next);
        Ok(CasOutcome::Applied(next))
    }

    async fn list_for_courier(
        &self,
        courier_id: Uuid,
    ) -> Result<Vec<AssignmentRecord>, StoreError> {
        let order_ids = self
            .by_courier
            .get(&courier_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();

        let mut records = Vec::new();
        for order_id in &order_ids {
            if let Some(entry) = self.records.get(order_id) {
                if offered_to(entry.value(), courier_id) {
                    records.push(entry.value().clone());
                }
            }
            if let Some(entry) = self.archive.get(order_id) {
                records.extend(
                    entry
                        .value()
                        .iter()
                        .filter(|record| offered_to(record, courier_id))
                        .cloned(),
                );
            }
        }

        records.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
        Ok(records)
    }

    async fn list_pending(&self) -> Result<Vec<AssignmentRecord>, StoreError> {
        Ok(self
            .records
            .iter()
            .filter(|entry| !entry.value().is_terminal())
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn list_due_offers(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<AssignmentRecord>, StoreError> {
        let due: Vec<String> = {
            let deadlines = self.lock_deadlines()?;
            deadlines
                .iter()
                .take_while(|(timeout_at, _)| *timeout_at <= now)
                .map(|(_, order_id)| order_id.clone())
                .collect()
        };

        Ok(due
            .iter()
            .filter_map(|order_id| self.records.get(order_id).map(|entry| entry.value().clone()))
            .filter(|record| {
                record.status() == AssignmentStatus::Offered
                    && record.timeout_at().is_some_and(|timeout_at| timeout_at <= now)
            })
            .collect())
    }
}
