pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::assignment::{AssignmentRecord, AssignmentStatus, TransitionError};

/// The `(status, assigned_to)` pair a writer read before deciding on a
/// transition. A write only lands if the stored record still shows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expectation {
    pub status: AssignmentStatus,
    pub assignee: Option<Uuid>,
}

impl Expectation {
    pub fn pending() -> Self {
        Self {
            status: AssignmentStatus::Pending,
            assignee: None,
        }
    }

    pub fn offered_to(courier_id: Uuid) -> Self {
        Self {
            status: AssignmentStatus::Offered,
            assignee: Some(courier_id),
        }
    }

    pub fn of(record: &AssignmentRecord) -> Self {
        Self {
            status: record.status(),
            assignee: record.assigned_to(),
        }
    }

    pub fn matches(&self, record: &AssignmentRecord) -> bool {
        record.status() == self.status && record.assigned_to() == self.assignee
    }
}

pub type Mutation =
    Box<dyn FnOnce(&mut AssignmentRecord) -> Result<(), TransitionError> + Send>;

pub fn mutation<F>(f: F) -> Mutation
where
    F: FnOnce(&mut AssignmentRecord) -> Result<(), TransitionError> + Send + 'static,
{
    Box::new(f)
}

#[derive(Debug, Clone)]
pub enum CasOutcome {
    /// The mutation was committed; holds the record as written.
    Applied(AssignmentRecord),
    /// The stored record no longer matches the expectation. Nothing was written.
    Conflict(AssignmentRecord),
    /// The expectation matched but the transition guard refused. Nothing was written.
    Rejected {
        current: AssignmentRecord,
        reason: TransitionError,
    },
    NotFound,
}

/// Sole owner of assignment state.
///
/// Implementations must apply `compare_and_transition` atomically per order:
/// the expectation check, the mutation and the write happen as one step, and
/// a failed mutation leaves the stored record untouched.
#[async_trait]
pub trait AssignmentStore: Send + Sync {
    /// Fails with `StoreError::AlreadyActive` while a non-terminal record
    /// exists for the same order. A terminal record is superseded and kept
    /// for history.
    async fn create(&self, record: AssignmentRecord) -> Result<AssignmentRecord, StoreError>;

    async fn get(&self, order_id: &str) -> Result<Option<AssignmentRecord>, StoreError>;

    async fn compare_and_transition(
        &self,
        order_id: &str,
        expected: Expectation,
        mutation: Mutation,
    ) -> Result<CasOutcome, StoreError>;

    /// Every record, current or superseded, in which the courier was offered
    /// the order. Newest first.
    async fn list_for_courier(&self, courier_id: Uuid)
    -> Result<Vec<AssignmentRecord>, StoreError>;

    /// All non-terminal records.
    async fn list_pending(&self) -> Result<Vec<AssignmentRecord>, StoreError>;

    /// Records in `offered` whose `timeout_at` is at or before `now`.
    async fn list_due_offers(&self, now: DateTime<Utc>)
    -> Result<Vec<AssignmentRecord>, StoreError>;
}
