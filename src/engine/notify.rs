use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::NotifyError;
use crate::models::assignment::{AssignmentRecord, AssignmentStatus};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssignmentEvent {
    pub assignment_id: Uuid,
    pub order_id: String,
    pub status: AssignmentStatus,
    /// Offer holder for `offered`, the accepting courier for `accepted`.
    pub courier_id: Option<Uuid>,
    pub attempt: u32,
    pub timeout_at: Option<DateTime<Utc>>,
    pub at: DateTime<Utc>,
}

impl AssignmentEvent {
    pub fn from_record(record: &AssignmentRecord) -> Self {
        Self {
            assignment_id: record.id(),
            order_id: record.order_id().to_string(),
            status: record.status(),
            courier_id: record.assigned_to().or(record.accepted_by()),
            attempt: record.current_attempt(),
            timeout_at: record.timeout_at(),
            at: record.updated_at(),
        }
    }
}

/// Push channel towards couriers and the order-placement side. Delivery is
/// best effort; callers log failures and carry on.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &AssignmentEvent) -> Result<(), NotifyError>;
}

pub struct BroadcastNotifier {
    tx: broadcast::Sender<AssignmentEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _unused_rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AssignmentEvent> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn notify(&self, event: &AssignmentEvent) -> Result<(), NotifyError> {
        self.tx
            .send(event.clone())
            .map(|_| ())
            .map_err(|_| NotifyError::NoSubscribers)
    }
}
