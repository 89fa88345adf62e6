use std::cmp::Ordering;
use std::collections::BinaryHeap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::assignment::AssignmentRecord;

/// An expired offer waiting for the sweep to hand it back to dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueOffer {
    pub order_id: String,
    pub courier_id: Uuid,
    pub priority: i32,
    pub timeout_at: DateTime<Utc>,
}

impl DueOffer {
    pub fn from_record(record: &AssignmentRecord) -> Option<Self> {
        Some(Self {
            order_id: record.order_id().to_string(),
            courier_id: record.assigned_to()?,
            priority: record.priority(),
            timeout_at: record.timeout_at()?,
        })
    }
}

// Max-heap order: higher priority first, then the offer that expired earliest.
impl Ord for DueOffer {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.timeout_at.cmp(&self.timeout_at))
            .then_with(|| other.order_id.cmp(&self.order_id))
    }
}

impl PartialOrd for DueOffer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub struct DueQueue {
    heap: BinaryHeap<DueOffer>,
}

impl DueQueue {
    pub fn from_records<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a AssignmentRecord>,
    {
        Self {
            heap: records.into_iter().filter_map(DueOffer::from_record).collect(),
        }
    }

    pub fn push(&mut self, offer: DueOffer) {
        self.heap.push(offer);
    }

    pub fn pop(&mut self) -> Option<DueOffer> {
        self.heap.pop()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
