use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::courier::GeoPoint;
use crate::models::order::{NewAssignment, OrderSummary};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Pending,
    Offered,
    Accepted,
    RejectedByAll,
    Expired,
    Cancelled,
}

impl AssignmentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AssignmentStatus::Accepted
                | AssignmentStatus::RejectedByAll
                | AssignmentStatus::Expired
                | AssignmentStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AssignmentStatus::Pending => "pending",
            AssignmentStatus::Offered => "offered",
            AssignmentStatus::Accepted => "accepted",
            AssignmentStatus::RejectedByAll => "rejected_by_all",
            AssignmentStatus::Expired => "expired",
            AssignmentStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for AssignmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CancellerRole {
    Admin,
    Customer,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Canceller {
    pub role: CancellerRole,
    pub id: String,
}

/// Dispatch lifecycle of one order. Only `Offered` carries an assignee, so an
/// assignee can never be attached to any other status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AssignmentState {
    Pending,
    Offered {
        assigned_to: Uuid,
        offered_at: DateTime<Utc>,
        timeout_at: DateTime<Utc>,
    },
    Accepted {
        accepted_by: Uuid,
        accepted_at: DateTime<Utc>,
    },
    RejectedByAll {
        finished_at: DateTime<Utc>,
    },
    Expired {
        finished_at: DateTime<Utc>,
    },
    Cancelled {
        cancelled_by: Canceller,
        cancelled_at: DateTime<Utc>,
    },
}

impl AssignmentState {
    pub fn status(&self) -> AssignmentStatus {
        match self {
            AssignmentState::Pending => AssignmentStatus::Pending,
            AssignmentState::Offered { .. } => AssignmentStatus::Offered,
            AssignmentState::Accepted { .. } => AssignmentStatus::Accepted,
            AssignmentState::RejectedByAll { .. } => AssignmentStatus::RejectedByAll,
            AssignmentState::Expired { .. } => AssignmentStatus::Expired,
            AssignmentState::Cancelled { .. } => AssignmentStatus::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OfferOutcome {
    Outstanding,
    Accepted,
    Rejected,
    TimedOut,
    Withdrawn,
}

/// One entry per offer ever made for a record, in attempt order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OfferLog {
    pub courier_id: Uuid,
    pub attempt: u32,
    pub offered_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,
    pub outcome: OfferOutcome,
    pub responded_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseCause {
    Rejected { reason: Option<String> },
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exhaustion {
    /// No eligible courier within the search radius.
    NoCandidates,
    /// The offer budget is spent.
    AttemptsSpent,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransitionError {
    #[error("assignment is already {0}")]
    Terminal(AssignmentStatus),

    #[error("courier {0} does not hold the current offer")]
    StaleOffer(Uuid),

    #[error("assignment is {0}, expected pending")]
    NotPending(AssignmentStatus),

    #[error("courier {0} was already excluded for this order")]
    CourierExcluded(Uuid),

    #[error("offer budget spent ({attempts}/{max})")]
    AttemptsExhausted { attempts: u32, max: u32 },

    #[error("offer is valid until {timeout_at}")]
    OfferNotDue { timeout_at: DateTime<Utc> },
}

/// Persisted dispatch state for one order.
///
/// Every lifecycle field is private; the transition methods below are the
/// only way to change them, and each one checks its guard before touching
/// anything, so a failed transition leaves the record unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssignmentRecord {
    id: Uuid,
    order_id: String,
    customer_id: String,
    restaurant_id: String,
    restaurant_location: GeoPoint,
    customer_location: GeoPoint,
    order_summary: OrderSummary,
    assignment_radius_km: f64,
    priority: i32,
    #[serde(flatten)]
    state: AssignmentState,
    excluded_candidates: BTreeSet<Uuid>,
    current_attempt: u32,
    max_assignment_attempts: u32,
    offers: Vec<OfferLog>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl AssignmentRecord {
    /// Builds a `pending` record from already validated input.
    pub fn new(
        input: &NewAssignment,
        default_radius_km: f64,
        max_assignment_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id: input.order_id.trim().to_string(),
            customer_id: input.customer_id.trim().to_string(),
            restaurant_id: input.restaurant_id.trim().to_string(),
            restaurant_location: input.restaurant_location,
            customer_location: input.customer_location,
            order_summary: input.order_summary,
            assignment_radius_km: input.assignment_radius_km.unwrap_or(default_radius_km),
            priority: input.priority.unwrap_or(0),
            state: AssignmentState::Pending,
            excluded_candidates: BTreeSet::new(),
            current_attempt: 0,
            max_assignment_attempts,
            offers: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn order_id(&self) -> &str {
        &self.order_id
    }

    pub fn customer_id(&self) -> &str {
        &self.customer_id
    }

    pub fn restaurant_id(&self) -> &str {
        &self.restaurant_id
    }

    pub fn restaurant_location(&self) -> GeoPoint {
        self.restaurant_location
    }

    pub fn customer_location(&self) -> GeoPoint {
        self.customer_location
    }

    pub fn order_summary(&self) -> OrderSummary {
        self.order_summary
    }

    pub fn assignment_radius_km(&self) -> f64 {
        self.assignment_radius_km
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn state(&self) -> &AssignmentState {
        &self.state
    }

    pub fn status(&self) -> AssignmentStatus {
        self.state.status()
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn assigned_to(&self) -> Option<Uuid> {
        match self.state {
            AssignmentState::Offered { assigned_to, .. } => Some(assigned_to),
            _ => None,
        }
    }

    pub fn offered_at(&self) -> Option<DateTime<Utc>> {
        match self.state {
            AssignmentState::Offered { offered_at, .. } => Some(offered_at),
            _ => None,
        }
    }

    pub fn timeout_at(&self) -> Option<DateTime<Utc>> {
        match self.state {
            AssignmentState::Offered { timeout_at, .. } => Some(timeout_at),
            _ => None,
        }
    }

    pub fn accepted_at(&self) -> Option<DateTime<Utc>> {
        match self.state {
            AssignmentState::Accepted { accepted_at, .. } => Some(accepted_at),
            _ => None,
        }
    }

    pub fn accepted_by(&self) -> Option<Uuid> {
        match self.state {
            AssignmentState::Accepted { accepted_by, .. } => Some(accepted_by),
            _ => None,
        }
    }

    pub fn excluded_candidates(&self) -> &BTreeSet<Uuid> {
        &self.excluded_candidates
    }

    pub fn current_attempt(&self) -> u32 {
        self.current_attempt
    }

    pub fn max_assignment_attempts(&self) -> u32 {
        self.max_assignment_attempts
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.current_attempt >= self.max_assignment_attempts
    }

    pub fn offers(&self) -> &[OfferLog] {
        &self.offers
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// `pending -> offered`
    pub fn offer(
        &mut self,
        courier_id: Uuid,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<(), TransitionError> {
        self.ensure_pending()?;
        if self.excluded_candidates.contains(&courier_id) {
            return Err(TransitionError::CourierExcluded(courier_id));
        }
        if self.attempts_exhausted() {
            return Err(TransitionError::AttemptsExhausted {
                attempts: self.current_attempt,
                max: self.max_assignment_attempts,
            });
        }

        self.current_attempt += 1;
        let timeout_at = now + window;
        self.state = AssignmentState::Offered {
            assigned_to: courier_id,
            offered_at: now,
            timeout_at,
        };
        self.offers.push(OfferLog {
            courier_id,
            attempt: self.current_attempt,
            offered_at: now,
            timeout_at,
            outcome: OfferOutcome::Outstanding,
            responded_at: None,
            reason: None,
        });
        self.updated_at = now;
        Ok(())
    }

    /// `offered -> accepted`, only for the courier holding the offer. The
    /// window is enforced by the timeout sweep, so an accept that lands after
    /// `timeout_at` but before the sweep releases the offer still counts.
    pub fn accept(&mut self, courier_id: Uuid, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure_live()?;
        self.held_offer(courier_id)?;

        self.state = AssignmentState::Accepted {
            accepted_by: courier_id,
            accepted_at: now,
        };
        self.close_outstanding_offer(OfferOutcome::Accepted, now, None);
        self.updated_at = now;
        Ok(())
    }

    /// `offered -> pending` on reject or timeout. The courier is excluded for
    /// the rest of this record's life.
    pub fn release(
        &mut self,
        courier_id: Uuid,
        cause: ReleaseCause,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.ensure_live()?;
        let timeout_at = self.held_offer(courier_id)?;

        let (outcome, reason) = match cause {
            ReleaseCause::Rejected { reason } => (OfferOutcome::Rejected, reason),
            ReleaseCause::TimedOut => {
                if now < timeout_at {
                    return Err(TransitionError::OfferNotDue { timeout_at });
                }
                (OfferOutcome::TimedOut, None)
            }
        };

        self.excluded_candidates.insert(courier_id);
        self.state = AssignmentState::Pending;
        self.close_outstanding_offer(outcome, now, reason);
        self.updated_at = now;
        Ok(())
    }

    /// `pending -> rejected_by_all | expired`
    pub fn exhaust(&mut self, why: Exhaustion, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure_pending()?;

        self.state = match why {
            Exhaustion::NoCandidates => AssignmentState::RejectedByAll { finished_at: now },
            Exhaustion::AttemptsSpent => AssignmentState::Expired { finished_at: now },
        };
        self.updated_at = now;
        Ok(())
    }

    /// `pending | offered -> cancelled`
    pub fn cancel(&mut self, by: Canceller, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure_live()?;

        if matches!(self.state, AssignmentState::Offered { .. }) {
            self.close_outstanding_offer(OfferOutcome::Withdrawn, now, None);
        }
        self.state = AssignmentState::Cancelled {
            cancelled_by: by,
            cancelled_at: now,
        };
        self.updated_at = now;
        Ok(())
    }

    fn ensure_live(&self) -> Result<(), TransitionError> {
        let status = self.status();
        if status.is_terminal() {
            return Err(TransitionError::Terminal(status));
        }
        Ok(())
    }

    fn ensure_pending(&self) -> Result<(), TransitionError> {
        self.ensure_live()?;
        match self.state {
            AssignmentState::Pending => Ok(()),
            _ => Err(TransitionError::NotPending(self.status())),
        }
    }

    fn held_offer(&self, courier_id: Uuid) -> Result<DateTime<Utc>, TransitionError> {
        match self.state {
            AssignmentState::Offered {
                assigned_to,
                timeout_at,
                ..
            } if assigned_to == courier_id => Ok(timeout_at),
            _ => Err(TransitionError::StaleOffer(courier_id)),
        }
    }

    fn close_outstanding_offer(
        &mut self,
        outcome: OfferOutcome,
        now: DateTime<Utc>,
        reason: Option<String>,
    ) {
        if let Some(entry) = self
            .offers
            .iter_mut()
            .rev()
            .find(|entry| entry.outcome == OfferOutcome::Outstanding)
        {
            entry.outcome = outcome;
            entry.responded_at = Some(now);
            entry.reason = reason;
        }
    }
}
