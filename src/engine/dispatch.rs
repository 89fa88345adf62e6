use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::notify::{AssignmentEvent, Notifier};
use crate::error::{DispatchError, NotifyError, StoreError};
use crate::geo::GeoIndex;
use crate::models::assignment::{
    AssignmentRecord, AssignmentStatus, Canceller, CancellerRole, Exhaustion, OfferOutcome,
    ReleaseCause,
};
use crate::models::courier::GeoPoint;
use crate::models::order::{NewAssignment, OrderSummary};
use crate::observability::metrics::Metrics;
use crate::store::{AssignmentStore, CasOutcome, Expectation, mutation};

// A pending advance can lose its guard only when the record moved on under
// it; retrying a few times against the fresh copy is enough.
const ADVANCE_RETRIES: usize = 4;

#[derive(Debug, Clone, Copy)]
pub struct DispatchPolicy {
    pub default_radius_km: f64,
    pub max_assignment_attempts: u32,
    pub offer_timeout: Duration,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            default_radius_km: 5.0,
            max_assignment_attempts: 3,
            offer_timeout: Duration::seconds(60),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RespondAction {
    Accept,
    Reject,
}

/// Result of a courier response or a timeout.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", content = "record", rename_all = "snake_case")]
pub enum ResponseOutcome {
    Applied(Box<AssignmentRecord>),
    /// The caller no longer holds the offer; nothing changed.
    StaleOffer(Box<AssignmentRecord>),
    AlreadyTerminal(Box<AssignmentRecord>),
    NotFound,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", content = "record", rename_all = "snake_case")]
pub enum CancelOutcome {
    Applied(Box<AssignmentRecord>),
    AlreadyTerminal(Box<AssignmentRecord>),
    NotFound,
}

/// A courier's view of one offer it received.
#[derive(Debug, Clone, Serialize)]
pub struct PartnerAssignment {
    pub assignment_id: Uuid,
    pub order_id: String,
    pub restaurant_id: String,
    pub restaurant_location: GeoPoint,
    pub customer_location: GeoPoint,
    pub order_summary: OrderSummary,
    pub assignment_status: AssignmentStatus,
    pub attempt: u32,
    pub offer_outcome: OfferOutcome,
    pub offered_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

enum Step {
    Offer(Uuid),
    Exhaust(Exhaustion),
}

pub struct DispatchEngine {
    store: Arc<dyn AssignmentStore>,
    geo: GeoIndex,
    notifier: Arc<dyn Notifier>,
    policy: DispatchPolicy,
    metrics: Metrics,
}

impl DispatchEngine {
    pub fn new(
        store: Arc<dyn AssignmentStore>,
        geo: GeoIndex,
        notifier: Arc<dyn Notifier>,
        policy: DispatchPolicy,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            geo,
            notifier,
            policy,
            metrics,
        }
    }

    pub fn policy(&self) -> &DispatchPolicy {
        &self.policy
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Validates the order, picks the first candidate, persists a `pending`
    /// record and makes the first offer before returning. The returned record is `offered`, or terminal
    /// when nobody could be offered the order.
    pub async fn create_and_assign(
        &self,
        input: NewAssignment,
    ) -> Result<AssignmentRecord, DispatchError> {
        let started = Instant::now();
        let result = self.create_and_assign_inner(input).await;

        let outcome = match &result {
            Ok(record) => record.status().as_str(),
            Err(_) => "error",
        };
        self.metrics
            .dispatch_latency_seconds
            .with_label_values(&[outcome])
            .observe(started.elapsed().as_secs_f64());

        result
    }

    async fn create_and_assign_inner(
        &self,
        input: NewAssignment,
    ) -> Result<AssignmentRecord, DispatchError> {
        input.validate()?;

        let record = AssignmentRecord::new(
            &input,
            self.policy.default_radius_km,
            self.policy.max_assignment_attempts,
            Utc::now(),
        );
        // A directory failure here leaves nothing behind for the order.
        let first = self.plan(&record).await?;
        let record = self.store.create(record).await?;
        info!(
            order_id = %record.order_id(),
            assignment_id = %record.id(),
            radius_km = record.assignment_radius_km(),
            "assignment created"
        );

        self.advance(record, Some(first)).await
    }

    pub async fn respond(
        &self,
        order_id: &str,
        courier_id: Uuid,
        action: RespondAction,
        reason: Option<String>,
    ) -> Result<ResponseOutcome, DispatchError> {
        match action {
            RespondAction::Accept => self.accept(order_id, courier_id).await,
            RespondAction::Reject => self.reject(order_id, courier_id, reason).await,
        }
    }

    pub async fn accept(
        &self,
        order_id: &str,
        courier_id: Uuid,
    ) -> Result<ResponseOutcome, DispatchError> {
        let now = Utc::now();
        let outcome = self
            .store
            .compare_and_transition(
                order_id,
                Expectation::offered_to(courier_id),
                mutation(move |record| record.accept(courier_id, now)),
            )
            .await?;

        let accepted = match self.settle(outcome, "accept", order_id, courier_id) {
            Ok(record) => record,
            Err(unapplied) => return Ok(unapplied),
        };

        self.metrics
            .observe_transition(AssignmentStatus::Offered, accepted.status());
        info!(order_id, courier_id = %courier_id, attempt = accepted.current_attempt(), "offer accepted");
        self.publish(&accepted).await;

        Ok(ResponseOutcome::Applied(Box::new(accepted)))
    }

    pub async fn reject(
        &self,
        order_id: &str,
        courier_id: Uuid,
        reason: Option<String>,
    ) -> Result<ResponseOutcome, DispatchError> {
        self.release(order_id, courier_id, ReleaseCause::Rejected { reason }, Utc::now(), "reject")
            .await
    }

    /// Timeout path. Only the sweep calls this.
    pub(crate) async fn expire_offer(
        &self,
        order_id: &str,
        courier_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ResponseOutcome, DispatchError> {
        self.release(order_id, courier_id, ReleaseCause::TimedOut, now, "timeout")
            .await
    }

    async fn release(
        &self,
        order_id: &str,
        courier_id: Uuid,
        cause: ReleaseCause,
        now: DateTime<Utc>,
        action: &'static str,
    ) -> Result<ResponseOutcome, DispatchError> {
        let outcome = self
            .store
            .compare_and_transition(
                order_id,
                Expectation::offered_to(courier_id),
                mutation(move |record| record.release(courier_id, cause, now)),
            )
            .await?;

        let released = match self.settle(outcome, action, order_id, courier_id) {
            Ok(record) => record,
            Err(unapplied) => return Ok(unapplied),
        };

        self.metrics
            .observe_transition(AssignmentStatus::Offered, released.status());
        info!(
            order_id,
            courier_id = %courier_id,
            attempt = released.current_attempt(),
            action,
            "offer released"
        );

        let next = self.advance(released, None).await?;
        Ok(ResponseOutcome::Applied(Box::new(next)))
    }

    /// Re-runs `pending -> offered` for a record left pending by an
    /// interrupted reassignment.
    pub(crate) async fn resume(
        &self,
        order_id: &str,
    ) -> Result<Option<AssignmentRecord>, DispatchError> {
        match self.store.get(order_id).await? {
            Some(record) if record.status() == AssignmentStatus::Pending => {
                self.advance(record, None).await.map(Some)
            }
            _ => Ok(None),
        }
    }

    pub async fn cancel(
        &self,
        order_id: &str,
        by: Canceller,
    ) -> Result<CancelOutcome, DispatchError> {
        let Some(mut record) = self.store.get(order_id).await? else {
            return Ok(CancelOutcome::NotFound);
        };

        if by.role == CancellerRole::Customer && by.id != record.customer_id() {
            return Err(DispatchError::Forbidden {
                actor: format!("customer {}", by.id),
                order_id: order_id.to_string(),
            });
        }

        // Each conflict means another transition landed first. The state
        // machine has a bounded number of transitions, so this terminates.
        loop {
            if record.is_terminal() {
                return Ok(CancelOutcome::AlreadyTerminal(Box::new(record)));
            }

            let from = record.status();
            let now = Utc::now();
            let canceller = by.clone();
            let outcome = self
                .store
                .compare_and_transition(
                    order_id,
                    Expectation::of(&record),
                    mutation(move |r| r.cancel(canceller, now)),
                )
                .await?;

            match outcome {
                CasOutcome::Applied(cancelled) => {
                    self.metrics.observe_transition(from, cancelled.status());
                    info!(order_id, role = ?by.role, actor = %by.id, "assignment cancelled");
                    self.publish(&cancelled).await;
                    return Ok(CancelOutcome::Applied(Box::new(cancelled)));
                }
                CasOutcome::Conflict(current) | CasOutcome::Rejected { current, .. } => {
                    debug!(order_id, status = %current.status(), "cancel raced another transition");
                    record = current;
                }
                CasOutcome::NotFound => return Ok(CancelOutcome::NotFound),
            }
        }
    }

    pub async fn get(&self, order_id: &str) -> Result<Option<AssignmentRecord>, DispatchError> {
        Ok(self.store.get(order_id).await?)
    }

    pub async fn active(&self) -> Result<Vec<AssignmentRecord>, DispatchError> {
        Ok(self.store.list_pending().await?)
    }

    pub(crate) async fn due_offers(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<AssignmentRecord>, DispatchError> {
        Ok(self.store.list_due_offers(now).await?)
    }

    /// Pending records untouched since `cutoff`.
    pub(crate) async fn stranded(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<AssignmentRecord>, DispatchError> {
        Ok(self
            .store
            .list_pending()
            .await?
            .into_iter()
            .filter(|record| {
                record.status() == AssignmentStatus::Pending && record.updated_at() <= cutoff
            })
            .collect())
    }

    pub async fn partner_assignments(
        &self,
        courier_id: Uuid,
    ) -> Result<Vec<PartnerAssignment>, DispatchError> {
        let records = self.store.list_for_courier(courier_id).await?;

        let mut views: Vec<PartnerAssignment> = records
            .iter()
            .flat_map(|record| {
                record
                    .offers()
                    .iter()
                    .filter(move |offer| offer.courier_id == courier_id)
                    .map(move |offer| PartnerAssignment {
                        assignment_id: record.id(),
                        order_id: record.order_id().to_string(),
                        restaurant_id: record.restaurant_id().to_string(),
                        restaurant_location: record.restaurant_location(),
                        customer_location: record.customer_location(),
                        order_summary: record.order_summary(),
                        assignment_status: record.status(),
                        attempt: offer.attempt,
                        offer_outcome: offer.outcome,
                        offered_at: offer.offered_at,
                        timeout_at: offer.timeout_at,
                        responded_at: offer.responded_at,
                        reason: offer.reason.clone(),
                    })
            })
            .collect();

        views.sort_by(|a, b| b.offered_at.cmp(&a.offered_at));
        Ok(views)
    }

    /// Picks the next move for a `pending` record: exhaustion when the
    /// budget is spent, otherwise the nearest courier not yet excluded.
    async fn plan(&self, record: &AssignmentRecord) -> Result<Step, DispatchError> {
        if record.attempts_exhausted() {
            return Ok(Step::Exhaust(Exhaustion::AttemptsSpent));
        }

        let mut candidates = self
            .geo
            .candidates(
                &record.restaurant_location(),
                record.assignment_radius_km(),
                record.excluded_candidates(),
            )
            .await?;

        Ok(match candidates.next() {
            Some(candidate) => {
                debug!(
                    order_id = %record.order_id(),
                    courier_id = %candidate.courier_id,
                    distance_km = candidate.distance_km,
                    "nearest candidate selected"
                );
                Step::Offer(candidate.courier_id)
            }
            None => Step::Exhaust(Exhaustion::NoCandidates),
        })
    }

    /// Drives a `pending` record to `offered` or to a terminal status.
    /// `planned` is used for the first try instead of asking the directory.
    async fn advance(
        &self,
        mut record: AssignmentRecord,
        mut planned: Option<Step>,
    ) -> Result<AssignmentRecord, DispatchError> {
        for _ in 0..ADVANCE_RETRIES {
            if record.status() != AssignmentStatus::Pending {
                return Ok(record);
            }

            let order_id = record.order_id().to_string();
            let step = match planned.take() {
                Some(step) => step,
                None => self.plan(&record).await?,
            };

            let now = Utc::now();
            let change = match step {
                Step::Offer(courier_id) => {
                    let window = self.policy.offer_timeout;
                    mutation(move |r| r.offer(courier_id, now, window))
                }
                Step::Exhaust(why) => mutation(move |r| r.exhaust(why, now)),
            };

            match self
                .store
                .compare_and_transition(&order_id, Expectation::pending(), change)
                .await?
            {
                CasOutcome::Applied(next) => {
                    self.metrics
                        .observe_transition(AssignmentStatus::Pending, next.status());
                    info!(
                        order_id = %order_id,
                        status = %next.status(),
                        courier_id = ?next.assigned_to(),
                        attempt = next.current_attempt(),
                        "assignment advanced"
                    );
                    self.publish(&next).await;
                    return Ok(next);
                }
                CasOutcome::Conflict(current) => {
                    debug!(order_id = %order_id, status = %current.status(), "assignment advanced by another writer");
                    return Ok(current);
                }
                CasOutcome::Rejected { current, reason } => {
                    debug!(order_id = %order_id, reason = %reason, "offer guard refused; re-reading");
                    record = current;
                }
                CasOutcome::NotFound => {
                    return Err(StoreError::Unavailable(format!(
                        "assignment for order {order_id} vanished mid-transition"
                    ))
                    .into());
                }
            }
        }

        if record.status() == AssignmentStatus::Pending {
            warn!(
                order_id = %record.order_id(),
                retries = ADVANCE_RETRIES,
                "assignment still pending after retries; left for the sweep"
            );
        }
        Ok(record)
    }

    /// Splits a CAS outcome into the committed record or the caller-facing
    /// reason nothing was applied.
    fn settle(
        &self,
        outcome: CasOutcome,
        action: &'static str,
        order_id: &str,
        courier_id: Uuid,
    ) -> Result<AssignmentRecord, ResponseOutcome> {
        match outcome {
            CasOutcome::Applied(record) => Ok(record),
            CasOutcome::NotFound => Err(ResponseOutcome::NotFound),
            CasOutcome::Conflict(current) | CasOutcome::Rejected { current, .. } => {
                if current.is_terminal() {
                    return Err(ResponseOutcome::AlreadyTerminal(Box::new(current)));
                }
                self.metrics
                    .stale_responses_total
                    .with_label_values(&[action])
                    .inc();
                warn!(
                    order_id,
                    courier_id = %courier_id,
                    action,
                    status = %current.status(),
                    holder = ?current.assigned_to(),
                    "stale offer, no action taken"
                );
                Err(ResponseOutcome::StaleOffer(Box::new(current)))
            }
        }
    }

    async fn publish(&self, record: &AssignmentRecord) {
        let event = AssignmentEvent::from_record(record);
        match self.notifier.notify(&event).await {
            Ok(()) => {}
            Err(NotifyError::NoSubscribers) => {
                debug!(order_id = %event.order_id, status = %event.status, "no event subscribers");
            }
            Err(err) => {
                warn!(order_id = %event.order_id, status = %event.status, error = %err, "notification failed");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    use super::*;
    use crate::engine::notify::{AssignmentEvent, Notifier};
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::error::{DirectoryError, DispatchError, NotifyError};
    use crate::geo::GeoIndex;
    use crate::geo::directory::{CourierDirectory, InMemoryCourierDirectory};
    use crate::models::assignment::{AssignmentStatus, Canceller, CancellerRole, OfferOutcome};
    use crate::models::courier::{Courier, GeoPoint};
    use crate::models::order::{NewAssignment, OrderSummary};
    use crate::observability::metrics::Metrics;
    use crate::store::memory::InMemoryAssignmentStore;

    pub(crate) const RESTAURANT: GeoPoint = GeoPoint {
        lat: 52.52,
        lng: 13.405,
    };

    #[derive(Default)]
    pub(crate) struct RecordingNotifier {
        pub events: Mutex<Vec<AssignmentEvent>>,
        pub fail: bool,
    }

    impl RecordingNotifier {
        pub fn statuses(&self) -> Vec<AssignmentStatus> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .map(|event| event.status)
                .collect()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, event: &AssignmentEvent) -> Result<(), NotifyError> {
            if self.fail {
                return Err(NotifyError::Delivery("push gateway down".to_string()));
            }
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    pub(crate) struct Harness {
        pub engine: Arc<DispatchEngine>,
        pub directory: Arc<InMemoryCourierDirectory>,
        pub store: Arc<InMemoryAssignmentStore>,
        pub notifier: Arc<RecordingNotifier>,
    }

    impl Harness {
        pub fn new(max_attempts: u32, offer_timeout: Duration) -> Self {
            Self::with_notifier(max_attempts, offer_timeout, RecordingNotifier::default())
        }

        pub fn with_notifier(
            max_attempts: u32,
            offer_timeout: Duration,
            notifier: RecordingNotifier,
        ) -> Self {
            let directory = Arc::new(InMemoryCourierDirectory::new());
            let store = Arc::new(InMemoryAssignmentStore::new());
            let notifier = Arc::new(notifier);
            let engine = Arc::new(DispatchEngine::new(
                store.clone(),
                GeoIndex::new(directory.clone()),
                notifier.clone(),
                DispatchPolicy {
                    default_radius_km: 5.0,
                    max_assignment_attempts: max_attempts,
                    offer_timeout,
                },
                Metrics::new(),
            ));
            Self {
                engine,
                directory,
                store,
                notifier,
            }
        }

        /// Registers an available courier `km_north` kilometres north of the restaurant.
        pub fn courier_north(&self, km_north: f64) -> Uuid {
            let location = GeoPoint {
                lat: RESTAURANT.lat + km_north / 111.19,
                lng: RESTAURANT.lng,
            };
            self.directory
                .register(format!("courier-{km_north}"), location)
                .id
        }
    }

    pub(crate) fn order(order_id: &str) -> NewAssignment {
        NewAssignment {
            order_id: order_id.to_string(),
            customer_id: "customer-1".to_string(),
            restaurant_id: "restaurant-1".to_string(),
            restaurant_location: RESTAURANT,
            customer_location: GeoPoint {
                lat: 52.50,
                lng: 13.42,
            },
            order_summary: OrderSummary {
                total_amount: 27.5,
                item_count: 2,
            },
            priority: None,
            assignment_radius_km: Some(5.0),
        }
    }

    /// In-memory directory that can be switched off.
    #[derive(Default)]
    struct FlakyDirectory {
        inner: InMemoryCourierDirectory,
        down: AtomicBool,
    }

    #[async_trait]
    impl CourierDirectory for FlakyDirectory {
        async fn available_couriers(&self) -> Result<Vec<Courier>, DirectoryError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(DirectoryError::Unavailable("directory down".to_string()));
            }
            self.inner.available_couriers().await
        }

        async fn courier(&self, id: Uuid) -> Result<Option<Courier>, DirectoryError> {
            self.inner.courier(id).await
        }
    }

    fn admin() -> Canceller {
        Canceller {
            role: CancellerRole::Admin,
            id: "ops-1".to_string(),
        }
    }

    #[tokio::test]
    async fn single_courier_in_range_gets_the_offer() {
        let h = Harness::new(3, Duration::seconds(60));
        let courier = h.courier_north(3.0);

        let record = h.engine.create_and_assign(order("order-a")).await.unwrap();

        assert_eq!(record.status(), AssignmentStatus::Offered);
        assert_eq!(record.assigned_to(), Some(courier));
        assert_eq!(record.current_attempt(), 1);
        assert_eq!(h.notifier.statuses(), vec![AssignmentStatus::Offered]);
    }

    #[tokio::test]
    async fn no_courier_in_range_is_rejected_by_all() {
        let h = Harness::new(1, Duration::seconds(60));
        h.courier_north(9.0);

        let record = h.engine.create_and_assign(order("order-b")).await.unwrap();

        assert_eq!(record.status(), AssignmentStatus::RejectedByAll);
        assert!(record.offers().is_empty());
        assert_eq!(record.current_attempt(), 0);
        assert_eq!(h.notifier.statuses(), vec![AssignmentStatus::RejectedByAll]);
    }

    #[tokio::test]
    async fn reject_reassigns_to_the_next_courier() {
        let h = Harness::new(3, Duration::seconds(60));
        let first = h.courier_north(1.0);
        let second = h.courier_north(3.0);

        let record = h.engine.create_and_assign(order("order-c")).await.unwrap();
        assert_eq!(record.assigned_to(), Some(first));

        let outcome = h
            .engine
            .reject("order-c", first, Some("bike broke".to_string()))
            .await
            .unwrap();

        let ResponseOutcome::Applied(record) = outcome else {
            panic!("expected reject to apply, got {outcome:?}");
        };
        assert_eq!(record.status(), AssignmentStatus::Offered);
        assert_eq!(record.assigned_to(), Some(second));
        assert_eq!(record.current_attempt(), 2);
        assert!(record.excluded_candidates().contains(&first));
        assert_eq!(record.offers()[0].outcome, OfferOutcome::Rejected);
    }

    #[tokio::test]
    async fn reject_with_nobody_left_ends_rejected_by_all() {
        let h = Harness::new(3, Duration::seconds(60));
        let only = h.courier_north(1.0);
        h.engine.create_and_assign(order("order-1")).await.unwrap();

        let outcome = h.engine.reject("order-1", only, None).await.unwrap();
        let ResponseOutcome::Applied(record) = outcome else {
            panic!("expected reject to apply");
        };
        assert_eq!(record.status(), AssignmentStatus::RejectedByAll);
        assert!(record.assigned_to().is_none());
    }

    #[tokio::test]
    async fn spent_budget_expires_even_with_candidates_left() {
        let h = Harness::new(1, Duration::seconds(60));
        let first = h.courier_north(1.0);
        h.courier_north(2.0);
        h.engine.create_and_assign(order("order-1")).await.unwrap();

        let ResponseOutcome::Applied(record) = h.engine.reject("order-1", first, None).await.unwrap()
        else {
            panic!("expected reject to apply");
        };
        assert_eq!(record.status(), AssignmentStatus::Expired);
        assert_eq!(record.current_attempt(), 1);
    }

    #[tokio::test]
    async fn response_from_someone_else_is_stale() {
        let h = Harness::new(3, Duration::seconds(60));
        let holder = h.courier_north(1.0);
        let bystander = h.courier_north(2.0);
        h.engine.create_and_assign(order("order-1")).await.unwrap();

        let accept = h.engine.accept("order-1", bystander).await.unwrap();
        assert!(matches!(accept, ResponseOutcome::StaleOffer(_)));
        let reject = h.engine.reject("order-1", bystander, None).await.unwrap();
        assert!(matches!(reject, ResponseOutcome::StaleOffer(_)));

        let current = h.engine.get("order-1").await.unwrap().unwrap();
        assert_eq!(current.assigned_to(), Some(holder));
        assert!(current.excluded_candidates().is_empty());
    }

    #[tokio::test]
    async fn unknown_order_is_not_found() {
        let h = Harness::new(3, Duration::seconds(60));
        let outcome = h.engine.accept("nope", Uuid::new_v4()).await.unwrap();
        assert!(matches!(outcome, ResponseOutcome::NotFound));
        let cancel = h.engine.cancel("nope", admin()).await.unwrap();
        assert!(matches!(cancel, CancelOutcome::NotFound));
    }

    #[tokio::test]
    async fn invalid_input_is_never_persisted() {
        let h = Harness::new(3, Duration::seconds(60));
        let mut bad = order("order-1");
        bad.restaurant_location = GeoPoint {
            lat: 95.0,
            lng: 0.0,
        };

        let err = h.engine.create_and_assign(bad).await.unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));
        assert!(h.engine.get("order-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_active_order_is_refused() {
        let h = Harness::new(3, Duration::seconds(60));
        h.courier_north(1.0);
        h.engine.create_and_assign(order("order-1")).await.unwrap();

        let err = h.engine.create_and_assign(order("order-1")).await.unwrap_err();
        assert!(matches!(err, DispatchError::AlreadyActive(id) if id == "order-1"));
    }

    #[tokio::test]
    async fn cancelled_record_is_frozen() {
        let h = Harness::new(3, Duration::seconds(60));
        let courier = h.courier_north(1.0);
        h.courier_north(2.0);
        h.engine.create_and_assign(order("order-1")).await.unwrap();

        let CancelOutcome::Applied(cancelled) = h.engine.cancel("order-1", admin()).await.unwrap()
        else {
            panic!("expected cancel to apply");
        };
        assert_eq!(cancelled.status(), AssignmentStatus::Cancelled);

        assert!(matches!(
            h.engine.accept("order-1", courier).await.unwrap(),
            ResponseOutcome::AlreadyTerminal(_)
        ));
        assert!(matches!(
            h.engine.reject("order-1", courier, None).await.unwrap(),
            ResponseOutcome::AlreadyTerminal(_)
        ));
        assert!(matches!(
            h.engine
                .expire_offer("order-1", courier, Utc::now() + Duration::hours(1))
                .await
                .unwrap(),
            ResponseOutcome::AlreadyTerminal(_)
        ));
        assert!(matches!(
            h.engine.cancel("order-1", admin()).await.unwrap(),
            CancelOutcome::AlreadyTerminal(_)
        ));

        let after = h.engine.get("order-1").await.unwrap().unwrap();
        assert_eq!(after, *cancelled);
    }

    #[tokio::test]
    async fn only_the_ordering_customer_may_cancel() {
        let h = Harness::new(3, Duration::seconds(60));
        h.courier_north(1.0);
        h.engine.create_and_assign(order("order-1")).await.unwrap();

        let stranger = Canceller {
            role: CancellerRole::Customer,
            id: "customer-2".to_string(),
        };
        let err = h.engine.cancel("order-1", stranger).await.unwrap_err();
        assert!(matches!(err, DispatchError::Forbidden { .. }));

        let owner = Canceller {
            role: CancellerRole::Customer,
            id: "customer-1".to_string(),
        };
        assert!(matches!(
            h.engine.cancel("order-1", owner).await.unwrap(),
            CancelOutcome::Applied(_)
        ));
    }

    #[tokio::test]
    async fn failed_notification_does_not_roll_back() {
        let h = Harness::with_notifier(
            3,
            Duration::seconds(60),
            RecordingNotifier {
                fail: true,
                ..Default::default()
            },
        );
        let courier = h.courier_north(1.0);

        let record = h.engine.create_and_assign(order("order-1")).await.unwrap();
        assert_eq!(record.assigned_to(), Some(courier));

        let ResponseOutcome::Applied(accepted) = h.engine.accept("order-1", courier).await.unwrap()
        else {
            panic!("expected accept to apply");
        };
        assert_eq!(accepted.status(), AssignmentStatus::Accepted);
    }

    #[tokio::test]
    async fn partner_history_lists_each_offer_outcome() {
        let h = Harness::new(3, Duration::seconds(60));
        let first = h.courier_north(1.0);
        let second = h.courier_north(2.0);

        h.engine.create_and_assign(order("order-1")).await.unwrap();
        h.engine.reject("order-1", first, None).await.unwrap();
        h.engine.accept("order-1", second).await.unwrap();

        let first_view = h.engine.partner_assignments(first).await.unwrap();
        assert_eq!(first_view.len(), 1);
        assert_eq!(first_view[0].offer_outcome, OfferOutcome::Rejected);
        assert_eq!(first_view[0].assignment_status, AssignmentStatus::Accepted);

        let second_view = h.engine.partner_assignments(second).await.unwrap();
        assert_eq!(second_view[0].offer_outcome, OfferOutcome::Accepted);
        assert_eq!(second_view[0].attempt, 2);
    }

    #[tokio::test]
    async fn excluded_couriers_are_never_reoffered() {
        let h = Harness::new(5, Duration::seconds(60));
        let couriers = [
            h.courier_north(0.5),
            h.courier_north(1.0),
            h.courier_north(1.5),
        ];
        h.engine.create_and_assign(order("order-1")).await.unwrap();

        let mut seen_excluded = 0;
        loop {
            let record = h.engine.get("order-1").await.unwrap().unwrap();
            assert!(record.excluded_candidates().len() >= seen_excluded);
            seen_excluded = record.excluded_candidates().len();
            assert!(record.current_attempt() <= record.max_assignment_attempts());

            let Some(holder) = record.assigned_to() else {
                assert_eq!(record.status(), AssignmentStatus::RejectedByAll);
                break;
            };
            assert!(!record.excluded_candidates().contains(&holder));
            h.engine.reject("order-1", holder, None).await.unwrap();
        }

        let record = h.engine.get("order-1").await.unwrap().unwrap();
        assert_eq!(record.current_attempt(), 3);
        for courier in couriers {
            assert!(record.excluded_candidates().contains(&courier));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_accept_and_reject_accept_at_most_once() {
        for round in 0..20 {
            let h = Harness::new(3, Duration::seconds(60));
            let holder = h.courier_north(1.0);
            h.courier_north(2.0);
            let order_id = format!("order-{round}");
            h.engine.create_and_assign(order(&order_id)).await.unwrap();

            let mut handles = Vec::new();
            for i in 0..8 {
                let engine = h.engine.clone();
                let order_id = order_id.clone();
                handles.push(tokio::spawn(async move {
                    if i % 2 == 0 {
                        engine.accept(&order_id, holder).await.unwrap()
                    } else {
                        engine.reject(&order_id, holder, None).await.unwrap()
                    }
                }));
            }

            let mut applied = 0;
            for handle in handles {
                if let ResponseOutcome::Applied(_) = handle.await.unwrap() {
                    applied += 1;
                }
            }
            assert_eq!(applied, 1, "exactly one response may win");

            let accepted_events = h
                .notifier
                .statuses()
                .into_iter()
                .filter(|status| *status == AssignmentStatus::Accepted)
                .count();
            assert!(accepted_events <= 1);
        }
    }

    #[tokio::test]
    async fn directory_outage_on_create_persists_nothing() {
        let directory = Arc::new(FlakyDirectory::default());
        let store = Arc::new(InMemoryAssignmentStore::new());
        let engine = DispatchEngine::new(
            store.clone(),
            GeoIndex::new(directory.clone()),
            Arc::new(RecordingNotifier::default()),
            DispatchPolicy::default(),
            Metrics::new(),
        );
        let courier = directory
            .inner
            .register("courier-1".to_string(), RESTAURANT)
            .id;

        directory.down.store(true, Ordering::SeqCst);
        let err = engine.create_and_assign(order("order-1")).await.unwrap_err();
        assert!(matches!(err, DispatchError::Directory(_)));
        assert!(engine.get("order-1").await.unwrap().is_none());
        assert!(store.list_pending().await.unwrap().is_empty());

        directory.down.store(false, Ordering::SeqCst);
        let record = engine.create_and_assign(order("order-1")).await.unwrap();
        assert_eq!(record.status(), AssignmentStatus::Offered);
        assert_eq!(record.assigned_to(), Some(courier));
    }
}
