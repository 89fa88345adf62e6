use std::sync::Arc;

use crate::engine::dispatch::{DispatchEngine, DispatchPolicy};
use crate::engine::notify::BroadcastNotifier;
use crate::geo::GeoIndex;
use crate::geo::directory::InMemoryCourierDirectory;
use crate::observability::metrics::Metrics;
use crate::store::memory::InMemoryAssignmentStore;

pub struct AppState {
    pub couriers: Arc<InMemoryCourierDirectory>,
    pub engine: Arc<DispatchEngine>,
    pub events: Arc<BroadcastNotifier>,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(policy: DispatchPolicy, event_buffer_size: usize) -> Self {
        let couriers = Arc::new(InMemoryCourierDirectory::new());
        let events = Arc::new(BroadcastNotifier::new(event_buffer_size));
        let metrics = Metrics::new();

        let engine = Arc::new(DispatchEngine::new(
            Arc::new(InMemoryAssignmentStore::new()),
            GeoIndex::new(couriers.clone()),
            events.clone(),
            policy,
            metrics.clone(),
        ));

        Self {
            couriers,
            engine,
            events,
            metrics,
        }
    }
}
