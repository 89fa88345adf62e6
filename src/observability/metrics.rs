use prometheus::{
    Encoder, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

use crate::models::assignment::AssignmentStatus;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub transitions_total: IntCounterVec,
    pub stale_responses_total: IntCounterVec,
    pub active_offers: IntGauge,
    pub dispatch_latency_seconds: HistogramVec,
    pub sweep_runs_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let transitions_total = IntCounterVec::new(
            Opts::new(
                "assignment_transitions_total",
                "Committed assignment transitions by resulting status",
            ),
            &["status"],
        )
        .expect("valid assignment_transitions_total metric");

        let stale_responses_total = IntCounterVec::new(
            Opts::new(
                "stale_responses_total",
                "Courier or sweep responses that lost the compare-and-swap",
            ),
            &["action"],
        )
        .expect("valid stale_responses_total metric");

        let active_offers = IntGauge::new("active_offers", "Offers currently awaiting a response")
            .expect("valid active_offers metric");

        let dispatch_latency_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "dispatch_latency_seconds",
                "Latency of create-and-assign in seconds",
            ),
            &["outcome"],
        )
        .expect("valid dispatch_latency_seconds metric");

        let sweep_runs_total = IntCounterVec::new(
            Opts::new("sweep_runs_total", "Timeout sweeps by outcome"),
            &["outcome"],
        )
        .expect("valid sweep_runs_total metric");

        registry
            .register(Box::new(transitions_total.clone()))
            .expect("register assignment_transitions_total");
        registry
            .register(Box::new(stale_responses_total.clone()))
            .expect("register stale_responses_total");
        registry
            .register(Box::new(active_offers.clone()))
            .expect("register active_offers");
        registry
            .register(Box::new(dispatch_latency_seconds.clone()))
            .expect("register dispatch_latency_seconds");
        registry
            .register(Box::new(sweep_runs_total.clone()))
            .expect("register sweep_runs_total");

        Self {
            registry,
            transitions_total,
            stale_responses_total,
            active_offers,
            dispatch_latency_seconds,
            sweep_runs_total,
        }
    }

    /// Counts a committed transition out of `from` and keeps the
    /// outstanding-offer gauge in step.
    pub fn observe_transition(&self, from: AssignmentStatus, to: AssignmentStatus) {
        if from == to {
            return;
        }
        self.transitions_total
            .with_label_values(&[to.as_str()])
            .inc();
        if from == AssignmentStatus::Offered {
            self.active_offers.dec();
        }
        if to == AssignmentStatus::Offered {
            self.active_offers.inc();
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
