use prometheus::{
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub status_transitions_total: IntCounterVec,
    pub respond_outcomes_total: IntCounterVec,
    pub stale_samples_discarded_total: IntCounter,
    pub route_recomputes_total: IntCounterVec,
    pub route_recompute_latency_seconds: HistogramVec,
    pub settlements_total: IntCounterVec,
    pub chat_messages_total: IntCounter,
    pub active_subscriptions: IntGauge,
    pub bus_publish_retries_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let status_transitions_total = IntCounterVec::new(
            Opts::new("status_transitions_total", "Order status transitions by new status"),
            &["status"],
        )
        .expect("valid status_transitions_total metric");

        let respond_outcomes_total = IntCounterVec::new(
            Opts::new("respond_outcomes_total", "Driver responses by outcome"),
            &["outcome"],
        )
        .expect("valid respond_outcomes_total metric");

        let stale_samples_discarded_total = IntCounter::new(
            "stale_samples_discarded_total",
            "Location samples discarded by the monotonic-time rule",
        )
        .expect("valid stale_samples_discarded_total metric");

        let route_recomputes_total = IntCounterVec::new(
            Opts::new("route_recomputes_total", "Route recomputations by outcome"),
            &["outcome"],
        )
        .expect("valid route_recomputes_total metric");

        let route_recompute_latency_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "route_recompute_latency_seconds",
                "Latency of routing-service calls in seconds",
            ),
            &["outcome"],
        )
        .expect("valid route_recompute_latency_seconds metric");

        let settlements_total = IntCounterVec::new(
            Opts::new("settlements_total", "Completion settlements by outcome"),
            &["outcome"],
        )
        .expect("valid settlements_total metric");

        let chat_messages_total = IntCounter::new(
            "chat_messages_total",
            "Chat messages persisted and published",
        )
        .expect("valid chat_messages_total metric");

        let active_subscriptions = IntGauge::new(
            "active_subscriptions",
            "Currently open topic subscriptions across sessions",
        )
        .expect("valid active_subscriptions metric");

        let bus_publish_retries_total = IntCounter::new(
            "bus_publish_retries_total",
            "Publish attempts retried after a channel failure",
        )
        .expect("valid bus_publish_retries_total metric");

        registry
            .register(Box::new(status_transitions_total.clone()))
            .expect("register status_transitions_total");
        registry
            .register(Box::new(respond_outcomes_total.clone()))
            .expect("register respond_outcomes_total");
        registry
            .register(Box::new(stale_samples_discarded_total.clone()))
            .expect("register stale_samples_discarded_total");
        registry
            .register(Box::new(route_recomputes_total.clone()))
            .expect("register route_recomputes_total");
        registry
            .register(Box::new(route_recompute_latency_seconds.clone()))
            .expect("register route_recompute_latency_seconds");
        registry
            .register(Box::new(settlements_total.clone()))
            .expect("register settlements_total");
        registry
            .register(Box::new(chat_messages_total.clone()))
            .expect("register chat_messages_total");
        registry
            .register(Box::new(active_subscriptions.clone()))
            .expect("register active_subscriptions");
        registry
            .register(Box::new(bus_publish_retries_total.clone()))
            .expect("register bus_publish_retries_total");

        Self {
            registry,
            status_transitions_total,
            respond_outcomes_total,
            stale_samples_discarded_total,
            route_recomputes_total,
            route_recompute_latency_seconds,
            settlements_total,
            chat_messages_total,
            active_subscriptions,
            bus_publish_retries_total,
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
