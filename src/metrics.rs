use prometheus::{Encoder, Histogram, IntCounter, IntGauge, Registry, TextEncoder};

pub struct Metrics {
    registry: Registry,

    // Session metrics
    pub sessions_total: IntCounter,
    pub api_sessions_total: IntCounter,

    // Relay metrics
    pub relay_dispatched_total: IntCounter,
    pub relay_failed_total: IntCounter,
    pub relay_in_flight: IntGauge,
    pub relay_duration: Histogram,

    // Routing metrics
    pub gateway_overrides_total: IntCounter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let sessions_total = IntCounter::new(
            "session_tap_sessions_total",
            "Total number of completed sessions delivered",
        )
        .expect("metric creation failed");
        let api_sessions_total = IntCounter::new(
            "session_tap_api_sessions_total",
            "Total number of sessions that passed the API filter",
        )
        .expect("metric creation failed");

        let relay_dispatched_total = IntCounter::new(
            "session_tap_relay_dispatched_total",
            "Total number of uploads dispatched to the stats collector",
        )
        .expect("metric creation failed");
        let relay_failed_total = IntCounter::new(
            "session_tap_relay_failed_total",
            "Total number of failed stats uploads",
        )
        .expect("metric creation failed");
        let relay_in_flight = IntGauge::new(
            "session_tap_relay_in_flight",
            "Number of stats uploads currently in flight",
        )
        .expect("metric creation failed");
        let relay_duration = Histogram::with_opts(prometheus::HistogramOpts::new(
            "session_tap_relay_duration_seconds",
            "Stats upload duration in seconds",
        ))
        .expect("metric creation failed");

        let gateway_overrides_total = IntCounter::new(
            "session_tap_gateway_overrides_total",
            "Total number of requests routed through the upstream gateway",
        )
        .expect("metric creation failed");

        for collector in [
            Box::new(sessions_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(api_sessions_total.clone()),
            Box::new(relay_dispatched_total.clone()),
            Box::new(relay_failed_total.clone()),
            Box::new(relay_in_flight.clone()),
            Box::new(relay_duration.clone()),
            Box::new(gateway_overrides_total.clone()),
        ] {
            registry
                .register(collector)
                .expect("metric registration failed");
        }

        Self {
            registry,
            sessions_total,
            api_sessions_total,
            relay_dispatched_total,
            relay_failed_total,
            relay_in_flight,
            relay_duration,
            gateway_overrides_total,
        }
    }

    pub fn record_session(&self) {
        self.sessions_total.inc();
    }

    pub fn record_api_session(&self) {
        self.api_sessions_total.inc();
    }

    pub fn record_relay_dispatch(&self) {
        self.relay_dispatched_total.inc();
        self.relay_in_flight.inc();
    }

    pub fn record_relay_outcome(&self, duration: std::time::Duration, success: bool) {
        self.relay_in_flight.dec();
        self.relay_duration.observe(duration.as_secs_f64());
        if !success {
            self.relay_failed_total.inc();
        }
    }

    pub fn record_gateway_override(&self) {
        self.gateway_overrides_total.inc();
    }

    pub fn gather_metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Renders all metrics in the prometheus text exposition format.
    pub fn gather_text(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.gather_metrics(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}
