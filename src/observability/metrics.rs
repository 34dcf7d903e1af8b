use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub sessions_active: IntGauge,
    pub position_ticks_total: IntCounterVec,
    pub realtime_positions_total: IntCounter,
    pub phase_transitions_total: IntCounterVec,
    pub side_effect_failures_total: IntCounterVec,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let sessions_active =
            IntGauge::new("tracking_sessions_active", "Currently running tracking sessions")
                .expect("valid tracking_sessions_active metric");

        let position_ticks_total = IntCounterVec::new(
            Opts::new(
                "position_ticks_total",
                "Reconciler ticks by the source that owned the position",
            ),
            &["source"],
        )
        .expect("valid position_ticks_total metric");

        let realtime_positions_total = IntCounter::new(
            "realtime_positions_total",
            "Authoritative drone positions received over the realtime bus",
        )
        .expect("valid realtime_positions_total metric");

        let phase_transitions_total = IntCounterVec::new(
            Opts::new("phase_transitions_total", "Delivery phase transitions by target phase"),
            &["phase"],
        )
        .expect("valid phase_transitions_total metric");

        let side_effect_failures_total = IntCounterVec::new(
            Opts::new(
                "side_effect_failures_total",
                "Best-effort backend writes that failed",
            ),
            &["operation"],
        )
        .expect("valid side_effect_failures_total metric");

        registry
            .register(Box::new(sessions_active.clone()))
            .expect("register tracking_sessions_active");
        registry
            .register(Box::new(position_ticks_total.clone()))
            .expect("register position_ticks_total");
        registry
            .register(Box::new(realtime_positions_total.clone()))
            .expect("register realtime_positions_total");
        registry
            .register(Box::new(phase_transitions_total.clone()))
            .expect("register phase_transitions_total");
        registry
            .register(Box::new(side_effect_failures_total.clone()))
            .expect("register side_effect_failures_total");

        Self {
            registry,
            sessions_active,
            position_ticks_total,
            realtime_positions_total,
            phase_transitions_total,
            side_effect_failures_total,
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
