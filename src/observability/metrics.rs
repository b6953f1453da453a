use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub order_transitions_total: IntCounterVec,
    pub dispatch_total: IntCounterVec,
    pub dispatch_latency_seconds: HistogramVec,
    pub couriers_busy: IntGauge,
    pub otp_issued_total: IntCounterVec,
    pub otp_verifications_total: IntCounterVec,
    pub notifications_failed_total: IntCounter,
    pub outbox_depth: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let order_transitions_total = IntCounterVec::new(
            Opts::new("order_transitions_total", "Order transitions by resulting status"),
            &["status"],
        )
        .expect("valid order_transitions_total metric");

        let dispatch_total = IntCounterVec::new(
            Opts::new("dispatch_total", "Courier dispatch attempts by outcome"),
            &["outcome"],
        )
        .expect("valid dispatch_total metric");

        let dispatch_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "dispatch_latency_seconds",
                "Latency of courier dispatch in seconds",
            ),
            &["outcome"],
        )
        .expect("valid dispatch_latency_seconds metric");

        let couriers_busy = IntGauge::new("couriers_busy", "Couriers holding an active assignment")
            .expect("valid couriers_busy metric");

        let otp_issued_total = IntCounterVec::new(
            Opts::new("otp_issued_total", "OTP codes issued by delivery channel"),
            &["channel"],
        )
        .expect("valid otp_issued_total metric");

        let otp_verifications_total = IntCounterVec::new(
            Opts::new("otp_verifications_total", "OTP verification attempts by outcome"),
            &["outcome"],
        )
        .expect("valid otp_verifications_total metric");

        let notifications_failed_total = IntCounter::new(
            "notifications_failed_total",
            "Notifications the notifier could not deliver",
        )
        .expect("valid notifications_failed_total metric");

        let outbox_depth = IntGauge::new("outbox_depth", "Notifications waiting for delivery")
            .expect("valid outbox_depth metric");

        registry
            .register(Box::new(order_transitions_total.clone()))
            .expect("register order_transitions_total");
        registry
            .register(Box::new(dispatch_total.clone()))
            .expect("register dispatch_total");
        registry
            .register(Box::new(dispatch_latency_seconds.clone()))
            .expect("register dispatch_latency_seconds");
        registry
            .register(Box::new(couriers_busy.clone()))
            .expect("register couriers_busy");
        registry
            .register(Box::new(otp_issued_total.clone()))
            .expect("register otp_issued_total");
        registry
            .register(Box::new(otp_verifications_total.clone()))
            .expect("register otp_verifications_total");
        registry
            .register(Box::new(notifications_failed_total.clone()))
            .expect("register notifications_failed_total");
        registry
            .register(Box::new(outbox_depth.clone()))
            .expect("register outbox_depth");

        Self {
            registry,
            order_transitions_total,
            dispatch_total,
            dispatch_latency_seconds,
            couriers_busy,
            otp_issued_total,
            otp_verifications_total,
            notifications_failed_total,
            outbox_depth,
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
