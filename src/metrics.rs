//! Prometheus counters for idling/unidling activity.
//!
//! The registry is created once at startup and handed to the idler, unidler
//! and HTTP handler as an injected sink; core code only increments.

use anyhow::Result;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

pub struct Metrics {
    registry: Registry,
    pub request_count: IntCounterVec,
    pub request_duration: HistogramVec,
    pub allowed_requests: IntCounter,
    pub verification_requests: IntCounter,
    pub verification_required: IntCounter,
    pub blocked_requests: IntCounter,
    pub no_namespace_requests: IntCounter,
    pub unidle_events: IntCounter,
    pub idle_events: IntCounter,
    pub cli_idle_events: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let request_count = IntCounterVec::new(
            Opts::new("snooze_request_count_total", "Counter of HTTP requests handled."),
            &["proto"],
        )?;
        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "snooze_request_duration_seconds",
                "Histogram of the time each request took.",
            ),
            &["proto"],
        )?;
        let allowed_requests = IntCounter::new(
            "snooze_allowed_requests",
            "The total number of unidle requests that were allowed",
        )?;
        let verification_requests = IntCounter::new(
            "snooze_verification_requests",
            "The total number of verification requests received",
        )?;
        let verification_required = IntCounter::new(
            "snooze_verification_required_requests",
            "The total number of requests that still required verification",
        )?;
        let blocked_requests = IntCounter::new(
            "snooze_blocked_by_block_list",
            "The total number of requests denied by an allow or block list rule",
        )?;
        let no_namespace_requests = IntCounter::new(
            "snooze_no_namespace",
            "The total number of requests received without a resolvable namespace",
        )?;
        let unidle_events =
            IntCounter::new("snooze_unidling_events", "The total number of unidle operations run")?;
        let idle_events = IntCounter::new(
            "snooze_idling_events",
            "The total number of interactive idling events processed",
        )?;
        let cli_idle_events = IntCounter::new(
            "snooze_cli_idling_events",
            "The total number of cli idling events processed",
        )?;

        registry.register(Box::new(request_count.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;
        registry.register(Box::new(allowed_requests.clone()))?;
        registry.register(Box::new(verification_requests.clone()))?;
        registry.register(Box::new(verification_required.clone()))?;
        registry.register(Box::new(blocked_requests.clone()))?;
        registry.register(Box::new(no_namespace_requests.clone()))?;
        registry.register(Box::new(unidle_events.clone()))?;
        registry.register(Box::new(idle_events.clone()))?;
        registry.register(Box::new(cli_idle_events.clone()))?;

        Ok(Metrics {
            registry,
            request_count,
            request_duration,
            allowed_requests,
            verification_requests,
            verification_required,
            blocked_requests,
            no_namespace_requests,
            unidle_events,
            idle_events,
            cli_idle_events,
        })
    }

    /// Renders the registry in the Prometheus text exposition format.
    pub fn gather(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            log::warn!("unable to encode metrics: {}", e);
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
