use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::Once;
use std::time::Instant;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Task outcomes
    pub static ref TASKS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("inspection_tasks_total", "Images processed, by outcome"),
        &["outcome"]
    ).unwrap();

    pub static ref TASK_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("inspection_task_errors_total", "Per-image failures, by error kind"),
        &["kind"]
    ).unwrap();

    // Endpoint traffic
    pub static ref INFERENCE_ATTEMPTS: IntCounter = IntCounter::new(
        "inference_attempts_total",
        "Total number of requests sent to the inference endpoint"
    ).unwrap();

    pub static ref INFERENCE_RETRIES: IntCounter = IntCounter::new(
        "inference_retries_total",
        "Requests that were retries of an earlier failed attempt"
    ).unwrap();

    pub static ref INFERENCE_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "inference_duration_seconds",
            "Time per image spent in the inference client, retries included"
        )
        .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0])
    ).unwrap();

    // Validation
    pub static ref DETECTIONS_ACCEPTED: IntCounter = IntCounter::new(
        "detections_accepted_total",
        "Detections that passed validation"
    ).unwrap();

    pub static ref DETECTIONS_DROPPED: IntCounterVec = IntCounterVec::new(
        Opts::new("detections_dropped_total", "Detections rejected by the validator, by reason"),
        &["reason"]
    ).unwrap();
}

static INIT: Once = Once::new();

/// Initialize metrics registry. Safe to call more than once.
pub fn init_metrics() {
    INIT.call_once(|| {
        REGISTRY.register(Box::new(TASKS_TOTAL.clone())).unwrap();
        REGISTRY.register(Box::new(TASK_ERRORS.clone())).unwrap();

        REGISTRY.register(Box::new(INFERENCE_ATTEMPTS.clone())).unwrap();
        REGISTRY.register(Box::new(INFERENCE_RETRIES.clone())).unwrap();
        REGISTRY.register(Box::new(INFERENCE_LATENCY.clone())).unwrap();

        REGISTRY.register(Box::new(DETECTIONS_ACCEPTED.clone())).unwrap();
        REGISTRY.register(Box::new(DETECTIONS_DROPPED.clone())).unwrap();

        tracing::debug!("Metrics registry initialized with {} collectors", REGISTRY.gather().len());
    });
}

/// Helper struct for timing operations
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn observe_duration_seconds(&self, histogram: &Histogram) {
        let duration = self.start.elapsed();
        histogram.observe(duration.as_secs_f64());
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

/// Export metrics in Prometheus text format
pub fn export_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
