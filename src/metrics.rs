use std::time::Duration;

use prometheus::{Histogram, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

/// The counters and summaries named in the observability section of the
/// spec. Wiring this registry up to an HTTP scrape endpoint is out of
/// scope for the core; callers that want one register `Metrics::registry`
/// with whatever exporter they already run.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    submit_total: IntCounterVec,
    checkout_timing: Histogram,
    task_timing: HistogramVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let submit_total = IntCounterVec::new(
            Opts::new("tasks_submit_total", "tasks submitted, by handler name"),
            &["name"],
        )
        .expect("tasks_submit_total");
        registry
            .register(Box::new(submit_total.clone()))
            .expect("register tasks_submit_total");

        let checkout_timing = Histogram::with_opts(HistogramOpts::new(
            "tasks_checkout_timing",
            "seconds between a task becoming eligible and run_task entry",
        ))
        .expect("tasks_checkout_timing");
        registry
            .register(Box::new(checkout_timing.clone()))
            .expect("register tasks_checkout_timing");

        let task_timing = HistogramVec::new(
            HistogramOpts::new("tasks_timing", "handler wall-clock duration in seconds, by handler name"),
            &["name"],
        )
        .expect("tasks_timing");
        registry
            .register(Box::new(task_timing.clone()))
            .expect("register tasks_timing");

        Self {
            registry,
            submit_total,
            checkout_timing,
            task_timing,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_submit(&self, name: &str) {
        self.submit_total.with_label_values(&[name]).inc();
    }

    pub fn record_checkout(&self, lateness: Duration) {
        self.checkout_timing.observe(lateness.as_secs_f64());
    }

    pub fn record_handler_duration(&self, name: &str, duration: Duration) {
        self.task_timing
            .with_label_values(&[name])
            .observe(duration.as_secs_f64());
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
