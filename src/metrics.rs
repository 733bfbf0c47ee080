//! Observability sink (§6.6). Thread-safe by contract; the pipeline treats
//! it as opaque atomic counters, wrapping `prometheus` registrations behind
//! plain methods.

use prometheus::{
    register_gauge, register_gauge_vec, register_histogram_vec, register_int_counter,
    register_int_counter_vec, Encoder, Gauge, GaugeVec, HistogramVec, IntCounter, IntCounterVec, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    pub observations_created_total: IntCounterVec,
    pub events_filtered_total: IntCounterVec,
    pub events_deduplicated_total: IntCounterVec,
    pub observation_creation_failures_total: IntCounterVec,
    pub filter_reload_success_total: IntCounter,
    pub filter_reload_failures_total: IntCounter,
    pub gc_observations_deleted_total: IntCounter,
    pub gc_sweep_failures_total: IntCounter,
    pub adapter_restarts_total: IntCounterVec,
    pub rate_limit_drops_total: IntCounterVec,

    pub dedup_cache_size: Gauge,
    pub adapter_last_event_age_seconds: GaugeVec,
    pub aggregation_windows_open: Gauge,

    pub observation_creation_duration_seconds: HistogramVec,
    pub gc_sweep_duration_seconds: HistogramVec,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            observations_created_total: register_int_counter_vec!(
                "observations_created_total",
                "Observations created by the pipeline",
                &["source", "category", "severity"]
            )
            .unwrap(),
            events_filtered_total: register_int_counter_vec!(
                "events_filtered_total",
                "Events rejected by the Filter Engine",
                &["source", "reason"]
            )
            .unwrap(),
            events_deduplicated_total: register_int_counter_vec!(
                "events_deduplicated_total",
                "Events suppressed by the Deduper",
                &["source", "reason"]
            )
            .unwrap(),
            observation_creation_failures_total: register_int_counter_vec!(
                "observation_creation_failures_total",
                "Observation create calls that failed after retries",
                &["source", "error_class"]
            )
            .unwrap(),
            filter_reload_success_total: register_int_counter!(
                "filter_reload_success_total",
                "Successful filter ConfigMap reloads"
            )
            .unwrap(),
            filter_reload_failures_total: register_int_counter!(
                "filter_reload_failures_total",
                "Failed filter ConfigMap reloads"
            )
            .unwrap(),
            gc_observations_deleted_total: register_int_counter!(
                "gc_observations_deleted_total",
                "Observations deleted by the GC collector"
            )
            .unwrap(),
            gc_sweep_failures_total: register_int_counter!(
                "gc_sweep_failures_total",
                "GC delete calls that failed and were skipped for the sweep"
            )
            .unwrap(),
            adapter_restarts_total: register_int_counter_vec!(
                "adapter_restarts_total",
                "Adapter restarts after a transient failure",
                &["source"]
            )
            .unwrap(),
            rate_limit_drops_total: register_int_counter_vec!(
                "rate_limit_drops_total",
                "Webhook requests dropped by ingress-level rate limiting",
                &["source"]
            )
            .unwrap(),
            dedup_cache_size: register_gauge!("dedup_cache_size", "Current size of the dedup key-window cache").unwrap(),
            adapter_last_event_age_seconds: register_gauge_vec!(
                "adapter_last_event_age_seconds",
                "Seconds since an adapter last produced an event",
                &["source"]
            )
            .unwrap(),
            aggregation_windows_open: register_gauge!(
                "aggregation_windows_open",
                "Number of open rolling-aggregation windows"
            )
            .unwrap(),
            observation_creation_duration_seconds: register_histogram_vec!(
                "observation_creation_duration_seconds",
                "Latency of Observation create calls",
                &["source"],
                vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
            )
            .unwrap(),
            gc_sweep_duration_seconds: register_histogram_vec!(
                "gc_sweep_duration_seconds",
                "Duration of a full GC sweep",
                &[],
                vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 120.0, 300.0]
            )
            .unwrap(),
        }
    }

    /// Renders the default registry in the Prometheus text exposition
    /// format, as served on `/metrics`.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let families = prometheus::gather();
        encoder.encode(&families, &mut buffer).expect("prometheus text encode");
        buffer
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
