//! Environment-variable configuration surface (§6.5).
//!
//! Read once at startup, the same way `other_examples`'s config-manager
//! adapter builds typed settings from `std::env::var` with fallbacks.

use std::time::Duration;

use crate::filter::ProcessingOrder;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_or_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// Namespace informers/ConfigMap adapter watch; empty means cluster-wide.
    pub watch_namespace: Option<String>,
    /// Default namespace for Observations of cluster-scoped resources.
    pub default_namespace: String,

    pub dedup_window: Duration,
    pub dedup_max_size: usize,
    pub dedup_bucket_size: Duration,
    pub dedup_fingerprint_window: Duration,
    pub dedup_fingerprint_ttl: Duration,
    pub dedup_aggregation_window: Duration,

    pub max_rate_per_source: f64,
    pub max_rate_burst: f64,

    pub enable_fingerprint: bool,
    pub enable_rate_limit: bool,
    pub enable_aggregation: bool,

    pub ttl_default_secs: i64,
    pub ttl_min_secs: i64,
    pub ttl_max_secs: i64,

    pub gc_interval: Duration,
    pub gc_sweep_timeout: Duration,
    pub gc_chunk_limit: u32,

    pub processing_order: ProcessingOrder,

    pub http_listen_addr: String,
    pub webhook_body_cap_bytes: usize,
    pub webhook_auth_token: Option<String>,
    pub webhook_ip_allowlist: Vec<String>,
    /// Bounded wait for a slow/full event channel before a webhook POST is
    /// answered 503 (§4.3; default matches the 500ms handler budget used
    /// elsewhere in the adapter layer).
    pub webhook_enqueue_timeout: Duration,
    /// Off by default (§8 scenario 3: ingress-level webhook rate limiting
    /// is not part of the default path). Enable for deployments that want
    /// a second limiter in front of the Deduper's own per-source one.
    pub webhook_rate_limit_enabled: bool,
    pub webhook_rate_limit_per_minute: f64,
    pub webhook_rate_limit_burst: f64,

    pub filter_configmap_namespace: String,
    pub filter_configmap_name: String,
    pub filter_configmap_key: String,

    pub configmap_source_namespace: Option<String>,
    pub configmap_label_selector: String,
    pub configmap_payload_key: String,
    pub configmap_poll_interval: Duration,

    pub creator_worker_count: usize,
    pub event_channel_capacity: usize,

    pub kube_call_timeout: Duration,
    pub adapter_shutdown_budget: Duration,
}

impl Settings {
    pub fn from_env() -> Self {
        let processing_order = match env_or_string("ZEN_PROCESSING_ORDER", "filter_first").as_str() {
            "dedup_first" => ProcessingOrder::DedupFirst,
            _ => ProcessingOrder::FilterFirst,
        };

        Self {
            watch_namespace: std::env::var("ZEN_WATCH_NAMESPACE").ok().filter(|s| !s.is_empty()),
            default_namespace: env_or_string("ZEN_DEFAULT_NAMESPACE", "zen-watcher"),

            dedup_window: Duration::from_secs(env_or("ZEN_DEDUP_WINDOW_SECS", 60)),
            dedup_max_size: env_or("ZEN_DEDUP_MAX_SIZE", 10_000),
            dedup_bucket_size: Duration::from_secs(env_or("ZEN_DEDUP_BUCKET_SECS", 10)),
            dedup_fingerprint_window: Duration::from_secs(env_or("ZEN_DEDUP_FINGERPRINT_WINDOW_SECS", 60)),
            dedup_fingerprint_ttl: Duration::from_secs(env_or("ZEN_DEDUP_FINGERPRINT_TTL_SECS", 300)),
            dedup_aggregation_window: Duration::from_secs(env_or("ZEN_DEDUP_AGGREGATION_WINDOW_SECS", 300)),

            max_rate_per_source: env_or("ZEN_MAX_RATE_PER_SOURCE", 100.0),
            max_rate_burst: env_or("ZEN_MAX_RATE_BURST", 200.0),

            enable_fingerprint: env_or("ZEN_ENABLE_FINGERPRINT", true),
            enable_rate_limit: env_or("ZEN_ENABLE_RATE_LIMIT", true),
            enable_aggregation: env_or("ZEN_ENABLE_AGGREGATION", false),

            ttl_default_secs: env_or("ZEN_TTL_DEFAULT_SECS", 7 * 24 * 3600),
            ttl_min_secs: env_or("ZEN_TTL_MIN_SECS", 60),
            ttl_max_secs: env_or("ZEN_TTL_MAX_SECS", 365 * 24 * 3600),

            gc_interval: Duration::from_secs(env_or("ZEN_GC_INTERVAL_SECS", 3600)),
            gc_sweep_timeout: Duration::from_secs(env_or("ZEN_GC_SWEEP_TIMEOUT_SECS", 300)),
            gc_chunk_limit: env_or("ZEN_GC_CHUNK_LIMIT", 500),

            processing_order,

            http_listen_addr: env_or_string("ZEN_HTTP_LISTEN_ADDR", "0.0.0.0:8080"),
            webhook_body_cap_bytes: env_or("ZEN_WEBHOOK_BODY_CAP_BYTES", 1024 * 1024),
            webhook_auth_token: std::env::var("ZEN_WEBHOOK_AUTH_TOKEN").ok().filter(|s| !s.is_empty()),
            webhook_ip_allowlist: std::env::var("ZEN_WEBHOOK_IP_ALLOWLIST")
                .ok()
                .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
                .unwrap_or_default(),
            webhook_enqueue_timeout: Duration::from_millis(env_or("ZEN_WEBHOOK_ENQUEUE_TIMEOUT_MS", 500)),
            webhook_rate_limit_enabled: env_or("ZEN_WEBHOOK_RATE_LIMIT_ENABLED", false),
            webhook_rate_limit_per_minute: env_or("ZEN_WEBHOOK_RATE_LIMIT_PER_MINUTE", 600.0),
            webhook_rate_limit_burst: env_or("ZEN_WEBHOOK_RATE_LIMIT_BURST", 100.0),

            filter_configmap_namespace: env_or_string("ZEN_FILTER_CONFIGMAP_NAMESPACE", "zen-watcher"),
            filter_configmap_name: env_or_string("ZEN_FILTER_CONFIGMAP_NAME", "zen-watcher-filter"),
            filter_configmap_key: env_or_string("ZEN_FILTER_CONFIGMAP_KEY", "filter.json"),

            configmap_source_namespace: std::env::var("ZEN_CONFIGMAP_SOURCE_NAMESPACE").ok().filter(|s| !s.is_empty()),
            configmap_label_selector: env_or_string("ZEN_CONFIGMAP_LABEL_SELECTOR", "zen.kube-zen.io/findings=true"),
            configmap_payload_key: env_or_string("ZEN_CONFIGMAP_PAYLOAD_KEY", "findings.json"),
            configmap_poll_interval: Duration::from_secs(env_or("ZEN_CONFIGMAP_POLL_INTERVAL_SECS", 300)),

            creator_worker_count: env_or("ZEN_CREATOR_WORKERS", 1),
            event_channel_capacity: env_or("ZEN_EVENT_CHANNEL_CAPACITY", 1024),

            kube_call_timeout: Duration::from_secs(env_or("ZEN_KUBE_CALL_TIMEOUT_SECS", 30)),
            adapter_shutdown_budget: Duration::from_secs(env_or("ZEN_SHUTDOWN_BUDGET_SECS", 15)),
        }
    }
}

pub const MIN_TTL_SECS_FLOOR: i64 = 60;
pub const MAX_TTL_SECS_CEIL: i64 = 365 * 24 * 3600;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        // SAFETY: single-threaded test, no concurrent env mutation.
        for k in [
            "ZEN_PROCESSING_ORDER",
            "ZEN_DEDUP_WINDOW_SECS",
            "ZEN_TTL_MIN_SECS",
        ] {
            std::env::remove_var(k);
        }
        let s = Settings::from_env();
        assert_eq!(s.processing_order, ProcessingOrder::FilterFirst);
        assert_eq!(s.dedup_window, Duration::from_secs(60));
        assert_eq!(s.ttl_min_secs, MIN_TTL_SECS_FLOOR);
    }
}
