//! Observation Creator — the only code path that creates Observations
//! (§4.6). Composition: filter → normalize → dedup → build CR → create →
//! metrics/log, with the processing order switch of §4.6.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::api::{ObjectMeta, PostParams};
use kube::{Api, Client};
use tokio::time::sleep;
use tracing::{info, instrument, warn};

use crate::config::Settings;
use crate::dedup::{DedupDecision, Deduper};
use crate::error::ParseErrorGate;
use crate::filter::{FilterEngine, ProcessingOrder};
use crate::metrics::Metrics;
use crate::types::{observation, Event, Observation};

const MAX_CREATE_ATTEMPTS: u32 = 3;
const CREATE_RETRY_BASE: Duration = Duration::from_millis(200);
const API_CONFLICT: u16 = 409;

pub struct Pipeline {
    client: Client,
    filter: Arc<FilterEngine>,
    dedup: Arc<Deduper>,
    metrics: Arc<Metrics>,
    settings: Arc<Settings>,
    pub parse_error_gate: ParseErrorGate,
}

impl Pipeline {
    pub fn new(client: Client, filter: Arc<FilterEngine>, dedup: Arc<Deduper>, metrics: Arc<Metrics>, settings: Arc<Settings>) -> Self {
        Self {
            client,
            filter,
            dedup,
            metrics,
            settings,
            parse_error_gate: ParseErrorGate::new(),
        }
    }

    /// Runs one `Event` through steps 1–6 of §4.6. Idempotent in steps 1–3:
    /// they are pure functions of the event and the current filter/dedup
    /// snapshots (§4.6 "Idempotency"). Step 3 only mutates dedup state
    /// after step 5's create is accepted, by construction: `Deduper::check`
    /// both decides *and* records admission in one critical section, so a
    /// crash between admission and create simply re-emits on redelivery.
    #[instrument(skip(self, event), fields(source = %event.source))]
    pub async fn process(&self, mut event: Event) {
        if let Err(e) = event.validate() {
            if self.parse_error_gate.should_log(&event.source) {
                warn!(error = %e, "dropping event that failed validation");
            }
            return;
        }

        match self.filter.processing_order() {
            ProcessingOrder::FilterFirst => {
                if !self.apply_filter(&event) {
                    return;
                }
                event.normalize(&self.settings.default_namespace);
                if !self.apply_dedup(&event) {
                    return;
                }
            }
            ProcessingOrder::DedupFirst => {
                event.normalize(&self.settings.default_namespace);
                if !self.apply_dedup(&event) {
                    return;
                }
                if !self.apply_filter(&event) {
                    return;
                }
            }
        }

        self.create(&event).await;
    }

    /// Entry point for aggregation-reaper summary events (§4.7): they
    /// bypass rate limiting and the key-window/fingerprint checks (they
    /// were already suppressed once) and "re-enter the pipeline at step 4
    /// of §4.6" directly.
    #[instrument(skip(self, event), fields(source = %event.source))]
    pub async fn process_aggregated_summary(&self, mut event: Event) {
        event.normalize(&self.settings.default_namespace);
        self.create(&event).await;
    }

    fn apply_filter(&self, event: &Event) -> bool {
        match self.filter.evaluate(event) {
            Ok(()) => true,
            Err(reason) => {
                self.metrics
                    .events_filtered_total
                    .with_label_values(&[&event.source, reason.as_str()])
                    .inc();
                false
            }
        }
    }

    fn apply_dedup(&self, event: &Event) -> bool {
        match self.dedup.check(event) {
            DedupDecision::Create => {
                self.metrics.dedup_cache_size.set(self.dedup.cache_len() as f64);
                true
            }
            DedupDecision::Suppress(reason) => {
                self.metrics
                    .events_deduplicated_total
                    .with_label_values(&[&event.source, reason.as_str()])
                    .inc();
                false
            }
        }
    }

    async fn create(&self, event: &Event) {
        let namespace = observation::target_namespace(event, &self.settings);
        let api: Api<Observation> = Api::namespaced(self.client.clone(), &namespace);
        let spec = observation::build_spec(event, &self.settings);

        let obj = Observation {
            metadata: ObjectMeta {
                generate_name: Some(observation::generate_name_prefix(&event.source)),
                namespace: Some(namespace.clone()),
                labels: Some(observation::labels(event).into_iter().collect()),
                ..Default::default()
            },
            spec,
        };

        let pp = PostParams::default();
        let start = Instant::now();

        for attempt in 0..MAX_CREATE_ATTEMPTS {
            let outcome = tokio::time::timeout(self.settings.kube_call_timeout, api.create(&pp, &obj)).await;
            match outcome {
                Ok(Ok(created)) => {
                    self.metrics
                        .observations_created_total
                        .with_label_values(&[&event.source, event.category.as_str(), event.severity.as_str()])
                        .inc();
                    self.metrics
                        .observation_creation_duration_seconds
                        .with_label_values(&[&event.source])
                        .observe(start.elapsed().as_secs_f64());
                    info!(
                        source = %event.source,
                        namespace = %namespace,
                        name = %created.metadata.name.unwrap_or_default(),
                        "observation created"
                    );
                    return;
                }
                Ok(Err(kube::Error::Api(ae))) if ae.code == API_CONFLICT => {
                    // Treated as benign per §4.6 step 5: cannot happen with
                    // generateName, but tolerated.
                    return;
                }
                Ok(Err(e)) => {
                    if attempt + 1 >= MAX_CREATE_ATTEMPTS {
                        self.metrics
                            .observation_creation_failures_total
                            .with_label_values(&[&event.source, error_class(&e)])
                            .inc();
                        warn!(error = %e, source = %event.source, "observation create failed after retries");
                        return;
                    }
                    sleep(CREATE_RETRY_BASE * 2u32.pow(attempt)).await;
                }
                Err(_elapsed) => {
                    if attempt + 1 >= MAX_CREATE_ATTEMPTS {
                        self.metrics
                            .observation_creation_failures_total
                            .with_label_values(&[&event.source, "timeout"])
                            .inc();
                        warn!(source = %event.source, "observation create timed out after retries");
                        return;
                    }
                    sleep(CREATE_RETRY_BASE * 2u32.pow(attempt)).await;
                }
            }
        }
    }
}

fn error_class(e: &kube::Error) -> &'static str {
    match e {
        kube::Error::Api(ae) if ae.code == 403 => "forbidden",
        kube::Error::Api(ae) if ae.code == 404 => "not_found",
        kube::Error::Api(ae) if ae.code == 429 => "throttled",
        kube::Error::Api(_) => "api",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::DeduperConfig;
    use crate::filter::FilterConfig;
    use crate::types::{Category, ResourceRef, Severity};
    use std::collections::BTreeMap;

    fn event() -> Event {
        Event {
            source: "trivy".into(),
            category: Category::Security,
            severity: Severity::Low,
            event_type: "vulnerability".into(),
            detected_at: chrono::Utc::now(),
            resource: Some(ResourceRef {
                kind: "Pod".into(),
                name: "api-7".into(),
                namespace: "prod".into(),
                uid: None,
            }),
            rule: None,
            message: "x".into(),
            details: BTreeMap::new(),
            dedup_hint: None,
        }
    }

    #[test]
    fn filter_rejection_is_pure_and_repeatable() {
        let engine = FilterEngine::new(FilterConfig::parse(r#"{"sources": {"trivy": {"minSeverity": "HIGH"}}}"#).unwrap());
        let e = event();
        assert!(engine.evaluate(&e).is_err());
        assert!(engine.evaluate(&e).is_err());
    }

    #[test]
    fn dedup_admits_once_then_suppresses() {
        let dedup = Deduper::new(DeduperConfig {
            window: Duration::from_secs(60),
            max_size: 100,
            bucket_size: Duration::from_secs(10),
            fingerprint_window: Duration::from_secs(60),
            fingerprint_ttl: Duration::from_secs(300),
            aggregation_window: Duration::from_secs(300),
            max_rate_per_source: 1000.0,
            max_rate_burst: 1000.0,
            enable_fingerprint: true,
            enable_rate_limit: true,
            enable_aggregation: false,
        });
        let e = event();
        assert!(matches!(dedup.check(&e), DedupDecision::Create));
        assert!(matches!(dedup.check(&e), DedupDecision::Suppress(_)));
    }
}
