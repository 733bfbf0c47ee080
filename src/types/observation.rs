//! The persisted `Observation` custom resource (spec §3.2, §6.1).

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::config::Settings;
use crate::types::event::{Event, ResourceRef};

/// Wire shape of `spec.resource` (§3.2) — always fully populated, unlike
/// the internal `Event::resource` which is optional.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
pub struct ObservationResource {
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

impl From<ResourceRef> for ObservationResource {
    fn from(r: ResourceRef) -> Self {
        Self {
            kind: r.kind,
            name: r.name,
            namespace: r.namespace,
        }
    }
}

/// `Observation` CRD: group `zen.kube-zen.io`, version `v1`, plural
/// `observations`, namespaced (§6.1).
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    kind = "Observation",
    group = "zen.kube-zen.io",
    version = "v1",
    namespaced,
    plural = "observations"
)]
pub struct ObservationSpec {
    pub source: String,
    pub category: String,
    pub severity: String,
    pub event_type: String,
    /// RFC3339.
    pub detected_at: DateTime<Utc>,
    pub resource: ObservationResource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    pub message: String,
    pub details: BTreeMap<String, Value>,
    pub ttl_seconds_after_creation: i64,
}

/// Builds the unstructured-shaped Observation for an already filtered,
/// deduped, normalized Event (§4.6 step 4).
pub fn build_spec(event: &Event, settings: &Settings) -> ObservationSpec {
    let ttl = event_ttl_seconds(event, settings);
    ObservationSpec {
        source: event.source.clone(),
        category: event.category.as_str().to_string(),
        severity: event.severity.as_str().to_string(),
        event_type: event.event_type.clone(),
        detected_at: event.detected_at,
        resource: event
            .resource
            .clone()
            .map(ObservationResource::from)
            .unwrap_or_default(),
        rule: event.rule.clone(),
        message: event.message.clone(),
        details: event.details.clone(),
        ttl_seconds_after_creation: ttl,
    }
}

/// Clamps a requested TTL into `[MIN_TTL, MAX_TTL]` (§4.6 step 4, §8).
fn event_ttl_seconds(_event: &Event, settings: &Settings) -> i64 {
    clamp_ttl(settings.ttl_default_secs, settings)
}

pub fn clamp_ttl(ttl_secs: i64, settings: &Settings) -> i64 {
    ttl_secs.clamp(settings.ttl_min_secs, settings.ttl_max_secs)
}

/// `metadata.generateName`/`namespace`/`labels` for a new Observation,
/// applied by the pipeline at create time.
pub fn generate_name_prefix(source: &str) -> String {
    format!("{source}-")
}

pub fn target_namespace(event: &Event, settings: &Settings) -> String {
    event
        .resource
        .as_ref()
        .map(|r| r.namespace.clone())
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(|| settings.default_namespace.clone())
}

pub fn labels(event: &Event) -> BTreeMap<String, String> {
    let mut m = BTreeMap::new();
    m.insert("source".to_string(), event.source.clone());
    m.insert("category".to_string(), event.category.as_str().to_string());
    m.insert("severity".to_string(), event.severity.as_str().to_string());
    m
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::event::{Category, DedupHint, Severity};

    fn settings() -> Settings {
        let mut s = Settings::from_env();
        s.ttl_min_secs = 60;
        s.ttl_max_secs = 365 * 24 * 3600;
        s.default_namespace = "zen-watcher".into();
        s
    }

    fn sample_event() -> Event {
        Event {
            source: "trivy".into(),
            category: Category::Security,
            severity: Severity::High,
            event_type: "vulnerability".into(),
            detected_at: Utc::now(),
            resource: Some(ResourceRef {
                kind: "Pod".into(),
                name: "api-7".into(),
                namespace: "prod".into(),
                uid: None,
            }),
            rule: None,
            message: "CVE found".into(),
            details: BTreeMap::new(),
            dedup_hint: None::<DedupHint>,
        }
    }

    #[test]
    fn ttl_clamps_below_min() {
        let s = settings();
        assert_eq!(clamp_ttl(10, &s), 60);
    }

    #[test]
    fn ttl_clamps_above_max() {
        let s = settings();
        assert_eq!(clamp_ttl(1_000_000_000, &s), s.ttl_max_secs);
    }

    #[test]
    fn target_namespace_falls_back_to_default() {
        let s = settings();
        let mut e = sample_event();
        e.resource.as_mut().unwrap().namespace = "".into();
        assert_eq!(target_namespace(&e, &s), "zen-watcher");
    }

    #[test]
    fn target_namespace_prefers_resource() {
        let s = settings();
        let e = sample_event();
        assert_eq!(target_namespace(&e, &s), "prod");
    }

    #[test]
    fn labels_include_required_set() {
        let e = sample_event();
        let l = labels(&e);
        assert_eq!(l.get("source").unwrap(), "trivy");
        assert_eq!(l.get("category").unwrap(), "security");
        assert_eq!(l.get("severity").unwrap(), "HIGH");
    }
}
