//! Declarative `mapping` shared by the Informer, ConfigMap, and Generic
//! adapters (§4.2, §4.4, §4.5).

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::event::{Category, DedupHint, Event, ResourceRef, Severity};
use crate::types::jsonpath::{get_list, get_path, get_string, value_to_string};

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ResourcePathMapping {
    #[serde(default)]
    pub kind_path: Option<String>,
    #[serde(default)]
    pub name_path: Option<String>,
    #[serde(default)]
    pub namespace_path: Option<String>,
    #[serde(default)]
    pub uid_path: Option<String>,
}

/// `mapping` as described in §4.2. One `EventMapping` is owned by an
/// Informer Adapter, a ConfigMap Adapter's per-CM finding extractor, or a
/// Generic Adapter sourced from an `ObservationMapping` CR.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EventMapping {
    pub source: String,
    pub category: String,
    pub event_type: String,
    #[serde(default)]
    pub severity_path: Option<String>,
    #[serde(default)]
    pub detected_at_path: Option<String>,
    #[serde(default)]
    pub resource_path: Option<ResourcePathMapping>,
    #[serde(default)]
    pub rule_path: Option<String>,
    #[serde(default)]
    pub message_path: Option<String>,
    /// `fieldName -> jsonPath` (§4.2).
    #[serde(default)]
    pub details_paths: BTreeMap<String, String>,
    /// Subset of `details_paths` keys marked `fingerprintable` (§4.7).
    #[serde(default)]
    pub fingerprintable_fields: Vec<String>,
    #[serde(default)]
    pub dedup_key_components: Vec<String>,
    /// For the ConfigMap adapter: JSONPath to the list of raw findings
    /// within one ConfigMap's parsed JSON payload (§4.4).
    #[serde(default)]
    pub findings_path: Option<String>,
}

impl EventMapping {
    /// Extracts one `Event` from an unstructured JSON object using this
    /// mapping. `received_at` is the fallback for `detectedAt` when
    /// `detected_at_path` is absent or unparsable (§3.1: "else receipt
    /// time").
    pub fn extract_event(&self, obj: &Value, received_at: DateTime<Utc>) -> Event {
        let severity = self
            .severity_path
            .as_deref()
            .and_then(|p| get_string(obj, p))
            .map(|s| Severity::normalize(&s))
            .unwrap_or(Severity::Unknown);

        let detected_at = self
            .detected_at_path
            .as_deref()
            .and_then(|p| get_string(obj, p))
            .and_then(|s| parse_timestamp(&s))
            .unwrap_or(received_at);

        let resource = self.resource_path.as_ref().map(|rp| ResourceRef {
            kind: rp
                .kind_path
                .as_deref()
                .and_then(|p| get_string(obj, p))
                .unwrap_or_default(),
            name: rp
                .name_path
                .as_deref()
                .and_then(|p| get_string(obj, p))
                .unwrap_or_default(),
            namespace: rp
                .namespace_path
                .as_deref()
                .and_then(|p| get_string(obj, p))
                .unwrap_or_default(),
            uid: rp.uid_path.as_deref().and_then(|p| get_string(obj, p)),
        });

        let rule = self.rule_path.as_deref().and_then(|p| get_string(obj, p));
        let message = self
            .message_path
            .as_deref()
            .and_then(|p| get_string(obj, p))
            .unwrap_or_default();

        let mut details = BTreeMap::new();
        for (field, path) in &self.details_paths {
            if let Some(v) = get_path(obj, path) {
                details.insert(field.clone(), v.clone());
            }
        }

        let dedup_hint = if self.dedup_key_components.is_empty() {
            None
        } else {
            let parts: Vec<String> = self
                .dedup_key_components
                .iter()
                .map(|p| get_string(obj, p).unwrap_or_default())
                .collect();
            Some(DedupHint {
                key: Some(parts.join("/")),
                fingerprintable_fields: self.fingerprintable_fields.clone(),
            })
        };

        Event {
            source: self.source.clone(),
            category: Category::parse(&self.category),
            severity,
            event_type: self.event_type.clone(),
            detected_at,
            resource,
            rule,
            message,
            details,
            dedup_hint,
        }
    }

    /// For the ConfigMap adapter: splits one CM payload into its raw
    /// findings and maps each to an `Event` (§4.4).
    pub fn extract_events_from_findings(&self, payload: &Value, received_at: DateTime<Utc>) -> Vec<Event> {
        match &self.findings_path {
            Some(path) => get_list(payload, path)
                .into_iter()
                .map(|finding| self.extract_event(finding, received_at))
                .collect(),
            None => vec![self.extract_event(payload, received_at)],
        }
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(epoch) = raw.parse::<i64>() {
        return Utc.timestamp_opt(epoch, 0).single();
    }
    None
}

/// Renders any JSON value to a detail-map-friendly string; used by adapters
/// that need to coerce a non-string path result before calling
/// `extract_event` indirectly (kept here so this module's callers never
/// need to import `jsonpath` directly).
pub fn stringify(v: &Value) -> String {
    value_to_string(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn trivy_mapping() -> EventMapping {
        EventMapping {
            source: "trivy".into(),
            category: "security".into(),
            event_type: "vulnerability".into(),
            severity_path: Some("severity".into()),
            detected_at_path: None,
            resource_path: Some(ResourcePathMapping {
                kind_path: Some("kind".into()),
                name_path: Some("metadata.name".into()),
                namespace_path: Some("metadata.namespace".into()),
                uid_path: None,
            }),
            rule_path: None,
            message_path: Some("message".into()),
            details_paths: BTreeMap::from([("vulnID".to_string(), "vulnId".to_string())]),
            fingerprintable_fields: vec!["vulnID".into()],
            dedup_key_components: vec!["metadata.namespace".into(), "metadata.name".into(), "vulnId".into()],
            findings_path: None,
        }
    }

    #[test]
    fn extracts_event_from_object() {
        let mapping = trivy_mapping();
        let obj = json!({
            "kind": "Pod",
            "severity": "high",
            "message": "vulnerability found",
            "vulnId": "CVE-2024-1234",
            "metadata": {"name": "api-7", "namespace": "prod"},
        });
        let received = Utc::now();
        let event = mapping.extract_event(&obj, received);
        assert_eq!(event.severity, Severity::High);
        assert_eq!(event.resource.as_ref().unwrap().name, "api-7");
        assert_eq!(event.details.get("vulnID").unwrap(), &json!("CVE-2024-1234"));
        assert_eq!(event.dedup_hint.unwrap().key.unwrap(), "prod/api-7/CVE-2024-1234");
    }

    #[test]
    fn findings_path_extracts_multiple_events() {
        let mut mapping = trivy_mapping();
        mapping.findings_path = Some("status.findings[]".into());
        let payload = json!({
            "status": {
                "findings": [
                    {"kind": "Pod", "severity": "high", "message": "m1", "vulnId": "CVE-1", "metadata": {"name": "a", "namespace": "ns"}},
                    {"kind": "Pod", "severity": "low", "message": "m2", "vulnId": "CVE-2", "metadata": {"name": "b", "namespace": "ns"}},
                ]
            }
        });
        let events = mapping.extract_events_from_findings(&payload, Utc::now());
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].severity, Severity::High);
        assert_eq!(events[1].severity, Severity::Low);
    }

    #[test]
    fn missing_severity_path_yields_unknown() {
        let mut mapping = trivy_mapping();
        mapping.severity_path = None;
        let obj = json!({"kind": "Pod", "message": "x", "metadata": {"name": "a", "namespace": "ns"}});
        let e = mapping.extract_event(&obj, Utc::now());
        assert_eq!(e.severity, Severity::Unknown);
    }
}
