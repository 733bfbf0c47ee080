//! Filter ConfigMap document shape (§3.4, §6.4).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Event, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingOrder {
    FilterFirst,
    DedupFirst,
}

impl Default for ProcessingOrder {
    fn default() -> Self {
        ProcessingOrder::FilterFirst
    }
}

/// Per-source filter rules (§3.4). All fields optional; unspecified means
/// no constraint on that axis.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceFilter {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub min_severity: Option<String>,
    #[serde(default)]
    pub include_severity: Option<Vec<String>>,
    #[serde(default)]
    pub include_event_types: Option<Vec<String>>,
    #[serde(default)]
    pub exclude_event_types: Option<Vec<String>>,
    #[serde(default)]
    pub include_namespaces: Option<Vec<String>>,
    #[serde(default)]
    pub exclude_namespaces: Option<Vec<String>>,
    #[serde(default)]
    pub include_kinds: Option<Vec<String>>,
    #[serde(default)]
    pub exclude_kinds: Option<Vec<String>>,
    #[serde(default)]
    pub ignore_kinds: Option<Vec<String>>,
    #[serde(default)]
    pub include_categories: Option<Vec<String>>,
    #[serde(default)]
    pub exclude_categories: Option<Vec<String>>,
    #[serde(default)]
    pub exclude_rules: Option<Vec<String>>,
    #[serde(default)]
    pub include_rules: Option<Vec<String>>,
}

impl SourceFilter {
    /// Merges `ignoreKinds` into `excludeKinds` at load time (§3.4).
    fn finalize(mut self) -> Self {
        if let Some(ignored) = self.ignore_kinds.take() {
            let mut excluded = self.exclude_kinds.take().unwrap_or_default();
            excluded.extend(ignored);
            self.exclude_kinds = Some(excluded);
        }
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterDocument {
    #[serde(default)]
    pub sources: HashMap<String, SourceFilter>,
    #[serde(default)]
    pub default: Option<SourceFilter>,
    #[serde(default)]
    pub processing_order: ProcessingOrder,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("malformed filter.json: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid filter configuration: {0}")]
    Validation(String),
}

/// Immutable, validated filter configuration — the value swapped atomically
/// by the Filter Engine (§4.9, §9 "represent snapshots as an immutable
/// value").
#[derive(Debug, Clone, Default)]
pub struct FilterConfig {
    pub sources: HashMap<String, SourceFilter>,
    pub default: Option<SourceFilter>,
    pub processing_order: ProcessingOrder,
}

impl FilterConfig {
    /// Parses and validates a `filter.json` body. "Unknown source keys
    /// warn but are accepted" (§4.9) — there is no closed source registry
    /// to validate keys against, so every key in `sources` is accepted.
    /// "Malformed schema rejects the whole update" is enforced by `serde`
    /// parse failure (`ConfigError::Parse`).
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let doc: FilterDocument = serde_json::from_str(raw)?;
        validate(&doc)?;
        let sources = doc
            .sources
            .into_iter()
            .map(|(k, v)| (k, v.finalize()))
            .collect();
        Ok(FilterConfig {
            sources,
            default: doc.default.map(SourceFilter::finalize),
            processing_order: doc.processing_order,
        })
    }

    pub fn empty() -> Self {
        FilterConfig::default()
    }

    pub fn filter_for<'a>(&'a self, source: &str) -> Option<&'a SourceFilter> {
        self.sources.get(source).or(self.default.as_ref())
    }
}

fn validate(doc: &FilterDocument) -> Result<(), ConfigError> {
    for (name, filter) in &doc.sources {
        validate_source_filter(name, filter)?;
    }
    if let Some(default) = &doc.default {
        validate_source_filter("default", default)?;
    }
    Ok(())
}

fn validate_source_filter(name: &str, filter: &SourceFilter) -> Result<(), ConfigError> {
    if let Some(min) = &filter.min_severity {
        if Severity::normalize(min) == Severity::Unknown && !min.eq_ignore_ascii_case("unknown") {
            return Err(ConfigError::Validation(format!(
                "source {name}: unrecognized minSeverity {min:?}"
            )));
        }
    }
    if let Some(list) = &filter.include_severity {
        for s in list {
            if Severity::normalize(s) == Severity::Unknown && !s.eq_ignore_ascii_case("unknown") {
                return Err(ConfigError::Validation(format!(
                    "source {name}: unrecognized includeSeverity entry {s:?}"
                )));
            }
        }
    }
    Ok(())
}

/// Rejection reasons for `events_filtered_total{reason}` (§4.6 step 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Disabled,
    MinSeverity,
    EventType,
    Namespace,
    Kind,
    Category,
    Rule,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Disabled => "disabled",
            RejectReason::MinSeverity => "min_severity",
            RejectReason::EventType => "event_type",
            RejectReason::Namespace => "namespace",
            RejectReason::Kind => "kind",
            RejectReason::Category => "category",
            RejectReason::Rule => "rule",
        }
    }
}

/// Evaluates one `SourceFilter` against an event. Pure function of its
/// inputs (§8 invariant 2: "no time dependency, no random").
pub fn evaluate(filter: &SourceFilter, event: &Event) -> Result<(), RejectReason> {
    if filter.enabled == Some(false) {
        return Err(RejectReason::Disabled);
    }

    if let Some(include) = &filter.include_severity {
        if !include.iter().any(|s| Severity::normalize(s) == event.severity) {
            return Err(RejectReason::MinSeverity);
        }
    } else if let Some(min) = &filter.min_severity {
        if event.severity < Severity::normalize(min) {
            return Err(RejectReason::MinSeverity);
        }
    }

    check_list(
        &filter.include_event_types,
        &filter.exclude_event_types,
        &event.event_type,
        false,
        RejectReason::EventType,
    )?;

    let namespace = event.resource.as_ref().map(|r| r.namespace.as_str()).unwrap_or("");
    check_list(
        &filter.include_namespaces,
        &filter.exclude_namespaces,
        namespace,
        false,
        RejectReason::Namespace,
    )?;

    let kind = event.resource.as_ref().map(|r| r.kind.as_str()).unwrap_or("");
    check_list(
        &filter.include_kinds,
        &filter.exclude_kinds,
        kind,
        true,
        RejectReason::Kind,
    )?;

    check_list(
        &filter.include_categories,
        &filter.exclude_categories,
        event.category.as_str(),
        false,
        RejectReason::Category,
    )?;

    let rule = event.rule.as_deref().unwrap_or("");
    check_list(
        &filter.include_rules,
        &filter.exclude_rules,
        rule,
        false,
        RejectReason::Rule,
    )?;

    Ok(())
}

/// Include/exclude axis evaluation (§3.4): exclude wins when both are set
/// and both match; include, if non-empty, requires membership.
fn check_list(
    include: &Option<Vec<String>>,
    exclude: &Option<Vec<String>>,
    value: &str,
    case_insensitive: bool,
    reason: RejectReason,
) -> Result<(), RejectReason> {
    let matches = |candidate: &str| -> bool {
        if case_insensitive {
            candidate.eq_ignore_ascii_case(value)
        } else {
            candidate == value
        }
    };

    if let Some(list) = exclude {
        if !list.is_empty() && list.iter().any(|v| matches(v)) {
            return Err(reason);
        }
    }
    if let Some(list) = include {
        if !list.is_empty() && !list.iter().any(|v| matches(v)) {
            return Err(reason);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn sample_event(severity: Severity) -> Event {
        Event {
            source: "trivy".into(),
            category: crate::types::Category::Security,
            severity,
            event_type: "vulnerability".into(),
            detected_at: chrono::Utc::now(),
            resource: Some(crate::types::ResourceRef {
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
    fn empty_config_allows_everything() {
        let cfg = FilterConfig::parse("{}").unwrap();
        assert!(cfg.filter_for("trivy").is_none());
    }

    #[test]
    fn min_severity_rejects_lower() {
        let filter: SourceFilter = serde_json::from_value(serde_json::json!({"minSeverity": "HIGH"})).unwrap();
        assert_eq!(evaluate(&filter, &sample_event(Severity::Low)), Err(RejectReason::MinSeverity));
        assert_eq!(evaluate(&filter, &sample_event(Severity::High)), Ok(()));
    }

    #[test]
    fn ignore_kinds_merges_into_exclude_kinds() {
        let cfg = FilterConfig::parse(r#"{"default": {"ignoreKinds": ["pod"]}}"#).unwrap();
        let filter = cfg.default.as_ref().unwrap();
        assert_eq!(evaluate(filter, &sample_event(Severity::High)), Err(RejectReason::Kind));
    }

    #[test]
    fn exclude_takes_precedence_over_include() {
        let filter: SourceFilter = serde_json::from_value(serde_json::json!({
            "includeNamespaces": ["prod", "staging"],
            "excludeNamespaces": ["prod"],
        }))
        .unwrap();
        assert_eq!(evaluate(&filter, &sample_event(Severity::High)), Err(RejectReason::Namespace));
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(FilterConfig::parse("{ not json").is_err());
    }

    #[test]
    fn disabled_source_rejects_all() {
        let filter: SourceFilter = serde_json::from_value(serde_json::json!({"enabled": false})).unwrap();
        assert_eq!(evaluate(&filter, &sample_event(Severity::Critical)), Err(RejectReason::Disabled));
    }
}
