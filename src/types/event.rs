//! The internal, source-agnostic `Event` record (spec §3.1).

use std::collections::BTreeMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed severity set, normalized per §3.1 and ranked per §3.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub enum Severity {
    // Ordered lowest to highest so `Ord` gives us the rank directly.
    Unknown,
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Parses a source-supplied severity string, applying the alias table
    /// from §3.1 / §8 (`warn→MEDIUM`, `error→HIGH`, `fatal→CRITICAL`,
    /// `crit→CRITICAL`, case-insensitive).
    pub fn normalize(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "critical" | "crit" | "fatal" => Severity::Critical,
            "high" | "error" | "err" => Severity::High,
            "medium" | "warn" | "warning" => Severity::Medium,
            "low" => Severity::Low,
            "info" | "informational" | "notice" => Severity::Info,
            _ => Severity::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "CRITICAL",
            Severity::High => "HIGH",
            Severity::Medium => "MEDIUM",
            Severity::Low => "LOW",
            Severity::Info => "INFO",
            Severity::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Severity::normalize(s))
    }
}

/// Open category set (§3.1); unrecognized values pass through as `Custom`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Security,
    Compliance,
    Operations,
    Performance,
    Cost,
    Custom(String),
}

impl Category {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "security" => Category::Security,
            "compliance" => Category::Compliance,
            "operations" | "ops" => Category::Operations,
            "performance" | "perf" => Category::Performance,
            "cost" => Category::Cost,
            other => Category::Custom(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Category::Security => "security",
            Category::Compliance => "compliance",
            Category::Operations => "operations",
            Category::Performance => "performance",
            Category::Cost => "cost",
            Category::Custom(s) => s.as_str(),
        }
    }
}

/// `{kind, name, namespace, uid?}` identifying the affected object (§3.1).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub struct ResourceRef {
    pub kind: String,
    pub name: String,
    pub namespace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

/// Pre-computed uniqueness key components an adapter can supply when it
/// knows the natural key better than the generic extractor (§3.1).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupHint {
    pub key: Option<String>,
    pub fingerprintable_fields: Vec<String>,
}

/// The source-agnostic record every adapter produces and the pipeline
/// consumes (§3.1). Never serialized onto the wire as-is; `Observation` is
/// its persisted projection (§3.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub source: String,
    pub category: Category,
    pub severity: Severity,
    pub event_type: String,
    pub detected_at: DateTime<Utc>,
    pub resource: Option<ResourceRef>,
    pub rule: Option<String>,
    pub message: String,
    pub details: BTreeMap<String, Value>,
    pub dedup_hint: Option<DedupHint>,
}

/// Allowed clock-skew tolerance for `detectedAt` (§3.1).
pub const CLOCK_SKEW_TOLERANCE: ChronoDuration = ChronoDuration::minutes(5);

#[derive(Debug, thiserror::Error)]
pub enum EventValidationError {
    #[error("source must not be empty")]
    EmptySource,
    #[error("eventType must not be empty")]
    EmptyEventType,
    #[error("detectedAt is {0} in the future, exceeding the clock-skew tolerance")]
    DetectedAtInFuture(ChronoDuration),
}

impl Event {
    /// Enforces the invariants of §3.1: non-empty `source`/`eventType`,
    /// `detectedAt` not more than `CLOCK_SKEW_TOLERANCE` in the future.
    pub fn validate(&self) -> Result<(), EventValidationError> {
        if self.source.trim().is_empty() {
            return Err(EventValidationError::EmptySource);
        }
        if self.event_type.trim().is_empty() {
            return Err(EventValidationError::EmptyEventType);
        }
        let skew = self.detected_at - Utc::now();
        if skew > CLOCK_SKEW_TOLERANCE {
            return Err(EventValidationError::DetectedAtInFuture(skew));
        }
        Ok(())
    }

    /// Normalizes severity casing, canonicalizes an empty namespace to the
    /// cluster-scope sentinel, and trims label-bound strings (§4.6 step 2).
    pub fn normalize(&mut self, default_namespace: &str) {
        self.source = self.source.trim().to_ascii_lowercase();
        if let Some(resource) = self.resource.as_mut() {
            if resource.namespace.trim().is_empty() {
                resource.namespace = default_namespace.to_string();
            }
            resource.namespace = resource.namespace.trim().to_string();
            resource.kind = resource.kind.trim().to_string();
            resource.name = resource.name.trim().to_string();
        }
        if let Some(rule) = self.rule.as_mut() {
            *rule = rule.trim().to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_aliases_normalize() {
        assert_eq!(Severity::normalize("crit"), Severity::Critical);
        assert_eq!(Severity::normalize("Warning"), Severity::Medium);
        assert_eq!(Severity::normalize("fatal"), Severity::Critical);
        assert_eq!(Severity::normalize("bogus"), Severity::Unknown);
    }

    #[test]
    fn severity_ranking_orders_correctly() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
        assert!(Severity::Low > Severity::Info);
    }

    #[test]
    fn detected_at_far_future_is_rejected() {
        let mut e = sample_event();
        e.detected_at = Utc::now() + ChronoDuration::hours(1);
        assert!(e.validate().is_err());
    }

    #[test]
    fn empty_source_is_rejected() {
        let mut e = sample_event();
        e.source = "  ".into();
        assert!(matches!(e.validate(), Err(EventValidationError::EmptySource)));
    }

    fn sample_event() -> Event {
        Event {
            source: "trivy".into(),
            category: Category::Security,
            severity: Severity::High,
            event_type: "vulnerability".into(),
            detected_at: Utc::now(),
            resource: None,
            rule: None,
            message: "test".into(),
            details: BTreeMap::new(),
            dedup_hint: None,
        }
    }
}
