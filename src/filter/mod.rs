//! Filter Engine: lock-free read path over an atomically-swapped snapshot
//! (§4.9, §9).

pub mod config;
pub mod loader;

use std::sync::Arc;

use arc_swap::ArcSwap;

pub use config::{ConfigError, FilterConfig, ProcessingOrder, RejectReason, SourceFilter};

use crate::types::Event;

/// Holds an atomically-swappable `FilterConfig`. Readers load the snapshot
/// pointer without locking (§4.9, §5 "Filter Engine: lock-free read path
/// via atomic pointer to immutable snapshot; writes swap the pointer").
pub struct FilterEngine {
    snapshot: ArcSwap<FilterConfig>,
}

impl FilterEngine {
    pub fn new(initial: FilterConfig) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(initial),
        }
    }

    pub fn empty() -> Self {
        Self::new(FilterConfig::empty())
    }

    /// `Allow(Event) -> bool`-shaped evaluation (§4.9), returning the
    /// rejection reason for metrics purposes instead of a bare bool.
    pub fn evaluate(&self, event: &Event) -> Result<(), RejectReason> {
        let snapshot = self.snapshot.load();
        match snapshot.filter_for(&event.source) {
            Some(filter) => config::evaluate(filter, event),
            None => Ok(()),
        }
    }

    pub fn processing_order(&self) -> ProcessingOrder {
        self.snapshot.load().processing_order
    }

    /// Atomically swaps in a new snapshot (§4.9 "on success, swap in the
    /// new snapshot atomically").
    pub fn swap(&self, new: FilterConfig) {
        self.snapshot.store(Arc::new(new));
    }

    pub fn current(&self) -> Arc<FilterConfig> {
        self.snapshot.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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
    fn swap_replaces_effective_rules_atomically() {
        let engine = FilterEngine::empty();
        assert!(engine.evaluate(&event()).is_ok());

        let cfg = FilterConfig::parse(r#"{"sources": {"trivy": {"minSeverity": "HIGH"}}}"#).unwrap();
        engine.swap(cfg);
        assert_eq!(engine.evaluate(&event()), Err(RejectReason::MinSeverity));
    }

    #[test]
    fn never_reverts_to_empty_on_failed_parse() {
        let engine = FilterEngine::empty();
        let cfg = FilterConfig::parse(r#"{"sources": {"trivy": {"minSeverity": "HIGH"}}}"#).unwrap();
        engine.swap(cfg);
        assert!(FilterConfig::parse("{not json").is_err());
        // engine still holds the prior good snapshot
        assert_eq!(engine.evaluate(&event()), Err(RejectReason::MinSeverity));
    }
}
