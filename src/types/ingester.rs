//! `Ingester` and `ObservationMapping` input-configuration CRDs (§6.2, §4.5).
//!
//! Group `zen.kube-zen.io`, version `v1alpha1` — lifecycle independent of
//! the `v1` `Observation` CR (§6.2).

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::types::mapping::EventMapping;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum IngesterKind {
    Logs,
    Webhook,
    Informer,
}

/// Scoping for an `informer`-kind `Ingester`: the GVR it watches.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GvrRef {
    pub group: String,
    pub version: String,
    pub resource: String,
    #[serde(default)]
    pub namespaces: Vec<String>,
}

/// `Ingester` CRD: describes one adapter instance — its kind, source name,
/// mapping, and (for webhook/informer kinds) wiring details (§6.2).
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    kind = "Ingester",
    group = "zen.kube-zen.io",
    version = "v1alpha1",
    namespaced,
    plural = "ingesters"
)]
pub struct IngesterSpec {
    pub kind: IngesterKind,
    pub source: String,
    pub mapping: EventMapping,
    #[serde(default)]
    pub gvr: Option<GvrRef>,
    #[serde(default)]
    pub webhook_path: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// `ObservationMapping` CRD: a standalone, hot-pluggable mapping that the
/// Generic Adapter (§4.5) reconciles into a running Informer-style adapter
/// without redeploying the operator.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    kind = "ObservationMapping",
    group = "zen.kube-zen.io",
    version = "v1alpha1",
    namespaced,
    plural = "observationmappings"
)]
pub struct ObservationMappingSpec {
    pub gvr: GvrRef,
    pub mapping: EventMapping,
    #[serde(default = "default_true")]
    pub enabled: bool,
}
