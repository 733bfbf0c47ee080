//! ConfigMap Adapter (§4.4): periodically lists label-selected ConfigMaps,
//! tracks each one's `resourceVersion` to skip unchanged payloads, and maps
//! their JSON findings into Events.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ListParams;
use kube::{Api, Client};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::warn;

use super::{Adapter, AdapterError};
use crate::error::ParseErrorGate;
use crate::types::{Event, EventMapping};
use std::time::Duration;

pub struct ConfigMapAdapter {
    name: String,
    api: Api<ConfigMap>,
    label_selector: String,
    payload_key: String,
    mapping: EventMapping,
    poll_interval: Duration,
    seen_versions: Mutex<HashMap<String, String>>,
    parse_error_gate: ParseErrorGate,
}

impl ConfigMapAdapter {
    pub fn new(
        name: impl Into<String>,
        client: Client,
        namespace: Option<&str>,
        label_selector: impl Into<String>,
        payload_key: impl Into<String>,
        mapping: EventMapping,
        poll_interval: Duration,
    ) -> Self {
        let api = match namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        };
        Self {
            name: name.into(),
            api,
            label_selector: label_selector.into(),
            payload_key: payload_key.into(),
            mapping,
            poll_interval,
            seen_versions: Mutex::new(HashMap::new()),
            parse_error_gate: ParseErrorGate::new(),
        }
    }

    async fn poll_once(&self, out: &mpsc::Sender<Event>) -> Result<(), AdapterError> {
        let lp = ListParams::default().labels(&self.label_selector);
        let list = self
            .api
            .list(&lp)
            .await
            .map_err(|e| AdapterError::Transient(format!("configmap list failed: {e}")))?;

        for cm in list.items {
            let Some(name) = cm.metadata.name.clone() else { continue };
            let Some(rv) = cm.metadata.resource_version.clone() else { continue };

            {
                let mut seen = self.seen_versions.lock().expect("configmap adapter mutex poisoned");
                if seen.get(&name) == Some(&rv) {
                    continue;
                }
                seen.insert(name.clone(), rv);
            }

            let Some(raw) = cm.data.as_ref().and_then(|d| d.get(&self.payload_key)) else {
                continue;
            };
            let payload: serde_json::Value = match serde_json::from_str(raw) {
                Ok(v) => v,
                Err(e) => {
                    if self.parse_error_gate.should_log(&name) {
                        warn!(configmap = %name, error = %e, "failed to parse configmap payload as json");
                    }
                    continue;
                }
            };

            let events = self.mapping.extract_events_from_findings(&payload, chrono::Utc::now());
            for event in events {
                if out.send(event).await.is_err() {
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Adapter for ConfigMapAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "configmap"
    }

    async fn run(&self, out: mpsc::Sender<Event>, mut shutdown: watch::Receiver<bool>) -> Result<(), AdapterError> {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once(&out).await?;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_version_dedup_is_per_name() {
        let seen: Mutex<HashMap<String, String>> = Mutex::new(HashMap::new());
        {
            let mut s = seen.lock().unwrap();
            s.insert("cm-a".to_string(), "1".to_string());
        }
        let mut s = seen.lock().unwrap();
        assert_eq!(s.get("cm-a"), Some(&"1".to_string()));
        assert_eq!(s.insert("cm-a".to_string(), "2".to_string()), Some("1".to_string()));
    }
}
