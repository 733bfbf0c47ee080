//! Hot-reload of the filter ConfigMap (§4.9, §6.4).

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::watcher::{self, Event as WatchEvent};
use kube::{api::ListParams, Api, Client};
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::error::Error;
use crate::filter::{FilterConfig, FilterEngine};
use crate::metrics::Metrics;

pub struct ConfigLoader {
    api: Api<ConfigMap>,
    cm_name: String,
    cm_key: String,
}

impl ConfigLoader {
    pub fn new(client: Client, settings: &Settings) -> Self {
        let api = Api::namespaced(client, &settings.filter_configmap_namespace);
        Self {
            api,
            cm_name: settings.filter_configmap_name.clone(),
            cm_key: settings.filter_configmap_key.clone(),
        }
    }

    /// Loads the initial snapshot at startup. A present-but-malformed
    /// ConfigMap is a fatal configuration error (§7: "At startup, a bad
    /// initial configuration fails the process"); a missing ConfigMap or
    /// missing key falls back to an empty (allow-all) configuration,
    /// per §8's boundary behavior ("Filter with empty sources and no
    /// default → all events allowed").
    pub async fn load_initial(&self) -> Result<FilterConfig, Error> {
        let found = self.api.get_opt(&self.cm_name).await?;
        match found {
            Some(cm) => match cm.data.as_ref().and_then(|d| d.get(&self.cm_key)) {
                Some(raw) => Ok(FilterConfig::parse(raw)?),
                None => {
                    warn!(
                        configmap = %self.cm_name,
                        key = %self.cm_key,
                        "filter configmap has no matching key; starting with allow-all default"
                    );
                    Ok(FilterConfig::empty())
                }
            },
            None => {
                warn!(configmap = %self.cm_name, "filter configmap not found; starting with allow-all default");
                Ok(FilterConfig::empty())
            }
        }
    }

    /// Watches the filter ConfigMap and hot-swaps `engine`'s snapshot on
    /// every valid update. On a parse/validate failure the prior snapshot
    /// is kept and `filter_reload_failures_total` is incremented — the
    /// engine never reverts to empty rules (§4.9).
    pub async fn watch(
        self,
        engine: Arc<FilterEngine>,
        metrics: Arc<Metrics>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let field_selector = format!("metadata.name={}", self.cm_name);
        let list_params = ListParams::default().fields(&field_selector);
        let mut stream = Box::pin(watcher::watcher(self.api.clone(), list_params));

        loop {
            tokio::select! {
                maybe_event = stream.next() => {
                    match maybe_event {
                        Some(Ok(WatchEvent::Applied(cm))) => self.apply(cm, &engine, &metrics),
                        Some(Ok(WatchEvent::Restarted(cms))) => {
                            if let Some(cm) = cms.into_iter().next() {
                                self.apply(cm, &engine, &metrics);
                            }
                        }
                        Some(Ok(WatchEvent::Deleted(_))) => {
                            warn!("filter configmap deleted; keeping last-good snapshot");
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "filter configmap watch error; keeping last-good snapshot");
                        }
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("filter config loader exited");
    }

    fn apply(&self, cm: ConfigMap, engine: &FilterEngine, metrics: &Metrics) {
        let Some(raw) = cm.data.as_ref().and_then(|d| d.get(&self.cm_key)) else {
            return;
        };
        match FilterConfig::parse(raw) {
            Ok(cfg) => {
                engine.swap(cfg);
                metrics.filter_reload_success_total.inc();
                info!("filter configuration reloaded");
            }
            Err(e) => {
                metrics.filter_reload_failures_total.inc();
                warn!(error = %e, "filter configuration reload failed; keeping last-good snapshot");
            }
        }
    }
}
