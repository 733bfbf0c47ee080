//! Generic Adapter (§4.5): reconciles `ObservationMapping` custom resources
//! into running Informer-style watches, without redeploying the operator.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use kube::api::ListParams;
use kube::runtime::watcher::{self, Event as WatchEvent};
use kube::{Api, Client};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::informer::InformerAdapter;
use super::{Adapter, AdapterError};
use crate::metrics::Metrics;
use crate::types::{Event, ObservationMapping};

struct ChildHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct GenericAdapter {
    name: String,
    client: Client,
    namespace: Option<String>,
    metrics: Arc<Metrics>,
}

impl GenericAdapter {
    pub fn new(name: impl Into<String>, client: Client, namespace: Option<String>, metrics: Arc<Metrics>) -> Self {
        Self {
            name: name.into(),
            client,
            namespace,
            metrics,
        }
    }

    fn api(&self) -> Api<ObservationMapping> {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn spawn_child(&self, cr_name: &str, mapping: &ObservationMapping, out: mpsc::Sender<Event>) -> ChildHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let informer = InformerAdapter::new(
            format!("generic/{cr_name}"),
            self.client.clone(),
            mapping.spec.gvr.group.clone(),
            mapping.spec.gvr.version.clone(),
            mapping.spec.gvr.resource.clone(),
            mapping.spec.gvr.namespaces.first().cloned(),
            mapping.spec.mapping.clone(),
            self.metrics.clone(),
        );
        let task = tokio::spawn(async move {
            if let Err(e) = informer.run(out, shutdown_rx).await {
                warn!(error = %e, "generic-adapter child informer exited with error");
            }
        });
        ChildHandle { shutdown: shutdown_tx, task }
    }

    fn reconcile(&self, children: &mut HashMap<String, ChildHandle>, cr_name: String, mapping: ObservationMapping, out: &mpsc::Sender<Event>) {
        if let Some(existing) = children.remove(&cr_name) {
            let _ = existing.shutdown.send(true);
            existing.task.abort();
        }
        if mapping.spec.enabled {
            info!(mapping = %cr_name, "generic adapter: starting mapped watch");
            children.insert(cr_name, self.spawn_child(&cr_name, &mapping, out.clone()));
        }
    }

    fn stop_child(&self, children: &mut HashMap<String, ChildHandle>, cr_name: &str) {
        if let Some(existing) = children.remove(cr_name) {
            info!(mapping = %cr_name, "generic adapter: stopping mapped watch");
            let _ = existing.shutdown.send(true);
            existing.task.abort();
        }
    }
}

#[async_trait]
impl Adapter for GenericAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "generic"
    }

    async fn run(&self, out: mpsc::Sender<Event>, mut shutdown: watch::Receiver<bool>) -> Result<(), AdapterError> {
        let api = self.api();
        let mut stream = Box::pin(watcher::watcher(api, ListParams::default()));
        let mut children: HashMap<String, ChildHandle> = HashMap::new();

        loop {
            tokio::select! {
                next = stream.next() => {
                    match next {
                        Some(Ok(WatchEvent::Applied(om))) => {
                            let Some(cr_name) = om.metadata.name.clone() else { continue };
                            self.reconcile(&mut children, cr_name, om, &out);
                        }
                        Some(Ok(WatchEvent::Deleted(om))) => {
                            if let Some(cr_name) = om.metadata.name.clone() {
                                self.stop_child(&mut children, &cr_name);
                            }
                        }
                        Some(Ok(WatchEvent::Restarted(oms))) => {
                            let live: Vec<String> = oms.iter().filter_map(|o| o.metadata.name.clone()).collect();
                            let stale: Vec<String> = children.keys().filter(|k| !live.contains(*k)).cloned().collect();
                            for cr_name in stale {
                                self.stop_child(&mut children, &cr_name);
                            }
                            for om in oms {
                                let Some(cr_name) = om.metadata.name.clone() else { continue };
                                self.reconcile(&mut children, cr_name, om, &out);
                            }
                        }
                        Some(Err(e)) => {
                            for (_, child) in children.drain() {
                                let _ = child.shutdown.send(true);
                                child.task.abort();
                            }
                            return Err(AdapterError::Transient(format!("observationmapping watch error: {e}")));
                        }
                        None => {
                            for (_, child) in children.drain() {
                                let _ = child.shutdown.send(true);
                                child.task.abort();
                            }
                            return Err(AdapterError::Transient("observationmapping watch stream ended".into()));
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        for (_, child) in children.drain() {
                            let _ = child.shutdown.send(true);
                            child.task.abort();
                        }
                        return Ok(());
                    }
                }
            }
        }
    }
}
