//! Adapter Runtime (§4.1): lifecycle for source adapters, multiplexed onto
//! one bounded channel.

pub mod configmap;
pub mod generic;
pub mod informer;
pub mod webhook;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::dedup::Backoff;
use crate::metrics::Metrics;
use crate::types::Event;

/// Error taxonomy for adapters (§7): transient errors trigger a restart
/// with backoff; fatal errors (bad configuration) halt the adapter
/// permanently.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("transient adapter failure: {0}")]
    Transient(String),
    #[error("fatal adapter failure: {0}")]
    Fatal(String),
}

/// The capability set every source adapter implements (§4.1): `Name`,
/// `Run`, and — via the `shutdown` watch handed to `run` — `Stop`.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> &'static str;

    /// Runs until `shutdown` fires or a fatal condition is hit. A `Transient`
    /// error causes the runtime to restart this adapter with backoff; a
    /// `Fatal` error halts it permanently (§4.1, §7).
    async fn run(&self, out: mpsc::Sender<Event>, shutdown: watch::Receiver<bool>) -> Result<(), AdapterError>;
}

#[derive(Debug, Clone)]
pub struct AdapterHealth {
    pub name: String,
    pub kind: String,
    pub last_event_at: Option<Instant>,
    pub restart_count: u64,
}

/// Starts/stops the configured set of adapters and multiplexes their
/// output onto one bounded channel — "the core serialization point"
/// (§4.1).
pub struct AdapterRuntime {
    adapters: Vec<Arc<dyn Adapter>>,
    event_tx: mpsc::Sender<Event>,
    health: Arc<RwLock<HashMap<String, AdapterHealth>>>,
    metrics: Arc<Metrics>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdapterRuntime {
    pub fn new(channel_capacity: usize, metrics: Arc<Metrics>) -> (Self, mpsc::Receiver<Event>) {
        let (event_tx, event_rx) = mpsc::channel(channel_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        (
            Self {
                adapters: Vec::new(),
                event_tx,
                health: Arc::new(RwLock::new(HashMap::new())),
                metrics,
                shutdown_tx,
                shutdown_rx,
            },
            event_rx,
        )
    }

    pub fn register(&mut self, adapter: Arc<dyn Adapter>) {
        self.adapters.push(adapter);
    }

    /// Hands out a clone of the shared inbound sender, for ingestion paths
    /// (e.g. the webhook HTTP handler) that are not themselves `Adapter`
    /// run-loops but still feed the same bounded channel (§4.1, §4.3).
    pub fn sender(&self) -> mpsc::Sender<Event> {
        self.event_tx.clone()
    }

    /// Launches one concurrent task per adapter (§4.1, §5). Each task owns
    /// its own restart loop with bounded exponential backoff (base 1s, cap
    /// 60s, full jitter) on `Transient` failures, and halts outright on
    /// `Fatal` ones.
    pub fn spawn(&self) -> Vec<JoinHandle<()>> {
        self.adapters
            .iter()
            .map(|adapter| self.spawn_one(adapter.clone()))
            .collect()
    }

    fn spawn_one(&self, adapter: Arc<dyn Adapter>) -> JoinHandle<()> {
        let out = self.event_tx.clone();
        let shutdown = self.shutdown_rx.clone();
        let metrics = self.metrics.clone();
        let health = self.health.clone();
        let name = adapter.name().to_string();
        let kind = adapter.kind();

        tokio::spawn(async move {
            {
                let mut h = health.write().await;
                h.insert(
                    name.clone(),
                    AdapterHealth {
                        name: name.clone(),
                        kind: kind.to_string(),
                        last_event_at: None,
                        restart_count: 0,
                    },
                );
            }

            let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
            loop {
                if *shutdown.borrow() {
                    break;
                }
                match adapter.run(out.clone(), shutdown.clone()).await {
                    Ok(()) => {
                        info!(adapter = %name, "adapter run loop exited");
                        break;
                    }
                    Err(AdapterError::Fatal(msg)) => {
                        error!(adapter = %name, error = %msg, "adapter halted permanently");
                        break;
                    }
                    Err(AdapterError::Transient(msg)) => {
                        warn!(adapter = %name, error = %msg, "adapter restarting after transient failure");
                        metrics.adapter_restarts_total.with_label_values(&[&name]).inc();
                        {
                            let mut h = health.write().await;
                            if let Some(entry) = h.get_mut(&name) {
                                entry.restart_count += 1;
                            }
                        }
                        if *shutdown.borrow() {
                            break;
                        }
                        let delay = backoff.next_delay();
                        let mut shutdown_wait = shutdown.clone();
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = shutdown_wait.changed() => {
                                if *shutdown_wait.borrow() { break; }
                            }
                        }
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn health_snapshot(&self) -> Vec<AdapterHealth> {
        self.health.read().await.values().cloned().collect()
    }

    /// Records that `name` just produced an event, backing the
    /// `adapter_last_event_age_seconds{source}` gauge (§4.2, §6.6).
    pub async fn touch(&self, name: &str, kind: &str) {
        let mut h = self.health.write().await;
        let entry = h.entry(name.to_string()).or_insert_with(|| AdapterHealth {
            name: name.to_string(),
            kind: kind.to_string(),
            last_event_at: None,
            restart_count: 0,
        });
        entry.last_event_at = Some(Instant::now());
        self.metrics.adapter_last_event_age_seconds.with_label_values(&[name]).set(0.0);
    }
}

/// Sends `event` onto `out`, bounded by `deadline`. Used by the Informer
/// Adapter so a full channel cannot stall the informer's own event loop
/// past the bound (§4.1, §4.2): on timeout the event is dropped and the
/// caller should increment a drop counter.
pub async fn send_bounded(out: &mpsc::Sender<Event>, event: Event, deadline: Duration) -> bool {
    tokio::time::timeout(deadline, out.send(event)).await.map(|r| r.is_ok()).unwrap_or(false)
}
