//! GC Collector (§4.8): periodically reclaims Observations whose TTL has
//! elapsed, via chunked listing and a bounded per-sweep deadline.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use kube::api::{DeleteParams, ListParams};
use kube::{Api, Client};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::config::Settings;
use crate::metrics::Metrics;
use crate::types::Observation;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SweepOutcome {
    Deleted,
    Skipped,
}

/// Short-term memory of names that failed deletion this sweep, so a single
/// stuck Observation cannot be retried in a tight loop within the same
/// sweep (§4.8 "short-term skip list").
struct SkipList {
    entries: HashMap<String, Instant>,
    ttl: Duration,
}

impl SkipList {
    fn new(ttl: Duration) -> Self {
        Self { entries: HashMap::new(), ttl }
    }

    fn is_skipped(&self, key: &str) -> bool {
        self.entries.get(key).is_some_and(|t| t.elapsed() < self.ttl)
    }

    fn mark(&mut self, key: String) {
        self.entries.insert(key, Instant::now());
    }

    fn prune(&mut self) {
        let ttl = self.ttl;
        self.entries.retain(|_, t| t.elapsed() < ttl);
    }
}

pub struct GcCollector {
    client: Client,
    settings: Arc<Settings>,
    metrics: Arc<Metrics>,
    skip_list: tokio::sync::Mutex<SkipList>,
}

impl GcCollector {
    pub fn new(client: Client, settings: Arc<Settings>, metrics: Arc<Metrics>) -> Self {
        Self {
            client,
            settings,
            metrics,
            skip_list: tokio::sync::Mutex::new(SkipList::new(Duration::from_secs(600))),
        }
    }

    /// Runs the periodic sweep loop until `shutdown` fires (§5).
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.gc_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("gc collector exited");
    }

    /// One full sweep: chunked list + delete, bounded by
    /// `gc_sweep_timeout` (§4.8). Exceeding the deadline ends the sweep
    /// early; remaining eligible Observations are picked up next cycle.
    async fn sweep(&self) {
        let start = Instant::now();
        let deadline = start + self.settings.gc_sweep_timeout;
        let api: Api<Observation> = Api::all(self.client.clone());

        {
            let mut skip = self.skip_list.lock().await;
            skip.prune();
        }

        let mut continue_token: Option<String> = None;
        let mut deleted = 0u64;
        let mut skipped = 0u64;

        loop {
            if Instant::now() >= deadline {
                warn!("gc sweep deadline reached; remaining observations deferred to next cycle");
                break;
            }

            let mut lp = ListParams::default().limit(self.settings.gc_chunk_limit);
            if let Some(tok) = &continue_token {
                lp = lp.continue_token(tok);
            }

            let page = match api.list(&lp).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "gc sweep list failed");
                    self.metrics.gc_sweep_failures_total.inc();
                    break;
                }
            };

            for obs in &page.items {
                if Instant::now() >= deadline {
                    warn!("gc sweep deadline reached mid-page; remaining observations deferred");
                    break;
                }
                let Some(name) = obs.metadata.name.clone() else { continue };
                let Some(ns) = obs.metadata.namespace.clone() else { continue };
                let key = format!("{ns}/{name}");

                {
                    let skip = self.skip_list.lock().await;
                    if skip.is_skipped(&key) {
                        continue;
                    }
                }

                if !self.is_eligible(obs) {
                    continue;
                }

                match self.delete_one(&ns, &name).await {
                    SweepOutcome::Deleted => deleted += 1,
                    SweepOutcome::Skipped => {
                        skipped += 1;
                        let mut skip = self.skip_list.lock().await;
                        skip.mark(key);
                    }
                }
            }

            continue_token = page.metadata.continue_.clone();
            if continue_token.is_none() {
                break;
            }
        }

        self.metrics.gc_observations_deleted_total.inc_by(deleted);
        self.metrics
            .gc_sweep_duration_seconds
            .with_label_values(&[])
            .observe(start.elapsed().as_secs_f64());
        info!(deleted, skipped, elapsed_ms = start.elapsed().as_millis() as u64, "gc sweep complete");
    }

    fn is_eligible(&self, obs: &Observation) -> bool {
        let Some(created) = obs.metadata.creation_timestamp.as_ref() else {
            return false;
        };
        let ttl = obs.spec.ttl_seconds_after_creation;
        let expires_at = created.0 + chrono::Duration::seconds(ttl);
        Utc::now() >= expires_at
    }

    /// Deletes one Observation. A `NotFound` response is treated as
    /// success — the object is already gone (§4.8, §8).
    async fn delete_one(&self, namespace: &str, name: &str) -> SweepOutcome {
        let api: Api<Observation> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => SweepOutcome::Deleted,
            Err(kube::Error::Api(ae)) if ae.code == 404 => SweepOutcome::Deleted,
            Err(e) => {
                warn!(error = %e, namespace = %namespace, name = %name, "gc delete failed; skipping for this sweep");
                self.metrics.gc_sweep_failures_total.inc();
                SweepOutcome::Skipped
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_list_expires_entries() {
        let mut sl = SkipList::new(Duration::from_millis(1));
        sl.mark("ns/name".to_string());
        assert!(sl.is_skipped("ns/name"));
        std::thread::sleep(Duration::from_millis(5));
        assert!(!sl.is_skipped("ns/name"));
    }

    #[test]
    fn skip_list_prune_drops_stale_entries() {
        let mut sl = SkipList::new(Duration::from_millis(1));
        sl.mark("ns/name".to_string());
        std::thread::sleep(Duration::from_millis(5));
        sl.prune();
        assert!(sl.entries.is_empty());
    }
}
