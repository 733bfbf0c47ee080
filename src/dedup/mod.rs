//! Multi-layer deduplication: rate limit → fingerprint → key window → admit
//! (§3.3, §4.7, §9 "Dedup locking").

mod lru;
pub mod ratelimit;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use crate::config::Settings;
use crate::types::Event;
use lru::LruCache;
pub use ratelimit::Backoff;
use ratelimit::TokenBucket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    Fingerprint,
    KeyWindow,
    RateLimited,
}

impl SuppressReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuppressReason::Fingerprint => "fingerprint",
            SuppressReason::KeyWindow => "key_window",
            SuppressReason::RateLimited => "rate_limited",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupDecision {
    Create,
    Suppress(SuppressReason),
}

#[derive(Debug, Clone)]
struct CacheEntry {
    first_seen: Instant,
    last_seen: Instant,
    count: u64,
    bucket_start: Instant,
}

#[derive(Debug, Clone)]
struct Aggregation {
    count: u64,
    window_start: Instant,
    sample: Event,
}

struct BucketSlot {
    start: Instant,
    keys: HashSet<String>,
}

struct State {
    cache: LruCache<String, CacheEntry>,
    fingerprint_index: HashMap<String, Instant>,
    buckets: VecDeque<BucketSlot>,
    rate_limiters: HashMap<String, TokenBucket>,
    aggregations: HashMap<String, Aggregation>,
}

#[derive(Debug, Clone)]
pub struct DeduperConfig {
    pub window: Duration,
    pub max_size: usize,
    pub bucket_size: Duration,
    pub fingerprint_window: Duration,
    pub fingerprint_ttl: Duration,
    pub aggregation_window: Duration,
    pub max_rate_per_source: f64,
    pub max_rate_burst: f64,
    pub enable_fingerprint: bool,
    pub enable_rate_limit: bool,
    pub enable_aggregation: bool,
}

impl From<&Settings> for DeduperConfig {
    fn from(s: &Settings) -> Self {
        Self {
            window: s.dedup_window,
            max_size: s.dedup_max_size,
            bucket_size: s.dedup_bucket_size,
            fingerprint_window: s.dedup_fingerprint_window,
            fingerprint_ttl: s.dedup_fingerprint_ttl,
            aggregation_window: s.dedup_aggregation_window,
            max_rate_per_source: s.max_rate_per_source,
            max_rate_burst: s.max_rate_burst,
            enable_fingerprint: s.enable_fingerprint,
            enable_rate_limit: s.enable_rate_limit,
            enable_aggregation: s.enable_aggregation,
        }
    }
}

/// Process-local dedup engine (§3.3). All mutations serialize under a
/// single mutex (§5, §9): "keep a single coarse mutex over Deduper state by
/// default; optimize only if contention is observed." The rate limiters
/// live under the same mutex rather than a separate per-source lock,
/// which sidesteps the lock-ordering hazard spec §9 flags in the source
/// repo — there is only ever one lock to take.
pub struct Deduper {
    state: Mutex<State>,
    config: DeduperConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Deduper {
    pub fn new(config: DeduperConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            state: Mutex::new(State {
                cache: LruCache::new(config.max_size),
                fingerprint_index: HashMap::new(),
                buckets: VecDeque::new(),
                rate_limiters: HashMap::new(),
                aggregations: HashMap::new(),
            }),
            config,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Current `|cache|`, backing the `dedup_cache_size` gauge (§6.6).
    pub fn cache_len(&self) -> usize {
        self.state.lock().expect("dedup mutex poisoned").cache.len()
    }

    /// Runs the four-layer check of §4.7 against a normalized event and
    /// returns the verdict. Pure given the current state snapshot and
    /// wall-clock time, aside from mutating that state on admit/refresh
    /// (§8 invariant 2: filter/dedup are not random, only time-dependent).
    #[instrument(skip(self, event), fields(source = %event.source))]
    pub fn check(&self, event: &Event) -> DedupDecision {
        self.check_at(event, Instant::now())
    }

    fn check_at(&self, event: &Event, now: Instant) -> DedupDecision {
        let key = compute_key(event);
        let mut state = self.state.lock().expect("dedup mutex poisoned");

        if self.config.enable_rate_limit {
            let bucket = state
                .rate_limiters
                .entry(event.source.clone())
                .or_insert_with(|| TokenBucket::new(self.config.max_rate_burst, self.config.max_rate_per_source));
            if !bucket.try_consume_at(now) {
                record_aggregation(&mut state.aggregations, &key, event, now);
                debug!(%key, "rate limited");
                return DedupDecision::Suppress(SuppressReason::RateLimited);
            }
        }

        let fingerprint = fingerprint_of(event);
        if self.config.enable_fingerprint {
            if let Some(last_seen) = state.fingerprint_index.get(&fingerprint).copied() {
                if now.saturating_duration_since(last_seen) < self.config.fingerprint_window {
                    state.fingerprint_index.insert(fingerprint, now);
                    record_aggregation(&mut state.aggregations, &key, event, now);
                    debug!(%key, "suppressed by fingerprint");
                    return DedupDecision::Suppress(SuppressReason::Fingerprint);
                }
            }
        }

        if let Some(entry) = state.cache.get_mut(&key) {
            if now.saturating_duration_since(entry.last_seen) < self.config.window {
                entry.last_seen = now;
                entry.count += 1;
                let bucket_size = self.config.bucket_size;
                bucket_of(&mut state.buckets, now, bucket_size).keys.insert(key.clone());
                entry.bucket_start = current_bucket_start(now, bucket_size);
                record_aggregation(&mut state.aggregations, &key, event, now);
                debug!(%key, "suppressed by key window");
                return DedupDecision::Suppress(SuppressReason::KeyWindow);
            }
        }

        let bucket_size = self.config.bucket_size;
        let bucket_start = current_bucket_start(now, bucket_size);
        bucket_of(&mut state.buckets, now, bucket_size).keys.insert(key.clone());
        state.cache.insert(
            key,
            CacheEntry {
                first_seen: now,
                last_seen: now,
                count: 1,
                bucket_start,
            },
        );
        state.fingerprint_index.insert(fingerprint, now);
        DedupDecision::Create
    }

    /// Starts the two background loops described in §4.7/§9: bucket +
    /// fingerprint cleanup, and the aggregation reaper. Returns join
    /// handles the caller must await after calling `stop()` (mirrors the
    /// teacher's `Operator::new` returning a future for `main` to drive).
    pub fn spawn_background_tasks(self: &std::sync::Arc<Self>) -> (JoinHandle<()>, JoinHandle<()>, mpsc::Receiver<Event>) {
        let (agg_tx, agg_rx) = mpsc::channel(256);

        let cleanup = {
            let this = self.clone();
            let mut shutdown = this.shutdown_rx.clone();
            let interval = this.config.bucket_size.max(Duration::from_millis(100));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => this.run_cleanup_tick(Instant::now()),
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
                info!("dedup cleanup loop exited");
            })
        };

        let reaper = {
            let this = self.clone();
            let mut shutdown = this.shutdown_rx.clone();
            let interval = (this.config.aggregation_window / 4).max(Duration::from_secs(1));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            for summary in this.drain_ready_aggregations(Instant::now()) {
                                if agg_tx.send(summary).await.is_err() {
                                    break;
                                }
                            }
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
                info!("dedup aggregation reaper exited");
            })
        };

        (cleanup, reaper, agg_rx)
    }

    /// Signals both background loops to exit. Callers must still await the
    /// join handles returned by `spawn_background_tasks` (§9: "tests assert
    /// no goroutine leak across construct/destruct cycles").
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    fn run_cleanup_tick(&self, now: Instant) {
        let mut state = self.state.lock().expect("dedup mutex poisoned");
        let bucket_size = self.config.bucket_size;
        let retention = bucket_size * num_buckets(self.config.window, bucket_size);

        while let Some(front) = state.buckets.front() {
            if now.saturating_duration_since(front.start) <= retention {
                break;
            }
            let expired = state.buckets.pop_front().expect("front just checked");
            for key in &expired.keys {
                let still_stale = state
                    .cache
                    .get(key)
                    .map(|entry| entry.bucket_start <= expired.start)
                    .unwrap_or(false);
                if still_stale {
                    state.cache.remove(key);
                }
            }
        }

        let fp_ttl = self.config.fingerprint_ttl;
        state
            .fingerprint_index
            .retain(|_, last_seen| now.saturating_duration_since(*last_seen) <= fp_ttl);

        let agg_window = self.config.aggregation_window;
        state
            .aggregations
            .retain(|_, agg| now.saturating_duration_since(agg.window_start) <= agg_window);
    }

    fn drain_ready_aggregations(&self, now: Instant) -> Vec<Event> {
        let mut state = self.state.lock().expect("dedup mutex poisoned");
        let window = self.config.aggregation_window;
        let ready_keys: Vec<String> = state
            .aggregations
            .iter()
            .filter(|(_, agg)| now.saturating_duration_since(agg.window_start) >= window)
            .map(|(k, _)| k.clone())
            .collect();

        let mut summaries = Vec::new();
        for key in ready_keys {
            if let Some(agg) = state.aggregations.remove(&key) {
                if self.config.enable_aggregation {
                    let mut summary = agg.sample.clone();
                    summary.message = format!("{} (aggregated x{})", summary.message, agg.count);
                    summaries.push(summary);
                }
            }
        }
        summaries
    }
}

fn num_buckets(window: Duration, bucket_size: Duration) -> u32 {
    let bs = bucket_size.as_secs_f64().max(0.001);
    ((window.as_secs_f64() / bs).ceil() as u32 + 1).max(1)
}

fn current_bucket_start(now: Instant, bucket_size: Duration) -> Instant {
    let bs = bucket_size.max(Duration::from_millis(1));
    // Round `now` down to the nearest bucket boundary relative to an
    // arbitrary fixed epoch (process start is good enough; we only need
    // consistent bucketing, not wall-clock alignment).
    let since_epoch = now.duration_since(*PROCESS_EPOCH);
    let bucket_index = (since_epoch.as_nanos() / bs.as_nanos().max(1)) as u64;
    *PROCESS_EPOCH + bs * bucket_index as u32
}

fn bucket_of(buckets: &mut VecDeque<BucketSlot>, now: Instant, bucket_size: Duration) -> &mut BucketSlot {
    let start = current_bucket_start(now, bucket_size);
    if buckets.back().map(|b| b.start) != Some(start) {
        buckets.push_back(BucketSlot {
            start,
            keys: HashSet::new(),
        });
    }
    buckets.back_mut().expect("just pushed or present")
}

static PROCESS_EPOCH: once_epoch::Lazy<Instant> = once_epoch::Lazy::new(Instant::now);

/// Tiny lazy-once cell so we don't pull in `once_cell` for a single value;
/// `Instant::now()` itself is disallowed at module-init time in const
/// context, so this defers the call to first use.
mod once_epoch {
    use std::sync::OnceLock;

    pub struct Lazy<T> {
        cell: OnceLock<T>,
        init: fn() -> T,
    }

    impl<T> Lazy<T> {
        pub const fn new(init: fn() -> T) -> Self {
            Self {
                cell: OnceLock::new(),
                init,
            }
        }
    }

    impl<T> std::ops::Deref for Lazy<T> {
        type Target = T;
        fn deref(&self) -> &T {
            self.cell.get_or_init(self.init)
        }
    }
}

/// Dedup key (§4.7 step 3): `dedupHint.key` if supplied, else
/// `source/namespace/kind/name/rule/messageHash`.
fn compute_key(event: &Event) -> String {
    if let Some(hint) = &event.dedup_hint {
        if let Some(key) = &hint.key {
            if !key.is_empty() {
                return key.clone();
            }
        }
    }
    let (namespace, kind, name) = event
        .resource
        .as_ref()
        .map(|r| (r.namespace.as_str(), r.kind.as_str(), r.name.as_str()))
        .unwrap_or(("", "", ""));
    let rule = event.rule.as_deref().unwrap_or("");
    let message_hash = short_hash(&event.message);
    format!("{}/{}/{}/{}/{}/{}", event.source, namespace, kind, name, rule, message_hash)
}

fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(&digest[..8])
}

/// Content fingerprint (§4.7 step 2): sha256 over a canonical projection of
/// `{source, category, severity, eventType, resource, selected details}`.
/// `details` are limited to the fields the mapping marked
/// `fingerprintable` via `dedupHint.fingerprintableFields`; `BTreeMap`
/// ordering in `Event::details` already canonicalizes key order.
fn fingerprint_of(event: &Event) -> String {
    let fingerprintable: Option<&[String]> = event.dedup_hint.as_ref().map(|h| h.fingerprintable_fields.as_slice());

    let details: std::collections::BTreeMap<&String, &serde_json::Value> = match fingerprintable {
        Some(fields) if !fields.is_empty() => event
            .details
            .iter()
            .filter(|(k, _)| fields.iter().any(|f| f == *k))
            .collect(),
        _ => event.details.iter().collect(),
    };

    let projection = serde_json::json!({
        "source": event.source,
        "category": event.category.as_str(),
        "severity": event.severity.as_str(),
        "eventType": event.event_type,
        "resource": event.resource,
        "details": details,
    });
    let canonical = serde_json::to_vec(&projection).expect("projection always serializes");
    hex::encode(Sha256::digest(&canonical))
}

fn record_aggregation(aggregations: &mut HashMap<String, Aggregation>, key: &str, event: &Event, now: Instant) {
    aggregations
        .entry(key.to_string())
        .and_modify(|agg| agg.count += 1)
        .or_insert_with(|| Aggregation {
            count: 1,
            window_start: now,
            sample: event.clone(),
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Category, Severity};
    use std::collections::BTreeMap;

    fn config() -> DeduperConfig {
        DeduperConfig {
            window: Duration::from_secs(60),
            max_size: 10,
            bucket_size: Duration::from_secs(10),
            fingerprint_window: Duration::from_secs(60),
            fingerprint_ttl: Duration::from_secs(300),
            aggregation_window: Duration::from_secs(300),
            max_rate_per_source: 100.0,
            max_rate_burst: 200.0,
            enable_fingerprint: true,
            enable_rate_limit: true,
            enable_aggregation: false,
        }
    }

    fn sample(source: &str) -> Event {
        Event {
            source: source.into(),
            category: Category::Security,
            severity: Severity::High,
            event_type: "vulnerability".into(),
            detected_at: chrono::Utc::now(),
            resource: Some(crate::types::ResourceRef {
                kind: "Pod".into(),
                name: "api-7".into(),
                namespace: "prod".into(),
                uid: None,
            }),
            rule: None,
            message: "CVE-2024-1234".into(),
            details: BTreeMap::new(),
            dedup_hint: None,
        }
    }

    #[test]
    fn repeat_within_window_is_suppressed_by_fingerprint() {
        let dd = Deduper::new(config());
        let event = sample("trivy");
        assert_eq!(dd.check(&event), DedupDecision::Create);
        assert_eq!(
            dd.check(&event),
            DedupDecision::Suppress(SuppressReason::Fingerprint)
        );
    }

    #[test]
    fn key_window_suppresses_when_fingerprint_disabled() {
        let mut cfg = config();
        cfg.enable_fingerprint = false;
        let dd = Deduper::new(cfg);
        let mut a = sample("trivy");
        a.details.insert("n".into(), serde_json::json!(1));
        let mut b = sample("trivy");
        b.details.insert("n".into(), serde_json::json!(2));
        assert_eq!(dd.check(&a), DedupDecision::Create);
        assert_eq!(dd.check(&b), DedupDecision::Suppress(SuppressReason::KeyWindow));
    }

    #[test]
    fn rate_limit_caps_admitted_events() {
        let mut cfg = config();
        cfg.max_rate_burst = 2.0;
        cfg.max_rate_per_source = 0.0;
        cfg.enable_fingerprint = false;
        let dd = Deduper::new(cfg);
        let mut admitted = 0;
        for i in 0..10 {
            let mut e = sample("falco");
            e.message = format!("distinct-{i}");
            if dd.check(&e) == DedupDecision::Create {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 2);
    }

    #[test]
    fn cache_bound_is_respected() {
        let dd = Deduper::new(config());
        for i in 0..50 {
            let mut e = sample("trivy");
            e.message = format!("distinct-{i}");
            dd.check(&e);
        }
        assert!(dd.cache_len() <= 10);
    }

    #[test]
    fn dedup_hint_key_is_used_when_present() {
        let mut cfg = config();
        cfg.enable_fingerprint = false;
        let dd = Deduper::new(cfg);
        let mut a = sample("trivy");
        a.dedup_hint = Some(crate::types::DedupHint {
            key: Some("fixed-key".into()),
            fingerprintable_fields: vec![],
        });
        let mut b = a.clone();
        b.message = "different message".into();
        b.details.insert("x".into(), serde_json::json!(1));
        assert_eq!(dd.check(&a), DedupDecision::Create);
        assert_eq!(dd.check(&b), DedupDecision::Suppress(SuppressReason::KeyWindow));
    }
}
