//! Webhook Adapter (§4.3): a POST endpoint under the operator's own HTTP
//! server, guarded by a size cap, an optional shared secret, an optional
//! IP allow-list, and per-remote-address rate limiting.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Duration;

use actix_web::{post, web, HttpRequest, HttpResponse, Responder};
use bytes::BytesMut;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::warn;

use super::send_bounded;
use crate::dedup::ratelimit::TokenBucket;
use crate::metrics::Metrics;
use crate::types::{Event, EventMapping};
use std::sync::Arc;

pub struct WebhookState {
    /// `None` when no `Ingester` of kind `webhook` is configured; the
    /// route then answers 503 rather than panicking.
    pub mapping: Option<EventMapping>,
    /// The `webhook_path` of the configured `Ingester`, if any (§6.2). When
    /// set, only requests to `/webhook/{source}` with a matching `source`
    /// segment are accepted; others get a 404.
    pub webhook_path: Option<String>,
    pub auth_token: Option<String>,
    pub ip_allowlist: Vec<IpAddr>,
    pub body_cap_bytes: usize,
    pub enqueue_timeout: Duration,
    pub event_tx: mpsc::Sender<Event>,
    pub metrics: Arc<Metrics>,
    rate_limit_enabled: bool,
    rate_limit_per_minute: f64,
    rate_limit_burst: f64,
    limiters: Mutex<HashMap<IpAddr, TokenBucket>>,
}

impl WebhookState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mapping: Option<EventMapping>,
        webhook_path: Option<String>,
        auth_token: Option<String>,
        ip_allowlist: Vec<IpAddr>,
        body_cap_bytes: usize,
        enqueue_timeout: Duration,
        event_tx: mpsc::Sender<Event>,
        metrics: Arc<Metrics>,
        rate_limit_enabled: bool,
        rate_limit_per_minute: f64,
        rate_limit_burst: f64,
    ) -> Self {
        Self {
            mapping,
            webhook_path,
            auth_token,
            ip_allowlist,
            body_cap_bytes,
            enqueue_timeout,
            event_tx,
            metrics,
            rate_limit_enabled,
            rate_limit_per_minute,
            rate_limit_burst,
            limiters: Mutex::new(HashMap::new()),
        }
    }

    fn admit(&self, addr: IpAddr) -> bool {
        if !self.rate_limit_enabled {
            return true;
        }
        let mut limiters = self.limiters.lock().expect("webhook rate limiter mutex poisoned");
        let bucket = limiters
            .entry(addr)
            .or_insert_with(|| TokenBucket::new(self.rate_limit_burst, self.rate_limit_per_minute / 60.0));
        bucket.try_consume()
    }
}

/// Constant-time comparison so a shared secret cannot be recovered through
/// timing on a byte-by-byte mismatch.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[post("/webhook/{source}")]
pub async fn ingest(
    req: HttpRequest,
    source: web::Path<String>,
    mut body: web::Payload,
    state: web::Data<WebhookState>,
) -> impl Responder {
    if let Some(expected) = &state.webhook_path {
        if source.as_str() != expected {
            return HttpResponse::NotFound().json("unknown webhook source path");
        }
    }

    let peer = req.peer_addr().map(|a| a.ip());

    if !state.ip_allowlist.is_empty() {
        match peer {
            Some(ip) if state.ip_allowlist.contains(&ip) => {}
            _ => return HttpResponse::Forbidden().json("source address not allow-listed"),
        }
    }

    if let Some(expected) = &state.auth_token {
        let provided = req
            .headers()
            .get("x-zen-webhook-token")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
            return HttpResponse::Unauthorized().json("invalid webhook token");
        }
    }

    if let Some(ip) = peer {
        if !state.admit(ip) {
            state.metrics.rate_limit_drops_total.with_label_values(&["webhook"]).inc();
            return HttpResponse::TooManyRequests()
                .insert_header(("Retry-After", "1"))
                .json("rate limit exceeded");
        }
    }

    let mut buf = BytesMut::new();
    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => return HttpResponse::BadRequest().json(format!("payload read error: {e}")),
        };
        if buf.len() + chunk.len() > state.body_cap_bytes {
            return HttpResponse::PayloadTooLarge().json("request body exceeds configured cap");
        }
        buf.extend_from_slice(&chunk);
    }

    let Some(mapping) = &state.mapping else {
        return HttpResponse::ServiceUnavailable().json("no webhook ingester configured");
    };

    let value: serde_json::Value = match serde_json::from_slice(&buf) {
        Ok(v) => v,
        Err(e) => return HttpResponse::BadRequest().json(format!("invalid json: {e}")),
    };

    // A `findings_path`-shaped mapping yields one Event per finding (§4.4
    // style fan-out reused here); a plain object mapping yields exactly one.
    let events = mapping.extract_events_from_findings(&value, chrono::Utc::now());
    let total = events.len();
    let mut accepted = 0usize;

    for event in events {
        if !send_bounded(&state.event_tx, event, state.enqueue_timeout).await {
            warn!("webhook ingest dropped: event channel did not accept within the configured deadline");
            state.metrics.rate_limit_drops_total.with_label_values(&["webhook"]).inc();
            return HttpResponse::ServiceUnavailable()
                .insert_header(("Retry-After", "2"))
                .json(serde_json::json!({"accepted": accepted, "total": total}));
        }
        accepted += 1;
    }

    // §6.3 / §8 scenario 3: a single accepted Event is 200; more than one
    // (an aggregated/findings payload) is 202.
    if total > 1 {
        HttpResponse::Accepted().json(serde_json::json!({"accepted": accepted}))
    } else {
        HttpResponse::Ok().json(serde_json::json!({"accepted": accepted}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_rejects_length_mismatch() {
        assert!(!constant_time_eq(b"abc", b"ab"));
    }

    #[test]
    fn constant_time_eq_accepts_equal_bytes() {
        assert!(constant_time_eq(b"sharedsecret", b"sharedsecret"));
    }

    #[test]
    fn constant_time_eq_rejects_differing_bytes() {
        assert!(!constant_time_eq(b"sharedsecret", b"sharedsecreX"));
    }
}
