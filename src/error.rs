use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;

/// Top-level error type for the pipeline and its supporting components.
#[derive(Error, Debug)]
pub enum Error {
    #[error("kubernetes API error: {0}")]
    Kube(#[source] kube::Error),

    #[error("finalizer error: {0}")]
    Finalizer(#[source] kube::runtime::finalizer::Error<kube::Error>),

    #[error("serialization error: {0}")]
    Serialization(#[source] serde_json::Error),

    #[error("filter configuration error: {0}")]
    Config(#[from] crate::filter::ConfigError),

    #[error("adapter error: {0}")]
    Adapter(#[from] crate::adapters::AdapterError),

    #[error("io error: {0}")]
    Io(#[source] std::io::Error),
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        Error::Kube(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

/// Classifies an error for the Adapter Runtime's restart-vs-halt decision (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network blip, conflict, throttling: retry with backoff.
    Transient,
    /// Forbidden, not-found on a required API, bad configuration: halt.
    Permanent,
}

/// Gates repeated "parse error on incoming event" log lines to once per
/// source per minute, per §7 ("log+count once per source per minute to
/// avoid log storms").
#[derive(Default)]
pub struct ParseErrorGate {
    last_logged: Mutex<HashMap<String, Instant>>,
}

impl ParseErrorGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if this source's parse error should be logged now.
    pub fn should_log(&self, source: &str) -> bool {
        let mut guard = self.last_logged.lock().expect("parse error gate poisoned");
        let now = Instant::now();
        match guard.get(source) {
            Some(last) if now.duration_since(*last) < Duration::from_secs(60) => false,
            _ => {
                guard.insert(source.to_string(), now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_gate_suppresses_within_window() {
        let gate = ParseErrorGate::new();
        assert!(gate.should_log("trivy"));
        assert!(!gate.should_log("trivy"));
        assert!(gate.should_log("falco"));
    }
}
