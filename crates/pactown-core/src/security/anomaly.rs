//! Anomaly logging for admin review.
//!
//! Every denied or throttled admission decision is recorded as a structured
//! event: appended to a JSON-lines file, kept in a bounded in-memory window
//! for queries, and handed to an optional synchronous hook so dashboards or
//! alerters can observe events as they happen.

use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::lock;

/// Default cap on the in-memory event window.
pub const DEFAULT_MAX_EVENTS: usize = 10_000;

/// Kinds of recorded anomalies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    /// Per-minute admission rate exceeded.
    RateLimitExceeded,
    /// Concurrent service limit reached.
    ConcurrentLimitExceeded,
    /// Sliding-hour start limit reached.
    HourlyLimitExceeded,
    /// Host load above thresholds.
    ServerOverloaded,
    /// Suspiciously frequent restarts.
    RapidRestart,
    /// Blocked user or disallowed port.
    UnauthorizedAccess,
}

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational.
    Low,
    /// Worth reviewing.
    Medium,
    /// Needs attention.
    High,
}

/// One recorded anomaly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyEvent {
    /// When the event happened (UTC).
    pub timestamp: DateTime<Utc>,

    /// Event kind.
    #[serde(rename = "type")]
    pub kind: AnomalyType,

    /// Event severity.
    pub severity: Severity,

    /// Tenant involved, if any.
    pub user_id: Option<String>,

    /// Service involved, if any.
    pub service_id: Option<String>,

    /// Human-readable detail.
    pub details: String,
}

/// Hook observing events synchronously as they are recorded.
pub type AnomalyHook = Box<dyn Fn(&AnomalyEvent) + Send + Sync>;

/// Append-only anomaly log.
pub struct AnomalyLog {
    path: PathBuf,
    max_events: usize,
    events: Mutex<VecDeque<AnomalyEvent>>,
    hook: Option<AnomalyHook>,
}

impl AnomalyLog {
    /// Create a log appending to `path`.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            max_events: DEFAULT_MAX_EVENTS,
            events: Mutex::new(VecDeque::new()),
            hook: None,
        }
    }

    /// Cap the in-memory window.
    #[must_use]
    pub fn with_max_events(mut self, max_events: usize) -> Self {
        self.max_events = max_events;
        self
    }

    /// Install a synchronous observer hook.
    #[must_use]
    pub fn with_hook(mut self, hook: AnomalyHook) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Path of the JSON-lines file.
    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Record an event.
    pub fn record(
        &self,
        kind: AnomalyType,
        severity: Severity,
        user_id: Option<&str>,
        service_id: Option<&str>,
        details: impl Into<String>,
    ) -> AnomalyEvent {
        let event = AnomalyEvent {
            timestamp: Utc::now(),
            kind,
            severity,
            user_id: user_id.map(ToString::to_string),
            service_id: service_id.map(ToString::to_string),
            details: details.into(),
        };

        {
            let mut events = lock(&self.events);
            events.push_back(event.clone());
            while events.len() > self.max_events {
                events.pop_front();
            }
        }

        if let Err(e) = self.append_line(&event) {
            error!(error = %e, "failed to append anomaly log");
        }

        match severity {
            Severity::Low => debug!(kind = ?event.kind, details = %event.details, "anomaly"),
            Severity::Medium => warn!(kind = ?event.kind, details = %event.details, "anomaly"),
            Severity::High => error!(kind = ?event.kind, details = %event.details, "anomaly"),
        }

        if let Some(hook) = &self.hook {
            hook(&event);
        }

        event
    }

    fn append_line(&self, event: &AnomalyEvent) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(event).map_err(std::io::Error::other)?;
        writeln!(file, "{line}")
    }

    /// The most recent `count` events, oldest first.
    #[must_use]
    pub fn recent(&self, count: usize) -> Vec<AnomalyEvent> {
        let events = lock(&self.events);
        let skip = events.len().saturating_sub(count);
        events.iter().skip(skip).cloned().collect()
    }

    /// The most recent `count` events for one tenant, oldest first.
    #[must_use]
    pub fn by_user(&self, user_id: &str, count: usize) -> Vec<AnomalyEvent> {
        let events = lock(&self.events);
        let matching: Vec<AnomalyEvent> = events
            .iter()
            .filter(|e| e.user_id.as_deref() == Some(user_id))
            .cloned()
            .collect();
        let skip = matching.len().saturating_sub(count);
        matching.into_iter().skip(skip).collect()
    }
}

impl std::fmt::Debug for AnomalyLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnomalyLog")
            .field("path", &self.path)
            .field("max_events", &self.max_events)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_record_appends_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let log = AnomalyLog::new(dir.path().join("anomalies.jsonl"));

        log.record(
            AnomalyType::RateLimitExceeded,
            Severity::Medium,
            Some("u1"),
            Some("api"),
            "rate limit hit",
        );
        log.record(
            AnomalyType::ServerOverloaded,
            Severity::Low,
            None,
            None,
            "load high",
        );

        let raw = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: AnomalyEvent = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.kind, AnomalyType::RateLimitExceeded);
        assert_eq!(first.user_id.as_deref(), Some("u1"));
        assert!(lines[0].contains("\"type\":\"rate_limit_exceeded\""));
    }

    #[test]
    fn test_memory_window_evicts_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let log = AnomalyLog::new(dir.path().join("anomalies.jsonl")).with_max_events(3);

        for i in 0..5 {
            log.record(
                AnomalyType::RapidRestart,
                Severity::Medium,
                Some("u1"),
                None,
                format!("restart {i}"),
            );
        }

        let recent = log.recent(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].details, "restart 2");
        assert_eq!(recent[2].details, "restart 4");
    }

    #[test]
    fn test_by_user_filters() {
        let dir = tempfile::tempdir().unwrap();
        let log = AnomalyLog::new(dir.path().join("anomalies.jsonl"));

        log.record(AnomalyType::RapidRestart, Severity::Medium, Some("a"), None, "x");
        log.record(AnomalyType::RapidRestart, Severity::Medium, Some("b"), None, "y");

        let for_a = log.by_user("a", 10);
        assert_eq!(for_a.len(), 1);
        assert_eq!(for_a[0].details, "x");
    }

    #[test]
    fn test_hook_called_synchronously() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let log = AnomalyLog::new(dir.path().join("anomalies.jsonl"))
            .with_hook(Box::new(move |_| {
                counted.fetch_add(1, Ordering::SeqCst);
            }));

        log.record(
            AnomalyType::UnauthorizedAccess,
            Severity::High,
            Some("u1"),
            None,
            "blocked",
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
