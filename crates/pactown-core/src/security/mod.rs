//! Admission control for a multi-tenant host.
//!
//! [`SecurityPolicy`] decides whether a tenant may start a service. Six
//! checks run in order and the first failure short-circuits: blocked user,
//! rate limit, concurrent limit, hourly limit, port allowlist, and server
//! load (which throttles rather than denies). Every denied or throttled
//! decision is recorded in the anomaly log.

pub mod anomaly;
pub mod load;
pub mod profile;
pub mod ratelimit;

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub use anomaly::{AnomalyEvent, AnomalyHook, AnomalyLog, AnomalyType, Severity};
pub use load::{LoadSnapshot, ResourceMonitor};
pub use profile::{UserProfile, UserTier};
pub use ratelimit::TokenBucket;

use crate::lock;

/// Sliding window for the hourly start limit.
const HOURLY_WINDOW: Duration = Duration::from_secs(3600);

/// Window and threshold for rapid-restart detection.
const RAPID_RESTART_WINDOW: Duration = Duration::from_secs(60);
const RAPID_RESTART_THRESHOLD: usize = 5;

/// Outcome of an admission check.
#[derive(Debug, Clone)]
pub struct SecurityDecision {
    /// Whether the start may proceed.
    pub allowed: bool,

    /// Reason attached to a denial or throttle.
    pub reason: Option<String>,

    /// Delay the caller must apply before proceeding.
    pub delay: Duration,
}

impl SecurityDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            delay: Duration::ZERO,
        }
    }

    fn deny(reason: impl Into<String>, delay: Duration) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            delay,
        }
    }
}

#[derive(Default)]
struct UsageState {
    /// Live services per tenant.
    running: HashMap<String, BTreeSet<String>>,

    /// Start timestamps per tenant, pruned to the hourly window.
    starts: HashMap<String, VecDeque<Instant>>,
}

/// Admission policy combining profiles, rate limiting, usage quotas, load
/// throttling, and anomaly logging. Safe for concurrent check calls.
pub struct SecurityPolicy {
    profiles: Mutex<HashMap<String, UserProfile>>,
    buckets: Mutex<HashMap<String, TokenBucket>>,
    usage: Mutex<UsageState>,
    monitor: ResourceMonitor,
    anomalies: AnomalyLog,
}

impl SecurityPolicy {
    /// Create a policy writing anomalies to `anomaly_log_path`.
    #[must_use]
    pub fn new(anomaly_log_path: PathBuf) -> Self {
        Self::with_parts(AnomalyLog::new(anomaly_log_path), ResourceMonitor::new())
    }

    /// Create a policy from an explicit anomaly log and monitor.
    #[must_use]
    pub fn with_parts(anomalies: AnomalyLog, monitor: ResourceMonitor) -> Self {
        Self {
            profiles: Mutex::new(HashMap::new()),
            buckets: Mutex::new(HashMap::new()),
            usage: Mutex::new(UsageState::default()),
            monitor,
            anomalies,
        }
    }

    /// Set or replace a tenant profile. Takes effect on the next check.
    pub fn set_profile(&self, profile: UserProfile) {
        lock(&self.profiles).insert(profile.user_id.clone(), profile);
    }

    /// The tenant's profile, created with free-tier defaults when absent.
    #[must_use]
    pub fn profile(&self, user_id: &str) -> UserProfile {
        lock(&self.profiles)
            .entry(user_id.to_string())
            .or_insert_with(|| UserProfile::from_tier(user_id, UserTier::Free))
            .clone()
    }

    /// Block a tenant. Takes effect on the next check.
    pub fn block_user(&self, user_id: &str, reason: impl Into<String>) {
        let mut profiles = lock(&self.profiles);
        let profile = profiles
            .entry(user_id.to_string())
            .or_insert_with(|| UserProfile::from_tier(user_id, UserTier::Free));
        profile.is_blocked = true;
        profile.blocked_reason = Some(reason.into());
    }

    /// The anomaly log.
    #[must_use]
    pub fn anomalies(&self) -> &AnomalyLog {
        &self.anomalies
    }

    /// Number of services the tenant is currently running.
    #[must_use]
    pub fn running_count(&self, user_id: &str) -> usize {
        lock(&self.usage)
            .running
            .get(user_id)
            .map_or(0, BTreeSet::len)
    }

    /// Record a successful start for quota accounting.
    pub fn record_start(&self, user_id: &str, service_id: &str) {
        let mut usage = lock(&self.usage);
        usage
            .running
            .entry(user_id.to_string())
            .or_default()
            .insert(service_id.to_string());
        let starts = usage.starts.entry(user_id.to_string()).or_default();
        starts.push_back(Instant::now());
        prune_window(starts, HOURLY_WINDOW);
    }

    /// Record a stop, freeing a concurrency slot.
    pub fn record_stop(&self, user_id: &str, service_id: &str) {
        let mut usage = lock(&self.usage);
        if let Some(services) = usage.running.get_mut(user_id) {
            services.remove(service_id);
        }
    }

    /// Decide whether `user_id` may start `service_id` on `port`.
    ///
    /// Checks run in order; the first failure short-circuits. A loaded host
    /// allows the start but attaches a throttle delay.
    pub fn check_can_start(
        &self,
        user_id: &str,
        service_id: &str,
        port: Option<u16>,
    ) -> SecurityDecision {
        let profile = self.profile(user_id);

        // 1. Blocked tenant.
        if profile.is_blocked {
            let reason = profile
                .blocked_reason
                .clone()
                .unwrap_or_else(|| "no reason recorded".to_string());
            self.anomalies.record(
                AnomalyType::UnauthorizedAccess,
                Severity::High,
                Some(user_id),
                Some(service_id),
                format!("blocked user attempted to start a service: {reason}"),
            );
            return SecurityDecision::deny(format!("user blocked: {reason}"), Duration::ZERO);
        }

        // 2. Rate limit: one token per admission.
        let eta = {
            let mut buckets = lock(&self.buckets);
            let bucket = buckets
                .entry(user_id.to_string())
                .or_insert_with(|| TokenBucket::per_minute(profile.max_requests_per_minute));
            // A tier change replaces the bucket on the next check.
            if (bucket.capacity() - f64::from(profile.max_requests_per_minute)).abs() > f64::EPSILON
            {
                *bucket = TokenBucket::per_minute(profile.max_requests_per_minute);
            }
            if bucket.try_consume() {
                None
            } else {
                Some(bucket.refill_eta())
            }
        };
        if let Some(eta) = eta {
            self.anomalies.record(
                AnomalyType::RateLimitExceeded,
                Severity::Medium,
                Some(user_id),
                Some(service_id),
                format!("rate limit exceeded, retry in {:.1}s", eta.as_secs_f64()),
            );
            return SecurityDecision::deny(
                format!("rate limit exceeded, wait {:.1}s", eta.as_secs_f64()),
                eta,
            );
        }

        // 3. Concurrent services.
        let current = self.running_count(user_id);
        if current >= profile.max_concurrent_services as usize {
            self.anomalies.record(
                AnomalyType::ConcurrentLimitExceeded,
                Severity::Medium,
                Some(user_id),
                Some(service_id),
                format!(
                    "at max concurrent services ({current}/{})",
                    profile.max_concurrent_services
                ),
            );
            return SecurityDecision::deny(
                format!(
                    "max concurrent services reached ({current}/{}), stop one first",
                    profile.max_concurrent_services
                ),
                Duration::ZERO,
            );
        }

        // 4. Hourly start window.
        let hourly = {
            let mut usage = lock(&self.usage);
            let starts = usage.starts.entry(user_id.to_string()).or_default();
            prune_window(starts, HOURLY_WINDOW);
            starts.len()
        };
        if hourly >= profile.max_services_per_hour as usize {
            self.anomalies.record(
                AnomalyType::HourlyLimitExceeded,
                Severity::Medium,
                Some(user_id),
                Some(service_id),
                format!(
                    "hourly start limit reached ({hourly}/{})",
                    profile.max_services_per_hour
                ),
            );
            return SecurityDecision::deny(
                format!(
                    "hourly service limit reached ({hourly}/{}), try again later",
                    profile.max_services_per_hour
                ),
                Duration::ZERO,
            );
        }

        // 5. Port allowlist.
        if let (Some(port), Some(allowed)) = (port, &profile.allowed_ports) {
            if !allowed.contains(&port) {
                self.anomalies.record(
                    AnomalyType::UnauthorizedAccess,
                    Severity::High,
                    Some(user_id),
                    Some(service_id),
                    format!("requested restricted port {port}"),
                );
                return SecurityDecision::deny(
                    format!("port {port} not allowed for this account"),
                    Duration::ZERO,
                );
            }
        }

        // Rapid restarts are logged for review but never denied here.
        let recent = {
            let mut usage = lock(&self.usage);
            let starts = usage.starts.entry(user_id.to_string()).or_default();
            starts
                .iter()
                .filter(|at| at.elapsed() < RAPID_RESTART_WINDOW)
                .count()
        };
        if recent >= RAPID_RESTART_THRESHOLD {
            self.anomalies.record(
                AnomalyType::RapidRestart,
                Severity::Medium,
                Some(user_id),
                Some(service_id),
                format!("{recent} starts within the last minute"),
            );
        }

        // 6. Server load: allow, but throttled.
        let (overloaded, snapshot) = self.monitor.check_overload();
        if overloaded {
            let delay = self.monitor.throttle_delay();
            self.anomalies.record(
                AnomalyType::ServerOverloaded,
                Severity::Low,
                Some(user_id),
                Some(service_id),
                format!(
                    "host overloaded (cpu {:.1}%, mem {:.1}%), throttling {:.1}s",
                    snapshot.cpu_percent,
                    snapshot.memory_percent,
                    delay.as_secs_f64()
                ),
            );
            return SecurityDecision {
                allowed: true,
                reason: Some(format!(
                    "host under load, delayed by {:.1}s",
                    delay.as_secs_f64()
                )),
                delay,
            };
        }

        SecurityDecision::allow()
    }
}

impl std::fmt::Debug for SecurityPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityPolicy")
            .field("anomalies", &self.anomalies)
            .finish_non_exhaustive()
    }
}

fn prune_window(starts: &mut VecDeque<Instant>, window: Duration) {
    while starts
        .front()
        .is_some_and(|at| at.elapsed() >= window)
    {
        starts.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> (SecurityPolicy, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let policy = SecurityPolicy::with_parts(
            AnomalyLog::new(dir.path().join("anomalies.jsonl")),
            // Thresholds no host reaches, so load never interferes.
            ResourceMonitor::with_thresholds(200.0, 200.0),
        );
        (policy, dir)
    }

    #[test]
    fn test_default_profile_allows_start() {
        let (policy, _dir) = policy();
        let decision = policy.check_can_start("u1", "api", Some(8080));
        assert!(decision.allowed);
        assert_eq!(decision.delay, Duration::ZERO);
    }

    #[test]
    fn test_blocked_user_denied() {
        let (policy, _dir) = policy();
        policy.block_user("u1", "payment chargeback");

        let decision = policy.check_can_start("u1", "api", None);
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("payment chargeback"));

        let events = policy.anomalies().by_user("u1", 10);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AnomalyType::UnauthorizedAccess);
        assert_eq!(events[0].severity, Severity::High);
    }

    #[test]
    fn test_rate_limit_denies_after_capacity() {
        let (policy, _dir) = policy();
        // FREE tier: 20 requests per minute.
        for _ in 0..20 {
            assert!(policy.check_can_start("u1", "api", None).allowed);
        }

        let decision = policy.check_can_start("u1", "api", None);
        assert!(!decision.allowed);
        assert!(decision.delay > Duration::ZERO);

        let rate_events: Vec<AnomalyEvent> = policy
            .anomalies()
            .by_user("u1", 100)
            .into_iter()
            .filter(|e| e.kind == AnomalyType::RateLimitExceeded)
            .collect();
        assert_eq!(rate_events.len(), 1);
    }

    #[test]
    fn test_concurrent_limit() {
        let (policy, _dir) = policy();
        policy.set_profile(UserProfile::from_tier("u1", UserTier::Free));
        policy.record_start("u1", "a");
        policy.record_start("u1", "b");

        let decision = policy.check_can_start("u1", "c", None);
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("concurrent"));

        // Stopping a service frees the slot.
        policy.record_stop("u1", "a");
        assert!(policy.check_can_start("u1", "c", None).allowed);
    }

    #[test]
    fn test_hourly_limit() {
        let (policy, _dir) = policy();
        let mut profile = UserProfile::from_tier("u1", UserTier::Pro);
        profile.max_services_per_hour = 2;
        // Concurrency must not interfere with this test.
        profile.max_concurrent_services = 100;
        policy.set_profile(profile);

        policy.record_start("u1", "a");
        policy.record_stop("u1", "a");
        policy.record_start("u1", "b");
        policy.record_stop("u1", "b");

        let decision = policy.check_can_start("u1", "c", None);
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("hourly"));
    }

    #[test]
    fn test_port_allowlist() {
        let (policy, _dir) = policy();
        policy.set_profile(
            UserProfile::from_tier("u1", UserTier::Basic).with_allowed_ports(vec![8080, 8081]),
        );

        assert!(policy.check_can_start("u1", "api", Some(8080)).allowed);

        let decision = policy.check_can_start("u1", "api", Some(9000));
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("9000"));

        // Without a requested port the allowlist does not apply.
        assert!(policy.check_can_start("u1", "api", None).allowed);
    }

    #[test]
    fn test_overload_throttles_but_allows() {
        let dir = tempfile::tempdir().unwrap();
        let policy = SecurityPolicy::with_parts(
            AnomalyLog::new(dir.path().join("anomalies.jsonl")),
            ResourceMonitor::with_thresholds(-1.0, -1.0),
        );

        let decision = policy.check_can_start("u1", "api", None);
        assert!(decision.allowed);
        assert!(decision.delay >= Duration::from_millis(500));

        let events = policy.anomalies().by_user("u1", 10);
        assert_eq!(events[0].kind, AnomalyType::ServerOverloaded);
        assert_eq!(events[0].severity, Severity::Low);
    }

    #[test]
    fn test_rapid_restart_logged_not_denied() {
        let (policy, _dir) = policy();
        let mut profile = UserProfile::from_tier("u1", UserTier::Enterprise);
        profile.max_concurrent_services = 100;
        policy.set_profile(profile);

        for i in 0..6 {
            policy.record_start("u1", &format!("svc{i}"));
        }

        let decision = policy.check_can_start("u1", "svc6", None);
        assert!(decision.allowed);
        assert!(
            policy
                .anomalies()
                .by_user("u1", 10)
                .iter()
                .any(|e| e.kind == AnomalyType::RapidRestart)
        );
    }

    #[test]
    fn test_check_order_blocked_wins_over_rate() {
        let (policy, _dir) = policy();
        policy.block_user("u1", "abuse");

        // Even with an empty bucket the block fires first.
        let decision = policy.check_can_start("u1", "api", None);
        let events = policy.anomalies().by_user("u1", 10);
        assert!(!decision.allowed);
        assert!(events.iter().all(|e| e.kind == AnomalyType::UnauthorizedAccess));
    }
}
