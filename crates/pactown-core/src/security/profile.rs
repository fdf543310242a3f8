//! Tenant profiles and tier limits.

use serde::{Deserialize, Serialize};

/// User tier levels with different resource limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserTier {
    /// Free tier.
    Free,
    /// Basic paid tier.
    Basic,
    /// Professional tier.
    Pro,
    /// Enterprise tier.
    Enterprise,
}

impl std::fmt::Display for UserTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Free => write!(f, "free"),
            Self::Basic => write!(f, "basic"),
            Self::Pro => write!(f, "pro"),
            Self::Enterprise => write!(f, "enterprise"),
        }
    }
}

/// Per-tenant limits and standing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    /// Tenant identifier. A logical partition only; no host account is
    /// ever created for it.
    pub user_id: String,

    /// Tier the limits were derived from.
    pub tier: UserTier,

    /// Maximum services running at once.
    pub max_concurrent_services: u32,

    /// Memory budget in MiB.
    pub max_memory_mb: u64,

    /// CPU budget in percent.
    pub max_cpu_percent: u8,

    /// Admission requests per minute (token bucket capacity).
    pub max_requests_per_minute: u32,

    /// Service starts allowed per sliding hour.
    pub max_services_per_hour: u32,

    /// Ports this tenant may request; `None` allows any port in the
    /// allocator range.
    #[serde(default)]
    pub allowed_ports: Option<Vec<u16>>,

    /// Whether the tenant is blocked outright.
    #[serde(default)]
    pub is_blocked: bool,

    /// Reason the tenant was blocked.
    #[serde(default)]
    pub blocked_reason: Option<String>,
}

impl UserProfile {
    /// Create a profile with tier-based defaults.
    #[must_use]
    pub fn from_tier(user_id: impl Into<String>, tier: UserTier) -> Self {
        let (concurrent, memory_mb, cpu, per_minute, per_hour) = match tier {
            UserTier::Free => (2, 256, 25, 20, 5),
            UserTier::Basic => (5, 512, 50, 60, 20),
            UserTier::Pro => (10, 2048, 80, 120, 50),
            UserTier::Enterprise => (50, 8192, 100, 500, 200),
        };

        Self {
            user_id: user_id.into(),
            tier,
            max_concurrent_services: concurrent,
            max_memory_mb: memory_mb,
            max_cpu_percent: cpu,
            max_requests_per_minute: per_minute,
            max_services_per_hour: per_hour,
            allowed_ports: None,
            is_blocked: false,
            blocked_reason: None,
        }
    }

    /// Mark the profile blocked.
    #[must_use]
    pub fn blocked(mut self, reason: impl Into<String>) -> Self {
        self.is_blocked = true;
        self.blocked_reason = Some(reason.into());
        self
    }

    /// Restrict the tenant to an explicit port allowlist.
    #[must_use]
    pub fn with_allowed_ports(mut self, ports: Vec<u16>) -> Self {
        self.allowed_ports = Some(ports);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_defaults() {
        let free = UserProfile::from_tier("u1", UserTier::Free);
        assert_eq!(free.max_concurrent_services, 2);
        assert_eq!(free.max_memory_mb, 256);
        assert_eq!(free.max_cpu_percent, 25);
        assert_eq!(free.max_requests_per_minute, 20);
        assert_eq!(free.max_services_per_hour, 5);

        let enterprise = UserProfile::from_tier("u2", UserTier::Enterprise);
        assert_eq!(enterprise.max_concurrent_services, 50);
        assert_eq!(enterprise.max_requests_per_minute, 500);
    }

    #[test]
    fn test_blocked_builder() {
        let profile = UserProfile::from_tier("u1", UserTier::Basic).blocked("abuse");
        assert!(profile.is_blocked);
        assert_eq!(profile.blocked_reason.as_deref(), Some("abuse"));
    }

    #[test]
    fn test_tier_serde_round_trip() {
        let json = serde_json::to_string(&UserTier::Pro).unwrap();
        assert_eq!(json, "\"pro\"");
        let tier: UserTier = serde_json::from_str(&json).unwrap();
        assert_eq!(tier, UserTier::Pro);
    }
}
