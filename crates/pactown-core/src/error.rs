//! Engine error taxonomy.
//!
//! Errors are categorized, not thrown: every failure the engine can
//! produce maps to one variant here, and each variant maps to a process
//! exit code for the CLI surface.

use crate::artifact::ArtifactError;
use crate::cache::CacheError;
use crate::config::ConfigError;
use crate::net::RegistryError;
use crate::resolver::ResolveError;
use crate::sandbox::SandboxError;

/// Exit code for user errors (bad config, missing file).
pub const EXIT_USER_ERROR: i32 = 1;

/// Exit code for runtime failures (service failed to become healthy).
pub const EXIT_RUNTIME_FAILURE: i32 = 2;

/// Exit code for policy denials.
pub const EXIT_POLICY_DENIED: i32 = 3;

/// Top-level engine errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration problem.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Dependency resolution failure (cycle or unknown dependency).
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// Artifact problem.
    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    /// Pre-flight validation found problems.
    #[error("validation failed: {}", issues.join("; "))]
    Validation {
        /// The problems found.
        issues: Vec<String>,
    },

    /// Registry or port allocation failure.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Sandbox failure.
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    /// Dependency cache failure.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// A service did not become healthy within its startup timeout.
    #[error("service '{service}' failed its health check within {timeout_secs}s")]
    HealthTimeout {
        /// The failing service.
        service: String,
        /// The configured timeout.
        timeout_secs: u64,
    },

    /// A service's process died during startup.
    #[error("service '{service}' exited during startup (status {status})")]
    ProcessExited {
        /// The failing service.
        service: String,
        /// Raw exit status; negative values encode the terminating signal.
        status: i32,
    },

    /// Shutdown was requested while a service was starting.
    #[error("startup of '{service}' interrupted by shutdown")]
    Interrupted {
        /// The service that was starting.
        service: String,
    },

    /// The security policy denied the start.
    #[error("policy denied start of '{service}': {reason}")]
    PolicyDenied {
        /// The denied service.
        service: String,
        /// Reason reported by the policy.
        reason: String,
    },

    /// Startup failed and the already-started services were torn down.
    #[error("startup aborted: {cause}{}", render_secondary(teardown_errors))]
    Aborted {
        /// The error that triggered the abort.
        cause: Box<EngineError>,
        /// Secondary errors from the reverse-order teardown.
        teardown_errors: Vec<String>,
    },

    /// Teardown finished, but some stops failed.
    #[error("teardown completed with errors: {}", errors.join("; "))]
    Teardown {
        /// Per-service stop errors.
        errors: Vec<String>,
    },

    /// I/O failure outside any more specific category.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn render_secondary(errors: &[String]) -> String {
    if errors.is_empty() {
        String::new()
    } else {
        format!(" (teardown errors: {})", errors.join("; "))
    }
}

impl EngineError {
    /// Exit code for the CLI surface: 1 for user errors, 2 for runtime
    /// failures, 3 for policy denials.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Resolve(_) | Self::Artifact(_) | Self::Validation { .. } => {
                EXIT_USER_ERROR
            },
            Self::PolicyDenied { .. } => EXIT_POLICY_DENIED,
            Self::Aborted { cause, .. } => cause.exit_code(),
            Self::Registry(_)
            | Self::Sandbox(_)
            | Self::Cache(_)
            | Self::HealthTimeout { .. }
            | Self::ProcessExited { .. }
            | Self::Interrupted { .. }
            | Self::Teardown { .. }
            | Self::Io(_) => EXIT_RUNTIME_FAILURE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(EngineError::from(ConfigError::NoServices).exit_code(), 1);
        assert_eq!(
            EngineError::Resolve(ResolveError::CycleDetected { names: vec![] }).exit_code(),
            1
        );
        assert_eq!(
            EngineError::HealthTimeout {
                service: "api".into(),
                timeout_secs: 2
            }
            .exit_code(),
            2
        );
        assert_eq!(
            EngineError::PolicyDenied {
                service: "api".into(),
                reason: "blocked".into()
            }
            .exit_code(),
            3
        );
    }

    #[test]
    fn test_aborted_inherits_cause_code() {
        let aborted = EngineError::Aborted {
            cause: Box::new(EngineError::PolicyDenied {
                service: "api".into(),
                reason: "blocked".into(),
            }),
            teardown_errors: vec!["db: stop failed".into()],
        };
        assert_eq!(aborted.exit_code(), 3);
        let rendered = aborted.to_string();
        assert!(rendered.contains("policy denied"));
        assert!(rendered.contains("db: stop failed"));
    }
}
