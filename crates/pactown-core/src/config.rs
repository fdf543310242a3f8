//! Ecosystem configuration.
//!
//! An ecosystem is described by a YAML document mapping service names to
//! service declarations. Unknown keys are rejected so that typos in a
//! configuration file surface as errors rather than silently ignored
//! settings.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Environment variable overriding the configured sandbox root.
pub const ENV_SANDBOX_ROOT: &str = "PACTOWN_SANDBOX_ROOT";

/// Environment variable overriding the port allocator range
/// (format: `start-end`).
pub const ENV_PORT_RANGE: &str = "PACTOWN_PORT_RANGE";

/// Configuration for a complete pactown ecosystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EcosystemConfig {
    /// Ecosystem name.
    pub name: String,

    /// Ecosystem version.
    #[serde(default = "default_version")]
    pub version: String,

    /// Free-form description.
    #[serde(default)]
    pub description: String,

    /// First port assigned to services that do not declare one.
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// Directory under which sandboxes, the dependency cache, and the
    /// service registry file live.
    #[serde(default = "default_sandbox_root")]
    pub sandbox_root: PathBuf,

    /// Artifact registry settings. Parsed and carried for collaborators;
    /// the engine itself never speaks the registry protocol.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<RegistryConfig>,

    /// Services by name.
    pub services: BTreeMap<String, ServiceConfig>,
}

fn default_version() -> String {
    "0.1.0".to_string()
}

const fn default_base_port() -> u16 {
    8000
}

fn default_sandbox_root() -> PathBuf {
    PathBuf::from("./.pactown-sandboxes")
}

/// Configuration for one service in the ecosystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    /// Service name (filled from the map key on load).
    #[serde(skip)]
    pub name: String,

    /// Path to the annotated Markdown artifact, relative to the config file.
    pub readme: PathBuf,

    /// Preferred port. Services without one receive `base_port + index`.
    #[serde(default)]
    pub port: Option<u16>,

    /// Health endpoint path. Defaults to `/health`; an explicit `null`
    /// disables HTTP probing and readiness falls back to a short
    /// survival window after launch.
    #[serde(default = "default_health_check")]
    pub health_check: Option<String>,

    /// Startup timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Extra environment passed to the service.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Services (or external endpoints) this service depends on.
    #[serde(default)]
    pub depends_on: Vec<DependencyRef>,
}

fn default_health_check() -> Option<String> {
    Some("/health".to_string())
}

const fn default_timeout() -> u64 {
    60
}

/// Reference to a dependency of a service.
///
/// In YAML this is either a bare string (`- db`) or a mapping with an
/// optional endpoint override and environment variable name:
///
/// ```yaml
/// depends_on:
///   - name: db
///     env_var: DATABASE_URL
///   - name: billing
///     endpoint: https://billing.internal:8443
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "DependencyRefDe")]
pub struct DependencyRef {
    /// Name of the dependency.
    pub name: String,

    /// Explicit endpoint override. A dependency that is not part of the
    /// ecosystem must carry one; it is then treated as external.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Name under which the dependency's URL is exposed to the service.
    /// Defaults to `{UPPER(name)}_URL`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_var: Option<String>,
}

impl DependencyRef {
    /// Create a reference to an internal dependency by name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: None,
            env_var: None,
        }
    }

    /// The environment variable name carrying the dependency URL.
    #[must_use]
    pub fn env_var_name(&self) -> String {
        self.env_var
            .clone()
            .unwrap_or_else(|| format!("{}_URL", env_key(&self.name)))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DependencyRefDe {
    Name(String),
    Full(DependencyRefFull),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct DependencyRefFull {
    name: String,
    #[serde(default)]
    endpoint: Option<String>,
    #[serde(default)]
    env_var: Option<String>,
}

impl From<DependencyRefDe> for DependencyRef {
    fn from(de: DependencyRefDe) -> Self {
        match de {
            DependencyRefDe::Name(name) => Self {
                name,
                endpoint: None,
                env_var: None,
            },
            DependencyRefDe::Full(full) => Self {
                name: full.name,
                endpoint: full.endpoint,
                env_var: full.env_var,
            },
        }
    }
}

/// Artifact registry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    /// Registry base URL.
    #[serde(default = "default_registry_url")]
    pub url: String,

    /// Namespace artifacts are published under.
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

fn default_registry_url() -> String {
    "http://localhost:8800".to_string()
}

fn default_namespace() -> String {
    "default".to_string()
}

impl EcosystemConfig {
    /// Load an ecosystem configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file is missing, the YAML is invalid,
    /// a required key is absent or an unknown key is present, or the
    /// configuration fails validation.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    /// Parse an ecosystem configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on parse or validation failure.
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_yaml::from_str(raw)?;
        config.finalize()?;
        Ok(config)
    }

    /// Fill in derived fields and validate invariants.
    fn finalize(&mut self) -> Result<(), ConfigError> {
        if self.services.is_empty() {
            return Err(ConfigError::NoServices);
        }

        if let Ok(root) = std::env::var(ENV_SANDBOX_ROOT) {
            if !root.trim().is_empty() {
                self.sandbox_root = PathBuf::from(root);
            }
        }

        let base_port = self.base_port;
        for (index, (name, service)) in self.services.iter_mut().enumerate() {
            if name.is_empty() || name.contains('/') || name.contains("..") {
                return Err(ConfigError::InvalidServiceName(name.clone()));
            }
            service.name.clone_from(name);
            if service.port.is_none() {
                #[allow(clippy::cast_possible_truncation)] // service counts are small
                let offset = index as u16;
                service.port = Some(base_port.saturating_add(offset));
            }
        }

        Ok(())
    }

    /// Look up a service by name.
    #[must_use]
    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.get(name)
    }
}

/// Parse the `PACTOWN_PORT_RANGE` override, if set.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidPortRange`] if the variable is set but not
/// of the form `start-end` with `start < end`.
pub fn port_range_override() -> Result<Option<(u16, u16)>, ConfigError> {
    let Ok(raw) = std::env::var(ENV_PORT_RANGE) else {
        return Ok(None);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }

    let invalid = || ConfigError::InvalidPortRange(raw.to_string());
    let (start, end) = raw.split_once('-').ok_or_else(invalid)?;
    let start: u16 = start.trim().parse().map_err(|_| invalid())?;
    let end: u16 = end.trim().parse().map_err(|_| invalid())?;
    if start >= end {
        return Err(invalid());
    }

    Ok(Some((start, end)))
}

/// Normalize a service name into an environment variable key segment.
#[must_use]
pub fn env_key(name: &str) -> String {
    name.to_uppercase().replace(['-', '.'], "_")
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        /// Path that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The YAML document was malformed or contained unknown keys.
    #[error("invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// The `services` mapping was empty.
    #[error("config declares no services")]
    NoServices,

    /// A service name was empty or contained path separators.
    #[error("invalid service name: '{0}'")]
    InvalidServiceName(String),

    /// `PACTOWN_PORT_RANGE` was set but malformed.
    #[error("invalid {ENV_PORT_RANGE} value: '{0}' (expected start-end)")]
    InvalidPortRange(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r"
name: demo
services:
  api:
    readme: services/api/README.md
";

    #[test]
    fn test_minimal_config_defaults() {
        let config = EcosystemConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.name, "demo");
        assert_eq!(config.version, "0.1.0");
        assert_eq!(config.base_port, 8000);
        assert_eq!(config.sandbox_root, PathBuf::from("./.pactown-sandboxes"));

        let api = config.service("api").unwrap();
        assert_eq!(api.name, "api");
        assert_eq!(api.port, Some(8000));
        assert_eq!(api.health_check.as_deref(), Some("/health"));
        assert_eq!(api.timeout, 60);
    }

    #[test]
    fn test_default_ports_assigned_in_name_order() {
        let config = EcosystemConfig::from_yaml(
            r"
name: demo
base_port: 9000
services:
  web:
    readme: web.md
  api:
    readme: api.md
    port: 9500
  db:
    readme: db.md
",
        )
        .unwrap();

        // Name order: api, db, web. Explicit ports are kept.
        assert_eq!(config.service("api").unwrap().port, Some(9500));
        assert_eq!(config.service("db").unwrap().port, Some(9001));
        assert_eq!(config.service("web").unwrap().port, Some(9002));
    }

    #[test]
    fn test_explicit_null_health_check_disables_probe() {
        let config = EcosystemConfig::from_yaml(
            r"
name: demo
services:
  worker:
    readme: worker.md
    health_check: null
",
        )
        .unwrap();
        assert!(config.service("worker").unwrap().health_check.is_none());
    }

    #[test]
    fn test_depends_on_string_and_map_forms() {
        let config = EcosystemConfig::from_yaml(
            r"
name: demo
services:
  api:
    readme: api.md
    depends_on:
      - db
      - name: billing
        endpoint: http://10.0.0.5:9999
        env_var: BILLING_URL
",
        )
        .unwrap();

        let deps = &config.service("api").unwrap().depends_on;
        assert_eq!(deps.len(), 2);
        assert_eq!(deps[0].name, "db");
        assert!(deps[0].endpoint.is_none());
        assert_eq!(deps[0].env_var_name(), "DB_URL");
        assert_eq!(deps[1].endpoint.as_deref(), Some("http://10.0.0.5:9999"));
        assert_eq!(deps[1].env_var_name(), "BILLING_URL");
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let result = EcosystemConfig::from_yaml(
            r"
name: demo
flavor: spicy
services:
  api:
    readme: api.md
",
        );
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_empty_services_rejected() {
        let result = EcosystemConfig::from_yaml("name: demo\nservices: {}\n");
        assert!(matches!(result, Err(ConfigError::NoServices)));
    }

    #[test]
    fn test_env_key_normalization() {
        assert_eq!(env_key("user-db.primary"), "USER_DB_PRIMARY");
        assert_eq!(env_key("api"), "API");
    }
}
