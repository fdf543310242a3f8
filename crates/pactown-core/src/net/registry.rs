//! Service registry for name-based discovery.
//!
//! Services register with their name and get assigned a port; peers look up
//! endpoints by name and receive them through injected environment
//! variables. The registry persists to
//! `<sandbox_root>/.pactown-services.json` with an atomic replace on every
//! mutation so readers never see a partial document.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::port::{PortAllocator, PortError};
use super::{LOOPBACK_HOST, ServiceEndpoint};
use crate::config::{DependencyRef, env_key};
use crate::fsio;
use crate::lock;

/// File name of the persisted registry under the sandbox root.
pub const REGISTRY_FILE_NAME: &str = ".pactown-services.json";

/// Narrow capability handed to the sandbox manager: it may register,
/// unregister, and look up endpoints, and nothing else. The registry never
/// calls back into the manager.
pub trait EndpointStore: Send + Sync {
    /// Register a service, allocating a port for it.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when no port can be allocated or the
    /// registry cannot be persisted.
    fn register(
        &self,
        name: &str,
        preferred_port: Option<u16>,
        health_check: Option<String>,
    ) -> Result<ServiceEndpoint, RegistryError>;

    /// Remove a service's endpoint and release its port. Unknown names are
    /// a no-op.
    fn unregister(&self, name: &str);

    /// Look up an endpoint by name.
    fn get(&self, name: &str) -> Option<ServiceEndpoint>;
}

/// Wire format of the persisted registry document.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedRegistry {
    services: BTreeMap<String, ServiceEndpoint>,
}

/// Local service registry.
pub struct ServiceRegistry {
    host: String,
    storage_path: PathBuf,
    allocator: Arc<PortAllocator>,
    services: Mutex<BTreeMap<String, ServiceEndpoint>>,
}

impl ServiceRegistry {
    /// Create a registry persisting under `sandbox_root`, allocating ports
    /// from `allocator`.
    #[must_use]
    pub fn new(sandbox_root: &Path, allocator: Arc<PortAllocator>) -> Self {
        Self {
            host: LOOPBACK_HOST.to_string(),
            storage_path: sandbox_root.join(REGISTRY_FILE_NAME),
            allocator,
            services: Mutex::new(BTreeMap::new()),
        }
    }

    /// Path of the persisted registry document.
    #[must_use]
    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    /// Reload the persisted registry, keeping only entries whose service is
    /// still alive according to `alive`. Entries for dead services are
    /// dropped silently. Returns the number of live entries retained.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Persist`] if the reconciled document cannot
    /// be written back.
    pub fn reload(&self, alive: &dyn Fn(&str) -> bool) -> Result<usize, RegistryError> {
        let persisted = match std::fs::read(&self.storage_path) {
            Ok(bytes) => match serde_json::from_slice::<PersistedRegistry>(&bytes) {
                Ok(doc) => doc,
                Err(e) => {
                    warn!(error = %e, "registry file corrupt, starting empty");
                    PersistedRegistry::default()
                },
            },
            Err(_) => PersistedRegistry::default(),
        };

        let mut retained = 0;
        {
            let mut services = lock(&self.services);
            services.clear();
            for (name, endpoint) in persisted.services {
                if alive(&name) {
                    services.insert(name, endpoint);
                    retained += 1;
                } else {
                    debug!(service = %name, "dropping stale registry entry");
                }
            }
        }
        self.persist()?;
        Ok(retained)
    }

    /// All registered endpoints, sorted by name.
    #[must_use]
    pub fn list(&self) -> Vec<ServiceEndpoint> {
        lock(&self.services).values().cloned().collect()
    }

    /// Compose the environment a service sees.
    ///
    /// For every declared dependency `d` this contains `{D}_URL`,
    /// `{D}_HOST`, and `{D}_PORT`, plus the dependency's `env_var` name
    /// bound to the URL. An explicit endpoint override replaces the URL;
    /// host and port are then derived from the override when it parses,
    /// and omitted otherwise. The service's own endpoint contributes
    /// `MARKPACT_PORT`, `PORT`, `SERVICE_NAME`, and `SERVICE_URL`.
    #[must_use]
    pub fn environment_for(
        &self,
        service_name: &str,
        deps: &[DependencyRef],
    ) -> BTreeMap<String, String> {
        let services = lock(&self.services);
        let mut env = BTreeMap::new();

        if let Some(own) = services.get(service_name) {
            env.insert("MARKPACT_PORT".to_string(), own.port.to_string());
            env.insert("PORT".to_string(), own.port.to_string());
            env.insert("SERVICE_NAME".to_string(), service_name.to_string());
            env.insert("SERVICE_URL".to_string(), own.url());
        }

        for dep in deps {
            let key = env_key(&dep.name);

            let (url, host_port) = if let Some(endpoint) = &dep.endpoint {
                (Some(endpoint.clone()), parse_host_port(endpoint))
            } else if let Some(found) = services.get(&dep.name) {
                (Some(found.url()), Some((found.host.clone(), found.port)))
            } else {
                (None, None)
            };

            let Some(url) = url else { continue };

            env.insert(format!("{key}_URL"), url.clone());
            if let Some((host, port)) = host_port {
                env.insert(format!("{key}_HOST"), host);
                env.insert(format!("{key}_PORT"), port.to_string());
            }
            env.insert(dep.env_var_name(), url);
        }

        env
    }

    /// Persist the current registry state.
    fn persist(&self) -> Result<(), RegistryError> {
        let doc = PersistedRegistry {
            services: lock(&self.services).clone(),
        };
        fsio::atomic_write_json(&self.storage_path, &doc).map_err(RegistryError::Persist)
    }
}

impl EndpointStore for ServiceRegistry {
    fn register(
        &self,
        name: &str,
        preferred_port: Option<u16>,
        health_check: Option<String>,
    ) -> Result<ServiceEndpoint, RegistryError> {
        let endpoint = {
            let mut services = lock(&self.services);

            // Re-registration replaces the old entry and releases its port.
            if let Some(existing) = services.remove(name) {
                self.allocator.release(existing.port);
            }

            let port = self.allocator.allocate(preferred_port)?;
            let endpoint = ServiceEndpoint {
                name: name.to_string(),
                host: self.host.clone(),
                port,
                health_check,
            };
            services.insert(name.to_string(), endpoint.clone());
            endpoint
        };

        if let Err(e) = self.persist() {
            // Roll back so a persistence failure never leaves a phantom
            // endpoint registered in memory only.
            lock(&self.services).remove(name);
            self.allocator.release(endpoint.port);
            return Err(e);
        }

        debug!(service = name, port = endpoint.port, "registered endpoint");
        Ok(endpoint)
    }

    fn unregister(&self, name: &str) {
        let removed = lock(&self.services).remove(name);
        if let Some(endpoint) = removed {
            self.allocator.release(endpoint.port);
            if let Err(e) = self.persist() {
                warn!(service = name, error = %e, "failed to persist registry after unregister");
            }
            debug!(service = name, "unregistered endpoint");
        }
    }

    fn get(&self, name: &str) -> Option<ServiceEndpoint> {
        lock(&self.services).get(name).cloned()
    }
}

/// Parse `host` and `port` out of a `scheme://host:port[/...]` URL.
fn parse_host_port(url: &str) -> Option<(String, u16)> {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let authority = rest.split(['/', '?']).next()?;
    let (host, port) = authority.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}

/// Registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Port allocation failed.
    #[error(transparent)]
    Port(#[from] PortError),

    /// The registry document could not be written.
    #[error("failed to persist registry: {0}")]
    Persist(#[source] fsio::FsIoError),
}
