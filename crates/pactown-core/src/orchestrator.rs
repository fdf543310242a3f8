//! Top-level orchestration.
//!
//! The [`Orchestrator`] owns every component of the engine (no process
//! globals): the port allocator, the service registry, the dependency
//! cache, the sandbox manager, and optionally a security policy. `up`
//! drives startup in dependency order and aborts with a reverse-order
//! teardown on the first failure; `down` tears everything down
//! best-effort; between the two, supervisor events and a cancellation
//! signal are handled from a single event loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::artifact::Artifact;
use crate::cache::DependencyCache;
use crate::config::{EcosystemConfig, port_range_override};
use crate::error::EngineError;
use crate::net::{EndpointStore, PortAllocator, ServiceRegistry};
use crate::resolver::DependencyResolver;
use crate::sandbox::manager::RunResult;
use crate::sandbox::{ExitEvent, SandboxManager, SandboxState};
use crate::security::SecurityPolicy;

/// Bound on in-registry health checks during `status`.
const STATUS_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Status of one service as reported by [`Orchestrator::status`].
#[derive(Debug, Clone)]
pub struct ServiceStatus {
    /// Service name.
    pub name: String,

    /// Last observed sandbox state, if a sandbox exists.
    pub state: Option<SandboxState>,

    /// Registered port, if any.
    pub port: Option<u16>,

    /// Health probe result, when the service declares a health endpoint
    /// and is registered.
    pub healthy: Option<bool>,
}

/// Top-level coordinator for one ecosystem.
pub struct Orchestrator {
    config: EcosystemConfig,
    base_path: PathBuf,
    registry: Arc<ServiceRegistry>,
    manager: Arc<SandboxManager>,
    security: Option<Arc<SecurityPolicy>>,
    user_id: Option<String>,
    events: mpsc::UnboundedReceiver<ExitEvent>,
    cancel: watch::Sender<bool>,
    http: reqwest::Client,
    started: Vec<String>,
}

impl Orchestrator {
    /// Build an engine for `config`. Relative paths (artifacts, sandbox
    /// root) resolve against `base_path`, typically the configuration
    /// file's directory.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] if the port range override is malformed or
    /// the sandbox root cannot be prepared.
    pub fn new(config: EcosystemConfig, base_path: &Path) -> Result<Self, EngineError> {
        let sandbox_root = if config.sandbox_root.is_absolute() {
            config.sandbox_root.clone()
        } else {
            base_path.join(&config.sandbox_root)
        };

        let allocator = match port_range_override()? {
            Some((start, end)) => PortAllocator::with_range(start, end),
            None => PortAllocator::new(),
        };
        let allocator = Arc::new(allocator);

        let registry = Arc::new(ServiceRegistry::new(&sandbox_root, allocator));
        let cache = Arc::new(DependencyCache::new(
            sandbox_root.join(".cache").join("envs"),
        )?);

        let (events_tx, events) = mpsc::unbounded_channel();
        let (cancel, cancel_rx) = watch::channel(false);

        let manager = Arc::new(SandboxManager::new(
            sandbox_root,
            cache,
            Arc::clone(&registry) as Arc<dyn EndpointStore>,
            events_tx,
            cancel_rx,
        )?);

        // Reconcile the persisted registry against what is actually alive.
        {
            let manager = Arc::clone(&manager);
            registry
                .reload(&move |name| manager.is_live(name))
                .map_err(EngineError::from)?;
        }

        Ok(Self {
            config,
            base_path: base_path.to_path_buf(),
            registry,
            manager,
            security: None,
            user_id: None,
            events,
            cancel,
            http: reqwest::Client::new(),
            started: Vec::new(),
        })
    }

    /// Attach a security policy; every subsequent start for `user_id` goes
    /// through admission.
    #[must_use]
    pub fn with_security(mut self, policy: Arc<SecurityPolicy>, user_id: impl Into<String>) -> Self {
        self.security = Some(policy);
        self.user_id = Some(user_id.into());
        self
    }

    /// The ecosystem configuration.
    #[must_use]
    pub fn config(&self) -> &EcosystemConfig {
        &self.config
    }

    /// The service registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// The sandbox manager.
    #[must_use]
    pub fn manager(&self) -> &Arc<SandboxManager> {
        &self.manager
    }

    /// Validate the ecosystem without starting anything. Returns the list
    /// of problems found; an empty list means the ecosystem is valid.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        match DependencyResolver::new(&self.config) {
            Ok(resolver) => {
                if let Err(e) = resolver.start_order() {
                    issues.push(e.to_string());
                }
            },
            Err(e) => issues.push(e.to_string()),
        }

        for service in self.config.services.values() {
            let readme = self.base_path.join(&service.readme);
            if !readme.is_file() {
                issues.push(format!(
                    "artifact not found for '{}': {}",
                    service.name,
                    readme.display()
                ));
            }
        }

        issues
    }

    /// Render the dependency graph.
    #[must_use]
    pub fn render_graph(&self) -> String {
        match DependencyResolver::new(&self.config) {
            Ok(resolver) => resolver.render_graph(&self.config),
            Err(e) => format!("Ecosystem: {}\n\n  ({e})", self.config.name),
        }
    }

    /// Start every service in dependency order.
    ///
    /// If any service fails to become healthy within its timeout, startup
    /// aborts and everything started so far is torn down in reverse order;
    /// the triggering error and any secondary teardown errors are reported
    /// together.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] on resolution, admission, or startup
    /// failure.
    pub async fn up(&mut self) -> Result<(), EngineError> {
        let resolver = DependencyResolver::new(&self.config)?;
        let order = resolver.start_order()?;

        info!(
            ecosystem = %self.config.name,
            order = ?order,
            "starting ecosystem"
        );

        for name in order {
            if let Err(cause) = self.start_service(&name).await {
                error!(service = %name, error = %cause, "startup failed, tearing down");
                let teardown_errors = self.teardown_started().await;
                return Err(EngineError::Aborted {
                    cause: Box::new(cause),
                    teardown_errors,
                });
            }
            self.started.push(name);
        }

        info!(ecosystem = %self.config.name, "ecosystem up");
        Ok(())
    }

    /// Start one service: admission, port allocation, materialization,
    /// environment composition, launch, and readiness.
    async fn start_service(&mut self, name: &str) -> Result<(), EngineError> {
        let spec = self
            .config
            .service(name)
            .cloned()
            .ok_or_else(|| EngineError::Validation {
                issues: vec![format!("unknown service '{name}' in start order")],
            })?;

        // (1) Security admission.
        if let (Some(policy), Some(user_id)) = (&self.security, &self.user_id) {
            let decision = policy.check_can_start(user_id, name, spec.port);
            if !decision.allowed {
                return Err(EngineError::PolicyDenied {
                    service: name.to_string(),
                    reason: decision
                        .reason
                        .unwrap_or_else(|| "denied by policy".to_string()),
                });
            }
            if decision.delay > Duration::ZERO {
                warn!(service = name, delay = ?decision.delay, "throttled by policy");
                tokio::time::sleep(decision.delay).await;
            }
        }

        let artifact = Artifact::from_file(&self.base_path.join(&spec.readme))?;

        // (2) Port allocation through registration.
        let endpoint = self
            .registry
            .register(name, spec.port, spec.health_check.clone())?;

        // (3) Sandbox materialization.
        if let Err(e) = self.manager.create(name, &artifact).await {
            self.registry.unregister(name);
            return Err(e.into());
        }

        // (4) Environment: registry-derived discovery over the service's
        // extension map (discovery keys win).
        let mut env = spec.env.clone();
        env.extend(self.registry.environment_for(name, &spec.depends_on));

        // (5) Launch and (6) readiness.
        let result = self
            .manager
            .start(
                name,
                endpoint.port,
                env,
                spec.health_check.as_deref(),
                Duration::from_secs(spec.timeout),
            )
            .await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                self.registry.unregister(name);
                return Err(e.into());
            },
        };

        match outcome {
            RunResult::Healthy { .. } => {
                if let (Some(policy), Some(user_id)) = (&self.security, &self.user_id) {
                    policy.record_start(user_id, name);
                }
                Ok(())
            },
            RunResult::HealthTimeout { .. } => {
                self.registry.unregister(name);
                Err(EngineError::HealthTimeout {
                    service: name.to_string(),
                    timeout_secs: spec.timeout,
                })
            },
            RunResult::Exited { status } => {
                self.registry.unregister(name);
                Err(EngineError::ProcessExited {
                    service: name.to_string(),
                    status,
                })
            },
            RunResult::Cancelled => {
                self.registry.unregister(name);
                Err(EngineError::Interrupted {
                    service: name.to_string(),
                })
            },
        }
    }

    /// Stop every service in reverse dependency order, best-effort: each
    /// stop is attempted even if earlier ones errored.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Teardown`] aggregating any stop failures.
    pub async fn down(&mut self) -> Result<(), EngineError> {
        let order = match DependencyResolver::new(&self.config)
            .and_then(|resolver| resolver.shutdown_order())
        {
            Ok(order) => order,
            // A cyclic or invalid graph must not block teardown.
            Err(_) => {
                let mut names: Vec<String> = self.config.services.keys().cloned().collect();
                names.reverse();
                names
            },
        };

        info!(ecosystem = %self.config.name, "stopping ecosystem");
        let mut errors = Vec::new();
        for name in order {
            if let Err(e) = self.manager.stop(&name).await {
                errors.push(format!("{name}: {e}"));
            }
            self.registry.unregister(&name);
            if let (Some(policy), Some(user_id)) = (&self.security, &self.user_id) {
                policy.record_stop(user_id, &name);
            }
        }
        self.started.clear();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Teardown { errors })
        }
    }

    /// Tear down the services started so far, in reverse start order,
    /// collecting secondary errors.
    async fn teardown_started(&mut self) -> Vec<String> {
        let mut errors = Vec::new();
        for name in self.started.clone().into_iter().rev() {
            if let Err(e) = self.manager.stop(&name).await {
                errors.push(format!("{name}: {e}"));
            }
            self.registry.unregister(&name);
            if let (Some(policy), Some(user_id)) = (&self.security, &self.user_id) {
                policy.record_stop(user_id, &name);
            }
        }
        self.started.clear();
        errors
    }

    /// Status of every configured service.
    pub async fn status(&self) -> Vec<ServiceStatus> {
        let mut statuses = Vec::with_capacity(self.config.services.len());
        for name in self.config.services.keys() {
            let state = self.manager.status(name);
            let endpoint = self.registry.get(name);
            let port = endpoint.as_ref().map(|e| e.port);

            let healthy = match endpoint.as_ref().and_then(|e| e.health_url()) {
                Some(url) => Some(self.probe_once(&url).await),
                None => None,
            };

            statuses.push(ServiceStatus {
                name: name.clone(),
                state,
                port,
                healthy,
            });
        }
        statuses
    }

    async fn probe_once(&self, url: &str) -> bool {
        match self
            .http
            .get(url)
            .timeout(STATUS_PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().as_u16() < 400,
            Err(_) => false,
        }
    }

    /// Remain active after `up`: handle supervisor exit events and tear the
    /// ecosystem down when the shutdown signal arrives.
    ///
    /// # Errors
    ///
    /// Returns any teardown error once shutdown completes.
    pub async fn run_until_shutdown(&mut self) -> Result<(), EngineError> {
        loop {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    if let Err(e) = signal {
                        error!(error = %e, "failed to listen for shutdown signal");
                    }
                    info!("shutdown signal received");
                    let _ = self.cancel.send(true);
                    return self.down().await;
                },
                event = self.events.recv() => {
                    match event {
                        Some(ExitEvent { name, status }) => {
                            warn!(service = %name, status, "service exited");
                            self.started.retain(|started| started != &name);
                            if let (Some(policy), Some(user_id)) = (&self.security, &self.user_id) {
                                policy.record_stop(user_id, &name);
                            }
                        },
                        None => {
                            // All senders gone; nothing left to supervise.
                            return Ok(());
                        },
                    }
                },
            }
        }
    }

    /// Request cancellation of in-flight probes and starts.
    pub fn request_shutdown(&self) {
        let _ = self.cancel.send(true);
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("ecosystem", &self.config.name)
            .field("base_path", &self.base_path)
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}
