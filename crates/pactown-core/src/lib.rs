//! # pactown-core
//!
//! Core library for pactown - an orchestrator that turns a set of
//! co-operating service declarations into a running ecosystem on a single
//! host.
//!
//! Each service is materialized into an isolated filesystem sandbox with a
//! cached dependency environment, started in dependency order, handed
//! discovery information for the services it depends on, supervised while it
//! runs, and torn down in reverse order on shutdown.
//!
//! ## Features
//!
//! - **Dependency resolution**: Topological start order with cycle detection
//! - **Service discovery**: Port allocation and endpoint registry with
//!   environment injection
//! - **Sandboxing**: Per-service workspaces sharing cached dependency
//!   environments
//! - **Supervision**: Signal-aware process lifecycle with structured failure
//!   capture
//! - **Admission control**: Per-tenant rate limits, quotas, and load
//!   throttling
//!
//! ## Example
//!
//! ```rust,no_run
//! use pactown_core::config::EcosystemConfig;
//! use pactown_core::orchestrator::Orchestrator;
//!
//! # async fn run() -> Result<(), pactown_core::error::EngineError> {
//! let config = EcosystemConfig::from_file("saas.pactown.yaml".as_ref())?;
//! let mut engine = Orchestrator::new(config, ".".as_ref())?;
//! engine.up().await?;
//! engine.run_until_shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod artifact;
pub mod cache;
pub mod config;
pub mod error;
pub mod fsio;
pub mod net;
pub mod orchestrator;
pub mod resolver;
pub mod sandbox;
pub mod security;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::artifact::Artifact;
    pub use crate::config::{EcosystemConfig, ServiceConfig};
    pub use crate::error::EngineError;
    pub use crate::net::{PortAllocator, ServiceEndpoint, ServiceRegistry};
    pub use crate::orchestrator::Orchestrator;
    pub use crate::sandbox::{SandboxManager, SandboxState};
    pub use crate::security::SecurityPolicy;
}

/// Re-export commonly used types at the crate root.
pub use config::EcosystemConfig;
pub use error::EngineError;
pub use orchestrator::Orchestrator;

/// Lock a mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
