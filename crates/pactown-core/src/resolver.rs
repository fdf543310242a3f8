//! Dependency resolution.
//!
//! Orders the services of an ecosystem so that every service starts after
//! everything it depends on. Ordering is deterministic: among services whose
//! dependencies are all satisfied, the alphabetically first name is emitted
//! next, so repeated runs produce identical startup traces.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::EcosystemConfig;

/// Resolves dependencies between services in an ecosystem.
#[derive(Debug)]
pub struct DependencyResolver {
    /// Internal dependency edges: service -> set of services it depends on.
    graph: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyResolver {
    /// Build a resolver from an ecosystem configuration.
    ///
    /// A `depends_on` entry naming a service that is not part of the
    /// ecosystem is an error unless the reference carries an explicit
    /// endpoint, in which case the edge is external: it imposes no ordering
    /// constraint, but environment injection still applies.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::UnknownDependency`] for an internal reference
    /// to an absent service.
    pub fn new(config: &EcosystemConfig) -> Result<Self, ResolveError> {
        let mut graph: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for (name, service) in &config.services {
            let mut deps = BTreeSet::new();
            for dep in &service.depends_on {
                if config.services.contains_key(&dep.name) {
                    deps.insert(dep.name.clone());
                } else if dep.endpoint.is_none() {
                    return Err(ResolveError::UnknownDependency {
                        service: name.clone(),
                        dependency: dep.name.clone(),
                    });
                }
            }
            graph.insert(name.clone(), deps);
        }

        Ok(Self { graph })
    }

    /// Services in topological order for startup.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::CycleDetected`] naming the unresolved
    /// services if the graph contains a cycle.
    pub fn start_order(&self) -> Result<Vec<String>, ResolveError> {
        let mut in_degree: BTreeMap<&str, usize> = self
            .graph
            .iter()
            .map(|(name, deps)| (name.as_str(), deps.len()))
            .collect();

        // BTreeSet keeps the ready set sorted, which gives the alphabetical
        // tie-break for free.
        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(name, _)| *name)
            .collect();

        let mut order = Vec::with_capacity(self.graph.len());

        while let Some(&current) = ready.iter().next() {
            ready.remove(current);
            order.push(current.to_string());

            for (name, deps) in &self.graph {
                if deps.contains(current) {
                    let degree = in_degree
                        .entry(name.as_str())
                        .or_insert(0);
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        ready.insert(name.as_str());
                    }
                }
            }
        }

        if order.len() != self.graph.len() {
            let emitted: BTreeSet<&str> = order.iter().map(String::as_str).collect();
            let names = self
                .graph
                .keys()
                .filter(|name| !emitted.contains(name.as_str()))
                .cloned()
                .collect();
            return Err(ResolveError::CycleDetected { names });
        }

        Ok(order)
    }

    /// Services in reverse order for shutdown.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::CycleDetected`] if the graph contains a cycle.
    pub fn shutdown_order(&self) -> Result<Vec<String>, ResolveError> {
        let mut order = self.start_order()?;
        order.reverse();
        Ok(order)
    }

    /// ASCII rendering of the dependency graph, in start order when the
    /// graph is acyclic and in name order otherwise.
    #[must_use]
    pub fn render_graph(&self, config: &EcosystemConfig) -> String {
        let order = self
            .start_order()
            .unwrap_or_else(|_| self.graph.keys().cloned().collect());

        let mut lines = vec![format!("Ecosystem: {}", config.name), String::new()];
        for name in order {
            let Some(service) = config.service(&name) else {
                continue;
            };
            let deps: Vec<&str> = service
                .depends_on
                .iter()
                .map(|d| d.name.as_str())
                .collect();
            let port = service
                .port
                .map(|p| format!(":{p}"))
                .unwrap_or_default();

            if deps.is_empty() {
                lines.push(format!("  [{name}{port}] (no deps)"));
            } else {
                lines.push(format!("  [{name}{port}] <- {}", deps.join(", ")));
            }
        }
        lines.join("\n")
    }
}

/// Resolution errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    /// The dependency graph has a cycle.
    #[error("circular dependency detected involving: {}", names.join(", "))]
    CycleDetected {
        /// Services that could not be ordered.
        names: Vec<String>,
    },

    /// A service depends on something that is neither in the ecosystem nor
    /// declared external via an explicit endpoint.
    #[error("service '{service}' depends on unknown service '{dependency}'")]
    UnknownDependency {
        /// Service carrying the bad reference.
        service: String,
        /// The missing dependency name.
        dependency: String,
    },
}
