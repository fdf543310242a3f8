//! Network layer: port allocation and service discovery.

pub mod port;
pub mod registry;

use serde::{Deserialize, Serialize};

pub use port::{PortAllocator, PortError};
pub use registry::{EndpointStore, RegistryError, ServiceRegistry};

/// Host services bind to and are probed on.
pub const LOOPBACK_HOST: &str = "127.0.0.1";

/// A running service's network endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    /// Service name.
    pub name: String,

    /// Host the service is reachable on.
    pub host: String,

    /// Bound TCP port.
    pub port: u16,

    /// Health endpoint path, if the service declares one.
    pub health_check: Option<String>,
}

impl ServiceEndpoint {
    /// Base URL of the service.
    #[must_use]
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Full health probe URL, if a health path is declared.
    #[must_use]
    pub fn health_url(&self) -> Option<String> {
        self.health_check
            .as_ref()
            .map(|path| format!("{}{path}", self.url()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_urls() {
        let endpoint = ServiceEndpoint {
            name: "db".into(),
            host: LOOPBACK_HOST.into(),
            port: 8003,
            health_check: Some("/health".into()),
        };
        assert_eq!(endpoint.url(), "http://127.0.0.1:8003");
        assert_eq!(
            endpoint.health_url().as_deref(),
            Some("http://127.0.0.1:8003/health")
        );
    }

    #[test]
    fn test_endpoint_without_health_path() {
        let endpoint = ServiceEndpoint {
            name: "worker".into(),
            host: LOOPBACK_HOST.into(),
            port: 9000,
            health_check: None,
        };
        assert!(endpoint.health_url().is_none());
    }
}
