//! Dynamic port allocation.
//!
//! A port is considered free when a loopback bind on it succeeds and is
//! immediately released; the OS remains the real authority on availability,
//! so the window between allocation and the child binding is kept short by
//! launching the child immediately after allocation.

use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::Mutex;

use crate::lock;

/// Lowest port the allocator will ever hand out; everything below is
/// privileged or reserved for system services.
pub const MIN_SAFE_PORT: u16 = 1024;

/// Default start of the scan range.
pub const DEFAULT_START_PORT: u16 = 10_000;

/// Default end of the scan range.
pub const DEFAULT_END_PORT: u16 = 65_000;

/// Allocates free TCP ports, remembering what it has already issued so that
/// concurrent allocations never collide before the callee has bound.
#[derive(Debug)]
pub struct PortAllocator {
    start: u16,
    end: u16,
    issued: Mutex<HashSet<u16>>,
}

/// Outcome of a single bind probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BindProbe {
    /// The port accepted a bind and was released.
    Free,
    /// The port is in use.
    InUse,
    /// The bind failed for an unrelated reason (permissions, address
    /// family); skip the port and continue scanning.
    Skip,
}

impl PortAllocator {
    /// Create an allocator over the default range.
    #[must_use]
    pub fn new() -> Self {
        Self::with_range(DEFAULT_START_PORT, DEFAULT_END_PORT)
    }

    /// Create an allocator over `[start, end)`, clamped to the safe range.
    #[must_use]
    pub fn with_range(start: u16, end: u16) -> Self {
        Self {
            start: start.max(MIN_SAFE_PORT),
            end,
            issued: Mutex::new(HashSet::new()),
        }
    }

    /// Allocate a free port.
    ///
    /// The preferred port is chosen when it is given, safe, and currently
    /// free; otherwise the range is scanned upward and the first free port
    /// is returned.
    ///
    /// # Errors
    ///
    /// Returns [`PortError::NoFreePort`] when the entire range is exhausted.
    pub fn allocate(&self, preferred: Option<u16>) -> Result<u16, PortError> {
        let mut issued = lock(&self.issued);

        if let Some(port) = preferred {
            if port >= MIN_SAFE_PORT
                && !issued.contains(&port)
                && probe_bind(port) == BindProbe::Free
            {
                issued.insert(port);
                return Ok(port);
            }
        }

        for port in self.start..self.end {
            if issued.contains(&port) {
                continue;
            }
            match probe_bind(port) {
                BindProbe::Free => {
                    issued.insert(port);
                    return Ok(port);
                },
                BindProbe::InUse | BindProbe::Skip => {},
            }
        }

        Err(PortError::NoFreePort {
            start: self.start,
            end: self.end,
        })
    }

    /// Release an issued port. Pure bookkeeping; the OS decides actual
    /// availability on the next bind.
    pub fn release(&self, port: u16) {
        lock(&self.issued).remove(&port);
    }

    /// Release every issued port.
    pub fn release_all(&self) {
        lock(&self.issued).clear();
    }

    /// Whether a port would currently be handed out as free.
    #[must_use]
    pub fn is_port_free(&self, port: u16) -> bool {
        if lock(&self.issued).contains(&port) {
            return false;
        }
        probe_bind(port) == BindProbe::Free
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

fn probe_bind(port: u16) -> BindProbe {
    match TcpListener::bind((Ipv4Addr::LOCALHOST, port)) {
        Ok(listener) => {
            drop(listener);
            BindProbe::Free
        },
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => BindProbe::InUse,
        Err(_) => BindProbe::Skip,
    }
}

/// Port allocation errors.
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    /// Every port in the configured range is taken.
    #[error("no free ports available in range {start}-{end}")]
    NoFreePort {
        /// Start of the scanned range.
        start: u16,
        /// End of the scanned range.
        end: u16,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preferred_port_honored_when_free() {
        let allocator = PortAllocator::new();
        // Find a port the OS says is free right now.
        let probe = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        assert_eq!(allocator.allocate(Some(port)).unwrap(), port);
    }

    #[test]
    fn test_issued_ports_not_reissued() {
        let allocator = PortAllocator::new();
        let first = allocator.allocate(None).unwrap();
        let second = allocator.allocate(Some(first)).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_bound_preferred_port_falls_back_to_scan() {
        let allocator = PortAllocator::new();
        let holder = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let taken = holder.local_addr().unwrap().port();

        let got = allocator.allocate(Some(taken)).unwrap();
        assert_ne!(got, taken);
        assert!(got >= DEFAULT_START_PORT);
    }

    #[test]
    fn test_privileged_preferred_port_rejected() {
        let allocator = PortAllocator::new();
        let got = allocator.allocate(Some(80)).unwrap();
        assert!(got >= MIN_SAFE_PORT);
        assert_ne!(got, 80);
    }

    #[test]
    fn test_release_allows_reissue() {
        let allocator = PortAllocator::new();
        let port = allocator.allocate(None).unwrap();
        allocator.release(port);
        assert_eq!(allocator.allocate(Some(port)).unwrap(), port);
    }

    #[test]
    fn test_exhausted_range_errors() {
        // A range the allocator cannot use at all: start clamps to 1024 and
        // the scan range [2048, 2048) is empty, while the preferred port is
        // held by a listener.
        let holder = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let taken = holder.local_addr().unwrap().port();

        let allocator = PortAllocator::with_range(2048, 2048);
        let result = allocator.allocate(Some(taken));
        assert!(matches!(result, Err(PortError::NoFreePort { .. })));
    }
}
