//! Dependency environment cache.
//!
//! Prepared runtime environments are keyed by the content hash of their
//! sorted dependency list and shared across sandboxes: two services
//! declaring the same dependencies in any order receive the same on-disk
//! environment through a link, never two copies. Entries are reference
//! counted; only unreferenced entries are ever evicted.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::lock;

/// Default maximum number of cached environments.
pub const DEFAULT_MAX_ENTRIES: usize = 20;

/// Default maximum entry age in hours.
pub const DEFAULT_MAX_AGE_HOURS: u64 = 24;

/// Marker file inside each cached environment listing its dependencies.
const DEPS_MARKER: &str = ".deps";

/// Name of the link to the cached environment inside a sandbox.
pub const ENV_LINK_NAME: &str = ".env";

/// A prepared environment shared across sandboxes.
#[derive(Debug, Clone)]
pub struct CachedEnv {
    /// Content hash of the sorted dependency list (hex).
    pub hash: String,

    /// Directory holding the environment.
    pub path: PathBuf,

    /// The normalized dependency list.
    pub dep_list: Vec<String>,

    /// When the environment was created.
    pub created_at: SystemTime,

    /// Sandboxes currently linking to this environment.
    pub ref_count: u32,
}

/// A live lease on a cached environment, handed to a sandbox.
#[derive(Debug, Clone)]
pub struct EnvLease {
    /// Hash identifying the environment.
    pub hash: String,

    /// Directory holding the environment.
    pub path: PathBuf,

    /// Whether an existing environment was reused.
    pub reused: bool,
}

/// Hash-keyed reusable runtime environments.
pub struct DependencyCache {
    root: PathBuf,
    max_entries: usize,
    max_age: Duration,
    entries: Mutex<HashMap<String, CachedEnv>>,
}

impl DependencyCache {
    /// Open (or create) a cache rooted at `root`, rescanning any
    /// environments left over from earlier runs.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the cache root cannot be created.
    pub fn new(root: PathBuf) -> Result<Self, CacheError> {
        Self::with_limits(
            root,
            DEFAULT_MAX_ENTRIES,
            Duration::from_secs(DEFAULT_MAX_AGE_HOURS * 3600),
        )
    }

    /// Open a cache with explicit eviction limits.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the cache root cannot be created.
    pub fn with_limits(
        root: PathBuf,
        max_entries: usize,
        max_age: Duration,
    ) -> Result<Self, CacheError> {
        std::fs::create_dir_all(&root).map_err(|source| CacheError::Io {
            context: format!("create cache root {}", root.display()),
            source,
        })?;

        let cache = Self {
            root,
            max_entries,
            max_age,
            entries: Mutex::new(HashMap::new()),
        };
        cache.rescan();
        Ok(cache)
    }

    /// Compute the cache key for a dependency list: the SHA-256 of the
    /// newline-joined, normalized, sorted list. Declaring the same deps in
    /// any order therefore yields the same key.
    #[must_use]
    pub fn key(deps: &[String]) -> String {
        let joined = normalize(deps).join("\n");
        let digest = Sha256::digest(joined.as_bytes());
        format!("{digest:x}")
    }

    /// Get or create the environment for `deps`, bumping its reference
    /// count. The lease must be paired with a [`release`](Self::release).
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if a new environment cannot be prepared on
    /// disk.
    pub fn acquire(&self, deps: &[String]) -> Result<EnvLease, CacheError> {
        let normalized = normalize(deps);
        let hash = Self::key(deps);

        let mut entries = lock(&self.entries);
        self.evict_locked(&mut entries);

        if let Some(entry) = entries.get_mut(&hash) {
            if entry.path.is_dir() {
                entry.ref_count += 1;
                debug!(hash = short(&hash), refs = entry.ref_count, "env cache hit");
                return Ok(EnvLease {
                    hash,
                    path: entry.path.clone(),
                    reused: true,
                });
            }
            // Directory vanished underneath us; rebuild below.
            entries.remove(&hash);
        }

        let path = self.root.join(short(&hash));
        std::fs::create_dir_all(&path).map_err(|source| CacheError::Io {
            context: format!("create env dir {}", path.display()),
            source,
        })?;
        let marker = path.join(DEPS_MARKER);
        std::fs::write(&marker, normalized.join("\n") + "\n").map_err(|source| {
            CacheError::Io {
                context: format!("write deps marker {}", marker.display()),
                source,
            }
        })?;

        info!(hash = short(&hash), deps = normalized.len(), "prepared new env");
        entries.insert(
            hash.clone(),
            CachedEnv {
                hash: hash.clone(),
                path: path.clone(),
                dep_list: normalized,
                created_at: SystemTime::now(),
                ref_count: 1,
            },
        );
        self.evict_locked(&mut entries);

        Ok(EnvLease {
            hash,
            path,
            reused: false,
        })
    }

    /// Release a lease obtained from [`acquire`](Self::acquire).
    ///
    /// The reference count never goes negative: an unmatched release is
    /// logged and ignored.
    pub fn release(&self, hash: &str) {
        let mut entries = lock(&self.entries);
        match entries.get_mut(hash) {
            Some(entry) if entry.ref_count > 0 => {
                entry.ref_count -= 1;
                debug!(hash = short(hash), refs = entry.ref_count, "env lease released");
            },
            Some(_) | None => {
                warn!(hash = short(hash), "release without matching acquire");
            },
        }
    }

    /// Current reference count for an environment, if cached.
    #[must_use]
    pub fn ref_count(&self, hash: &str) -> Option<u32> {
        lock(&self.entries).get(hash).map(|e| e.ref_count)
    }

    /// Number of cached environments.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    /// Whether the cache holds no environments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    /// Evict unreferenced entries that are expired, then enforce the entry
    /// limit oldest-first. In-use entries are never evicted; if everything
    /// is in use the cache simply grows past its nominal limit.
    fn evict_locked(&self, entries: &mut HashMap<String, CachedEnv>) {
        let now = SystemTime::now();
        let expired: Vec<String> = entries
            .values()
            .filter(|e| {
                e.ref_count == 0
                    && now
                        .duration_since(e.created_at)
                        .is_ok_and(|age| age > self.max_age)
            })
            .map(|e| e.hash.clone())
            .collect();
        for hash in expired {
            self.remove_entry(entries, &hash, "expired");
        }

        while entries.len() > self.max_entries {
            let oldest = entries
                .values()
                .filter(|e| e.ref_count == 0)
                .min_by_key(|e| e.created_at)
                .map(|e| e.hash.clone());
            let Some(hash) = oldest else { break };
            self.remove_entry(entries, &hash, "over capacity");
        }
    }

    fn remove_entry(&self, entries: &mut HashMap<String, CachedEnv>, hash: &str, why: &str) {
        if let Some(entry) = entries.remove(hash) {
            debug!(hash = short(hash), why, "evicting env");
            if let Err(e) = std::fs::remove_dir_all(&entry.path) {
                warn!(hash = short(hash), error = %e, "failed to remove evicted env");
            }
        }
    }

    /// Rebuild the in-memory index from environments already on disk.
    fn rescan(&self) {
        let Ok(dir) = std::fs::read_dir(&self.root) else {
            return;
        };

        let mut entries = lock(&self.entries);
        for item in dir.flatten() {
            let path = item.path();
            let marker = path.join(DEPS_MARKER);
            if !path.is_dir() || !marker.is_file() {
                continue;
            }
            let Ok(raw) = std::fs::read_to_string(&marker) else {
                continue;
            };
            let deps: Vec<String> = raw.lines().map(str::to_string).collect();
            let hash = Self::key(&deps);
            let created_at = item
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or_else(|_| SystemTime::now());

            entries.insert(
                hash.clone(),
                CachedEnv {
                    hash,
                    path,
                    dep_list: normalize(&deps),
                    created_at,
                    ref_count: 0,
                },
            );
        }
        if !entries.is_empty() {
            info!(count = entries.len(), "rescanned cached envs");
        }
    }
}

/// Link a cached environment into a sandbox at [`ENV_LINK_NAME`].
///
/// A symbolic link is preferred; when links are unavailable the environment
/// is copied instead.
///
/// # Errors
///
/// Returns [`CacheError`] if neither linking nor copying succeeds.
pub fn link_env(env_path: &Path, sandbox_path: &Path) -> Result<PathBuf, CacheError> {
    let target = sandbox_path.join(ENV_LINK_NAME);

    if target.symlink_metadata().is_ok() {
        let _ = if target.is_dir() && !target.is_symlink() {
            std::fs::remove_dir_all(&target)
        } else {
            std::fs::remove_file(&target)
        };
    }

    match std::os::unix::fs::symlink(env_path, &target) {
        Ok(()) => Ok(target),
        Err(link_err) => {
            debug!(error = %link_err, "symlink unavailable, copying env");
            copy_dir(env_path, &target).map_err(|source| CacheError::Io {
                context: format!("copy env into {}", target.display()),
                source,
            })?;
            Ok(target)
        },
    }
}

fn copy_dir(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for item in std::fs::read_dir(src)? {
        let item = item?;
        let to = dst.join(item.file_name());
        if item.file_type()?.is_dir() {
            copy_dir(&item.path(), &to)?;
        } else {
            std::fs::copy(item.path(), &to)?;
        }
    }
    Ok(())
}

fn normalize(deps: &[String]) -> Vec<String> {
    let mut normalized: Vec<String> = deps
        .iter()
        .map(|d| d.trim().to_lowercase())
        .filter(|d| !d.is_empty())
        .collect();
    normalized.sort();
    normalized
}

fn short(hash: &str) -> &str {
    &hash[..hash.len().min(16)]
}

/// Cache errors.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Underlying I/O failure with context.
    #[error("{context}: {source}")]
    Io {
        /// What was being attempted.
        context: String,
        /// The underlying error.
        source: std::io::Error,
    },
}
