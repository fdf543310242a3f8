//! Sandbox manager.
//!
//! Creates, starts, probes, supervises, and stops sandboxes, and owns their
//! lifetime. Every sandbox gets its own supervision task that observes the
//! child's exit, captures a structured failure report, unregisters the
//! endpoint, and releases the cached environment lease.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::command::prepare_run_command;
use super::probe::{self, ProbeOutcome};
use super::{
    ExitEvent, ProcessHandle, RingBuffer, Sandbox, SandboxError, SandboxId, SandboxState,
    SharedRing, signal_name,
};
use crate::artifact::Artifact;
use crate::cache::{self, DependencyCache};
use crate::lock;
use crate::net::{EndpointStore, LOOPBACK_HOST};

/// Grace period between SIGTERM and SIGKILL on stop.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

/// How long a probe-less service must survive after launch to count as
/// ready.
const STARTUP_WINDOW: Duration = Duration::from_secs(1);

/// Residual wait before restarting a name that was recently stopped, so
/// the OS can finish unbinding the old port.
const UNBIND_GRACE: Duration = Duration::from_millis(500);

/// Wait after SIGKILL before giving up on the exit notification.
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Capacity of each captured output ring buffer.
const RING_CAPACITY: usize = 1024 * 1024;

/// How many bytes of each stream the failure report keeps.
const REPORT_TAIL: usize = 4096;

/// Per-service log file name inside the sandbox.
pub const SERVICE_LOG_NAME: &str = "service.log";

/// Failure report file name inside the sandbox.
pub const ERROR_LOG_NAME: &str = "error.log";

/// Tagged result of a start attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunResult {
    /// The service was observed healthy.
    Healthy {
        /// OS process ID of the child.
        pid: u32,
    },

    /// The health probe did not succeed within the startup timeout.
    HealthTimeout {
        /// How long the probe waited.
        waited: Duration,
    },

    /// The process exited during startup.
    Exited {
        /// Raw exit status; negative values encode the terminating signal.
        status: i32,
    },

    /// Shutdown was requested while waiting for readiness.
    Cancelled,
}

struct Record {
    sandbox: Sandbox,
    lease_flag: Option<Arc<AtomicBool>>,
}

#[derive(Default)]
struct Inner {
    records: HashMap<String, Record>,
    last_stopped: HashMap<String, Instant>,
}

/// Manages sandboxes for all services of an ecosystem.
pub struct SandboxManager {
    sandbox_root: PathBuf,
    cache: Arc<DependencyCache>,
    endpoints: Arc<dyn EndpointStore>,
    events: mpsc::UnboundedSender<ExitEvent>,
    cancel: watch::Receiver<bool>,
    http: reqwest::Client,
    stop_grace: Duration,
    inner: Arc<Mutex<Inner>>,
}

impl SandboxManager {
    /// Create a manager materializing sandboxes under `sandbox_root`.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Io`] if the sandbox root cannot be created.
    pub fn new(
        sandbox_root: PathBuf,
        cache: Arc<DependencyCache>,
        endpoints: Arc<dyn EndpointStore>,
        events: mpsc::UnboundedSender<ExitEvent>,
        cancel: watch::Receiver<bool>,
    ) -> Result<Self, SandboxError> {
        std::fs::create_dir_all(&sandbox_root)?;
        Ok(Self {
            sandbox_root,
            cache,
            endpoints,
            events,
            cancel,
            http: reqwest::Client::new(),
            stop_grace: DEFAULT_STOP_GRACE,
            inner: Arc::new(Mutex::new(Inner::default())),
        })
    }

    /// Override the stop grace period.
    #[must_use]
    pub const fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Materialize a sandbox for a service from its artifact: write every
    /// declared file byte-exact, then link in the cached dependency
    /// environment. All writes stay under the sandbox directory.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::AlreadyRunning`] if the service is live, or
    /// an I/O / cache error from materialization.
    pub async fn create(&self, name: &str, artifact: &Artifact) -> Result<Sandbox, SandboxError> {
        {
            let inner = lock(&self.inner);
            if let Some(record) = inner.records.get(name) {
                if record.sandbox.state.blocks_restart() {
                    return Err(SandboxError::AlreadyRunning(name.to_string()));
                }
            }
        }

        let path = self.sandbox_root.join(name);
        if tokio::fs::metadata(&path).await.is_ok() {
            debug!(service = name, "removing existing sandbox");
            tokio::fs::remove_dir_all(&path).await?;
        }
        tokio::fs::create_dir_all(&path).await?;

        let mut files = Vec::with_capacity(artifact.files.len());
        for file in &artifact.files {
            let dest = path.join(&file.path);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&dest, &file.bytes).await?;
            files.push(file.path.clone());
        }

        let (env_hash, lease_flag) = if artifact.deps.is_empty() {
            (None, None)
        } else {
            let lease = self.cache.acquire(&artifact.deps)?;
            if let Err(e) = cache::link_env(&lease.path, &path) {
                self.cache.release(&lease.hash);
                return Err(e.into());
            }
            if lease.reused {
                info!(service = name, "reusing cached env");
            }
            (Some(lease.hash), Some(Arc::new(AtomicBool::new(false))))
        };

        let sandbox = Sandbox {
            id: SandboxId::new(),
            name: name.to_string(),
            path,
            files,
            run: artifact.run.clone(),
            env_hash,
            port: None,
            env: BTreeMap::new(),
            state: SandboxState::Materialized,
            handle: None,
        };

        info!(service = name, path = %sandbox.path.display(), "sandbox materialized");

        let mut inner = lock(&self.inner);
        let old = inner.records.insert(
            name.to_string(),
            Record {
                sandbox: sandbox.clone(),
                lease_flag,
            },
        );
        if let Some(old) = old {
            release_lease(&self.cache, &old);
        }

        Ok(sandbox)
    }

    /// Launch a materialized sandbox and wait for readiness.
    ///
    /// The run command is rewritten for the allocated port, the composed
    /// environment is extended with `PORT` and `MARKPACT_PORT`, and the
    /// child is started in its own process group with stdin closed and
    /// output captured. Readiness is the health probe when `health_path`
    /// is declared, or a short survival window otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError`] for invalid states or spawn failures; probe
    /// failures are reported through the returned [`RunResult`].
    pub async fn start(
        &self,
        name: &str,
        port: u16,
        mut env: BTreeMap<String, String>,
        health_path: Option<&str>,
        timeout: Duration,
    ) -> Result<RunResult, SandboxError> {
        let (run, path, residual) = {
            let inner = lock(&self.inner);
            let record = inner
                .records
                .get(name)
                .ok_or_else(|| SandboxError::NotFound(name.to_string()))?;
            if record.sandbox.state.blocks_restart() {
                return Err(SandboxError::AlreadyRunning(name.to_string()));
            }
            if record.sandbox.state != SandboxState::Materialized {
                return Err(SandboxError::InvalidState {
                    name: name.to_string(),
                    state: record.sandbox.state.clone(),
                });
            }
            let residual = inner
                .last_stopped
                .get(name)
                .and_then(|stopped| UNBIND_GRACE.checked_sub(stopped.elapsed()));
            (
                record.sandbox.run.clone(),
                record.sandbox.path.clone(),
                residual,
            )
        };

        if let Some(residual) = residual {
            debug!(service = name, ?residual, "waiting out port unbind window");
            tokio::time::sleep(residual).await;
        }

        let prepared = prepare_run_command(&run, port);
        env.insert("PORT".to_string(), port.to_string());
        env.insert("MARKPACT_PORT".to_string(), port.to_string());

        let mut std_cmd = std::process::Command::new("sh");
        std_cmd
            .arg("-c")
            .arg(&prepared)
            .current_dir(&path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &env {
            std_cmd.env(key, value);
        }
        {
            // Own process group so stop can signal the whole tree.
            use std::os::unix::process::CommandExt;
            std_cmd.process_group(0);
        }

        let mut cmd = tokio::process::Command::from(std_cmd);
        cmd.kill_on_drop(false);

        let mut child = cmd.spawn().map_err(|e| SandboxError::SpawnFailed {
            name: name.to_string(),
            message: e.to_string(),
        })?;
        let pid = child.id().ok_or_else(|| SandboxError::SpawnFailed {
            name: name.to_string(),
            message: "failed to get process ID".to_string(),
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_ring: SharedRing = Arc::new(Mutex::new(RingBuffer::new(RING_CAPACITY)));
        let err_ring: SharedRing = Arc::new(Mutex::new(RingBuffer::new(RING_CAPACITY)));
        let (exit_tx, exit_rx) = watch::channel(None);

        let handle = ProcessHandle::new(pid, out_ring.clone(), err_ring.clone(), exit_rx.clone());

        let ctx = {
            let mut inner = lock(&self.inner);
            let Some(record) = inner.records.get_mut(name) else {
                return Err(SandboxError::NotFound(name.to_string()));
            };
            record.sandbox.state = SandboxState::Starting;
            record.sandbox.port = Some(port);
            record.sandbox.env = env;
            record.sandbox.handle = Some(handle);

            SuperviseCtx {
                name: name.to_string(),
                sandbox_path: record.sandbox.path.clone(),
                run_cmd: prepared.clone(),
                files: record.sandbox.files.clone(),
                env_hash: record.sandbox.env_hash.clone(),
                lease_flag: record.lease_flag.clone(),
                inner: Arc::clone(&self.inner),
                cache: Arc::clone(&self.cache),
                endpoints: Arc::clone(&self.endpoints),
                events: self.events.clone(),
            }
        };

        info!(service = name, pid, port, command = %prepared, "process started");
        tokio::spawn(supervise(
            ctx,
            child,
            stdout,
            stderr,
            out_ring,
            err_ring,
            exit_tx,
        ));

        let mut exit_watch = exit_rx;
        let mut cancel = self.cancel.clone();
        let outcome = match health_path {
            Some(health_path) => {
                let url = format!("http://{LOOPBACK_HOST}:{port}{health_path}");
                probe::wait_healthy(&self.http, &url, timeout, &mut exit_watch, &mut cancel).await
            },
            None => {
                let window = STARTUP_WINDOW.min(timeout);
                match tokio::time::timeout(window, exit_watch.changed()).await {
                    Err(_) => ProbeOutcome::Healthy,
                    Ok(_) => match *exit_watch.borrow() {
                        Some(status) => ProbeOutcome::Exited(status),
                        None => ProbeOutcome::Healthy,
                    },
                }
            },
        };

        match outcome {
            ProbeOutcome::Healthy => {
                {
                    let mut inner = lock(&self.inner);
                    if let Some(record) = inner.records.get_mut(name) {
                        // The supervisor may already have observed an exit;
                        // never resurrect a dead sandbox.
                        if record.sandbox.state == SandboxState::Starting {
                            record.sandbox.state = SandboxState::Running;
                        }
                    }
                }
                info!(service = name, port, "service healthy");
                Ok(RunResult::Healthy { pid })
            },
            ProbeOutcome::Exited(status) => {
                warn!(service = name, status, "process exited during startup");
                Ok(RunResult::Exited { status })
            },
            ProbeOutcome::TimedOut => {
                warn!(service = name, ?timeout, "health probe timed out");
                let _ = self.terminate(name, KILL_WAIT).await;
                Ok(RunResult::HealthTimeout { waited: timeout })
            },
            ProbeOutcome::Cancelled => {
                let _ = self.terminate(name, KILL_WAIT).await;
                Ok(RunResult::Cancelled)
            },
        }
    }

    /// Stop a service: SIGTERM, bounded grace, then SIGKILL. The endpoint
    /// is removed regardless of which signal succeeded. Stopping a
    /// non-existent service is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::StopTimeout`] when the child survives even
    /// SIGKILL; the shutdown sweep must not hang on it.
    pub async fn stop(&self, name: &str) -> Result<(), SandboxError> {
        let state = {
            let inner = lock(&self.inner);
            inner
                .records
                .get(name)
                .map(|record| record.sandbox.state.clone())
        };

        match state {
            None => Ok(()),
            Some(state) if !state.is_active() => {
                self.endpoints.unregister(name);
                Ok(())
            },
            Some(_) => {
                let result = self.terminate(name, self.stop_grace).await;
                self.endpoints.unregister(name);
                if result.is_ok() {
                    info!(service = name, "service stopped");
                }
                result
            },
        }
    }

    /// Last observed lifecycle state of a service.
    #[must_use]
    pub fn status(&self, name: &str) -> Option<SandboxState> {
        lock(&self.inner)
            .records
            .get(name)
            .map(|record| record.sandbox.state.clone())
    }

    /// Snapshot of a sandbox record.
    #[must_use]
    pub fn sandbox(&self, name: &str) -> Option<Sandbox> {
        lock(&self.inner)
            .records
            .get(name)
            .map(|record| record.sandbox.clone())
    }

    /// Names of all known sandboxes, sorted.
    #[must_use]
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.inner).records.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether a process may currently be alive for this service.
    #[must_use]
    pub fn is_live(&self, name: &str) -> bool {
        lock(&self.inner)
            .records
            .get(name)
            .is_some_and(|record| record.sandbox.state.is_active())
    }

    /// Tail of the service's captured output (stdout and stderr
    /// interleaved in arrival order).
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::NotFound`] for an unknown service.
    pub async fn logs(&self, name: &str, tail: usize) -> Result<Vec<u8>, SandboxError> {
        let path = {
            let inner = lock(&self.inner);
            inner
                .records
                .get(name)
                .ok_or_else(|| SandboxError::NotFound(name.to_string()))?
                .sandbox
                .path
                .join(SERVICE_LOG_NAME)
        };
        let bytes = tokio::fs::read(&path).await.unwrap_or_default();
        let skip = bytes.len().saturating_sub(tail);
        Ok(bytes[skip..].to_vec())
    }

    /// Signal the process group and wait for the exit notification,
    /// escalating to SIGKILL after `grace`.
    async fn terminate(&self, name: &str, grace: Duration) -> Result<(), SandboxError> {
        let target = {
            let mut inner = lock(&self.inner);
            let Some(record) = inner.records.get_mut(name) else {
                return Ok(());
            };
            if record.sandbox.state.is_active() {
                record.sandbox.state = SandboxState::Stopping;
            }
            record.sandbox.handle.as_ref().and_then(|handle| {
                if handle.exit_status().is_some() {
                    None
                } else {
                    Some((handle.pid, handle.subscribe_exit()))
                }
            })
        };

        let Some((pid, mut exit_watch)) = target else {
            return Ok(());
        };

        let mut stuck = false;
        send_group_signal(pid, Signal::SIGTERM);
        if tokio::time::timeout(grace, wait_exit(&mut exit_watch))
            .await
            .is_err()
        {
            warn!(service = name, pid, "graceful stop timed out, sending SIGKILL");
            send_group_signal(pid, Signal::SIGKILL);
            stuck = tokio::time::timeout(KILL_WAIT, wait_exit(&mut exit_watch))
                .await
                .is_err();
        }

        lock(&self.inner)
            .last_stopped
            .insert(name.to_string(), Instant::now());

        if stuck {
            return Err(SandboxError::StopTimeout(name.to_string()));
        }
        Ok(())
    }
}

/// Release a record's cache lease exactly once.
fn release_lease(cache: &DependencyCache, record: &Record) {
    if let (Some(flag), Some(hash)) = (&record.lease_flag, &record.sandbox.env_hash) {
        if !flag.swap(true, Ordering::SeqCst) {
            cache.release(hash);
        }
    }
}

struct SuperviseCtx {
    name: String,
    sandbox_path: PathBuf,
    run_cmd: String,
    files: Vec<PathBuf>,
    env_hash: Option<String>,
    lease_flag: Option<Arc<AtomicBool>>,
    inner: Arc<Mutex<Inner>>,
    cache: Arc<DependencyCache>,
    endpoints: Arc<dyn EndpointStore>,
    events: mpsc::UnboundedSender<ExitEvent>,
}

/// Observe one child until exit, pumping its output and recording the
/// structured failure report.
async fn supervise(
    ctx: SuperviseCtx,
    mut child: tokio::process::Child,
    stdout: Option<tokio::process::ChildStdout>,
    stderr: Option<tokio::process::ChildStderr>,
    out_ring: SharedRing,
    err_ring: SharedRing,
    exit_tx: watch::Sender<Option<i32>>,
) {
    let log_path = ctx.sandbox_path.join(SERVICE_LOG_NAME);
    let log_file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .await
        .ok();
    let log = Arc::new(tokio::sync::Mutex::new(log_file));

    let (status, (), ()) = tokio::join!(
        child.wait(),
        pump(stdout, out_ring.clone(), Arc::clone(&log)),
        pump(stderr, err_ring.clone(), Arc::clone(&log)),
    );

    let raw_status = match status {
        Ok(status) => raw_exit_status(status),
        Err(e) => {
            error!(service = %ctx.name, error = %e, "failed to await child");
            -1
        },
    };

    if raw_status == 0 {
        info!(service = %ctx.name, "process exited cleanly");
    } else if let Some(signal) = signal_name(raw_status) {
        warn!(service = %ctx.name, status = raw_status, signal, "process terminated by signal");
    } else {
        warn!(service = %ctx.name, status = raw_status, "process exited with error");
    }

    if raw_status != 0 {
        let report = render_error_report(&ctx, raw_status, &out_ring, &err_ring);
        let report_path = ctx.sandbox_path.join(ERROR_LOG_NAME);
        if let Err(e) = tokio::fs::write(&report_path, report).await {
            warn!(service = %ctx.name, error = %e, "failed to write error report");
        }
    }

    {
        let mut inner = lock(&ctx.inner);
        if let Some(record) = inner.records.get_mut(&ctx.name) {
            record.sandbox.state = SandboxState::Dead {
                status: Some(raw_status),
            };
        }
        inner.last_stopped.insert(ctx.name.clone(), Instant::now());
    }

    let _ = exit_tx.send(Some(raw_status));
    ctx.endpoints.unregister(&ctx.name);
    if let (Some(flag), Some(hash)) = (&ctx.lease_flag, &ctx.env_hash) {
        if !flag.swap(true, Ordering::SeqCst) {
            ctx.cache.release(hash);
        }
    }
    let _ = ctx.events.send(ExitEvent {
        name: ctx.name.clone(),
        status: raw_status,
    });
}

/// Pump one output stream into its ring buffer and the service log file.
async fn pump<R>(reader: Option<R>, ring: SharedRing, log: Arc<tokio::sync::Mutex<Option<tokio::fs::File>>>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let Some(mut reader) = reader else { return };
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                lock(&ring).push_chunk(&buf[..n]);
                if let Some(file) = log.lock().await.as_mut() {
                    let _ = file.write_all(&buf[..n]).await;
                }
            },
        }
    }
}

/// Raw status: the exit code, or the negated terminating signal.
fn raw_exit_status(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| -signal))
        .unwrap_or(-1)
}

fn render_error_report(
    ctx: &SuperviseCtx,
    raw_status: i32,
    out_ring: &SharedRing,
    err_ring: &SharedRing,
) -> String {
    let stderr_tail = String::from_utf8_lossy(&lock(err_ring).tail(REPORT_TAIL)).into_owned();
    let stdout_tail = String::from_utf8_lossy(&lock(out_ring).tail(REPORT_TAIL)).into_owned();
    let signal = signal_name(raw_status)
        .map(|name| format!(" ({name})"))
        .unwrap_or_default();
    let files = ctx
        .files
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "Exit code: {raw_status}{signal}\n\
         Command: {run}\n\
         CWD: {cwd}\n\
         \n--- STDERR ---\n{stderr_tail}\n\
         \n--- STDOUT ---\n{stdout_tail}\n\
         \n--- FILES ---\n{files}\n",
        run = ctx.run_cmd,
        cwd = ctx.sandbox_path.display(),
    )
}

fn send_group_signal(pid: u32, signal: Signal) {
    #[allow(clippy::cast_possible_wrap)] // PIDs fit in i32
    let pgid = Pid::from_raw(pid as i32);
    if let Err(e) = killpg(pgid, signal) {
        debug!(pid, ?signal, error = %e, "signal delivery failed");
    }
}

async fn wait_exit(exit: &mut watch::Receiver<Option<i32>>) {
    loop {
        if exit.borrow().is_some() {
            return;
        }
        if exit.changed().await.is_err() {
            return;
        }
    }
}

impl std::fmt::Debug for SandboxManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxManager")
            .field("sandbox_root", &self.sandbox_root)
            .field("stop_grace", &self.stop_grace)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{Artifact, ArtifactFile};
    use crate::net::{RegistryError, ServiceEndpoint};

    struct NullStore;

    impl EndpointStore for NullStore {
        fn register(
            &self,
            name: &str,
            preferred_port: Option<u16>,
            health_check: Option<String>,
        ) -> Result<ServiceEndpoint, RegistryError> {
            Ok(ServiceEndpoint {
                name: name.to_string(),
                host: LOOPBACK_HOST.to_string(),
                port: preferred_port.unwrap_or(0),
                health_check,
            })
        }

        fn unregister(&self, _name: &str) {}

        fn get(&self, _name: &str) -> Option<ServiceEndpoint> {
            None
        }
    }

    fn artifact(run: &str, deps: &[&str]) -> Artifact {
        Artifact {
            title: "test".into(),
            files: vec![ArtifactFile {
                path: "hello.txt".into(),
                bytes: b"hi".to_vec(),
            }],
            deps: deps.iter().map(ToString::to_string).collect(),
            run: run.to_string(),
            tests: Vec::new(),
        }
    }

    struct Fixture {
        manager: SandboxManager,
        events: mpsc::UnboundedReceiver<ExitEvent>,
        _cancel: watch::Sender<bool>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let cache =
            Arc::new(DependencyCache::new(dir.path().join(".cache").join("envs")).unwrap());
        let (events_tx, events) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let manager = SandboxManager::new(
            dir.path().join("sandboxes"),
            cache,
            Arc::new(NullStore),
            events_tx,
            cancel_rx,
        )
        .unwrap()
        .with_stop_grace(Duration::from_secs(2));
        Fixture {
            manager,
            events,
            _cancel: cancel_tx,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_create_materializes_files_and_env() {
        let fx = fixture();
        let sandbox = fx
            .manager
            .create("svc", &artifact("sleep 5", &["flask"]))
            .await
            .unwrap();

        assert_eq!(sandbox.state, SandboxState::Materialized);
        assert_eq!(
            std::fs::read(sandbox.path.join("hello.txt")).unwrap(),
            b"hi"
        );
        assert!(sandbox.path.join(cache::ENV_LINK_NAME).exists());
        assert!(sandbox.env_hash.is_some());
    }

    #[tokio::test]
    async fn test_start_without_probe_reports_healthy() {
        let fx = fixture();
        fx.manager
            .create("svc", &artifact("sleep 5", &[]))
            .await
            .unwrap();

        let result = fx
            .manager
            .start("svc", 19000, BTreeMap::new(), None, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(matches!(result, RunResult::Healthy { .. }));
        assert_eq!(fx.manager.status("svc"), Some(SandboxState::Running));

        fx.manager.stop("svc").await.unwrap();
        assert!(!fx.manager.is_live("svc"));
    }

    #[tokio::test]
    async fn test_start_captures_immediate_exit() {
        let mut fx = fixture();
        fx.manager
            .create("svc", &artifact("echo out; echo err >&2; exit 7", &[]))
            .await
            .unwrap();

        let result = fx
            .manager
            .start("svc", 19001, BTreeMap::new(), None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result, RunResult::Exited { status: 7 });

        let event = fx.events.recv().await.unwrap();
        assert_eq!(event.name, "svc");
        assert_eq!(event.status, 7);

        let sandbox = fx.manager.sandbox("svc").unwrap();
        let report =
            std::fs::read_to_string(sandbox.path.join(ERROR_LOG_NAME)).unwrap();
        assert!(report.contains("Exit code: 7"));
        assert!(report.contains("err"));
        assert!(report.contains("hello.txt"));
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let fx = fixture();
        fx.manager
            .create("svc", &artifact("sleep 5", &[]))
            .await
            .unwrap();
        fx.manager
            .start("svc", 19002, BTreeMap::new(), None, Duration::from_secs(5))
            .await
            .unwrap();

        let second = fx
            .manager
            .start("svc", 19003, BTreeMap::new(), None, Duration::from_secs(5))
            .await;
        assert!(matches!(second, Err(SandboxError::AlreadyRunning(_))));

        let recreate = fx.manager.create("svc", &artifact("sleep 5", &[])).await;
        assert!(matches!(recreate, Err(SandboxError::AlreadyRunning(_))));

        fx.manager.stop("svc").await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_terminates_process_group() {
        let fx = fixture();
        fx.manager
            .create("svc", &artifact("sleep 30", &[]))
            .await
            .unwrap();
        fx.manager
            .start("svc", 19004, BTreeMap::new(), None, Duration::from_secs(5))
            .await
            .unwrap();

        fx.manager.stop("svc").await.unwrap();
        match fx.manager.status("svc") {
            Some(SandboxState::Dead { status }) => {
                assert!(status.is_some_and(|s| s < 0), "expected signal exit, got {status:?}");
            },
            other => panic!("expected dead sandbox, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stop_unknown_service_is_noop() {
        let fx = fixture();
        fx.manager.stop("ghost").await.unwrap();
    }

    #[tokio::test]
    async fn test_health_timeout_kills_child() {
        let fx = fixture();
        fx.manager
            .create("svc", &artifact("sleep 30", &[]))
            .await
            .unwrap();

        let result = fx
            .manager
            .start(
                "svc",
                19005,
                BTreeMap::new(),
                Some("/health"),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert!(matches!(result, RunResult::HealthTimeout { .. }));
        assert!(!fx.manager.is_live("svc"));
    }

    #[tokio::test]
    async fn test_cache_lease_released_on_exit() {
        let fx = fixture();
        let sandbox = fx
            .manager
            .create("svc", &artifact("true", &["flask"]))
            .await
            .unwrap();
        let hash = sandbox.env_hash.clone().unwrap();
        assert_eq!(fx.manager.cache.ref_count(&hash), Some(1));

        fx.manager
            .start("svc", 19006, BTreeMap::new(), None, Duration::from_secs(5))
            .await
            .unwrap();

        // The supervision task releases the lease once the exit lands.
        for _ in 0..50 {
            if fx.manager.cache.ref_count(&hash) == Some(0) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(fx.manager.cache.ref_count(&hash), Some(0));
    }

    #[tokio::test]
    async fn test_env_injected_into_child() {
        let fx = fixture();
        fx.manager
            .create(
                "svc",
                &Artifact {
                    title: "env".into(),
                    files: Vec::new(),
                    deps: Vec::new(),
                    run: "echo \"$GREETING:$PORT\" > observed.txt; sleep 2".into(),
                    tests: Vec::new(),
                },
            )
            .await
            .unwrap();

        let mut env = BTreeMap::new();
        env.insert("GREETING".to_string(), "hello".to_string());
        fx.manager
            .start("svc", 19007, env, None, Duration::from_secs(5))
            .await
            .unwrap();

        let sandbox = fx.manager.sandbox("svc").unwrap();
        let observed =
            std::fs::read_to_string(sandbox.path.join("observed.txt")).unwrap();
        assert_eq!(observed.trim(), "hello:19007");
        fx.manager.stop("svc").await.unwrap();
    }

    #[tokio::test]
    async fn test_logs_return_captured_output() {
        let fx = fixture();
        fx.manager
            .create("svc", &artifact("echo captured-line; exit 1", &[]))
            .await
            .unwrap();
        fx.manager
            .start("svc", 19008, BTreeMap::new(), None, Duration::from_secs(5))
            .await
            .unwrap();

        let logs = fx.manager.logs("svc", 1024).await.unwrap();
        assert!(String::from_utf8_lossy(&logs).contains("captured-line"));
    }
}
