use crate::config::CaddyConfig;
use crate::error::{Result, ServeError};
use crate::layout::Layout;
use crate::notify::{Status, StatusEvent, StatusNotifier};
use crate::pidfile::{self, Holder, PidFile};
use crate::server::ServerDefinition;
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

/// Lowest port an unprivileged user may bind
const FIRST_UNPRIVILEGED_PORT: u16 = 1024;

/// How often another process's pid file is re-checked while stopping it
const EXTERNAL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Time the owning serve process gets to notice and reap a killed child
const EXTERNAL_REAP_ALLOWANCE: Duration = Duration::from_secs(1);

/// Owned handle to a running Caddy process
///
/// Dropping a handle whose process has not been reaped kills the process.
pub struct ProcessHandle {
    server_id: String,
    child: Child,
    started_at: Instant,
    /// Released (and removed) once the handle is gone
    _pid_file: PidFile,
}

impl ProcessHandle {
    /// OS process id, `None` once the process has been reaped
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Time since the process was spawned
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if let Some(pid) = self.child.id() {
            warn!(id = %self.server_id, pid, "Dropping live process handle, killing process");
            let _ = self.child.start_kill();
        }
    }
}

/// Per-id slot; the mutex serializes start/stop/status for one server
type Slot = Arc<Mutex<Option<ProcessHandle>>>;

/// Lock on a slot, independent of the map entry it was taken from
type SlotGuard = OwnedMutexGuard<Option<ProcessHandle>>;

/// Outcome of [`ProcessManager::kill_all`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Servers whose process was confirmed stopped
    pub stopped: Vec<String>,
    /// Servers given up on (still alive, or the budget ran out)
    pub abandoned: Vec<String>,
}

/// Supervises one Caddy process per server definition.
///
/// # Usage
///
/// `ProcessManager` is designed to be used behind an `Arc` so it can be shared
/// across tasks. The [`new`](ProcessManager::new) constructor returns
/// `Arc<Self>` directly.
///
/// Operations on the same server id are serialized through a per-id lock;
/// operations on different ids run concurrently. Every transition is
/// published on the [`StatusNotifier`] passed in at construction.
///
/// A server supervised here is marked with a locked pid file in its
/// directory, so other serve processes sharing the layout can see it
/// ([`status_anywhere`](ProcessManager::status_anywhere)), stop it
/// ([`stop_anywhere`](ProcessManager::stop_anywhere)) and will refuse to
/// launch a second copy.
pub struct ProcessManager {
    /// Where Caddyfiles and logs live
    layout: Layout,
    /// How to launch and stop Caddy
    caddy: CaddyConfig,
    /// Status transition broadcaster
    notifier: StatusNotifier,
    /// Process slots keyed by server id
    slots: DashMap<String, Slot>,
}

impl ProcessManager {
    /// Create a new process manager.
    pub fn new(layout: Layout, caddy: CaddyConfig, notifier: StatusNotifier) -> Arc<Self> {
        Arc::new(Self {
            layout,
            caddy,
            notifier,
            slots: DashMap::new(),
        })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn notifier(&self) -> &StatusNotifier {
        &self.notifier
    }

    /// Subscribe to status transitions
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.notifier.subscribe()
    }

    fn slot(&self, id: &str) -> Slot {
        Arc::clone(self.slots.entry(id.to_string()).or_default().value())
    }

    fn existing_slot(&self, id: &str) -> Option<Slot> {
        self.slots.get(id).map(|slot| Arc::clone(slot.value()))
    }

    fn is_current(&self, id: &str, slot: &Slot) -> bool {
        self.slots
            .get(id)
            .is_some_and(|current| Arc::ptr_eq(current.value(), slot))
    }

    /// Lock the slot the map holds for `id`, creating it if needed
    ///
    /// A slot retired while this call waited on it is skipped, so the guard
    /// always belongs to the live slot.
    async fn lock_slot(&self, id: &str) -> (Slot, SlotGuard) {
        loop {
            let slot = self.slot(id);
            let guard = Arc::clone(&slot).lock_owned().await;
            if self.is_current(id, &slot) {
                return (slot, guard);
            }
            debug!(id, "Slot retired while waiting, retrying");
        }
    }

    /// Like [`lock_slot`](Self::lock_slot) but never creates a slot
    async fn lock_existing_slot(&self, id: &str) -> Option<(Slot, SlotGuard)> {
        loop {
            let slot = self.existing_slot(id)?;
            let guard = Arc::clone(&slot).lock_owned().await;
            if self.is_current(id, &slot) {
                return Some((slot, guard));
            }
            debug!(id, "Slot retired while waiting, retrying");
        }
    }

    /// Remove `slot` from the map; the caller holds its lock and it is empty
    fn retire_slot(&self, id: &str, slot: &Slot) {
        self.slots
            .remove_if(id, |_, current| Arc::ptr_eq(current, slot));
    }

    /// Start the Caddy process for `definition`
    ///
    /// Does nothing if the server is already running. The Caddyfile is
    /// regenerated before launching so the process always sees the current
    /// definition.
    pub async fn start(&self, definition: &ServerDefinition) -> Result<()> {
        definition.validate()?;
        let (_slot, mut guard) = self.lock_slot(&definition.id).await;
        self.start_locked(&mut guard, definition).await
    }

    async fn start_locked(
        &self,
        current: &mut Option<ProcessHandle>,
        definition: &ServerDefinition,
    ) -> Result<()> {
        let id = definition.id.as_str();

        if let Some(handle) = current.as_mut() {
            match handle.try_wait() {
                Ok(None) => {
                    debug!(id, "Server already running");
                    return Ok(());
                }
                Ok(Some(status)) => {
                    warn!(id, %status, "Caddy process exited without being stopped");
                    *current = None;
                    self.notifier.publish(id, Status::Stopped);
                }
                Err(e) => {
                    warn!(id, error = %e, "Cannot query process state, assuming it is running");
                    return Ok(());
                }
            }
        }

        self.check_launchable(definition)?;
        let pid_file = self.claim_pid_file(id)?;
        self.layout.write(definition)?;

        let handle = self.spawn(definition, pid_file).await?;
        info!(id, pid = handle.pid(), port = definition.port, "Server started");

        *current = Some(handle);
        self.notifier.publish(id, Status::Running);
        Ok(())
    }

    /// Reject definitions that cannot possibly launch
    fn check_launchable(&self, definition: &ServerDefinition) -> Result<()> {
        if !definition.root.is_dir() {
            return Err(ServeError::InvalidDefinition(format!(
                "root '{}' does not exist or is not a directory",
                definition.root.display()
            )));
        }

        if definition.port < FIRST_UNPRIVILEGED_PORT && !is_elevated() {
            return Err(ServeError::InvalidDefinition(format!(
                "port {} is privileged and the supervisor is not running as root",
                definition.port
            )));
        }

        if self.caddy.check_port {
            if let Err(e) = std::net::TcpListener::bind(("0.0.0.0", definition.port)) {
                return Err(ServeError::launch(
                    &definition.id,
                    format!("port {} is not available: {}", definition.port, e),
                ));
            }
        }

        Ok(())
    }

    fn claim_pid_file(&self, id: &str) -> Result<PidFile> {
        let path = self.layout.pid_file_path(id);
        match PidFile::acquire(&path)? {
            Some(pid_file) => Ok(pid_file),
            None => Err(ServeError::launch(
                id,
                format!(
                    "already supervised by another serve process (see {})",
                    path.display()
                ),
            )),
        }
    }

    /// Fails with `Conflict` while another serve process owns `id`
    fn check_not_supervised_elsewhere(&self, id: &str) -> Result<()> {
        match pidfile::holder(&self.layout.pid_file_path(id))? {
            Holder::Nobody => Ok(()),
            Holder::Process(pid) => Err(ServeError::Conflict(format!(
                "server '{}' is running in another serve process{}",
                id,
                pid.map(|pid| format!(" (caddy pid {})", pid))
                    .unwrap_or_default()
            ))),
        }
    }

    /// Expand the argument template for one server
    fn command_args(&self, definition: &ServerDefinition) -> Result<Vec<String>> {
        let id = definition.id.as_str();
        let config = self.layout.caddyfile_path(id);
        let access_log = self.layout.access_log_path(id);
        let error_log = self.layout.error_log_path(id);
        let port = definition.port.to_string();

        let args = self
            .caddy
            .arg_template()?
            .into_iter()
            .map(|arg| {
                arg.replace("{config}", &config.to_string_lossy())
                    .replace("{id}", id)
                    .replace("{root}", &definition.root.to_string_lossy())
                    .replace("{port}", &port)
                    .replace("{access_log}", &access_log.to_string_lossy())
                    .replace("{error_log}", &error_log.to_string_lossy())
            })
            .collect();

        Ok(args)
    }

    /// Spawn the process and make sure it survives the startup check
    async fn spawn(
        &self,
        definition: &ServerDefinition,
        mut pid_file: PidFile,
    ) -> Result<ProcessHandle> {
        let id = definition.id.as_str();
        let args = self.command_args(definition)?;
        let stdout = open_log(&self.layout.access_log_path(id))?;
        let stderr = open_log(&self.layout.error_log_path(id))?;

        info!(id, binary = %self.caddy.binary, ?args, "Starting Caddy");

        let mut cmd = Command::new(&self.caddy.binary);
        cmd.args(&args);
        cmd.current_dir(&definition.root);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::from(stdout));
        cmd.stderr(Stdio::from(stderr));
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| ServeError::launch(id, format!("{}: {}", self.caddy.binary, e)))?;
        debug!(id, pid = child.id(), "Caddy process spawned");

        if let Some(pid) = child.id() {
            if let Err(e) = pid_file.record(pid) {
                warn!(id, error = %e, "Failed to record pid");
            }
        }

        let check = self.caddy.startup_check();
        if !check.is_zero() {
            match tokio::time::timeout(check, child.wait()).await {
                Ok(Ok(status)) => {
                    return Err(ServeError::launch(
                        id,
                        format!(
                            "process exited during startup ({}), see {}",
                            status,
                            self.layout.error_log_path(id).display()
                        ),
                    ));
                }
                Ok(Err(e)) => {
                    return Err(ServeError::launch(id, format!("failed to wait for process: {}", e)));
                }
                Err(_) => {}
            }
        }

        Ok(ProcessHandle {
            server_id: id.to_string(),
            child,
            started_at: Instant::now(),
            _pid_file: pid_file,
        })
    }

    /// Stop the server `id`
    ///
    /// Sends SIGTERM, waits for the grace period, then escalates to SIGKILL.
    /// Does nothing if the server is not running.
    pub async fn stop(&self, id: &str) -> Result<()> {
        self.stop_with_grace(id, self.caddy.shutdown_grace_period())
            .await
            .map(|_| ())
    }

    /// Returns whether a process was actually stopped
    async fn stop_with_grace(&self, id: &str, grace: Duration) -> Result<bool> {
        let Some((_slot, mut guard)) = self.lock_existing_slot(id).await else {
            debug!(id, "Server not running, nothing to stop");
            return Ok(false);
        };
        self.stop_locked(id, &mut guard, grace).await
    }

    async fn stop_locked(
        &self,
        id: &str,
        current: &mut Option<ProcessHandle>,
        grace: Duration,
    ) -> Result<bool> {
        let Some(mut handle) = current.take() else {
            debug!(id, "Server not running, nothing to stop");
            return Ok(false);
        };

        match self.terminate(&mut handle, grace).await {
            Ok(status) => {
                info!(id, %status, "Server stopped");
                drop(handle);
                self.notifier.publish(id, Status::Stopped);
                Ok(true)
            }
            Err(e) => {
                error!(id, error = %e, "Failed to stop server");
                *current = Some(handle);
                Err(e)
            }
        }
    }

    /// Graceful termination with escalation
    async fn terminate(&self, handle: &mut ProcessHandle, grace: Duration) -> Result<ExitStatus> {
        let id = handle.server_id.clone();

        if let Ok(Some(status)) = handle.try_wait() {
            debug!(id = %id, %status, "Process had already exited");
            return Ok(status);
        }

        if let Some(pid) = handle.pid() {
            info!(id = %id, pid, "Sending SIGTERM to Caddy");

            // Send SIGTERM on Unix, or kill on other platforms
            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }

            #[cfg(not(unix))]
            {
                let _ = handle.child.start_kill();
            }
        }

        match tokio::time::timeout(grace, handle.child.wait()).await {
            Ok(Ok(status)) => return Ok(status),
            Ok(Err(e)) => {
                warn!(id = %id, error = %e, "Error waiting for Caddy to exit");
            }
            Err(_) => {
                warn!(
                    id = %id,
                    grace_period_ms = grace.as_millis(),
                    "Grace period exceeded, sending SIGKILL"
                );
            }
        }

        if let Err(e) = handle.child.start_kill() {
            debug!(id = %id, error = %e, "SIGKILL not delivered");
        }

        match tokio::time::timeout(self.caddy.kill_timeout(), handle.child.wait()).await {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(e)) => Err(ServeError::StopFailed {
                id,
                reason: e.to_string(),
            }),
            Err(_) => Err(ServeError::StopFailed {
                id,
                reason: "process still alive after SIGKILL".to_string(),
            }),
        }
    }

    /// Authoritative status of `id`
    ///
    /// Checks that the tracked process is still alive; a process that exited
    /// on its own is dropped and a `Stopped` transition is published.
    pub async fn status(&self, id: &str) -> Status {
        let Some((_slot, mut guard)) = self.lock_existing_slot(id).await else {
            return Status::Stopped;
        };

        let Some(handle) = guard.as_mut() else {
            return Status::Stopped;
        };

        match handle.try_wait() {
            Ok(None) => Status::Running,
            Ok(Some(status)) => {
                warn!(id, %status, "Caddy process exited without being stopped");
                *guard = None;
                self.notifier.publish(id, Status::Stopped);
                Status::Stopped
            }
            Err(e) => {
                warn!(id, error = %e, "Cannot query process state, assuming it is running");
                Status::Running
            }
        }
    }

    /// OS pid of the process supervised here for `id`
    pub async fn pid(&self, id: &str) -> Option<u32> {
        let (_slot, guard) = self.lock_existing_slot(id).await?;
        guard.as_ref().and_then(ProcessHandle::pid)
    }

    /// Status of `id` as seen by every serve process sharing the layout
    pub async fn status_anywhere(&self, id: &str) -> Status {
        if self.status(id).await == Status::Running {
            return Status::Running;
        }

        match pidfile::holder(&self.layout.pid_file_path(id)) {
            Ok(Holder::Process(_)) => Status::Running,
            Ok(Holder::Nobody) => Status::Stopped,
            Err(e) => {
                warn!(id, error = %e, "Cannot inspect pid file");
                Status::Stopped
            }
        }
    }

    /// Stop `id` whether it is supervised here or by another serve process
    ///
    /// A process owned elsewhere is signalled directly and its owner publishes
    /// the transition once it reaps the exit. Returns whether anything was
    /// running.
    pub async fn stop_anywhere(&self, id: &str) -> Result<bool> {
        if self
            .stop_with_grace(id, self.caddy.shutdown_grace_period())
            .await?
        {
            return Ok(true);
        }

        let path = self.layout.pid_file_path(id);
        let pid = match pidfile::holder(&path)? {
            Holder::Nobody => return Ok(false),
            Holder::Process(None) => {
                return Err(ServeError::StopFailed {
                    id: id.to_string(),
                    reason: "still starting in another serve process".to_string(),
                })
            }
            Holder::Process(Some(pid)) => pid,
        };

        info!(id, pid, "Stopping server supervised by another serve process");
        if let Err(e) = send_signal(pid, false) {
            debug!(id, pid, error = %e, "SIGTERM not delivered");
        }
        if wait_released(&path, self.caddy.shutdown_grace_period()).await {
            return Ok(true);
        }

        warn!(id, pid, "Grace period exceeded, sending SIGKILL");
        if let Err(e) = send_signal(pid, true) {
            debug!(id, pid, error = %e, "SIGKILL not delivered");
        }
        if wait_released(&path, self.caddy.kill_timeout() + EXTERNAL_REAP_ALLOWANCE).await {
            return Ok(true);
        }

        Err(ServeError::StopFailed {
            id: id.to_string(),
            reason: format!("process {} is still supervised after SIGKILL", pid),
        })
    }

    /// Ids of all servers whose process is alive
    pub async fn running_servers(&self) -> Vec<String> {
        let ids: Vec<String> = self.slots.iter().map(|e| e.key().clone()).collect();
        let mut running = Vec::new();
        for id in ids {
            if self.status(&id).await == Status::Running {
                running.push(id);
            }
        }
        running.sort();
        running
    }

    /// Stop every supervised process within the shutdown budget
    ///
    /// Processes are stopped concurrently. Failures are collected in the
    /// report rather than returned; whatever is still pending when the budget
    /// runs out is abandoned (its handle is dropped, which sends SIGKILL).
    pub async fn kill_all(&self) -> ShutdownReport {
        let budget = self.caddy.shutdown_budget();
        let grace = self
            .caddy
            .shutdown_grace_period()
            .min(budget.saturating_sub(self.caddy.kill_timeout()));
        let deadline = tokio::time::Instant::now() + budget;

        let ids: Vec<String> = self.slots.iter().map(|e| e.key().clone()).collect();
        let mut remaining: HashSet<String> = ids.iter().cloned().collect();
        let mut report = ShutdownReport::default();

        info!(count = ids.len(), budget_ms = budget.as_millis(), "Stopping all servers");

        let mut pending: FuturesUnordered<_> = ids
            .into_iter()
            .map(|id| async move {
                let result = self.stop_with_grace(&id, grace).await;
                (id, result)
            })
            .collect();

        loop {
            match tokio::time::timeout_at(deadline, pending.next()).await {
                Ok(Some((id, result))) => {
                    remaining.remove(&id);
                    match result {
                        Ok(true) => report.stopped.push(id),
                        Ok(false) => {}
                        Err(e) => {
                            error!(id = %id, error = %e, "Abandoning server that refused to stop");
                            report.abandoned.push(id);
                        }
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    for id in remaining.drain() {
                        error!(id = %id, "Shutdown budget exhausted, abandoning server");
                        report.abandoned.push(id);
                    }
                    break;
                }
            }
        }

        report.stopped.sort();
        report.abandoned.sort();
        info!(
            stopped = report.stopped.len(),
            abandoned = report.abandoned.len(),
            "All servers stopped"
        );
        report
    }

    /// Create and persist a new server with a generated id
    pub fn create_server(&self, root: impl Into<PathBuf>, port: u16) -> Result<ServerDefinition> {
        let definition = ServerDefinition::new(root, port);
        self.add_server(&definition)?;
        Ok(definition)
    }

    /// Persist a new server under its own id
    pub fn add_server(&self, definition: &ServerDefinition) -> Result<()> {
        definition.validate()?;
        if self.layout.exists(&definition.id) {
            return Err(ServeError::Conflict(format!(
                "a server named '{}' already exists",
                definition.id
            )));
        }
        self.layout.write(definition)?;
        info!(id = %definition.id, port = definition.port, "Server created");
        Ok(())
    }

    /// Look up a persisted server
    pub fn server(&self, id: &str) -> Result<ServerDefinition> {
        self.layout
            .read(id)?
            .ok_or_else(|| ServeError::UnknownServer(id.to_string()))
    }

    /// All persisted servers
    pub fn list_servers(&self) -> Result<Vec<ServerDefinition>> {
        self.layout.read_all()
    }

    /// All persisted servers with their status in any serve process
    pub async fn list_statuses(&self) -> Result<Vec<(ServerDefinition, Status)>> {
        let mut statuses = Vec::new();
        for definition in self.layout.read_all()? {
            let status = self.status_anywhere(&definition.id).await;
            statuses.push((definition, status));
        }
        Ok(statuses)
    }

    /// Start a persisted server by id
    pub async fn start_server(&self, id: &str) -> Result<()> {
        let definition = self.server(id)?;
        self.start(&definition).await
    }

    /// Rename a server, moving its directory
    ///
    /// A running server is stopped first and restarted under the new id. The
    /// old id stays locked until its directory is gone.
    pub async fn rename_server(&self, old_id: &str, new_id: &str) -> Result<ServerDefinition> {
        let (slot, mut guard) = self.lock_slot(old_id).await;

        if guard.is_none() {
            self.check_not_supervised_elsewhere(old_id)?;
        }
        let restart = self
            .stop_locked(old_id, &mut guard, self.caddy.shutdown_grace_period())
            .await?;

        let definition = match self.layout.move_server(old_id, new_id) {
            Ok(definition) => definition,
            Err(e) => {
                if restart {
                    match self.server(old_id) {
                        Ok(definition) => {
                            if let Err(start_error) = self.start_locked(&mut guard, &definition).await {
                                warn!(id = old_id, error = %start_error, "Failed to restart after rename error");
                            }
                        }
                        Err(read_error) => {
                            warn!(id = old_id, error = %read_error, "Cannot reload server after rename error");
                        }
                    }
                }
                if guard.is_none() {
                    self.retire_slot(old_id, &slot);
                }
                return Err(e);
            }
        };

        self.retire_slot(old_id, &slot);
        drop(guard);
        info!(from = old_id, to = new_id, "Server renamed");

        if restart {
            self.start(&definition).await?;
        }
        Ok(definition)
    }

    /// Stop a server and delete its directory
    ///
    /// The slot lock is held throughout, so a concurrent `start` either
    /// finishes before the delete or runs after it on a fresh slot.
    pub async fn delete_server(&self, id: &str) -> Result<()> {
        let (slot, mut guard) = self.lock_slot(id).await;

        if guard.is_none() {
            self.check_not_supervised_elsewhere(id)?;
        }
        self.stop_locked(id, &mut guard, self.caddy.shutdown_grace_period())
            .await?;
        let deleted = self.layout.delete(id);
        self.retire_slot(id, &slot);
        deleted?;

        info!(id, "Server deleted");
        Ok(())
    }
}

/// Poll until nobody holds the pid file at `path`
async fn wait_released(path: &Path, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if matches!(pidfile::holder(path), Ok(Holder::Nobody)) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(EXTERNAL_POLL_INTERVAL).await;
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, force: bool) -> std::io::Result<()> {
    let signal = if force { libc::SIGKILL } else { libc::SIGTERM };
    if unsafe { libc::kill(pid as i32, signal) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _force: bool) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "signalling another serve process requires Unix",
    ))
}

fn open_log(path: &Path) -> Result<std::fs::File> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| ServeError::io(dir, e))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| ServeError::io(path, e))
}

#[cfg(unix)]
fn is_elevated() -> bool {
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn is_elevated() -> bool {
    false
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        site: PathBuf,
        manager: Arc<ProcessManager>,
    }

    fn fixture(caddy: CaddyConfig) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let site = tmp.path().join("site");
        std::fs::create_dir_all(&site).unwrap();
        let layout = Layout::new(tmp.path().join("servers"));
        let manager = ProcessManager::new(layout, caddy, StatusNotifier::default());
        Fixture {
            _tmp: tmp,
            site,
            manager,
        }
    }

    fn sleeper() -> CaddyConfig {
        CaddyConfig::command("sleep", "60").with_timings(50, 1000, 1000)
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind(("0.0.0.0", 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn test_unknown_server_is_stopped() {
        let f = fixture(sleeper());
        assert_eq!(f.manager.status("nothing").await, Status::Stopped);
        f.manager.stop("nothing").await.unwrap();
    }

    #[tokio::test]
    async fn test_start_and_stop_publish_transitions() {
        let f = fixture(sleeper());
        let mut events = f.manager.subscribe();
        let def = ServerDefinition::with_id("blog", &f.site, free_port());

        f.manager.start(&def).await.unwrap();
        assert_eq!(f.manager.status("blog").await, Status::Running);
        assert!(f.manager.layout().caddyfile_path("blog").exists());

        f.manager.stop("blog").await.unwrap();
        assert_eq!(f.manager.status("blog").await, Status::Stopped);

        let first = events.recv().await.unwrap();
        let second = events.recv().await.unwrap();
        assert_eq!((first.server_id.as_str(), first.status), ("blog", Status::Running));
        assert_eq!((second.server_id.as_str(), second.status), ("blog", Status::Stopped));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_start_twice_is_noop() {
        let f = fixture(sleeper());
        let mut events = f.manager.subscribe();
        let def = ServerDefinition::with_id("blog", &f.site, free_port());

        f.manager.start(&def).await.unwrap();
        f.manager.start(&def).await.unwrap();

        assert_eq!(events.recv().await.unwrap().status, Status::Running);
        assert!(events.try_recv().is_err());
        assert_eq!(f.manager.running_servers().await, vec!["blog".to_string()]);

        f.manager.stop("blog").await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_when_stopped_emits_nothing() {
        let f = fixture(sleeper());
        let def = ServerDefinition::with_id("blog", &f.site, free_port());
        f.manager.start(&def).await.unwrap();
        f.manager.stop("blog").await.unwrap();

        let mut events = f.manager.subscribe();
        f.manager.stop("blog").await.unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_external_exit_is_reconciled() {
        let f = fixture(sleeper());
        let def = ServerDefinition::with_id("blog", &f.site, free_port());
        f.manager.start(&def).await.unwrap();

        let pid = f.manager.pid("blog").await.unwrap();
        unsafe {
            libc::kill(pid as i32, libc::SIGKILL);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut events = f.manager.subscribe();
        assert_eq!(f.manager.status("blog").await, Status::Stopped);
        assert_eq!(events.recv().await.unwrap().status, Status::Stopped);

        // Nothing left to stop
        f.manager.stop("blog").await.unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_missing_binary_is_launch_error() {
        let f = fixture(CaddyConfig::command("/nonexistent/caddy", "-conf {config}"));
        let mut events = f.manager.subscribe();
        let def = ServerDefinition::with_id("blog", &f.site, free_port());

        let err = f.manager.start(&def).await.unwrap_err();
        assert!(matches!(err, ServeError::Launch { .. }));
        assert_eq!(f.manager.status("blog").await, Status::Stopped);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_process_exiting_at_startup_is_launch_error() {
        let f = fixture(CaddyConfig::command("sh", "-c 'echo boom >&2; exit 3'").with_timings(500, 100, 100));
        let def = ServerDefinition::with_id("blog", &f.site, free_port());

        let err = f.manager.start(&def).await.unwrap_err().to_string();
        assert!(err.contains("exited during startup"));
        assert_eq!(f.manager.status("blog").await, Status::Stopped);

        let log = std::fs::read_to_string(f.manager.layout().error_log_path("blog")).unwrap();
        assert!(log.contains("boom"));
    }

    #[tokio::test]
    async fn test_missing_root_is_invalid() {
        let f = fixture(sleeper());
        let def = ServerDefinition::with_id("blog", f.site.join("missing"), free_port());

        let err = f.manager.start(&def).await.unwrap_err();
        assert!(matches!(err, ServeError::InvalidDefinition(_)));
    }

    #[tokio::test]
    async fn test_privileged_port_requires_root() {
        if is_elevated() {
            return;
        }
        let f = fixture(sleeper());
        let def = ServerDefinition::with_id("blog", &f.site, 80);

        let err = f.manager.start(&def).await.unwrap_err().to_string();
        assert!(err.contains("privileged"));
    }

    #[tokio::test]
    async fn test_bound_port_is_launch_error() {
        let f = fixture(sleeper());
        let listener = std::net::TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let def = ServerDefinition::with_id("blog", &f.site, port);

        let err = f.manager.start(&def).await.unwrap_err();
        assert!(matches!(err, ServeError::Launch { .. }));
        assert!(err.to_string().contains("not available"));
    }

    #[tokio::test]
    async fn test_command_args_placeholders() {
        let f = fixture(CaddyConfig::command(
            "caddy",
            "-conf {config} -port {port} -log '{access_log}' --id={id} -root {root}",
        ));
        let def = ServerDefinition::with_id("blog", &f.site, 8080);
        let layout = f.manager.layout();

        let args = f.manager.command_args(&def).unwrap();
        assert_eq!(
            args,
            vec![
                "-conf".to_string(),
                layout.caddyfile_path("blog").to_string_lossy().into_owned(),
                "-port".to_string(),
                "8080".to_string(),
                "-log".to_string(),
                layout.access_log_path("blog").to_string_lossy().into_owned(),
                "--id=blog".to_string(),
                "-root".to_string(),
                f.site.to_string_lossy().into_owned(),
            ]
        );
    }

    #[tokio::test]
    async fn test_add_server_conflict() {
        let f = fixture(sleeper());
        let def = f.manager.create_server(&f.site, 8080).unwrap();

        let err = f.manager.add_server(&def).unwrap_err();
        assert!(matches!(err, ServeError::Conflict(_)));
        assert_eq!(f.manager.server(&def.id).unwrap(), def);
        assert!(matches!(
            f.manager.server("ghost"),
            Err(ServeError::UnknownServer(_))
        ));
    }

    #[tokio::test]
    async fn test_pid_file_tracks_running_process() {
        let f = fixture(sleeper());
        let def = ServerDefinition::with_id("blog", &f.site, free_port());
        let path = f.manager.layout().pid_file_path("blog");

        f.manager.start(&def).await.unwrap();
        let pid = f.manager.pid("blog").await.unwrap();
        assert_eq!(pidfile::holder(&path).unwrap(), Holder::Process(Some(pid)));

        f.manager.stop("blog").await.unwrap();
        assert!(!path.exists());
        assert_eq!(f.manager.pid("blog").await, None);
    }

    #[tokio::test]
    async fn test_second_manager_sees_and_stops_server() {
        let f = fixture(sleeper());
        let def = ServerDefinition::with_id("blog", &f.site, free_port());
        f.manager.start(&def).await.unwrap();

        let other = ProcessManager::new(
            f.manager.layout().clone(),
            sleeper(),
            StatusNotifier::default(),
        );
        assert_eq!(other.status("blog").await, Status::Stopped);
        assert_eq!(other.status_anywhere("blog").await, Status::Running);
        assert!(matches!(
            other.start(&def).await,
            Err(ServeError::Launch { .. })
        ));
        assert!(matches!(
            other.delete_server("blog").await,
            Err(ServeError::Conflict(_))
        ));
        assert!(f.manager.layout().exists("blog"));

        // The owner reaps its child the way `serve run` polls
        let owner = Arc::clone(&f.manager);
        let reaper = tokio::spawn(async move {
            while owner.status("blog").await == Status::Running {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        });

        assert!(other.stop_anywhere("blog").await.unwrap());
        reaper.await.unwrap();
        assert_eq!(other.status_anywhere("blog").await, Status::Stopped);
        assert!(!other.stop_anywhere("blog").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_retires_slot() {
        let f = fixture(sleeper());
        let def = ServerDefinition::with_id("blog", &f.site, free_port());
        f.manager.start(&def).await.unwrap();
        let before = f.manager.existing_slot("blog").unwrap();

        f.manager.delete_server("blog").await.unwrap();
        assert!(f.manager.existing_slot("blog").is_none());
        assert!(!f.manager.is_current("blog", &before));

        f.manager.start(&def).await.unwrap();
        let after = f.manager.existing_slot("blog").unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(f.manager.status("blog").await, Status::Running);

        f.manager.stop("blog").await.unwrap();
    }

    #[tokio::test]
    async fn test_start_waiting_on_retired_slot_uses_fresh_slot() {
        let f = fixture(sleeper());
        let def = ServerDefinition::with_id("blog", &f.site, free_port());

        let (retired, guard) = f.manager.lock_slot("blog").await;
        let manager = Arc::clone(&f.manager);
        let start_def = def.clone();
        let start = tokio::spawn(async move { manager.start(&start_def).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        f.manager.retire_slot("blog", &retired);
        drop(guard);

        start.await.unwrap().unwrap();
        assert!(!f.manager.is_current("blog", &retired));
        assert!(retired.lock().await.is_none());
        assert_eq!(f.manager.status("blog").await, Status::Running);

        f.manager.stop("blog").await.unwrap();
    }
}
