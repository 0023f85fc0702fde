use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use tracing::{debug, info};

use super::ChromeError;
use super::discovery::query_version;
use super::platform::{
    LockState, clear_stale_lock, find_chrome_executable, process_alive, profile_lock_state,
};

/// Configuration for ensuring a debuggable Chrome is available.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Explicit executable path; platform discovery otherwise.
    pub executable: Option<PathBuf>,
    /// Remote debugging port.
    pub port: u16,
    /// Launch headless.
    pub headless: bool,
    /// Additional Chrome command-line arguments.
    pub extra_args: Vec<String>,
    /// User data directory. A temporary directory is created if `None`.
    pub user_data_dir: Option<PathBuf>,
    /// Whether `ensure` may spawn a new process when none is listening.
    pub auto_launch: bool,
    /// Total time to wait for a spawned Chrome to bind the port.
    pub start_timeout: Duration,
    /// Grace period for an already-starting Chrome to finish binding.
    pub retry_window: Duration,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            executable: None,
            port: 9222,
            headless: false,
            extra_args: Vec::new(),
            user_data_dir: None,
            auto_launch: false,
            start_timeout: Duration::from_secs(30),
            retry_window: Duration::from_secs(5),
        }
    }
}

/// Result of [`ensure`]: where to connect, and the process handle when
/// this call spawned one.
pub struct EnsureOutcome {
    pub ws_url: String,
    pub port: u16,
    pub process: Option<ChromeProcess>,
}

/// A handle to a Chrome process spawned by this server.
pub struct ChromeProcess {
    child: Option<std::process::Child>,
    port: u16,
    temp_dir: Option<TempDir>,
}

/// A temporary directory removed on drop.
struct TempDir {
    path: PathBuf,
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

impl ChromeProcess {
    /// PID of the Chrome process.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.child.as_ref().map_or(0, std::process::Child::id)
    }

    /// Remote debugging port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Kill the Chrome process and clean up its temp profile.
    pub fn kill(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    /// Detach so Chrome keeps running after this handle drops.
    ///
    /// Returns `(pid, port)`; the caller owns the process lifetime and
    /// the temp profile directory is left in place.
    #[must_use]
    pub fn detach(mut self) -> (u32, u16) {
        let pid = self.pid();
        let port = self.port;
        self.child = None;
        if let Some(td) = self.temp_dir.take() {
            // Chrome still needs the profile; leak the path.
            std::mem::forget(td);
        }
        (pid, port)
    }
}

impl Drop for ChromeProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Ensure a browser is listening on the configured debug port.
///
/// If `/json/version` responds, returns its WebSocket endpoint. When the
/// profile lock shows a Chrome mid-startup, the probe retries for
/// `retry_window` before concluding nothing is there. Otherwise, with
/// auto-launch enabled, locates the binary and spawns one.
///
/// # Errors
///
/// - `ChromeError::NotRunning` when nothing is listening and auto-launch
///   is disabled.
/// - `ChromeError::NotFound` when no binary can be located.
/// - `ChromeError::ProfileLocked` when the profile is held by a live
///   process that is not serving the debug port.
/// - `ChromeError::StartupTimeout` when a spawned Chrome never binds.
pub async fn ensure(config: &LaunchConfig) -> Result<EnsureOutcome, ChromeError> {
    if let Ok(version) = query_version("127.0.0.1", config.port).await {
        return Ok(EnsureOutcome {
            ws_url: version.ws_debugger_url,
            port: config.port,
            process: None,
        });
    }

    // A held lock usually means Chrome is still binding the port; give
    // it the retry window before deciding.
    if let Some(dir) = profile_dir(config) {
        if matches!(profile_lock_state(&dir), LockState::Locked { .. }) {
            let deadline = tokio::time::Instant::now() + config.retry_window;
            while tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(250)).await;
                if let Ok(version) = query_version("127.0.0.1", config.port).await {
                    return Ok(EnsureOutcome {
                        ws_url: version.ws_debugger_url,
                        port: config.port,
                        process: None,
                    });
                }
            }
        }
    }

    if !config.auto_launch {
        return Err(ChromeError::NotRunning(format!(
            "nothing is listening on port {}; start Chrome with --remote-debugging-port={} or enable auto-launch",
            config.port, config.port
        )));
    }

    let process = launch(config).await?;
    let version = query_version("127.0.0.1", config.port).await?;
    Ok(EnsureOutcome {
        ws_url: version.ws_debugger_url,
        port: config.port,
        process: Some(process),
    })
}

/// Restart the browser on the configured profile: graceful quit, wait
/// for the profile lock to release, then spawn fresh.
///
/// # Errors
///
/// Returns `ChromeError::ProfileLocked` if the old process will not
/// release the profile, plus any [`ensure`]-style launch error.
pub async fn restart(config: &LaunchConfig) -> Result<ChromeProcess, ChromeError> {
    if let Some(dir) = profile_dir(config) {
        if let LockState::Locked { pid, .. } = profile_lock_state(&dir) {
            info!(pid, "requesting graceful Chrome shutdown");
            terminate_pid(pid, Duration::from_secs(10)).await;

            // Wait for the lock file to disappear or go stale.
            let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
            loop {
                match profile_lock_state(&dir) {
                    LockState::Unlocked | LockState::Stale { .. } => break,
                    LockState::Locked { pid, .. } => {
                        if tokio::time::Instant::now() >= deadline {
                            return Err(ChromeError::ProfileLocked { pid });
                        }
                        tokio::time::sleep(Duration::from_millis(250)).await;
                    }
                }
            }
        }
    }

    launch(config).await
}

/// Send SIGTERM to a process (group first, then the pid itself), poll
/// for exit, and escalate to SIGKILL after `grace`.
pub async fn terminate_pid(pid: u32, grace: Duration) {
    #[cfg(unix)]
    {
        #[allow(clippy::cast_possible_wrap)]
        let pid_i32 = pid as libc::pid_t;
        // A negative pid targets the process group; fall back to the
        // single process when no group exists.
        let term_result = unsafe { libc::kill(-pid_i32, libc::SIGTERM) };
        if term_result != 0 {
            unsafe { libc::kill(pid_i32, libc::SIGTERM) };
        }

        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            if !process_alive(pid) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        debug!(pid, "escalating to SIGKILL");
        let kill_result = unsafe { libc::kill(-pid_i32, libc::SIGKILL) };
        if kill_result != 0 {
            unsafe { libc::kill(pid_i32, libc::SIGKILL) };
        }
    }

    #[cfg(not(unix))]
    {
        let _ = (pid, grace);
    }
}

fn profile_dir(config: &LaunchConfig) -> Option<PathBuf> {
    config
        .user_data_dir
        .clone()
        .or_else(super::platform::default_user_data_dir)
}

/// Spawn a Chrome process and poll the debug endpoint until ready.
///
/// # Errors
///
/// Returns `ChromeError::LaunchFailed` if the process cannot spawn or
/// exits before becoming ready, `ChromeError::StartupTimeout` when it
/// never binds the port.
async fn launch(config: &LaunchConfig) -> Result<ChromeProcess, ChromeError> {
    let executable = match &config.executable {
        Some(path) => path.clone(),
        None => find_chrome_executable()?,
    };

    let (data_dir, temp_dir) = if let Some(dir) = &config.user_data_dir {
        (dir.clone(), None)
    } else {
        let dir = std::env::temp_dir().join(format!("tabfleet-{}", random_suffix()));
        std::fs::create_dir_all(&dir)?;
        let td = TempDir { path: dir.clone() };
        (dir, Some(td))
    };

    // A stale lock would make Chrome refuse the profile.
    if let LockState::Stale { pid } = profile_lock_state(&data_dir) {
        debug!(pid, "clearing stale profile lock");
        clear_stale_lock(&data_dir)?;
    }

    let mut cmd = Command::new(&executable);
    cmd.arg(format!("--remote-debugging-port={}", config.port))
        .arg(format!("--user-data-dir={}", data_dir.display()))
        .arg("--no-first-run")
        .arg("--no-default-browser-check");

    if config.headless {
        cmd.arg("--headless=new");
    }

    for arg in &config.extra_args {
        cmd.arg(arg);
    }

    cmd.stdout(Stdio::null()).stderr(Stdio::null());

    let child = cmd.spawn().map_err(|e| {
        ChromeError::LaunchFailed(format!("failed to spawn {}: {e}", executable.display()))
    })?;

    let mut process = ChromeProcess {
        child: Some(child),
        port: config.port,
        temp_dir,
    };

    let start = tokio::time::Instant::now();
    let poll_interval = Duration::from_millis(100);

    loop {
        if start.elapsed() > config.start_timeout {
            process.kill();
            return Err(ChromeError::StartupTimeout { port: config.port });
        }

        // Fail fast if the child died instead of binding.
        if let Some(child) = process.child.as_mut() {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(ChromeError::LaunchFailed(format!(
                    "Chrome exited with status {status} before becoming ready"
                )));
            }
        }

        if query_version("127.0.0.1", config.port).await.is_ok() {
            info!(port = config.port, pid = process.pid(), "Chrome is ready");
            return Ok(process);
        }

        tokio::time::sleep(poll_interval).await;
    }
}

/// Find an available TCP port on localhost.
///
/// # Errors
///
/// Returns `ChromeError::LaunchFailed` if binding fails.
pub fn find_available_port() -> Result<u16, ChromeError> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").map_err(|e| {
        ChromeError::LaunchFailed(format!("could not bind to find a free port: {e}"))
    })?;
    let port = listener
        .local_addr()
        .map_err(|e| ChromeError::LaunchFailed(format!("could not get local address: {e}")))?
        .port();
    drop(listener);
    Ok(port)
}

/// Random hex suffix for temp directory names. Reads `/dev/urandom` on
/// Unix, falling back to PID + stack address.
fn random_suffix() -> String {
    use std::io::Read;
    let mut buf = [0u8; 8];
    if let Ok(mut f) = std::fs::File::open("/dev/urandom") {
        if f.read_exact(&mut buf).is_ok() {
            return hex_encode(&buf);
        }
    }
    let pid = std::process::id();
    let addr = &raw const buf as usize;
    format!("{pid:x}-{addr:x}")
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(s, "{b:02x}");
    }
    s
}
