use std::path::{Path, PathBuf};

use super::ChromeError;

/// Find a Chrome executable.
///
/// Checks the `CHROME_PATH` environment variable first, then falls back
/// to platform-specific well-known paths.
///
/// # Errors
///
/// Returns `ChromeError::NotFound` if no executable can be located.
pub fn find_chrome_executable() -> Result<PathBuf, ChromeError> {
    let env_override = std::env::var("CHROME_PATH").ok().map(PathBuf::from);
    find_chrome_from(env_override.as_deref())
}

/// Testable core of [`find_chrome_executable`]: the environment override
/// is a parameter instead of being read directly.
fn find_chrome_from(env_override: Option<&Path>) -> Result<PathBuf, ChromeError> {
    if let Some(p) = env_override {
        if p.exists() {
            return Ok(p.to_path_buf());
        }
    }

    for candidate in chrome_candidates() {
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    Err(ChromeError::NotFound(
        "no Chrome or Chromium executable on this system; set CHROME_PATH to the binary".into(),
    ))
}

/// Returns the default Chrome user data directory for the current platform.
#[must_use]
pub fn default_user_data_dir() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        dirs::home_dir().map(|h| h.join("Library/Application Support/Google/Chrome"))
    }

    #[cfg(target_os = "linux")]
    {
        dirs::home_dir().map(|h| h.join(".config/google-chrome"))
    }

    #[cfg(target_os = "windows")]
    {
        std::env::var("LOCALAPPDATA").ok().map(|d| {
            PathBuf::from(d)
                .join("Google")
                .join("Chrome")
                .join("User Data")
        })
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        None
    }
}

/// Returns all candidate executable paths on the current platform.
fn chrome_candidates() -> Vec<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        vec![
            PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
            PathBuf::from("/Applications/Chromium.app/Contents/MacOS/Chromium"),
        ]
    }

    #[cfg(target_os = "linux")]
    {
        let path_dirs: Vec<PathBuf> = std::env::var("PATH")
            .unwrap_or_default()
            .split(':')
            .map(PathBuf::from)
            .collect();
        let names = [
            "google-chrome",
            "google-chrome-stable",
            "chromium-browser",
            "chromium",
        ];
        let mut candidates = Vec::new();
        for name in names {
            for dir in &path_dirs {
                candidates.push(dir.join(name));
            }
        }
        candidates
    }

    #[cfg(target_os = "windows")]
    {
        let program_files = std::env::var("ProgramFiles").unwrap_or_default();
        let program_files_x86 = std::env::var("ProgramFiles(x86)").unwrap_or_default();
        vec![
            PathBuf::from(&program_files).join("Google/Chrome/Application/chrome.exe"),
            PathBuf::from(&program_files_x86).join("Google/Chrome/Application/chrome.exe"),
        ]
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        vec![]
    }
}

// ---------------------------------------------------------------------------
// Profile lock
// ---------------------------------------------------------------------------

/// State of a profile's singleton lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    /// No lock present.
    Unlocked,
    /// Lock held by a live process.
    Locked { pid: u32, hostname: String },
    /// Lock exists but its owner is dead. Treated as unlocked by
    /// launch paths.
    Stale { pid: u32 },
}

/// Inspect the profile lock for a user data directory.
///
/// On Linux and macOS the lock is a `SingletonLock` symlink whose target
/// is `hostname-pid` (a `SingletonSocket` regular file sits next to it).
/// On Windows it is a regular file named `lockfile` whose owner cannot
/// be probed, so any present lock is reported as held.
#[must_use]
pub fn profile_lock_state(user_data_dir: &Path) -> LockState {
    #[cfg(unix)]
    {
        let lock = user_data_dir.join("SingletonLock");
        let Ok(link_target) = std::fs::read_link(&lock) else {
            return LockState::Unlocked;
        };
        let target = link_target.to_string_lossy().into_owned();
        match parse_lock_target(&target) {
            Some((hostname, pid)) => {
                if process_alive(pid) {
                    LockState::Locked { pid, hostname }
                } else {
                    LockState::Stale { pid }
                }
            }
            // Unparseable target: assume the lock is stale garbage.
            None => LockState::Stale { pid: 0 },
        }
    }

    #[cfg(windows)]
    {
        if user_data_dir.join("lockfile").exists() {
            LockState::Locked {
                pid: 0,
                hostname: String::new(),
            }
        } else {
            LockState::Unlocked
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = user_data_dir;
        LockState::Unlocked
    }
}

/// Parse a `hostname-pid` lock target. The hostname may itself contain
/// dashes, so the PID is the substring after the last dash.
fn parse_lock_target(target: &str) -> Option<(String, u32)> {
    let (hostname, pid_str) = target.rsplit_once('-')?;
    let pid: u32 = pid_str.parse().ok()?;
    Some((hostname.to_owned(), pid))
}

/// Whether a PID refers to a live process (`kill(pid, 0)`).
#[cfg(unix)]
#[must_use]
pub fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    #[allow(clippy::cast_possible_wrap)]
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    result == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
#[must_use]
pub fn process_alive(_pid: u32) -> bool {
    false
}

/// Remove a stale singleton lock so a fresh Chrome can start.
///
/// # Errors
///
/// Returns `ChromeError::Io` if the lock exists but cannot be removed.
pub fn clear_stale_lock(user_data_dir: &Path) -> Result<(), ChromeError> {
    #[cfg(unix)]
    {
        for name in ["SingletonLock", "SingletonSocket", "SingletonCookie"] {
            let path = user_data_dir.join(name);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(ChromeError::Io(e)),
            }
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        let _ = user_data_dir;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_lock_target_simple() {
        let (hostname, pid) = parse_lock_target("myhost-1234").unwrap();
        assert_eq!(hostname, "myhost");
        assert_eq!(pid, 1234);
    }

    #[test]
    fn parse_lock_target_hostname_with_dashes() {
        let (hostname, pid) = parse_lock_target("my-dev-box-99").unwrap();
        assert_eq!(hostname, "my-dev-box");
        assert_eq!(pid, 99);
    }

    #[test]
    fn parse_lock_target_invalid() {
        assert!(parse_lock_target("nodash").is_none());
        assert!(parse_lock_target("host-notapid").is_none());
    }

    #[test]
    fn chrome_path_override_existing_file() {
        let exe = std::env::current_exe().unwrap();
        let result = find_chrome_from(Some(&exe));
        assert_eq!(result.unwrap(), exe);
    }

    #[test]
    fn chrome_path_override_nonexistent_is_skipped() {
        let fake = Path::new("/nonexistent/tabfleet-test-binary");
        if let Ok(path) = find_chrome_from(Some(fake)) {
            assert_ne!(path.as_path(), fake);
        }
    }

    #[test]
    fn missing_lock_is_unlocked() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(profile_lock_state(dir.path()), LockState::Unlocked);
    }

    #[cfg(unix)]
    #[test]
    fn live_lock_is_locked() {
        let dir = tempfile::tempdir().unwrap();
        let target = format!("testhost-{}", std::process::id());
        std::os::unix::fs::symlink(&target, dir.path().join("SingletonLock")).unwrap();

        match profile_lock_state(dir.path()) {
            LockState::Locked { pid, hostname } => {
                assert_eq!(pid, std::process::id());
                assert_eq!(hostname, "testhost");
            }
            other => panic!("expected Locked, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn dead_pid_lock_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        // PID near the typical pid_max; almost certainly not running.
        std::os::unix::fs::symlink("testhost-4194000", dir.path().join("SingletonLock"))
            .unwrap();

        match profile_lock_state(dir.path()) {
            LockState::Stale { pid } => assert_eq!(pid, 4_194_000),
            other => panic!("expected Stale, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn clear_stale_lock_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink("h-4194000", dir.path().join("SingletonLock")).unwrap();
        std::fs::write(dir.path().join("SingletonSocket"), b"").unwrap();

        clear_stale_lock(dir.path()).unwrap();
        assert_eq!(profile_lock_state(dir.path()), LockState::Unlocked);
        assert!(!dir.path().join("SingletonSocket").exists());
    }

    #[test]
    fn clear_stale_lock_on_empty_dir_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        assert!(clear_stale_lock(dir.path()).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn current_process_is_alive() {
        assert!(process_alive(std::process::id()));
    }

    #[test]
    fn pid_zero_is_not_alive() {
        assert!(!process_alive(0));
    }
}
