use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::ChromeError;

/// Record of a Chrome process spawned by `serve`, persisted so `stop`
/// and `doctor` can find it in a later invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnedChrome {
    pub port: u16,
    pub pid: u32,
    /// Temp profile directory to remove once the process is gone, if
    /// the server created one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_data_dir: Option<PathBuf>,
}

/// Path of the state file: `<config dir>/tabfleet/chrome.json`.
///
/// # Errors
///
/// Returns `ChromeError::Io` when no config directory can be determined.
pub fn state_file_path() -> Result<PathBuf, ChromeError> {
    let base = dirs::config_dir().ok_or_else(|| {
        ChromeError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no user configuration directory",
        ))
    })?;
    Ok(base.join("tabfleet").join("chrome.json"))
}

/// Write the state file atomically (temp file + rename), `0o600` on Unix.
///
/// # Errors
///
/// Returns `ChromeError::Io` on filesystem failure.
pub fn write_state(path: &Path, state: &SpawnedChrome) -> Result<(), ChromeError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(state)
        .map_err(|e| ChromeError::ParseError(e.to_string()))?;

    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &json)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))?;
    }

    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Read the state file. `Ok(None)` when it does not exist.
///
/// # Errors
///
/// Returns `ChromeError::ParseError` on invalid JSON, `ChromeError::Io`
/// on other failures.
pub fn read_state(path: &Path) -> Result<Option<SpawnedChrome>, ChromeError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let state: SpawnedChrome = serde_json::from_str(&contents)
                .map_err(|e| ChromeError::ParseError(e.to_string()))?;
            Ok(Some(state))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ChromeError::Io(e)),
    }
}

/// Delete the state file. Missing files are fine.
///
/// # Errors
///
/// Returns `ChromeError::Io` on failures other than "not found".
pub fn delete_state(path: &Path) -> Result<(), ChromeError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ChromeError::Io(e)),
    }
}
