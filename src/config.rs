use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default config file template with comments, written by `setup`.
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# tabfleet configuration file

# Browser process
# [chrome]
# port = 9222
# auto_launch = false
# executable = "/path/to/chrome"
# headless = false
# extra_args = ["--disable-gpu"]
# user_data_dir = "/path/to/profile"

# Server limits
# [server]
# max_sessions = 20
# session_ttl_ms = 1800000
# cleanup_interval_ms = 60000
# command_timeout_ms = 30000

# Page pool (max_size = 0 disables tab recycling)
# [pool]
# min_size = 0
# max_size = 0
# idle_timeout_ms = 300000
# pre_warm = false

# Screenshot scheduler
# [screenshot]
# concurrency = 5
# format = "webp"          # webp, png, jpeg
# quality = 80

# Navigation policy
# [policy]
# blocked_domains = ["*.doubleclick.net"]
"#;

// ---------------------------------------------------------------------------
// Config structs (parsed from TOML)
// ---------------------------------------------------------------------------

/// The parsed TOML config file. All fields optional.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConfigFile {
    pub chrome: ChromeSection,
    pub server: ServerSection,
    pub pool: PoolSection,
    pub screenshot: ScreenshotSection,
    pub policy: PolicySection,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChromeSection {
    pub port: Option<u16>,
    pub auto_launch: Option<bool>,
    pub executable: Option<String>,
    pub headless: Option<bool>,
    pub extra_args: Option<Vec<String>>,
    pub user_data_dir: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerSection {
    pub max_sessions: Option<usize>,
    pub session_ttl_ms: Option<u64>,
    pub cleanup_interval_ms: Option<u64>,
    pub command_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolSection {
    pub min_size: Option<usize>,
    pub max_size: Option<usize>,
    pub idle_timeout_ms: Option<u64>,
    pub pre_warm: Option<bool>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScreenshotSection {
    pub concurrency: Option<usize>,
    pub format: Option<String>,
    pub quality: Option<u32>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PolicySection {
    pub blocked_domains: Option<Vec<String>>,
}

// ---------------------------------------------------------------------------
// Resolved config (all defaults filled in)
// ---------------------------------------------------------------------------

/// Fully resolved configuration with defaults and environment overrides
/// applied.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub config_path: Option<PathBuf>,
    pub chrome_port: u16,
    pub auto_launch: bool,
    pub chrome_executable: Option<PathBuf>,
    pub headless: bool,
    pub chrome_extra_args: Vec<String>,
    pub user_data_dir: Option<PathBuf>,
    pub max_sessions: usize,
    pub session_ttl: Duration,
    pub cleanup_interval: Duration,
    pub command_timeout: Duration,
    pub pool_min_size: usize,
    pub pool_max_size: usize,
    pub pool_idle_timeout: Duration,
    pub pool_pre_warm: bool,
    pub screenshot_concurrency: usize,
    pub screenshot_format: String,
    pub screenshot_quality: u32,
    pub blocked_domains: Vec<String>,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from config loading.
#[derive(Debug)]
pub enum ConfigError {
    /// I/O error reading or writing the file.
    Io(std::io::Error),
    /// The file is not valid TOML.
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config file error: {e}"),
            Self::Invalid(msg) => write!(f, "invalid config file: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Invalid(_) => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Default config path: `<config dir>/tabfleet/config.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("tabfleet").join("config.toml"))
}

/// Load the config file from an explicit path or the default location.
/// A missing file yields an empty config, not an error.
///
/// # Errors
///
/// Returns `ConfigError::Invalid` for unparseable TOML, `ConfigError::Io`
/// for read failures other than "not found".
pub fn load_config(
    explicit: Option<&Path>,
) -> Result<(Option<PathBuf>, ConfigFile), ConfigError> {
    let path = match explicit {
        Some(p) => Some(p.to_path_buf()),
        None => default_config_path(),
    };
    let Some(path) = path else {
        return Ok((None, ConfigFile::default()));
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => {
            let file: ConfigFile =
                toml::from_str(&contents).map_err(|e| ConfigError::Invalid(e.to_string()))?;
            Ok((Some(path), file))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Ok((None, ConfigFile::default()))
        }
        Err(e) => Err(ConfigError::Io(e)),
    }
}

/// Write the commented template to `path`, creating parent directories.
///
/// # Errors
///
/// Returns `ConfigError::Io` on filesystem failure.
pub fn write_template(path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, DEFAULT_CONFIG_TEMPLATE)?;
    Ok(())
}

/// Resolve a parsed file into a full configuration, applying defaults
/// and the `TABFLEET_CDP_PORT` / `TABFLEET_SCREENSHOT_CONCURRENCY`
/// environment overrides.
#[must_use]
pub fn resolve(config_path: Option<PathBuf>, file: &ConfigFile) -> ResolvedConfig {
    resolve_with_env(config_path, file, &env_override)
}

fn env_override(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Testable core of [`resolve`]: the environment is a lookup function.
#[must_use]
pub fn resolve_with_env(
    config_path: Option<PathBuf>,
    file: &ConfigFile,
    env: &dyn Fn(&str) -> Option<String>,
) -> ResolvedConfig {
    let chrome_port = env("TABFLEET_CDP_PORT")
        .and_then(|v| v.parse().ok())
        .or(file.chrome.port)
        .unwrap_or(9222);
    let screenshot_concurrency = env("TABFLEET_SCREENSHOT_CONCURRENCY")
        .and_then(|v| v.parse().ok())
        .or(file.screenshot.concurrency)
        .unwrap_or(crate::screenshot::DEFAULT_CONCURRENCY);

    ResolvedConfig {
        config_path,
        chrome_port,
        auto_launch: file.chrome.auto_launch.unwrap_or(false),
        chrome_executable: file.chrome.executable.as_ref().map(PathBuf::from),
        headless: file.chrome.headless.unwrap_or(false),
        chrome_extra_args: file.chrome.extra_args.clone().unwrap_or_default(),
        user_data_dir: file.chrome.user_data_dir.as_ref().map(PathBuf::from),
        max_sessions: file.server.max_sessions.unwrap_or(20),
        session_ttl: Duration::from_millis(file.server.session_ttl_ms.unwrap_or(1_800_000)),
        cleanup_interval: Duration::from_millis(
            file.server.cleanup_interval_ms.unwrap_or(60_000),
        ),
        command_timeout: Duration::from_millis(file.server.command_timeout_ms.unwrap_or(30_000)),
        pool_min_size: file.pool.min_size.unwrap_or(0),
        pool_max_size: file.pool.max_size.unwrap_or(0),
        pool_idle_timeout: Duration::from_millis(file.pool.idle_timeout_ms.unwrap_or(300_000)),
        pool_pre_warm: file.pool.pre_warm.unwrap_or(false),
        screenshot_concurrency,
        screenshot_format: file
            .screenshot
            .format
            .clone()
            .unwrap_or_else(|| "webp".into()),
        screenshot_quality: file.screenshot.quality.unwrap_or(80),
        blocked_domains: file.policy.blocked_domains.clone().unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_key: &str) -> Option<String> {
        None
    }

    #[test]
    fn empty_file_resolves_to_defaults() {
        let resolved = resolve_with_env(None, &ConfigFile::default(), &no_env);
        assert_eq!(resolved.chrome_port, 9222);
        assert!(!resolved.auto_launch);
        assert_eq!(resolved.max_sessions, 20);
        assert_eq!(resolved.session_ttl, Duration::from_secs(1800));
        assert_eq!(resolved.command_timeout, Duration::from_secs(30));
        assert_eq!(resolved.pool_max_size, 0);
        assert_eq!(resolved.screenshot_concurrency, 5);
        assert_eq!(resolved.screenshot_format, "webp");
        assert_eq!(resolved.screenshot_quality, 80);
        assert!(resolved.blocked_domains.is_empty());
    }

    #[test]
    fn file_values_override_defaults() {
        let file: ConfigFile = toml::from_str(
            r#"
            [chrome]
            port = 9333
            auto_launch = true

            [pool]
            min_size = 5
            max_size = 10
            pre_warm = true

            [policy]
            blocked_domains = ["*.ads.example"]
            "#,
        )
        .unwrap();
        let resolved = resolve_with_env(None, &file, &no_env);
        assert_eq!(resolved.chrome_port, 9333);
        assert!(resolved.auto_launch);
        assert_eq!(resolved.pool_min_size, 5);
        assert_eq!(resolved.pool_max_size, 10);
        assert!(resolved.pool_pre_warm);
        assert_eq!(resolved.blocked_domains, vec!["*.ads.example"]);
    }

    #[test]
    fn env_overrides_beat_file_values() {
        let file: ConfigFile = toml::from_str(
            r"
            [chrome]
            port = 9333

            [screenshot]
            concurrency = 3
            ",
        )
        .unwrap();
        let env = |key: &str| match key {
            "TABFLEET_CDP_PORT" => Some("9444".to_string()),
            "TABFLEET_SCREENSHOT_CONCURRENCY" => Some("8".to_string()),
            _ => None,
        };
        let resolved = resolve_with_env(None, &file, &env);
        assert_eq!(resolved.chrome_port, 9444);
        assert_eq!(resolved.screenshot_concurrency, 8);
    }

    #[test]
    fn unparseable_env_falls_back() {
        let env = |key: &str| {
            (key == "TABFLEET_CDP_PORT").then(|| "not-a-port".to_string())
        };
        let resolved = resolve_with_env(None, &ConfigFile::default(), &env);
        assert_eq!(resolved.chrome_port, 9222);
    }

    #[test]
    fn template_parses_as_valid_toml() {
        let parsed: Result<ConfigFile, _> = toml::from_str(DEFAULT_CONFIG_TEMPLATE);
        assert!(parsed.is_ok());
    }

    #[test]
    fn load_missing_file_is_empty_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let (found, file) = load_config(Some(&path)).unwrap();
        assert!(found.is_none());
        assert!(file.chrome.port.is_none());
    }

    #[test]
    fn load_invalid_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "chrome = nonsense[").unwrap();
        assert!(matches!(
            load_config(Some(&path)),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn write_template_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        write_template(&path).unwrap();
        let (found, _file) = load_config(Some(&path)).unwrap();
        assert_eq!(found.as_deref(), Some(path.as_path()));
    }
}
