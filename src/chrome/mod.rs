mod discovery;
mod error;
mod launcher;
mod platform;
mod state;

pub use discovery::{BrowserVersion, discover, query_version, read_devtools_active_port};
pub use error::ChromeError;
pub use launcher::{
    ChromeProcess, EnsureOutcome, LaunchConfig, ensure, find_available_port, restart,
    terminate_pid,
};
pub use platform::{
    LockState, clear_stale_lock, default_user_data_dir, find_chrome_executable, process_alive,
    profile_lock_state,
};
pub use state::{SpawnedChrome, delete_state, read_state, state_file_path, write_state};
