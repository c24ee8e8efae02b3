//! Launcher configuration

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable overriding the helper executable path
pub const LAUNCHER_ENV: &str = "PROCLAUNCH_LAUNCHER";

/// Environment variable overriding the directory the socket is created in
pub const SOCKET_DIR_ENV: &str = "PROCLAUNCH_SOCKET_DIR";

/// File name of the bundled helper executable
pub const LAUNCHER_BINARY: &str = "proclaunch-launcher";

/// Configuration for a [`LauncherInterface`](crate::LauncherInterface)
///
/// Controls where the helper executable is found, where its socket lives and
/// how long teardown may take.
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Path to the helper executable
    pub launcher_path: PathBuf,

    /// Directory the listening socket is created in
    pub socket_dir: PathBuf,

    /// How long `shutdown` waits for the Shutdown packet to be written
    pub shutdown_flush_timeout: Duration,

    /// How long `stop` waits for the helper to exit before killing its process group
    pub stop_timeout: Duration,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            launcher_path: default_launcher_path(),
            socket_dir: env::temp_dir(),
            shutdown_flush_timeout: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

impl LauncherConfig {
    /// Create a configuration for the given helper executable
    pub fn new(launcher_path: impl Into<PathBuf>) -> Self {
        Self {
            launcher_path: launcher_path.into(),
            ..Self::default()
        }
    }

    /// Defaults, overridden by `PROCLAUNCH_LAUNCHER` and `PROCLAUNCH_SOCKET_DIR`
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(path) = env::var_os(LAUNCHER_ENV).filter(|v| !v.is_empty()) {
            config.launcher_path = PathBuf::from(path);
        }
        if let Some(dir) = env::var_os(SOCKET_DIR_ENV).filter(|v| !v.is_empty()) {
            config.socket_dir = PathBuf::from(dir);
        }
        config
    }

    /// Set the helper executable path
    pub fn with_launcher_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.launcher_path = path.into();
        self
    }

    /// Set the socket directory
    pub fn with_socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = dir.into();
        self
    }

    /// Set the Shutdown write timeout
    pub fn with_shutdown_flush_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_flush_timeout = timeout;
        self
    }

    /// Set the helper exit timeout
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Socket path for one launcher instance of this host process
    pub fn socket_path(&self, instance: u64) -> PathBuf {
        self.socket_dir.join(format!(
            "proclaunch-{}-{}.sock",
            std::process::id(),
            instance
        ))
    }
}

/// The helper next to the current executable, or a bare name resolved through `PATH`
fn default_launcher_path() -> PathBuf {
    env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(LAUNCHER_BINARY)))
        .filter(|path| path.is_file())
        .unwrap_or_else(|| PathBuf::from(LAUNCHER_BINARY))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = LauncherConfig::default();
        assert_eq!(config.socket_dir, env::temp_dir());
        assert_eq!(config.shutdown_flush_timeout, Duration::from_secs(1));
        assert_eq!(config.stop_timeout, Duration::from_secs(10));
        assert!(config.launcher_path.ends_with(LAUNCHER_BINARY));
    }

    #[test]
    fn test_config_builder() {
        let config = LauncherConfig::new("/opt/launcher")
            .with_socket_dir("/run/user/1000")
            .with_shutdown_flush_timeout(Duration::from_millis(250))
            .with_stop_timeout(Duration::from_secs(2));

        assert_eq!(config.launcher_path, PathBuf::from("/opt/launcher"));
        assert_eq!(config.socket_dir, PathBuf::from("/run/user/1000"));
        assert_eq!(config.shutdown_flush_timeout, Duration::from_millis(250));
        assert_eq!(config.stop_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_socket_path_is_unique_per_instance() {
        let config = LauncherConfig::default().with_socket_dir("/tmp/x");
        let first = config.socket_path(1);
        let second = config.socket_path(2);

        assert_ne!(first, second);
        assert!(first.starts_with("/tmp/x"));
        let name = first.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.contains(&std::process::id().to_string()));
    }

    #[test]
    fn test_from_env_overrides() {
        temp_env::with_vars(
            [
                (LAUNCHER_ENV, Some("/custom/launcher")),
                (SOCKET_DIR_ENV, Some("/custom/sockets")),
            ],
            || {
                let config = LauncherConfig::from_env();
                assert_eq!(config.launcher_path, PathBuf::from("/custom/launcher"));
                assert_eq!(config.socket_dir, PathBuf::from("/custom/sockets"));
            },
        );
    }

    #[test]
    fn test_from_env_ignores_empty_values() {
        temp_env::with_vars(
            [(LAUNCHER_ENV, Some("")), (SOCKET_DIR_ENV, None::<&str>)],
            || {
                let config = LauncherConfig::from_env();
                assert!(config.launcher_path.ends_with(LAUNCHER_BINARY));
                assert_eq!(config.socket_dir, env::temp_dir());
            },
        );
    }
}
