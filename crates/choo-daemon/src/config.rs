use std::env;
use std::path::{Path, PathBuf};

/// Daemon process configuration.
///
/// Reads from `CHOO_DAEMON_SOCKET` / `CHOO_DAEMON_SHUTDOWN_GRACE_SECS`,
/// falling back to `~/.choo/daemon.sock` and a 30 second grace period.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    pub shutdown_grace_secs: u64,
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        let socket_path = env::var("CHOO_DAEMON_SOCKET")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_socket_path());
        let shutdown_grace_secs = env::var("CHOO_DAEMON_SHUTDOWN_GRACE_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);
        Self {
            socket_path,
            shutdown_grace_secs,
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Default socket location: `~/.choo/daemon.sock`.
pub fn default_socket_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| Path::new(".").to_path_buf())
        .join(".choo")
        .join("daemon.sock")
}

/// The crate's own version, reported by `Health` and stamped on every run row.
pub fn daemon_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_socket_path_lives_under_dot_choo() {
        let path = default_socket_path();
        assert!(path.ends_with(".choo/daemon.sock"));
    }
}
