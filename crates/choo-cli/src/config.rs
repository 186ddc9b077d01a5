//! Configuration resolution: CLI flag > `CHOO_*` environment variable >
//! `~/.choo/config.toml` > built-in default, mirroring the resolution chain
//! `choo-db::config::DbConfig` and `choo-daemon::config::DaemonConfig` each
//! apply to a single value, generalized here to every operator-facing
//! setting the CLI needs.

use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// On-disk representation of `~/.choo/config.toml`. Every field is optional:
/// an absent key falls through to the environment, then the built-in
/// default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub repo_path: Option<String>,
    #[serde(default)]
    pub tasks_dir: Option<String>,
    #[serde(default)]
    pub feature_branch: Option<String>,
    #[serde(default)]
    pub target_branch: Option<String>,
    #[serde(default)]
    pub parallelism: Option<u32>,
    #[serde(default)]
    pub default_provider: Option<String>,
    #[serde(default)]
    pub daemon_socket: Option<String>,
}

/// Fully resolved configuration for one CLI invocation.
#[derive(Debug, Clone)]
pub struct ChooConfig {
    pub repo_path: PathBuf,
    pub tasks_dir: PathBuf,
    pub feature_branch: String,
    pub target_branch: String,
    pub parallelism: u32,
    pub default_provider: Option<String>,
    pub daemon_socket: PathBuf,
}

/// CLI-flag overrides, all optional; `resolve` only consults fields the
/// caller actually set.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub repo_path: Option<String>,
    pub tasks_dir: Option<String>,
    pub feature_branch: Option<String>,
    pub target_branch: Option<String>,
    pub parallelism: Option<u32>,
    pub default_provider: Option<String>,
    pub daemon_socket: Option<String>,
}

pub fn config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| Path::new(".").to_path_buf())
        .join(".choo")
        .join("config.toml")
}

pub fn load_config_file() -> ConfigFile {
    let path = config_path();
    match std::fs::read_to_string(&path) {
        Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
        Err(_) => ConfigFile::default(),
    }
}

pub fn save_config(config: &ConfigFile) -> anyhow::Result<()> {
    let path = config_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let contents = toml::to_string_pretty(config)?;
    std::fs::write(&path, contents)?;
    Ok(())
}

impl ChooConfig {
    /// Resolve one setting through flag > env > file > default, in that order.
    fn pick<T>(flag: Option<T>, env_key: &str, file: Option<T>, default: T) -> T
    where
        T: std::str::FromStr,
    {
        flag.or_else(|| env::var(env_key).ok().and_then(|v| v.parse().ok()))
            .or(file)
            .unwrap_or(default)
    }

    pub fn resolve(overrides: &Overrides) -> anyhow::Result<Self> {
        let file = load_config_file();

        let repo_path = Self::pick(
            overrides.repo_path.clone(),
            "CHOO_REPO_PATH",
            file.repo_path.clone(),
            ".".to_string(),
        );
        let tasks_dir = Self::pick(
            overrides.tasks_dir.clone(),
            "CHOO_TASKS_DIR",
            file.tasks_dir.clone(),
            "tasks".to_string(),
        );
        let feature_branch = Self::pick(
            overrides.feature_branch.clone(),
            "CHOO_FEATURE_BRANCH",
            file.feature_branch.clone(),
            "choo/integration".to_string(),
        );
        let target_branch = Self::pick(
            overrides.target_branch.clone(),
            "CHOO_TARGET_BRANCH",
            file.target_branch.clone(),
            "main".to_string(),
        );
        let parallelism = Self::pick(
            overrides.parallelism,
            "CHOO_PARALLELISM",
            file.parallelism,
            4,
        );
        let default_provider = overrides
            .default_provider
            .clone()
            .or_else(|| env::var("CHOO_PROVIDER").ok())
            .or(file.default_provider.clone());
        let daemon_socket = Self::pick(
            overrides.daemon_socket.clone(),
            "CHOO_DAEMON_SOCKET",
            file.daemon_socket.clone(),
            default_socket_path().display().to_string(),
        );

        Ok(Self {
            repo_path: PathBuf::from(repo_path),
            tasks_dir: PathBuf::from(tasks_dir),
            feature_branch,
            target_branch,
            parallelism,
            default_provider,
            daemon_socket: PathBuf::from(daemon_socket),
        })
    }
}

fn default_socket_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| Path::new(".").to_path_buf())
        .join(".choo")
        .join("daemon.sock")
}
