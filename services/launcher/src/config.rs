//! Configuration for the launcher.

use std::path::{Path, PathBuf};

use anyhow::Result;

/// Launcher configuration.
///
/// Every persisted path the launcher touches is named here explicitly so the
/// reset procedure can be pointed at a scratch root in tests.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding one subdirectory per instance.
    pub instances_dir: PathBuf,

    /// Directory for all other persisted launcher state.
    pub data_dir: PathBuf,

    /// Directory holding the launcher lock file.
    pub lock_dir: PathBuf,

    /// Name of the launcher lock file inside `lock_dir`.
    pub lock_file: String,

    /// Unix socket of the Docker Engine API.
    pub docker_socket: PathBuf,

    /// Prefix all platform-owned bridges are named with.
    pub bridge_prefix: String,

    /// Name of the phase-1 host bridge backends attach to.
    pub phase1_bridge: String,

    /// Name of the Docker network used by container-backed instances.
    pub container_network: String,

    /// Label marking Docker networks as platform-owned.
    pub network_label: String,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let instances_dir = std::env::var("STRATO_INSTANCES_DIR")
            .unwrap_or_else(|_| "/var/lib/strato/instances".to_string())
            .into();

        let data_dir = std::env::var("STRATO_DATA_DIR")
            .unwrap_or_else(|_| "/var/lib/strato/data".to_string())
            .into();

        let lock_dir = std::env::var("STRATO_LOCK_DIR")
            .unwrap_or_else(|_| "/run/lock/strato".to_string())
            .into();

        let docker_socket = std::env::var("STRATO_DOCKER_SOCKET")
            .unwrap_or_else(|_| "/var/run/docker.sock".to_string())
            .into();

        let log_level = std::env::var("STRATO_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            instances_dir,
            data_dir,
            lock_dir,
            lock_file: "launcher.lock".to_string(),
            docker_socket,
            bridge_prefix: "strato_br".to_string(),
            phase1_bridge: "strato_br0".to_string(),
            container_network: "strato".to_string(),
            network_label: "com.strato.network".to_string(),
            log_level,
        })
    }

    /// Configuration with every path rooted under `root`.
    ///
    /// Used by tests to run the reset procedure against a scratch directory.
    pub fn with_root(root: &Path) -> Self {
        Self {
            instances_dir: root.join("instances"),
            data_dir: root.join("data"),
            lock_dir: root.join("lock"),
            lock_file: "launcher.lock".to_string(),
            docker_socket: root.join("docker.sock"),
            bridge_prefix: "strato_test_br".to_string(),
            phase1_bridge: "strato_test_br0".to_string(),
            container_network: "strato-test".to_string(),
            network_label: "com.strato.network".to_string(),
            log_level: "debug".to_string(),
        }
    }

    /// Full path of the launcher lock file.
    pub fn lock_path(&self) -> PathBuf {
        self.lock_dir.join(&self.lock_file)
    }
}
