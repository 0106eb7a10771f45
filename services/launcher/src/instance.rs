//! Directory-backed instance records.
//!
//! The instances directory is the source of truth for which workloads exist
//! on this node: one subdirectory per instance, holding the persisted launch
//! config plus backend-specific files (`socket` for VMs, `docker-id` for
//! containers). The directory path itself is the instance's key.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Name of the persisted config file inside an instance directory.
pub const INSTANCE_CONFIG_FILE: &str = "config.json";

/// Errors from instance record operations.
#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("failed to read instance config: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse instance config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Execution technology backing an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// QEMU virtual machine, controlled over its QMP socket.
    Vm,
    /// Docker container, controlled through the Engine API.
    Container,
}

/// Persisted per-instance launch config.
///
/// Written by the launch path; during reset it is read only to pick the
/// terminator for the instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// True for container-backed instances, false for VMs.
    #[serde(default)]
    pub container: bool,

    /// Workload image reference.
    #[serde(default)]
    pub image: Option<String>,

    /// vCPUs assigned at launch.
    #[serde(default)]
    pub vcpus: Option<u32>,

    /// Memory assigned at launch, in MiB.
    #[serde(default)]
    pub memory_mb: Option<u64>,
}

impl InstanceConfig {
    /// Load the persisted config from an instance directory.
    pub fn load(instance_dir: &Path) -> Result<Self, InstanceError> {
        let path = instance_dir.join(INSTANCE_CONFIG_FILE);
        let data = std::fs::read(&path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// The backend kind this config declares.
    pub fn backend_kind(&self) -> BackendKind {
        if self.container {
            BackendKind::Container
        } else {
            BackendKind::Vm
        }
    }
}

/// Enumerate instance directories under the instances root.
///
/// Skips the root itself and anything that is not a directory; stray files
/// are never dispatched to a terminator. Order is whatever the filesystem
/// returns and must not be relied upon. A missing or unreadable root yields
/// an empty list: nothing to tear down.
pub fn instance_dirs(root: &Path) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(root = %root.display(), error = %e, "no instances directory to walk");
            return Vec::new();
        }
    };

    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|e| e.path())
        .collect()
}
