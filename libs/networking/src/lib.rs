//! Host networking for the strato launcher.
//!
//! This library provides:
//! - IPAM for the per-tenant IPv4 subnets carved out for instance bridges
//! - Persisted network state (which subnets, bridges and container overlays
//!   have been allocated on this node)
//! - Bridge/link management via `ip(8)`
//! - A driver-level reset that returns the host to factory state

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Networking errors.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),

    /// Subnet pool exhausted.
    #[error("subnet pool exhausted: {0}")]
    PoolExhausted(String),

    /// Persisted state could not be read or written.
    #[error("network state i/o error at {path}: {source}")]
    Persist {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Persisted state could not be decoded.
    #[error("network state decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// An `ip` command failed.
    #[error("link operation failed: {0}")]
    Link(String),
}

// ============================================================================
// IPAM
// ============================================================================

/// IPv4 subnet in CIDR form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Subnet {
    /// Base address of the subnet.
    pub address: Ipv4Addr,

    /// Prefix length (e.g. 24 for /24).
    pub prefix_len: u8,
}

impl Ipv4Subnet {
    /// Create a new subnet, masking the address to the prefix.
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Result<Self, NetworkError> {
        if prefix_len > 32 {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {} exceeds 32",
                prefix_len
            )));
        }

        Ok(Self {
            address: mask_ipv4(address, prefix_len),
            prefix_len,
        })
    }

    /// Parse from CIDR notation (e.g. "192.168.0.0/16").
    pub fn from_cidr(s: &str) -> Result<Self, NetworkError> {
        let Some((addr_str, prefix_str)) = s.split_once('/') else {
            return Err(NetworkError::InvalidPrefix(format!(
                "missing '/' in CIDR: {}",
                s
            )));
        };

        let address = Ipv4Addr::from_str(addr_str)
            .map_err(|_| NetworkError::InvalidAddress(addr_str.to_string()))?;

        let prefix_len = prefix_str
            .parse::<u8>()
            .map_err(|_| NetworkError::InvalidPrefix(prefix_str.to_string()))?;

        Self::new(address, prefix_len)
    }

    /// Check if an address is within this subnet.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        mask_ipv4(addr, self.prefix_len) == self.address
    }

    /// Number of addresses in this subnet.
    pub fn size(&self) -> u64 {
        if self.prefix_len >= 32 {
            1
        } else {
            1u64 << (32 - self.prefix_len)
        }
    }
}

impl std::fmt::Display for Ipv4Subnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

/// Mask an IPv4 address to a prefix length.
fn mask_ipv4(addr: Ipv4Addr, prefix_len: u8) -> Ipv4Addr {
    let bits = u32::from_be_bytes(addr.octets());
    let mask = if prefix_len == 0 {
        0
    } else if prefix_len >= 32 {
        u32::MAX
    } else {
        u32::MAX << (32 - prefix_len)
    };
    Ipv4Addr::from((bits & mask).to_be_bytes())
}

/// Sequential subnet allocator.
///
/// Carves fixed-size subnets out of a larger pool, in order. The launch path
/// allocates one subnet per tenant bridge; the allocator position survives
/// restarts through [`NetworkState::next_subnet_index`].
#[derive(Debug)]
pub struct SubnetAllocator {
    /// Pool to allocate from.
    pool: Ipv4Subnet,

    /// Prefix length of allocated subnets.
    subnet_len: u8,

    /// Next subnet index to hand out.
    next_index: u64,

    /// Number of subnets in the pool.
    max_index: u64,
}

impl SubnetAllocator {
    /// Create an allocator carving `/subnet_len` subnets out of `pool`.
    pub fn new(pool: Ipv4Subnet, subnet_len: u8) -> Result<Self, NetworkError> {
        if subnet_len > 32 || subnet_len < pool.prefix_len {
            return Err(NetworkError::InvalidPrefix(format!(
                "subnet length /{} does not fit in pool {}",
                subnet_len, pool
            )));
        }

        let max_index = 1u64 << (subnet_len - pool.prefix_len);
        Ok(Self {
            pool,
            subnet_len,
            next_index: 0,
            max_index,
        })
    }

    /// Resume allocation at a previously persisted index.
    pub fn resume_at(mut self, index: u64) -> Self {
        self.next_index = index.min(self.max_index);
        self
    }

    /// Allocate the next free subnet.
    pub fn allocate(&mut self) -> Result<Ipv4Subnet, NetworkError> {
        if self.next_index >= self.max_index {
            return Err(NetworkError::PoolExhausted(self.pool.to_string()));
        }

        let base = u64::from(u32::from_be_bytes(self.pool.address.octets()));
        let step = 1u64 << (32 - u32::from(self.subnet_len));
        let addr = (base + self.next_index * step) as u32;
        self.next_index += 1;

        Ipv4Subnet::new(Ipv4Addr::from(addr.to_be_bytes()), self.subnet_len)
    }

    /// Current allocation index, for persistence.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Remaining subnets in the pool.
    pub fn remaining(&self) -> u64 {
        self.max_index.saturating_sub(self.next_index)
    }
}

// ============================================================================
// Persisted state
// ============================================================================

/// Name of the state file under the networking directory.
const STATE_FILE: &str = "state.json";

/// Directory under the data dir holding all persisted networking state.
pub const NETWORKING_DIR: &str = "networking";

/// A host bridge allocated for instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeRecord {
    /// Link name of the bridge (e.g. "strato_br_2").
    pub name: String,

    /// Subnet routed through this bridge, in CIDR notation.
    pub subnet: String,
}

/// Persisted network allocation state for this node.
///
/// Loaded lazily at the start of a hard reset; its absence or corruption only
/// degrades the reset (bridges are then found by prefix scan instead), it
/// never blocks instance termination.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkState {
    /// Host bridges created for instances.
    #[serde(default)]
    pub bridges: Vec<BridgeRecord>,

    /// Container overlay networks created on the container runtime.
    #[serde(default)]
    pub container_networks: Vec<String>,

    /// Persisted subnet allocator position.
    #[serde(default)]
    pub next_subnet_index: u64,
}

impl NetworkState {
    /// Path of the state file under a data directory.
    pub fn path(data_dir: &Path) -> PathBuf {
        data_dir.join(NETWORKING_DIR).join(STATE_FILE)
    }

    /// Load persisted state from a data directory.
    pub fn load(data_dir: &Path) -> Result<Self, NetworkError> {
        let path = Self::path(data_dir);
        let data = std::fs::read(&path).map_err(|source| NetworkError::Persist {
            path: path.clone(),
            source,
        })?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Persist state to a data directory.
    pub fn save(&self, data_dir: &Path) -> Result<(), NetworkError> {
        let path = Self::path(data_dir);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| NetworkError::Persist {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let data = serde_json::to_vec_pretty(self)?;
        std::fs::write(&path, data).map_err(|source| NetworkError::Persist { path, source })
    }

    /// Delete all persisted networking state under a data directory.
    ///
    /// A missing directory is not an error: reset converges on "nothing
    /// persisted" from any starting point.
    pub fn reset(data_dir: &Path) -> Result<(), NetworkError> {
        let dir = data_dir.join(NETWORKING_DIR);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(NetworkError::Persist { path: dir, source }),
        }
    }

    /// Record a bridge allocation.
    pub fn add_bridge(&mut self, name: &str, subnet: &Ipv4Subnet) {
        self.bridges.push(BridgeRecord {
            name: name.to_string(),
            subnet: subnet.to_string(),
        });
    }

    /// Record a container overlay network.
    pub fn add_container_network(&mut self, name: &str) {
        self.container_networks.push(name.to_string());
    }
}

// ============================================================================
// Link management
// ============================================================================

/// Run an `ip` command and return result.
fn run_ip(args: &[&str]) -> Result<(), NetworkError> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .map_err(|e| NetworkError::Link(format!("failed to execute ip: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(NetworkError::Link(format!(
            "ip {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }

    Ok(())
}

/// Check if a link exists.
pub fn link_exists(name: &str) -> bool {
    Path::new(&format!("/sys/class/net/{}", name)).exists()
}

/// List link names starting with a prefix.
///
/// Used by reset to find platform bridges when the persisted state is
/// missing or corrupt.
pub fn links_with_prefix(prefix: &str) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir("/sys/class/net") else {
        return Vec::new();
    };

    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| name.starts_with(prefix))
        .collect()
}

/// Create a bridge and bring it up.
///
/// An already-existing bridge is not an error; reset and re-launch both call
/// this on nodes in unknown states.
pub fn create_bridge(name: &str) -> Result<(), NetworkError> {
    if !link_exists(name) {
        run_ip(&["link", "add", "name", name, "type", "bridge"])?;
    }
    run_ip(&["link", "set", "dev", name, "up"])?;
    debug!(bridge = %name, "bridge up");
    Ok(())
}

/// Delete a bridge.
pub fn delete_bridge(name: &str) -> Result<(), NetworkError> {
    run_ip(&["link", "set", "dev", name, "down"])?;
    run_ip(&["link", "delete", name, "type", "bridge"])?;
    debug!(bridge = %name, "bridge deleted");
    Ok(())
}

// ============================================================================
// Driver reset
// ============================================================================

/// Low-level network driver handle.
///
/// Owns the bridge namespace for this node; `reset` tears every platform
/// bridge down and removes the persisted allocation state.
#[derive(Debug)]
pub struct NetworkDriver {
    /// Prefix all platform-owned bridges are named with.
    bridge_prefix: String,
}

impl NetworkDriver {
    /// Create a driver for a bridge prefix.
    pub fn new(bridge_prefix: &str) -> Self {
        Self {
            bridge_prefix: bridge_prefix.to_string(),
        }
    }

    /// Reset the driver to factory state.
    ///
    /// Deletes every bridge named in `state` or found by prefix scan, then
    /// removes the persisted networking state. Individual bridge deletions
    /// are best-effort; only a failure to remove the persisted state is
    /// reported to the caller.
    pub fn reset(&self, data_dir: &Path, state: Option<&NetworkState>) -> Result<(), NetworkError> {
        let mut names: BTreeSet<String> = links_with_prefix(&self.bridge_prefix)
            .into_iter()
            .collect();
        if let Some(state) = state {
            names.extend(state.bridges.iter().map(|b| b.name.clone()));
        }

        for name in &names {
            if !link_exists(name) {
                continue;
            }
            if let Err(e) = delete_bridge(name) {
                warn!(bridge = %name, error = %e, "unable to delete bridge");
            }
        }

        NetworkState::reset(data_dir)
    }
}
