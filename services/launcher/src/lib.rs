//! strato Launcher Library
//!
//! The launcher runs on each host and owns the lifecycle of the compute
//! workloads scheduled there: QEMU virtual machines and Docker containers.
//! This crate contains the recovery half of the launcher, the hard-reset
//! subsystem: it terminates every instance known to the node through its
//! backend control channel, tears host networking down to factory state and
//! purges all persisted launcher state.
//!
//! ## Modules
//!
//! - `instance`: directory-backed instance records
//! - `qmp`: QMP shutdown sequence for VM-backed instances
//! - `docker`: Docker Engine API client and container teardown
//! - `network`: ordered network init/reset around the instance walk
//! - `reset`: the hard-reset procedure itself
//! - `lock`: one-launcher-per-node lock file

pub mod config;
pub mod docker;
pub mod instance;
pub mod lock;
pub mod network;
pub mod qmp;
pub mod reset;

// Re-export commonly used types
pub use config::Config;
pub use reset::purge_node_state;
