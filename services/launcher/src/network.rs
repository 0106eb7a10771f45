//! Host network lifecycle around the instance walk.
//!
//! Hard reset needs just enough networking up-front to reach the backends
//! (phase 1 plus, for containers, the overlay network), and a full teardown
//! once every instance is gone. Each operation here is independently
//! fault-tolerant: failures are logged and the procedure continues.

use std::io::ErrorKind;
use std::path::PathBuf;

use strato_networking::{create_bridge, NetworkDriver, NetworkState, NETWORKING_DIR};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::docker::DockerClient;

/// Subdirectory of the networking state dir holding the container network
/// plugin database.
const CONTAINER_DB_DIR: &str = "docker";

/// Coordinates network state for one hard-reset invocation.
pub struct NetworkManager {
    data_dir: PathBuf,
    phase1_bridge: String,
    container_network: String,
    network_label: String,
    driver: NetworkDriver,

    /// Persisted allocation state, if it could be loaded.
    state: Option<NetworkState>,

    /// Whether phase-1 init succeeded this invocation.
    phase1_up: bool,
}

impl NetworkManager {
    /// Create a manager from the launcher configuration.
    pub fn new(config: &Config) -> Self {
        Self {
            data_dir: config.data_dir.clone(),
            phase1_bridge: config.phase1_bridge.clone(),
            container_network: config.container_network.clone(),
            network_label: config.network_label.clone(),
            driver: NetworkDriver::new(&config.bridge_prefix),
            state: None,
            phase1_up: false,
        }
    }

    /// Load persisted network allocation state.
    ///
    /// Failure only degrades later steps (bridges must then be found by
    /// prefix scan); it never blocks instance termination.
    pub fn load_state(&mut self) {
        match NetworkState::load(&self.data_dir) {
            Ok(state) => self.state = Some(state),
            Err(e) => {
                warn!(error = %e, "unable to load network state, hard reset may be slow");
            }
        }
    }

    /// Bring up the minimal host networking needed to reach backends.
    pub fn init_phase1(&mut self) {
        match create_bridge(&self.phase1_bridge) {
            Ok(()) => self.phase1_up = true,
            Err(e) => {
                warn!(error = %e, "failed to init network");
            }
        }
    }

    /// Whether phase-1 init succeeded.
    ///
    /// Container network initialization hard-depends on phase 1; VM
    /// termination does not.
    pub fn phase1_up(&self) -> bool {
        self.phase1_up
    }

    /// Initialize the container overlay network.
    ///
    /// Only called when phase 1 succeeded.
    pub async fn init_container_networking(&self, docker: &DockerClient) {
        if let Err(e) = docker
            .create_network(&self.container_network, &self.network_label)
            .await
        {
            info!(error = %e, "unable to initialise container networking");
        }
    }

    /// Shut down the container network plugin state.
    ///
    /// Deletes the plugin database unconditionally: a corrupt database is
    /// exactly the case reset has to recover from, so this never depends on
    /// whether initialization succeeded earlier.
    pub fn shutdown_container_network(&self) {
        let db_dir = self.data_dir.join(NETWORKING_DIR).join(CONTAINER_DB_DIR);
        match std::fs::remove_dir_all(&db_dir) {
            Ok(()) => debug!(path = %db_dir.display(), "container network database removed"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %db_dir.display(), error = %e, "unable to remove container network database");
            }
        }
    }

    /// Remove every platform-owned network from the container runtime.
    pub async fn reset_container_networking(&self, docker: &DockerClient) {
        let networks = match docker.list_networks().await {
            Ok(networks) => networks,
            Err(e) => {
                warn!(error = %e, "unable to list container networks");
                return;
            }
        };

        for network in networks {
            if !network.labels.contains_key(&self.network_label) {
                continue;
            }
            info!(network = %network.name, "removing container network");
            if let Err(e) = docker.remove_network(&network.id).await {
                warn!(network = %network.name, error = %e, "unable to remove container network");
            }
        }
    }

    /// Reset the network driver to factory state.
    pub fn reset_network(&self) {
        if let Err(e) = self.driver.reset(&self.data_dir, self.state.as_ref()) {
            warn!(error = %e, "unable to reset network");
        }
    }
}
