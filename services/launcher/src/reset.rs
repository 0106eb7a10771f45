//! Hard reset: terminate every instance and purge persisted launcher state.
//!
//! The procedure is a single sequential pass with no rollback and no retry;
//! it is safe to re-run from scratch after a failure or interruption because
//! every step treats "already absent" as success. No error aborts it: each
//! failure is logged and the next step runs regardless, so the node always
//! ends up closer to pristine.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::config::Config;
use crate::docker::{self, DockerClient};
use crate::instance::{self, BackendKind, InstanceConfig};
use crate::network::NetworkManager;
use crate::qmp;

/// Tear down every instance known to this node and purge all persisted
/// launcher state.
///
/// On return the instances directory, data directory and lock file no longer
/// exist, regardless of how many individual steps failed along the way.
pub async fn purge_node_state(config: &Config) {
    info!("======= HARD RESET ======");

    info!("shutting down running instances");

    let docker = DockerClient::new(&config.docker_socket);
    let mut network = NetworkManager::new(config);

    info!("init networking");

    network.load_state();
    network.init_phase1();
    if network.phase1_up() {
        network.init_container_networking(&docker).await;
    }

    let mut to_remove: Vec<PathBuf> = Vec::new();

    for dir in instance::instance_dirs(&config.instances_dir) {
        match InstanceConfig::load(&dir) {
            Ok(instance_config) => match instance_config.backend_kind() {
                BackendKind::Container => docker::terminate(&dir, &docker).await,
                BackendKind::Vm => qmp::terminate(&dir).await,
            },
            Err(e) => {
                // Orphaned or corrupt record: termination is impossible, so
                // removal is the safety net.
                warn!(instance = %dir.display(), error = %e, "unable to load instance config");
            }
        }
        to_remove.push(dir);
    }

    for dir in &to_remove {
        if let Err(e) = fs::remove_dir_all(dir) {
            warn!(instance = %dir.display(), error = %e, "unable to remove instance dir");
        }
    }

    info!("reset container networking");

    // Always torn down, even when initialization failed earlier: a corrupt
    // network database must not keep itself alive through a reset.
    network.shutdown_container_network();
    network.reset_container_networking(&docker).await;

    info!("reset networking");

    network.reset_network();

    remove_path(&config.data_dir);
    remove_path(&config.instances_dir);
    remove_path(&config.lock_path());
}

/// Remove a file or directory tree, best-effort.
///
/// Absence is success; any other failure is logged and swallowed.
fn remove_path(path: &Path) {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(_) => return,
    };

    let result = if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };

    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "unable to delete path");
    }
}
