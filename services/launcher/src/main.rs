//! strato launcher recovery binary.
//!
//! Invoked by the surrounding agent as a parameterless recovery routine: it
//! terminates every instance on this node, resets host networking and purges
//! all persisted launcher state. It always runs to completion and always
//! exits successfully; individual step failures are reported through logging
//! only.

use anyhow::Result;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use strato_launcher::config::Config;
use strato_launcher::lock::InstanceLock;
use strato_launcher::reset;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting strato launcher recovery");

    let config = Config::from_env()?;
    info!(
        instances_dir = %config.instances_dir.display(),
        data_dir = %config.data_dir.display(),
        "Configuration loaded"
    );

    // A stale lock left by a crashed launcher must not block recovery; the
    // purge removes the lock file either way.
    let _lock = match InstanceLock::acquire(&config.lock_dir, &config.lock_file) {
        Ok(lock) => Some(lock),
        Err(e) => {
            warn!(error = %e, "proceeding without the launcher lock");
            None
        }
    };

    reset::purge_node_state(&config).await;

    info!("Hard reset complete");
    Ok(())
}
