//! QMP shutdown sequence for VM-backed instances.
//!
//! QEMU exposes a monitor socket per instance (`<instance dir>/socket`)
//! speaking newline-delimited JSON. Termination negotiates capabilities,
//! requests a power-off and then drains the connection until QEMU closes it.
//! No responses are parsed; success is "the peer eventually closes".

use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Name of the monitor socket inside an instance directory.
pub const VM_SOCKET_FILE: &str = "socket";

/// Bound on connecting to the monitor socket.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on draining the connection after the quit request.
const DRAIN_DEADLINE: Duration = Duration::from_secs(60);

const CAPABILITIES_CMD: &str = "{ \"execute\": \"qmp_capabilities\" }\n";
const QUIT_CMD: &str = "{ \"execute\": \"quit\" }\n";

/// Errors from the QMP shutdown sequence.
#[derive(Debug, Error)]
pub enum QmpError {
    #[error("i/o error on monitor socket: {0}")]
    Io(#[from] std::io::Error),
}

/// Terminate the VM behind `instance_dir`, if one is still running.
///
/// Never fails: a missing or refusing monitor socket means the VM is already
/// stopped, and any other failure is terminal for this instance only, since
/// reset proceeds regardless. One attempt per instance per reset.
pub async fn terminate(instance_dir: &Path) {
    let socket = instance_dir.join(VM_SOCKET_FILE);

    let stream = match timeout(CONNECT_TIMEOUT, UnixStream::connect(&socket)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::ConnectionRefused) => {
            debug!(
                instance = %instance_dir.display(),
                "monitor socket absent, VM presumed stopped"
            );
            return;
        }
        Ok(Err(e)) => {
            warn!(
                instance = %instance_dir.display(),
                error = %e,
                "unable to connect to monitor socket"
            );
            return;
        }
        Err(_) => {
            warn!(
                instance = %instance_dir.display(),
                "timed out connecting to monitor socket"
            );
            return;
        }
    };

    if let Err(e) = shutdown_sequence(stream, instance_dir).await {
        warn!(
            instance = %instance_dir.display(),
            error = %e,
            "monitor shutdown sequence failed"
        );
    }
}

async fn shutdown_sequence(mut stream: UnixStream, instance_dir: &Path) -> Result<(), QmpError> {
    stream.write_all(CAPABILITIES_CMD.as_bytes()).await?;

    info!(instance = %instance_dir.display(), "powering down VM");

    stream.write_all(QUIT_CMD.as_bytes()).await?;

    // QEMU drops the quit request if our end closes straight away. Keep
    // reading until the monitor finishes its own shutdown and closes the
    // socket, or the deadline elapses.
    let mut lines = BufReader::new(stream).lines();
    let _ = timeout(DRAIN_DEADLINE, async {
        while let Ok(Some(_)) = lines.next_line().await {}
    })
    .await;

    Ok(())
}
