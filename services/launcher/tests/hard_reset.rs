//! Integration tests for the hard-reset procedure.
//!
//! Each test builds a throwaway node layout (instances dir, data dir, lock
//! file) under a tempdir and runs `purge_node_state` against it, with fake
//! backends listening on unix sockets where a test needs one:
//! - a fake QEMU monitor that records the QMP commands it receives
//! - a fake Docker Engine endpoint that records request lines
//!
//! The governing property throughout: whatever fails, the procedure
//! completes and the persisted state is gone afterwards.

use std::path::Path;
use std::sync::Arc;

use strato_launcher::config::Config;
use strato_launcher::instance::INSTANCE_CONFIG_FILE;
use strato_launcher::reset::purge_node_state;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

fn make_instance(instances_dir: &Path, name: &str, config_json: &str) -> std::path::PathBuf {
    let dir = instances_dir.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(INSTANCE_CONFIG_FILE), config_json).unwrap();
    dir
}

fn make_lock(config: &Config) {
    std::fs::create_dir_all(&config.lock_dir).unwrap();
    std::fs::write(config.lock_path(), b"").unwrap();
}

fn assert_purged(config: &Config) {
    assert!(!config.instances_dir.exists(), "instances dir survived");
    assert!(!config.data_dir.exists(), "data dir survived");
    assert!(!config.lock_path().exists(), "lock file survived");
}

/// Fake QEMU monitor: greets, records command lines, closes after "quit".
fn spawn_qmp_server(
    socket_path: &Path,
    received: Arc<Mutex<Vec<String>>>,
) -> JoinHandle<()> {
    let listener = UnixListener::bind(socket_path).unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();

        write_half
            .write_all(b"{\"QMP\": {\"version\": {}, \"capabilities\": []}}\n")
            .await
            .unwrap();

        let mut lines = BufReader::new(read_half).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let quit = line.contains("quit");
            received.lock().await.push(line);
            write_half.write_all(b"{\"return\": {}}\n").await.unwrap();
            if quit {
                break;
            }
        }
    })
}

fn http_response(status_line: &str, body: &str) -> String {
    if body.is_empty() {
        format!("HTTP/1.1 {}\r\nConnection: close\r\n\r\n", status_line)
    } else {
        format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status_line,
            body.len(),
            body
        )
    }
}

/// Fake Docker Engine: one request per connection, request lines recorded.
fn spawn_docker_server(
    socket_path: &Path,
    requests: Arc<Mutex<Vec<String>>>,
    networks_json: &str,
) -> JoinHandle<()> {
    let listener = UnixListener::bind(socket_path).unwrap();
    let networks_json = networks_json.to_string();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let requests = Arc::clone(&requests);
            let networks_json = networks_json.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                loop {
                    match stream.read(&mut chunk).await {
                        Ok(0) => break,
                        Ok(n) => {
                            buf.extend_from_slice(&chunk[..n]);
                            if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                        Err(_) => return,
                    }
                }

                let text = String::from_utf8_lossy(&buf);
                let request_line = text.lines().next().unwrap_or_default().to_string();
                requests.lock().await.push(request_line.clone());

                let response = if request_line.starts_with("GET /v1.41/networks") {
                    http_response("200 OK", &networks_json)
                } else if request_line.starts_with("POST") {
                    http_response("201 Created", "{}")
                } else {
                    http_response("204 No Content", "")
                };
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    })
}

#[tokio::test]
async fn test_reset_tears_down_mixed_instances() {
    let tmp = tempfile::tempdir().unwrap();
    let config = Config::with_root(tmp.path());

    // One VM with a live monitor socket, one container, one stray file.
    let vm_dir = make_instance(&config.instances_dir, "vm1", r#"{"container": false}"#);
    make_instance(&config.instances_dir, "ctr1", r#"{"container": true}"#);
    std::fs::write(
        config.instances_dir.join("ctr1").join("docker-id"),
        "abc123\n",
    )
    .unwrap();
    std::fs::write(config.instances_dir.join("README"), "stray").unwrap();

    std::fs::create_dir_all(&config.data_dir).unwrap();
    make_lock(&config);

    let qmp_lines = Arc::new(Mutex::new(Vec::new()));
    let qmp_server = spawn_qmp_server(&vm_dir.join("socket"), Arc::clone(&qmp_lines));

    let docker_requests = Arc::new(Mutex::new(Vec::new()));
    let docker_server =
        spawn_docker_server(&config.docker_socket, Arc::clone(&docker_requests), "[]");

    purge_node_state(&config).await;

    qmp_server.await.unwrap();
    docker_server.abort();

    // QMP sequencing: capabilities strictly before quit.
    let lines = qmp_lines.lock().await;
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("qmp_capabilities"));
    assert!(lines[1].contains("quit"));

    // Container removal always forced, no prior stop.
    let requests = docker_requests.lock().await;
    assert!(
        requests
            .iter()
            .any(|r| r.starts_with("DELETE /v1.41/containers/abc123?force=true")),
        "no forced container removal in {:?}",
        *requests
    );
    assert!(
        !requests.iter().any(|r| r.contains("/stop")),
        "a graceful stop was attempted: {:?}",
        *requests
    );

    assert_purged(&config);
}

#[tokio::test]
async fn test_reset_is_idempotent_on_empty_node() {
    let tmp = tempfile::tempdir().unwrap();
    let config = Config::with_root(tmp.path());

    // Nothing exists at all; both runs must complete cleanly.
    purge_node_state(&config).await;
    purge_node_state(&config).await;

    assert_purged(&config);
}

#[tokio::test]
async fn test_reset_purges_corrupt_instance_records() {
    let tmp = tempfile::tempdir().unwrap();
    let config = Config::with_root(tmp.path());

    make_instance(&config.instances_dir, "orphan1", "not json at all");
    let no_config = config.instances_dir.join("orphan2");
    std::fs::create_dir_all(&no_config).unwrap();

    make_lock(&config);

    purge_node_state(&config).await;

    // Orphans are never terminated, but they never survive either.
    assert_purged(&config);
}

#[tokio::test]
async fn test_reset_converges_when_backends_unreachable() {
    let tmp = tempfile::tempdir().unwrap();
    let config = Config::with_root(tmp.path());

    // VM with no monitor socket, container with an ID but no Engine
    // listening, plus persisted data and a lock file.
    make_instance(&config.instances_dir, "vm1", r#"{"container": false}"#);
    let ctr = make_instance(&config.instances_dir, "ctr1", r#"{"container": true}"#);
    std::fs::write(ctr.join("docker-id"), "deadbeef").unwrap();

    std::fs::create_dir_all(config.data_dir.join("networking")).unwrap();
    std::fs::write(
        config.data_dir.join("networking").join("state.json"),
        "corrupt{",
    )
    .unwrap();
    make_lock(&config);

    purge_node_state(&config).await;

    assert_purged(&config);
}

#[tokio::test]
async fn test_reset_removes_labeled_container_networks() {
    let tmp = tempfile::tempdir().unwrap();
    let config = Config::with_root(tmp.path());

    let networks_json = r#"[
        {"Id": "net-strato", "Name": "strato-test", "Labels": {"com.strato.network": "true"}},
        {"Id": "net-bridge", "Name": "bridge", "Labels": {}}
    ]"#;

    let requests = Arc::new(Mutex::new(Vec::new()));
    let server = spawn_docker_server(&config.docker_socket, Arc::clone(&requests), networks_json);

    purge_node_state(&config).await;
    server.abort();

    let requests = requests.lock().await;
    assert!(
        requests
            .iter()
            .any(|r| r.starts_with("DELETE /v1.41/networks/net-strato")),
        "labeled network not removed: {:?}",
        *requests
    );
    assert!(
        !requests
            .iter()
            .any(|r| r.starts_with("DELETE /v1.41/networks/net-bridge")),
        "unlabeled network was removed: {:?}",
        *requests
    );

    assert_purged(&config);
}

#[tokio::test]
async fn test_stray_files_under_instance_root_are_not_dispatched() {
    let tmp = tempfile::tempdir().unwrap();
    let config = Config::with_root(tmp.path());

    // Only stray files, no instance directories: the walk must not try to
    // load configs from them or hand them to a terminator.
    std::fs::create_dir_all(&config.instances_dir).unwrap();
    std::fs::write(config.instances_dir.join("README"), "stray").unwrap();
    std::fs::write(config.instances_dir.join("vm9"), "file, not a dir").unwrap();

    purge_node_state(&config).await;

    assert_purged(&config);
}
