//! Docker Engine API client and container teardown.
//!
//! The Engine API is consumed over its local unix socket. Reset uses a
//! handful of endpoints: forced container removal, plus network
//! creation/listing/removal for the container overlay.
//!
//! Reference: https://docs.docker.com/engine/api/v1.41/

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::Path;

use hyper::{body::Buf, Body, Client, Method, Request};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Name of the file recording the container ID inside an instance directory.
pub const DOCKER_ID_FILE: &str = "docker-id";

const API_VERSION: &str = "v1.41";

/// Errors from the Docker Engine API.
#[derive(Debug, Error)]
pub enum DockerError {
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },
}

impl From<hyper::http::Error> for DockerError {
    fn from(err: hyper::http::Error) -> Self {
        DockerError::Api {
            status: 0,
            message: err.to_string(),
        }
    }
}

/// Docker Engine API client for unix socket communication.
pub struct DockerClient {
    socket_path: String,
    client: Client<UnixConnector>,
}

/// Summary of an Engine network, as returned by the list endpoint.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct NetworkSummary {
    /// Network ID.
    #[serde(rename = "Id")]
    pub id: String,

    /// Network name.
    #[serde(rename = "Name")]
    pub name: String,

    /// Labels attached at creation.
    #[serde(rename = "Labels", default)]
    pub labels: HashMap<String, String>,
}

impl DockerClient {
    /// Create a new client for the given Engine socket path.
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        let socket_path = socket_path.as_ref().to_string_lossy().to_string();
        let client = Client::unix();
        Self {
            socket_path,
            client,
        }
    }

    /// Force-remove a container by ID.
    ///
    /// Removes the container even if it is still running, without a prior
    /// graceful stop, and deletes its anonymous volumes. A container that is
    /// already gone (404) counts as success.
    pub async fn remove_container(&self, container_id: &str) -> Result<(), DockerError> {
        let path = format!(
            "/{}/containers/{}?force=true&v=true",
            API_VERSION, container_id
        );
        match self.delete(&path).await {
            Ok(()) => Ok(()),
            Err(DockerError::Api { status: 404, .. }) => {
                debug!(container = %container_id, "container already removed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Create a named network carrying a platform label.
    pub async fn create_network(&self, name: &str, label: &str) -> Result<(), DockerError> {
        #[derive(Serialize)]
        struct CreateNetwork<'a> {
            #[serde(rename = "Name")]
            name: &'a str,
            #[serde(rename = "Labels")]
            labels: HashMap<&'a str, &'a str>,
        }

        let body = CreateNetwork {
            name,
            labels: HashMap::from([(label, "true")]),
        };
        let path = format!("/{}/networks/create", API_VERSION);
        match self.post(&path, &body).await {
            Ok(()) => Ok(()),
            // 409: the network already exists, which is what we wanted.
            Err(DockerError::Api { status: 409, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// List all Engine networks.
    pub async fn list_networks(&self) -> Result<Vec<NetworkSummary>, DockerError> {
        let path = format!("/{}/networks", API_VERSION);
        self.get(&path).await
    }

    /// Remove a network by ID.
    pub async fn remove_network(&self, network_id: &str) -> Result<(), DockerError> {
        let path = format!("/{}/networks/{}", API_VERSION, network_id);
        match self.delete(&path).await {
            Ok(()) => Ok(()),
            Err(DockerError::Api { status: 404, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Perform a DELETE request.
    async fn delete(&self, path: &str) -> Result<(), DockerError> {
        let uri = Uri::new(&self.socket_path, path);

        debug!(path = path, "DELETE request to Docker Engine API");

        let request = Request::builder()
            .method(Method::DELETE)
            .uri(uri)
            .header("Accept", "application/json")
            .body(Body::empty())?;

        let response = self.client.request(request).await?;
        let status = response.status();

        if status.is_success() {
            Ok(())
        } else {
            let body = hyper::body::aggregate(response.into_body()).await?;
            let message = String::from_utf8_lossy(body.chunk()).to_string();
            error!(status = %status, message = %message, "Docker Engine API error");
            Err(DockerError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }

    /// Perform a POST request with a JSON body.
    async fn post<T: Serialize>(&self, path: &str, body: &T) -> Result<(), DockerError> {
        let body_bytes = serde_json::to_vec(body)?;
        let uri = Uri::new(&self.socket_path, path);

        debug!(path = path, "POST request to Docker Engine API");

        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .body(Body::from(body_bytes))?;

        let response = self.client.request(request).await?;
        let status = response.status();

        if status.is_success() {
            Ok(())
        } else {
            let body = hyper::body::aggregate(response.into_body()).await?;
            let message = String::from_utf8_lossy(body.chunk()).to_string();
            Err(DockerError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }

    /// Perform a GET request.
    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, DockerError> {
        let uri = Uri::new(&self.socket_path, path);

        debug!(path = path, "GET request to Docker Engine API");

        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header("Accept", "application/json")
            .body(Body::empty())?;

        let response = self.client.request(request).await?;
        let status = response.status();
        let body = hyper::body::aggregate(response.into_body()).await?;

        if status.is_success() {
            let result = serde_json::from_reader(body.reader())?;
            Ok(result)
        } else {
            let message = String::from_utf8_lossy(body.chunk()).to_string();
            Err(DockerError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }
}

/// Terminate the container recorded in `instance_dir`, if any.
///
/// Hard reset is the non-graceful path: the container is force-removed with
/// no prior stop, since container workloads are cheaply re-created by the
/// orchestrator. Never fails; every failure is terminal for this instance
/// only and reset proceeds regardless.
pub async fn terminate(instance_dir: &Path, client: &DockerClient) {
    let id_path = instance_dir.join(DOCKER_ID_FILE);

    let container_id = match std::fs::read_to_string(&id_path) {
        Ok(data) => data.trim().to_string(),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(
                instance = %instance_dir.display(),
                "no container ID recorded, nothing to remove"
            );
            return;
        }
        Err(e) => {
            warn!(
                instance = %instance_dir.display(),
                error = %e,
                "unable to read container ID"
            );
            return;
        }
    };

    if container_id.is_empty() {
        warn!(instance = %instance_dir.display(), "empty container ID file");
        return;
    }

    info!(
        instance = %instance_dir.display(),
        container = %container_id,
        "force-removing container"
    );

    if let Err(e) = client.remove_container(&container_id).await {
        warn!(
            container = %container_id,
            error = %e,
            "unable to remove container"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_summary_deserialize() {
        let json = r#"[
            {"Id": "abc", "Name": "strato", "Labels": {"com.strato.network": "true"}},
            {"Id": "def", "Name": "bridge"}
        ]"#;

        let networks: Vec<NetworkSummary> = serde_json::from_str(json).unwrap();
        assert_eq!(networks.len(), 2);
        assert_eq!(networks[0].name, "strato");
        assert!(networks[0].labels.contains_key("com.strato.network"));
        assert!(networks[1].labels.is_empty());
    }

    #[tokio::test]
    async fn test_terminate_without_id_file() {
        let tmp = tempfile::tempdir().unwrap();
        let instance_dir = tmp.path().join("ctr-gone");
        std::fs::create_dir_all(&instance_dir).unwrap();

        // No docker-id file: nothing to remove, no Engine call attempted.
        let client = DockerClient::new(tmp.path().join("missing.sock"));
        terminate(&instance_dir, &client).await;
    }

    #[tokio::test]
    async fn test_terminate_unreachable_engine_is_swallowed() {
        let tmp = tempfile::tempdir().unwrap();
        let instance_dir = tmp.path().join("ctr1");
        std::fs::create_dir_all(&instance_dir).unwrap();
        std::fs::write(instance_dir.join(DOCKER_ID_FILE), "abc123\n").unwrap();

        let client = DockerClient::new(tmp.path().join("missing.sock"));
        terminate(&instance_dir, &client).await;
    }
}
