//! Docker engine API access
//!
//! Speaks HTTP/1.1 to the engine over its unix socket. Only the two calls the
//! collector needs are implemented: list running containers and fetch a
//! one-shot stats snapshot (`stream=false`), which carries both the current and
//! the previous cumulative CPU counters.

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::{header, Request};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UnixStream;
use tracing::debug;

/// Engine socket used when neither configuration nor `DOCKER_HOST` names one
pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";

#[derive(Debug, Error)]
pub enum DockerApiError {
    #[error("unsupported DOCKER_HOST '{0}', only unix:// sockets are supported")]
    UnsupportedHost(String),

    #[error("failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid request for {path}: {message}")]
    InvalidRequest { path: String, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("{path} returned {status}: {body}")]
    Status {
        path: String,
        status: u16,
        body: String,
    },

    #[error("failed to decode {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("request to {path} timed out after {timeout:?}")]
    Timeout { path: String, timeout: Duration },
}

/// Entry of `GET /containers/json`
#[derive(Debug, Clone, Deserialize)]
pub struct ContainerSummary {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Names", default)]
    pub names: Vec<String>,
}

/// Body of `GET /containers/{id}/stats?stream=false`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatsSnapshot {
    #[serde(default)]
    pub cpu_stats: CpuStats,
    #[serde(default)]
    pub precpu_stats: CpuStats,
    #[serde(default)]
    pub memory_stats: MemoryStats,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CpuStats {
    #[serde(default)]
    pub cpu_usage: CpuUsage,
    #[serde(default)]
    pub system_cpu_usage: u64,
    #[serde(default)]
    pub online_cpus: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CpuUsage {
    #[serde(default)]
    pub total_usage: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemoryStats {
    #[serde(default)]
    pub usage: u64,
    #[serde(default)]
    pub limit: u64,
    /// Controller sub-counters, e.g. `inactive_file` (cgroup v2) or `cache` (v1)
    #[serde(default)]
    pub stats: HashMap<String, u64>,
}

/// Operations the Docker collector needs from the engine
#[async_trait]
pub trait DockerApi: Send + Sync {
    /// Check the engine is reachable
    async fn ping(&self) -> Result<(), DockerApiError>;

    /// List running containers
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, DockerApiError>;

    /// Fetch one stats snapshot for a container
    async fn container_stats(&self, id: &str) -> Result<StatsSnapshot, DockerApiError>;
}

/// Docker engine client over a unix socket
#[derive(Debug, Clone)]
pub struct DockerClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl DockerClient {
    pub fn new(socket_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout,
        }
    }

    /// Resolve the socket from an explicit path, `DOCKER_HOST`, or the default
    pub fn from_env(explicit: Option<PathBuf>, timeout: Duration) -> Result<Self, DockerApiError> {
        let socket_path = match explicit {
            Some(path) => path,
            None => match std::env::var("DOCKER_HOST") {
                Ok(host) if !host.is_empty() => socket_from_host(&host)?,
                _ => PathBuf::from(DEFAULT_DOCKER_SOCKET),
            },
        };
        Ok(Self::new(socket_path, timeout))
    }

    /// Create a client and verify the engine answers
    pub async fn connect(
        explicit: Option<PathBuf>,
        timeout: Duration,
    ) -> Result<Self, DockerApiError> {
        let client = Self::from_env(explicit, timeout)?;
        client.ping().await?;
        Ok(client)
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn get_bytes(&self, path: &str) -> Result<Bytes, DockerApiError> {
        match tokio::time::timeout(self.timeout, self.request(path)).await {
            Ok(result) => result,
            Err(_) => Err(DockerApiError::Timeout {
                path: path.to_string(),
                timeout: self.timeout,
            }),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, DockerApiError> {
        let body = self.get_bytes(path).await?;
        serde_json::from_slice(&body).map_err(|source| DockerApiError::Decode {
            path: path.to_string(),
            source,
        })
    }

    async fn request(&self, path: &str) -> Result<Bytes, DockerApiError> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|source| DockerApiError::Connect {
                path: self.socket_path.clone(),
                source,
            })?;

        let (mut sender, connection) =
            hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(error = %e, "Docker connection closed with error");
            }
        });

        let request = Request::get(path)
            .header(header::HOST, "docker")
            .body(Empty::<Bytes>::new())
            .map_err(|e| DockerApiError::InvalidRequest {
                path: path.to_string(),
                message: e.to_string(),
            })?;

        let response = sender.send_request(request).await?;
        let status = response.status();
        let body = response.into_body().collect().await?.to_bytes();

        if !status.is_success() {
            return Err(DockerApiError::Status {
                path: path.to_string(),
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).trim().to_string(),
            });
        }

        Ok(body)
    }
}

#[async_trait]
impl DockerApi for DockerClient {
    async fn ping(&self) -> Result<(), DockerApiError> {
        self.get_bytes("/_ping").await.map(|_| ())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, DockerApiError> {
        self.get_json("/containers/json").await
    }

    async fn container_stats(&self, id: &str) -> Result<StatsSnapshot, DockerApiError> {
        self.get_json(&format!("/containers/{}/stats?stream=false", id))
            .await
    }
}

fn socket_from_host(host: &str) -> Result<PathBuf, DockerApiError> {
    host.strip_prefix("unix://")
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
        .ok_or_else(|| DockerApiError::UnsupportedHost(host.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_from_host() {
        assert_eq!(
            socket_from_host("unix:///run/user/1000/docker.sock").unwrap(),
            PathBuf::from("/run/user/1000/docker.sock")
        );
        assert!(matches!(
            socket_from_host("tcp://10.0.0.1:2375"),
            Err(DockerApiError::UnsupportedHost(_))
        ));
        assert!(socket_from_host("unix://").is_err());
    }

    #[test]
    fn test_explicit_socket_wins() {
        let client =
            DockerClient::from_env(Some(PathBuf::from("/tmp/d.sock")), Duration::from_secs(1))
                .unwrap();
        assert_eq!(client.socket_path(), Path::new("/tmp/d.sock"));
    }

    #[test]
    fn test_decode_stats_snapshot() {
        let body = r#"{
            "read": "2024-05-01T12:30:00Z",
            "cpu_stats": {
                "cpu_usage": {"total_usage": 200, "usage_in_kernelmode": 10},
                "system_cpu_usage": 5000,
                "online_cpus": 4
            },
            "precpu_stats": {
                "cpu_usage": {"total_usage": 100},
                "system_cpu_usage": 4000
            },
            "memory_stats": {
                "usage": 314572800,
                "limit": 1073741824,
                "stats": {"inactive_file": 52428800, "active_anon": 1}
            }
        }"#;

        let stats: StatsSnapshot = serde_json::from_str(body).unwrap();
        assert_eq!(stats.cpu_stats.cpu_usage.total_usage, 200);
        assert_eq!(stats.precpu_stats.system_cpu_usage, 4000);
        assert_eq!(stats.precpu_stats.online_cpus, 0);
        assert_eq!(stats.memory_stats.stats.get("inactive_file"), Some(&52428800));
    }

    #[test]
    fn test_decode_stopped_container_stats() {
        // A container that exited between list and stats reports empty sections
        let stats: StatsSnapshot =
            serde_json::from_str(r#"{"cpu_stats": {"cpu_usage": {}}, "memory_stats": {}}"#)
                .unwrap();
        assert_eq!(stats.cpu_stats.cpu_usage.total_usage, 0);
        assert!(stats.memory_stats.stats.is_empty());
    }

    #[test]
    fn test_decode_container_list() {
        let body = r#"[{"Id": "abc", "Names": ["/web"], "State": "running"}, {"Id": "def"}]"#;
        let containers: Vec<ContainerSummary> = serde_json::from_str(body).unwrap();
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0].names, vec!["/web".to_string()]);
        assert!(containers[1].names.is_empty());
    }

    #[tokio::test]
    async fn test_connect_fails_without_socket() {
        let dir = tempfile::TempDir::new().unwrap();
        let result =
            DockerClient::connect(Some(dir.path().join("none.sock")), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(DockerApiError::Connect { .. })));
    }
}
