/*!
Container runtime seam.

The lifecycle manager talks to containers only through `ContainerRuntime`. The Docker
Engine implementation lives in `docker`; tests script their own.
*/

pub mod docker;

use std::collections::HashMap;
use std::io;
use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use thiserror::Error;
use tokio::io::AsyncWrite;

pub use docker::DockerRuntime;

/// Raw TTY output chunks from an attached container.
pub type OutputStream = Pin<Box<dyn Stream<Item = io::Result<Vec<u8>>> + Send>>;
/// Container stdin.
pub type InputSink = Pin<Box<dyn AsyncWrite + Send>>;

/// A hijacked, bidirectional TTY stream.
pub struct Attached {
    pub output: OutputStream,
    pub input: InputSink,
}

impl std::fmt::Debug for Attached {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attached").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerStatus {
    pub id: String,
    pub running: bool,
}

/// Everything needed to create one sandbox container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    pub bind_source: String,
    pub mount_point: String,
    pub memory_bytes: i64,
    pub memory_swap_bytes: i64,
    pub cpuset_cpus: String,
    pub network_mode: String,
    pub security_opt: Vec<String>,
    pub env: Vec<String>,
    pub cmd: Vec<String>,
    pub working_dir: String,
    pub labels: HashMap<String, String>,
}

impl ContainerSpec {
    /// `host:container` bind, read/write.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.bind_source, self.mount_point)
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container {0} not found")]
    NotFound(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("runtime API error ({status}): {message}")]
    Api { status: u16, message: String },
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn ping(&self) -> Result<(), RuntimeError>;

    /// Pull `image` when it is not present locally.
    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError>;

    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError>;

    async fn start(&self, id: &str) -> Result<(), RuntimeError>;

    async fn inspect(&self, id: &str) -> Result<ContainerStatus, RuntimeError>;

    async fn attach(&self, id: &str) -> Result<Attached, RuntimeError>;

    async fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<(), RuntimeError>;

    /// Stopping a container that is already stopped succeeds.
    async fn stop(&self, id: &str) -> Result<(), RuntimeError>;

    async fn remove(&self, id: &str) -> Result<(), RuntimeError>;
}
