//! Docker Engine API implementation of `ContainerRuntime`.

use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    InspectContainerOptions, RemoveContainerOptions, ResizeContainerTtyOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::{StreamExt, TryStreamExt};

use super::{
    Attached, ContainerHandle, ContainerRuntime, ContainerSpec, ContainerStatus, RuntimeError,
};
use crate::config::DockerEndpoint;

const CONNECT_TIMEOUT_SECS: u64 = 120;
const STOP_GRACE_SECS: i64 = 5;

#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect(endpoint: &DockerEndpoint) -> Result<Self, RuntimeError> {
        let docker = match endpoint {
            DockerEndpoint::Tcp(url) => {
                Docker::connect_with_http(url, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            }
            #[cfg(unix)]
            DockerEndpoint::Unix(path) => Docker::connect_with_unix(
                &path.to_string_lossy(),
                CONNECT_TIMEOUT_SECS,
                bollard::API_DEFAULT_VERSION,
            ),
            #[cfg(not(unix))]
            DockerEndpoint::Unix(_) => {
                return Err(RuntimeError::Unavailable(
                    "unix sockets are not supported on this platform".to_string(),
                ))
            }
            DockerEndpoint::Default => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| RuntimeError::Unavailable(format!("cannot connect to Docker: {e}")))?;
        Ok(DockerRuntime { docker })
    }
}

fn map_err(id: &str, e: BollardError) -> RuntimeError {
    match e {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(id.to_string()),
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => RuntimeError::Api {
            status: status_code,
            message,
        },
        other => RuntimeError::Unavailable(other.to_string()),
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| RuntimeError::Unavailable(format!("Docker is not reachable: {e}")))
    }

    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(map_err(image, e)),
        }
        tracing::info!(image, "pulling image");
        let opts = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        self.docker
            .create_image(Some(opts), None, None)
            .try_for_each(|_| async { Ok(()) })
            .await
            .map_err(|e| map_err(image, e))
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError> {
        let host_config = HostConfig {
            binds: Some(vec![spec.bind()]),
            memory: Some(spec.memory_bytes),
            memory_swap: Some(spec.memory_swap_bytes),
            cpuset_cpus: Some(spec.cpuset_cpus.clone()),
            network_mode: Some(spec.network_mode.clone()),
            security_opt: Some(spec.security_opt.clone()),
            ..Default::default()
        };
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()),
            env: Some(spec.env.clone()),
            working_dir: Some(spec.working_dir.clone()),
            labels: Some(spec.labels.clone()),
            tty: Some(true),
            open_stdin: Some(true),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(host_config),
            ..Default::default()
        };
        let resp = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await
            .map_err(|e| map_err(&spec.image, e))?;
        for w in &resp.warnings {
            tracing::warn!(container_id = %resp.id, warning = %w, "docker create warning");
        }
        Ok(ContainerHandle { id: resp.id })
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_err(id, e))
    }

    async fn inspect(&self, id: &str) -> Result<ContainerStatus, RuntimeError> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_err(id, e))?;
        let running = info
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);
        Ok(ContainerStatus {
            id: info.id.unwrap_or_else(|| id.to_string()),
            running,
        })
    }

    async fn attach(&self, id: &str) -> Result<Attached, RuntimeError> {
        let opts = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(false),
            detach_keys: None,
        };
        let AttachContainerResults { output, input } = self
            .docker
            .attach_container(id, Some(opts))
            .await
            .map_err(|e| map_err(id, e))?;
        let output = output
            .map(|chunk| {
                chunk
                    .map(|log| log.into_bytes().to_vec())
                    .map_err(std::io::Error::other)
            })
            .boxed();
        Ok(Attached { output, input })
    }

    async fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<(), RuntimeError> {
        self.docker
            .resize_container_tty(
                id,
                ResizeContainerTtyOptions {
                    width: cols,
                    height: rows,
                },
            )
            .await
            .map_err(|e| map_err(id, e))
    }

    async fn stop(&self, id: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .stop_container(id, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await
        {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(map_err(id, e)),
        }
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| map_err(id, e))
    }
}
