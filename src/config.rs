/*!
Process configuration.

- `Config::from_env()` reads `SANDTERM_*` and the Docker endpoint variables (after `.env`
  has been loaded by the binary); `Config::from_lookup` takes any key lookup for tests.
- CLI flags override individual fields after loading (see `main.rs`).
- Docker endpoint precedence: `DOCKER_HOST` URL, then `DOCKER_SOCKET` if the path exists,
  then the platform default.
*/

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_BIND: &str = "127.0.0.1:5000";
pub const DEFAULT_OUTPUT_BUFFER: usize = 256;
pub const DEFAULT_SLOW_CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Base image used when nothing else is configured. A build may bake a different one.
pub fn default_image() -> &'static str {
    option_env!("SANDTERM_BAKED_IMAGE").unwrap_or("alpine:3.20")
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {key}={value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("{0} must be set")]
    Missing(&'static str),
}

/// What happens to a session's container when its owning connection goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum DisconnectPolicy {
    /// Release the registry entry and terminate the session.
    #[default]
    Terminate,
    /// Release the registry entry only; the container stays up for a later reattach.
    Detach,
}

impl FromStr for DisconnectPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "terminate" => Ok(DisconnectPolicy::Terminate),
            "detach" => Ok(DisconnectPolicy::Detach),
            other => Err(format!("expected 'terminate' or 'detach', got '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DockerEndpoint {
    /// `http://host:port` derived from a `tcp://` or `http://` DOCKER_HOST.
    Tcp(String),
    Unix(PathBuf),
    Default,
}

impl std::fmt::Display for DockerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DockerEndpoint::Tcp(u) => write!(f, "{u}"),
            DockerEndpoint::Unix(p) => write!(f, "unix://{}", p.display()),
            DockerEndpoint::Default => write!(f, "(platform default)"),
        }
    }
}

/// Per-container limits and shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxConfig {
    pub image: String,
    pub memory_mb: u64,
    pub swap_mb: u64,
    pub cpuset: String,
    pub network_mode: String,
    pub mount_point: String,
    pub shell: String,
    pub term: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        SandboxConfig {
            image: default_image().to_string(),
            memory_mb: 512,
            swap_mb: 1024,
            cpuset: "0".to_string(),
            network_mode: "bridge".to_string(),
            mount_point: "/app".to_string(),
            shell: "/bin/sh".to_string(),
            term: "xterm".to_string(),
        }
    }
}

impl SandboxConfig {
    pub fn memory_bytes(&self) -> i64 {
        (self.memory_mb as i64).saturating_mul(1024 * 1024)
    }

    pub fn memory_swap_bytes(&self) -> i64 {
        (self.swap_mb as i64).saturating_mul(1024 * 1024)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub on_disconnect: DisconnectPolicy,
    /// Outbound events queued per connection before the slow-client clock starts.
    pub output_buffer: usize,
    pub slow_client_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings {
            on_disconnect: DisconnectPolicy::default(),
            output_buffer: DEFAULT_OUTPUT_BUFFER,
            slow_client_timeout: DEFAULT_SLOW_CLIENT_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: SocketAddr,
    pub jwt_secret: Option<String>,
    pub docker: DockerEndpoint,
    pub data_dir: PathBuf,
    pub sandbox: SandboxConfig,
    pub session: SessionSettings,
}

impl Config {
    pub fn from_env() -> Result<Config, ConfigError> {
        Config::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Config, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |k: &str| {
            lookup(k)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let bind_raw = get("SANDTERM_BIND").unwrap_or_else(|| DEFAULT_BIND.to_string());
        let bind = bind_raw.parse().map_err(|e| ConfigError::Invalid {
            key: "SANDTERM_BIND",
            value: bind_raw.clone(),
            reason: format!("{e}"),
        })?;

        let mut sandbox = SandboxConfig::default();
        if let Some(img) = get("SANDTERM_BASE_IMAGE") {
            sandbox.image = img;
        }
        if let Some(v) = get("SANDTERM_MEMORY_MB") {
            sandbox.memory_mb = parse_num("SANDTERM_MEMORY_MB", &v)?;
        }
        if let Some(v) = get("SANDTERM_SWAP_MB") {
            sandbox.swap_mb = parse_num("SANDTERM_SWAP_MB", &v)?;
        }
        if let Some(v) = get("SANDTERM_CPUSET") {
            sandbox.cpuset = v;
        }

        let mut session = SessionSettings::default();
        if let Some(v) = get("SANDTERM_ON_DISCONNECT") {
            session.on_disconnect = v.parse().map_err(|reason| ConfigError::Invalid {
                key: "SANDTERM_ON_DISCONNECT",
                value: v.clone(),
                reason,
            })?;
        }
        if let Some(v) = get("SANDTERM_OUTPUT_BUFFER") {
            let n: u64 = parse_num("SANDTERM_OUTPUT_BUFFER", &v)?;
            if n == 0 {
                return Err(ConfigError::Invalid {
                    key: "SANDTERM_OUTPUT_BUFFER",
                    value: v,
                    reason: "must be at least 1".to_string(),
                });
            }
            session.output_buffer = n as usize;
        }
        if let Some(v) = get("SANDTERM_SLOW_CLIENT_TIMEOUT") {
            session.slow_client_timeout =
                humantime::parse_duration(&v).map_err(|e| ConfigError::Invalid {
                    key: "SANDTERM_SLOW_CLIENT_TIMEOUT",
                    value: v.clone(),
                    reason: e.to_string(),
                })?;
        }

        Ok(Config {
            bind,
            jwt_secret: get("SANDTERM_JWT_SECRET"),
            docker: resolve_docker_endpoint(get("DOCKER_HOST"), get("DOCKER_SOCKET"))?,
            data_dir: get("SANDTERM_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            sandbox,
            session,
        })
    }

    /// Secret for verifying credentials; required by `serve`.
    pub fn require_jwt_secret(&self) -> Result<&str, ConfigError> {
        self.jwt_secret
            .as_deref()
            .ok_or(ConfigError::Missing("SANDTERM_JWT_SECRET"))
    }

    pub fn session_store_path(&self) -> PathBuf {
        self.data_dir.join("sessions.json")
    }

    pub fn projects_root(&self) -> PathBuf {
        self.data_dir.join("projects")
    }
}

fn parse_num(key: &'static str, v: &str) -> Result<u64, ConfigError> {
    v.parse().map_err(|e: std::num::ParseIntError| ConfigError::Invalid {
        key,
        value: v.to_string(),
        reason: e.to_string(),
    })
}

fn resolve_docker_endpoint(
    host: Option<String>,
    socket: Option<String>,
) -> Result<DockerEndpoint, ConfigError> {
    if let Some(raw) = host {
        let parsed = url::Url::parse(&raw).map_err(|e| ConfigError::Invalid {
            key: "DOCKER_HOST",
            value: raw.clone(),
            reason: e.to_string(),
        })?;
        return match parsed.scheme() {
            "unix" => Ok(DockerEndpoint::Unix(PathBuf::from(parsed.path()))),
            "tcp" | "http" => {
                let h = parsed.host_str().ok_or_else(|| ConfigError::Invalid {
                    key: "DOCKER_HOST",
                    value: raw.clone(),
                    reason: "missing host".to_string(),
                })?;
                let port = parsed.port().unwrap_or(2375);
                Ok(DockerEndpoint::Tcp(format!("http://{h}:{port}")))
            }
            other => Err(ConfigError::Invalid {
                key: "DOCKER_HOST",
                value: raw.clone(),
                reason: format!("unsupported scheme '{other}'"),
            }),
        };
    }
    if let Some(sock) = socket {
        let p = PathBuf::from(sock);
        if p.exists() {
            return Ok(DockerEndpoint::Unix(p));
        }
        tracing::warn!(path = %p.display(), "DOCKER_SOCKET does not exist; using platform default");
    }
    Ok(DockerEndpoint::Default)
}
