/*!
Container lifecycle manager.

Sole writer of a session's container lifecycle and of its durable record. Writers for one
session id (recreate, terminate) are serialized by a per-session async lock, so a terminate
issued during a recreate stops the fresh container instead of racing it.

Recovery is single-shot: a missing or stopped container is recreated once per resolve;
failures during create or attach end the attempt.
*/

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::io::AsyncWriteExt;
use tokio::sync::OwnedMutexGuard;

use crate::config::SandboxConfig;
use crate::errors::SessionError;
use crate::runtime::{Attached, ContainerHandle, ContainerRuntime, ContainerSpec, RuntimeError};
use crate::store::project::ProjectStore;
use crate::store::{RecordUpdate, SessionRecord, SessionStore, StoreError};
use crate::util::{id, validate_resource_id};

/// Written to a fresh attach so the server owns echo.
pub const STTY_NO_ECHO: &[u8] = b"stty -echo\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Terminated,
    AlreadyTerminated,
}

impl Termination {
    pub fn message(&self) -> &'static str {
        match self {
            Termination::Terminated => "Terminal session terminated successfully",
            Termination::AlreadyTerminated => "Session already terminated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedSession {
    pub session_id: String,
    /// True when an existing active session for the pair was returned.
    pub reused: bool,
}

#[derive(Default)]
struct SessionLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionLocks {
    async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let m = {
            let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            map.retain(|_, m| Arc::strong_count(m) > 1);
            map.entry(key.to_string()).or_default().clone()
        };
        m.lock_owned().await
    }
}

pub struct LifecycleManager {
    runtime: Arc<dyn ContainerRuntime>,
    sessions: Arc<dyn SessionStore>,
    projects: Arc<dyn ProjectStore>,
    sandbox: SandboxConfig,
    locks: SessionLocks,
}

impl LifecycleManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        sessions: Arc<dyn SessionStore>,
        projects: Arc<dyn ProjectStore>,
        sandbox: SandboxConfig,
    ) -> Self {
        LifecycleManager {
            runtime,
            sessions,
            projects,
            sandbox,
            locks: SessionLocks::default(),
        }
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    pub fn sandbox(&self) -> &SandboxConfig {
        &self.sandbox
    }

    pub async fn ping(&self) -> Result<(), SessionError> {
        self.runtime
            .ping()
            .await
            .map_err(|e| SessionError::RuntimeUnavailable(e.to_string()))
    }

    /// Container shape for a session of `project_id` bound at `bind_source`.
    pub fn container_spec(&self, project_id: &str, session_id: &str, bind_source: &str) -> ContainerSpec {
        let s = &self.sandbox;
        let mut labels = HashMap::new();
        labels.insert("sandterm.session".to_string(), session_id.to_string());
        labels.insert("sandterm.project".to_string(), project_id.to_string());
        ContainerSpec {
            image: s.image.clone(),
            bind_source: bind_source.to_string(),
            mount_point: s.mount_point.clone(),
            memory_bytes: s.memory_bytes(),
            memory_swap_bytes: s.memory_swap_bytes(),
            cpuset_cpus: s.cpuset.clone(),
            network_mode: s.network_mode.clone(),
            security_opt: vec!["no-new-privileges:true".to_string()],
            env: vec![format!("TERM={}", s.term)],
            cmd: vec![s.shell.clone()],
            working_dir: s.mount_point.clone(),
            labels,
        }
    }

    /// Extract sources, make sure the image is present, then create and start a container.
    async fn launch(&self, project_id: &str, session_id: &str) -> Result<ContainerHandle, SessionError> {
        let bind = self.projects.ensure_extracted(project_id).await?;
        if let Err(e) = self.runtime.ensure_image(&self.sandbox.image).await {
            // create reports the real error if the image is still missing
            tracing::warn!(image = %self.sandbox.image, error = %e, "image pull failed");
        }
        let spec = self.container_spec(project_id, session_id, &bind.to_string_lossy());
        let handle = self.runtime.create(&spec).await?;
        if let Err(e) = self.runtime.start(&handle.id).await {
            self.discard(&handle.id).await;
            return Err(e.into());
        }
        Ok(handle)
    }

    async fn discard(&self, container_id: &str) {
        match self.runtime.remove(container_id).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {}
            Err(e) => {
                tracing::warn!(container_id, error = %e, "failed to remove container (may require manual cleanup)")
            }
        }
    }

    /// Return the active session for (project, operator), starting one if there is none.
    pub async fn start_session(
        &self,
        project_id: &str,
        operator_id: &str,
    ) -> Result<StartedSession, SessionError> {
        validate_resource_id(project_id, "project id").map_err(SessionError::BadRequest)?;
        self.ping().await?;
        let _pair = self.locks.lock(&format!("start:{project_id}:{operator_id}")).await;

        if let Some(existing) = self.sessions.find_active(project_id, operator_id).await? {
            return Ok(StartedSession {
                session_id: existing.id,
                reused: true,
            });
        }

        let session_id = id::session_id();
        let handle = self.launch(project_id, &session_id).await?;
        let record =
            SessionRecord::new_active(session_id.clone(), project_id, operator_id, handle.id.clone());
        match self.sessions.create(record).await {
            Ok(()) => {
                tracing::info!(session_id = %session_id, project_id, container_id = %handle.id, "session started");
                Ok(StartedSession {
                    session_id,
                    reused: false,
                })
            }
            Err(StoreError::DuplicateActive(existing)) => {
                self.discard(&handle.id).await;
                Ok(StartedSession {
                    session_id: existing,
                    reused: true,
                })
            }
            Err(e) => {
                self.discard(&handle.id).await;
                Err(e.into())
            }
        }
    }

    async fn active_record(&self, session_id: &str) -> Result<SessionRecord, SessionError> {
        let rec = self
            .sessions
            .find(session_id)
            .await?
            .ok_or(SessionError::NotFound)?;
        if !rec.is_active() {
            return Err(SessionError::NotActive);
        }
        Ok(rec)
    }

    /// Running container for the session; a missing or stopped one is recreated once.
    pub async fn resolve_container(&self, session_id: &str) -> Result<ContainerHandle, SessionError> {
        let _guard = self.locks.lock(session_id).await;
        let rec = self.active_record(session_id).await?;
        match self.runtime.inspect(&rec.container_id).await {
            Ok(st) if st.running => Ok(ContainerHandle { id: st.id }),
            Ok(_) => {
                tracing::info!(session_id, container_id = %rec.container_id, "container stopped; recreating");
                self.discard(&rec.container_id).await;
                self.recreate_locked(&rec).await
            }
            Err(RuntimeError::NotFound(_)) => {
                tracing::info!(session_id, container_id = %rec.container_id, "container missing; recreating");
                self.recreate_locked(&rec).await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the session's container. Only the record's container id changes.
    pub async fn recreate(&self, session_id: &str) -> Result<ContainerHandle, SessionError> {
        let _guard = self.locks.lock(session_id).await;
        let rec = self.active_record(session_id).await?;
        self.discard(&rec.container_id).await;
        self.recreate_locked(&rec).await
    }

    async fn recreate_locked(&self, rec: &SessionRecord) -> Result<ContainerHandle, SessionError> {
        let handle = self.launch(&rec.project_id, &rec.id).await?;
        if let Err(e) = self
            .sessions
            .update(&rec.id, RecordUpdate::container(handle.id.clone()))
            .await
        {
            self.discard(&handle.id).await;
            return Err(e.into());
        }
        tracing::info!(session_id = %rec.id, old = %rec.container_id, new = %handle.id, "container recreated");
        Ok(handle)
    }

    /// Hijack the container's TTY and turn off its echo.
    pub async fn attach(&self, container_id: &str) -> Result<Attached, SessionError> {
        let mut attached = self.runtime.attach(container_id).await?;
        let res = match attached.input.write_all(STTY_NO_ECHO).await {
            Ok(()) => attached.input.flush().await,
            Err(e) => Err(e),
        };
        res.map_err(|e| SessionError::StreamFailure(e.to_string()))?;
        Ok(attached)
    }

    pub async fn resize(&self, container_id: &str, cols: u16, rows: u16) -> Result<(), SessionError> {
        self.runtime
            .resize(container_id, cols, rows)
            .await
            .map_err(Into::into)
    }

    /// Stop and remove the container and mark the record terminated. Safe to repeat; only the
    /// first call reaches the runtime.
    pub async fn terminate(&self, session_id: &str) -> Result<Termination, SessionError> {
        let _guard = self.locks.lock(session_id).await;
        let rec = self
            .sessions
            .find(session_id)
            .await?
            .ok_or(SessionError::NotFound)?;
        if !rec.is_active() {
            return Ok(Termination::AlreadyTerminated);
        }
        match self.runtime.stop(&rec.container_id).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {}
            Err(e) => {
                tracing::warn!(session_id, container_id = %rec.container_id, error = %e, "failed to stop container (may already be stopped)")
            }
        }
        match self.runtime.remove(&rec.container_id).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.sessions
            .update(session_id, RecordUpdate::terminated(chrono::Utc::now()))
            .await?;
        tracing::info!(session_id, container_id = %rec.container_id, "session terminated");
        Ok(Termination::Terminated)
    }
}
