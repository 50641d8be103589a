/*!
The orchestrator owns the registry, the lifecycle manager and the gatekeeper for one
process. It is constructed explicitly and shut down explicitly.

Connection flow: gatekeeper admit → registry acquire → resolve container → attach →
registry complete → `connected` → output pump. Client disconnect, stream end, explicit
termination and shutdown all go through the registry's idempotent release; whoever releases
the entry owns the follow-up (client notification, disconnect policy, termination).
*/

use std::sync::Arc;

use crate::auth::{AuthVerifier, Principal};
use crate::config::{DisconnectPolicy, SandboxConfig, SessionSettings};
use crate::errors::{display_for_setup_error, AuthFailure, SessionError};
use crate::gatekeeper::{ConnectRequest, Gatekeeper};
use crate::lifecycle::{LifecycleManager, StartedSession, Termination};
use crate::multiplexer::{pump_output, Attachment, ClientHandle, ClientRx, PumpExit, SendFailure};
use crate::protocol::ServerEvent;
use crate::registry::{ReleaseReason, SessionRegistry};
use crate::runtime::{Attached, ContainerRuntime, OutputStream};
use crate::store::project::ProjectStore;
use crate::store::{SessionRecord, SessionStore};

/// External collaborators an orchestrator is built from.
pub struct Collaborators {
    pub verifier: Arc<dyn AuthVerifier>,
    pub sessions: Arc<dyn SessionStore>,
    pub projects: Arc<dyn ProjectStore>,
    pub runtime: Arc<dyn ContainerRuntime>,
}

struct Inner {
    gatekeeper: Gatekeeper,
    registry: SessionRegistry,
    lifecycle: LifecycleManager,
    settings: SessionSettings,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

fn short(token: &str) -> &str {
    token.get(..8).unwrap_or(token)
}

impl Orchestrator {
    pub fn new(parts: Collaborators, sandbox: SandboxConfig, settings: SessionSettings) -> Self {
        let Collaborators {
            verifier,
            sessions,
            projects,
            runtime,
        } = parts;
        Orchestrator {
            inner: Arc::new(Inner {
                gatekeeper: Gatekeeper::new(verifier, sessions.clone()),
                registry: SessionRegistry::new(),
                lifecycle: LifecycleManager::new(runtime, sessions, projects, sandbox),
                settings,
            }),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.inner.lifecycle
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.inner.settings
    }

    /// A fresh outbound queue sized from the session settings.
    pub fn client_channel(&self) -> (ClientHandle, ClientRx) {
        ClientHandle::channel(
            self.inner.settings.output_buffer,
            self.inner.settings.slow_client_timeout,
        )
    }

    pub async fn authenticate(&self, credential: Option<&str>) -> Result<Principal, SessionError> {
        self.inner.gatekeeper.authenticate(credential).await
    }

    pub async fn start_session(
        &self,
        principal: &Principal,
        project_id: &str,
    ) -> Result<StartedSession, SessionError> {
        if !principal.can_open_terminal() {
            return Err(AuthFailure::InsufficientPrivilege.into());
        }
        self.lifecycle()
            .start_session(project_id, &principal.operator_id)
            .await
    }

    pub async fn terminate_session(
        &self,
        principal: &Principal,
        session_id: &str,
    ) -> Result<Termination, SessionError> {
        if !principal.can_open_terminal() {
            return Err(AuthFailure::InsufficientPrivilege.into());
        }
        let rec = self
            .lifecycle()
            .sessions()
            .find(session_id)
            .await?
            .ok_or(SessionError::NotFound)?;
        if rec.operator_id != principal.operator_id {
            return Err(SessionError::Forbidden);
        }
        if let Some(rel) = self.registry().release(session_id, ReleaseReason::Terminated) {
            tokio::spawn(async move {
                rel.client
                    .finish(Some(ServerEvent::terminated("Terminal session terminated")))
                    .await;
            });
        }
        self.lifecycle().terminate(session_id).await
    }

    pub async fn list_sessions(&self, principal: &Principal) -> Result<Vec<SessionRecord>, SessionError> {
        Ok(self
            .lifecycle()
            .sessions()
            .list_active_for(&principal.operator_id)
            .await?)
    }

    /// Admit and set up a terminal connection. On failure the client has already been told
    /// why and asked to close.
    pub async fn connect(
        &self,
        req: ConnectRequest<'_>,
        client: ClientHandle,
    ) -> Result<Attachment, SessionError> {
        let admission = match self.inner.gatekeeper.admit(req).await {
            Ok(a) => a,
            Err(e) => {
                tracing::info!(conn = %client.id(), error = %e, "connection rejected");
                client.finish(Some(ServerEvent::error(e.to_string()))).await;
                return Err(e);
            }
        };
        let session_id = admission.record.id;
        let token = match self.registry().acquire(&session_id, client.clone()) {
            Ok(t) => t,
            Err(e) => {
                tracing::info!(session_id = %session_id, conn = %client.id(), "session already attached elsewhere");
                client.finish(Some(ServerEvent::error(e.to_string()))).await;
                return Err(e);
            }
        };
        tracing::debug!(session_id = %session_id, setup = short(&token), conn = %client.id(), "setup started");

        match self.setup(&session_id, &token, &client).await {
            Ok(()) => {
                tracing::info!(session_id = %session_id, conn = %client.id(), operator = %admission.principal.operator_id, "terminal attached");
                Ok(Attachment::new(session_id, client, self.clone()))
            }
            Err(e) => {
                self.registry()
                    .release_attempt(&session_id, &token, ReleaseReason::SetupFailed);
                if matches!(e, SessionError::SetupSuperseded) {
                    tracing::debug!(session_id = %session_id, setup = short(&token), "setup superseded");
                    client.finish(None).await;
                } else {
                    tracing::warn!(session_id = %session_id, setup = short(&token), error = %e, "setup failed");
                    tracing::info!(session_id = %session_id, "session left active; container kept for a retry or explicit terminate");
                    client
                        .finish(Some(ServerEvent::error(display_for_setup_error(&e))))
                        .await;
                }
                Err(e)
            }
        }
    }

    async fn setup(
        &self,
        session_id: &str,
        token: &str,
        client: &ClientHandle,
    ) -> Result<(), SessionError> {
        let container = self.lifecycle().resolve_container(session_id).await?;
        if !self.registry().is_setup_current(session_id, token) {
            return Err(SessionError::SetupSuperseded);
        }
        let Attached { output, input } = self.lifecycle().attach(&container.id).await?;
        if !self.registry().complete(session_id, token, &container.id, input) {
            return Err(SessionError::SetupSuperseded);
        }
        if client.send(ServerEvent::connected()).await.is_err() {
            return Err(SessionError::StreamFailure(
                "client went away during setup".to_string(),
            ));
        }
        self.spawn_pump(session_id, token, output, client.clone());
        Ok(())
    }

    fn spawn_pump(&self, session_id: &str, token: &str, output: OutputStream, client: ClientHandle) {
        let this = self.clone();
        let sid = session_id.to_string();
        let tok = token.to_string();
        let task = tokio::spawn(async move {
            let exit = pump_output(output, &sid, &tok, &client, this.registry()).await;
            // Teardown runs in its own task: releasing the entry aborts this one.
            tokio::spawn(async move { this.after_pump(&sid, &tok, client, exit).await });
        });
        if !self
            .registry()
            .bind_pump(session_id, token, task.abort_handle())
        {
            task.abort();
        }
    }

    async fn after_pump(&self, session_id: &str, token: &str, client: ClientHandle, exit: PumpExit) {
        let reason = match &exit {
            PumpExit::Superseded => return,
            PumpExit::Ended => ReleaseReason::StreamEnded,
            PumpExit::Failed(_) => ReleaseReason::StreamFailed,
            PumpExit::ClientGone => ReleaseReason::ClientDisconnected,
            PumpExit::ClientTooSlow => ReleaseReason::ClientTooSlow,
        };
        if self
            .registry()
            .release_attempt(session_id, token, reason)
            .is_none()
        {
            return;
        }
        match exit {
            PumpExit::Ended => {
                tracing::info!(session_id, "terminal stream ended");
                client
                    .finish(Some(ServerEvent::terminated("Terminal session ended")))
                    .await;
                self.terminate_quietly(session_id).await;
            }
            PumpExit::Failed(msg) => {
                tracing::warn!(session_id, error = %msg, "terminal stream failed");
                client
                    .finish(Some(ServerEvent::error(format!(
                        "Terminal connection error: {msg}"
                    ))))
                    .await;
                self.terminate_quietly(session_id).await;
            }
            PumpExit::ClientTooSlow => {
                tracing::warn!(session_id, conn = %client.id(), "client too slow; disconnecting");
                client.abort();
                self.apply_disconnect_policy(session_id).await;
            }
            PumpExit::ClientGone => self.apply_disconnect_policy(session_id).await,
            PumpExit::Superseded => {}
        }
    }

    /// A send to the owning client failed outside the pump (e.g. while echoing input).
    pub(crate) async fn client_failed(&self, session_id: &str, client: &ClientHandle, failure: SendFailure) {
        let reason = match failure {
            SendFailure::Gone => ReleaseReason::ClientDisconnected,
            SendFailure::TooSlow => ReleaseReason::ClientTooSlow,
        };
        if self
            .registry()
            .release_owned(session_id, client.id(), reason)
            .is_some()
        {
            if failure == SendFailure::TooSlow {
                tracing::warn!(session_id, conn = %client.id(), "client too slow; disconnecting");
                client.abort();
            }
            self.apply_disconnect_policy(session_id).await;
        }
    }

    /// Writing to the container's stdin failed: same teardown as a failed output stream.
    pub(crate) async fn stream_failed(&self, session_id: &str, client: &ClientHandle, msg: String) {
        if self
            .registry()
            .release_owned(session_id, client.id(), ReleaseReason::StreamFailed)
            .is_none()
        {
            return;
        }
        tracing::warn!(session_id, conn = %client.id(), error = %msg, "container stdin write failed");
        client
            .finish(Some(ServerEvent::error(format!(
                "Terminal connection error: {msg}"
            ))))
            .await;
        self.terminate_quietly(session_id).await;
    }

    pub(crate) async fn disconnected(&self, session_id: &str, conn_id: &str) {
        if self
            .registry()
            .release_owned(session_id, conn_id, ReleaseReason::ClientDisconnected)
            .is_some()
        {
            tracing::info!(session_id, conn = conn_id, "client disconnected");
            self.apply_disconnect_policy(session_id).await;
        }
    }

    async fn apply_disconnect_policy(&self, session_id: &str) {
        match self.inner.settings.on_disconnect {
            DisconnectPolicy::Terminate => self.terminate_quietly(session_id).await,
            DisconnectPolicy::Detach => {
                tracing::info!(session_id, "detached; container kept for reattach")
            }
        }
    }

    async fn terminate_quietly(&self, session_id: &str) {
        if let Err(e) = self.lifecycle().terminate(session_id).await {
            tracing::warn!(session_id, error = %e, "terminate failed");
        }
    }

    /// Release every registry entry, tell each client, and apply the disconnect policy.
    pub async fn shutdown(&self) {
        let drained = self.registry().drain(ReleaseReason::Shutdown);
        if drained.is_empty() {
            return;
        }
        tracing::info!(sessions = drained.len(), "shutting down sessions");
        let work = drained.into_iter().map(|(sid, rel)| async move {
            rel.client
                .finish(Some(ServerEvent::terminated("Server shutting down")))
                .await;
            self.apply_disconnect_policy(&sid).await;
        });
        futures_util::future::join_all(work).await;
    }
}
