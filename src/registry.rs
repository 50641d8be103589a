/*!
In-memory session registry.

- One entry per session id: owning connection, setup token, container, stream.
- `acquire` installs a placeholder; only the attempt holding the entry's token may `complete`
  it. Every step after an await re-checks the token before touching shared state.
- All `release*` variants remove the entry and drop its stream (aborts the output pump and
  closes the writer). They are idempotent: the second caller gets `None`.
- The map lock is a `std::sync::Mutex` and is never held across an await.
*/

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::AbortHandle;

use crate::errors::SessionError;
use crate::multiplexer::ClientHandle;
use crate::runtime::InputSink;
use crate::util::id::setup_token;

/// Shared writer to a container's stdin.
pub type SharedWriter = Arc<tokio::sync::Mutex<InputSink>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    StreamEnded,
    StreamFailed,
    ClientDisconnected,
    ClientTooSlow,
    SetupFailed,
    Terminated,
    Shutdown,
}

struct StreamHandle {
    writer: SharedWriter,
    pump: Option<AbortHandle>,
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if let Some(p) = self.pump.take() {
            p.abort();
        }
    }
}

struct Entry {
    client: ClientHandle,
    token: String,
    setup_in_progress: bool,
    container: Option<String>,
    stream: Option<StreamHandle>,
}

impl Entry {
    /// Neither mid-setup nor streaming, or its connection is already gone.
    fn is_stale(&self) -> bool {
        (!self.setup_in_progress && self.stream.is_none()) || self.client.is_closed()
    }
}

/// What a release removed.
#[derive(Debug)]
pub struct Released {
    pub client: ClientHandle,
    pub token: String,
    pub container: Option<String>,
    pub reason: ReleaseReason,
}

#[derive(Default)]
pub struct SessionRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Claim `session_id` for `client`. Returns the new setup token.
    pub fn acquire(&self, session_id: &str, client: ClientHandle) -> Result<String, SessionError> {
        let mut map = self.map();
        if let Some(existing) = map.get(session_id) {
            if !existing.is_stale() {
                return Err(SessionError::SessionConflict);
            }
            tracing::debug!(
                session_id,
                stale_conn = %existing.client.id(),
                conn = %client.id(),
                "replacing stale registry entry"
            );
        }
        let token = setup_token();
        // Replacing drops any stale stream, which aborts its pump.
        map.insert(
            session_id.to_string(),
            Entry {
                client,
                token: token.clone(),
                setup_in_progress: true,
                container: None,
                stream: None,
            },
        );
        Ok(token)
    }

    /// True while `token` is the attempt authorized to finish setup.
    pub fn is_setup_current(&self, session_id: &str, token: &str) -> bool {
        self.map()
            .get(session_id)
            .map(|e| e.token == token && e.setup_in_progress)
            .unwrap_or(false)
    }

    /// Promote the placeholder to ready. Returns false (and drops `writer`) when `token`
    /// no longer owns the entry.
    pub fn complete(
        &self,
        session_id: &str,
        token: &str,
        container_id: &str,
        writer: InputSink,
    ) -> bool {
        let mut map = self.map();
        match map.get_mut(session_id) {
            Some(e) if e.token == token && e.setup_in_progress => {
                e.setup_in_progress = false;
                e.container = Some(container_id.to_string());
                e.stream = Some(StreamHandle {
                    writer: Arc::new(tokio::sync::Mutex::new(writer)),
                    pump: None,
                });
                true
            }
            _ => false,
        }
    }

    /// Record the output pump so a release can stop it. Returns false when the entry moved
    /// on; the caller must then abort the pump itself.
    pub fn bind_pump(&self, session_id: &str, token: &str, pump: AbortHandle) -> bool {
        let mut map = self.map();
        match map.get_mut(session_id).filter(|e| e.token == token) {
            Some(Entry {
                stream: Some(s), ..
            }) => {
                s.pump = Some(pump);
                true
            }
            _ => false,
        }
    }

    /// True while the stream installed under `token` is the one of record.
    pub fn is_current(&self, session_id: &str, token: &str) -> bool {
        self.map()
            .get(session_id)
            .map(|e| e.token == token && e.stream.is_some())
            .unwrap_or(false)
    }

    pub fn writer_for(&self, session_id: &str, conn_id: &str) -> Option<SharedWriter> {
        self.map()
            .get(session_id)
            .filter(|e| e.client.id() == conn_id)
            .and_then(|e| e.stream.as_ref().map(|s| s.writer.clone()))
    }

    pub fn container_for(&self, session_id: &str, conn_id: &str) -> Option<String> {
        self.map()
            .get(session_id)
            .filter(|e| e.client.id() == conn_id && e.stream.is_some())
            .and_then(|e| e.container.clone())
    }

    pub fn owner_of(&self, session_id: &str) -> Option<String> {
        self.map().get(session_id).map(|e| e.client.id().to_string())
    }

    fn remove_if(
        &self,
        session_id: &str,
        reason: ReleaseReason,
        pred: impl FnOnce(&Entry) -> bool,
    ) -> Option<Released> {
        let entry = {
            let mut map = self.map();
            match map.get(session_id) {
                Some(e) if pred(e) => map.remove(session_id),
                _ => None,
            }
        }?;
        tracing::debug!(session_id, conn = %entry.client.id(), ?reason, "registry entry released");
        let Entry {
            client,
            token,
            container,
            stream,
            ..
        } = entry;
        drop(stream);
        Some(Released {
            client,
            token,
            container,
            reason,
        })
    }

    /// Unconditional release.
    pub fn release(&self, session_id: &str, reason: ReleaseReason) -> Option<Released> {
        self.remove_if(session_id, reason, |_| true)
    }

    /// Release only if `token` still owns the entry.
    pub fn release_attempt(
        &self,
        session_id: &str,
        token: &str,
        reason: ReleaseReason,
    ) -> Option<Released> {
        self.remove_if(session_id, reason, |e| e.token == token)
    }

    /// Release only if `conn_id` still owns the entry.
    pub fn release_owned(
        &self,
        session_id: &str,
        conn_id: &str,
        reason: ReleaseReason,
    ) -> Option<Released> {
        self.remove_if(session_id, reason, |e| e.client.id() == conn_id)
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }

    /// Remove every entry.
    pub fn drain(&self, reason: ReleaseReason) -> Vec<(String, Released)> {
        let drained: Vec<(String, Entry)> = self.map().drain().collect();
        drained
            .into_iter()
            .map(|(id, e)| {
                let Entry {
                    client,
                    token,
                    container,
                    stream,
                    ..
                } = e;
                drop(stream);
                (
                    id,
                    Released {
                        client,
                        token,
                        container,
                        reason,
                    },
                )
            })
            .collect()
    }
}
