//! Connection gatekeeper: identity and ownership checks that run before any container work.
//! Read-only; every refusal carries its own client message.

use std::sync::Arc;

use crate::auth::{AuthVerifier, Principal};
use crate::errors::{AuthFailure, SessionError};
use crate::store::{SessionRecord, SessionStore};
use crate::util::validate_resource_id;

#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectRequest<'a> {
    pub credential: Option<&'a str>,
    pub session_id: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct Admission {
    pub principal: Principal,
    pub record: SessionRecord,
}

pub struct Gatekeeper {
    verifier: Arc<dyn AuthVerifier>,
    sessions: Arc<dyn SessionStore>,
}

impl Gatekeeper {
    pub fn new(verifier: Arc<dyn AuthVerifier>, sessions: Arc<dyn SessionStore>) -> Self {
        Gatekeeper { verifier, sessions }
    }

    /// Validate a credential and require the terminal privilege.
    pub async fn authenticate(&self, credential: Option<&str>) -> Result<Principal, SessionError> {
        let cred = credential
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or(AuthFailure::MissingCredential)?;
        let principal = self.verifier.verify(cred).await?;
        if !principal.can_open_terminal() {
            return Err(AuthFailure::InsufficientPrivilege.into());
        }
        Ok(principal)
    }

    pub async fn admit(&self, req: ConnectRequest<'_>) -> Result<Admission, SessionError> {
        let principal = self.authenticate(req.credential).await?;
        let session_id = req
            .session_id
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SessionError::BadRequest("Session ID is required".to_string()))?;
        if validate_resource_id(session_id, "session id").is_err() {
            return Err(SessionError::NotFound);
        }
        let record = self
            .sessions
            .find(session_id)
            .await?
            .ok_or(SessionError::NotFound)?;
        authorize_session(&principal, &record)?;
        Ok(Admission { principal, record })
    }
}

/// The record must be active and owned by the principal.
pub fn authorize_session(principal: &Principal, record: &SessionRecord) -> Result<(), SessionError> {
    if !record.is_active() {
        return Err(SessionError::NotActive);
    }
    if record.operator_id != principal.operator_id {
        return Err(SessionError::Forbidden);
    }
    Ok(())
}
