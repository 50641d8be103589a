//! Error mapping guide:
//! - Library code returns `SessionError`; the binary wraps it in `anyhow` at the edge.
//! - Client-visible strings come from the `Display` impls below; keep them stable.
//! - Map a missing runtime (or io::ErrorKind::NotFound) to exit code 127; all others to 1.
use std::io;

use thiserror::Error;

use crate::runtime::RuntimeError;
use crate::store::project::ProjectError;
use crate::store::StoreError;

/// Map an io::Error to a process exit code:
/// - 127 for NotFound (binary or socket not found)
/// - 1 for all other errors
pub fn exit_code_for_io_error(e: &io::Error) -> u8 {
    if e.kind() == io::ErrorKind::NotFound {
        127
    } else {
        1
    }
}

/// Why a credential was refused. Each variant has a distinct client message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthFailure {
    #[error("Authentication error: Token missing")]
    MissingCredential,
    #[error("Authentication error: Invalid token")]
    InvalidCredential,
    #[error("Authentication error: Token expired")]
    Expired,
    #[error("Authorization error: Admin access required")]
    InsufficientPrivilege,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    AuthFailure(#[from] AuthFailure),
    #[error("{0}")]
    BadRequest(String),
    #[error("Session already active elsewhere.")]
    SessionConflict,
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),
    #[error("container {0} is missing")]
    ContainerMissing(String),
    #[error("terminal stream failed: {0}")]
    StreamFailure(String),
    #[error("setup superseded by a newer attempt")]
    SetupSuperseded,
    #[error("Terminal session not found")]
    NotFound,
    #[error("Terminal session is not active")]
    NotActive,
    #[error("Not authorized for this session")]
    Forbidden,
    #[error(transparent)]
    Project(#[from] ProjectError),
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Runtime(RuntimeError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(_) => SessionError::NotFound,
            other => SessionError::Store(other),
        }
    }
}

impl From<RuntimeError> for SessionError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::Unavailable(msg) => SessionError::RuntimeUnavailable(msg),
            RuntimeError::NotFound(id) => SessionError::ContainerMissing(id),
            other => SessionError::Runtime(other),
        }
    }
}

impl SessionError {
    /// True for refusals decided by the gatekeeper before any container work.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            SessionError::AuthFailure(_)
                | SessionError::BadRequest(_)
                | SessionError::SessionConflict
                | SessionError::NotFound
                | SessionError::NotActive
                | SessionError::Forbidden
        )
    }
}

/// Convert SessionError to exit code (parity with io::Error mapping).
pub fn exit_code_for_error(e: &SessionError) -> u8 {
    match e {
        SessionError::RuntimeUnavailable(_) => 127,
        SessionError::Io(ioe) => exit_code_for_io_error(ioe),
        _ => 1,
    }
}

/// Render the message a terminal client sees when setup fails after admission.
pub fn display_for_setup_error(e: &SessionError) -> String {
    if e.is_rejection() {
        e.to_string()
    } else {
        format!("Failed to connect to terminal session: {e}")
    }
}
