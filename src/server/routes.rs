use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::auth::{bearer_token, Principal};
use crate::errors::{AuthFailure, SessionError};
use crate::orchestrator::Orchestrator;
use crate::store::project::ProjectError;
use crate::store::SessionRecord;

pub(super) struct ApiError(SessionError);

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        ApiError(e)
    }
}

fn status_for(e: &SessionError) -> StatusCode {
    match e {
        SessionError::AuthFailure(AuthFailure::InsufficientPrivilege) => StatusCode::FORBIDDEN,
        SessionError::AuthFailure(_) => StatusCode::UNAUTHORIZED,
        SessionError::BadRequest(_) | SessionError::Project(ProjectError::InvalidId(_)) => {
            StatusCode::BAD_REQUEST
        }
        SessionError::Forbidden => StatusCode::FORBIDDEN,
        SessionError::NotFound | SessionError::Project(ProjectError::ArchiveMissing(_)) => {
            StatusCode::NOT_FOUND
        }
        SessionError::SessionConflict | SessionError::NotActive => StatusCode::CONFLICT,
        SessionError::RuntimeUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        (status, Json(json!({ "message": self.0.to_string() }))).into_response()
    }
}

async fn principal(orch: &Orchestrator, headers: &HeaderMap) -> Result<Principal, ApiError> {
    let credential = match headers.get(header::AUTHORIZATION) {
        None => None,
        Some(v) => Some(
            v.to_str()
                .ok()
                .and_then(bearer_token)
                .ok_or(SessionError::AuthFailure(AuthFailure::InvalidCredential))?,
        ),
    };
    Ok(orch.authenticate(credential).await?)
}

#[derive(Debug, Deserialize)]
pub(super) struct StartBody {
    project_id: String,
}

pub(super) async fn start_session(
    State(orch): State<Orchestrator>,
    headers: HeaderMap,
    Json(body): Json<StartBody>,
) -> Result<impl IntoResponse, ApiError> {
    let who = principal(&orch, &headers).await?;
    let started = orch.start_session(&who, &body.project_id).await?;
    let (status, message) = if started.reused {
        (StatusCode::OK, "Terminal session already active")
    } else {
        (StatusCode::CREATED, "Terminal session started")
    };
    Ok((
        status,
        Json(json!({ "session_id": started.session_id, "message": message })),
    ))
}

pub(super) async fn terminate_session(
    State(orch): State<Orchestrator>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let who = principal(&orch, &headers).await?;
    let done = orch.terminate_session(&who, &id).await?;
    Ok(Json(json!({ "message": done.message() })))
}

pub(super) async fn list_sessions(
    State(orch): State<Orchestrator>,
    headers: HeaderMap,
) -> Result<Json<Vec<SessionRecord>>, ApiError> {
    let who = principal(&orch, &headers).await?;
    Ok(Json(orch.list_sessions(&who).await?))
}

pub(super) async fn healthz(State(orch): State<Orchestrator>) -> impl IntoResponse {
    Json(json!({ "status": "ok", "attached": orch.registry().len() }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            status_for(&AuthFailure::MissingCredential.into()),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_for(&AuthFailure::InsufficientPrivilege.into()),
            StatusCode::FORBIDDEN
        );
        assert_eq!(status_for(&SessionError::SessionConflict), StatusCode::CONFLICT);
        assert_eq!(status_for(&SessionError::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for(&SessionError::RuntimeUnavailable("down".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&SessionError::StreamFailure("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
