//! HTTP endpoints for the call join handshake.
//!
//! Clients create and join calls here to obtain RTC credentials; the live
//! participant events still flow over the WebSocket.

use crate::auth::AuthError;
use crate::handlers::AppState;
use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use vigil_core::{CreateCall, CreatedCall, RealtimeError};
use vigil_protocol::{CallCredentials, CallEndReason, CallSummary, ErrorCode, UserId};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/calls", post(create_call))
        .route("/calls/:id", get(get_call))
        .route("/calls/:id/join", post(join_call))
        .route("/calls/:id/leave", post(leave_call))
        .route("/calls/:id/end", post(end_call))
}

/// The authenticated caller of an endpoint.
#[derive(Debug, Clone)]
pub struct AuthUser(pub UserId);

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let query: Option<Query<HashMap<String, String>>> =
            Query::try_from_uri(&parts.uri).ok();
        let query_token = query
            .as_ref()
            .and_then(|q| q.0.get("token"))
            .map(String::as_str);

        let claims = state.verifier.verify_request(&parts.headers, query_token)?;
        Ok(AuthUser(claims.sub))
    }
}

/// Error body returned by the call endpoints.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: ErrorCode,
    kind: &'static str,
    message: String,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: ErrorCode,
    error: &'a str,
    message: &'a str,
}

impl From<RealtimeError> for ApiError {
    fn from(e: RealtimeError) -> Self {
        let status = match &e {
            RealtimeError::Unauthenticated | RealtimeError::Unauthorized(_) => {
                StatusCode::UNAUTHORIZED
            }
            RealtimeError::Forbidden(_) => StatusCode::FORBIDDEN,
            RealtimeError::InvalidEvent(_) => StatusCode::BAD_REQUEST,
            RealtimeError::CallFull | RealtimeError::CallBusy(_) => StatusCode::CONFLICT,
            RealtimeError::CallEnded => StatusCode::GONE,
            RealtimeError::CallNotFound(_)
            | RealtimeError::MessageNotFound(_)
            | RealtimeError::ConversationNotFound(_)
            | RealtimeError::TargetUnreachable(_) => StatusCode::NOT_FOUND,
            RealtimeError::Persistence(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self {
            status,
            code: e.code(),
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: ErrorCode::Unauthenticated,
            kind: "unauthenticated",
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        debug!(status = %self.status, kind = self.kind, error = %self.message, "Request failed");
        let body = ErrorBody {
            code: self.code,
            error: self.kind,
            message: &self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn refresh_calls_gauge(state: &AppState) {
    crate::metrics::set_active_calls(state.router.calls().active_count());
}

async fn create_call(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Json(request): Json<CreateCall>,
) -> ApiResult<(StatusCode, Json<CreatedCall>)> {
    let created = state.router.calls().create_call(&user, request).await?;
    refresh_calls_gauge(&state);
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_call(
    State(state): State<Arc<AppState>>,
    AuthUser(_): AuthUser,
    Path(call_id): Path<String>,
) -> ApiResult<Json<CallSummary>> {
    Ok(Json(state.router.calls().get_call(&call_id)?))
}

async fn join_call(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(call_id): Path<String>,
) -> ApiResult<Json<CallCredentials>> {
    let joined = state.router.calls().join_call(&call_id, &user).await?;
    refresh_calls_gauge(&state);
    Ok(Json(joined.credentials))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LeftCall {
    call_id: String,
    ended: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<CallEndReason>,
}

async fn leave_call(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(call_id): Path<String>,
) -> ApiResult<Json<LeftCall>> {
    let reason = state.router.calls().leave_call(&call_id, &user).await?;
    refresh_calls_gauge(&state);
    Ok(Json(LeftCall {
        call_id,
        ended: reason.is_some(),
        reason,
    }))
}

async fn end_call(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(call_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.router.calls().end_call(&call_id, &user).await?;
    refresh_calls_gauge(&state);
    Ok(StatusCode::NO_CONTENT)
}
