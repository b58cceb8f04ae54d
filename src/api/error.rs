//! HTTP rendering of [`AppError`].

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::AppError;

impl AppError {
    /// HTTP status this error is reported with.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) | Self::AlreadyRunning { .. } | Self::InvalidTransition { .. } => {
                StatusCode::CONFLICT
            }
            Self::ResumeUnsupported { .. } | Self::Spawn(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Config(_) => StatusCode::BAD_REQUEST,
            Self::Db(_)
            | Self::Io(_)
            | Self::ProcessExit { .. }
            | Self::Reconciliation(_)
            | Self::Http(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(err = %self, kind = self.kind(), "request failed");
        }

        let mut body = json!({
            "error": self.to_string(),
            "kind": self.kind(),
        });
        match &self {
            Self::InvalidTransition {
                session_id,
                current,
                attempted,
            } => {
                body["sessionId"] = json!(session_id);
                body["current"] = json!(current);
                body["attempted"] = json!(attempted);
            }
            Self::AlreadyRunning {
                target_key,
                holding_session_id,
            } => {
                body["targetKey"] = json!(target_key);
                body["holdingSessionId"] = json!(holding_session_id);
            }
            Self::ResumeUnsupported { provider } => {
                body["provider"] = json!(provider);
            }
            _ => {}
        }

        (status, Json(body)).into_response()
    }
}
