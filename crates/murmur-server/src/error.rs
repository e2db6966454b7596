use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use murmur_store::StoreError;

use crate::identity::AuthError;

/// Failure of a socket request. The display string is what the requester
/// sees in `meta.error`.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Message rejected")]
    StaleWrite,

    #[error("{0}")]
    MalformedRequest(String),

    #[error("Unknown request type: '{0}'")]
    UnknownType(String),

    #[error("{0}")]
    Internal(String),
}

impl HubError {
    pub fn missing_field(name: &str) -> Self {
        HubError::MalformedRequest(format!("Missing or invalid field: data.{name}"))
    }
}

impl From<StoreError> for HubError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => HubError::NotFound(format!("Not found: {what}")),
            StoreError::Conflict(what) => HubError::Conflict(what),
            StoreError::StaleWrite { .. } => HubError::StaleWrite,
            StoreError::InvalidKey(what) => HubError::MalformedRequest(format!("Invalid {what}")),
            other => HubError::Internal(other.to_string()),
        }
    }
}

/// Failure of a REST request.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Unauthorized(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Store(StoreError::Conflict(_)) => StatusCode::CONFLICT,
            ApiError::Store(StoreError::StaleWrite { .. }) => StatusCode::PRECONDITION_FAILED,
            ApiError::Store(StoreError::InvalidKey(_)) | ApiError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Store(e) => ApiError::Store(e),
            AuthError::UnknownDevice(device) => {
                ApiError::Forbidden(format!("unknown device {device}"))
            }
            other => ApiError::Unauthorized(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, %status, "request rejected");
        }
        (status, Json(json!({"error": {"message": self.to_string()}}))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_write_reads_message_rejected() {
        let err = HubError::from(StoreError::StaleWrite {
            expected: 2,
            actual: Some(1),
        });
        assert_eq!(err.to_string(), "Message rejected");
    }

    #[test]
    fn store_errors_map_to_hub_errors() {
        assert!(matches!(
            HubError::from(StoreError::NotFound("x".into())),
            HubError::NotFound(_)
        ));
        assert!(matches!(
            HubError::from(StoreError::Io("disk".into())),
            HubError::Internal(_)
        ));
        assert_eq!(
            HubError::UnknownType("bogus".into()).to_string(),
            "Unknown request type: 'bogus'"
        );
        assert_eq!(
            HubError::missing_field("count").to_string(),
            "Missing or invalid field: data.count"
        );
    }

    #[test]
    fn api_status_codes() {
        let cases = [
            (ApiError::Store(StoreError::NotFound("x".into())), 404),
            (ApiError::Store(StoreError::Conflict("x".into())), 409),
            (
                ApiError::Store(StoreError::StaleWrite {
                    expected: 1,
                    actual: None,
                }),
                412,
            ),
            (ApiError::Store(StoreError::InvalidKey("x".into())), 400),
            (ApiError::Store(StoreError::Io("x".into())), 500),
            (ApiError::BadRequest("x".into()), 400),
            (ApiError::Forbidden("x".into()), 403),
        ];
        for (err, code) in cases {
            assert_eq!(err.status().as_u16(), code, "{err:?}");
        }
    }

    #[test]
    fn unknown_device_is_forbidden() {
        let err = ApiError::from(AuthError::UnknownDevice("d".into()));
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        let err = ApiError::from(AuthError::Missing("h".into()));
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
    }
}
