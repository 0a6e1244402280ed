// JSON response envelopes for the HTTP API

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use super::errors::SylvaError;

/// `{success: true, data}` body
#[derive(Debug, Serialize)]
pub struct SuccessBody<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

/// `{success: false, code, message, string_code}` body
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub success: bool,
    pub code: u16,
    pub message: String,
    pub string_code: &'static str,
}

/// Build a success response with the given status code
pub fn success<T: Serialize>(status: StatusCode, data: T) -> Response {
    (
        status,
        Json(SuccessBody {
            success: true,
            data: Some(data),
        }),
    )
        .into_response()
}

/// Success response without a payload
pub fn empty(status: StatusCode) -> Response {
    if status == StatusCode::NO_CONTENT {
        return status.into_response();
    }
    (
        status,
        Json(SuccessBody::<()> {
            success: true,
            data: None,
        }),
    )
        .into_response()
}

impl From<&SylvaError> for ErrorBody {
    fn from(err: &SylvaError) -> Self {
        ErrorBody {
            success: false,
            code: err.status_code(),
            message: err.to_string(),
            string_code: err.string_code(),
        }
    }
}

impl IntoResponse for SylvaError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            tracing::error!(
                error = %self,
                suggestion = self.suggestion().unwrap_or(""),
                "request failed"
            );
        }

        (status, Json(ErrorBody::from(&self))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body_shape() {
        let err = SylvaError::BadRequest {
            message: "At least 1 step is necessary.".to_string(),
            string_code: "no_step",
        };
        let body = serde_json::to_value(ErrorBody::from(&err)).unwrap();

        assert_eq!(
            body,
            serde_json::json!({
                "success": false,
                "code": 400,
                "message": "At least 1 step is necessary.",
                "string_code": "no_step",
            })
        );
    }

    #[test]
    fn test_error_into_response_status() {
        let response = SylvaError::not_found("Scenario").into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
