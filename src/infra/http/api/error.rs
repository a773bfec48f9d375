use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::application::error::ErrorReport;
use crate::application::registry::RegistryError;

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorMessage,
}

pub mod codes {
    pub const BAD_REQUEST: &str = "bad_request";
    pub const UNKNOWN_QUERY: &str = "unknown_query";
    pub const PARAMETER_MISMATCH: &str = "parameter_mismatch";
    pub const REGISTRY: &str = "registry_error";
}

#[derive(Debug, Serialize)]
pub struct ApiErrorMessage {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: &'static str,
    hint: Option<String>,
}

impl ApiError {
    pub fn new(
        status: StatusCode,
        code: &'static str,
        message: &'static str,
        hint: Option<String>,
    ) -> Self {
        Self {
            status,
            code,
            message,
            hint,
        }
    }

    pub fn bad_request(message: &'static str, hint: Option<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, codes::BAD_REQUEST, message, hint)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        let hint = Some(err.to_string());
        match err {
            RegistryError::UnknownQuery { .. } => Self::new(
                StatusCode::NOT_FOUND,
                codes::UNKNOWN_QUERY,
                "Query is not registered",
                hint,
            ),
            RegistryError::ParameterMismatch { .. } => Self::new(
                StatusCode::BAD_REQUEST,
                codes::PARAMETER_MISMATCH,
                "Query parameters do not match its definition",
                hint,
            ),
            RegistryError::Duplicate { .. } | RegistryError::InvalidDefinition(_) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                codes::REGISTRY,
                "Query registry misconfigured",
                hint,
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let detail = format!(
            "{}: {}",
            self.code,
            self.hint.as_deref().unwrap_or(self.message)
        );
        let body = ApiErrorBody {
            error: ApiErrorMessage {
                code: self.code.to_string(),
                message: self.message.to_string(),
                hint: self.hint,
            },
        };
        let mut response = (self.status, Json(body)).into_response();
        ErrorReport::from_message("infra::http::api", self.status, detail).attach(&mut response);
        response
    }
}
