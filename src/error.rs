//! Error types for the control plane

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the control plane
#[derive(Debug, Error)]
pub enum Error {
    #[error("Workspace not found: {0}")]
    WorkspaceNotFound(String),

    #[error("{0}")]
    WorkspaceExists(String),

    #[error("Image not found: {0}")]
    ImageNotFound(String),

    #[error("Runtime not found: {0}")]
    RuntimeNotFound(String),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Template file not found: {0}")]
    TemplateFileNotFound(String),

    #[error("Base template not found: {0}")]
    BaseTemplateNotFound(String),

    #[error("Subdomain(s) already in use: {0}")]
    PortMappingConflict(String),

    #[error("Cannot build template: {0}")]
    BadTemplate(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Container engine error: {0}")]
    Engine(#[from] bollard::errors::Error),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// Get the stable error code for the response body
    pub fn code(&self) -> &'static str {
        match self {
            Error::WorkspaceNotFound(_) => "WORKSPACE_NOT_FOUND",
            Error::WorkspaceExists(_) => "WORKSPACE_EXISTS",
            Error::ImageNotFound(_) => "IMAGE_NOT_FOUND",
            Error::RuntimeNotFound(_) => "RUNTIME_NOT_FOUND",
            Error::TemplateNotFound(_) => "TEMPLATE_NOT_FOUND",
            Error::TemplateFileNotFound(_) => "TEMPLATE_FILE_NOT_FOUND",
            Error::BaseTemplateNotFound(_) => "BASE_TEMPLATE_NOT_FOUND",
            Error::PortMappingConflict(_) => "PORT_MAPPING_CONFLICT",
            Error::BadTemplate(_) => "BAD_TEMPLATE",
            Error::BadRequest(_) => "BAD_REQUEST",
            Error::TransactionAborted(_) => "TRANSACTION_ABORTED",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Engine(_) => "ENGINE_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Get the HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::WorkspaceNotFound(_)
            | Error::ImageNotFound(_)
            | Error::RuntimeNotFound(_)
            | Error::TemplateNotFound(_)
            | Error::TemplateFileNotFound(_)
            | Error::BaseTemplateNotFound(_) => StatusCode::NOT_FOUND,

            Error::WorkspaceExists(_) | Error::PortMappingConflict(_) => StatusCode::CONFLICT,

            Error::BadRequest(_) | Error::BadTemplate(_) => StatusCode::BAD_REQUEST,

            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// API error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: &'static str,
    pub error: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            code: self.code(),
            error: self.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_kinds_map_to_404() {
        let errors = [
            Error::WorkspaceNotFound("w".into()),
            Error::ImageNotFound("sha256:abc".into()),
            Error::RuntimeNotFound("runsc".into()),
            Error::TemplateNotFound("t".into()),
            Error::TemplateFileNotFound("Dockerfile".into()),
            Error::BaseTemplateNotFound("fedora-41".into()),
        ];
        for err in errors {
            assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        }
    }

    #[test]
    fn conflict_kinds_map_to_409() {
        assert_eq!(
            Error::WorkspaceExists("taken".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            Error::PortMappingConflict("web".into()).status_code(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn bad_input_kinds_map_to_400() {
        assert_eq!(
            Error::BadRequest("bad json".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::BadTemplate("no Dockerfile".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn transient_kinds_map_to_500() {
        assert_eq!(
            Error::Internal("boom".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            Error::TransactionAborted("2 rows".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::WorkspaceNotFound("w".into()).code(), "WORKSPACE_NOT_FOUND");
        assert_eq!(Error::BadTemplate("x".into()).code(), "BAD_TEMPLATE");
    }
}
