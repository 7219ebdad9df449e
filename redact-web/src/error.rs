use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use redact_core::{RedactError, StoreError, TemplateError};
use serde_json::json;

/// Erro dos handlers HTTP, sempre respondido como JSON `{error, code}`.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Core(#[from] RedactError),

    #[error("{0} não encontrado")]
    NotFound(String),

    #[error("requisição inválida: {0}")]
    BadRequest(String),

    #[error("erro interno: {0}")]
    Internal(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl From<TemplateError> for AppError {
    fn from(e: TemplateError) -> Self {
        AppError::Core(e.into())
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        AppError::Core(e.into())
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(e: tokio::task::JoinError) -> Self {
        AppError::Internal(e.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            AppError::Core(core) => classify_core_error(core),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "falha no handler");
        }
        let body = json!({
            "error": self.to_string(),
            "code": code,
        });
        (status, axum::Json(body)).into_response()
    }
}

fn classify_core_error(err: &RedactError) -> (StatusCode, &'static str) {
    match err {
        RedactError::EntityNotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        RedactError::NoDetectors => (StatusCode::SERVICE_UNAVAILABLE, "NO_DETECTORS"),
        RedactError::Template(t) => match t {
            TemplateError::NotFound(_) | TemplateError::RegionNotFound(_) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND")
            }
            TemplateError::Expired(_) => (StatusCode::GONE, "TEMPLATE_EXPIRED"),
            TemplateError::LayoutMismatch { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, "LAYOUT_MISMATCH")
            }
            TemplateError::NoRegions | TemplateError::MalformedRegion { .. } => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR")
            }
            TemplateError::Persistence(_) | TemplateError::Poisoned => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
            }
        },
        RedactError::Geometry(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
        RedactError::Store(StoreError::ClassificationConflict { .. }) => {
            (StatusCode::CONFLICT, "CONFLICT")
        }
        RedactError::Detector(_) => (StatusCode::BAD_GATEWAY, "DETECTOR_ERROR"),
        RedactError::Store(_) | RedactError::Config(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
        }
    }
}
