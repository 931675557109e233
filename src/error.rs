use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Relay index out of range: {0}")]
    OutOfRange(usize),
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("Bus write failed: {0}")]
    BusWrite(String),
    #[error("Invalid value: {0}")]
    InvalidValue(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("GPIO error: {0}")]
    Gpio(String),
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::OutOfRange(_) => StatusCode::NOT_FOUND,
            AppError::InvalidValue(_) => StatusCode::BAD_REQUEST,
            AppError::BackendUnavailable(_)
            | AppError::BusWrite(_)
            | AppError::Config(_)
            | AppError::Gpio(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "error": self.to_string() }))
    }
}
