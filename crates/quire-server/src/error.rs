use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use quire_engine::EngineError;
use quire_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    error: String,
}

impl ServerError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) | Self::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Store(StoreError::Conflict(_)) => StatusCode::CONFLICT,
            Self::Engine(EngineError::AlreadyRegistered(_) | EngineError::AlreadyStarted(_)) => StatusCode::CONFLICT,
            Self::Store(_) | Self::Engine(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self.status_code() {
            StatusCode::BAD_REQUEST => "invalid_argument",
            StatusCode::NOT_FOUND => "not_found",
            StatusCode::CONFLICT => "conflict",
            _ => "internal",
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = ErrorBody {
            code: self.code(),
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quire_core::TurnId;

    #[test]
    fn status_codes() {
        assert_eq!(ServerError::BadRequest("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ServerError::Store(StoreError::NotFound("turn t".into())).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ServerError::Engine(EngineError::AlreadyRegistered(TurnId::new())).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ServerError::Store(StoreError::Database("locked".into())).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
