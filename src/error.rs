use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Boundary validation failures: missing file, unsupported type,
    /// malformed request body. Surfaces as 400 before the pipeline runs.
    #[error("{0}")]
    InvalidInput(String),

    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Empty dataset: {0}")]
    EmptyDataset(String),

    #[error("Input too large: {0}")]
    InputTooLarge(String),

    #[error("AI service error: {message}")]
    AiService { message: String, retryable: bool },

    #[error("Chart synthesis error: {0}")]
    ChartSynthesis(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    pub fn ai_service(message: impl Into<String>, retryable: bool) -> Self {
        AppError::AiService {
            message: message.into(),
            retryable,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::AiService { retryable: true, .. })
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::MalformedInput(_)
            | AppError::EmptyDataset(_)
            | AppError::InputTooLarge(_)
            | AppError::AiService { .. }
            | AppError::ChartSynthesis(_)
            | AppError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.to_string()
        }));

        (status, body).into_response()
    }
}
