use crate::generator::GenerateError;
use crate::resilience::RetryError;
use axum::extract::rejection::JsonRejection;
use axum::extract::FromRequest;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("rate limit exceeded, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("generation job {job_id} failed after {attempts} attempts: {cause}")]
    JobFailed {
        job_id: String,
        attempts: u32,
        cause: RetryError<GenerateError>,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Short machine-readable tag for the error body.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation",
            AppError::RateLimited { .. } => "rate_limited",
            // A failed job is tagged by what finally stopped it
            AppError::JobFailed { cause, .. } => match cause {
                RetryError::CircuitOpen { .. } => "circuit_open",
                RetryError::Timeout { .. } => "timeout",
                RetryError::Exhausted { last_error, .. } => match last_error {
                    GenerateError::InvalidFormat(_) => "invalid_format",
                    GenerateError::Transport(_) => "transport",
                    GenerateError::Upstream { .. } => "upstream",
                },
            },
            AppError::NotFound(_) => "not_found",
            AppError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::JobFailed { cause, .. } => match cause {
                RetryError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
                RetryError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                RetryError::Exhausted { .. } => StatusCode::BAD_GATEWAY,
            },
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "internal error");
                "internal server error".to_string()
            }
            // Upstream text is passed through verbatim
            AppError::JobFailed {
                cause:
                    RetryError::Exhausted {
                        last_error: GenerateError::Upstream { message, .. },
                        ..
                    },
                ..
            } => message.clone(),
            other => other.to_string(),
        };

        let body = json!({ "error": message, "kind": self.kind() });
        let mut response = (status, axum::Json(body)).into_response();
        if let AppError::RateLimited { retry_after_secs } = self {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
        }
        response
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// JSON extractor that logs deserialization errors before returning them.
/// Drop-in replacement for `axum::Json<T>`.
pub struct LoggedJson<T>(pub T);

impl<S, T> FromRequest<S> for LoggedJson<T>
where
    axum::Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(
        req: axum::extract::Request,
        state: &S,
    ) -> Result<Self, Self::Rejection> {
        let path = req.uri().path().to_string();
        match axum::Json::<T>::from_request(req, state).await {
            Ok(axum::Json(value)) => Ok(LoggedJson(value)),
            Err(rejection) => {
                tracing::warn!(
                    path = %path,
                    status = 422,
                    error = %rejection,
                    "JSON parse error (client sent malformed payload)"
                );
                Err(AppError::Validation(rejection.body_text()))
            }
        }
    }
}
