use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::application::conversion::ConversionError;
use crate::application::error::ErrorReport;

/// Wire shape of every error response.
#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: &'static str,
    details: Option<String>,
    report: ErrorReport,
    retry_after: Option<u64>,
}

impl ApiError {
    pub fn new(
        source: &'static str,
        status: StatusCode,
        message: &'static str,
        details: Option<String>,
    ) -> Self {
        let report = ErrorReport::from_message(
            source,
            status,
            details.clone().unwrap_or_else(|| message.to_string()),
        );
        Self {
            status,
            message,
            details,
            report,
            retry_after: None,
        }
    }

    pub fn rate_limited(retry_after: u64) -> Self {
        let mut error = Self::new(
            "infra::http::rate_limit",
            StatusCode::TOO_MANY_REQUESTS,
            "Rate limit exceeded",
            Some(format!("Retry after {retry_after} seconds")),
        );
        error.retry_after = Some(retry_after);
        error
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<ConversionError> for ApiError {
    fn from(error: ConversionError) -> Self {
        const SOURCE: &str = "infra::http::convert";

        let (status, message) = match &error {
            ConversionError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "Invalid request"),
            ConversionError::EngineUnavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Rendering engine unavailable",
            ),
            ConversionError::SessionOpenFailed(_) => {
                (StatusCode::BAD_GATEWAY, "Could not open a render session")
            }
            ConversionError::RenderFailed { .. } => (StatusCode::BAD_GATEWAY, "Rendering failed"),
            ConversionError::ShuttingDown => {
                (StatusCode::SERVICE_UNAVAILABLE, "Service is shutting down")
            }
        };

        let details = match &error {
            ConversionError::InvalidRequest(message)
            | ConversionError::EngineUnavailable(message)
            | ConversionError::SessionOpenFailed(message) => Some(message.clone()),
            ConversionError::RenderFailed { stage, cause } => Some(format!("{stage}: {cause}")),
            ConversionError::ShuttingDown => None,
        };

        Self {
            status,
            message,
            details,
            report: ErrorReport::from_error(SOURCE, status, &error),
            retry_after: None,
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        const SOURCE: &str = "infra::http::convert::body";

        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            return Self::new(
                SOURCE,
                StatusCode::PAYLOAD_TOO_LARGE,
                "Request body too large",
                Some(rejection.body_text()),
            );
        }

        Self::new(
            SOURCE,
            StatusCode::BAD_REQUEST,
            "Malformed JSON body",
            Some(rejection.body_text()),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            error: self.message.to_string(),
            details: self.details,
        };
        let mut response = (self.status, Json(body)).into_response();
        if let Some(retry_after) = self.retry_after {
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        self.report.attach(&mut response);
        response
    }
}
