use std::error::Error as StdError;

use axum::{http::StatusCode, response::Response};
use thiserror::Error;

use crate::{application::conversion::ConversionError, infra::error::InfraError};

/// Diagnostic chain attached to error responses so the response logger can
/// report the cause without it leaking into the body.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = vec![error.to_string()];
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn from_message(
        source: &'static str,
        status: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source,
            status,
            messages: vec![message.into()],
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

/// Failures that abort the binary.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Conversion(#[from] ConversionError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::conversion::RenderStage;

    #[test]
    fn report_collects_the_source_chain() {
        let error = AppError::from(InfraError::from(std::io::Error::other("disk gone")));
        let report = ErrorReport::from_error("test", StatusCode::INTERNAL_SERVER_ERROR, &error);

        assert_eq!(report.messages[0], "io error: disk gone");
        assert!(report.messages.iter().any(|m| m == "disk gone"));
    }

    #[test]
    fn conversion_errors_pass_through_transparently() {
        let error = AppError::from(RenderStage::PrintPdf.failed("boom"));
        assert_eq!(error.to_string(), "render failed during print_pdf: boom");
    }
}
