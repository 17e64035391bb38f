use axum::{
    Extension, Json,
    extract::{State, rejection::JsonRejection},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use time::format_description::well_known::Rfc3339;

use crate::application::engine::EngineStatus;
use crate::domain::document::{ConversionRequest, PdfDocument};

use super::HttpState;
use super::error::ApiError;
use super::middleware::RequestContext;

const PDF_DISPOSITION: &str = "inline; filename=\"document.pdf\"";

pub(super) async fn convert(
    State(state): State<HttpState>,
    Extension(ctx): Extension<RequestContext>,
    payload: Result<Json<ConversionRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return ApiError::from(rejection).into_response(),
    };

    match state
        .conversions
        .convert(request, Some(ctx.request_id.as_str()))
        .await
    {
        Ok(pdf) => pdf_response(pdf),
        Err(err) => ApiError::from(err).into_response(),
    }
}

fn pdf_response(pdf: PdfDocument) -> Response {
    let mut response = (StatusCode::OK, pdf.into_bytes()).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/pdf"),
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_static(PDF_DISPOSITION),
    );
    response
}

#[derive(Debug, Serialize)]
pub struct HealthBody {
    pub status: &'static str,
    pub engine: EngineHealth,
}

#[derive(Debug, Serialize)]
pub struct EngineHealth {
    pub state: &'static str,
    pub ready: bool,
    pub generation: Option<u64>,
    pub launched_at: Option<String>,
    pub launches: u64,
    pub restarts: u64,
}

impl From<&EngineStatus> for EngineHealth {
    fn from(status: &EngineStatus) -> Self {
        Self {
            state: status.state.as_str(),
            ready: status.is_ready(),
            generation: status.generation.map(|id| id.get()),
            launched_at: status
                .launched_at
                .and_then(|at| at.format(&Rfc3339).ok()),
            launches: status.launches,
            restarts: status.restarts,
        }
    }
}

/// Always 200: the engine starts lazily, so an absent engine is not a fault.
pub(super) async fn health(State(state): State<HttpState>) -> Json<HealthBody> {
    let status = state.conversions.supervisor().status();
    let accepting = state.conversions.lifecycle().is_accepting();

    Json(HealthBody {
        status: if accepting { "ok" } else { "degraded" },
        engine: EngineHealth::from(&status),
    })
}
