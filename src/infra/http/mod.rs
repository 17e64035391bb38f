//! HTTP surface: `POST /convert` and `GET /health`.

mod error;
mod handlers;
mod middleware;
mod rate_limit;

use std::sync::Arc;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{HeaderName, HeaderValue, Method, header},
    middleware::from_fn,
    middleware::from_fn_with_state,
    routing::{get, post},
};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::warn;

use crate::application::conversion::ConversionService;
use crate::config::CorsSettings;

pub use error::{ApiError, ApiErrorBody};
pub use handlers::{EngineHealth, HealthBody};
pub use middleware::{REQUEST_ID_HEADER, RequestContext};
pub use rate_limit::{Admission, ClientId, ClientRateLimiter};

#[derive(Clone)]
pub struct HttpState {
    pub conversions: ConversionService,
    pub rate_limiter: Arc<ClientRateLimiter>,
}

/// Router-level knobs taken from settings.
#[derive(Debug, Clone)]
pub struct RouterOptions {
    pub max_request_bytes: usize,
    pub cors: CorsSettings,
}

pub fn build_router(state: HttpState, options: &RouterOptions) -> Router {
    let convert_routes = Router::new()
        .route("/convert", post(handlers::convert))
        .layer(DefaultBodyLimit::max(options.max_request_bytes))
        .route_layer(from_fn_with_state(state.clone(), middleware::rate_limit));

    let router = Router::new()
        .route("/health", get(handlers::health))
        .merge(convert_routes)
        .with_state(state)
        .layer(from_fn(middleware::security_headers))
        .layer(from_fn(middleware::log_responses))
        .layer(from_fn(middleware::set_request_context));

    match cors_layer(&options.cors) {
        Some(cors) => router.layer(cors),
        None => router,
    }
}

fn cors_layer(cors: &CorsSettings) -> Option<CorsLayer> {
    if cors.allowed_origins.is_empty() {
        return None;
    }

    let request_id = HeaderName::from_static(REQUEST_ID_HEADER);
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, request_id.clone()])
        .expose_headers([header::CONTENT_DISPOSITION, request_id]);

    if cors.allows_any() {
        return Some(layer.allow_origin(Any));
    }

    let origins = cors
        .allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(
                    target = "folio::http::cors",
                    origin = origin.as_str(),
                    "ignoring unparseable CORS origin"
                );
                None
            }
        })
        .collect::<Vec<_>>();

    Some(layer.allow_origin(AllowOrigin::list(origins)))
}
