use axum::http::{header, Method};
use tower_http::cors::{Any, CorsLayer};

/// The dashboard is served from a different origin and authenticates with a bearer token.
pub fn dashboard_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_origin(Any)
}
