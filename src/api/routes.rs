//! API route definitions.

use axum::http::{HeaderValue, Method, header};
use axum::{
    Router,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::handlers::{chat, misc, sessions};
use super::state::AppState;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let cors = build_cors_layer(&state);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let api_routes = Router::new()
        .route(
            "/sessions",
            post(sessions::create_session).get(sessions::list_sessions),
        )
        .route(
            "/sessions/{session_id}",
            get(sessions::get_session).delete(sessions::delete_session),
        )
        .route(
            "/sessions/{session_id}/resume",
            post(sessions::resume_session),
        )
        .route("/chat", post(chat::chat))
        .route("/chat/stream", post(chat::chat_stream))
        .with_state(state.clone());

    Router::new()
        .route("/", get(misc::root))
        .route("/health", get(misc::health))
        .with_state(state)
        .nest("/api/v1", api_routes)
        .layer(cors)
        .layer(trace_layer)
}

/// Build the CORS layer from the configured origins. With no origins
/// configured, cross-origin requests are denied.
fn build_cors_layer(state: &AppState) -> CorsLayer {
    let configured = &state.sessions.config().api.cors_origins;

    let methods = [Method::GET, Method::POST, Method::DELETE, Method::OPTIONS];
    let headers = [header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT];

    let origins: Vec<HeaderValue> = configured
        .iter()
        .filter_map(|origin| {
            origin.parse::<HeaderValue>().ok().or_else(|| {
                tracing::warn!("CORS: invalid origin in config: {}", origin);
                None
            })
        })
        .collect();

    if origins.is_empty() {
        if !configured.is_empty() {
            tracing::error!("CORS: all configured origins are invalid");
        }
        CorsLayer::new()
    } else {
        tracing::info!("CORS: allowing {} origin(s)", origins.len());
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(methods)
            .allow_headers(headers)
    }
}
