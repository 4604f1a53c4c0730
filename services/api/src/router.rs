//! Axum Router Configuration
//!
//! The complete HTTP routing for the service: the read-only REST surface,
//! the WebSocket endpoint, and the OpenAPI documentation.

use crate::{
    handlers,
    models::{ErrorResponse, Message, MessageRole, Session},
    state::AppState,
    ws::ws_handler,
};

use axum::{Router, routing::get};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::list_sessions,
        handlers::get_session,
        handlers::get_session_messages,
    ),
    components(
        schemas(Session, Message, MessageRole, ErrorResponse)
    ),
    tags(
        (name = "Tandem API", description = "Session history for the Tandem language tutor")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let api_router = Router::new()
        .route("/sessions", get(handlers::list_sessions))
        .route("/sessions/{id}", get(handlers::get_session))
        .route(
            "/sessions/{id}/messages",
            get(handlers::get_session_messages),
        )
        .route("/ws", get(ws_handler))
        .with_state(app_state);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}
