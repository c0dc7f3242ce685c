//! HTTP API handlers

mod template;
mod workspace;

use axum::{
    extract::{Request, State},
    http::header,
    middleware::{self, Next},
    response::Response,
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::AppState;

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Workspace routes
        .route("/workspaces", get(workspace::list_workspaces))
        .route("/workspaces/{name}", post(workspace::update_or_create_workspace))
        .route("/workspaces/{name}", delete(workspace::delete_workspace))
        .route(
            "/workspaces/{name}/forwarded-ports/{subdomain}",
            delete(workspace::delete_port_mapping),
        )
        .route("/workspace-runtimes", get(workspace::list_runtimes))
        // Template routes
        .route("/templates", get(template::list_templates))
        .route("/templates/{name}", get(template::fetch_template))
        .route("/templates/{name}", post(template::create_or_update_template))
        .route("/templates/{name}", delete(template::delete_template))
        .route("/templates/{name}/{file_path}", get(template::fetch_template_file))
        .route("/templates/{name}/{file_path}", post(template::update_template_file))
        .route("/template-images", get(template::list_template_images))
        .route("/base-templates", get(template::list_base_templates));

    Router::new()
        .nest("/api", api_routes)
        .layer(middleware::from_fn_with_state(state.clone(), host_dispatch))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Divert requests under `*.{hostName}` to the reverse proxy; everything
/// else falls through to the API routes
async fn host_dispatch(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();

    if state.http_proxy.should_handle(host) {
        return state.http_proxy.handle(req).await;
    }

    next.run(req).await
}
