use axum::{middleware::from_fn_with_state, response::Json, routing::get, Router};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::middleware::bearer_auth_middleware;
use crate::AppState;

pub mod groups;
pub mod tasks;

/// Full API: bearer-authenticated chat-subscription routes plus the public
/// health check. CORS is layered on by the binary.
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .nest("/chat-subscriptions/groups", groups::router())
        .nest("/chat-subscriptions/tasks", tasks::router())
        .layer(from_fn_with_state(state.clone(), bearer_auth_middleware));

    Router::new()
        .route("/api/health", get(health_check))
        .merge(protected)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": env!("CARGO_PKG_NAME"),
        "timestamp": chrono::Utc::now(),
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "groups": "/chat-subscriptions/groups",
            "tasks": "/chat-subscriptions/tasks",
            "health": "/api/health"
        }
    }))
}
