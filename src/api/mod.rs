//! API layer -- axum routes, live streams, artifact files, static UI.

mod error;
mod routes;
pub mod state;

use self::state::AppState;
use axum::extract::State;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

pub use self::error::ApiError;

const UI_MISSING: &str = "UI not found. Put an index.html in /qa-ui.";

/// Build the application router with all API routes.
pub fn router(state: AppState) -> Router {
    let artifacts = ServeDir::new(&state.artifacts_root);
    let ui = ServeDir::new(&state.ui_dir);

    Router::new()
        .route("/", get(index))
        .nest("/api/v1", routes::api_routes())
        .nest_service("/artifacts", artifacts)
        .nest_service("/qa-ui", ui)
        .fallback(fallback)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// The UI's `index.html`, or a plain-text hint when it is missing.
async fn index(State(state): State<AppState>) -> Response {
    let page = state.ui_dir.join("index.html");
    match tokio::fs::read_to_string(&page).await {
        Ok(html) => Html(html).into_response(),
        Err(e) => {
            tracing::debug!(path = %page.display(), error = %e, "UI index not available");
            UI_MISSING.into_response()
        }
    }
}

async fn fallback() -> (axum::http::StatusCode, &'static str) {
    (axum::http::StatusCode::NOT_FOUND, "not found")
}
