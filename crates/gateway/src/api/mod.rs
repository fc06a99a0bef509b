pub mod chat;

use axum::routing::get;
use axum::Router;

use crate::state::AppState;

/// Build the HTTP surface: health probe, turn initiation, and the
/// replay+live SSE subscription.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(chat::health))
        .route("/chat", axum::routing::post(chat::post_chat))
        .route(
            "/stream/:session_id",
            get(chat::get_stream).delete(chat::delete_stream),
        )
}
