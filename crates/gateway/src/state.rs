use std::sync::Arc;

use sc_domain::config::Settings;

use crate::chat::ChatService;

/// Shared application state passed to all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub chat: Arc<ChatService>,
}
