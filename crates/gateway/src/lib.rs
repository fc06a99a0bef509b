//! Sidecar gateway: mediates chat sessions between HTTP clients and an
//! agent CLI running inside per-session sandboxes.
//!
//! One turn flows: HTTP → store (persist user + placeholder assistant) →
//! stream runtime (background task) → session registry (resolve or build a
//! live agent connection) → agent client → stream processor → store batches
//! + live bus → SSE subscribers.

pub mod api;
pub mod bus;
pub mod chat;
pub mod launch;
pub mod registry;
pub mod runtime;
pub mod state;
pub mod store;

#[cfg(test)]
pub mod testutil;
