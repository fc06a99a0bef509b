//! Shared types for the sidecar: configuration, errors, the agent wire
//! protocol, and the render-event schema exposed to subscribers.

pub mod config;
pub mod error;
pub mod message;
pub mod options;
pub mod render;

pub use error::{Error, Result};
