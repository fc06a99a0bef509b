//! Client for an agent CLI running behind a sandbox transport.
//!
//! The protocol is newline-delimited JSON in both directions: prompts and
//! control requests go down stdin, [`AgentMessage`]s come back on stdout.

mod client;

pub use client::AgentClient;
