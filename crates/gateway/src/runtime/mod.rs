//! The per-turn streaming pipeline: cancellation, message translation,
//! tool tracking, and the runtime that sequences, persists, and publishes
//! render events.

pub mod cancel;
pub mod processor;
pub mod stream;
pub mod tool_handler;
pub mod types;

pub use stream::ChatStreamRuntime;
pub use types::ChatStreamRequest;
