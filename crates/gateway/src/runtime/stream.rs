//! Stream runtime: drives one background turn end to end.
//!
//! Every render event gets the next per-session `seq`, feeds the rolling
//! snapshot, queues for batched persistence, and is published to the live
//! bus.  Persistence is the source of truth; publish failures are logged
//! and swallowed.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use sc_domain::config::Settings;
use sc_domain::render::{RenderEvent, StreamEnvelope};
use sc_domain::{Error, Result};

use crate::bus::{live_topic, LiveBus};
use crate::launch::{build_options, transport_factory};
use crate::registry::{ChatSession, SessionRegistry};
use crate::runtime::cancel::CancelEvent;
use crate::runtime::processor::StreamProcessor;
use crate::runtime::tool_handler::ToolHandlerRegistry;
use crate::runtime::types::{ChatStreamRequest, StreamContext, TerminalState};
use crate::store::{EventRow, MessageStore, StreamStatus};

/// Flush throttle: whichever trips first.
const SNAPSHOT_FLUSH_INTERVAL: Duration = Duration::from_millis(200);
const SNAPSHOT_FLUSH_EVENT_COUNT: usize = 24;

pub struct ChatStreamRuntime {
    settings: Arc<Settings>,
    store: Arc<dyn MessageStore>,
    bus: Arc<dyn LiveBus>,
    registry: Arc<SessionRegistry>,
    active_chats: Mutex<HashSet<String>>,
}

impl ChatStreamRuntime {
    pub fn new(
        settings: Arc<Settings>,
        store: Arc<dyn MessageStore>,
        bus: Arc<dyn LiveBus>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            settings,
            store,
            bus,
            registry,
            active_chats: Mutex::new(HashSet::new()),
        }
    }

    /// Spawn a detached task driving the full chat stream.
    pub fn start_background_chat(self: &Arc<Self>, request: ChatStreamRequest) -> JoinHandle<()> {
        let runtime = Arc::clone(self);
        self.active_chats.lock().insert(request.session_id.clone());
        tokio::spawn(async move {
            let session_id = request.session_id.clone();
            if let Err(e) = runtime.execute_chat(&request).await {
                tracing::error!(
                    session_id = %session_id,
                    error = %e,
                    "background chat task failed"
                );
            }
            runtime.active_chats.lock().remove(&session_id);
        })
    }

    pub fn is_chat_active(&self, session_id: &str) -> bool {
        self.active_chats.lock().contains(session_id)
    }

    /// Resolve a session through the registry, then run the stream.
    pub async fn execute_chat(&self, request: &ChatStreamRequest) -> Result<()> {
        let has_history = self.store.has_prior_assistant(&request.session_id).await?;
        let options = build_options(&self.settings, has_history);
        let factory = transport_factory(&self.settings, &request.sandbox_name, options.clone());

        let session = match self
            .registry
            .get_or_create(&request.session_id, &request.sandbox_name, options, factory)
            .await
        {
            Ok(session) => session,
            Err(e) => {
                self.emit_setup_failure(request, &e).await;
                return Err(e);
            }
        };

        session.cancel_event.clear();
        self.run(&session, request).await
    }

    /// The main streaming loop: send the prompt, consume responses, emit
    /// events, and always run the final flush.
    pub async fn run(&self, session: &ChatSession, request: &ChatStreamRequest) -> Result<()> {
        let _turn = session.turn_lock.lock().await;

        let mut ctx = StreamContext::new(
            request.session_id.clone(),
            request.assistant_message_id,
            session.cancel_event.clone(),
        );
        ctx.seq = self.store.get_next_seq(&request.session_id).await?;

        // A cancel issued before this turn had a session aborts it now.
        if self.registry.consume_pending_cancel(&request.session_id) {
            tracing::info!(session_id = %request.session_id, "absorbing pre-turn cancel");
            self.emit_event(&mut ctx, RenderEvent::Cancelled).await;
            self.flush_snapshot(&mut ctx, true).await;
            return Ok(());
        }

        let mut processor = StreamProcessor::new(ToolHandlerRegistry::new());

        if let Err(e) = session.client.query(&request.prompt).await {
            tracing::error!(session_id = %request.session_id, error = %e, "prompt send failed");
            self.emit_error(&mut ctx, &e).await;
            self.flush_snapshot(&mut ctx, true).await;
            return Err(e);
        }

        let stream = session.client.receive_response();
        tokio::pin!(stream);

        loop {
            tokio::select! {
                biased;

                _ = ctx.cancel.wait() => {
                    tracing::info!(session_id = %request.session_id, "stream cancelled");
                    self.emit_event(&mut ctx, RenderEvent::Cancelled).await;
                    break;
                }

                next = stream.next() => match next {
                    Some(Ok(message)) => {
                        if ctx.cancel.is_set() {
                            tracing::info!(session_id = %request.session_id, "stream cancelled");
                            self.emit_event(&mut ctx, RenderEvent::Cancelled).await;
                            break;
                        }
                        for event in processor.process_message(message) {
                            self.emit_event(&mut ctx, event).await;
                        }
                        ctx.total_cost_usd = processor.total_cost_usd;
                    }
                    Some(Err(e)) => {
                        tracing::error!(
                            session_id = %request.session_id,
                            error = %e,
                            "error during streaming"
                        );
                        self.emit_error(&mut ctx, &e).await;
                        break;
                    }
                    None => {
                        if !ctx.cancel.is_set() {
                            ctx.total_cost_usd = processor.total_cost_usd;
                            self.emit_event(&mut ctx, RenderEvent::Complete {
                                total_cost_usd: processor.total_cost_usd,
                                usage: processor.usage.clone(),
                            }).await;
                        }
                        break;
                    }
                }
            }
        }

        self.flush_snapshot(&mut ctx, true).await;
        Ok(())
    }

    /// Surface a session-construction failure as a terminal `error`
    /// envelope so subscribers never infer failure from silence.
    async fn emit_setup_failure(&self, request: &ChatStreamRequest, error: &Error) {
        let mut ctx = StreamContext::new(
            request.session_id.clone(),
            request.assistant_message_id,
            CancelEvent::new(),
        );
        match self.store.get_next_seq(&request.session_id).await {
            Ok(seq) => ctx.seq = seq,
            Err(e) => {
                tracing::error!(
                    session_id = %request.session_id,
                    error = %e,
                    "cannot assign seq for setup failure"
                );
                return;
            }
        }
        self.emit_error(&mut ctx, error).await;
        self.flush_snapshot(&mut ctx, true).await;
    }

    async fn emit_error(&self, ctx: &mut StreamContext, error: &Error) {
        self.emit_event(
            ctx,
            RenderEvent::Error {
                message: error.to_string(),
                error_type: error.kind_name().to_string(),
            },
        )
        .await;
    }

    /// Assign a seq, accumulate, queue for persistence, publish live, and
    /// flush when throttles trip.
    async fn emit_event(&self, ctx: &mut StreamContext, event: RenderEvent) {
        match &event {
            RenderEvent::Complete { .. } => ctx.terminal = Some(TerminalState::Completed),
            RenderEvent::Cancelled => ctx.terminal = Some(TerminalState::Cancelled),
            RenderEvent::Error { .. } => ctx.terminal = Some(TerminalState::Failed),
            _ => {}
        }

        let (kind, payload) = event.into_parts();
        let seq = ctx.seq;
        ctx.seq += 1;

        ctx.snapshot.add_event(kind, &payload);
        ctx.pending_events.push(EventRow {
            session_id: ctx.session_id.clone(),
            message_id: ctx.message_id,
            stream_id: ctx.stream_id,
            seq,
            event_type: kind.to_string(),
            render_payload: payload.clone(),
        });

        let envelope =
            StreamEnvelope::build(&ctx.session_id, ctx.message_id, ctx.stream_id, seq, kind, payload);
        match serde_json::to_string(&envelope) {
            Ok(json) => {
                if let Err(e) = self.bus.publish(&live_topic(&ctx.session_id), json).await {
                    tracing::warn!(error = %e, "failed to publish event to live bus");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize envelope"),
        }

        ctx.events_since_flush += 1;
        if ctx.events_since_flush >= SNAPSHOT_FLUSH_EVENT_COUNT
            || ctx.last_flush_at.elapsed() >= SNAPSHOT_FLUSH_INTERVAL
        {
            self.flush_snapshot(ctx, false).await;
        }
    }

    /// Persist pending events (batch, then per-row on failure, then drop)
    /// and update the message snapshot.  The final flush stamps the
    /// terminal stream status.
    async fn flush_snapshot(&self, ctx: &mut StreamContext, force: bool) {
        if ctx.pending_events.is_empty() && !force {
            return;
        }

        if !ctx.pending_events.is_empty() {
            let rows = std::mem::take(&mut ctx.pending_events);
            if let Err(e) = self.store.append_events_batch(&rows).await {
                tracing::error!(error = %e, "failed to batch insert events");
                for row in &rows {
                    if let Err(row_err) = self.store.append_event(row).await {
                        // The live bus already delivered this event; the
                        // persisted history keeps a hole.
                        tracing::error!(
                            seq = row.seq,
                            error = %row_err,
                            "dropping event after per-row insert failure"
                        );
                    }
                }
            }
        }

        let status = if force {
            match ctx.terminal {
                Some(TerminalState::Completed) => StreamStatus::Completed,
                Some(TerminalState::Cancelled) => StreamStatus::Interrupted,
                Some(TerminalState::Failed) => {
                    if ctx.cancel.is_set() {
                        StreamStatus::Interrupted
                    } else {
                        StreamStatus::Failed
                    }
                }
                None => {
                    if ctx.cancel.is_set() {
                        StreamStatus::Interrupted
                    } else {
                        StreamStatus::Completed
                    }
                }
            }
        } else {
            StreamStatus::InProgress
        };

        let last_seq = if ctx.seq > 0 { ctx.seq - 1 } else { 0 };
        if let Err(e) = self
            .store
            .update_message_snapshot(
                ctx.message_id,
                &ctx.snapshot.content_text(),
                &ctx.snapshot.to_render(),
                last_seq,
                status,
                ctx.total_cost_usd,
            )
            .await
        {
            tracing::error!(error = %e, "failed to update message snapshot");
        }

        ctx.last_flush_at = std::time::Instant::now();
        ctx.events_since_flush = 0;
    }
}
