use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::api::transport::{ResponseStream, TransportClient};
use crate::api::{Attachment, ChatError, ChatRequest, ChatResult, Mode, Source, StreamEvent};
use crate::pending::{PendingRegistry, PendingRequest};
use crate::session::SessionStore;

/// What the UI is told about a streaming turn, in arrival order. Exactly one
/// of `Done`, `Error` or `Cancelled` ends a turn.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChatEvent {
    Metadata {
        sources: Vec<Source>,
        used_rag: bool,
        used_web_search: bool,
    },
    Chunk {
        delta: String,
        full: String,
    },
    Done {
        response_time: f64,
        full: String,
    },
    Error {
        message: String,
    },
    Cancelled {
        partial: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    Cancelled,
    Failed,
    /// A newer turn took over; nothing was reported for this one after that.
    Superseded,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub message: String,
    pub mode: Mode,
    pub conversation_id: Option<String>,
    pub attachments: Vec<Attachment>,
}

impl Turn {
    pub fn new(message: impl Into<String>, mode: Mode) -> Self {
        Self {
            message: message.into(),
            mode,
            conversation_id: None,
            attachments: Vec::new(),
        }
    }

    pub fn in_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }
}

#[derive(Default)]
struct ChatState {
    loading: bool,
    error: Option<String>,
    last_turn: Option<Turn>,
}

/// Runs chat turns one at a time: a new turn preempts the one in flight.
pub struct ChatController {
    transport: TransportClient,
    sessions: Arc<SessionStore>,
    registry: Arc<PendingRegistry>,
    state: Mutex<ChatState>,
}

impl ChatController {
    pub fn new(
        transport: TransportClient,
        sessions: Arc<SessionStore>,
        registry: Arc<PendingRegistry>,
    ) -> Self {
        Self {
            transport,
            sessions,
            registry,
            state: Mutex::new(ChatState::default()),
        }
    }

    pub fn is_loading(&self) -> bool {
        self.state.lock().loading
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.lock().error.clone()
    }

    pub fn session_id(&self) -> String {
        self.sessions.get_or_create()
    }

    /// Correlation id of the turn in flight, if any.
    pub fn pending_id(&self) -> Option<String> {
        self.registry.current_id()
    }

    /// Stream one turn, reporting progress through `on_event`.
    pub async fn send(
        &self,
        turn: Turn,
        mut on_event: impl FnMut(ChatEvent) + Send,
    ) -> TurnOutcome {
        let (pending, request) = self.begin(turn);
        tracing::info!(
            correlation_id = %pending.correlation_id,
            mode = request.mode.as_str(),
            conversation_id = ?request.conversation_id,
            attachments = request.attachments.len(),
            "Sending chat turn"
        );

        let mut full = String::new();
        let result = match self.transport.open(&request, &pending).await {
            Ok(mut stream) => pump(&mut stream, &pending, &mut full, &mut on_event).await,
            Err(e) => Err(e),
        };
        self.finish(&pending, result, full, &mut on_event)
    }

    /// Non-streaming turn under the same one-at-a-time rule.
    pub async fn send_once(&self, turn: Turn) -> Result<ChatResult, ChatError> {
        let (pending, request) = self.begin(turn);
        tracing::info!(
            correlation_id = %pending.correlation_id,
            mode = request.mode.as_str(),
            "Sending chat turn (non-streaming)"
        );

        let result = self.transport.send_once(&request, &pending).await;
        let current = self.registry.end(&pending.correlation_id);
        if pending.is_superseded() || pending.is_cancelled() {
            return Err(ChatError::Cancelled);
        }
        if current {
            let mut state = self.state.lock();
            state.loading = false;
            if let Err(e) = &result {
                if !e.is_cancelled() {
                    tracing::error!(correlation_id = %pending.correlation_id, error = %e, "Chat turn failed");
                    state.error = Some(e.to_string());
                }
            }
        }
        result
    }

    /// Re-send the last turn unchanged. `None` if nothing was sent yet.
    pub async fn retry(&self, on_event: impl FnMut(ChatEvent) + Send) -> Option<TurnOutcome> {
        let turn = self.state.lock().last_turn.clone()?;
        Some(self.send(turn, on_event).await)
    }

    /// Abort the turn in flight and tell the server to drop it. Returns
    /// immediately; the server notification runs in the background.
    pub fn cancel(&self) {
        let Some(correlation_id) = self.registry.cancel_current() else {
            return;
        };
        self.state.lock().loading = false;
        tracing::info!(correlation_id = %correlation_id, "Cancelled chat turn");
        self.notify_remote(correlation_id);
    }

    /// New anonymous session id. Does not touch a turn in flight.
    pub fn reset_session(&self) -> String {
        self.sessions.reset()
    }

    fn begin(&self, turn: Turn) -> (PendingRequest, ChatRequest) {
        let (pending, superseded) = self.registry.begin();
        if let Some(previous) = superseded {
            self.notify_remote(previous);
        }
        {
            let mut state = self.state.lock();
            state.loading = true;
            state.error = None;
            state.last_turn = Some(turn.clone());
        }
        let request = ChatRequest {
            message: turn.message,
            mode: turn.mode,
            session_id: self.sessions.get_or_create(),
            conversation_id: turn.conversation_id,
            attachments: turn.attachments,
        };
        (pending, request)
    }

    fn finish(
        &self,
        pending: &PendingRequest,
        result: Result<f64, ChatError>,
        full: String,
        on_event: &mut (impl FnMut(ChatEvent) + Send),
    ) -> TurnOutcome {
        let current = self.registry.end(&pending.correlation_id);
        if pending.is_superseded() {
            tracing::debug!(correlation_id = %pending.correlation_id, "Dropping result of superseded turn");
            return TurnOutcome::Superseded;
        }

        // A cancel issued before we got here wins over a completed stream.
        let result = match result {
            Ok(_) if pending.is_cancelled() => Err(ChatError::Cancelled),
            other => other,
        };

        let mut state = self.state.lock();
        if current {
            state.loading = false;
        }
        match result {
            Ok(response_time) => {
                tracing::info!(
                    correlation_id = %pending.correlation_id,
                    response_time,
                    chars = full.len(),
                    "Chat turn completed"
                );
                drop(state);
                on_event(ChatEvent::Done {
                    response_time,
                    full,
                });
                TurnOutcome::Completed
            }
            Err(e) if e.is_cancelled() => {
                tracing::info!(correlation_id = %pending.correlation_id, reason = %e, "Chat turn cancelled");
                drop(state);
                on_event(ChatEvent::Cancelled { partial: full });
                TurnOutcome::Cancelled
            }
            Err(e) => {
                tracing::error!(correlation_id = %pending.correlation_id, error = %e, "Chat turn failed");
                let message = e.to_string();
                if current {
                    state.error = Some(message.clone());
                }
                drop(state);
                on_event(ChatEvent::Error { message });
                TurnOutcome::Failed
            }
        }
    }

    fn notify_remote(&self, correlation_id: String) {
        let transport = self.transport.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = transport.notify_cancel(&correlation_id).await {
                        tracing::warn!(
                            correlation_id = %correlation_id,
                            error = %e,
                            "Remote cancel notification failed"
                        );
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    correlation_id = %correlation_id,
                    "No async runtime, skipping remote cancel notification"
                );
            }
        }
    }
}

/// Forward non-terminal events until the stream ends. Returns the server's
/// elapsed time on `done`.
async fn pump(
    stream: &mut ResponseStream,
    pending: &PendingRequest,
    full: &mut String,
    on_event: &mut (impl FnMut(ChatEvent) + Send),
) -> Result<f64, ChatError> {
    loop {
        let event = stream.next_event().await?;
        if pending.is_cancelled() {
            return Err(ChatError::Cancelled);
        }
        match event {
            Some(StreamEvent::Metadata {
                sources,
                used_rag,
                used_web_search,
            }) => {
                tracing::debug!(
                    correlation_id = %pending.correlation_id,
                    sources = sources.len(),
                    used_rag,
                    used_web_search,
                    "Metadata received"
                );
                on_event(ChatEvent::Metadata {
                    sources,
                    used_rag,
                    used_web_search,
                });
            }
            Some(StreamEvent::Chunk { content }) => {
                full.push_str(&content);
                on_event(ChatEvent::Chunk {
                    delta: content,
                    full: full.clone(),
                });
            }
            Some(StreamEvent::Done { response_time }) => return Ok(response_time.max(0.0)),
            Some(StreamEvent::Cancelled { content }) => {
                return Err(ChatError::ServerCancelled(content.unwrap_or_default()))
            }
            Some(StreamEvent::Error { content }) => {
                return Err(ChatError::Server(
                    content.unwrap_or_else(|| "The server reported an error".to_string()),
                ))
            }
            None => {
                return Err(ChatError::Decode(
                    "stream ended before completion".to_string(),
                ))
            }
        }
    }
}
