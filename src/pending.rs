//! Tracks the one chat turn that may be in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Handle to a registered turn, shared between the registry and the task
/// driving the request.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub correlation_id: String,
    pub token: CancellationToken,
    superseded: Arc<AtomicBool>,
}

impl PendingRequest {
    fn new() -> Self {
        Self {
            correlation_id: format!("pending_{}", Uuid::new_v4().simple()),
            token: CancellationToken::new(),
            superseded: Arc::new(AtomicBool::new(false)),
        }
    }

    /// True once a newer turn has replaced this one. A superseded turn must
    /// not report anything to the UI.
    pub fn is_superseded(&self) -> bool {
        self.superseded.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[derive(Debug, Default)]
pub struct PendingRegistry {
    current: Mutex<Option<PendingRequest>>,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new turn as current. Whatever was registered before is
    /// marked superseded and cancelled; its correlation id is returned so the
    /// caller can tell the server to stop that generation.
    pub fn begin(&self) -> (PendingRequest, Option<String>) {
        let next = PendingRequest::new();
        let previous = self.current.lock().replace(next.clone());
        let previous_id = previous.map(|prev| {
            prev.superseded.store(true, Ordering::Release);
            prev.token.cancel();
            tracing::debug!(
                correlation_id = %prev.correlation_id,
                superseded_by = %next.correlation_id,
                "Superseded in-flight request"
            );
            prev.correlation_id
        });
        (next, previous_id)
    }

    /// Clear the registration only if it still belongs to `correlation_id`.
    /// Returns whether it did; a stale completion gets `false` and must not
    /// touch shared state.
    pub fn end(&self, correlation_id: &str) -> bool {
        let mut current = self.current.lock();
        match current.as_ref() {
            Some(pending) if pending.correlation_id == correlation_id => {
                *current = None;
                true
            }
            _ => false,
        }
    }

    /// Cancel and clear the current turn, if any.
    pub fn cancel_current(&self) -> Option<String> {
        let pending = self.current.lock().take()?;
        pending.token.cancel();
        Some(pending.correlation_id)
    }

    pub fn current_id(&self) -> Option<String> {
        self.current
            .lock()
            .as_ref()
            .map(|pending| pending.correlation_id.clone())
    }

    pub fn is_current(&self, correlation_id: &str) -> bool {
        self.current
            .lock()
            .as_ref()
            .is_some_and(|pending| pending.correlation_id == correlation_id)
    }
}
