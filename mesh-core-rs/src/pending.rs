//! Pending-request table
//!
//! Tracks outbound requests until they are resolved exactly once:
//!
//! ```text
//! Created ──► Sent ──► Pending ──┬─► Completed   (Response)
//!                                ├─► Errored     (RequestError / transport failure)
//!                                ├─► TimedOut
//!                                └─► Cancelled
//! ```
//!
//! Resolution removes the entry; a second resolution for the same id finds
//! nothing and is dropped.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::envelope::{ErrorFrame, Response};
use crate::types::RequestId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PendingError {
    #[error("request {0} is already pending")]
    Duplicate(RequestId),
}

/// Lifecycle of one outbound request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Created,
    Sent,
    Pending,
    Completed,
    Errored,
    TimedOut,
    Cancelled,
}

/// How an outbound request ended
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Response(Response),
    RequestError(ErrorFrame),
    TransportFailed(String),
    TimedOut,
    Cancelled,
}

impl Resolution {
    fn terminal_state(&self) -> RequestState {
        match self {
            Resolution::Response(_) => RequestState::Completed,
            Resolution::RequestError(_) | Resolution::TransportFailed(_) => RequestState::Errored,
            Resolution::TimedOut => RequestState::TimedOut,
            Resolution::Cancelled => RequestState::Cancelled,
        }
    }
}

struct PendingEntry {
    action: String,
    issued_at: Instant,
    timeout: Duration,
    state: RequestState,
    completion: oneshot::Sender<Resolution>,
}

/// Awaitable side of a registered request
#[derive(Debug)]
pub struct PendingHandle {
    pub request_id: RequestId,
    pub deadline: Instant,
    pub(crate) completion: oneshot::Receiver<Resolution>,
}

impl PendingHandle {
    /// Wait for the resolution; the table guarantees one is sent
    pub async fn resolved(self) -> Resolution {
        self.completion.await.unwrap_or(Resolution::Cancelled)
    }
}

/// In-flight requests of one endpoint
#[derive(Default)]
pub struct PendingRequests {
    entries: Mutex<HashMap<RequestId, PendingEntry>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new request before it is transmitted
    pub fn register(
        &self,
        request_id: RequestId,
        action: impl Into<String>,
        timeout: Duration,
    ) -> Result<PendingHandle, PendingError> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&request_id) {
            return Err(PendingError::Duplicate(request_id));
        }

        let issued_at = Instant::now();
        let (completion, rx) = oneshot::channel();
        entries.insert(
            request_id.clone(),
            PendingEntry {
                action: action.into(),
                issued_at,
                timeout,
                state: RequestState::Created,
                completion,
            },
        );

        Ok(PendingHandle {
            request_id,
            deadline: issued_at + timeout,
            completion: rx,
        })
    }

    /// Transport accepted the frame
    pub fn mark_sent(&self, request_id: &RequestId) {
        self.advance(request_id, RequestState::Sent);
    }

    /// Caller is now waiting for the reply
    pub fn mark_pending(&self, request_id: &RequestId) {
        self.advance(request_id, RequestState::Pending);
    }

    fn advance(&self, request_id: &RequestId, state: RequestState) {
        if let Some(entry) = self.entries.lock().get_mut(request_id) {
            entry.state = state;
        }
    }

    /// Resolve a request. Unknown, late or duplicate ids are logged and dropped.
    pub fn complete(&self, request_id: &RequestId, resolution: Resolution) -> bool {
        let Some(entry) = self.entries.lock().remove(request_id) else {
            debug!("Dropping {:?} for unknown request {}", resolution.terminal_state(), request_id);
            return false;
        };

        debug!(
            "Request {} ({}) {:?} -> {:?} after {:?}",
            request_id,
            entry.action,
            entry.state,
            resolution.terminal_state(),
            entry.issued_at.elapsed()
        );

        if entry.completion.send(resolution).is_err() {
            debug!("Caller of request {} is gone", request_id);
        }
        true
    }

    pub fn cancel(&self, request_id: &RequestId) -> bool {
        self.complete(request_id, Resolution::Cancelled)
    }

    /// Time out every request whose deadline is at or before `now`
    pub fn expire_older_than(&self, now: Instant) -> Vec<RequestId> {
        let expired: Vec<(RequestId, PendingEntry)> = {
            let mut entries = self.entries.lock();
            let ids: Vec<RequestId> = entries
                .iter()
                .filter(|(_, e)| e.issued_at + e.timeout <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id).map(|e| (id, e)))
                .collect()
        };

        expired
            .into_iter()
            .map(|(id, entry)| {
                warn!("Request {} ({}) timed out after {:?}", id, entry.action, entry.timeout);
                let _ = entry.completion.send(Resolution::TimedOut);
                id
            })
            .collect()
    }

    pub fn state(&self, request_id: &RequestId) -> Option<RequestState> {
        self.entries.lock().get(request_id).map(|e| e.state)
    }

    /// Action of a still-pending request
    pub fn action_for(&self, request_id: &RequestId) -> Option<String> {
        self.entries.lock().get(request_id).map(|e| e.action.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
