//! Notification hooks
//!
//! Observers are best-effort: each one runs on its own task, and an error or
//! panic in one of them is logged and never reaches the message pipeline.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::warn;

use crate::addressing::{Destination, NetworkPath};
use crate::types::{NodeId, RequestId, ResultCode};

/// Error type observers may return
pub type ObserverError = Box<dyn std::error::Error + Send + Sync>;

type ObserverFn<E> = dyn Fn(E) -> BoxFuture<'static, Result<(), ObserverError>> + Send + Sync;

/// A request was received (inbound) or sent (outbound)
#[derive(Debug, Clone, PartialEq)]
pub struct RequestEvent {
    pub timestamp: DateTime<Utc>,
    pub request_id: RequestId,
    pub action: String,
    pub destination: Destination,
    pub network_path: NetworkPath,
    pub payload: Value,
}

/// A response was sent (inbound) or received (outbound)
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEvent {
    pub timestamp: DateTime<Utc>,
    pub request_id: RequestId,
    pub action: String,
    pub network_path: NetworkPath,
    pub result: ResultCode,
    pub payload: Value,
    /// Time between request and response as seen by this node
    pub runtime: Duration,
}

/// A frame was discarded without any reply, because it carried no usable requestId
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRejected {
    pub timestamp: DateTime<Utc>,
    /// Link the frame arrived on
    pub from: NodeId,
    pub reason: String,
    pub frame_len: usize,
}

/// Registered observers for one kind of event
pub struct Observers<E> {
    name: &'static str,
    subscribers: RwLock<Vec<Arc<ObserverFn<E>>>>,
}

impl<E: Clone + Send + 'static> Observers<E> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            subscribers: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe<F, Fut>(&self, observer: F)
    where
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ObserverError>> + Send + 'static,
    {
        self.subscribers
            .write()
            .push(Arc::new(move |event: E| observer(event).boxed()));
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }

    /// Fire and forget: hand the event to every observer without waiting
    pub fn publish(&self, event: E) {
        let subscribers = self.subscribers.read().clone();
        for observer in subscribers {
            let event = event.clone();
            let name = self.name;
            tokio::spawn(async move {
                let run = AssertUnwindSafe(async move { observer(event).await }).catch_unwind();
                match run.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("{} observer failed: {}", name, e),
                    Err(_) => warn!("{} observer panicked", name),
                }
            });
        }
    }
}
