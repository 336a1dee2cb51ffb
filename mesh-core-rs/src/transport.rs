//! Transport seam
//!
//! The core only needs "deliver these bytes to that neighbor". Real links
//! (WebSocket in `mesh-node`) implement [`Transport`]; [`MemoryHub`] wires
//! nodes together in-process for tests and demos.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::types::NodeId;

/// Channel capacity per in-memory link
const INBOX_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("no link to {0}")]
    NotConnected(NodeId),

    #[error("link to {0} closed")]
    Closed(NodeId),

    #[error("transport I/O error: {0}")]
    Io(String),
}

/// Sends opaque frames to directly connected neighbors
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, next_hop: &str, frame: Vec<u8>) -> Result<(), TransportError>;
}

/// Frames received by one node: `(sending neighbor, frame)`
pub type Inbox = mpsc::Receiver<(NodeId, Vec<u8>)>;

/// In-process switchboard connecting any number of nodes
#[derive(Clone, Default)]
pub struct MemoryHub {
    inboxes: Arc<RwLock<HashMap<NodeId, mpsc::Sender<(NodeId, Vec<u8>)>>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node; returns its transport and the inbox to serve
    pub fn attach(&self, node_id: impl Into<NodeId>) -> (Arc<MemoryTransport>, Inbox) {
        let node_id = node_id.into();
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        self.inboxes.write().insert(node_id.clone(), tx);
        debug!("MemoryHub: {} attached", node_id);

        let transport = Arc::new(MemoryTransport {
            local: node_id,
            hub: self.clone(),
        });
        (transport, rx)
    }

    /// Detach a node; frames sent to it fail with `NotConnected`
    pub fn detach(&self, node_id: &str) {
        if self.inboxes.write().remove(node_id).is_some() {
            debug!("MemoryHub: {} detached", node_id);
        }
    }

    pub fn is_attached(&self, node_id: &str) -> bool {
        self.inboxes.read().contains_key(node_id)
    }
}

/// One node's handle on a [`MemoryHub`]
pub struct MemoryTransport {
    local: NodeId,
    hub: MemoryHub,
}

impl MemoryTransport {
    pub fn local_id(&self) -> &str {
        &self.local
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, next_hop: &str, frame: Vec<u8>) -> Result<(), TransportError> {
        let tx = self
            .hub
            .inboxes
            .read()
            .get(next_hop)
            .cloned()
            .ok_or_else(|| TransportError::NotConnected(next_hop.to_string()))?;

        tx.send((self.local.clone(), frame)).await.map_err(|_| {
            warn!("MemoryHub: inbox of {} is closed", next_hop);
            TransportError::Closed(next_hop.to_string())
        })
    }
}
