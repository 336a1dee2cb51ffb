//! WebSocket links between mesh nodes
//!
//! Every neighbor gets one WebSocket connection. Children connect to
//! `ws://<listen>/<child-id>`; a node connects to its uplink at
//! `<uplink-url>/<own-id>`. Frames are JSON text messages.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use mesh_core::{NetworkingNode, NodeId, Transport, TransportError};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, connect_async, WebSocketStream};
use tracing::{debug, error, info, warn};

/// Outgoing frames buffered per link
const LINK_QUEUE: usize = 64;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("connection closed")]
    Closed,
}

/// Open links by neighbor id; the node's [`Transport`]
#[derive(Default)]
pub struct WsLinks {
    links: RwLock<HashMap<NodeId, mpsc::Sender<Vec<u8>>>>,
}

impl WsLinks {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, peer: &str, tx: mpsc::Sender<Vec<u8>>) {
        if self.links.write().insert(peer.to_string(), tx).is_some() {
            warn!("Replacing existing link to {}", peer);
        }
    }

    /// Remove the link unless a newer connection already replaced it
    fn remove(&self, peer: &str, tx: &mpsc::Sender<Vec<u8>>) -> bool {
        let mut links = self.links.write();
        match links.get(peer) {
            Some(current) if current.same_channel(tx) => {
                links.remove(peer);
                true
            }
            _ => false,
        }
    }

    pub fn connected(&self) -> Vec<NodeId> {
        let mut peers: Vec<NodeId> = self.links.read().keys().cloned().collect();
        peers.sort();
        peers
    }
}

#[async_trait]
impl Transport for WsLinks {
    async fn send(&self, next_hop: &str, frame: Vec<u8>) -> Result<(), TransportError> {
        let tx = self
            .links
            .read()
            .get(next_hop)
            .cloned()
            .ok_or_else(|| TransportError::NotConnected(next_hop.to_string()))?;

        tx.send(frame)
            .await
            .map_err(|_| TransportError::Closed(next_hop.to_string()))
    }
}

/// Everything a link task needs
#[derive(Clone)]
pub struct LinkContext {
    pub node: Arc<NetworkingNode>,
    pub links: Arc<WsLinks>,
    pub inbox: mpsc::Sender<(NodeId, Vec<u8>)>,
}

impl LinkContext {
    /// Register the link now; the returned future pumps it until it closes
    fn attach<S>(&self, ws: WebSocketStream<S>, peer: NodeId) -> impl Future<Output = ()> + Send + 'static
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(LINK_QUEUE);
        self.links.insert(&peer, tx.clone());
        self.node.link_up(peer.clone());

        let ctx = self.clone();
        async move {
            let (mut ws_tx, mut ws_rx) = ws.split();

            let writer_peer = peer.clone();
            let writer = tokio::spawn(async move {
                while let Some(frame) = rx.recv().await {
                    debug!("-> {}: {}", writer_peer, String::from_utf8_lossy(&frame));
                    let text = String::from_utf8_lossy(&frame).into_owned();
                    if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                        error!("Failed to send to {}: {}", writer_peer, e);
                        break;
                    }
                }
            });

            while let Some(msg) = ws_rx.next().await {
                let frame = match msg {
                    Ok(Message::Text(text)) => text.as_bytes().to_vec(),
                    Ok(Message::Binary(bytes)) => bytes.to_vec(),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("Link to {} failed: {}", peer, e);
                        break;
                    }
                };
                debug!("<- {}: {}", peer, String::from_utf8_lossy(&frame));
                if ctx.inbox.send((peer.clone(), frame)).await.is_err() {
                    break;
                }
            }

            writer.abort();
            if ctx.links.remove(&peer, &tx) {
                ctx.node.link_down(&peer);
            }
        }
    }
}

/// Accept downstream nodes on `addr`
pub async fn listen(addr: &str, ctx: LinkContext) -> Result<(), LinkError> {
    let listener = TcpListener::bind(addr).await?;
    info!("Listening for downstream nodes on {}", addr);

    loop {
        let (stream, remote) = listener.accept().await?;
        let ctx = ctx.clone();
        tokio::spawn(async move {
            match accept_downstream(stream).await {
                Ok((ws, peer)) => {
                    info!("Downstream node {} connected from {}", peer, remote);
                    ctx.attach(ws, peer).await;
                }
                Err(e) => warn!("Rejected connection from {}: {}", remote, e),
            }
        });
    }
}

/// Complete the handshake; the last URL path segment names the peer
async fn accept_downstream(stream: TcpStream) -> Result<(WebSocketStream<TcpStream>, NodeId), LinkError> {
    let peer: Arc<Mutex<Option<NodeId>>> = Arc::new(Mutex::new(None));
    let seen = peer.clone();

    let ws = accept_hdr_async(stream, move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        let id = req
            .uri()
            .path()
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .map(String::from);
        *seen.lock() = id;
        Ok(resp)
    })
    .await?;

    let id = peer.lock().take();
    match id {
        Some(id) => Ok((ws, id)),
        None => Err(LinkError::Closed),
    }
}

/// Keep the uplink connected, reconnecting with exponential backoff
pub async fn maintain_uplink(
    url: String,
    uplink_id: NodeId,
    ctx: LinkContext,
    reconnect_delay: Duration,
    max_reconnect_delay: Duration,
) {
    let mut delay = reconnect_delay;
    let endpoint = format!("{}/{}", url.trim_end_matches('/'), ctx.node.node_id());

    loop {
        info!("Connecting to uplink {} at {}", uplink_id, endpoint);

        match connect_async(endpoint.as_str()).await {
            Ok((ws, _response)) => {
                info!("Uplink {} connected", uplink_id);
                delay = reconnect_delay;

                let link = ctx.attach(ws, uplink_id.clone());

                let node = ctx.node.clone();
                tokio::spawn(async move {
                    match node.advertise_topology().await {
                        Ok(ack) => debug!("Topology advertisement answered: {:?}", ack.status),
                        Err(e) => warn!("Topology advertisement failed: {}", e),
                    }
                });

                link.await;
                warn!("Uplink {} disconnected", uplink_id);
            }
            Err(e) => error!("Uplink connection failed: {}", e),
        }

        let wait = with_jitter(delay);
        info!("Reconnecting in {:?}", wait);
        tokio::time::sleep(wait).await;
        delay = std::cmp::min(delay * 2, max_reconnect_delay);
    }
}

/// Spread reconnects of sibling nodes by up to a quarter of the delay
fn with_jitter(delay: Duration) -> Duration {
    let spread = (delay.as_millis() / 4) as u64;
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_without_link_fails() {
        let links = WsLinks::new();
        assert_eq!(
            links.send("CSMS", b"{}".to_vec()).await,
            Err(TransportError::NotConnected("CSMS".to_string()))
        );
    }

    #[tokio::test]
    async fn test_stale_link_does_not_remove_replacement() {
        let links = WsLinks::new();
        let (old_tx, _old_rx) = mpsc::channel(1);
        let (new_tx, mut new_rx) = mpsc::channel(1);

        links.insert("A", old_tx.clone());
        links.insert("A", new_tx.clone());

        assert!(!links.remove("A", &old_tx));
        assert_eq!(links.connected(), vec!["A".to_string()]);

        links.send("A", b"hi".to_vec()).await.unwrap();
        assert_eq!(new_rx.recv().await.unwrap(), b"hi");

        assert!(links.remove("A", &new_tx));
        assert!(links.connected().is_empty());
    }

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_millis(800);
        for _ in 0..100 {
            let wait = with_jitter(base);
            assert!(wait >= base);
            assert!(wait <= base + Duration::from_millis(200));
        }
        assert_eq!(with_jitter(Duration::ZERO), Duration::ZERO);
    }
}
