//! Networking node
//!
//! Composes the topology table, signature engine, codec registry and both
//! adapters around one [`Transport`], and pumps received frames through them.

use std::future::Future;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::addressing::{self, Destination, Forwarding, RoutingError};
use crate::codec::{ActionCodec, CodecRegistry, RequestContext};
use crate::config::NodeConfig;
use crate::envelope::{Envelope, ErrorFrame, Request, Response};
use crate::inbound::{HandlerError, InboundAdapter, InboundOutcome, Outgoing};
use crate::messages::{
    GenericStatus, NotifyNetworkTopology, NotifyNetworkTopologyRequest, NotifyNetworkTopologyResponse, Ping,
    PingRequest, PingResponse,
};
use crate::outbound::{OutboundAdapter, OutboundRequest, SendError};
use crate::signature::{KeyRing, SignatureEngine, Signer, Verifier};
use crate::topology::{AdvertisementOutcome, TopologyManager};
use crate::transport::{Inbox, Transport};
use crate::types::{now, NodeId, ResultCode};

/// Builder for [`NetworkingNode`]
pub struct NodeBuilder {
    config: NodeConfig,
    signer: Option<Arc<dyn Signer>>,
    verifier: Option<Arc<dyn Verifier>>,
    codecs: Option<Arc<CodecRegistry>>,
}

impl NodeBuilder {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            signer: None,
            verifier: None,
            codecs: None,
        }
    }

    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Share a codec registry prepared elsewhere
    pub fn with_codecs(mut self, codecs: Arc<CodecRegistry>) -> Self {
        self.codecs = Some(codecs);
        self
    }

    pub fn build(self, transport: Arc<dyn Transport>) -> Arc<NetworkingNode> {
        let config = self.config;
        let topology = Arc::new(TopologyManager::new(config.node_id.clone(), config.uplink.clone()));
        let codecs = self.codecs.unwrap_or_default();
        let verifier = self.verifier.unwrap_or_else(|| Arc::new(KeyRing::new()));
        let signatures = Arc::new(SignatureEngine::new(
            config.signature_policy.clone(),
            self.signer,
            verifier,
        ));

        let inbound = InboundAdapter::new(topology.clone(), codecs.clone(), signatures.clone());
        let outbound = Arc::new(OutboundAdapter::new(
            topology.clone(),
            signatures.clone(),
            transport.clone(),
            config.request_timeout,
        ));

        let node = Arc::new(NetworkingNode {
            config,
            topology,
            codecs,
            signatures,
            inbound,
            outbound,
            transport,
            sweeper: Mutex::new(None),
        });
        node.register_builtin_actions();
        node
    }
}

/// One participant of the overlay mesh
pub struct NetworkingNode {
    config: NodeConfig,
    topology: Arc<TopologyManager>,
    codecs: Arc<CodecRegistry>,
    signatures: Arc<SignatureEngine>,
    inbound: InboundAdapter,
    outbound: Arc<OutboundAdapter>,
    transport: Arc<dyn Transport>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkingNode {
    pub fn builder(config: NodeConfig) -> NodeBuilder {
        NodeBuilder::new(config)
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn topology(&self) -> &TopologyManager {
        &self.topology
    }

    pub fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    pub fn signatures(&self) -> &SignatureEngine {
        &self.signatures
    }

    pub fn inbound(&self) -> &InboundAdapter {
        &self.inbound
    }

    pub fn outbound(&self) -> &OutboundAdapter {
        &self.outbound
    }

    fn register_builtin_actions(self: &Arc<Self>) {
        self.inbound.on_request::<Ping, _, _>(|_req: Arc<PingRequest>, _ctx| async {
            Ok::<_, HandlerError>(Some(PingResponse {
                status: GenericStatus::Accepted,
            }))
        });

        let node = Arc::downgrade(self);
        self.inbound
            .on_request::<NotifyNetworkTopology, _, _>(move |req, ctx| {
                let response = match node.upgrade() {
                    Some(node) => node.accept_advertisement(&req, &ctx),
                    None => NotifyNetworkTopologyResponse::rejected("Unavailable", "node is shutting down"),
                };
                async move { Ok::<_, HandlerError>(Some(response)) }
            });
    }

    fn accept_advertisement(
        self: &Arc<Self>,
        req: &NotifyNetworkTopologyRequest,
        ctx: &RequestContext,
    ) -> NotifyNetworkTopologyResponse {
        let neighbor = &ctx.received_from;
        if ctx.network_path.origin() != Some(neighbor) {
            warn!(
                "{}: advertisement via {} was relayed along {:?}",
                self.node_id(),
                neighbor,
                ctx.network_path
            );
            return NotifyNetworkTopologyResponse::rejected(
                "InvalidTopology",
                "advertisements are only accepted from direct neighbors",
            );
        }

        match self
            .topology
            .apply_advertisement(neighbor, req.reachable_nodes.clone(), req.advertised_at)
        {
            Ok(AdvertisementOutcome::Applied { added, removed }) => {
                if (!added.is_empty() || !removed.is_empty()) && self.topology.uplink().is_some() {
                    self.propagate_topology();
                }
                NotifyNetworkTopologyResponse::accepted()
            }
            Ok(AdvertisementOutcome::Stale) => NotifyNetworkTopologyResponse::accepted(),
            Err(e) => {
                warn!("Rejected topology advertisement from {}: {}", neighbor, e);
                NotifyNetworkTopologyResponse::rejected("InvalidTopology", e.to_string())
            }
        }
    }

    /// Re-advertise our reachable set upward without blocking the caller
    fn propagate_topology(self: &Arc<Self>) {
        let node: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let Some(node) = node.upgrade() else {
                return;
            };
            if let Err(e) = node.advertise_topology().await {
                warn!("Failed to propagate topology from {}: {}", node.node_id(), e);
            }
        });
    }

    /// Register a business processor; see [`InboundAdapter::on_request`]
    pub fn on_request<A, F, Fut>(&self, handler: F)
    where
        A: ActionCodec,
        F: Fn(Arc<A::Request>, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<A::Response>, HandlerError>> + Send + 'static,
    {
        self.inbound.on_request::<A, F, Fut>(handler);
    }

    /// A direct link to `neighbor` came up
    pub fn link_up(&self, neighbor: impl Into<NodeId>) {
        let neighbor = neighbor.into();
        info!("{}: link to {} up", self.node_id(), neighbor);
        self.topology.add_neighbor(neighbor);
    }

    /// The direct link to `neighbor` went away
    pub fn link_down(&self, neighbor: &str) {
        info!("{}: link to {} down", self.node_id(), neighbor);
        self.topology.remove_neighbor(neighbor);
    }

    pub async fn send(&self, request: OutboundRequest) -> Result<Response, SendError> {
        self.outbound.send(request).await
    }

    pub async fn send_with_cancel<C>(&self, request: OutboundRequest, cancel: C) -> Result<Response, SendError>
    where
        C: Future<Output = ()> + Send,
    {
        self.outbound.send_with_cancel(request, cancel).await
    }

    /// Liveness check against any node
    pub async fn ping(&self, destination: Destination) -> Result<PingResponse, SendError> {
        let request = OutboundRequest::new(Ping::ACTION, destination, PingRequest::default())?;
        let response = self.outbound.send(request).await?;
        Ok(response.parse_payload()?)
    }

    /// Tell the uplink everything reachable through this node
    pub async fn advertise_topology(&self) -> Result<NotifyNetworkTopologyResponse, SendError> {
        let Some(uplink) = self.topology.uplink() else {
            return Err(RoutingError::Unreachable("uplink".to_string(), self.node_id().to_string()).into());
        };

        let reachable_nodes = self.topology.reachable_nodes();
        debug!("{}: advertising {:?} to {}", self.node_id(), reachable_nodes, uplink);

        let request = OutboundRequest::new(
            NotifyNetworkTopology::ACTION,
            Destination::Node(uplink),
            NotifyNetworkTopologyRequest {
                reachable_nodes,
                advertised_at: now(),
            },
        )?;
        let response = self.outbound.send(request).await?;
        Ok(response.parse_payload()?)
    }

    /// Run one received frame through the inbound pipeline and act on the result
    pub async fn handle_frame(&self, from: &str, frame: &[u8]) {
        let outcome = match self.inbound.receive(from, frame).await {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!("{}: discarding frame from {}: {}", self.node_id(), from, e);
                return;
            }
        };

        match outcome {
            InboundOutcome::Reply(out) => self.transmit(out).await,
            InboundOutcome::Relay(out) => self.relay(out).await,
            InboundOutcome::Deliver(Envelope::ResponseError(_)) => {}
            InboundOutcome::Deliver(envelope) => {
                let request_id = envelope.request_id().clone();
                if !self.outbound.complete(envelope) {
                    debug!("{}: no caller waiting for {}", self.node_id(), request_id);
                }
            }
            InboundOutcome::Drop => {}
        }
    }

    async fn transmit(&self, out: Outgoing) {
        let frame = match out.to_bytes() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("{}: cannot encode {}: {}", self.node_id(), out.envelope.request_id(), e);
                return;
            }
        };
        if let Err(e) = self.transport.send(&out.next_hop, frame).await {
            warn!("{}: failed to send {} to {}: {}", self.node_id(), out.envelope.request_id(), out.next_hop, e);
        }
    }

    /// Relay a frame; a request that cannot leave is bounced back as `NetworkError`
    async fn relay(&self, out: Outgoing) {
        let frame = match out.to_bytes() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("{}: cannot encode {}: {}", self.node_id(), out.envelope.request_id(), e);
                return;
            }
        };

        let Err(e) = self.transport.send(&out.next_hop, frame).await else {
            return;
        };
        warn!("{}: relay of {} to {} failed: {}", self.node_id(), out.envelope.request_id(), out.next_hop, e);

        if let Envelope::Request(request) = &out.envelope {
            self.bounce(request, format!("next hop {} unavailable: {}", out.next_hop, e))
                .await;
        }
    }

    async fn bounce(&self, request: &Request, reason: String) {
        let error = ErrorFrame::request_error(
            request.request_id.clone(),
            request.network_path.reversed(),
            ResultCode::NetworkError,
            reason,
        );

        match addressing::route_back(&error.network_path, self.node_id()) {
            Ok(Forwarding::RelayTo { next_hop, .. }) => {
                self.transmit(Outgoing {
                    next_hop,
                    envelope: Envelope::RequestError(error),
                })
                .await
            }
            Ok(Forwarding::Deliver) => {
                self.outbound.complete(Envelope::RequestError(error));
            }
            Err(e) => warn!("{}: cannot bounce {}: {}", self.node_id(), request.request_id, e),
        }
    }

    /// Serve frames from `inbox` until it closes, one task per frame.
    ///
    /// Also starts the pending-request expiry sweeper.
    pub fn serve(self: &Arc<Self>, mut inbox: Inbox) -> JoinHandle<()> {
        {
            let mut sweeper = self.sweeper.lock();
            if sweeper.is_none() {
                *sweeper = Some(self.outbound.spawn_expiry_sweeper(self.config.expiry_sweep_interval));
            }
        }

        let node = self.clone();
        tokio::spawn(async move {
            info!("{}: serving", node.node_id());
            while let Some((from, frame)) = inbox.recv().await {
                let node = node.clone();
                tokio::spawn(async move {
                    node.handle_frame(&from, &frame).await;
                });
            }
            debug!("{}: inbox closed", node.node_id());
        })
    }
}
