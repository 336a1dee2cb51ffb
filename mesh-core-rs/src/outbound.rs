//! Outbound adapter
//!
//! Builds, signs and sends requests, then waits for the correlated reply.
//! The pending entry is registered before the frame leaves, so even a reply
//! that overtakes the `send` call finds its caller.

use std::future::{self, Future};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::addressing::{self, Destination, Forwarding, NetworkPath, RoutingError};
use crate::envelope::{Envelope, ErrorFrame, Request, Response};
use crate::events::{Observers, RequestEvent, ResponseEvent};
use crate::pending::{PendingError, PendingRequests, Resolution};
use crate::signature::{SignatureEngine, SignatureError};
use crate::topology::TopologyManager;
use crate::transport::Transport;
use crate::types::{now, RequestId, ResultCode};

/// Default time to wait for a reply
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Error reported by the remote side in a RequestError frame
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{action} {request_id} failed remotely: {code} {description}")]
pub struct RemoteError {
    pub request_id: RequestId,
    pub action: String,
    pub code: ResultCode,
    pub description: String,
    pub details: Value,
    pub network_path: NetworkPath,
    pub timestamp: DateTime<Utc>,
}

/// Caller-facing failures of [`OutboundAdapter::send`]
#[derive(Debug, Error)]
pub enum SendError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("request {0} timed out")]
    TimedOut(RequestId),

    #[error("request {0} cancelled")]
    Cancelled(RequestId),

    #[error(transparent)]
    Remote(RemoteError),

    #[error("signature error: {0}")]
    Signature(#[from] SignatureError),

    #[error("routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Pending(#[from] PendingError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SendError {
    /// Result code describing this failure
    pub fn code(&self) -> ResultCode {
        match self {
            SendError::Transport(_) | SendError::Routing(_) => ResultCode::NetworkError,
            SendError::TimedOut(_) => ResultCode::TimedOut,
            SendError::Cancelled(_) => ResultCode::Cancelled,
            SendError::Remote(remote) => remote.code.clone(),
            SendError::Signature(_) => ResultCode::SignatureError,
            SendError::Pending(_) | SendError::Serialization(_) => ResultCode::FormationViolation,
        }
    }
}

/// Request as composed by the caller
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    pub action: String,
    pub destination: Destination,
    pub payload: Value,
    /// Minted when absent
    pub request_id: Option<RequestId>,
    /// Adapter default when absent
    pub timeout: Option<Duration>,
    pub event_tracking_id: Option<String>,
    pub custom_data: Option<Value>,
}

impl OutboundRequest {
    pub fn new(
        action: impl Into<String>,
        destination: Destination,
        payload: impl Serialize,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            action: action.into(),
            destination,
            payload: serde_json::to_value(payload)?,
            request_id: None,
            timeout: None,
            event_tracking_id: None,
            custom_data: None,
        })
    }

    pub fn with_request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_event_tracking_id(mut self, id: impl Into<String>) -> Self {
        self.event_tracking_id = Some(id.into());
        self
    }

    pub fn with_custom_data(mut self, custom_data: Value) -> Self {
        self.custom_data = Some(custom_data);
        self
    }
}

/// Sends requests and correlates their replies
pub struct OutboundAdapter {
    topology: Arc<TopologyManager>,
    signatures: Arc<SignatureEngine>,
    transport: Arc<dyn Transport>,
    pending: PendingRequests,
    default_timeout: Duration,
    request_sent: Observers<RequestEvent>,
    response_received: Observers<ResponseEvent>,
}

impl OutboundAdapter {
    pub fn new(
        topology: Arc<TopologyManager>,
        signatures: Arc<SignatureEngine>,
        transport: Arc<dyn Transport>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            topology,
            signatures,
            transport,
            pending: PendingRequests::new(),
            default_timeout,
            request_sent: Observers::new("request sent"),
            response_received: Observers::new("response received"),
        }
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Fired when a request left this node
    pub fn request_sent(&self) -> &Observers<RequestEvent> {
        &self.request_sent
    }

    /// Fired when a Response or RequestError for one of our requests arrived
    pub fn response_received(&self) -> &Observers<ResponseEvent> {
        &self.response_received
    }

    /// Send a request and wait for its reply
    pub async fn send(&self, request: OutboundRequest) -> Result<Response, SendError> {
        self.send_with_cancel(request, future::pending::<()>()).await
    }

    /// Like [`send`](Self::send); resolving `cancel` abandons the wait.
    ///
    /// Cancelling only releases this caller. A frame already handed to the
    /// transport stays sent and a late reply is dropped.
    pub async fn send_with_cancel<C>(&self, request: OutboundRequest, cancel: C) -> Result<Response, SendError>
    where
        C: Future<Output = ()> + Send,
    {
        let started = Instant::now();
        let timeout = request.timeout.unwrap_or(self.default_timeout);

        let mut envelope = Request {
            request_id: request.request_id.unwrap_or_default(),
            action: request.action,
            destination: request.destination,
            network_path: NetworkPath::new(),
            payload: request.payload,
            signatures: Vec::new(),
            timestamp: now(),
            event_tracking_id: request.event_tracking_id,
            custom_data: request.custom_data,
        };

        let next_hop = match addressing::forward(&envelope.destination, &envelope.network_path, &self.topology)? {
            Forwarding::Deliver => return Err(RoutingError::LocalDestination(envelope.destination.to_string()).into()),
            Forwarding::RelayTo { next_hop, network_path } => {
                envelope.network_path = network_path;
                next_hop
            }
        };

        self.signatures.sign_request(&mut envelope)?;
        let frame = serde_json::to_vec(&envelope)?;

        let request_id = envelope.request_id.clone();
        let handle = self.pending.register(request_id.clone(), envelope.action.clone(), timeout)?;

        debug!("Sending {} {} to {} via {}", envelope.action, request_id, envelope.destination, next_hop);
        match self.transport.send(&next_hop, frame).await {
            Ok(()) => {
                self.pending.mark_sent(&request_id);
                self.pending.mark_pending(&request_id);
                self.request_sent.publish(RequestEvent {
                    timestamp: now(),
                    request_id: request_id.clone(),
                    action: envelope.action.clone(),
                    destination: envelope.destination.clone(),
                    network_path: envelope.network_path.clone(),
                    payload: envelope.payload.clone(),
                });
            }
            Err(e) => {
                warn!("Failed to send {} {} to {}: {}", envelope.action, request_id, next_hop, e);
                self.pending.complete(&request_id, Resolution::TransportFailed(e.to_string()));
            }
        }

        let deadline = handle.deadline;
        let mut completion = handle.completion;
        tokio::pin!(cancel);

        let resolution = tokio::select! {
            resolved = &mut completion => resolved.unwrap_or(Resolution::Cancelled),
            _ = tokio::time::sleep_until(deadline) => {
                self.pending.complete(&request_id, Resolution::TimedOut);
                completion.await.unwrap_or(Resolution::TimedOut)
            }
            _ = &mut cancel => {
                debug!("Caller cancelled {} {}", envelope.action, request_id);
                self.pending.cancel(&request_id);
                completion.await.unwrap_or(Resolution::Cancelled)
            }
        };

        match resolution {
            Resolution::Response(response) => self.accept_response(&envelope, response, started).await,
            Resolution::RequestError(error) => {
                self.publish_reply(&envelope, error.error_code.clone(), error.error_details.clone(), &error.network_path, started);
                Err(SendError::Remote(RemoteError {
                    request_id,
                    action: envelope.action,
                    code: error.error_code,
                    description: error.error_description,
                    details: error.error_details,
                    network_path: error.network_path,
                    timestamp: error.timestamp,
                }))
            }
            Resolution::TransportFailed(reason) => Err(SendError::Transport(reason)),
            Resolution::TimedOut => Err(SendError::TimedOut(request_id)),
            Resolution::Cancelled => Err(SendError::Cancelled(request_id)),
        }
    }

    async fn accept_response(
        &self,
        request: &Request,
        response: Response,
        started: Instant,
    ) -> Result<Response, SendError> {
        if let Err(e) = self.signatures.verify_response(&request.action, &response) {
            warn!("Rejecting response to {} {}: {}", request.action, request.request_id, e);
            self.reject_response(request, &e).await;
            return Err(SendError::Signature(e));
        }

        self.publish_reply(request, ResultCode::Ok, response.payload.clone(), &response.network_path, started);
        Ok(response)
    }

    fn publish_reply(
        &self,
        request: &Request,
        result: ResultCode,
        payload: Value,
        network_path: &NetworkPath,
        started: Instant,
    ) {
        self.response_received.publish(ResponseEvent {
            timestamp: now(),
            request_id: request.request_id.clone(),
            action: request.action.clone(),
            network_path: network_path.clone(),
            result,
            payload,
            runtime: started.elapsed(),
        });
    }

    /// Tell the responder its response was not accepted
    async fn reject_response(&self, request: &Request, reason: &SignatureError) {
        let mut error = ErrorFrame::response_error(
            request.request_id.clone(),
            request.destination.clone(),
            ResultCode::SignatureError,
            reason.to_string(),
        );

        let next_hop = match addressing::forward(&request.destination, &error.network_path, &self.topology) {
            Ok(Forwarding::RelayTo { next_hop, network_path }) => {
                error.network_path = network_path;
                next_hop
            }
            Ok(Forwarding::Deliver) => return,
            Err(e) => {
                warn!("Cannot route ResponseError for {}: {}", request.request_id, e);
                return;
            }
        };

        let frame = match Envelope::ResponseError(error).to_bytes() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Cannot encode ResponseError for {}: {}", request.request_id, e);
                return;
            }
        };
        if let Err(e) = self.transport.send(&next_hop, frame).await {
            warn!("Failed to send ResponseError for {} to {}: {}", request.request_id, next_hop, e);
        }
    }

    /// Hand a reply that reached this node to its waiting caller.
    ///
    /// Returns `false` for late, duplicate or unknown replies.
    pub fn complete(&self, envelope: Envelope) -> bool {
        match envelope {
            Envelope::Response(response) => {
                let request_id = response.request_id.clone();
                self.pending.complete(&request_id, Resolution::Response(response))
            }
            Envelope::RequestError(error) => {
                let request_id = error.request_id.clone();
                self.pending.complete(&request_id, Resolution::RequestError(error))
            }
            other => {
                debug!("{} {} is not a reply", other.kind(), other.request_id());
                false
            }
        }
    }

    /// Time out every request past its deadline
    pub fn expire_older_than(&self, now: Instant) -> Vec<RequestId> {
        self.pending.expire_older_than(now)
    }

    /// Periodically expire overdue requests until the adapter is dropped
    pub fn spawn_expiry_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let outbound = Arc::downgrade(self);
        let every = every.max(Duration::from_millis(10));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(outbound) = outbound.upgrade() else {
                    break;
                };
                let expired = outbound.expire_older_than(Instant::now());
                if !expired.is_empty() {
                    info!("Expired {} pending request(s)", expired.len());
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::RequestState;
    use crate::signature::{KeyRing, SignaturePolicy, SignaturePolicyRule};
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use tokio::sync::{mpsc, oneshot};

    /// Records frames; optionally fails every send
    struct RecordingTransport {
        frames: mpsc::UnboundedSender<(String, Vec<u8>)>,
        fail: bool,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, next_hop: &str, frame: Vec<u8>) -> Result<(), TransportError> {
            if self.fail {
                return Err(TransportError::NotConnected(next_hop.to_string()));
            }
            let _ = self.frames.send((next_hop.to_string(), frame));
            Ok(())
        }
    }

    /// Answers every request before `send` returns
    #[derive(Default)]
    struct InstantReplyTransport {
        outbound: Mutex<Option<Arc<OutboundAdapter>>>,
    }

    #[async_trait]
    impl Transport for InstantReplyTransport {
        async fn send(&self, _next_hop: &str, frame: Vec<u8>) -> Result<(), TransportError> {
            let request: Request = serde_json::from_slice(&frame).map_err(|e| TransportError::Io(e.to_string()))?;
            let outbound = self.outbound.lock().clone();
            if let Some(outbound) = outbound {
                let mut response = Response::for_request(&request, json!({"status": "Accepted"}));
                response.network_path = NetworkPath::from(vec!["A"]);
                assert!(outbound.complete(Envelope::Response(response)));
            }
            Ok(())
        }
    }

    fn topology() -> Arc<TopologyManager> {
        Arc::new(TopologyManager::new("A", Some("CSMS".to_string())))
    }

    fn recording(fail: bool) -> (Arc<OutboundAdapter>, mpsc::UnboundedReceiver<(String, Vec<u8>)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let outbound = OutboundAdapter::new(
            topology(),
            Arc::new(SignatureEngine::permissive()),
            Arc::new(RecordingTransport { frames: tx, fail }),
            DEFAULT_REQUEST_TIMEOUT,
        );
        (Arc::new(outbound), rx)
    }

    fn ping(timeout: Duration) -> OutboundRequest {
        OutboundRequest::new("Ping", Destination::Csms, json!({}))
            .unwrap()
            .with_timeout(timeout)
    }

    #[tokio::test]
    async fn test_reply_before_send_returns_is_correlated() {
        let transport = Arc::new(InstantReplyTransport::default());
        let outbound = Arc::new(OutboundAdapter::new(
            topology(),
            Arc::new(SignatureEngine::permissive()),
            transport.clone(),
            DEFAULT_REQUEST_TIMEOUT,
        ));
        *transport.outbound.lock() = Some(outbound.clone());

        let id = RequestId::from("fast-1");
        let response = outbound
            .send(ping(Duration::from_secs(5)).with_request_id(id.clone()))
            .await
            .unwrap();

        assert_eq!(response.request_id, id);
        assert!(outbound.pending().is_empty());
    }

    #[tokio::test]
    async fn test_transport_failure_resolves_immediately() {
        let (outbound, _frames) = recording(true);
        let err = outbound.send(ping(Duration::from_secs(60))).await.unwrap_err();

        assert!(matches!(err, SendError::Transport(_)));
        assert_eq!(err.code(), ResultCode::NetworkError);
        assert!(outbound.pending().is_empty());
    }

    #[tokio::test]
    async fn test_frame_carries_origin_in_path() {
        let (outbound, mut frames) = recording(false);
        let sender = outbound.clone();
        let call = tokio::spawn(async move { sender.send(ping(Duration::from_secs(60))).await });

        let (next_hop, frame) = frames.recv().await.unwrap();
        assert_eq!(next_hop, "CSMS");
        let request: Request = serde_json::from_slice(&frame).unwrap();
        assert_eq!(request.network_path, NetworkPath::from(vec!["A"]));
        assert_eq!(outbound.pending().state(&request.request_id), Some(RequestState::Pending));

        let error = ErrorFrame::request_error(
            request.request_id.clone(),
            NetworkPath::from(vec!["A"]),
            ResultCode::NotImplemented,
            "action Ping is not implemented",
        );
        assert!(outbound.complete(Envelope::RequestError(error.clone())));
        assert!(!outbound.complete(Envelope::RequestError(error)));

        match call.await.unwrap() {
            Err(SendError::Remote(remote)) => {
                assert_eq!(remote.code, ResultCode::NotImplemented);
                assert_eq!(remote.request_id, request.request_id);
                assert_eq!(remote.network_path, NetworkPath::from(vec!["A"]));
            }
            other => panic!("Expected remote error, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_leaves_other_requests_alone() {
        let (outbound, mut frames) = recording(false);

        let slow = {
            let outbound = outbound.clone();
            tokio::spawn(async move { outbound.send(ping(Duration::from_secs(1))).await })
        };
        let patient = {
            let outbound = outbound.clone();
            tokio::spawn(async move { outbound.send(ping(Duration::from_secs(60))).await })
        };

        let mut ids = Vec::new();
        for _ in 0..2 {
            let (_, frame) = frames.recv().await.unwrap();
            let request: Request = serde_json::from_slice(&frame).unwrap();
            ids.push(request);
        }

        assert!(matches!(slow.await.unwrap(), Err(SendError::TimedOut(_))));
        assert_eq!(outbound.pending().len(), 1);

        let survivor = ids
            .iter()
            .find(|r| outbound.pending().state(&r.request_id).is_some())
            .unwrap();
        let mut response = Response::for_request(survivor, json!({"status": "Accepted"}));
        response.network_path = NetworkPath::from(vec!["A"]);
        assert!(outbound.complete(Envelope::Response(response)));

        assert!(patient.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_cancel_releases_only_the_caller() {
        let (outbound, mut frames) = recording(false);
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();

        let sender = outbound.clone();
        let call = tokio::spawn(async move {
            sender
                .send_with_cancel(ping(Duration::from_secs(60)), async move {
                    let _ = cancel_rx.await;
                })
                .await
        });

        let (_, frame) = frames.recv().await.unwrap();
        let request: Request = serde_json::from_slice(&frame).unwrap();
        cancel_tx.send(()).unwrap();

        assert!(matches!(call.await.unwrap(), Err(SendError::Cancelled(id)) if id == request.request_id));
        assert!(outbound.pending().is_empty());

        // the late reply is dropped
        let response = Response::for_request(&request, json!({}));
        assert!(!outbound.complete(Envelope::Response(response)));
    }

    #[tokio::test]
    async fn test_unsigned_response_is_rejected() {
        let (tx, mut frames) = mpsc::unbounded_channel();
        let policy = SignaturePolicy::new().with_rule(
            SignaturePolicyRule::new("SecureOp")
                .requiring(1)
                .scoped(crate::signature::RuleScope::Responses),
        );
        let outbound = Arc::new(OutboundAdapter::new(
            topology(),
            Arc::new(SignatureEngine::new(policy, None, Arc::new(KeyRing::new()))),
            Arc::new(RecordingTransport { frames: tx, fail: false }),
            DEFAULT_REQUEST_TIMEOUT,
        ));

        let sender = outbound.clone();
        let call = tokio::spawn(async move {
            let request = OutboundRequest::new("SecureOp", Destination::node("CS9"), json!({})).unwrap();
            sender.send(request).await
        });

        let (_, frame) = frames.recv().await.unwrap();
        let request: Request = serde_json::from_slice(&frame).unwrap();
        let mut response = Response::for_request(&request, json!({"ok": true}));
        response.network_path = NetworkPath::from(vec!["A"]);
        outbound.complete(Envelope::Response(response));

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, SendError::Signature(SignatureError::InsufficientSignatures { .. })));

        let (next_hop, frame) = frames.recv().await.unwrap();
        assert_eq!(next_hop, "CSMS");
        match Envelope::classify(&frame).unwrap() {
            Envelope::ResponseError(e) => {
                assert_eq!(e.error_code, ResultCode::SignatureError);
                assert_eq!(e.destination, Some(Destination::node("CS9")));
            }
            other => panic!("Expected ResponseError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sending_to_self_is_refused() {
        let (outbound, _frames) = recording(false);
        let err = outbound
            .send(OutboundRequest::new("Ping", Destination::node("A"), json!({})).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::Routing(RoutingError::LocalDestination(_))));
    }
}
