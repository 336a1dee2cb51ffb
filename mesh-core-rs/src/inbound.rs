//! Inbound adapter
//!
//! Turns one received frame into at most one outgoing frame:
//!
//! ```text
//! frame ─► classify ─► forward? ──relay──► Relay(next hop)
//!                         │
//!                       deliver
//!                         ▼
//!          codec lookup ─► parse ─► verify ─► [received] ─► processors
//!                                                              │
//!                          Reply(reversed path) ◄─ [sent] ◄─ sign
//! ```
//!
//! Every failure after classification becomes a `RequestError` frame sent
//! back along the reversed path; nothing escapes as a panic.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::{self, BoxFuture};
use futures_util::stream::{FuturesUnordered, StreamExt};
use futures_util::FutureExt;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::addressing::{self, reply_hop, Forwarding, NetworkPath};
use crate::codec::{ActionCodec, CodecRegistry, RequestContext, TypedRequest};
use crate::envelope::{Envelope, EnvelopeKind, ErrorFrame, FrameError, Request, Response};
use crate::events::{FrameRejected, Observers, RequestEvent, ResponseEvent};
use crate::signature::SignatureEngine;
use crate::topology::TopologyManager;
use crate::types::{now, NodeId, ResultCode};

/// Error type business processors may return
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

type ProcessorFn =
    dyn Fn(TypedRequest, RequestContext) -> BoxFuture<'static, Result<Option<Value>, HandlerError>> + Send + Sync;

/// A frame and the neighbor it goes to
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub next_hop: NodeId,
    pub envelope: Envelope,
}

impl Outgoing {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        self.envelope.to_bytes()
    }
}

/// What the node has to do after receiving a frame
#[derive(Debug, Clone, PartialEq)]
pub enum InboundOutcome {
    /// Answer produced here (response or request error)
    Reply(Outgoing),
    /// Frame addressed elsewhere
    Relay(Outgoing),
    /// Frame for a local caller: response, request error or response error
    Deliver(Envelope),
    /// Nothing to send
    Drop,
}

enum Dispatch {
    Handled(Value),
    NoResult,
    Exception(String),
}

/// Receives frames, dispatches requests to processors, produces replies
pub struct InboundAdapter {
    topology: Arc<TopologyManager>,
    codecs: Arc<CodecRegistry>,
    signatures: Arc<SignatureEngine>,
    processors: RwLock<HashMap<String, Vec<Arc<ProcessorFn>>>>,
    request_received: Observers<RequestEvent>,
    response_sent: Observers<ResponseEvent>,
    response_error_received: Observers<ErrorFrame>,
    frame_rejected: Observers<FrameRejected>,
}

impl InboundAdapter {
    pub fn new(
        topology: Arc<TopologyManager>,
        codecs: Arc<CodecRegistry>,
        signatures: Arc<SignatureEngine>,
    ) -> Self {
        Self {
            topology,
            codecs,
            signatures,
            processors: RwLock::new(HashMap::new()),
            request_received: Observers::new("request received"),
            response_sent: Observers::new("response sent"),
            response_error_received: Observers::new("response error received"),
            frame_rejected: Observers::new("frame rejected"),
        }
    }

    /// Register a business processor for action `A`.
    ///
    /// Several processors may serve one action; they run concurrently and the
    /// first `Ok(Some(_))` becomes the response. `Ok(None)` means "not mine".
    pub fn on_request<A, F, Fut>(&self, handler: F)
    where
        A: ActionCodec,
        F: Fn(Arc<A::Request>, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<A::Response>, HandlerError>> + Send + 'static,
    {
        self.codecs.ensure::<A>();

        let processor = move |typed: TypedRequest, ctx: RequestContext| match typed.downcast::<A::Request>() {
            Ok(request) => {
                let pending = handler(request, ctx);
                async move {
                    let result: Result<Option<Value>, HandlerError> = match pending.await {
                        Ok(Some(response)) => A::to_json(&response).map(Some).map_err(Into::into),
                        Ok(None) => Ok(None),
                        Err(e) => Err(e),
                    };
                    result
                }
                .boxed()
            }
            Err(_) => future::ready(Err::<Option<Value>, HandlerError>(
                format!("{} codec produced a foreign request type", A::ACTION).into(),
            ))
            .boxed(),
        };

        self.processors
            .write()
            .entry(A::ACTION.to_string())
            .or_default()
            .push(Arc::new(processor));
    }

    pub fn processor_count(&self, action: &str) -> usize {
        self.processors.read().get(action).map_or(0, Vec::len)
    }

    /// Fired once a request passed parsing and verification
    pub fn request_received(&self) -> &Observers<RequestEvent> {
        &self.request_received
    }

    /// Fired for every reply produced after a request was received
    pub fn response_sent(&self) -> &Observers<ResponseEvent> {
        &self.response_sent
    }

    /// Fired when a ResponseError addressed to this node arrives
    pub fn response_error_received(&self) -> &Observers<ErrorFrame> {
        &self.response_error_received
    }

    /// Fired when a frame is dropped because no error reply can be addressed
    pub fn frame_rejected(&self) -> &Observers<FrameRejected> {
        &self.frame_rejected
    }

    /// Process one frame received from neighbor `from`.
    ///
    /// `Err` only when the frame is so broken that nothing can be answered.
    pub async fn receive(&self, from: &str, frame: &[u8]) -> Result<InboundOutcome, FrameError> {
        let envelope = match Envelope::classify(frame) {
            Ok(envelope) => envelope,
            Err(e) => return self.formation_violation(from, frame.len(), e),
        };

        match envelope {
            Envelope::Request(request) => Ok(self.handle_request(from, request).await),
            Envelope::ResponseError(error) => Ok(self.handle_response_error(error)),
            other => Ok(self.route_back(other)),
        }
    }

    fn formation_violation(&self, from: &str, frame_len: usize, error: FrameError) -> Result<InboundOutcome, FrameError> {
        let answerable = matches!(
            error,
            FrameError::Unclassifiable { .. }
                | FrameError::Malformed {
                    kind: EnvelopeKind::Request,
                    ..
                }
        );
        let Some(request_id) = error.request_id().filter(|_| answerable).cloned() else {
            warn!("Unanswerable frame from {}: {}", from, error);
            self.frame_rejected.publish(FrameRejected {
                timestamp: now(),
                from: from.to_string(),
                reason: error.to_string(),
                frame_len,
            });
            return Err(error);
        };

        warn!("Formation violation in frame {} from {}: {}", request_id, from, error);
        let reply_path = match error.network_path() {
            Some(path) if !path.is_empty() => path.reversed(),
            _ => NetworkPath::from_origin(from),
        };
        let frame = ErrorFrame::request_error(
            request_id,
            reply_path,
            ResultCode::FormationViolation,
            error.to_string(),
        );
        Ok(InboundOutcome::Reply(self.reply(from, Envelope::RequestError(frame))))
    }

    async fn handle_request(&self, from: &str, request: Request) -> InboundOutcome {
        let started = Instant::now();
        let local = self.topology.local_id();

        // every forwarding hop appends itself, so the tail is the sending link
        if request.network_path.last_hop().map(String::as_str) != Some(from) {
            warn!(
                "Request {} from {} claims path {:?}",
                request.request_id, from, request.network_path
            );
            let frame = ErrorFrame::request_error(
                request.request_id.clone(),
                NetworkPath::from_origin(from),
                ResultCode::FormationViolation,
                format!("network path {:?} does not end with sending node {}", request.network_path.hops(), from),
            );
            return InboundOutcome::Reply(Outgoing {
                next_hop: from.to_string(),
                envelope: Envelope::RequestError(frame),
            });
        }

        if request.network_path.contains(local) {
            warn!("Request {} looped back to {} via {:?}", request.request_id, local, request.network_path);
            return self.reject(from, &request, ResultCode::NetworkError, format!("routing loop at {}", local), json!({}));
        }

        match addressing::forward(&request.destination, &request.network_path, &self.topology) {
            Err(e) => {
                warn!("Cannot route {} {}: {}", request.action, request.request_id, e);
                return self.reject(from, &request, ResultCode::NetworkError, e.to_string(), json!({}));
            }
            Ok(Forwarding::RelayTo { next_hop, network_path }) => {
                if self.signatures.policy().verify_at_relays {
                    if let Err(e) = self.signatures.verify_request(&request) {
                        warn!("Refusing to relay {} {}: {}", request.action, request.request_id, e);
                        return self.reject(from, &request, ResultCode::SignatureError, e.to_string(), json!({}));
                    }
                }
                debug!("Relaying {} {} to {}", request.action, request.request_id, next_hop);
                let mut relayed = request;
                relayed.network_path = network_path;
                return InboundOutcome::Relay(Outgoing {
                    next_hop,
                    envelope: Envelope::Request(relayed),
                });
            }
            Ok(Forwarding::Deliver) => {}
        }

        let ctx = RequestContext::received(&request, from);

        let Some(codec) = self.codecs.get(&request.action) else {
            warn!("No codec for action {}", request.action);
            return self.reject(
                from,
                &request,
                ResultCode::CouldNotParse,
                format!("could not parse {} payload: unknown action", request.action),
                json!({ "action": request.action, "reason": "unknown action" }),
            );
        };

        let typed = match codec.try_parse(&request.payload, &ctx) {
            Ok(typed) => typed,
            Err(reason) => {
                warn!("Could not parse {} payload of {}: {}", request.action, request.request_id, reason);
                return self.reject(
                    from,
                    &request,
                    ResultCode::CouldNotParse,
                    format!("could not parse {} payload: {}", request.action, reason),
                    json!({ "action": request.action, "reason": reason }),
                );
            }
        };

        if let Err(e) = self.signatures.verify_request(&request) {
            warn!("Signature check failed for {} {}: {}", request.action, request.request_id, e);
            return self.reject(from, &request, ResultCode::SignatureError, e.to_string(), json!({}));
        }

        self.request_received.publish(RequestEvent {
            timestamp: now(),
            request_id: request.request_id.clone(),
            action: request.action.clone(),
            destination: request.destination.clone(),
            network_path: request.network_path.clone(),
            payload: request.payload.clone(),
        });

        let outcome = match self.dispatch(&request.action, typed, ctx).await {
            Dispatch::Handled(payload) => self.respond(from, &request, payload),
            Dispatch::NoResult => self.reject(
                from,
                &request,
                ResultCode::Failed,
                format!("no processor produced a result for {}", request.action),
                json!({}),
            ),
            Dispatch::Exception(message) => self.reject(
                from,
                &request,
                ResultCode::ExceptionOccurred,
                message,
                json!({}),
            ),
        };

        if let InboundOutcome::Reply(out) = &outcome {
            let (result, payload) = match &out.envelope {
                Envelope::Response(r) => (ResultCode::Ok, r.payload.clone()),
                Envelope::RequestError(e) => (e.error_code.clone(), e.error_details.clone()),
                _ => (ResultCode::GenericError, Value::Null),
            };
            self.response_sent.publish(ResponseEvent {
                timestamp: now(),
                request_id: request.request_id.clone(),
                action: request.action.clone(),
                network_path: out.envelope.network_path().clone(),
                result,
                payload,
                runtime: started.elapsed(),
            });
        }

        outcome
    }

    fn respond(&self, from: &str, request: &Request, payload: Value) -> InboundOutcome {
        let mut response = Response::for_request(request, payload);
        if let Err(e) = self.signatures.sign_response(&request.action, &mut response) {
            warn!("Cannot sign response to {} {}: {}", request.action, request.request_id, e);
            return self.reject(from, request, ResultCode::SignatureError, e.to_string(), json!({}));
        }
        debug!("Answering {} {}", request.action, request.request_id);
        InboundOutcome::Reply(self.reply(from, Envelope::Response(response)))
    }

    fn reject(
        &self,
        from: &str,
        request: &Request,
        code: ResultCode,
        description: impl Into<String>,
        details: Value,
    ) -> InboundOutcome {
        let frame = ErrorFrame::request_error(
            request.request_id.clone(),
            request.network_path.reversed(),
            code,
            description,
        )
        .with_details(details);
        InboundOutcome::Reply(self.reply(from, Envelope::RequestError(frame)))
    }

    fn reply(&self, from: &str, envelope: Envelope) -> Outgoing {
        let next_hop = reply_hop(envelope.network_path())
            .cloned()
            .unwrap_or_else(|| from.to_string());
        Outgoing { next_hop, envelope }
    }

    async fn dispatch(&self, action: &str, typed: TypedRequest, ctx: RequestContext) -> Dispatch {
        let processors = self.processors.read().get(action).cloned().unwrap_or_default();
        if processors.is_empty() {
            warn!("No processor registered for {}", action);
            return Dispatch::NoResult;
        }

        let mut running: FuturesUnordered<_> = processors
            .into_iter()
            .map(|processor| {
                let typed = typed.clone();
                let ctx = ctx.clone();
                tokio::spawn(async move { processor(typed, ctx).await })
            })
            .collect();

        let mut failure: Option<String> = None;
        while let Some(joined) = running.next().await {
            match joined {
                // remaining processors keep running, their results are discarded
                Ok(Ok(Some(payload))) => return Dispatch::Handled(payload),
                Ok(Ok(None)) => {}
                Ok(Err(e)) => {
                    warn!("Processor for {} failed: {}", action, e);
                    failure.get_or_insert_with(|| e.to_string());
                }
                Err(e) => {
                    warn!("Processor for {} panicked: {}", action, e);
                    failure.get_or_insert_with(|| format!("processor for {} panicked", action));
                }
            }
        }

        match failure {
            Some(message) => Dispatch::Exception(message),
            None => Dispatch::NoResult,
        }
    }

    fn route_back(&self, envelope: Envelope) -> InboundOutcome {
        match addressing::route_back(envelope.network_path(), self.topology.local_id()) {
            Ok(Forwarding::Deliver) => InboundOutcome::Deliver(envelope),
            Ok(Forwarding::RelayTo { next_hop, .. }) => {
                debug!("Passing {} {} back to {}", envelope.kind(), envelope.request_id(), next_hop);
                InboundOutcome::Relay(Outgoing { next_hop, envelope })
            }
            Err(e) => {
                warn!("Dropping {} {}: {}", envelope.kind(), envelope.request_id(), e);
                InboundOutcome::Drop
            }
        }
    }

    fn handle_response_error(&self, error: ErrorFrame) -> InboundOutcome {
        let Some(destination) = error.destination.clone() else {
            return InboundOutcome::Drop;
        };

        match addressing::forward(&destination, &error.network_path, &self.topology) {
            Ok(Forwarding::Deliver) => {
                info!(
                    "Response to {} was rejected by the caller: {} {}",
                    error.request_id, error.error_code, error.error_description
                );
                self.response_error_received.publish(error.clone());
                InboundOutcome::Deliver(Envelope::ResponseError(error))
            }
            Ok(Forwarding::RelayTo { next_hop, network_path }) => {
                let mut relayed = error;
                relayed.network_path = network_path;
                InboundOutcome::Relay(Outgoing {
                    next_hop,
                    envelope: Envelope::ResponseError(relayed),
                })
            }
            Err(e) => {
                warn!("Dropping ResponseError {}: {}", error.request_id, e);
                InboundOutcome::Drop
            }
        }
    }
}
