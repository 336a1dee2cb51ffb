//! EK Mesh Core Library
//!
//! Message routing and adapter layer for charging stations that reach the
//! CSMS through an overlay mesh of relaying nodes.
//!
//! ```text
//!   caller ─► OutboundAdapter ─► sign ─► Transport ─► relay ... relay ─►┐
//!                 ▲                                                     │
//!                 │ correlate (PendingRequests)                         ▼
//!   Transport ◄── relay ... relay ◄── sign ◄── processors ◄── InboundAdapter
//! ```
//!
//! Every hop appends itself to the request's network path; replies walk the
//! reversed path back. Forwarding decisions come from the [`TopologyManager`].

pub mod addressing;
pub mod codec;
pub mod config;
pub mod envelope;
pub mod events;
pub mod inbound;
pub mod messages;
pub mod node;
pub mod outbound;
pub mod pending;
pub mod signature;
pub mod topology;
pub mod transport;
pub mod types;

pub use addressing::{Destination, Forwarding, NetworkPath, RoutingError};
pub use codec::{ActionCodec, CodecRegistry, RequestContext};
pub use config::NodeConfig;
pub use envelope::{Envelope, EnvelopeKind, ErrorFrame, FrameError, Request, Response};
pub use events::{FrameRejected, ObserverError, Observers, RequestEvent, ResponseEvent};
pub use inbound::{HandlerError, InboundAdapter, InboundOutcome, Outgoing};
pub use node::{NetworkingNode, NodeBuilder};
pub use outbound::{OutboundAdapter, OutboundRequest, RemoteError, SendError};
pub use pending::{PendingError, PendingRequests, RequestState, Resolution};
pub use signature::{
    Ed25519Signer, KeyRing, SignatureEngine, SignatureError, SignaturePolicy, SignaturePolicyRule, Signer, Verifier,
};
pub use topology::TopologyManager;
pub use transport::{MemoryHub, Transport, TransportError};
pub use types::*;
