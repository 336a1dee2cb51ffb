//! Configuration for a networking node

use std::time::Duration;

use crate::signature::{SignaturePolicy, SignaturePolicyRule};
use crate::types::NodeId;

/// Complete node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Stable identifier of this node in the mesh
    pub node_id: NodeId,

    /// Neighbor toward the CSMS; `None` on the CSMS itself
    pub uplink: Option<NodeId>,

    /// Default time to wait for a reply to an outbound request
    pub request_timeout: Duration,

    /// How often overdue pending requests are swept
    pub expiry_sweep_interval: Duration,

    /// Signing and verification rules
    pub signature_policy: SignaturePolicy,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "CSMS".to_string(),
            uplink: None,
            request_timeout: Duration::from_secs(30),
            expiry_sweep_interval: Duration::from_secs(1),
            signature_policy: SignaturePolicy::default(),
        }
    }
}

impl NodeConfig {
    /// Create config for a node with the given id
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    /// Set the uplink neighbor
    pub fn with_uplink(mut self, uplink: impl Into<NodeId>) -> Self {
        self.uplink = Some(uplink.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_expiry_sweep_interval(mut self, interval: Duration) -> Self {
        self.expiry_sweep_interval = interval;
        self
    }

    /// Replace the whole signature policy
    pub fn with_signature_policy(mut self, policy: SignaturePolicy) -> Self {
        self.signature_policy = policy;
        self
    }

    /// Add a single signature rule
    pub fn with_signature_rule(mut self, rule: SignaturePolicyRule) -> Self {
        self.signature_policy.rules.push(rule);
        self
    }

    /// Verify request signatures on relay hops too
    pub fn with_verify_at_relays(mut self, enabled: bool) -> Self {
        self.signature_policy.verify_at_relays = enabled;
        self
    }
}
