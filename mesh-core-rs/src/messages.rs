//! Built-in message schemas handled by every networking node
//!
//! - `Ping`: liveness check, `{}` -> `{"status": "Accepted"}`
//! - `NotifyNetworkTopology`: a neighbor advertises what is reachable through it

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::{ActionCodec, RequestContext};
use crate::types::NodeId;

/// Generic status for acknowledgements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum GenericStatus {
    Accepted,
    Rejected,
}

/// Additional status details
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusInfo {
    pub reason_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_info: Option<String>,
}

/// Ping request (empty)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingRequest {}

/// Ping response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingResponse {
    pub status: GenericStatus,
}

pub struct Ping;

impl ActionCodec for Ping {
    const ACTION: &'static str = "Ping";
    type Request = PingRequest;
    type Response = PingResponse;
}

/// Topology advertisement from a direct neighbor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyNetworkTopologyRequest {
    /// Every node reachable through the advertising neighbor
    pub reachable_nodes: Vec<NodeId>,
    pub advertised_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyNetworkTopologyResponse {
    pub status: GenericStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_info: Option<StatusInfo>,
}

impl NotifyNetworkTopologyResponse {
    pub fn accepted() -> Self {
        Self {
            status: GenericStatus::Accepted,
            status_info: None,
        }
    }

    pub fn rejected(reason_code: impl Into<String>, additional_info: impl Into<String>) -> Self {
        Self {
            status: GenericStatus::Rejected,
            status_info: Some(StatusInfo {
                reason_code: reason_code.into(),
                additional_info: Some(additional_info.into()),
            }),
        }
    }
}

pub struct NotifyNetworkTopology;

impl ActionCodec for NotifyNetworkTopology {
    const ACTION: &'static str = "NotifyNetworkTopology";
    type Request = NotifyNetworkTopologyRequest;
    type Response = NotifyNetworkTopologyResponse;

    fn try_parse(payload: &Value, ctx: &RequestContext) -> Result<Self::Request, String> {
        if ctx.network_path.len() != 1 || ctx.network_path.origin() != Some(&ctx.received_from) {
            return Err(format!(
                "topology advertisements must come from a direct neighbor, path was {:?}",
                ctx.network_path.hops()
            ));
        }
        let request: NotifyNetworkTopologyRequest =
            serde_json::from_value(payload.clone()).map_err(|e| e.to_string())?;
        if request.reachable_nodes.iter().any(|n| n.trim().is_empty()) {
            return Err("reachableNodes must not contain empty node ids".to_string());
        }
        Ok(request)
    }
}
