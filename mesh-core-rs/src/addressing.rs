//! Overlay addressing
//!
//! A request records every hop it traverses in its [`NetworkPath`] and names
//! its final target with a [`Destination`]. Responses and request errors carry
//! the reversed path and walk it hop by hop back to the origin.
//!
//! ```text
//!  request:   A ──► B ──► CSMS        path at CSMS: [A, B]
//!  response:  A ◄── B ◄── CSMS        path on wire: [B, A]
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::topology::TopologyManager;
use crate::types::{NodeId, CSMS_DESTINATION};

/// Errors raised while resolving where a frame goes next
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("node {0} is already on the network path")]
    Cycle(NodeId),

    #[error("destination {0} is unreachable from {1}")]
    Unreachable(String, NodeId),

    #[error("node {0} is not on the response path {1:?}")]
    NotOnPath(NodeId, Vec<NodeId>),

    #[error("destination {0} is the local node")]
    LocalDestination(String),
}

/// Ordered, append-only record of the hops a message has traversed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkPath(Vec<NodeId>);

impl NetworkPath {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Path of a message that has only been seen by its origin
    pub fn from_origin(origin: impl Into<NodeId>) -> Self {
        Self(vec![origin.into()])
    }

    /// Append a hop. Fails if the node is already on the path.
    pub fn append(&mut self, node_id: impl Into<NodeId>) -> Result<(), RoutingError> {
        let node_id = node_id.into();
        if self.contains(&node_id) {
            return Err(RoutingError::Cycle(node_id));
        }
        self.0.push(node_id);
        Ok(())
    }

    /// Copy of this path with one more hop appended
    pub fn with_hop(&self, node_id: impl Into<NodeId>) -> Result<Self, RoutingError> {
        let mut path = self.clone();
        path.append(node_id)?;
        Ok(path)
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.0.iter().any(|hop| hop == node_id)
    }

    /// First entry: the sender of a request, or the next hop of a response
    pub fn origin(&self) -> Option<&NodeId> {
        self.0.first()
    }

    pub fn last_hop(&self) -> Option<&NodeId> {
        self.0.last()
    }

    pub fn hops(&self) -> &[NodeId] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The path a reply must walk to get back to the origin
    pub fn reversed(&self) -> Self {
        Self(self.0.iter().rev().cloned().collect())
    }

    /// First duplicated hop, if the path was received with a loop in it
    pub fn find_cycle(&self) -> Option<&NodeId> {
        self.0
            .iter()
            .enumerate()
            .find(|(i, hop)| self.0[..*i].contains(hop))
            .map(|(_, hop)| hop)
    }
}

impl From<Vec<NodeId>> for NetworkPath {
    fn from(hops: Vec<NodeId>) -> Self {
        Self(hops)
    }
}

impl From<Vec<&str>> for NetworkPath {
    fn from(hops: Vec<&str>) -> Self {
        Self(hops.into_iter().map(String::from).collect())
    }
}

/// Where a request is ultimately headed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "WireDestination", into = "WireDestination")]
pub enum Destination {
    /// The central system, reached through the uplink chain
    Csms,
    /// A single node, resolved hop by hop through the topology table
    Node(NodeId),
    /// Explicit list of remaining hops; the last entry is the final target
    Path(Vec<NodeId>),
}

impl Destination {
    pub fn node(node_id: impl Into<NodeId>) -> Self {
        Destination::Node(node_id.into())
    }

    pub fn path<I, S>(hops: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        Destination::Path(hops.into_iter().map(Into::into).collect())
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Destination::Csms => f.write_str(CSMS_DESTINATION),
            Destination::Node(id) => f.write_str(id),
            Destination::Path(hops) => write!(f, "[{}]", hops.join(" -> ")),
        }
    }
}

/// On the wire a destination is either a string or an array of hops
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum WireDestination {
    Single(String),
    Hops(Vec<String>),
}

impl From<WireDestination> for Destination {
    fn from(wire: WireDestination) -> Self {
        match wire {
            WireDestination::Single(s) if s == CSMS_DESTINATION => Destination::Csms,
            WireDestination::Single(s) => Destination::Node(s),
            WireDestination::Hops(hops) => Destination::Path(hops),
        }
    }
}

impl From<Destination> for WireDestination {
    fn from(dest: Destination) -> Self {
        match dest {
            Destination::Csms => WireDestination::Single(CSMS_DESTINATION.to_string()),
            Destination::Node(id) => WireDestination::Single(id),
            Destination::Path(hops) => WireDestination::Hops(hops),
        }
    }
}

/// Forwarding decision for a frame held by the local node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Forwarding {
    /// Addressed to this node
    Deliver,
    /// Send to `next_hop` carrying `network_path`
    RelayTo {
        next_hop: NodeId,
        network_path: NetworkPath,
    },
}

/// Resolve a destination-addressed frame (request or response error).
///
/// On relay the local node is appended to the path; a next hop that is
/// already on the path is refused so frames never bounce back and forth.
pub fn forward(
    destination: &Destination,
    network_path: &NetworkPath,
    topology: &TopologyManager,
) -> Result<Forwarding, RoutingError> {
    let local = topology.local_id();

    let next_hop = match destination {
        Destination::Node(target) if target == local => return Ok(Forwarding::Deliver),
        Destination::Node(target) => topology
            .next_hop_for(target)
            .ok_or_else(|| RoutingError::Unreachable(target.clone(), local.to_string()))?,

        Destination::Csms => match topology.uplink() {
            None => return Ok(Forwarding::Deliver),
            Some(uplink) => uplink,
        },

        Destination::Path(hops) => {
            let remaining = match hops.iter().position(|hop| hop == local) {
                Some(i) => &hops[i + 1..],
                None => &hops[..],
            };
            let Some(next) = remaining.first() else {
                return Ok(Forwarding::Deliver);
            };
            topology
                .next_hop_for(next)
                .ok_or_else(|| RoutingError::Unreachable(next.clone(), local.to_string()))?
        }
    };

    if network_path.contains(&next_hop) {
        return Err(RoutingError::Cycle(next_hop));
    }

    Ok(Forwarding::RelayTo {
        next_hop,
        network_path: network_path.with_hop(local)?,
    })
}

/// Resolve a path-routed frame (response or request error) on its way back.
///
/// The path is the reversed request path; the local node finds itself on it
/// and hands the frame to the following entry. The last entry is the origin.
pub fn route_back(network_path: &NetworkPath, local: &str) -> Result<Forwarding, RoutingError> {
    if network_path.is_empty() {
        return Ok(Forwarding::Deliver);
    }

    let hops = network_path.hops();
    match hops.iter().position(|hop| hop == local) {
        Some(i) if i + 1 == hops.len() => Ok(Forwarding::Deliver),
        Some(i) => Ok(Forwarding::RelayTo {
            next_hop: hops[i + 1].clone(),
            network_path: network_path.clone(),
        }),
        None => Err(RoutingError::NotOnPath(local.to_string(), hops.to_vec())),
    }
}

/// First hop of a reply leaving the responder
pub fn reply_hop(reply_path: &NetworkPath) -> Option<&NodeId> {
    reply_path.origin()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topo(local: &str, uplink: Option<&str>) -> TopologyManager {
        TopologyManager::new(local, uplink.map(String::from))
    }

    #[test]
    fn test_append_rejects_cycle() {
        let mut path = NetworkPath::from_origin("A");
        path.append("B").unwrap();

        assert_eq!(path.append("A"), Err(RoutingError::Cycle("A".to_string())));
        assert_eq!(path.hops(), &["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn test_reversed_path() {
        let path = NetworkPath::from(vec!["A", "B", "C"]);
        assert_eq!(path.reversed(), NetworkPath::from(vec!["C", "B", "A"]));
        assert_eq!(path.reversed().reversed(), path);
    }

    #[test]
    fn test_find_cycle() {
        assert_eq!(NetworkPath::from(vec!["A", "B"]).find_cycle(), None);
        assert_eq!(
            NetworkPath::from(vec!["A", "B", "A"]).find_cycle(),
            Some(&"A".to_string())
        );
    }

    #[test]
    fn test_destination_wire_format() {
        let csms: Destination = serde_json::from_str("\"CSMS\"").unwrap();
        assert_eq!(csms, Destination::Csms);

        let node: Destination = serde_json::from_str("\"CS001\"").unwrap();
        assert_eq!(node, Destination::node("CS001"));

        let path: Destination = serde_json::from_str(r#"["B", "C"]"#).unwrap();
        assert_eq!(path, Destination::path(["B", "C"]));

        assert_eq!(serde_json::to_string(&Destination::Csms).unwrap(), "\"CSMS\"");
        assert_eq!(
            serde_json::to_string(&Destination::path(["B", "C"])).unwrap(),
            r#"["B","C"]"#
        );
    }

    #[test]
    fn test_forward_to_csms_via_uplink() {
        let b = topo("B", Some("CSMS-1"));
        let path = NetworkPath::from_origin("A");

        let decision = forward(&Destination::Csms, &path, &b).unwrap();
        assert_eq!(
            decision,
            Forwarding::RelayTo {
                next_hop: "CSMS-1".to_string(),
                network_path: NetworkPath::from(vec!["A", "B"]),
            }
        );

        let root = topo("CSMS-1", None);
        assert_eq!(forward(&Destination::Csms, &path, &root).unwrap(), Forwarding::Deliver);
    }

    #[test]
    fn test_forward_local_node() {
        let b = topo("B", None);
        let path = NetworkPath::from_origin("A");
        assert_eq!(forward(&Destination::node("B"), &path, &b).unwrap(), Forwarding::Deliver);
    }

    #[test]
    fn test_forward_unreachable_at_root() {
        let root = topo("CSMS", None);
        let path = NetworkPath::new();
        let err = forward(&Destination::node("Y"), &path, &root).unwrap_err();
        assert!(matches!(err, RoutingError::Unreachable(ref d, _) if d == "Y"));
    }

    #[test]
    fn test_forward_refuses_bounce_to_previous_hop() {
        // Unknown target at B, default route is the uplink the frame came from
        let b = topo("B", Some("CSMS"));
        let path = NetworkPath::from_origin("CSMS");
        let err = forward(&Destination::node("Y"), &path, &b).unwrap_err();
        assert_eq!(err, RoutingError::Cycle("CSMS".to_string()));
    }

    #[test]
    fn test_forward_explicit_path() {
        let b = topo("B", None);
        b.add_neighbor("C");

        let path = NetworkPath::from_origin("A");
        let dest = Destination::path(["B", "C"]);
        match forward(&dest, &path, &b).unwrap() {
            Forwarding::RelayTo { next_hop, network_path } => {
                assert_eq!(next_hop, "C");
                assert_eq!(network_path, NetworkPath::from(vec!["A", "B"]));
            }
            other => panic!("Expected relay, got {:?}", other),
        }

        // Remaining path exhausted at the last hop
        let c = topo("C", None);
        let path = NetworkPath::from(vec!["A", "B"]);
        assert_eq!(forward(&dest, &path, &c).unwrap(), Forwarding::Deliver);
    }

    #[test]
    fn test_route_back_walks_reversed_path() {
        let reply_path = NetworkPath::from(vec!["B", "A"]);

        assert_eq!(reply_hop(&reply_path), Some(&"B".to_string()));

        match route_back(&reply_path, "B").unwrap() {
            Forwarding::RelayTo { next_hop, network_path } => {
                assert_eq!(next_hop, "A");
                assert_eq!(network_path, reply_path);
            }
            other => panic!("Expected relay, got {:?}", other),
        }

        assert_eq!(route_back(&reply_path, "A").unwrap(), Forwarding::Deliver);
        assert!(matches!(
            route_back(&reply_path, "X"),
            Err(RoutingError::NotOnPath(_, _))
        ));
    }
}
