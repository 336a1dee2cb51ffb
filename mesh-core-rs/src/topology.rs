//! Topology table for the overlay mesh
//!
//! Each node keeps one entry per directly connected neighbor listing the
//! descendants that neighbor advertised as reachable through it. The table
//! answers the forwarding question "which neighbor do I hand this to?".
//!
//! Lookup order for a target node:
//! 1. the target is a direct neighbor
//! 2. a neighbor advertised the target as a descendant (newest advertisement wins)
//! 3. the uplink (default route toward the CSMS), if any

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::types::NodeId;

/// Rejected topology advertisements
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    #[error("invalid node id in advertisement: {0:?}")]
    InvalidNodeId(String),

    #[error("advertisement from {0} lists the receiving node")]
    ContainsLocalNode(NodeId),

    #[error("advertisement from {0} lists itself as a descendant")]
    SelfReference(NodeId),

    #[error("advertisement from {0} lists {1} more than once")]
    Duplicate(NodeId, NodeId),
}

/// Reachability advertised by one neighbor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyEntry {
    pub node_id: NodeId,
    pub reachable_descendants: Vec<NodeId>,
    pub advertised_at: DateTime<Utc>,
}

/// Result of applying an advertisement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvertisementOutcome {
    Applied {
        added: Vec<NodeId>,
        removed: Vec<NodeId>,
    },
    /// Older than the entry already held; ignored
    Stale,
}

/// Per-node view of reachable descendants
pub struct TopologyManager {
    local_id: NodeId,
    uplink: RwLock<Option<NodeId>>,
    entries: RwLock<HashMap<NodeId, TopologyEntry>>,
}

impl TopologyManager {
    pub fn new(local_id: impl Into<NodeId>, uplink: Option<NodeId>) -> Self {
        Self {
            local_id: local_id.into(),
            uplink: RwLock::new(uplink),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Default route toward the CSMS; `None` on the root node
    pub fn uplink(&self) -> Option<NodeId> {
        self.uplink.read().clone()
    }

    pub fn set_uplink(&self, uplink: Option<NodeId>) {
        *self.uplink.write() = uplink;
    }

    /// Register a directly connected neighbor (no-op if already known)
    pub fn add_neighbor(&self, node_id: impl Into<NodeId>) {
        let node_id = node_id.into();
        let mut entries = self.entries.write();
        if !entries.contains_key(&node_id) {
            debug!("Topology: neighbor {} connected", node_id);
            entries.insert(
                node_id.clone(),
                TopologyEntry {
                    node_id,
                    reachable_descendants: Vec::new(),
                    advertised_at: DateTime::<Utc>::MIN_UTC,
                },
            );
        }
    }

    /// Drop a neighbor together with everything reachable through it
    pub fn remove_neighbor(&self, node_id: &str) -> Option<TopologyEntry> {
        let removed = self.entries.write().remove(node_id);
        if let Some(entry) = &removed {
            info!(
                "Topology: neighbor {} gone ({} descendants unreachable)",
                node_id,
                entry.reachable_descendants.len()
            );
        }
        removed
    }

    /// Replace the entry for `neighbor` with a newer advertisement
    pub fn apply_advertisement(
        &self,
        neighbor: &str,
        descendants: Vec<NodeId>,
        advertised_at: DateTime<Utc>,
    ) -> Result<AdvertisementOutcome, TopologyError> {
        self.validate(neighbor, &descendants)?;

        let mut entries = self.entries.write();

        let previous = match entries.get(neighbor) {
            Some(existing) if existing.advertised_at > advertised_at => {
                debug!(
                    "Topology: stale advertisement from {} ({} < {})",
                    neighbor, advertised_at, existing.advertised_at
                );
                return Ok(AdvertisementOutcome::Stale);
            }
            Some(existing) => existing.reachable_descendants.clone(),
            None => Vec::new(),
        };

        let before: HashSet<&NodeId> = previous.iter().collect();
        let after: HashSet<&NodeId> = descendants.iter().collect();
        let mut added: Vec<NodeId> = after.difference(&before).map(|n| (*n).clone()).collect();
        let mut removed: Vec<NodeId> = before.difference(&after).map(|n| (*n).clone()).collect();
        added.sort();
        removed.sort();

        info!(
            "Topology: {} advertises {} descendants (+{} -{})",
            neighbor,
            descendants.len(),
            added.len(),
            removed.len()
        );

        entries.insert(
            neighbor.to_string(),
            TopologyEntry {
                node_id: neighbor.to_string(),
                reachable_descendants: descendants,
                advertised_at,
            },
        );

        Ok(AdvertisementOutcome::Applied { added, removed })
    }

    fn validate(&self, neighbor: &str, descendants: &[NodeId]) -> Result<(), TopologyError> {
        if neighbor.trim().is_empty() || neighbor == self.local_id {
            return Err(TopologyError::InvalidNodeId(neighbor.to_string()));
        }

        let mut seen = HashSet::new();
        for node in descendants {
            if node.trim().is_empty() {
                return Err(TopologyError::InvalidNodeId(node.clone()));
            }
            if node == &self.local_id {
                warn!("Topology: {} advertised us as its descendant", neighbor);
                return Err(TopologyError::ContainsLocalNode(neighbor.to_string()));
            }
            if node == neighbor {
                return Err(TopologyError::SelfReference(neighbor.to_string()));
            }
            if !seen.insert(node) {
                return Err(TopologyError::Duplicate(neighbor.to_string(), node.clone()));
            }
        }
        Ok(())
    }

    /// Neighbor to hand a frame for `target` to, if any
    pub fn next_hop_for(&self, target: &str) -> Option<NodeId> {
        let entries = self.entries.read();

        if entries.contains_key(target) {
            return Some(target.to_string());
        }

        let via = entries
            .values()
            .filter(|e| e.reachable_descendants.iter().any(|d| d == target))
            .max_by(|a, b| {
                a.advertised_at
                    .cmp(&b.advertised_at)
                    .then_with(|| b.node_id.cmp(&a.node_id))
            })
            .map(|e| e.node_id.clone());
        drop(entries);

        via.or_else(|| self.uplink())
    }

    /// Whether `target` is known below this node (excluding the default route)
    pub fn is_reachable(&self, target: &str) -> bool {
        let entries = self.entries.read();
        entries.contains_key(target)
            || entries
                .values()
                .any(|e| e.reachable_descendants.iter().any(|d| d == target))
    }

    /// Every node reachable below this one, for advertising to the uplink
    pub fn reachable_nodes(&self) -> Vec<NodeId> {
        let uplink = self.uplink();
        let entries = self.entries.read();

        let mut nodes: Vec<NodeId> = entries
            .values()
            .filter(|e| Some(&e.node_id) != uplink.as_ref())
            .flat_map(|e| std::iter::once(&e.node_id).chain(e.reachable_descendants.iter()))
            .filter(|n| Some(*n) != uplink.as_ref())
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        nodes.sort();
        nodes
    }

    pub fn neighbors(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.entries.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn entry(&self, neighbor: &str) -> Option<TopologyEntry> {
        self.entries.read().get(neighbor).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_advertisement_adds_descendants() {
        let topo = TopologyManager::new("CSMS", None);
        assert_eq!(topo.next_hop_for("Y"), None);

        let outcome = topo
            .apply_advertisement("X", vec!["Y".to_string()], Utc::now())
            .unwrap();
        assert_eq!(
            outcome,
            AdvertisementOutcome::Applied {
                added: vec!["Y".to_string()],
                removed: vec![],
            }
        );
        assert_eq!(topo.next_hop_for("Y"), Some("X".to_string()));
        assert_eq!(topo.next_hop_for("X"), Some("X".to_string()));
    }

    #[test]
    fn test_last_write_wins() {
        let topo = TopologyManager::new("CSMS", None);
        let t0 = Utc::now();

        topo.apply_advertisement("X", vec!["Y".into(), "Z".into()], t0).unwrap();

        // Older advertisement is ignored
        let stale = topo
            .apply_advertisement("X", vec![], t0 - Duration::seconds(5))
            .unwrap();
        assert_eq!(stale, AdvertisementOutcome::Stale);
        assert_eq!(topo.next_hop_for("Z"), Some("X".to_string()));

        // Newer one replaces the entry
        let outcome = topo
            .apply_advertisement("X", vec!["Y".into()], t0 + Duration::seconds(5))
            .unwrap();
        assert_eq!(
            outcome,
            AdvertisementOutcome::Applied {
                added: vec![],
                removed: vec!["Z".to_string()],
            }
        );
        assert_eq!(topo.next_hop_for("Z"), None);
    }

    #[test]
    fn test_invalid_advertisements() {
        let topo = TopologyManager::new("B", None);
        let now = Utc::now();

        assert_eq!(
            topo.apply_advertisement("X", vec!["B".into()], now),
            Err(TopologyError::ContainsLocalNode("X".to_string()))
        );
        assert_eq!(
            topo.apply_advertisement("X", vec!["X".into()], now),
            Err(TopologyError::SelfReference("X".to_string()))
        );
        assert_eq!(
            topo.apply_advertisement("X", vec!["Y".into(), "Y".into()], now),
            Err(TopologyError::Duplicate("X".to_string(), "Y".to_string()))
        );
        assert!(topo.apply_advertisement("", vec![], now).is_err());
        assert!(topo.neighbors().is_empty());
    }

    #[test]
    fn test_default_route_is_uplink() {
        let topo = TopologyManager::new("A", Some("B".to_string()));
        assert_eq!(topo.next_hop_for("anything"), Some("B".to_string()));
        assert!(!topo.is_reachable("anything"));
    }

    #[test]
    fn test_newest_advertisement_wins_between_neighbors() {
        let topo = TopologyManager::new("CSMS", None);
        let t0 = Utc::now();
        topo.apply_advertisement("X1", vec!["Y".into()], t0).unwrap();
        topo.apply_advertisement("X2", vec!["Y".into()], t0 + Duration::seconds(1)).unwrap();

        assert_eq!(topo.next_hop_for("Y"), Some("X2".to_string()));
    }

    #[test]
    fn test_remove_neighbor_drops_descendants() {
        let topo = TopologyManager::new("CSMS", None);
        topo.add_neighbor("X");
        topo.apply_advertisement("X", vec!["Y".into()], Utc::now()).unwrap();

        assert!(topo.remove_neighbor("X").is_some());
        assert_eq!(topo.next_hop_for("Y"), None);
    }

    #[test]
    fn test_reachable_nodes_excludes_uplink() {
        let topo = TopologyManager::new("B", Some("CSMS".to_string()));
        topo.add_neighbor("CSMS");
        topo.add_neighbor("A");
        topo.apply_advertisement("A", vec!["A1".into(), "A2".into()], Utc::now()).unwrap();

        assert_eq!(topo.reachable_nodes(), vec!["A", "A1", "A2"]);
    }

    #[test]
    fn test_add_neighbor_keeps_existing_entry() {
        let topo = TopologyManager::new("CSMS", None);
        topo.apply_advertisement("X", vec!["Y".into()], Utc::now()).unwrap();
        topo.add_neighbor("X");

        assert_eq!(topo.entry("X").unwrap().reachable_descendants, vec!["Y"]);
    }
}
