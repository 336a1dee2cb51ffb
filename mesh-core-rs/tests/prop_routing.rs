//! Property tests for routing and correlation
//!
//! - Path invariant: a request relayed along a chain records every forwarding
//!   hop in order, and its reply retraces the exact reverse
//! - Correlation invariant: every registered request resolves exactly once,
//!   and the pending table never holds two live entries for one id

use std::collections::HashMap;
use std::time::Duration;

use futures_util::FutureExt;
use mesh_core::addressing::{forward, route_back, Forwarding};
use mesh_core::pending::{PendingError, PendingHandle, PendingRequests, Resolution};
use mesh_core::{Destination, NetworkPath, RequestId, TopologyManager};
use proptest::prelude::*;

// ============================================================================
// Strategies
// ============================================================================

/// Chain of 2..8 distinct node ids, origin first, terminal last
fn chain() -> impl Strategy<Value = Vec<String>> {
    prop::collection::hash_set("[a-z]{1,6}", 2..8).prop_map(|ids| {
        let mut ids: Vec<String> = ids.into_iter().collect();
        ids.sort();
        ids
    })
}

#[derive(Debug, Clone)]
enum Op {
    Register(u8),
    Respond(u8),
    Cancel(u8),
    Expire,
}

fn ops() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            (0u8..6).prop_map(Op::Register),
            (0u8..6).prop_map(Op::Respond),
            (0u8..6).prop_map(Op::Cancel),
            Just(Op::Expire),
        ],
        1..40,
    )
}

// ============================================================================
// Path Invariant
// ============================================================================

proptest! {
    /// Terminal sees [n1..n(k-1)]; reply walks n(k-1)..n1 and stops at n1
    #[test]
    fn path_recorded_in_order_and_reversed(chain in chain()) {
        // each node's uplink is the next node in the chain
        let topologies: Vec<TopologyManager> = chain
            .iter()
            .enumerate()
            .map(|(i, id)| TopologyManager::new(id.clone(), chain.get(i + 1).cloned()))
            .collect();

        let terminal = chain.last().unwrap().clone();
        let destination = Destination::node(terminal.clone());

        let mut path = NetworkPath::new();
        let mut holder = 0;
        loop {
            match forward(&destination, &path, &topologies[holder]).unwrap() {
                Forwarding::Deliver => break,
                Forwarding::RelayTo { next_hop, network_path } => {
                    prop_assert_eq!(&next_hop, &chain[holder + 1]);
                    prop_assert!(network_path.find_cycle().is_none());
                    path = network_path;
                    holder += 1;
                }
            }
        }

        prop_assert_eq!(holder, chain.len() - 1);
        prop_assert_eq!(path.hops(), &chain[..chain.len() - 1]);

        // reply leaves the terminal toward the head of the reversed path
        let reply_path = path.reversed();
        let mut visited = Vec::new();
        let mut at = reply_path.origin().unwrap().clone();
        loop {
            visited.push(at.clone());
            match route_back(&reply_path, &at).unwrap() {
                Forwarding::Deliver => break,
                Forwarding::RelayTo { next_hop, .. } => at = next_hop,
            }
        }

        let mut expected: Vec<String> = chain[..chain.len() - 1].to_vec();
        expected.reverse();
        prop_assert_eq!(visited, expected);
    }

    /// Appending a node already on the path is always refused
    #[test]
    fn append_never_creates_cycle(chain in chain(), pick in any::<prop::sample::Index>()) {
        let mut path = NetworkPath::new();
        for id in &chain {
            path.append(id.clone()).unwrap();
        }
        let repeat = pick.get(&chain).clone();
        prop_assert!(path.append(repeat).is_err());
        prop_assert_eq!(path.len(), chain.len());
    }
}

// ============================================================================
// Correlation Invariant
// ============================================================================

proptest! {
    #[test]
    fn every_request_resolves_exactly_once(ops in ops()) {
        let table = PendingRequests::new();
        let mut handles: HashMap<u8, Vec<PendingHandle>> = HashMap::new();
        let mut live: HashMap<u8, bool> = HashMap::new();

        for op in ops {
            match op {
                Op::Register(n) => {
                    let id = RequestId::from(format!("req-{}", n));
                    match table.register(id.clone(), "Ping", Duration::ZERO) {
                        Ok(handle) => {
                            prop_assert!(!live.get(&n).copied().unwrap_or(false));
                            live.insert(n, true);
                            handles.entry(n).or_default().push(handle);
                        }
                        Err(PendingError::Duplicate(dup)) => {
                            prop_assert_eq!(dup, id);
                            prop_assert!(live.get(&n).copied().unwrap_or(false));
                        }
                    }
                }
                Op::Respond(n) | Op::Cancel(n) => {
                    let id = RequestId::from(format!("req-{}", n));
                    let resolution = match op {
                        Op::Cancel(_) => Resolution::Cancelled,
                        _ => Resolution::TransportFailed("gone".to_string()),
                    };
                    let was_live = live.get(&n).copied().unwrap_or(false);
                    prop_assert_eq!(table.complete(&id, resolution), was_live);
                    live.insert(n, false);
                }
                Op::Expire => {
                    let expired = table.expire_older_than(tokio::time::Instant::now());
                    for id in expired {
                        let n: u8 = id.as_str().trim_start_matches("req-").parse().unwrap();
                        prop_assert!(live.get(&n).copied().unwrap_or(false));
                        live.insert(n, false);
                    }
                }
            }
            prop_assert_eq!(table.len(), live.values().filter(|l| **l).count());
        }

        // drain whatever is still live
        table.expire_older_than(tokio::time::Instant::now() + Duration::from_secs(1));
        prop_assert!(table.is_empty());

        for handle in handles.into_values().flatten() {
            let id = handle.request_id.clone();
            prop_assert!(handle.resolved().now_or_never().is_some(), "request {} never resolved", id);
        }
    }
}
