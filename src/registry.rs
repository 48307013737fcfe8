// ============================================================================
// COLLECTOR REGISTRY
// ============================================================================
// Which nodes currently have a reachable collector agent. Reads are lock-free
// through DashMap; membership changes (agent connect/disconnect) serialize on
// a single mutex so a multi-node registration is all-or-nothing.
// ============================================================================

use std::collections::BTreeSet;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::CollectorError;
use crate::types::{CollectorId, DatapathLink, NodeId, Timestamp};

/// Reachability record for one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectorEntry {
    pub node: NodeId,
    pub reachable: bool,
    /// The agent serving this node, if it connected through the handler.
    pub collector: Option<CollectorId>,
}

/// An agent connection and the nodes it announced.
#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    pub id: CollectorId,
    pub nodes: BTreeSet<NodeId>,
    pub connected_at: Timestamp,
}

/// Registry for collector agents and the nodes they serve.
#[derive(Debug, Default)]
pub struct CollectorRegistry {
    nodes: DashMap<NodeId, CollectorEntry>,
    agents: Mutex<ahash::AHashMap<CollectorId, AgentInfo>>,
}

impl CollectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn has_collector(&self, node: NodeId) -> bool {
        self.nodes.get(&node).map(|e| e.reachable).unwrap_or(false)
    }

    pub fn has_necessary_collectors(&self, link: &DatapathLink) -> bool {
        self.has_collector(link.src_node()) && self.has_collector(link.dest_node())
    }

    pub fn entry(&self, node: NodeId) -> Option<CollectorEntry> {
        self.nodes.get(&node).map(|e| e.clone())
    }

    /// All nodes with a reachable collector, in ascending order.
    pub fn reachable_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|e| e.reachable)
            .map(|e| *e.key())
            .collect();
        nodes.sort_unstable();
        nodes
    }

    pub fn agents(&self) -> Vec<AgentInfo> {
        let mut agents: Vec<AgentInfo> = self.agents.lock().values().cloned().collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    pub fn agent_count(&self) -> usize {
        self.agents.lock().len()
    }

    // ------------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------------

    /// Register an agent serving `nodes`. Nothing is registered on failure.
    pub fn connect(
        &self,
        id: CollectorId,
        nodes: impl IntoIterator<Item = NodeId>,
    ) -> Result<(), CollectorError> {
        let nodes: BTreeSet<NodeId> = nodes.into_iter().collect();
        let mut agents = self.agents.lock();

        if agents.contains_key(&id) {
            return Err(CollectorError::DuplicateCollector { id: id.0 });
        }
        if let Some(node) = nodes.iter().copied().find(|n| {
            self.nodes
                .get(n)
                .map(|e| e.collector.is_some())
                .unwrap_or(false)
        }) {
            return Err(CollectorError::DuplicateNode { id: id.0, node });
        }

        for node in &nodes {
            self.nodes.insert(
                *node,
                CollectorEntry {
                    node: *node,
                    reachable: true,
                    collector: Some(id.clone()),
                },
            );
        }
        info!(
            target: "flowwatch::collectors",
            collector = %id,
            nodes = ?nodes,
            "Collector connected"
        );
        agents.insert(
            id.clone(),
            AgentInfo {
                id,
                nodes,
                connected_at: Timestamp::now(),
            },
        );
        Ok(())
    }

    /// Remove an agent and every node it served. Returns the removed nodes.
    pub fn disconnect(&self, id: &CollectorId) -> Result<BTreeSet<NodeId>, CollectorError> {
        let mut agents = self.agents.lock();
        let agent = agents
            .remove(id)
            .ok_or_else(|| CollectorError::NotFound { id: id.0.clone() })?;

        for node in &agent.nodes {
            self.nodes
                .remove_if(node, |_, e| e.collector.as_ref() == Some(id));
        }
        info!(
            target: "flowwatch::collectors",
            collector = %id,
            nodes = ?agent.nodes,
            "Collector disconnected"
        );
        Ok(agent.nodes)
    }

    /// Reachability pushed by the membership feed. Returns true if it changed.
    pub fn set_reachable(&self, node: NodeId, reachable: bool) -> bool {
        let mut changed = true;
        self.nodes
            .entry(node)
            .and_modify(|e| {
                changed = e.reachable != reachable;
                e.reachable = reachable;
            })
            .or_insert_with(|| CollectorEntry {
                node,
                reachable,
                collector: None,
            });
        if changed {
            debug!(target: "flowwatch::collectors", node = %node, reachable, "Node reachability changed");
        }
        changed
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodePort;
    use pretty_assertions::assert_eq;

    fn link_ab() -> DatapathLink {
        DatapathLink::new(NodePort::new(1, 1), NodePort::new(2, 1))
    }

    #[test]
    fn test_reachability_scenario() {
        let registry = CollectorRegistry::new();
        registry.set_reachable(NodeId(1), true);
        registry.set_reachable(NodeId(2), true);
        assert!(registry.has_necessary_collectors(&link_ab()));

        assert!(registry.set_reachable(NodeId(2), false));
        assert!(!registry.has_necessary_collectors(&link_ab()));
        assert!(!registry.set_reachable(NodeId(2), false));
    }

    #[test]
    fn test_connect_rejects_duplicates_atomically() {
        let registry = CollectorRegistry::new();
        registry
            .connect(CollectorId::new("agent-a"), [NodeId(1), NodeId(2)])
            .unwrap();

        let err = registry
            .connect(CollectorId::new("agent-a"), [NodeId(9)])
            .unwrap_err();
        assert_eq!(err, CollectorError::DuplicateCollector { id: "agent-a".into() });

        let err = registry
            .connect(CollectorId::new("agent-b"), [NodeId(3), NodeId(2)])
            .unwrap_err();
        assert_eq!(
            err,
            CollectorError::DuplicateNode {
                id: "agent-b".into(),
                node: NodeId(2)
            }
        );
        assert!(!registry.has_collector(NodeId(3)));
        assert_eq!(registry.agent_count(), 1);
    }

    #[test]
    fn test_disconnect_removes_served_nodes() {
        let registry = CollectorRegistry::new();
        let id = CollectorId::new("agent-a");
        registry.connect(id.clone(), [NodeId(1), NodeId(2)]).unwrap();
        assert_eq!(registry.reachable_nodes(), vec![NodeId(1), NodeId(2)]);

        let removed = registry.disconnect(&id).unwrap();
        assert_eq!(removed.into_iter().collect::<Vec<_>>(), vec![NodeId(1), NodeId(2)]);
        assert!(!registry.has_collector(NodeId(1)));
        assert!(registry.disconnect(&id).is_err());
    }
}
