//! Known nodes: kind, last reported position and cell configuration.

use crate::capacity::CellConfiguration;
use cellsim_common::{GeoCoord, NodeName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Kind of a simulated node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    #[default]
    Vehicle,
    Rsu,
    TrafficLight,
    ChargingStation,
    /// Backbone-attached application server.
    Server,
    /// Backbone-attached traffic management center.
    Tmc,
}

impl NodeKind {
    /// Whether the node is attached via the wired backbone rather than a cellular link.
    pub fn is_backbone(&self) -> bool {
        matches!(self, NodeKind::Server | NodeKind::Tmc)
    }
}

/// Registry entry for one node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeEntry {
    pub kind: NodeKind,
    pub position: Option<GeoCoord>,
    /// `None` until the node's cell module is configured.
    pub cell: Option<CellConfiguration>,
}

/// All nodes the cell network knows about, in name order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeRegistry {
    nodes: BTreeMap<NodeName, NodeEntry>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a node.
    pub fn insert(&mut self, name: impl Into<NodeName>, entry: NodeEntry) {
        self.nodes.insert(name.into(), entry);
    }

    pub fn get(&self, name: &str) -> Option<&NodeEntry> {
        self.nodes.get(name)
    }

    /// Kind of a node; unknown nodes are treated as vehicles.
    pub fn kind(&self, name: &str) -> NodeKind {
        self.nodes.get(name).map(|n| n.kind).unwrap_or_default()
    }

    pub fn position(&self, name: &str) -> Option<&GeoCoord> {
        self.nodes.get(name).and_then(|n| n.position.as_ref())
    }

    /// Record a new position. Unknown nodes are registered as vehicles.
    pub fn set_position(&mut self, name: &str, position: GeoCoord) {
        self.nodes
            .entry(name.to_string())
            .or_insert_with(|| NodeEntry {
                kind: NodeKind::default(),
                position: None,
                cell: None,
            })
            .position = Some(position);
    }

    pub fn cell_configuration(&self, name: &str) -> Option<&CellConfiguration> {
        self.nodes.get(name).and_then(|n| n.cell.as_ref())
    }

    pub fn cell_configuration_mut(&mut self, name: &str) -> Option<&mut CellConfiguration> {
        self.nodes.get_mut(name).and_then(|n| n.cell.as_mut())
    }

    /// Install a cell configuration, registering the node if needed.
    pub fn set_cell_configuration(&mut self, config: CellConfiguration) {
        let name = config.node_id().to_string();
        self.nodes
            .entry(name)
            .or_insert_with(|| NodeEntry {
                kind: NodeKind::default(),
                position: None,
                cell: None,
            })
            .cell = Some(config);
    }

    /// Whether the node has a switched-on cell module.
    pub fn is_cell_enabled(&self, name: &str) -> bool {
        self.cell_configuration(name).is_some_and(|c| c.is_enabled())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeName, &NodeEntry)> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_position_registers_unknown_node() {
        let mut nodes = NodeRegistry::new();
        nodes.set_position("veh_7", GeoCoord::new(52.5, 13.4));
        assert_eq!(nodes.kind("veh_7"), NodeKind::Vehicle);
        assert!(nodes.cell_configuration("veh_7").is_none());
        assert!(!nodes.is_cell_enabled("veh_7"));
    }

    #[test]
    fn test_cell_configuration_keeps_kind() {
        let mut nodes = NodeRegistry::new();
        nodes.insert(
            "server_0",
            NodeEntry {
                kind: NodeKind::Server,
                position: None,
                cell: None,
            },
        );
        nodes.set_cell_configuration(CellConfiguration::unlimited("server_0"));
        assert!(nodes.kind("server_0").is_backbone());
        assert!(nodes.is_cell_enabled("server_0"));
    }
}
