use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use petgraph::Direction;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::registry::BlockRegistry;

#[derive(Debug, Error, PartialEq)]
pub enum GraphError {
    #[error("duplicate node id: {id}")]
    DuplicateNode { id: String },

    #[error("unknown node id: {id}")]
    UnknownNode { id: String },

    /// An input may have at most one wired source; a second edge onto the
    /// same input is rejected when the graph is built.
    #[error("input '{input_key}' of node '{node_id}' already has a connection")]
    InputAlreadyConnected { node_id: String, input_key: String },

    #[error("workflow has a cycle")]
    CycleDetected,

    #[error("node '{node_id}' references unknown block type '{block_type}'")]
    UnknownBlock { node_id: String, block_type: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// One placement of a block within a flow graph. `label` is display
/// metadata and falls back to the node id where a name is needed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInstance {
    pub id: String,
    pub block_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

impl NodeInstance {
    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.id)
    }
}

/// A wire from one node's output to another node's input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeConnection {
    pub source_output: String,
    pub target_input: String,
}

#[derive(Debug, Clone)]
pub struct FlowGraph {
    graph: StableDiGraph<NodeInstance, EdgeConnection>,
    node_ids: HashMap<String, NodeIndex>,
    pub exported_at: Option<DateTime<Utc>>,
}

impl FlowGraph {
    pub fn new() -> Self {
        Self {
            graph: StableDiGraph::new(),
            node_ids: HashMap::new(),
            exported_at: None,
        }
    }

    pub fn add_node(&mut self, instance: NodeInstance) -> Result<NodeIndex, GraphError> {
        if self.node_ids.contains_key(&instance.id) {
            return Err(GraphError::DuplicateNode {
                id: instance.id.clone(),
            });
        }

        let node_id = instance.id.clone();
        let index = self.graph.add_node(instance);
        self.node_ids.insert(node_id, index);
        Ok(index)
    }

    pub fn add_edge(
        &mut self,
        from_id: &str,
        connection: EdgeConnection,
        to_id: &str,
    ) -> Result<(), GraphError> {
        let from_idx = self
            .node_ids
            .get(from_id)
            .copied()
            .ok_or_else(|| GraphError::UnknownNode {
                id: from_id.to_string(),
            })?;
        let to_idx = self
            .node_ids
            .get(to_id)
            .copied()
            .ok_or_else(|| GraphError::UnknownNode {
                id: to_id.to_string(),
            })?;

        let already_wired = self
            .graph
            .edges_directed(to_idx, Direction::Incoming)
            .any(|edge| edge.weight().target_input == connection.target_input);
        if already_wired {
            return Err(GraphError::InputAlreadyConnected {
                node_id: to_id.to_string(),
                input_key: connection.target_input,
            });
        }

        self.graph.add_edge(from_idx, to_idx, connection);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn node(&self, idx: NodeIndex) -> &NodeInstance {
        self.graph
            .node_weight(idx)
            .expect("node index should be valid")
    }

    pub fn node_index(&self, node_id: &str) -> Option<NodeIndex> {
        self.node_ids.get(node_id).copied()
    }

    /// Node indices in insertion order; the deterministic iteration order
    /// used by the planner and the entry-input collector.
    pub fn node_indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices()
    }

    pub fn connections_to(&self, idx: NodeIndex) -> Vec<(NodeIndex, &EdgeConnection)> {
        self.graph
            .edges_directed(idx, Direction::Incoming)
            .map(|edge| (edge.source(), edge.weight()))
            .collect()
    }

    /// Layered topological order: repeated passes over nodes in insertion
    /// order, scheduling every node whose non-self-loop dependencies are
    /// already scheduled. Nodes scheduled earlier in the same pass count as
    /// scheduled for later ones. An empty graph yields an empty order; the
    /// caller treats that as nothing-to-run, not a cycle.
    pub fn run_order(&self) -> Result<Vec<NodeIndex>, GraphError> {
        let node_count = self.graph.node_count();
        let mut order = Vec::with_capacity(node_count);
        let mut scheduled: HashSet<NodeIndex> = HashSet::with_capacity(node_count);

        loop {
            let mut progress = false;
            for idx in self.graph.node_indices() {
                if scheduled.contains(&idx) {
                    continue;
                }

                let ready = self
                    .graph
                    .edges_directed(idx, Direction::Incoming)
                    .all(|edge| edge.source() == idx || scheduled.contains(&edge.source()));
                if ready {
                    order.push(idx);
                    scheduled.insert(idx);
                    progress = true;
                }
            }

            if !progress || order.len() == node_count {
                break;
            }
        }

        if order.len() == node_count {
            Ok(order)
        } else {
            Err(GraphError::CycleDetected)
        }
    }

    /// Structural validation: every block type must exist in the registry
    /// and the graph must be acyclic. Edge keys that do not appear in a
    /// block schema are tolerated; execution skips them.
    pub fn validate(&self, registry: &BlockRegistry) -> Result<(), GraphError> {
        self.run_order()?;

        for idx in self.graph.node_indices() {
            let node = self.node(idx);
            if registry.get(&node.block_type).is_none() {
                return Err(GraphError::UnknownBlock {
                    node_id: node.id.clone(),
                    block_type: node.block_type.clone(),
                });
            }
        }

        Ok(())
    }

    /// Stamp the export timestamp, producing the serialized
    /// `{nodes, edges, exported_at}` document shape.
    pub fn mark_exported(&mut self, at: DateTime<Utc>) {
        self.exported_at = Some(at);
    }
}

impl Default for FlowGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FlowGraphSerde {
    #[serde(default)]
    nodes: Vec<NodeInstance>,
    #[serde(default)]
    edges: Vec<FlowEdgeSerde>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exported_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FlowEdgeSerde {
    source: String,
    source_output: String,
    target: String,
    target_input: String,
}

impl Serialize for FlowGraph {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut nodes: Vec<NodeInstance> = self
            .graph
            .node_indices()
            .map(|idx| self.node(idx).clone())
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));

        let mut edges: Vec<FlowEdgeSerde> = self
            .graph
            .edge_references()
            .map(|edge| FlowEdgeSerde {
                source: self.node(edge.source()).id.clone(),
                source_output: edge.weight().source_output.clone(),
                target: self.node(edge.target()).id.clone(),
                target_input: edge.weight().target_input.clone(),
            })
            .collect();
        edges.sort_by(|a, b| {
            a.source
                .cmp(&b.source)
                .then_with(|| a.source_output.cmp(&b.source_output))
                .then_with(|| a.target.cmp(&b.target))
                .then_with(|| a.target_input.cmp(&b.target_input))
        });

        FlowGraphSerde {
            nodes,
            edges,
            exported_at: self.exported_at,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FlowGraph {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let serialized = FlowGraphSerde::deserialize(deserializer)?;
        let mut graph = FlowGraph::new();
        graph.exported_at = serialized.exported_at;

        for node in serialized.nodes {
            graph.add_node(node).map_err(D::Error::custom)?;
        }

        for edge in serialized.edges {
            // Edges whose endpoints are missing from the node set are
            // dropped defensively rather than failing the document.
            if graph.node_index(&edge.source).is_none() || graph.node_index(&edge.target).is_none()
            {
                continue;
            }

            graph
                .add_edge(
                    &edge.source,
                    EdgeConnection {
                        source_output: edge.source_output,
                        target_input: edge.target_input,
                    },
                    &edge.target,
                )
                .map_err(D::Error::custom)?;
        }

        Ok(graph)
    }
}
