use petgraph::stable_graph::NodeIndex;
use serde::Serialize;

use crate::graph::FlowGraph;
use crate::registry::BlockRegistry;

/// Where a block input gets its value from: a wired upstream output, or
/// manual entry collected before the run starts.
#[derive(Debug, Clone, PartialEq)]
pub enum InputSource {
    Connected {
        source_node_id: String,
        source_output: String,
        source_label: String,
    },
    Manual,
}

/// Resolve the source for `(node, input_key)` by scanning the node's
/// incoming edges. Inputs have at most one wired source (enforced at graph
/// build time), so the first match is the only match.
pub fn resolve_input_source(graph: &FlowGraph, node_idx: NodeIndex, input_key: &str) -> InputSource {
    for (source_idx, connection) in graph.connections_to(node_idx) {
        if connection.target_input != input_key {
            continue;
        }

        let source = graph.node(source_idx);
        return InputSource::Connected {
            source_node_id: source.id.clone(),
            source_output: connection.source_output.clone(),
            source_label: source.display_label().to_string(),
        };
    }

    InputSource::Manual
}

/// One field of the manual-entry form shown before a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryInputField {
    pub node_id: String,
    pub node_label: String,
    pub input_key: String,
    pub label: String,
    pub required: bool,
}

/// Collect an entry field for every declared input that has no incoming
/// edge, in node insertion order then schema declaration order. Nodes whose
/// block type is missing from the registry are skipped.
pub fn collect_entry_inputs(graph: &FlowGraph, registry: &BlockRegistry) -> Vec<EntryInputField> {
    let mut fields = Vec::new();

    for node_idx in graph.node_indices() {
        let node = graph.node(node_idx);
        let Some(block) = registry.get(&node.block_type) else {
            continue;
        };

        for input in &block.inputs {
            if resolve_input_source(graph, node_idx, &input.key) != InputSource::Manual {
                continue;
            }

            let node_label = node.display_label().to_string();
            fields.push(EntryInputField {
                node_id: node.id.clone(),
                label: format!("{node_label}: {}", input.label),
                node_label,
                input_key: input.key.clone(),
                required: input.required,
            });
        }
    }

    fields
}
