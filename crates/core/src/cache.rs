use std::collections::HashMap;

use serde::Serialize;

use crate::types::ScalarValue;

/// Session-scoped store of each node's last produced outputs.
///
/// Entries are written (and overwritten) each time a node executes
/// successfully and survive across runs within one session, so partial
/// re-runs can reuse upstream results. The executor is the only writer;
/// everything else gets read-only snapshots.
#[derive(Debug, Default, Serialize)]
pub struct OutputCache {
    outputs_by_node: HashMap<String, HashMap<String, ScalarValue>>,
}

impl OutputCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_node_outputs(&mut self, node_id: &str, outputs: HashMap<String, ScalarValue>) {
        self.outputs_by_node.insert(node_id.to_string(), outputs);
    }

    pub fn get(&self, node_id: &str, output_key: &str) -> Option<&ScalarValue> {
        self.outputs_by_node.get(node_id)?.get(output_key)
    }

    pub fn node_outputs(&self, node_id: &str) -> Option<&HashMap<String, ScalarValue>> {
        self.outputs_by_node.get(node_id)
    }

    pub fn clear_node(&mut self, node_id: &str) {
        self.outputs_by_node.remove(node_id);
    }

    pub fn clear_all(&mut self) {
        self.outputs_by_node.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.outputs_by_node.is_empty()
    }

    /// Read-only view for the display layer and the outputs endpoint.
    pub fn snapshot(&self) -> &HashMap<String, HashMap<String, ScalarValue>> {
        &self.outputs_by_node
    }
}
