use std::collections::HashMap;

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::OutputCache;
use crate::graph::{FlowGraph, GraphError};
use crate::registry::BlockRegistry;
use crate::resolve::{collect_entry_inputs, resolve_input_source, EntryInputField, InputSource};
use crate::runner::{BlockInputs, BlockOutputs, BlockRunner};

/// Executor lifecycle. `AwaitingInput` is entered only when the entry-input
/// collector finds unwired inputs; cancelling from it returns to `Idle`
/// with no side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Planning,
    AwaitingInput,
    Running,
    Completed,
    Failed,
}

/// Manual values collected before a run: `node_id -> input_key -> value`.
pub type EntryValues = HashMap<String, HashMap<String, String>>;

/// What to do when a connected input has no cached upstream value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpstreamPolicy {
    /// Substitute an empty string and keep going.
    #[default]
    Permissive,
    /// Abort the run at the affected node.
    Strict,
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("workflow has a cycle")]
    Cycle,

    #[error("node '{node_id}' references unknown block type '{block_type}'")]
    UnknownBlock { node_id: String, block_type: String },

    #[error("a run is already in progress")]
    AlreadyRunning,

    #[error("required input '{label}' is empty")]
    MissingEntryInput {
        node_id: String,
        input_key: String,
        label: String,
    },

    #[error("run superseded by a newer run")]
    Superseded,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunFailure {
    pub node_id: String,
    pub node_label: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub state: RunState,
    /// Node ids that executed successfully, in run order.
    pub executed: Vec<String>,
    pub failure: Option<RunFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunPlan {
    pub order: Vec<String>,
    pub entry_inputs: Vec<EntryInputField>,
}

/// One editing session: the output cache, the executor state, and the
/// token identifying the active run. Owned exclusively by one caller; the
/// executor is the only writer of the cache.
#[derive(Debug)]
pub struct FlowSession {
    cache: OutputCache,
    state: RunState,
    active_run: CancellationToken,
}

impl FlowSession {
    pub fn new() -> Self {
        Self {
            cache: OutputCache::new(),
            state: RunState::Idle,
            active_run: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn cache(&self) -> &OutputCache {
        &self.cache
    }

    pub fn clear_outputs(&mut self) {
        self.cache.clear_all();
    }

    pub fn clear_node_outputs(&mut self, node_id: &str) {
        self.cache.clear_node(node_id);
    }

    pub fn mark_awaiting_input(&mut self) {
        self.state = RunState::AwaitingInput;
    }

    /// Abandon a pending entry form: back to `Idle`, nothing else changes.
    pub fn cancel_pending(&mut self) {
        if self.state == RunState::AwaitingInput {
            self.state = RunState::Idle;
        }
    }

    /// Token for the currently active run; cancelled once a newer run
    /// starts or the session shuts down.
    pub fn active_run_token(&self) -> CancellationToken {
        self.active_run.clone()
    }

    /// Invalidate any in-flight run so its late results are discarded.
    pub fn supersede_active_run(&mut self) {
        self.active_run.cancel();
        self.active_run = CancellationToken::new();
    }

    fn begin_run(&mut self) -> CancellationToken {
        self.supersede_active_run();
        self.active_run.clone()
    }
}

impl Default for FlowSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Guarded cache write: results from a superseded run must not corrupt the
/// session, so writes are dropped once the run token is cancelled.
fn record_node_outputs(
    session: &mut FlowSession,
    run: &CancellationToken,
    node_id: &str,
    outputs: BlockOutputs,
) -> bool {
    if run.is_cancelled() {
        warn!(node_id, "Discarding outputs from superseded run");
        return false;
    }

    session.cache.insert_node_outputs(node_id, outputs);
    true
}

pub struct FlowExecutor<'a> {
    registry: &'a BlockRegistry,
    policy: UpstreamPolicy,
}

impl<'a> FlowExecutor<'a> {
    pub fn new(registry: &'a BlockRegistry) -> Self {
        Self {
            registry,
            policy: UpstreamPolicy::default(),
        }
    }

    pub fn with_policy(registry: &'a BlockRegistry, policy: UpstreamPolicy) -> Self {
        Self { registry, policy }
    }

    /// Compute the run order and the entry-input form for a graph without
    /// touching any session state.
    pub fn plan(&self, graph: &FlowGraph) -> Result<RunPlan, ExecutionError> {
        let order = graph.run_order().map_err(map_graph_error)?;

        Ok(RunPlan {
            order: order
                .iter()
                .map(|idx| graph.node(*idx).id.clone())
                .collect(),
            entry_inputs: collect_entry_inputs(graph, self.registry),
        })
    }

    /// Execute the graph strictly sequentially against the block runner,
    /// one node at a time. Earlier nodes' outputs stay cached when a later
    /// node fails; the remaining order is abandoned on first failure.
    pub async fn run(
        &self,
        session: &mut FlowSession,
        graph: &FlowGraph,
        runner: &dyn BlockRunner,
        entry_values: &EntryValues,
    ) -> Result<RunReport, ExecutionError> {
        if session.state == RunState::Running {
            return Err(ExecutionError::AlreadyRunning);
        }

        session.state = RunState::Planning;
        let order = match graph.validate(self.registry).and_then(|()| graph.run_order()) {
            Ok(order) => order,
            Err(err) => {
                session.state = RunState::Failed;
                return Err(map_graph_error(err));
            }
        };

        if order.is_empty() {
            session.state = RunState::Completed;
            return Ok(RunReport {
                state: RunState::Completed,
                executed: Vec::new(),
                failure: None,
            });
        }

        for field in collect_entry_inputs(graph, self.registry) {
            if !field.required {
                continue;
            }

            let supplied = entry_values
                .get(&field.node_id)
                .and_then(|values| values.get(&field.input_key))
                .map(|value| !value.trim().is_empty())
                .unwrap_or(false);
            if !supplied {
                session.state = RunState::AwaitingInput;
                return Err(ExecutionError::MissingEntryInput {
                    node_id: field.node_id,
                    input_key: field.input_key,
                    label: field.label,
                });
            }
        }

        let run = session.begin_run();
        session.state = RunState::Running;
        let mut executed = Vec::new();

        for node_idx in order {
            let node = graph.node(node_idx).clone();
            let Some(block) = self.registry.get(&node.block_type) else {
                // Validated above; skip defensively if the catalog changed.
                continue;
            };

            let mut inputs = BlockInputs::new();
            let mut missing_upstream: Option<(String, String)> = None;

            for input in &block.inputs {
                match resolve_input_source(graph, node_idx, &input.key) {
                    InputSource::Connected {
                        source_node_id,
                        source_output,
                        ..
                    } => match session.cache.get(&source_node_id, &source_output) {
                        Some(value) => {
                            inputs.insert(input.key.clone(), value.to_text());
                        }
                        None => {
                            if self.policy == UpstreamPolicy::Strict {
                                missing_upstream = Some((source_node_id, source_output));
                                break;
                            }
                            // Permissive default: run with an empty value.
                            inputs.insert(input.key.clone(), String::new());
                        }
                    },
                    InputSource::Manual => {
                        let value = entry_values
                            .get(&node.id)
                            .and_then(|values| values.get(&input.key))
                            .cloned()
                            .unwrap_or_default();
                        inputs.insert(input.key.clone(), value);
                    }
                }
            }

            if let Some((source_node_id, source_output)) = missing_upstream {
                session.state = RunState::Failed;
                return Ok(RunReport {
                    state: RunState::Failed,
                    executed,
                    failure: Some(RunFailure {
                        node_id: node.id.clone(),
                        node_label: node.display_label().to_string(),
                        error: format!(
                            "no cached output for '{source_node_id}.{source_output}'"
                        ),
                    }),
                });
            }

            match runner.run_block(block, &inputs).await {
                Ok(outputs) => {
                    if !record_node_outputs(session, &run, &node.id, outputs) {
                        return Err(ExecutionError::Superseded);
                    }
                    executed.push(node.id.clone());
                }
                Err(err) => {
                    if run.is_cancelled() {
                        return Err(ExecutionError::Superseded);
                    }

                    info!(node_id = %node.id, error = %err, "Run aborted at node");
                    session.state = RunState::Failed;
                    return Ok(RunReport {
                        state: RunState::Failed,
                        executed,
                        failure: Some(RunFailure {
                            node_id: node.id.clone(),
                            node_label: node.display_label().to_string(),
                            error: err.to_string(),
                        }),
                    });
                }
            }
        }

        session.state = RunState::Completed;
        info!(executed = executed.len(), "Run completed");
        Ok(RunReport {
            state: RunState::Completed,
            executed,
            failure: None,
        })
    }
}

fn map_graph_error(err: GraphError) -> ExecutionError {
    match err {
        GraphError::UnknownBlock {
            node_id,
            block_type,
        } => ExecutionError::UnknownBlock {
            node_id,
            block_type,
        },
        // Only cycle and unknown-block errors can escape a built graph;
        // construction-time errors were handled when the document loaded.
        _ => ExecutionError::Cycle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{EdgeConnection, NodeInstance};
    use crate::registry::{build_default_registry, BlockDefinition};
    use crate::runner::BlockRunError;
    use crate::types::ScalarValue;
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn node(id: &str, block_type: &str) -> NodeInstance {
        NodeInstance {
            id: id.to_string(),
            block_type: block_type.to_string(),
            label: None,
            position: None,
        }
    }

    fn edge(source_output: &str, target_input: &str) -> EdgeConnection {
        EdgeConnection {
            source_output: source_output.to_string(),
            target_input: target_input.to_string(),
        }
    }

    /// Echoes inputs back as outputs and records every invocation;
    /// configured node ids fail instead.
    struct RecordingRunner {
        calls: Mutex<Vec<(String, BlockInputs)>>,
        fail_on: Option<String>,
    }

    impl RecordingRunner {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_on: None,
            }
        }

        fn failing_on(block_id: &str) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_on: Some(block_id.to_string()),
            }
        }

        fn calls(&self) -> Vec<(String, BlockInputs)> {
            self.calls.lock().expect("calls lock").clone()
        }
    }

    #[async_trait]
    impl BlockRunner for RecordingRunner {
        async fn run_block(
            &self,
            block: &BlockDefinition,
            inputs: &BlockInputs,
        ) -> Result<BlockOutputs, BlockRunError> {
            self.calls
                .lock()
                .expect("calls lock")
                .push((block.id.clone(), inputs.clone()));

            if self.fail_on.as_deref() == Some(block.id.as_str()) {
                return Err(BlockRunError::Execution("boom".to_string()));
            }

            let mut outputs = BlockOutputs::new();
            for output in &block.outputs {
                let echoed = inputs.values().next().cloned().unwrap_or_default();
                outputs.insert(output.key.clone(), ScalarValue::Str(echoed));
            }
            Ok(outputs)
        }
    }

    fn constant_feeds_summarize() -> FlowGraph {
        let mut graph = FlowGraph::new();
        graph.add_node(node("const", "constant")).expect("const");
        graph.add_node(node("sum", "summarize-text")).expect("sum");
        graph
            .add_edge("const", edge("value", "text"), "sum")
            .expect("const -> sum");
        graph
    }

    fn entry(node_id: &str, input_key: &str, value: &str) -> EntryValues {
        EntryValues::from([(
            node_id.to_string(),
            HashMap::from([(input_key.to_string(), value.to_string())]),
        )])
    }

    #[tokio::test]
    async fn test_empty_graph_completes_without_runner_calls() {
        let registry = build_default_registry();
        let executor = FlowExecutor::new(&registry);
        let runner = RecordingRunner::new();
        let mut session = FlowSession::new();

        let plan = executor.plan(&FlowGraph::new()).expect("plan");
        assert!(plan.order.is_empty());

        let report = executor
            .run(&mut session, &FlowGraph::new(), &runner, &EntryValues::new())
            .await
            .expect("empty run completes");
        assert_eq!(report.state, RunState::Completed);
        assert!(runner.calls().is_empty());
        assert_eq!(session.state(), RunState::Completed);
    }

    #[tokio::test]
    async fn test_cycle_fails_planning() {
        let registry = build_default_registry();
        let executor = FlowExecutor::new(&registry);
        let runner = RecordingRunner::new();
        let mut session = FlowSession::new();

        let mut graph = FlowGraph::new();
        graph.add_node(node("a", "rewrite-prompt")).expect("a");
        graph.add_node(node("b", "rewrite-prompt")).expect("b");
        graph.add_edge("a", edge("rewritten", "text"), "b").expect("a -> b");
        graph.add_edge("b", edge("rewritten", "text"), "a").expect("b -> a");

        let err = executor
            .run(&mut session, &graph, &runner, &EntryValues::new())
            .await
            .expect_err("cycle should fail");
        assert!(matches!(err, ExecutionError::Cycle));
        assert_eq!(session.state(), RunState::Failed);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_scenario_constant_into_summarize() {
        let registry = build_default_registry();
        let executor = FlowExecutor::new(&registry);
        let runner = RecordingRunner::new();
        let mut session = FlowSession::new();
        let graph = constant_feeds_summarize();

        let plan = executor.plan(&graph).expect("plan");
        assert_eq!(plan.order, vec!["const", "sum"]);
        assert_eq!(plan.entry_inputs.len(), 1);
        assert_eq!(plan.entry_inputs[0].node_id, "const");
        assert_eq!(plan.entry_inputs[0].input_key, "value");

        let report = executor
            .run(&mut session, &graph, &runner, &entry("const", "value", "hello"))
            .await
            .expect("run completes");
        assert_eq!(report.state, RunState::Completed);
        assert_eq!(report.executed, vec!["const", "sum"]);

        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "constant");
        assert_eq!(calls[0].1.get("value").map(String::as_str), Some("hello"));
        // Downstream node read the constant's cached output.
        assert_eq!(calls[1].0, "summarize-text");
        assert_eq!(calls[1].1.get("text").map(String::as_str), Some("hello"));

        assert_eq!(
            session.cache().get("const", "value"),
            Some(&ScalarValue::Str("hello".into()))
        );
    }

    #[tokio::test]
    async fn test_blank_required_entry_blocks_execution() {
        let registry = build_default_registry();
        let executor = FlowExecutor::new(&registry);
        let runner = RecordingRunner::new();
        let mut session = FlowSession::new();
        let graph = constant_feeds_summarize();

        let err = executor
            .run(&mut session, &graph, &runner, &entry("const", "value", "  "))
            .await
            .expect_err("blank required entry should fail");
        assert!(matches!(
            err,
            ExecutionError::MissingEntryInput { ref node_id, .. } if node_id == "const"
        ));
        assert_eq!(session.state(), RunState::AwaitingInput);
        assert!(runner.calls().is_empty(), "execution must never begin");

        session.cancel_pending();
        assert_eq!(session.state(), RunState::Idle);
    }

    #[tokio::test]
    async fn test_failure_aborts_remaining_order_and_keeps_earlier_outputs() {
        let registry = build_default_registry();
        let executor = FlowExecutor::new(&registry);
        // A -> B -> C with B failing.
        let mut graph = FlowGraph::new();
        graph.add_node(node("a", "constant")).expect("a");
        graph.add_node(node("b", "summarize-text")).expect("b");
        graph.add_node(node("c", "rewrite-prompt")).expect("c");
        graph.add_edge("a", edge("value", "text"), "b").expect("a -> b");
        graph.add_edge("b", edge("summary", "text"), "c").expect("b -> c");

        let runner = RecordingRunner::failing_on("summarize-text");
        let mut session = FlowSession::new();

        let report = executor
            .run(&mut session, &graph, &runner, &entry("a", "value", "x"))
            .await
            .expect("run returns a failed report");
        assert_eq!(report.state, RunState::Failed);
        assert_eq!(report.executed, vec!["a"]);
        let failure = report.failure.expect("failure recorded");
        assert_eq!(failure.node_id, "b");
        assert!(failure.error.contains("boom"));

        // A's output is cached; B and C are not, and C never ran.
        assert!(session.cache().get("a", "value").is_some());
        assert!(session.cache().node_outputs("b").is_none());
        assert!(session.cache().node_outputs("c").is_none());
        assert_eq!(runner.calls().len(), 2);
        assert_eq!(session.state(), RunState::Failed);
    }

    #[tokio::test]
    async fn test_permissive_policy_substitutes_empty_for_missing_upstream() {
        let registry = build_default_registry();
        let executor = FlowExecutor::new(&registry);
        let runner = RecordingRunner::new();
        let mut session = FlowSession::new();

        // trigger -> conditional wired from an output key the trigger does
        // not produce, so the cache lookup misses.
        let mut graph = FlowGraph::new();
        graph.add_node(node("t", "trigger")).expect("t");
        graph.add_node(node("c", "conditional")).expect("c");
        graph.add_edge("t", edge("nonexistent", "text"), "c").expect("t -> c");

        let report = executor
            .run(&mut session, &graph, &runner, &EntryValues::new())
            .await
            .expect("permissive run completes");
        assert_eq!(report.state, RunState::Completed);

        let calls = runner.calls();
        assert_eq!(calls[1].1.get("text").map(String::as_str), Some(""));
    }

    #[tokio::test]
    async fn test_strict_policy_fails_on_missing_upstream() {
        let registry = build_default_registry();
        let executor = FlowExecutor::with_policy(&registry, UpstreamPolicy::Strict);
        let runner = RecordingRunner::new();
        let mut session = FlowSession::new();

        let mut graph = FlowGraph::new();
        graph.add_node(node("t", "trigger")).expect("t");
        graph.add_node(node("c", "conditional")).expect("c");
        graph.add_edge("t", edge("nonexistent", "text"), "c").expect("t -> c");

        let report = executor
            .run(&mut session, &graph, &runner, &EntryValues::new())
            .await
            .expect("strict run reports failure");
        assert_eq!(report.state, RunState::Failed);
        let failure = report.failure.expect("failure recorded");
        assert_eq!(failure.node_id, "c");
        assert!(failure.error.contains("t.nonexistent"));
        // Only the trigger ran.
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_cache_persists_across_runs_in_one_session() {
        let registry = build_default_registry();
        let executor = FlowExecutor::new(&registry);
        let runner = RecordingRunner::new();
        let mut session = FlowSession::new();
        let graph = constant_feeds_summarize();

        executor
            .run(&mut session, &graph, &runner, &entry("const", "value", "first"))
            .await
            .expect("first run");
        executor
            .run(&mut session, &graph, &runner, &entry("const", "value", "second"))
            .await
            .expect("second run");

        assert_eq!(
            session.cache().get("const", "value"),
            Some(&ScalarValue::Str("second".into()))
        );

        session.clear_outputs();
        assert!(session.cache().is_empty());
    }

    #[test]
    fn test_superseding_cancels_previous_run_token() {
        let mut session = FlowSession::new();
        let first = session.begin_run();
        assert!(!first.is_cancelled());

        let second = session.begin_run();
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
    }

    #[test]
    fn test_stale_run_cannot_write_into_cache() {
        let mut session = FlowSession::new();
        let run = session.begin_run();
        session.supersede_active_run();

        let written = record_node_outputs(
            &mut session,
            &run,
            "a",
            BlockOutputs::from([(String::from("value"), ScalarValue::Bool(true))]),
        );
        assert!(!written);
        assert!(session.cache().is_empty());
    }
}
