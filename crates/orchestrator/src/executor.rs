//! Level-by-level workflow execution.
//!
//! [`DagExecutor`] runs a validated [`WorkflowGraph`] one topological level at
//! a time. Every node in a level is dispatched concurrently on a
//! [`JoinSet`]; the next level starts only once every task of the current one
//! has resolved. A node whose dependency did not succeed is never invoked and
//! is recorded as skipped, carrying the upstream failure.
//!
//! Two clocks bound a run:
//!
//! - each worker call is wrapped in the node's own timeout;
//! - the whole run shares one deadline. When it passes, in-flight tasks are
//!   aborted, their late results are discarded, and every unresolved node is
//!   recorded with [`NodeError::WorkflowTimeout`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{json, Value};
use tokio::task::JoinSet;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, info_span, warn, Instrument};

use routing::workflow::{NodeKind, WorkerCall, WorkflowGraph};
use routing::{
    ConversationId, InvocationError, InvocationRequest, NodeError, NodeId, RunId, TrafficKind,
    UsageTracker, WorkerInvoker, WorkflowId,
};

/// Default whole-run deadline.
pub const DEFAULT_WORKFLOW_TIMEOUT: Duration = Duration::from_secs(60);

/// Tunables for [`DagExecutor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Whole-run deadline, in seconds.
    pub workflow_timeout_secs: f64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workflow_timeout_secs: DEFAULT_WORKFLOW_TIMEOUT.as_secs_f64(),
        }
    }
}

impl ExecutorConfig {
    pub fn workflow_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.workflow_timeout_secs).unwrap_or(DEFAULT_WORKFLOW_TIMEOUT)
    }

    /// Deadline for a run starting at `started`; the default timeout applies
    /// when the configured one does not fit on the clock.
    pub fn deadline_from(&self, started: Instant) -> Instant {
        started
            .checked_add(self.workflow_timeout())
            .unwrap_or(started + DEFAULT_WORKFLOW_TIMEOUT)
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// How a node ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Succeeded,
    Failed,
    /// Never invoked: a dependency did not succeed, or the deadline passed first.
    Skipped,
}

/// The outcome of one node in one run.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeResult {
    pub status: NodeStatus,
    pub result: Option<Value>,
    pub error: Option<NodeError>,
    pub elapsed: Duration,
}

impl NodeResult {
    fn succeeded(result: Value, elapsed: Duration) -> Self {
        Self {
            status: NodeStatus::Succeeded,
            result: Some(result),
            error: None,
            elapsed,
        }
    }

    fn failed(error: NodeError, elapsed: Duration) -> Self {
        Self {
            status: NodeStatus::Failed,
            result: None,
            error: Some(error),
            elapsed,
        }
    }

    fn skipped(error: NodeError) -> Self {
        Self {
            status: NodeStatus::Skipped,
            result: None,
            error: Some(error),
            elapsed: Duration::ZERO,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == NodeStatus::Succeeded
    }
}

impl Serialize for NodeResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("NodeResult", 5)?;
        state.serialize_field("success", &self.is_success())?;
        state.serialize_field("status", &self.status)?;
        state.serialize_field("result", &self.result)?;
        state.serialize_field("error", &self.error.as_ref().map(ToString::to_string))?;
        state.serialize_field("execution_time_ms", &millis(self.elapsed))?;
        state.end()
    }
}

/// Output of one terminal node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndNodeOutput {
    pub node_id: NodeId,
    pub output: Value,
    pub task: String,
    pub component: String,
}

/// Everything a caller gets back from one run.
///
/// `node_results` is always complete, so a caller can tell which nodes ran
/// even when the run as a whole failed.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowRunResult {
    pub success: bool,
    pub workflow_id: WorkflowId,
    pub cid: ConversationId,
    pub run_id: RunId,
    pub node_results: BTreeMap<NodeId, NodeResult>,
    pub end_node_outputs: Vec<EndNodeOutput>,
    pub total_execution_time_ms: u64,
    pub levels_executed: usize,
    pub nodes_executed: usize,
    pub error: Option<String>,
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Runs validated workflows against a [`WorkerInvoker`].
pub struct DagExecutor {
    invoker: Arc<dyn WorkerInvoker>,
    usage: Option<Arc<UsageTracker>>,
    config: ExecutorConfig,
}

type TaskOutput = (usize, Result<Value, InvocationError>, Duration);

impl DagExecutor {
    pub fn new(invoker: Arc<dyn WorkerInvoker>, config: ExecutorConfig) -> Self {
        Self {
            invoker,
            usage: None,
            config,
        }
    }

    /// Reports every completed worker call to `usage`.
    pub fn with_usage_tracker(mut self, usage: Arc<UsageTracker>) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Executes `graph` to completion or until the workflow deadline.
    ///
    /// `credential` is forwarded unchanged to every worker call.
    pub async fn execute(
        &self,
        graph: &WorkflowGraph,
        cid: &ConversationId,
        credential: Option<&str>,
    ) -> WorkflowRunResult {
        let run_id = RunId::new_random();
        let span = info_span!(
            "workflow_run",
            workflow_id = %graph.workflow_id(),
            %run_id,
            %cid,
            nodes = graph.len(),
        );
        self.run(graph, cid, credential, run_id)
            .instrument(span)
            .await
    }

    async fn run(
        &self,
        graph: &WorkflowGraph,
        cid: &ConversationId,
        credential: Option<&str>,
        run_id: RunId,
    ) -> WorkflowRunResult {
        let started = Instant::now();
        let deadline = self.config.deadline_from(started);
        let workflow_timeout = deadline.saturating_duration_since(started);

        let mut outcomes: Vec<Option<NodeResult>> = vec![None; graph.len()];
        let mut dispatched = vec![false; graph.len()];
        let mut levels_executed = 0;
        let mut timed_out = false;

        for (depth, level) in graph.levels().iter().enumerate() {
            if Instant::now() >= deadline {
                timed_out = true;
                break;
            }
            levels_executed += 1;
            debug!(level = depth, width = level.len(), "Dispatching level");

            let mut tasks: JoinSet<TaskOutput> = JoinSet::new();
            for &index in level {
                dispatched[index] = true;
                if let Some(skip) = upstream_failure(graph, &outcomes, index) {
                    debug!(node_id = %graph.node(index).id, "Skipping node");
                    outcomes[index] = Some(NodeResult::skipped(skip));
                    continue;
                }
                let node = graph.node(index);
                match &node.kind {
                    NodeKind::UserInput(text) | NodeKind::Context(text) => {
                        outcomes[index] = Some(NodeResult::succeeded(
                            Value::String(text.clone()),
                            Duration::ZERO,
                        ));
                    }
                    NodeKind::WorkerCall(call) => {
                        let request = InvocationRequest {
                            worker: call.worker.clone(),
                            capability: call.capability,
                            payload: build_payload(graph, &outcomes, index, call, cid),
                            timeout: node.timeout,
                            credential: credential.map(str::to_owned),
                            traffic: TrafficKind::Organic,
                        };
                        let invoker = self.invoker.clone();
                        let usage = self.usage.clone();
                        let span = info_span!(
                            "node",
                            node_id = %node.id,
                            worker = %call.worker,
                            capability = %call.capability,
                        );
                        tasks.spawn(
                            invoke_node(invoker, usage, index, request).instrument(span),
                        );
                    }
                }
            }

            loop {
                match timeout_at(deadline, tasks.join_next()).await {
                    Ok(Some(Ok((index, outcome, elapsed)))) => {
                        outcomes[index] = Some(match outcome {
                            Ok(reply) => NodeResult::succeeded(reply, elapsed),
                            Err(err) => {
                                warn!(
                                    node_id = %graph.node(index).id,
                                    error = %err,
                                    "Worker call failed"
                                );
                                NodeResult::failed(NodeError::Invocation(err), elapsed)
                            }
                        });
                    }
                    Ok(Some(Err(join_error))) => {
                        warn!(error = %join_error, "Node task ended abnormally");
                    }
                    Ok(None) => break,
                    Err(_) => {
                        tasks.abort_all();
                        timed_out = true;
                        break;
                    }
                }
            }

            if timed_out {
                break;
            }

            // A task that ended abnormally left no outcome behind.
            for &index in level {
                if outcomes[index].is_none() {
                    outcomes[index] = Some(NodeResult::failed(
                        NodeError::Invocation(InvocationError::WorkerReportedError(
                            "invocation task ended abnormally".into(),
                        )),
                        Duration::ZERO,
                    ));
                }
            }
        }

        if timed_out {
            warn!(
                timeout_ms = millis(workflow_timeout),
                "Workflow deadline exceeded"
            );
        }

        let results: Vec<NodeResult> = outcomes
            .into_iter()
            .enumerate()
            .map(|(index, outcome)| {
                outcome.unwrap_or_else(|| {
                    if dispatched[index] {
                        NodeResult::failed(NodeError::WorkflowTimeout, started.elapsed())
                    } else {
                        NodeResult::skipped(NodeError::WorkflowTimeout)
                    }
                })
            })
            .collect();

        let end_node_outputs = graph
            .terminal_nodes()
            .filter_map(|index| end_node_output(graph, &results[index], index))
            .collect();

        let nodes_executed = results
            .iter()
            .filter(|r| r.status != NodeStatus::Skipped)
            .count();
        let failed: Vec<&NodeId> = results
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.is_success())
            .map(|(index, _)| &graph.node(index).id)
            .collect();
        let success = failed.is_empty();
        let error = if timed_out {
            Some(format!(
                "Workflow deadline of {}ms exceeded",
                millis(workflow_timeout)
            ))
        } else if !success {
            let names: Vec<&str> = failed.iter().map(|id| id.as_str()).collect();
            Some(format!("{} node(s) did not succeed: {}", failed.len(), names.join(", ")))
        } else {
            None
        };

        let total = started.elapsed();
        info!(
            success,
            levels_executed,
            nodes_executed,
            elapsed_ms = millis(total),
            "Workflow run finished"
        );

        WorkflowRunResult {
            success,
            workflow_id: graph.workflow_id().clone(),
            cid: cid.clone(),
            run_id,
            node_results: graph
                .nodes()
                .iter()
                .map(|node| node.id.clone())
                .zip(results)
                .collect(),
            end_node_outputs,
            total_execution_time_ms: millis(total),
            levels_executed,
            nodes_executed,
            error,
        }
    }
}

async fn invoke_node(
    invoker: Arc<dyn WorkerInvoker>,
    usage: Option<Arc<UsageTracker>>,
    index: usize,
    request: InvocationRequest,
) -> TaskOutput {
    let worker = request.worker.clone();
    let limit = request.timeout;
    let started = Instant::now();
    let outcome = match timeout(limit, invoker.invoke(request)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(InvocationError::timeout(limit)),
    };
    let elapsed = started.elapsed();
    if let Some(usage) = usage {
        usage.observe(&worker, TrafficKind::Organic, outcome.is_ok(), elapsed);
    }
    debug!(ok = outcome.is_ok(), elapsed_ms = millis(elapsed), "Worker call resolved");
    (index, outcome, elapsed)
}

/// The first direct dependency that did not succeed, as a skip reason.
fn upstream_failure(
    graph: &WorkflowGraph,
    outcomes: &[Option<NodeResult>],
    index: usize,
) -> Option<NodeError> {
    graph.dependencies_of(index).iter().find_map(|&dep| {
        let outcome = outcomes[dep].as_ref()?;
        if outcome.is_success() {
            return None;
        }
        let cause = outcome
            .error
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "did not succeed".into());
        Some(NodeError::UpstreamFailed {
            dependency: graph.node(dep).id.clone(),
            cause,
        })
    })
}

/// Builds the JSON body for a worker call from the node's direct dependencies,
/// in declared order.
fn build_payload(
    graph: &WorkflowGraph,
    outcomes: &[Option<NodeResult>],
    index: usize,
    call: &WorkerCall,
    cid: &ConversationId,
) -> Value {
    let mut input = Vec::new();
    let mut context = Vec::new();
    let mut previous_outputs = Vec::new();

    for &dep in graph.dependencies_of(index) {
        let node = graph.node(dep);
        match &node.kind {
            NodeKind::UserInput(text) => input.push(json!({ "user_query": text })),
            NodeKind::Context(text) => context.push(Value::String(text.clone())),
            NodeKind::WorkerCall(upstream) => {
                let output = outcomes[dep]
                    .as_ref()
                    .and_then(|r| r.result.as_ref())
                    .and_then(|reply| reply.get("output"))
                    .cloned()
                    .unwrap_or(Value::Null);
                previous_outputs.push(json!({
                    "node_id": node.id,
                    "task": upstream.task,
                    "component": upstream.capability,
                    "output": output,
                }));
            }
        }
    }

    json!({
        "cid": cid,
        "task": call.task,
        "input": input,
        "context": context,
        "previous_outputs": previous_outputs,
        "use_conversation_history": call.use_conversation_history,
        "use_playbook": call.use_playbook,
    })
}

fn end_node_output(graph: &WorkflowGraph, result: &NodeResult, index: usize) -> Option<EndNodeOutput> {
    let reply = result.result.as_ref()?;
    let node = graph.node(index);
    let (output, task) = match &node.kind {
        NodeKind::WorkerCall(call) => (
            reply.get("output").cloned().unwrap_or_else(|| reply.clone()),
            call.task.clone(),
        ),
        NodeKind::UserInput(_) | NodeKind::Context(_) => (reply.clone(), String::new()),
    };
    Some(EndNodeOutput {
        node_id: node.id.clone(),
        output,
        task,
        component: node.kind.label().to_owned(),
    })
}
