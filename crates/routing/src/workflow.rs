//! Workflow graphs and their validation.
//!
//! A caller submits a [`RawWorkflow`]: plain data, exactly as it arrived on the
//! wire. [`validate`] turns it into a [`WorkflowGraph`], which is immutable and
//! carries everything the executor needs precomputed: an index-based adjacency
//! structure, the topological levels, and the set of terminal nodes.
//!
//! Nodes are stored in an arena (`Vec<Node>`) and referenced by position; there
//! are no pointer links between nodes.
//!
//! Once a graph has been validated the executor trusts it completely.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Capability, Identity, NodeId, ValidationError, WorkflowId};

/// Per-node timeout applied when a node does not specify one.
pub const DEFAULT_NODE_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Wire shape
// ---------------------------------------------------------------------------

/// A workflow as submitted, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawWorkflow {
    #[serde(default)]
    pub workflow_id: String,
    #[serde(default)]
    pub nodes: Vec<RawNode>,
}

/// A node as submitted. Which optional fields are required depends on `node_type`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawNode {
    pub id: String,

    /// `"user_input"`, `"context"`, or `"worker_call"`.
    #[serde(rename = "type")]
    pub node_type: String,

    #[serde(default)]
    pub dependencies: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<f64>,

    /// Literal text for `user_input` and `context` nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,

    #[serde(default)]
    pub use_conversation_history: bool,

    #[serde(default)]
    pub use_playbook: bool,
}

// ---------------------------------------------------------------------------
// Validated graph
// ---------------------------------------------------------------------------

/// A call to one capability of one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerCall {
    pub worker: Identity,
    pub capability: Capability,
    pub task: String,
    /// Ask the worker to attach recent conversation history.
    pub use_conversation_history: bool,
    /// Ask the worker to attach the caller's stored preferences.
    pub use_playbook: bool,
}

/// What a node does when it runs.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// Literal user text; resolves immediately.
    UserInput(String),
    /// Literal supporting context; resolves immediately.
    Context(String),
    /// A worker invocation.
    WorkerCall(WorkerCall),
}

impl NodeKind {
    /// Short label used in logs and in end-node outputs.
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::UserInput(_) => "user_input",
            NodeKind::Context(_) => "context",
            NodeKind::WorkerCall(call) => call.capability.as_str(),
        }
    }
}

/// A validated workflow node. Never mutated after validation.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    /// Direct dependencies, in declared order, without duplicates.
    pub dependencies: Vec<NodeId>,
    pub timeout: Duration,
}

/// A validated, immutable workflow.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    workflow_id: WorkflowId,
    nodes: Vec<Node>,
    index: HashMap<NodeId, usize>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    levels: Vec<Vec<usize>>,
}

impl WorkflowGraph {
    pub fn workflow_id(&self) -> &WorkflowId {
        &self.workflow_id
    }

    /// All nodes in submission order. Positions are the indices used by every
    /// other accessor.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> &Node {
        &self.nodes[index]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn index_of(&self, id: &NodeId) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Indices of the direct dependencies of `index`, in declared order.
    pub fn dependencies_of(&self, index: usize) -> &[usize] {
        &self.dependencies[index]
    }

    /// Indices of the nodes that list `index` as a direct dependency.
    pub fn dependents_of(&self, index: usize) -> &[usize] {
        &self.dependents[index]
    }

    /// Topological levels. Level 0 holds every node without dependencies;
    /// level `k` holds nodes whose dependencies all lie in levels `< k`, with at
    /// least one in level `k - 1`. Nodes within a level keep submission order.
    pub fn levels(&self) -> &[Vec<usize>] {
        &self.levels
    }

    /// A terminal node has no dependents; its output is part of the response.
    pub fn is_terminal(&self, index: usize) -> bool {
        self.dependents[index].is_empty()
    }

    /// Indices of every terminal node, in submission order.
    pub fn terminal_nodes(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.nodes.len()).filter(|&i| self.is_terminal(i))
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validates a submitted workflow. Pure function.
///
/// # Errors
///
/// - [`ValidationError::EmptyWorkflow`] / [`ValidationError::MissingWorkflowId`]
/// - [`ValidationError::DuplicateNodeId`] for repeated node ids
/// - [`ValidationError::MalformedNode`] for unknown node types, missing literal
///   content, worker calls without worker / known capability / non-empty task,
///   empty node ids, or non-positive or out-of-range timeouts
/// - [`ValidationError::UnknownDependency`] for dependencies not in the graph
/// - [`ValidationError::CycleDetected`] if no topological order exists
/// - [`ValidationError::NoTerminalNode`] if every node has a dependent
pub fn validate(raw: &RawWorkflow) -> Result<WorkflowGraph, ValidationError> {
    if raw.nodes.is_empty() {
        return Err(ValidationError::EmptyWorkflow);
    }
    let workflow_id = WorkflowId::new(raw.workflow_id.trim())
        .ok_or(ValidationError::MissingWorkflowId)?;

    let mut index: HashMap<NodeId, usize> = HashMap::with_capacity(raw.nodes.len());
    let mut ids = Vec::with_capacity(raw.nodes.len());
    for (i, raw_node) in raw.nodes.iter().enumerate() {
        let id = NodeId::new(raw_node.id.as_str()).ok_or_else(|| {
            ValidationError::MalformedNode {
                node: raw_node.id.clone(),
                reason: "node id must not be empty".into(),
            }
        })?;
        if index.insert(id.clone(), i).is_some() {
            return Err(ValidationError::DuplicateNodeId {
                node: raw_node.id.clone(),
            });
        }
        ids.push(id);
    }

    let mut nodes = Vec::with_capacity(raw.nodes.len());
    let mut dependencies = Vec::with_capacity(raw.nodes.len());
    for (raw_node, id) in raw.nodes.iter().zip(ids) {
        let kind = parse_kind(raw_node)?;
        let timeout = parse_timeout(raw_node)?;

        let mut seen = HashSet::new();
        let mut dep_ids = Vec::new();
        let mut dep_indices = Vec::new();
        for dep in &raw_node.dependencies {
            let dep_id = NodeId::new(dep.as_str());
            let dep_index = dep_id.as_ref().and_then(|d| index.get(d).copied());
            match (dep_id, dep_index) {
                (Some(dep_id), Some(dep_index)) => {
                    if seen.insert(dep_index) {
                        dep_ids.push(dep_id);
                        dep_indices.push(dep_index);
                    }
                }
                _ => {
                    return Err(ValidationError::UnknownDependency {
                        node: raw_node.id.clone(),
                        dependency: dep.clone(),
                    })
                }
            }
        }

        nodes.push(Node {
            id,
            kind,
            dependencies: dep_ids,
            timeout,
        });
        dependencies.push(dep_indices);
    }

    let mut dependents = vec![Vec::new(); nodes.len()];
    for (i, deps) in dependencies.iter().enumerate() {
        for &d in deps {
            dependents[d].push(i);
        }
    }

    let levels = layer(&nodes, &dependencies, &dependents)?;

    if dependents.iter().all(|d| !d.is_empty()) {
        return Err(ValidationError::NoTerminalNode);
    }

    Ok(WorkflowGraph {
        workflow_id,
        nodes,
        index,
        dependencies,
        dependents,
        levels,
    })
}

/// Kahn's algorithm, one round per level.
fn layer(
    nodes: &[Node],
    dependencies: &[Vec<usize>],
    dependents: &[Vec<usize>],
) -> Result<Vec<Vec<usize>>, ValidationError> {
    let mut in_degree: Vec<usize> = dependencies.iter().map(Vec::len).collect();
    let mut current: Vec<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut levels = Vec::new();
    let mut placed = 0usize;

    while !current.is_empty() {
        placed += current.len();
        let mut next = Vec::new();
        for &n in &current {
            for &dependent in &dependents[n] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    next.push(dependent);
                }
            }
        }
        next.sort_unstable();
        levels.push(std::mem::replace(&mut current, next));
    }

    if placed < nodes.len() {
        let nodes = (0..nodes.len())
            .filter(|&i| in_degree[i] > 0)
            .map(|i| nodes[i].id.to_string())
            .collect();
        return Err(ValidationError::CycleDetected { nodes });
    }
    Ok(levels)
}

fn parse_kind(raw: &RawNode) -> Result<NodeKind, ValidationError> {
    let malformed = |reason: &str| ValidationError::MalformedNode {
        node: raw.id.clone(),
        reason: reason.to_string(),
    };

    match raw.node_type.as_str() {
        "user_input" => raw
            .content
            .clone()
            .map(NodeKind::UserInput)
            .ok_or_else(|| malformed("user_input node requires 'content'")),
        "context" => raw
            .content
            .clone()
            .map(NodeKind::Context)
            .ok_or_else(|| malformed("context node requires 'content'")),
        "worker_call" => {
            let worker = raw
                .worker
                .as_deref()
                .map(str::trim)
                .and_then(Identity::new)
                .ok_or_else(|| malformed("worker_call node requires 'worker'"))?;
            let capability_name = raw
                .capability
                .as_deref()
                .ok_or_else(|| malformed("worker_call node requires 'capability'"))?;
            let capability = Capability::parse(capability_name)
                .ok_or_else(|| malformed(&format!("unknown capability '{capability_name}'")))?;
            let task = raw
                .task
                .as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .ok_or_else(|| malformed("worker_call node requires a non-empty 'task'"))?;
            Ok(NodeKind::WorkerCall(WorkerCall {
                worker,
                capability,
                task: task.to_string(),
                use_conversation_history: raw.use_conversation_history,
                use_playbook: raw.use_playbook,
            }))
        }
        other => Err(malformed(&format!("unknown node type '{other}'"))),
    }
}

fn parse_timeout(raw: &RawNode) -> Result<Duration, ValidationError> {
    match raw.timeout_secs {
        None => Ok(DEFAULT_NODE_TIMEOUT),
        Some(secs) if secs > 0.0 => {
            Duration::try_from_secs_f64(secs).map_err(|_| ValidationError::MalformedNode {
                node: raw.id.clone(),
                reason: format!("timeout_secs {secs} is out of range"),
            })
        }
        Some(secs) => Err(ValidationError::MalformedNode {
            node: raw.id.clone(),
            reason: format!("timeout_secs must be positive, got {secs}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(id: &str, deps: &[&str]) -> RawNode {
        RawNode {
            id: id.into(),
            node_type: "user_input".into(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            content: Some("Hello".into()),
            ..RawNode::default()
        }
    }

    fn call(id: &str, deps: &[&str]) -> RawNode {
        RawNode {
            id: id.into(),
            node_type: "worker_call".into(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            worker: Some("worker-a".into()),
            capability: Some("complete".into()),
            task: Some("answer".into()),
            ..RawNode::default()
        }
    }

    fn workflow(nodes: Vec<RawNode>) -> RawWorkflow {
        RawWorkflow {
            workflow_id: "wf-1".into(),
            nodes,
        }
    }

    #[test]
    fn diamond_is_layered_by_longest_path() {
        let graph = validate(&workflow(vec![
            input("in", &[]),
            call("a", &["in"]),
            call("b", &["in"]),
            call("c", &["a", "b"]),
            call("d", &["in", "c"]),
        ]))
        .unwrap();

        let names: Vec<Vec<&str>> = graph
            .levels()
            .iter()
            .map(|l| l.iter().map(|&i| graph.node(i).id.as_str()).collect())
            .collect();
        assert_eq!(names, vec![vec!["in"], vec!["a", "b"], vec!["c"], vec!["d"]]);
        assert_eq!(graph.terminal_nodes().collect::<Vec<_>>(), vec![4]);
    }

    #[test]
    fn every_dependency_lies_in_an_earlier_level() {
        let graph = validate(&workflow(vec![
            call("z", &["y", "x"]),
            input("x", &[]),
            call("y", &["x"]),
        ]))
        .unwrap();

        let mut level_of = vec![0; graph.len()];
        for (l, level) in graph.levels().iter().enumerate() {
            for &i in level {
                level_of[i] = l;
            }
        }
        for i in 0..graph.len() {
            for &d in graph.dependencies_of(i) {
                assert!(level_of[d] < level_of[i]);
            }
        }
    }

    #[test]
    fn cycle_is_rejected() {
        let err = validate(&workflow(vec![
            input("in", &[]),
            call("a", &["in", "b"]),
            call("b", &["a"]),
            call("out", &["in"]),
        ]))
        .unwrap_err();
        match err {
            ValidationError::CycleDetected { mut nodes } => {
                nodes.sort();
                assert_eq!(nodes, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let err = validate(&workflow(vec![input("in", &[]), call("a", &["a"])])).unwrap_err();
        assert!(matches!(err, ValidationError::CycleDetected { .. }));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let err = validate(&workflow(vec![call("a", &["ghost"])])).unwrap_err();
        assert_eq!(
            err,
            ValidationError::UnknownDependency {
                node: "a".into(),
                dependency: "ghost".into()
            }
        );
    }

    #[test]
    fn worker_call_requires_known_capability_and_task() {
        let mut bad_cap = call("a", &[]);
        bad_cap.capability = Some("translate".into());
        assert!(matches!(
            validate(&workflow(vec![bad_cap])),
            Err(ValidationError::MalformedNode { .. })
        ));

        let mut no_task = call("a", &[]);
        no_task.task = Some("   ".into());
        assert!(matches!(
            validate(&workflow(vec![no_task])),
            Err(ValidationError::MalformedNode { .. })
        ));

        let mut no_worker = call("a", &[]);
        no_worker.worker = None;
        assert!(matches!(
            validate(&workflow(vec![no_worker])),
            Err(ValidationError::MalformedNode { .. })
        ));
    }

    #[test]
    fn duplicate_ids_and_empty_graphs_are_rejected() {
        assert_eq!(
            validate(&workflow(vec![])).unwrap_err(),
            ValidationError::EmptyWorkflow
        );
        assert!(matches!(
            validate(&workflow(vec![input("x", &[]), input("x", &[])])),
            Err(ValidationError::DuplicateNodeId { .. })
        ));
    }

    #[test]
    fn timeouts_default_and_validate() {
        let graph = validate(&workflow(vec![input("in", &[])])).unwrap();
        assert_eq!(graph.node(0).timeout, DEFAULT_NODE_TIMEOUT);

        let mut negative = input("in", &[]);
        negative.timeout_secs = Some(-2.0);
        assert!(matches!(
            validate(&workflow(vec![negative])),
            Err(ValidationError::MalformedNode { .. })
        ));

        for secs in [1e20, f64::INFINITY, f64::NAN] {
            let mut huge = input("in", &[]);
            huge.timeout_secs = Some(secs);
            assert!(matches!(
                validate(&workflow(vec![huge])),
                Err(ValidationError::MalformedNode { .. })
            ));
        }
    }

    #[test]
    fn empty_node_id_is_malformed() {
        let err = validate(&workflow(vec![input("", &[])])).unwrap_err();
        assert!(matches!(err, ValidationError::MalformedNode { ref node, .. } if node.is_empty()));
    }

    #[test]
    fn repeated_dependencies_are_collapsed() {
        let graph = validate(&workflow(vec![input("in", &[]), call("a", &["in", "in"])])).unwrap();
        assert_eq!(graph.dependencies_of(1), &[0]);
        assert_eq!(graph.dependents_of(0), &[1]);
    }

    #[test]
    fn raw_workflow_parses_from_wire_json() {
        let raw: RawWorkflow = serde_json::from_value(serde_json::json!({
            "workflow_id": "wf-9",
            "nodes": [
                {"id": "q", "type": "user_input", "content": "Hello"},
                {"id": "c", "type": "worker_call", "dependencies": ["q"],
                 "worker": "w1", "capability": "complete", "task": "reply",
                 "use_playbook": true}
            ]
        }))
        .unwrap();
        let graph = validate(&raw).unwrap();
        assert_eq!(graph.levels().len(), 2);
        match &graph.node(1).kind {
            NodeKind::WorkerCall(call) => assert!(call.use_playbook),
            other => panic!("unexpected kind {other:?}"),
        }
    }
}
