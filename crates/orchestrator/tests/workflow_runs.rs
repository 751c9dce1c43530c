//! End-to-end workflow runs through the gateway with a scripted worker pool.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::Instant;

use orchestrator::{
    DagExecutor, ExecutorConfig, Gateway, NodeStatus, WorkflowRunResult, WorkflowSubmission,
};
use routing::{
    Identity, InvocationError, InvocationRequest, NodeError, NodeId, RateLimitConfig, RateLimiter,
    SignatureVerifier, StakeDirectory, UsageTracker, WorkerInvoker,
};

/// What a scripted worker does when called.
#[derive(Clone)]
enum Behaviour {
    Reply(&'static str),
    Fail,
    Sleep(Duration),
}

/// Worker pool keyed by task name. Records call start and end times.
#[derive(Default)]
struct ScriptedWorkers {
    behaviours: HashMap<String, Behaviour>,
    calls: Mutex<Vec<(String, Instant, Instant)>>,
}

impl ScriptedWorkers {
    fn with(mut self, task: &str, behaviour: Behaviour) -> Self {
        self.behaviours.insert(task.to_owned(), behaviour);
        self
    }

    fn called_tasks(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(t, _, _)| t.clone()).collect()
    }

    fn span_of(&self, task: &str) -> (Instant, Instant) {
        let calls = self.calls.lock().unwrap();
        let (_, start, end) = calls.iter().find(|(t, _, _)| t == task).unwrap();
        (*start, *end)
    }
}

#[async_trait]
impl WorkerInvoker for ScriptedWorkers {
    async fn invoke(&self, request: InvocationRequest) -> Result<Value, InvocationError> {
        let task = request.payload["task"].as_str().unwrap_or_default().to_owned();
        let started = Instant::now();
        let behaviour = self
            .behaviours
            .get(&task)
            .cloned()
            .unwrap_or(Behaviour::Reply("default"));
        let outcome = match behaviour {
            Behaviour::Reply(text) => {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(json!({"output": {"immediate_response": text, "notebook": "no update"}}))
            }
            Behaviour::Fail => Err(InvocationError::WorkerReportedError("boom".into())),
            Behaviour::Sleep(d) => {
                tokio::time::sleep(d).await;
                Ok(json!({"output": {"immediate_response": "late"}}))
            }
        };
        self.calls
            .lock()
            .unwrap()
            .push((task, started, Instant::now()));
        outcome
    }
}

struct AllowAll;

impl SignatureVerifier for AllowAll {
    fn verify(&self, _identity: &Identity, _message: &[u8], _signature: &str) -> bool {
        true
    }
}

fn gateway(workers: Arc<ScriptedWorkers>, config: ExecutorConfig) -> (Gateway, Arc<UsageTracker>) {
    let usage = Arc::new(UsageTracker::default());
    let executor = DagExecutor::new(workers, config).with_usage_tracker(usage.clone());
    let limiter = RateLimiter::new(
        RateLimitConfig {
            anonymous_rpm: 100,
            ..RateLimitConfig::default()
        },
        Arc::new(StakeDirectory::new()),
    );
    (
        Gateway::new(Arc::new(AllowAll), Arc::new(limiter), Arc::new(executor)),
        usage,
    )
}

fn worker(id: &str, task: &str, deps: &[&str]) -> Value {
    json!({
        "id": id, "type": "worker_call", "dependencies": deps,
        "worker": "w1", "capability": "complete", "task": task
    })
}

async fn run(gw: &Gateway, nodes: Vec<Value>) -> WorkflowRunResult {
    let submission: WorkflowSubmission = serde_json::from_value(json!({
        "workflow": {"workflow_id": "wf-e2e", "nodes": nodes},
        "cid": "conv-1"
    }))
    .unwrap();
    gw.submit(submission, "127.0.0.1", Some("caller-key"))
        .await
        .unwrap()
}

fn nid(s: &str) -> NodeId {
    NodeId::new(s).unwrap()
}

#[tokio::test(start_paused = true)]
async fn hello_complete_produces_one_end_output() {
    let workers = Arc::new(ScriptedWorkers::default().with("greet", Behaviour::Reply("Hi there")));
    let (gw, usage) = gateway(workers.clone(), ExecutorConfig::default());

    let result = run(
        &gw,
        vec![
            json!({"id": "q", "type": "user_input", "content": "Hello"}),
            worker("a", "greet", &["q"]),
        ],
    )
    .await;

    assert!(result.success);
    assert_eq!(result.levels_executed, 2);
    assert_eq!(result.nodes_executed, 2);
    assert_eq!(result.end_node_outputs.len(), 1);
    let end = &result.end_node_outputs[0];
    assert_eq!(end.node_id, nid("a"));
    assert_eq!(end.output["immediate_response"], "Hi there");
    assert_eq!(end.task, "greet");
    assert_eq!(end.component, "complete");
    assert_eq!(result.node_results.len(), 2);
    assert!(result.error.is_none());

    let counter = usage.counter(&Identity::new("w1").unwrap()).unwrap();
    assert_eq!(counter.total, 1);
    assert_eq!(counter.successful, 1);

    let wire = serde_json::to_value(&result).unwrap();
    assert_eq!(wire["node_results"]["a"]["success"], true);
    assert_eq!(wire["cid"], "conv-1");
}

#[tokio::test(start_paused = true)]
async fn dependents_never_start_before_their_level_resolves() {
    let workers = Arc::new(
        ScriptedWorkers::default()
            .with("fast", Behaviour::Reply("f"))
            .with("slow", Behaviour::Sleep(Duration::from_secs(2)))
            .with("join", Behaviour::Reply("j")),
    );
    let (gw, _) = gateway(workers.clone(), ExecutorConfig::default());

    let result = run(
        &gw,
        vec![
            json!({"id": "q", "type": "user_input", "content": "Hello"}),
            worker("fast", "fast", &["q"]),
            worker("slow", "slow", &["q"]),
            worker("join", "join", &["fast", "slow"]),
        ],
    )
    .await;

    assert!(result.success);
    assert_eq!(result.levels_executed, 3);
    let (_, slow_end) = workers.span_of("slow");
    let (join_start, _) = workers.span_of("join");
    let (fast_start, _) = workers.span_of("fast");
    let (slow_start, _) = workers.span_of("slow");
    assert!(join_start >= slow_end);
    // Siblings in one level run concurrently.
    assert_eq!(fast_start, slow_start);
}

#[tokio::test(start_paused = true)]
async fn failure_skips_transitive_dependents_but_not_siblings() {
    let workers = Arc::new(ScriptedWorkers::default().with("bad", Behaviour::Fail));
    let (gw, usage) = gateway(workers.clone(), ExecutorConfig::default());

    let result = run(
        &gw,
        vec![
            json!({"id": "q", "type": "user_input", "content": "Hello"}),
            worker("bad", "bad", &["q"]),
            worker("good", "good", &["q"]),
            worker("child", "child", &["bad"]),
            worker("grandchild", "grandchild", &["child", "good"]),
        ],
    )
    .await;

    assert!(!result.success);
    assert_eq!(result.node_results[&nid("bad")].status, NodeStatus::Failed);
    assert_eq!(result.node_results[&nid("good")].status, NodeStatus::Succeeded);
    assert_eq!(result.node_results[&nid("child")].status, NodeStatus::Skipped);
    assert_eq!(
        result.node_results[&nid("grandchild")].status,
        NodeStatus::Skipped
    );
    assert!(matches!(
        &result.node_results[&nid("grandchild")].error,
        Some(NodeError::UpstreamFailed { dependency, .. }) if *dependency == nid("child")
    ));

    let called = workers.called_tasks();
    assert!(!called.contains(&"child".to_owned()));
    assert!(!called.contains(&"grandchild".to_owned()));
    assert_eq!(result.nodes_executed, 3);
    assert!(result.end_node_outputs.is_empty());

    let counter = usage.counter(&Identity::new("w1").unwrap()).unwrap();
    assert_eq!(counter.failed, 1);
}

#[tokio::test(start_paused = true)]
async fn node_timeout_is_a_failure_that_propagates() {
    let workers = Arc::new(
        ScriptedWorkers::default().with("hang", Behaviour::Sleep(Duration::from_secs(300))),
    );
    let (gw, _) = gateway(workers, ExecutorConfig::default());

    let mut hang = worker("hang", "hang", &[]);
    hang["timeout_secs"] = json!(1.0);
    let result = run(&gw, vec![hang, worker("after", "after", &["hang"])]).await;

    assert!(matches!(
        &result.node_results[&nid("hang")].error,
        Some(NodeError::Invocation(InvocationError::Timeout(_)))
    ));
    assert_eq!(result.node_results[&nid("after")].status, NodeStatus::Skipped);
}

#[tokio::test(start_paused = true)]
async fn workflow_deadline_discards_late_results_and_keeps_completed_ones() {
    let workers = Arc::new(
        ScriptedWorkers::default()
            .with("quick", Behaviour::Reply("done"))
            .with("long", Behaviour::Sleep(Duration::from_secs(20))),
    );
    let config = ExecutorConfig {
        workflow_timeout_secs: 5.0,
    };
    let (gw, _) = gateway(workers.clone(), config);

    let started = Instant::now();
    let result = run(
        &gw,
        vec![
            worker("quick", "quick", &[]),
            worker("long", "long", &[]),
            worker("never", "never", &["quick", "long"]),
        ],
    )
    .await;

    assert!(Instant::now() - started < Duration::from_secs(6));
    assert!(!result.success);
    assert!(result.error.as_deref().unwrap().contains("deadline"));
    assert_eq!(result.node_results[&nid("quick")].status, NodeStatus::Succeeded);
    assert_eq!(
        result.node_results[&nid("long")].error,
        Some(NodeError::WorkflowTimeout)
    );
    assert_eq!(result.node_results[&nid("never")].status, NodeStatus::Skipped);
    assert_eq!(
        result.node_results[&nid("never")].error,
        Some(NodeError::WorkflowTimeout)
    );
    assert!(!workers.called_tasks().contains(&"never".to_owned()));

    // The aborted call never completes, even after its sleep would have ended.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(!workers.called_tasks().contains(&"long".to_owned()));
}
