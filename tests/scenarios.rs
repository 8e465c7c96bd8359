//! End-to-end scenarios driving the engine through the public surface.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use dagrun::{
    build, dry_run, exit_code, run, BuildContext, ExecutionGraph, NodeStatus, RunOptions,
    RunStatus, Scheduler, WorkflowError,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn write_spec(dir: &Path, name: &str, yaml: &str) -> PathBuf {
    init_tracing();
    let path = dir.join(name);
    std::fs::write(&path, yaml).unwrap();
    path
}

fn opts(dir: &Path) -> RunOptions {
    RunOptions {
        log_dir: Some(dir.join("logs")),
        ..Default::default()
    }
}

async fn run_spec(
    dir: &Path,
    yaml: &str,
    cancel: CancellationToken,
) -> (RunStatus, Arc<ExecutionGraph>) {
    let spec = write_spec(dir, "flow.yaml", yaml);
    let def = dagrun::parse_definition(&std::fs::read_to_string(&spec).unwrap()).unwrap();
    let dag = Arc::new(build(&BuildContext::new(&spec), &def).unwrap());
    let graph = Arc::new(ExecutionGraph::new(&dag).unwrap());
    let scheduler = Scheduler::new(Arc::new(dagrun::ExecutorRegistry::with_builtins()))
        .with_log_dir(dir.join("logs"));
    let status = scheduler.run(dag, graph.clone(), None, cancel).await;
    (status, graph)
}

#[tokio::test]
async fn linear_success_preserves_edge_ordering() {
    let dir = tempfile::tempdir().unwrap();
    let (status, graph) = run_spec(
        dir.path(),
        r#"
name: linear
steps:
  - name: a
    command: "true"
  - name: b
    command: "true"
    depends: [a]
  - name: c
    command: "true"
    depends: [b]
"#,
        CancellationToken::new(),
    )
    .await;

    assert_eq!(status, RunStatus::Success);
    for node in graph.nodes() {
        assert_eq!(node.status(), NodeStatus::Success);
    }

    let a = graph.node_by_name("a").unwrap().state();
    let b = graph.node_by_name("b").unwrap().state();
    let c = graph.node_by_name("c").unwrap().state();
    assert!(a.finished_at.unwrap() <= b.started_at.unwrap());
    assert!(b.finished_at.unwrap() <= c.started_at.unwrap());
}

#[tokio::test]
async fn parameter_substitution_and_override() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.txt");
    let spec = write_spec(
        dir.path(),
        "params.yaml",
        &format!(
            r#"
params: "p1 p2"
steps:
  - name: say
    command: echo "params is $1 and $2"
    stdout: {}
"#,
            out.display()
        ),
    );

    let status = run(&spec, opts(dir.path())).await.unwrap();
    assert_eq!(status, RunStatus::Success);
    assert_eq!(
        std::fs::read_to_string(&out).unwrap().lines().last().unwrap(),
        "params is p1 and p2"
    );

    let mut o = opts(dir.path());
    o.params = Some("p3 p4".into());
    run(&spec, o).await.unwrap();
    assert_eq!(
        std::fs::read_to_string(&out).unwrap().lines().last().unwrap(),
        "params is p3 and p4"
    );
}

#[tokio::test]
async fn retry_then_succeed_waits_between_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("attempts");
    let script = dir.path().join("flaky.sh");
    std::fs::write(
        &script,
        format!(
            "echo x >> {marker}\ntest $(wc -l < {marker}) -ge 3\n",
            marker = marker.display()
        ),
    )
    .unwrap();
    let yaml = format!(
        r#"
steps:
  - name: flaky
    command: sh {script}
    retryPolicy:
      limit: 3
      intervalSec: 1
"#,
        script = script.display()
    );

    let start = Instant::now();
    let (status, graph) = run_spec(dir.path(), &yaml, CancellationToken::new()).await;
    let elapsed = start.elapsed();

    assert_eq!(status, RunStatus::Success);
    let state = graph.node_by_name("flaky").unwrap().state();
    assert_eq!(state.retry_count, 2);
    assert!(
        elapsed >= Duration::from_secs(2),
        "two one-second retry intervals expected, elapsed {elapsed:?}"
    );
}

#[tokio::test]
async fn cancellation_cascade_runs_cancel_handler() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("on-cancel");
    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        canceller.cancel();
    });

    let yaml = format!(
        r#"
maxCleanUpTimeSec: 5
handlerOn:
  cancel:
    command: sh -c "echo ran > {marker}"
steps:
  - name: a
    command: sleep 10
  - name: b
    command: "true"
    depends: [a]
"#,
        marker = marker.display()
    );
    let (status, graph) = run_spec(dir.path(), &yaml, cancel).await;

    assert_eq!(status, RunStatus::Cancel);
    assert_eq!(graph.node_by_name("a").unwrap().status(), NodeStatus::Cancel);
    assert_eq!(graph.node_by_name("b").unwrap().status(), NodeStatus::Skipped);
    assert_eq!(std::fs::read_to_string(&marker).unwrap().trim(), "ran");
}

#[tokio::test]
async fn cycle_passes_build_but_fails_graph_construction() {
    let yaml = r#"
steps:
  - name: a
    command: "true"
    depends: [b]
  - name: b
    command: "true"
    depends: [a]
"#;
    let def = dagrun::parse_definition(yaml).unwrap();
    // The step-level builder does not detect cycles.
    let dag = build(&BuildContext::new("/tmp/cycle.yaml"), &def).unwrap();
    assert_eq!(dag.steps.len(), 2);

    let err = ExecutionGraph::new(&dag).unwrap_err();
    assert!(matches!(err, WorkflowError::Cycle));
}

#[tokio::test]
async fn sub_workflow_runs_in_process() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("child-out.txt");
    write_spec(
        dir.path(),
        "child.yaml",
        &format!(
            r#"
steps:
  - name: greet
    command: echo "child got $1"
    stdout: {}
"#,
            out.display()
        ),
    );
    let parent = write_spec(
        dir.path(),
        "parent.yaml",
        r#"
steps:
  - name: nested
    run: child
    params: "hello"
"#,
    );

    let status = run(&parent, opts(dir.path())).await.unwrap();
    assert_eq!(status, RunStatus::Success);
    assert_eq!(
        std::fs::read_to_string(&out).unwrap().trim(),
        "child got hello"
    );
}

#[tokio::test]
async fn sub_workflow_failure_fails_parent_step() {
    let dir = tempfile::tempdir().unwrap();
    write_spec(
        dir.path(),
        "child.yaml",
        "steps:\n  - name: boom\n    command: \"false\"\n",
    );
    let parent = write_spec(
        dir.path(),
        "parent.yaml",
        "steps:\n  - name: nested\n    run: child\n",
    );

    let status = run(&parent, opts(dir.path())).await.unwrap();
    assert_eq!(status, RunStatus::Error);
}

#[tokio::test]
async fn dry_run_matches_retry_plan() {
    // Retrying a finished run reproduces the same admitted steps in the same
    // declaration order.
    let dir = tempfile::tempdir().unwrap();
    let spec = write_spec(
        dir.path(),
        "plan.yaml",
        r#"
steps:
  - name: first
    command: "true"
  - name: second
    command: "true"
    depends: [first]
  - name: third
    command: "true"
    depends: [first]
"#,
    );

    let before = dry_run(&spec, &RunOptions::default()).unwrap();
    run(&spec, opts(dir.path())).await.unwrap();
    let after = dry_run(&spec, &RunOptions::default()).unwrap();
    assert_eq!(before, after);
    assert_eq!(before.steps, vec!["first", "second", "third"]);
}

#[tokio::test]
async fn exit_codes_follow_status() {
    let dir = tempfile::tempdir().unwrap();
    let ok = write_spec(
        dir.path(),
        "ok.yaml",
        "steps:\n  - name: a\n    command: \"true\"\n",
    );
    let bad = write_spec(
        dir.path(),
        "bad.yaml",
        "steps:\n  - name: a\n    command: \"false\"\n",
    );

    let status = run(&ok, opts(dir.path())).await.unwrap();
    assert_eq!(exit_code(status), 0);

    let status = run(&bad, opts(dir.path())).await.unwrap();
    assert_eq!(exit_code(status), 1);
}

#[tokio::test]
async fn skip_if_successful_uses_history() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("count");
    let spec = write_spec(
        dir.path(),
        "skip.yaml",
        &format!(
            r#"
skipIfSuccessful: true
steps:
  - name: a
    command: sh -c "echo x >> {counter}"
"#,
            counter = counter.display()
        ),
    );

    let history: Arc<dagrun::InMemoryHistoryStore> = Arc::new(dagrun::InMemoryHistoryStore::new());
    let mut o = opts(dir.path());
    o.history = Some(history.clone());
    let status = run(&spec, o).await.unwrap();
    assert_eq!(status, RunStatus::Success);

    // Second run finds the fresh success and skips.
    let mut o = opts(dir.path());
    o.history = Some(history.clone());
    let status = run(&spec, o).await.unwrap();
    assert_eq!(status, RunStatus::Skipped);

    let runs = std::fs::read_to_string(&counter).unwrap().lines().count();
    assert_eq!(runs, 1);
}
