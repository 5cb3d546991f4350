//! Plugin-level behavior: the three backends honor one scheduling contract

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axonflow::prelude::*;
use tempfile::TempDir;

fn emit_one(name: &str) -> Arc<FnInterface> {
    Arc::new(FnInterface::new(
        name,
        Schema::new().field("x", FieldSpec::optional(FieldKind::Int)),
        Schema::new().field("y", FieldSpec::mandatory(FieldKind::Int)),
        |_| {
            let mut out = OutputMap::new();
            out.insert("y".to_string(), FieldValue::Int(1));
            Ok(out)
        },
    ))
}

/// Diamond graph: src -> (left, right) -> sink
fn diamond() -> Workflow {
    let mut wf = Workflow::new("diamond");
    wf.add_node(Node::new("src", emit_one("src") as Arc<dyn Interface>)).unwrap();
    wf.add_node(Node::new("left", emit_one("left") as Arc<dyn Interface>)).unwrap();
    wf.add_node(Node::new("right", emit_one("right") as Arc<dyn Interface>)).unwrap();
    wf.add_node(Node::new("sink", emit_one("sink") as Arc<dyn Interface>)).unwrap();
    wf.connect("src", "y", "left", "x").unwrap();
    wf.connect("src", "y", "right", "x").unwrap();
    wf.connect("left", "y", "sink", "x").unwrap();
    wf
}

#[tokio::test]
async fn every_plugin_completes_the_same_graph() {
    for plugin in ["serial", "pool", "batch"] {
        let dir = TempDir::new().unwrap();
        let report = diamond()
            .run(plugin, RunConfig::new(dir.path()))
            .await
            .unwrap();
        assert!(report.success(), "plugin '{}' failed the diamond", plugin);
        assert_eq!(report.completed(), 4);
    }
}

#[tokio::test]
async fn plugin_aliases_resolve() {
    let dir = TempDir::new().unwrap();
    let report = diamond()
        .run("linear", RunConfig::new(dir.path()))
        .await
        .unwrap();
    assert!(report.success());
}

#[tokio::test]
async fn unknown_plugin_is_rejected_before_anything_runs() {
    let dir = TempDir::new().unwrap();
    let err = diamond()
        .run("mainframe", RunConfig::new(dir.path()))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::UnknownPlugin { .. }));
}

#[tokio::test]
async fn pool_actually_overlaps_independent_nodes() {
    let dir = TempDir::new().unwrap();

    // Two nodes rendezvous: each waits until the other has started. Only a
    // scheduler running them concurrently can finish this graph.
    let started = Arc::new(AtomicUsize::new(0));
    let gate = |name: &str| {
        let started = Arc::clone(&started);
        Arc::new(FnInterface::new(name, Schema::new(), Schema::new(), move |_| {
            started.fetch_add(1, Ordering::SeqCst);
            let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
            while started.load(Ordering::SeqCst) < 2 {
                if std::time::Instant::now() > deadline {
                    return Err(InterfaceFailure::new("peer never started"));
                }
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
            Ok(OutputMap::new())
        }))
    };

    let mut wf = Workflow::new("rendezvous");
    wf.add_node(Node::new("a", gate("a") as Arc<dyn Interface>)).unwrap();
    wf.add_node(Node::new("b", gate("b") as Arc<dyn Interface>)).unwrap();

    let report = wf
        .run("pool", RunConfig::new(dir.path()).with_max_workers(2))
        .await
        .unwrap();
    assert!(report.success());
}

#[tokio::test]
async fn pool_respects_the_worker_bound() {
    let dir = TempDir::new().unwrap();

    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let tracked = |name: &str| {
        let in_flight = Arc::clone(&in_flight);
        let peak = Arc::clone(&peak);
        Arc::new(FnInterface::new(name, Schema::new(), Schema::new(), move |_| {
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(20));
            in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(OutputMap::new())
        }))
    };

    let mut wf = Workflow::new("bounded");
    for name in ["a", "b", "c", "d", "e", "f"] {
        wf.add_node(Node::new(name, tracked(name) as Arc<dyn Interface>)).unwrap();
    }

    let report = wf
        .run("pool", RunConfig::new(dir.path()).with_max_workers(2))
        .await
        .unwrap();
    assert!(report.success());
    assert!(peak.load(Ordering::SeqCst) <= 2, "worker bound exceeded");
}

#[tokio::test]
async fn batch_plugin_runs_command_interfaces_through_job_scripts() {
    let dir = TempDir::new().unwrap();

    let echo = CommandInterface::new(
        "echo",
        "echo",
        vec![ArgSpec::input("text")],
        Schema::new().field("text", FieldSpec::mandatory(FieldKind::Str)),
        Schema::new().field("echoed", FieldSpec::mandatory(FieldKind::Str)),
    )
    .stdout_into("echoed");

    let mut wf = Workflow::new("batchy");
    wf.add_node(Node::new("echo", Arc::new(echo) as Arc<dyn Interface>)).unwrap();
    wf.node_mut("echo")
        .unwrap()
        .set_input("text", FieldValue::Str("queued hello".into()))
        .unwrap();

    let config = RunConfig::new(dir.path()).with_plugin_args(serde_json::json!({
        "poll_initial_ms": 10,
        "poll_max_ms": 50,
    }));
    let report = wf.run("batch", config).await.unwrap();

    assert!(report.success());
    assert_eq!(
        report.results.get_output("echo", "echoed"),
        Some(FieldValue::Str("queued hello".into()))
    );
    // The job left its script and sentinel behind in the node's workdir
    let work = dir.path().join("work").join("echo");
    assert!(work.join("job.sh").exists());
    assert_eq!(std::fs::read_to_string(work.join("exit_code")).unwrap().trim(), "0");
}

#[tokio::test]
async fn batch_plugin_rejects_malformed_args() {
    let dir = TempDir::new().unwrap();
    let config = RunConfig::new(dir.path())
        .with_plugin_args(serde_json::json!({ "poll_max_ms": "later" }));
    let err = diamond().run("batch", config).await.unwrap_err();
    assert!(matches!(err, EngineError::PluginArgs { .. }));
}

#[tokio::test]
async fn batch_falls_back_to_local_for_non_batch_interfaces() {
    // FnInterface has no command-line surface; the batch plugin must still
    // run it rather than fail the node
    let dir = TempDir::new().unwrap();
    let report = diamond()
        .run("batch", RunConfig::new(dir.path()))
        .await
        .unwrap();
    assert!(report.success());
}
