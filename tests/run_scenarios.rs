//! ---
//! kiln_section: "15-testing-qa"
//! kiln_subsection: "integration-tests"
//! kiln_type: "source"
//! kiln_scope: "code"
//! kiln_description: "Run loop scenarios: failing containers and coordinated stop."
//! kiln_version: "v0.0.0-prealpha"
//! kiln_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use kiln_engine::{ContainerScript, InMemoryEngine};
use kiln_orchestrator::{RunOrchestrator, RunSettings, ServiceSpec, ServiceStatus, UpdateEvent};
use tokio::sync::mpsc;
use tokio::time::timeout;

fn orchestrator(
    engine: &InMemoryEngine,
    names: &[&str],
    dir: &std::path::Path,
) -> (Arc<RunOrchestrator>, mpsc::Receiver<UpdateEvent>) {
    let specs = names
        .iter()
        .map(|name| ServiceSpec::new(*name, format!("{name}.py"), dir).expect("spec"))
        .collect();
    let settings = RunSettings {
        update_buffer: 512,
        stop_timeout: Duration::from_secs(1),
        ..RunSettings::new("shop")
    };
    let (run, updates) = RunOrchestrator::new(Arc::new(engine.clone()), settings, specs);
    (Arc::new(run), updates)
}

/// Receive events until `done` holds for the events seen so far.
async fn collect_until(
    updates: &mut mpsc::Receiver<UpdateEvent>,
    seen: &mut Vec<UpdateEvent>,
    done: impl Fn(&[UpdateEvent]) -> bool,
) {
    timeout(Duration::from_secs(5), async {
        while !done(seen) {
            let event = updates.recv().await.expect("update stream open");
            seen.push(event);
        }
    })
    .await
    .expect("expected updates before timeout");
}

fn running(events: &[UpdateEvent]) -> HashSet<String> {
    events
        .iter()
        .filter(|event| event.status == ServiceStatus::Running && event.message.starts_with("running"))
        .map(|event| event.service_name.clone())
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn crashed_container_reports_its_log_tail_and_others_keep_running() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = InMemoryEngine::new();
    let output: Vec<String> = (1..=30).map(|i| format!("worker line {i}")).collect();
    engine.script_container(
        "shop-worker",
        ContainerScript::exits_with(137, Duration::from_millis(100)).with_output(output),
    );
    let (run, mut updates) = orchestrator(&engine, &["api", "web", "worker"], dir.path());

    let loop_handle = {
        let run = run.clone();
        tokio::spawn(async move { run.run().await })
    };

    let mut seen = Vec::new();
    collect_until(&mut updates, &mut seen, |events| {
        let crashed = events
            .iter()
            .any(|e| e.service_name == "worker" && e.status == ServiceStatus::Errored);
        let up = running(events);
        crashed && up.contains("api") && up.contains("web")
    })
    .await;

    let failure = seen
        .iter()
        .find(|e| e.service_name == "worker" && e.status == ServiceStatus::Errored)
        .expect("worker failure");
    assert_eq!(failure.error.as_deref(), Some("exit code 137"));
    let mut lines = failure.message.lines();
    assert_eq!(lines.next(), Some("exited with code 137:"));
    let tail: Vec<&str> = lines.collect();
    assert!(tail.len() <= 20);
    assert_eq!(tail.first().copied(), Some("worker line 11"));
    assert_eq!(tail.last().copied(), Some("worker line 30"));

    for service in run.services() {
        let expected = if service.name() == "worker" {
            ServiceStatus::Errored
        } else {
            ServiceStatus::Running
        };
        assert_eq!(service.status(), expected, "{}", service.name());
    }
    assert!(!loop_handle.is_finished(), "loop keeps running while services are up");

    run.stop_signal().trigger();
    let drain = tokio::spawn(async move { while updates.recv().await.is_some() {} });
    let report = timeout(Duration::from_secs(5), loop_handle)
        .await
        .expect("loop returns after stop")
        .expect("join")
        .expect("run");
    assert_eq!(report.failed(), vec!["worker"]);
    assert_eq!(report.status("api"), Some(ServiceStatus::Stopped));
    drop(run);
    drain.await.expect("drain");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_signal_stops_every_running_service_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = InMemoryEngine::new();
    let (run, mut updates) = orchestrator(&engine, &["api", "web", "worker"], dir.path());

    let loop_handle = {
        let run = run.clone();
        tokio::spawn(async move { run.run().await })
    };

    let mut seen = Vec::new();
    collect_until(&mut updates, &mut seen, |events| running(events).len() == 3).await;

    let stop = run.stop_signal();
    stop.trigger();
    stop.trigger();
    let report = timeout(Duration::from_secs(5), loop_handle)
        .await
        .expect("loop returns after stop")
        .expect("join")
        .expect("run");

    let mut stop_calls = engine.stop_calls();
    stop_calls.sort();
    assert_eq!(
        stop_calls,
        vec!["shop-api".to_owned(), "shop-web".to_owned(), "shop-worker".to_owned()]
    );

    drop(run);
    while let Some(event) = updates.recv().await {
        seen.push(event);
    }
    let stopped: Vec<&str> = seen
        .iter()
        .filter(|e| e.status == ServiceStatus::Stopped)
        .map(|e| e.service_name.as_str())
        .collect();
    assert_eq!(stopped.len(), 3);
    for name in ["api", "web", "worker"] {
        assert!(stopped.contains(&name), "{name} reported stopped");
        assert_eq!(report.status(name), Some(ServiceStatus::Stopped));
    }
    assert!(report.failed().is_empty());
}
