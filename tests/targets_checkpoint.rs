#[path = "common/fakes.rs"]
mod fakes;

use bloomnet::targets::{render, PortSelector, RefreshWorker, TargetFile, TargetGenerator, TargetGroup};
use bloomnet::RetryPolicy;
use fakes::{now, Harness};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn generator(harness: &Harness, files: Vec<TargetFile>) -> Arc<TargetGenerator> {
    Arc::new(TargetGenerator::new(
        Arc::clone(&harness.ledger),
        files,
        harness.metrics.clone(),
    ))
}

#[test]
fn published_file_matches_rendering_of_active_nodes() {
    let tmp = TempDir::new().unwrap();
    let storage = TargetFile::service(tmp.path().join("targets_storage.json")).with_label("job", "minio");
    let exporter = TargetFile::service(tmp.path().join("targets_node.json"))
        .with_ports(vec![PortSelector::Fixed(9100)])
        .with_label("job", "node");
    let harness = Harness::new();
    harness.register("node-b", 2);
    harness.register("node-a", 1);
    harness.register("node-c", 3);
    harness.registry.deregister_node("node-c", now()).unwrap();
    let generator = generator(&harness, vec![storage.clone(), exporter.clone()]);

    let report = generator.refresh().unwrap();
    assert_eq!(report.node_count, 2);
    assert!(report.files.iter().all(|(_, outcome)| outcome.was_written()));

    let active = harness.registry.list_active().unwrap();
    for file in [&storage, &exporter] {
        assert_eq!(fs::read(&file.path).unwrap(), render(file, &active).unwrap());
    }
    let groups: Vec<TargetGroup> =
        serde_json::from_slice(&fs::read(&exporter.path).unwrap()).unwrap();
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0].targets, vec!["100.64.0.1:9100"]);
    assert_eq!(groups[0].labels["alias"], "node-a");
    assert_eq!(groups[0].labels["job"], "node");
}

#[test]
fn replaying_the_same_snapshot_is_byte_identical() {
    let tmp = TempDir::new().unwrap();
    let file = TargetFile::service(tmp.path().join("targets.json"));
    let harness = Harness::new();
    harness.register("node-a", 1);
    let generator = generator(&harness, vec![file.clone()]);

    let first = generator.refresh().unwrap();
    let bytes = fs::read(&file.path).unwrap();
    let second = generator.refresh().unwrap();
    assert!(!second.files[0].1.was_written());
    assert_eq!(first.files[0].1.digest(), second.files[0].1.digest());
    assert_eq!(fs::read(&file.path).unwrap(), bytes);
}

#[test]
fn worker_settles_on_latest_registry_state() {
    let tmp = TempDir::new().unwrap();
    let file = TargetFile::service(tmp.path().join("targets.json"));
    let harness = Harness::new();
    let mut handle = RefreshWorker::spawn(
        generator(&harness, vec![file.clone()]),
        harness.signal.clone(),
        RetryPolicy::unbounded(Duration::from_millis(5)),
        harness.metrics.clone(),
    )
    .unwrap();

    for (i, name) in ["node-a", "node-b", "node-c"].iter().enumerate() {
        harness.register(name, i as u8 + 1);
    }
    harness.registry.deregister_node("node-b", now()).unwrap();
    assert!(handle.wait_idle(Duration::from_secs(5)));

    let active = harness.registry.list_active().unwrap();
    assert_eq!(fs::read(&file.path).unwrap(), render(&file, &active).unwrap());
    handle.shutdown();
}

#[test]
fn publish_failures_are_retried_without_failing_registration() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("targets.json");
    // A directory where the file should be makes every publish fail.
    fs::create_dir(&path).unwrap();
    let file = TargetFile::service(&path);
    let harness = Harness::new();
    let handle = RefreshWorker::spawn(
        generator(&harness, vec![file.clone()]),
        harness.signal.clone(),
        RetryPolicy::unbounded(Duration::from_millis(5)).with_max_delay(Duration::from_millis(20)),
        harness.metrics.clone(),
    )
    .unwrap();

    harness.register("node-a", 1);
    assert!(!handle.wait_idle(Duration::from_millis(100)));
    assert!(harness.signal.consecutive_failures() > 0);
    assert!(harness.signal.last_error().is_some());

    fs::remove_dir(&path).unwrap();
    assert!(handle.wait_idle(Duration::from_secs(5)));
    assert_eq!(harness.signal.last_error(), None);
    let active = harness.registry.list_active().unwrap();
    assert_eq!(fs::read(&path).unwrap(), render(&file, &active).unwrap());
    assert!(harness.metrics.snapshot().counter("targets.refresh_failures") > 0);
}
