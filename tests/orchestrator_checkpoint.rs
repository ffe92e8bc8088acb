#[path = "common/fakes.rs"]
mod fakes;

use bloomnet::orchestrator::{CancellationToken, ToolError};
use bloomnet::{ClusterStatus, ControlPlaneError, NodeStatus};
use fakes::{aliases, now, Harness};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn healthy_pair(harness: &Harness) {
    harness.register("a", 1);
    harness.register("b", 2);
}

#[test]
fn successful_formation_attaches_members() {
    let harness = Harness::new();
    healthy_pair(&harness);

    let cluster = harness
        .orchestrator
        .form_cluster("c1", &aliases(&["a", "b"]), now(), &CancellationToken::new())
        .unwrap();
    assert_eq!(cluster.status, ClusterStatus::Active);
    assert_eq!(cluster.members, vec!["a", "b"]);
    assert_eq!(cluster.attempts, 1);

    let status = harness.orchestrator.get_cluster_status("c1").unwrap();
    assert_eq!(status, cluster);
    for name in ["a", "b"] {
        let node = harness.registry.get_node(name).unwrap();
        assert_eq!(node.cluster.as_deref(), Some("c1"));
    }
    let calls = harness.tool.calls();
    assert_eq!(calls.len(), 1);
    let endpoints: Vec<String> = calls[0].1.iter().map(|m| m.endpoint()).collect();
    assert_eq!(endpoints, vec!["100.64.0.1:9000", "100.64.0.2:9000"]);
    assert!(harness.ledger.snapshot().unwrap().claim("a").is_none());
}

#[test]
fn alias_order_is_passed_through() {
    let harness = Harness::new();
    healthy_pair(&harness);
    harness
        .orchestrator
        .form_cluster("c1", &aliases(&["b", "a"]), now(), &CancellationToken::new())
        .unwrap();
    let members: Vec<String> = harness.tool.calls()[0]
        .1
        .iter()
        .map(|m| m.alias.clone())
        .collect();
    assert_eq!(members, vec!["b", "a"]);
}

#[test]
fn unknown_alias_is_not_found_and_creates_nothing() {
    let harness = Harness::new();
    harness.register("a", 1);
    let before = harness.registry.get_node("a").unwrap();

    let err = harness
        .orchestrator
        .form_cluster("c2", &aliases(&["a", "x"]), now(), &CancellationToken::new())
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(harness.orchestrator.get_cluster_status("c2").unwrap_err().is_not_found());
    assert_eq!(harness.registry.get_node("a").unwrap(), before);
    assert_eq!(harness.tool.call_count(), 0);
}

#[test]
fn malformed_alias_lists_are_validation_errors() {
    let harness = Harness::new();
    healthy_pair(&harness);
    let token = CancellationToken::new();
    for list in [vec!["a"], vec!["a", "a"], vec![]] {
        let err = harness
            .orchestrator
            .form_cluster("c1", &aliases(&list), now(), &token)
            .unwrap_err();
        assert!(err.is_validation(), "{list:?}: {err}");
    }
    assert!(harness.orchestrator.list_clusters().unwrap().is_empty());
}

#[test]
fn member_of_active_cluster_conflicts_before_tool_runs() {
    let harness = Harness::new();
    healthy_pair(&harness);
    harness.register("c", 3);
    let token = CancellationToken::new();
    harness
        .orchestrator
        .form_cluster("c1", &aliases(&["a", "b"]), now(), &token)
        .unwrap();

    let err = harness
        .orchestrator
        .form_cluster("c3", &aliases(&["a", "c"]), now(), &token)
        .unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(harness.tool.call_count(), 1);

    let err = harness
        .orchestrator
        .form_cluster("c1", &aliases(&["c", "b"]), now(), &token)
        .unwrap_err();
    assert!(err.is_conflict());
}

#[test]
fn exhausted_transient_failures_leave_cluster_failed_and_empty() {
    let harness = Harness::new();
    healthy_pair(&harness);
    harness
        .tool
        .always(Err(ToolError::transient("connection refused")), 10);

    let cluster = harness
        .orchestrator
        .form_cluster("c1", &aliases(&["a", "b"]), now(), &CancellationToken::new())
        .unwrap();
    assert_eq!(cluster.status, ClusterStatus::Failed);
    assert!(cluster.members.is_empty());
    assert_eq!(cluster.attempts, 3);
    assert_eq!(harness.tool.call_count(), 3);
    assert!(cluster.last_error.as_ref().is_some_and(ToolError::is_transient));

    let status = harness.orchestrator.get_cluster_status("c1").unwrap();
    assert_eq!(status.status, ClusterStatus::Failed);
    assert!(status.members.is_empty());
    for name in ["a", "b"] {
        assert_eq!(harness.registry.get_node(name).unwrap().cluster, None);
    }

    // Members of a failed cluster are free to join another one.
    let retry = harness
        .orchestrator
        .form_cluster("c2", &aliases(&["a", "b"]), now(), &CancellationToken::new())
        .unwrap();
    assert_eq!(retry.status, ClusterStatus::Active);
}

#[test]
fn transient_failure_then_success_activates() {
    let harness = Harness::new();
    healthy_pair(&harness);
    harness
        .tool
        .script([Err(ToolError::transient("i/o timeout")), Ok(())]);
    let cluster = harness
        .orchestrator
        .form_cluster("c1", &aliases(&["a", "b"]), now(), &CancellationToken::new())
        .unwrap();
    assert_eq!(cluster.status, ClusterStatus::Active);
    assert_eq!(cluster.attempts, 2);
}

#[test]
fn permanent_failure_is_not_retried() {
    let harness = Harness::new();
    healthy_pair(&harness);
    harness
        .tool
        .script([Err(ToolError::permanent("sites have conflicting buckets"))]);
    let cluster = harness
        .orchestrator
        .form_cluster("c1", &aliases(&["a", "b"]), now(), &CancellationToken::new())
        .unwrap();
    assert_eq!(cluster.status, ClusterStatus::Failed);
    assert_eq!(harness.tool.call_count(), 1);
    assert_eq!(
        cluster.diagnostic.as_deref(),
        Some("sites have conflicting buckets")
    );
}

#[test]
fn concurrent_formations_with_overlapping_aliases_have_one_winner() {
    let harness = Arc::new(Harness::new());
    for (i, name) in ["a", "b", "c", "d"].iter().enumerate() {
        harness.register(name, i as u8 + 1);
    }
    let requests = [
        ("c1", vec!["a", "b"]),
        ("c1", vec!["b", "c"]),
        ("c2", vec!["a", "c"]),
        ("c3", vec!["b", "d"]),
        ("c1", vec!["c", "d"]),
    ];
    let barrier = Arc::new(Barrier::new(requests.len()));
    let handles: Vec<_> = requests
        .iter()
        .map(|(name, members)| {
            let harness = Arc::clone(&harness);
            let barrier = Arc::clone(&barrier);
            let name = name.to_string();
            let members = aliases(members);
            thread::spawn(move || {
                barrier.wait();
                harness
                    .orchestrator
                    .form_cluster(&name, &members, now(), &CancellationToken::new())
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    for result in &results {
        match result {
            Ok(cluster) => assert_eq!(cluster.status, ClusterStatus::Active),
            Err(err) => assert!(err.is_conflict(), "unexpected error: {err}"),
        }
    }
    // Every winner owns distinct nodes and a distinct name.
    let clusters = harness.orchestrator.list_clusters().unwrap();
    let mut owned: Vec<String> = clusters.iter().flat_map(|c| c.members.clone()).collect();
    let total = owned.len();
    owned.sort();
    owned.dedup();
    assert_eq!(owned.len(), total);
    let successes = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, clusters.len());
    assert_eq!(harness.tool.call_count(), successes);
    for node in harness.registry.list_nodes().unwrap() {
        let owner = clusters.iter().find(|c| c.members.contains(&node.name));
        assert_eq!(node.cluster.as_deref(), owner.map(|c| c.name.as_str()));
    }
}

#[test]
fn same_name_formations_resolve_to_one_tool_invocation() {
    let harness = Arc::new(Harness::new());
    for (i, name) in ["a", "b", "c"].iter().enumerate() {
        harness.register(name, i as u8 + 1);
    }
    let contenders = 6;
    let barrier = Arc::new(Barrier::new(contenders));
    let handles: Vec<_> = (0..contenders)
        .map(|i| {
            let harness = Arc::clone(&harness);
            let barrier = Arc::clone(&barrier);
            let members = if i % 2 == 0 { ["a", "b"] } else { ["b", "c"] };
            thread::spawn(move || {
                barrier.wait();
                harness.orchestrator.form_cluster(
                    "shared",
                    &aliases(&members),
                    now(),
                    &CancellationToken::new(),
                )
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(ControlPlaneError::is_conflict));
    assert_eq!(harness.tool.call_count(), 1);
}

#[test]
fn cancellation_stops_retries_after_in_flight_attempt() {
    let harness = Arc::new(Harness::new());
    healthy_pair(&harness);
    harness
        .tool
        .always(Err(ToolError::transient("connection reset")), 10);
    harness.tool.arm_gate();
    let token = CancellationToken::new();

    let worker = {
        let harness = Arc::clone(&harness);
        let token = token.clone();
        thread::spawn(move || {
            harness
                .orchestrator
                .form_cluster("c1", &aliases(&["a", "b"]), now(), &token)
        })
    };
    assert!(harness.tool.wait_entered(Duration::from_secs(5)));
    assert_eq!(
        harness.orchestrator.get_cluster_status("c1").unwrap().status,
        ClusterStatus::Forming
    );
    token.cancel();
    harness.tool.release();

    let cluster = worker.join().unwrap().unwrap();
    assert_eq!(cluster.status, ClusterStatus::Failed);
    assert!(cluster.members.is_empty());
    assert_eq!(harness.tool.call_count(), 1);
}

#[test]
fn cancelled_before_first_attempt_never_invokes_tool() {
    let harness = Harness::new();
    healthy_pair(&harness);
    let token = CancellationToken::new();
    token.cancel();
    let cluster = harness
        .orchestrator
        .form_cluster("c1", &aliases(&["a", "b"]), now(), &token)
        .unwrap();
    assert_eq!(cluster.status, ClusterStatus::Failed);
    assert_eq!(cluster.attempts, 0);
    assert_eq!(harness.tool.call_count(), 0);
}

#[test]
fn unhealthy_aliases_are_rejected() {
    let harness = Harness::new();
    healthy_pair(&harness);
    harness.probe.set_down("100.64.0.2", true);
    harness.registry.probe_node("b", now()).unwrap();

    let err = harness
        .orchestrator
        .form_cluster("c1", &aliases(&["a", "b"]), now(), &CancellationToken::new())
        .unwrap_err();
    assert!(err.is_validation());

    harness.registry.deregister_node("b", now()).unwrap();
    let err = harness
        .orchestrator
        .form_cluster("c1", &aliases(&["a", "b"]), now(), &CancellationToken::new())
        .unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(harness.tool.call_count(), 0);
}

#[test]
fn pending_aliases_are_reprobed_before_formation() {
    let harness = Harness::new();
    harness.probe.set_down("100.64.0.1", true);
    healthy_pair(&harness);
    assert_eq!(harness.registry.get_node("a").unwrap().status, NodeStatus::Pending);

    let err = harness
        .orchestrator
        .form_cluster("c1", &aliases(&["a", "b"]), now(), &CancellationToken::new())
        .unwrap_err();
    assert!(err.is_validation());
    assert_eq!(
        harness.registry.get_node("a").unwrap().status,
        NodeStatus::Unreachable
    );

    harness.probe.set_down("100.64.0.1", false);
    harness.registry.probe_node("a", now()).unwrap();
    let cluster = harness
        .orchestrator
        .form_cluster("c1", &aliases(&["a", "b"]), now(), &CancellationToken::new())
        .unwrap();
    assert_eq!(cluster.status, ClusterStatus::Active);
    assert_eq!(harness.registry.get_node("a").unwrap().status, NodeStatus::Healthy);
}

#[test]
fn cluster_members_cannot_be_deregistered() {
    let harness = Harness::new();
    healthy_pair(&harness);
    harness
        .orchestrator
        .form_cluster("c1", &aliases(&["a", "b"]), now(), &CancellationToken::new())
        .unwrap();
    let err = harness.registry.deregister_node("a", now()).unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(harness.registry.get_node("a").unwrap().status, NodeStatus::Healthy);
}

#[test]
fn tool_success_records_active_even_with_a_member_down() {
    let harness = Harness::new();
    healthy_pair(&harness);
    harness.tool.arm_gate();
    let orchestrator = Arc::clone(&harness.orchestrator);
    let worker = thread::spawn(move || {
        orchestrator.form_cluster("c1", &aliases(&["a", "b"]), now(), &CancellationToken::new())
    });
    assert!(harness.tool.wait_entered(Duration::from_secs(5)));

    harness.probe.set_down("100.64.0.2", true);
    harness.registry.probe_node("b", now()).unwrap();
    harness.tool.release();
    let cluster = worker.join().unwrap().unwrap();
    assert_eq!(cluster.status, ClusterStatus::Active);
    assert_eq!(cluster.members, vec!["a", "b"]);

    // Member health is folded in by reconciliation, not by formation.
    let cluster = harness.orchestrator.reconcile_cluster("c1", now()).unwrap();
    assert_eq!(cluster.status, ClusterStatus::Degraded);
}

#[test]
fn reconcile_follows_member_health() {
    let harness = Harness::new();
    healthy_pair(&harness);
    harness
        .orchestrator
        .form_cluster("c1", &aliases(&["a", "b"]), now(), &CancellationToken::new())
        .unwrap();

    harness.probe.set_down("100.64.0.2", true);
    harness.registry.probe_node("b", now()).unwrap();
    let cluster = harness.orchestrator.reconcile_cluster("c1", now()).unwrap();
    assert_eq!(cluster.status, ClusterStatus::Degraded);
    assert_eq!(cluster.members, vec!["a", "b"]);
    assert!(harness.registry.deregister_node("b", now()).unwrap_err().is_conflict());

    harness.probe.set_down("100.64.0.2", false);
    harness.registry.probe_node("b", now()).unwrap();
    let cluster = harness.orchestrator.reconcile_cluster("c1", now()).unwrap();
    assert_eq!(cluster.status, ClusterStatus::Active);
}

#[test]
fn adding_members_is_unsupported() {
    let harness = Harness::new();
    healthy_pair(&harness);
    harness.register("c", 3);
    harness
        .orchestrator
        .form_cluster("c1", &aliases(&["a", "b"]), now(), &CancellationToken::new())
        .unwrap();
    let err = harness
        .orchestrator
        .add_members("c1", &aliases(&["c"]))
        .unwrap_err();
    assert!(matches!(err, ControlPlaneError::UnsupportedOperation(_)));
    let err = harness
        .orchestrator
        .add_members("nope", &aliases(&["c"]))
        .unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn stale_formations_are_failed_on_recovery() {
    let harness = Harness::new();
    healthy_pair(&harness);
    harness.tool.arm_gate();
    let token = CancellationToken::new();
    let orchestrator = Arc::clone(&harness.orchestrator);
    let tool = Arc::clone(&harness.tool);
    let worker = thread::spawn(move || {
        orchestrator.form_cluster("c1", &aliases(&["a", "b"]), now(), &token)
    });
    assert!(harness.tool.wait_entered(Duration::from_secs(5)));

    // The in-flight formation holds its cluster lock and is left alone.
    assert!(harness
        .orchestrator
        .fail_stale_formations(now())
        .unwrap()
        .is_empty());
    tool.release();
    assert_eq!(
        worker.join().unwrap().unwrap().status,
        ClusterStatus::Active
    );
}
