//! Bus integration tests over in-memory pipes.

mod common;

use std::time::Duration;

use common::{connect, recorder, Node, SilentPeer};
use dispatchertron_lib::bus::{DispatchError, DispatchOutcome};
use dispatchertron_lib::ipc::{Channel, EventKind, WireMessage};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

const DEADLINE: Duration = Duration::from_secs(5);

async fn within<F: std::future::Future>(future: F) -> F::Output {
    tokio::time::timeout(DEADLINE, future)
        .await
        .expect("operation did not finish in time")
}

/// A coordinator linked to two workers.
fn star(coordinator: usize, first: usize, second: usize) -> (Node, Node, Node) {
    let hub = Node::start("coordinator").with_listeners(coordinator);
    let w1 = Node::start("worker-1").with_listeners(first);
    let w2 = Node::start("worker-2").with_listeners(second);
    connect(&hub, &w1);
    connect(&hub, &w2);
    (hub, w1, w2)
}

#[tokio::test]
async fn test_total_listener_count_spans_processes() {
    let (hub, w1, w2) = star(5, 4, 8);

    let total = within(hub.dispatcher.get_num_listeners()).await.unwrap();
    assert_eq!(total, 17);
    assert_eq!(hub.dispatcher.get_num_local_listeners(), 5);

    // A worker only sees the coordinator.
    assert_eq!(within(w1.dispatcher.get_num_listeners()).await.unwrap(), 9);
    assert_eq!(within(w2.dispatcher.get_num_listeners()).await.unwrap(), 13);
}

#[tokio::test]
async fn test_three_workers_of_five_plus_two_local_is_seventeen() {
    let hub = Node::start("coordinator").with_listeners(2);
    let workers: Vec<Node> = (1..=3)
        .map(|n| Node::start(&format!("worker-{n}")).with_listeners(5))
        .collect();
    for worker in &workers {
        connect(&hub, worker);
    }

    assert_eq!(hub.dispatcher.num_peers(), 3);
    assert_eq!(within(hub.dispatcher.get_num_listeners()).await.unwrap(), 17);
    assert_eq!(hub.dispatcher.get_num_local_listeners(), 2);
}

#[tokio::test]
async fn test_payload_arrives_unchanged_in_every_process() {
    let (hub, w1, w2) = star(0, 0, 0);
    let at_hub = recorder(&hub.dispatcher);
    let at_w1 = recorder(&w1.dispatcher);
    let at_w2 = recorder(&w2.dispatcher);

    let payload = json!({
        "text": "grüße, 世界 \"quoted\"\n",
        "numbers": [0, -1, 1.5, 0.125, 9007199254740993u64],
        "nested": {"empty": {}, "list": [], "nothing": null, "flag": true}
    });
    let outcome = within(hub.dispatcher.dispatch(payload.clone())).await.unwrap();

    assert_eq!(
        outcome.report().map(|r| (r.local_listeners, r.peers_acknowledged)),
        Some((1, 2))
    );
    for seen in [&at_hub, &at_w1, &at_w2] {
        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![payload.clone()]);
        assert_eq!(seen[0].to_string(), payload.to_string());
    }
}

#[tokio::test]
async fn test_null_payload_is_delivered_as_null() {
    let hub = Node::start("coordinator");
    let worker = Node::start("worker");
    connect(&hub, &worker);
    let seen = recorder(&worker.dispatcher);

    within(hub.dispatcher.dispatch(Value::Null)).await.unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![Value::Null]);
}

#[tokio::test]
async fn test_clear_empties_every_registry() {
    let (hub, w1, w2) = star(2, 3, 4);
    assert_eq!(within(hub.dispatcher.get_num_listeners()).await.unwrap(), 9);

    let outcome = within(hub.dispatcher.clear()).await.unwrap();
    assert!(!outcome.is_dropped());

    assert_eq!(hub.dispatcher.get_num_local_listeners(), 0);
    assert_eq!(w1.dispatcher.get_num_local_listeners(), 0);
    assert_eq!(w2.dispatcher.get_num_local_listeners(), 0);
    assert_eq!(within(hub.dispatcher.get_num_listeners()).await.unwrap(), 0);

    // New registrations after a clear are counted again.
    w1.dispatcher.register(|_: &Value| {});
    assert_eq!(within(hub.dispatcher.get_num_listeners()).await.unwrap(), 1);
}

#[tokio::test]
async fn test_worker_dispatch_reaches_coordinator_only() {
    let (hub, w1, w2) = star(0, 0, 0);
    let at_hub = recorder(&hub.dispatcher);
    let at_w1 = recorder(&w1.dispatcher);
    let at_w2 = recorder(&w2.dispatcher);

    within(w1.dispatcher.dispatch(json!("from worker-1")))
        .await
        .unwrap();

    assert_eq!(*at_w1.lock().unwrap(), vec![json!("from worker-1")]);
    assert_eq!(*at_hub.lock().unwrap(), vec![json!("from worker-1")]);
    assert!(at_w2.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_consecutive_dispatches_arrive_in_order() {
    let hub = Node::start("coordinator");
    let worker = Node::start("worker");
    connect(&hub, &worker);
    let seen = recorder(&worker.dispatcher);

    for n in 0..10 {
        let outcome = within(hub.dispatcher.dispatch(json!(n))).await.unwrap();
        assert!(!outcome.is_dropped());
    }
    let expected: Vec<Value> = (0..10).map(|n| json!(n)).collect();
    assert_eq!(*seen.lock().unwrap(), expected);
}

#[tokio::test]
async fn test_dispatch_waits_for_slow_peer_and_drops_overlapping_calls() {
    let hub = Node::start("coordinator");
    let worker = Node::start("worker");
    connect(&hub, &worker);
    let at_worker = recorder(&worker.dispatcher);
    let mut silent = SilentPeer::attach(&hub);

    let dispatcher = hub.dispatcher.clone();
    let first = tokio::spawn(async move { dispatcher.dispatch(json!("first")).await });

    let line = within(silent.requests.next_line()).await.unwrap().unwrap();
    let request: WireMessage = serde_json::from_str(&line).unwrap();
    assert_eq!(request.channel, Channel::request(EventKind::Dispatch));
    assert_eq!(request.args.data, Some(json!("first")));
    assert!(hub.dispatcher.is_dispatching());

    let second = within(hub.dispatcher.dispatch(json!("second"))).await.unwrap();
    assert_eq!(second, DispatchOutcome::Dropped);
    let cleared = within(hub.dispatcher.clear()).await.unwrap();
    assert_eq!(cleared, DispatchOutcome::Dropped);

    // The silent peer going away settles the pending broadcast.
    let silent_id = silent.id.clone();
    drop(silent);
    let outcome = within(first).await.unwrap().unwrap();
    let report = outcome.report().copied().unwrap();
    assert_eq!(report.peers_acknowledged, 1);
    assert_eq!(report.peers_vacated, 1);

    assert!(!hub.dispatcher.is_dispatching());
    assert!(!hub.dispatcher.peers().contains(&silent_id));
    assert_eq!(*at_worker.lock().unwrap(), vec![json!("first")]);

    // The guard is free again.
    let third = within(hub.dispatcher.dispatch(json!("third"))).await.unwrap();
    assert!(!third.is_dropped());
}

#[tokio::test]
async fn test_detached_worker_no_longer_counts() {
    let hub = Node::start("coordinator").with_listeners(1);
    let w1 = Node::start("worker-1").with_listeners(2);
    let w2 = Node::start("worker-2").with_listeners(3);
    connect(&hub, &w1);
    let (w2_at_hub, _) = connect(&hub, &w2);
    assert_eq!(within(hub.dispatcher.get_num_listeners()).await.unwrap(), 6);

    assert!(hub.dispatcher.detach_peer(&w2_at_hub));
    assert!(!hub.dispatcher.detach_peer(&w2_at_hub));

    assert_eq!(hub.dispatcher.num_peers(), 1);
    assert_eq!(within(hub.dispatcher.get_num_listeners()).await.unwrap(), 3);
}

#[tokio::test]
async fn test_detach_from_one_side_closes_the_other() {
    let hub = Node::start("coordinator");
    let worker = Node::start("worker");
    let (worker_at_hub, _) = connect(&hub, &worker);
    assert_eq!(worker.dispatcher.num_peers(), 1);

    assert!(hub.dispatcher.detach_peer(&worker_at_hub));

    within(async {
        while worker.dispatcher.num_peers() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert_eq!(within(worker.dispatcher.get_num_listeners()).await.unwrap(), 0);
}

#[tokio::test]
async fn test_remote_listener_faults_are_reported() {
    let hub = Node::start("coordinator");
    let worker = Node::start("worker");
    let (worker_at_hub, _) = connect(&hub, &worker);

    let before = recorder(&worker.dispatcher);
    worker.dispatcher.register(|_: &Value| panic!("worker listener broke"));
    let after = recorder(&worker.dispatcher);
    let at_hub = recorder(&hub.dispatcher);

    let err = within(hub.dispatcher.dispatch(json!(7))).await.unwrap_err();
    let DispatchError::ListenerFaults(faults) = err else {
        panic!("expected listener faults, got {err:?}");
    };
    assert!(faults.local.is_empty());
    assert_eq!(faults.remote.len(), 1);
    assert_eq!(faults.remote[0].peer, worker_at_hub);
    assert!(faults.remote[0].messages[0].contains("worker listener broke"));
    assert_eq!(faults.delivery.peers_acknowledged, 1);

    // Every other listener still ran.
    assert_eq!(*before.lock().unwrap(), vec![json!(7)]);
    assert_eq!(*after.lock().unwrap(), vec![json!(7)]);
    assert_eq!(*at_hub.lock().unwrap(), vec![json!(7)]);

    // A fault does not wedge the guard.
    assert!(!hub.dispatcher.is_dispatching());
}
