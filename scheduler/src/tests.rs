// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use crate::{Instance, InstanceOptions};

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::timeout;

use backplane::{
    operation_channel, Backplane, BackplaneConfig, MemoryBackplane, StaticCasResolver,
};
use hashing::Digest;
use remexec::{ActionResult, Code, Operation, RequestMetadata, Stage};
use task_executor::Executor;
use testutil::{StubCas, TestAction, TestData};
use watchers::Observer;

const STUB_WORKER: &str = "stub:0";

struct Fixture {
    backplane: Arc<MemoryBackplane>,
    instance: Instance,
    cas: Arc<StubCas>,
    resolver: Arc<StaticCasResolver>,
}

async fn fixture() -> Fixture {
    fixture_with(BackplaneConfig::default(), InstanceOptions::default()).await
}

async fn fixture_with(
    backplane_config: BackplaneConfig,
    instance_options: InstanceOptions,
) -> Fixture {
    let backplane = Arc::new(MemoryBackplane::new(backplane_config));
    let resolver = Arc::new(StaticCasResolver::new());
    let cas = StubCas::empty();
    resolver.register(STUB_WORKER, cas.clone());
    backplane.add_worker(STUB_WORKER).await.unwrap();

    let instance = Instance::new(
        backplane.clone(),
        resolver.clone(),
        Executor::new(),
        instance_options,
    );
    instance.start().await;
    Fixture {
        backplane,
        instance,
        cas,
        resolver,
    }
}

async fn seed_sync(fixture: &Fixture, action: &TestAction) {
    for (digest, bytes) in action.all_blobs() {
        fixture.cas.insert(digest, bytes);
        fixture
            .backplane
            .adjust_blob_locations(digest, &[STUB_WORKER.to_owned()], &[])
            .await
            .unwrap();
    }
}

fn observer() -> (Observer, mpsc::UnboundedReceiver<Option<Operation>>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        Box::new(move |message| sender.send(message).map_err(|e| e.to_string())),
        receiver,
    )
}

/// Collects observations until a terminal one (done operation or expiry None) arrives.
async fn collect_until_terminal(
    receiver: &mut mpsc::UnboundedReceiver<Option<Operation>>,
) -> Vec<Option<Operation>> {
    let mut observed = Vec::new();
    loop {
        let message = timeout(Duration::from_secs(10), receiver.recv())
            .await
            .expect("timed out waiting for a terminal observation")
            .expect("watcher delivery ended early");
        let terminal = match &message {
            Some(operation) => operation.done,
            None => true,
        };
        observed.push(message);
        if terminal {
            return observed;
        }
    }
}

#[tokio::test]
async fn cached_hit_completes_without_touching_workers() {
    let fixture = fixture().await;
    let action = TestAction::echo_to_output();

    // Pre-populate the action cache.
    fixture
        .backplane
        .put_action_result(
            action.action_digest(),
            ActionResult {
                exit_code: 0,
                ..ActionResult::default()
            },
        )
        .await
        .unwrap();

    let (watcher, mut receiver) = observer();
    let (_name, _handle) = fixture
        .instance
        .execute(
            action.action_digest(),
            false,
            RequestMetadata::default(),
            watcher,
        )
        .await
        .unwrap();

    let observed = collect_until_terminal(&mut receiver).await;
    let terminal = observed.last().unwrap().as_ref().unwrap();
    assert_eq!(terminal.stage, Stage::Completed);
    assert!(terminal.cached_result);
    // The worker CAS was never consulted.
    assert_eq!(fixture.cas.request_count(), 0);
}

#[tokio::test]
async fn queues_through_all_stages_then_matches_exactly_once() {
    let fixture = fixture().await;
    let action = TestAction::echo_to_output();
    seed_sync(&fixture, &action).await;

    let (watcher, mut receiver) = observer();
    let (name, _handle) = fixture
        .instance
        .execute(
            action.action_digest(),
            false,
            RequestMetadata::default(),
            watcher,
        )
        .await
        .unwrap();

    // Observe the operation reach QUEUED, through monotonic stages.
    let mut stages = Vec::new();
    loop {
        let message = timeout(Duration::from_secs(10), receiver.recv())
            .await
            .expect("timed out waiting for QUEUED")
            .expect("watcher delivery ended early");
        let operation = message.expect("no expiry expected");
        stages.push(operation.stage);
        if operation.stage == Stage::Queued {
            break;
        }
    }
    let mut sorted = stages.clone();
    sorted.sort();
    assert_eq!(stages, sorted, "stages must be non-decreasing: {stages:?}");

    // A worker match returns exactly this entry; a second concurrent take gets nothing.
    let entry = fixture
        .backplane
        .dispatch_operation()
        .await
        .unwrap()
        .expect("the queued entry");
    assert_eq!(entry.execute_entry.operation_name, name);
    // The queued operation blob was uploaded to the CAS before the entry was enqueued.
    assert!(fixture.cas.contains(entry.queued_operation_digest));
    assert_eq!(fixture.backplane.dispatch_operation().await.unwrap(), None);
}

#[tokio::test]
async fn missing_command_is_a_precondition_failure() {
    let fixture = fixture().await;
    let action = TestAction::cat_roland();
    seed_sync(&fixture, &action).await;
    // Remove the command blob everywhere.
    fixture.cas.remove(action.command_digest());
    fixture
        .backplane
        .adjust_blob_locations(action.command_digest(), &[], &[STUB_WORKER.to_owned()])
        .await
        .unwrap();

    let (watcher, mut receiver) = observer();
    let (_name, _handle) = fixture
        .instance
        .execute(
            action.action_digest(),
            false,
            RequestMetadata::default(),
            watcher,
        )
        .await
        .unwrap();

    let observed = collect_until_terminal(&mut receiver).await;
    // The operation never reached EXECUTING.
    for message in &observed {
        let operation = message.as_ref().unwrap();
        assert_ne!(operation.stage, Stage::Executing);
    }
    let terminal = observed.last().unwrap().as_ref().unwrap();
    let error = terminal.error.as_ref().expect("terminal error");
    assert_eq!(error.code, Code::FailedPrecondition);
    assert_eq!(error.violations.len(), 1);
    assert_eq!(error.violations[0].violation_type, "MISSING");
    assert_eq!(
        error.violations[0].subject,
        format!("blobs/{}", action.command_digest())
    );
}

#[tokio::test]
async fn retried_request_metadata_skips_the_cache() {
    let fixture = fixture().await;
    let action = TestAction::echo_to_output();
    seed_sync(&fixture, &action).await;
    fixture
        .backplane
        .put_action_result(
            action.action_digest(),
            ActionResult {
                exit_code: 0,
                ..ActionResult::default()
            },
        )
        .await
        .unwrap();

    let request_metadata = RequestMetadata {
        tool_name: "test".to_owned(),
        action_id: "retry-me".to_owned(),
        ..RequestMetadata::default()
    };

    // First submission is served from the cache.
    let (watcher, mut receiver) = observer();
    let (_name, _handle) = fixture
        .instance
        .execute(
            action.action_digest(),
            false,
            request_metadata.clone(),
            watcher,
        )
        .await
        .unwrap();
    let observed = collect_until_terminal(&mut receiver).await;
    assert!(observed.last().unwrap().as_ref().unwrap().cached_result);

    // The identical retry is forced past the cache and lands on the ready queue.
    let (watcher, mut receiver) = observer();
    let (name, _handle) = fixture
        .instance
        .execute(action.action_digest(), false, request_metadata, watcher)
        .await
        .unwrap();
    loop {
        let message = timeout(Duration::from_secs(10), receiver.recv())
            .await
            .expect("timed out waiting for QUEUED")
            .expect("watcher delivery ended early");
        let operation = message.expect("no expiry expected");
        assert!(!operation.cached_result);
        if operation.stage == Stage::Queued {
            break;
        }
    }
    let entry = fixture
        .backplane
        .dispatch_operation()
        .await
        .unwrap()
        .expect("the requeued entry");
    assert_eq!(entry.execute_entry.operation_name, name);
    assert!(entry.execute_entry.skip_cache_lookup);
}

#[tokio::test]
async fn admission_control_rejects_when_prequeue_full() {
    let fixture = fixture_with(
        BackplaneConfig {
            prequeue_capacity: 0,
            ..BackplaneConfig::default()
        },
        InstanceOptions::default(),
    )
    .await;
    let (watcher, _receiver) = observer();
    let err = fixture
        .instance
        .execute(
            Digest::of_bytes(b"action"),
            false,
            RequestMetadata::default(),
            watcher,
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::Unavailable);
}

#[tokio::test]
async fn timed_out_dispatch_is_requeued_by_the_monitor() {
    let fixture = fixture_with(
        BackplaneConfig {
            dispatch_deadline_ms: 200,
            ..BackplaneConfig::default()
        },
        InstanceOptions {
            monitor_interval: Duration::from_millis(100),
            ..InstanceOptions::default()
        },
    )
    .await;
    let action = TestAction::echo_to_output();
    seed_sync(&fixture, &action).await;

    let (watcher, _receiver) = observer();
    let (name, _handle) = fixture
        .instance
        .execute(
            action.action_digest(),
            false,
            RequestMetadata::default(),
            watcher,
        )
        .await
        .unwrap();

    // Wait for the entry, claim it, then go quiet (no polls).
    let entry = loop {
        if let Some(entry) = fixture.backplane.dispatch_operation().await.unwrap() {
            break entry;
        }
    };
    assert_eq!(entry.execute_entry.operation_name, name);

    // The monitor notices the expired deadline and hands the operation back out.
    let requeued = timeout(Duration::from_secs(10), async {
        loop {
            if let Some(entry) = fixture.backplane.dispatch_operation().await.unwrap() {
                break entry;
            }
        }
    })
    .await
    .expect("the operation was not requeued");
    assert_eq!(requeued.execute_entry.operation_name, name);
}

#[tokio::test]
async fn watcher_expiry_delivers_terminal_none_without_touching_others() {
    let fixture = fixture_with(
        BackplaneConfig::default(),
        InstanceOptions {
            expire_sweep_interval: Duration::from_millis(100),
            ..InstanceOptions::default()
        },
    )
    .await;
    let action = TestAction::echo_to_output();
    let other_action = TestAction::cat_roland();
    seed_sync(&fixture, &action).await;
    seed_sync(&fixture, &other_action).await;

    let (watcher, mut receiver) = observer();
    let (name, _handle) = fixture
        .instance
        .execute(
            action.action_digest(),
            false,
            RequestMetadata::default(),
            watcher,
        )
        .await
        .unwrap();
    let (other_watcher, mut other_receiver) = observer();
    let (other_name, _other_handle) = fixture
        .instance
        .execute(
            other_action.action_digest(),
            false,
            RequestMetadata::default(),
            other_watcher,
        )
        .await
        .unwrap();

    // Drain the transform-time transitions for the watched operation.
    loop {
        let message = timeout(Duration::from_secs(10), receiver.recv())
            .await
            .expect("timed out waiting for QUEUED")
            .expect("watcher delivery ended early");
        if message.expect("no expiry yet").stage == Stage::Queued {
            break;
        }
    }

    // Force the first operation's watcher past its deadline; the sweeper publishes expire and
    // the subscriber delivers the terminal None.
    let hub = fixture.instance.watcher_hub();
    hub.reset_watchers(
        &operation_channel(&name),
        Instant::now() - Duration::from_secs(1),
    );
    let message = timeout(Duration::from_secs(10), receiver.recv())
        .await
        .expect("timed out waiting for expiry")
        .expect("watcher delivery ended early");
    assert_eq!(message, None);
    assert_eq!(hub.watcher_count(&operation_channel(&name)), 0);

    // The unrelated operation's watcher is unaffected and still sees transitions.
    assert_eq!(hub.watcher_count(&operation_channel(&other_name)), 1);
    loop {
        let message = timeout(Duration::from_secs(10), other_receiver.recv())
            .await
            .expect("timed out waiting for the other operation")
            .expect("watcher delivery ended early");
        if message.expect("no expiry for the healthy watcher").stage == Stage::Queued {
            break;
        }
    }
}

#[tokio::test]
async fn watch_operation_returns_current_state() {
    let fixture = fixture().await;

    let (watcher, _receiver) = observer();
    let err = fixture
        .instance
        .watch_operation("nope", watcher)
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::NotFound);

    let done = Operation::completed_with_error("op-done", remexec::Status::cancelled("test"));
    fixture.backplane.put_operation(&done).await.unwrap();
    let (watcher, _receiver) = observer();
    let (operation, handle) = fixture
        .instance
        .watch_operation("op-done", watcher)
        .await
        .unwrap();
    assert!(operation.done);
    assert!(handle.is_none());
}

#[tokio::test]
async fn find_missing_blobs_narrows_across_workers() {
    let fixture = fixture().await;
    let roland = TestData::roland();
    let catnip = TestData::catnip();
    let absent = TestData::robin();

    // A second worker holding a different blob.
    let other = StubCas::new(
        [(catnip.digest(), catnip.bytes())].into_iter().collect(),
    );
    fixture.resolver.register("stub:1", other);
    fixture.backplane.add_worker("stub:1").await.unwrap();
    fixture.cas.insert(roland.digest(), roland.bytes());

    let missing = fixture
        .instance
        .find_missing_blobs(vec![roland.digest(), catnip.digest(), absent.digest()])
        .await
        .unwrap();
    assert_eq!(missing, vec![absent.digest()]);
}

#[tokio::test]
async fn find_missing_blobs_drops_unavailable_workers() {
    let fixture = fixture().await;
    let broken = StubCas::empty();
    broken.fail_with(Code::Unavailable);
    fixture.resolver.register("stub:broken", broken);
    fixture.backplane.add_worker("stub:broken").await.unwrap();

    let roland = TestData::roland();
    fixture.cas.insert(roland.digest(), roland.bytes());

    let missing = fixture
        .instance
        .find_missing_blobs(vec![roland.digest()])
        .await
        .unwrap();
    assert!(missing.is_empty());
    // The broken worker was removed from the set. The membership read cache may serve a stale
    // list briefly, so read through the backplane after its removal propagated.
    for _ in 0..100 {
        let workers = fixture.backplane.workers().await.unwrap();
        if !workers.contains(&"stub:broken".to_owned()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("unavailable worker was not removed");
}

#[tokio::test]
async fn get_blob_corrects_stale_locations() {
    let fixture = fixture().await;
    let roland = TestData::roland();
    // The blob exists on the worker, but the location index has no idea.
    fixture.cas.insert(roland.digest(), roland.bytes());

    let bytes = fixture
        .instance
        .get_blob(roland.digest(), 0, None)
        .await
        .unwrap();
    assert_eq!(bytes, roland.bytes());
    // The correction pass wrote the observed truth back.
    let locations = fixture
        .backplane
        .blob_locations(roland.digest())
        .await
        .unwrap();
    assert!(locations.contains(STUB_WORKER));
}

#[tokio::test]
async fn get_blob_of_absent_blob_is_not_found() {
    let fixture = fixture().await;
    let err = fixture
        .instance
        .get_blob(TestData::roland().digest(), 0, None)
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::NotFound);
}

#[tokio::test]
async fn get_blob_reads_ranges() {
    let fixture = fixture().await;
    let data = TestData::fourty_chars();
    fixture.cas.insert(data.digest(), data.bytes());
    fixture
        .backplane
        .adjust_blob_locations(data.digest(), &[STUB_WORKER.to_owned()], &[])
        .await
        .unwrap();

    let bytes = fixture
        .instance
        .get_blob(data.digest(), 10, Some(5))
        .await
        .unwrap();
    assert_eq!(&bytes[..], &data.bytes()[10..15]);
}
