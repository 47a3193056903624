// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use crate::{Farm, FarmConfig};

use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::timeout;

use backplane::Backplane;
use remexec::{Operation, RequestMetadata, Stage};
use task_executor::Executor;
use testutil::TestAction;

fn farm_config(dir: &TempDir) -> FarmConfig {
    let toml = format!(
        r#"
        port = 8980

        [instance]
        name = "test"
        monitor_interval_secs = 1

        [[workers]]
        name = "worker-a:8981"
        cache_root = "{}"
        exec_root = "{}"
        "#,
        dir.path().join("cas").display(),
        dir.path().join("exec").display(),
    );
    toml::from_str(&toml).unwrap()
}

async fn start_farm(dir: &TempDir) -> Farm {
    let farm = Farm::build(&farm_config(dir), Executor::new(), true)
        .await
        .unwrap();
    farm.start().await.unwrap();
    farm
}

async fn submit_and_await(farm: &Farm, action: &TestAction) -> Operation {
    let (sender, mut receiver) = mpsc::unbounded_channel();
    let watcher: watchers::Observer =
        Box::new(move |message| sender.send(message).map_err(|e| e.to_string()));
    let (_name, _handle) = farm
        .instance
        .as_ref()
        .unwrap()
        .execute(
            action.action_digest(),
            false,
            RequestMetadata::default(),
            watcher,
        )
        .await
        .unwrap();

    loop {
        let message = timeout(Duration::from_secs(30), receiver.recv())
            .await
            .expect("timed out waiting for completion")
            .expect("watcher delivery ended early");
        let operation = message.expect("no expiry expected");
        if operation.done {
            return operation;
        }
    }
}

#[tokio::test]
async fn full_farm_executes_and_then_serves_from_cache() {
    let dir = TempDir::new().unwrap();
    let farm = start_farm(&dir).await;
    let action = TestAction::echo_to_output();
    // Upload through the frontend, the way a ByteStream client would land blobs on the farm.
    let instance = farm.instance.as_ref().unwrap();
    for (digest, bytes) in action.all_blobs() {
        instance.put_blob(digest, bytes).await.unwrap();
    }

    // First run executes on the worker.
    let first = submit_and_await(&farm, &action).await;
    assert_eq!(first.stage, Stage::Completed);
    assert!(!first.cached_result);
    assert!(first.error.is_none());

    // An equivalent submission (different request metadata) is served from the action cache.
    let second = submit_and_await(&farm, &action).await;
    assert!(second.cached_result);

    // The result is fully resolvable: the output blob can be read back through the instance.
    let result = farm
        .backplane
        .get_action_result(action.action_digest())
        .await
        .unwrap()
        .expect("cached result");
    let output_digest = result.output_files[0].digest;
    let bytes = farm
        .instance
        .as_ref()
        .unwrap()
        .get_blob(output_digest, 0, None)
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"meow");

    farm.stop().await;
}

#[tokio::test]
async fn worker_role_builds_without_an_instance() {
    let dir = TempDir::new().unwrap();
    let farm = Farm::build(&farm_config(&dir), Executor::new(), false)
        .await
        .unwrap();
    assert!(farm.instance.is_none());
    assert_eq!(farm.workers.len(), 1);
}

#[test]
fn config_defaults_and_overrides() {
    let config: FarmConfig = toml::from_str(
        r#"
        port = 1234

        [instance]
        name = "shard-7"
        transform_tokens = 16

        [backplane]
        queue_capacity = 8
        "#,
    )
    .unwrap();
    assert_eq!(config.port, 1234);
    assert_eq!(config.instance.name, "shard-7");
    assert_eq!(config.instance.transform_tokens, 16);
    // Unset fields keep their defaults.
    assert_eq!(config.instance.cache_check_deadline_secs, 60);
    assert_eq!(config.backplane.queue_capacity, 8);
    assert_eq!(config.backplane.prequeue_capacity, 1024);
    assert!(config.workers.is_empty());
}

#[test]
fn config_rejects_unknown_fields() {
    toml::from_str::<FarmConfig>("not_a_field = true").unwrap_err();
}

#[test]
fn config_load_reports_missing_files() {
    FarmConfig::load(std::path::Path::new("/does/not/exist.toml")).unwrap_err();
}
