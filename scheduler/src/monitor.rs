// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::sync::Arc;

use backplane::{now_millis, with_retries};
use remexec::{DispatchedOperation, ExecuteResponse, Operation, Stage, Status};

use crate::queuer::validate_queued_operation;
use crate::{fetch, InstanceInner};

///
/// The background loop that returns work lost by dead or stalled workers to the ready queue:
/// any dispatched operation whose requeue deadline has passed is reclaimed.
///
pub(crate) fn spawn_dispatched_monitor(inner: Arc<InstanceInner>) {
    inner.executor.clone().native_spawn(async move {
        let mut stopped = inner.stopped.clone();
        loop {
            tokio::select! {
                _ = stopped.changed() => break,
                _ = tokio::time::sleep(inner.options.monitor_interval) => {}
            }
            if *stopped.borrow() {
                break;
            }

            let dispatched = match inner.backplane.dispatched_operations().await {
                Ok(dispatched) => dispatched,
                Err(e) => {
                    log::warn!("DispatchedMonitor scan failed: {e}");
                    continue;
                }
            };
            let now = now_millis();
            for dispatched_operation in dispatched {
                if dispatched_operation.requeue_at_ms > now {
                    continue;
                }
                let name = dispatched_operation.name.clone();
                if let Err(e) = requeue(&inner, &dispatched_operation).await {
                    let failures = {
                        let mut failures = inner.requeue_failures.lock();
                        let count = failures.entry(name.clone()).or_insert(0);
                        *count += 1;
                        *count
                    };
                    log::warn!("Requeue of {name} failed ({failures} so far): {e}");
                    if failures >= inner.options.requeue_attempt_budget {
                        error_complete_requeue(&inner, &name, e, failures).await;
                    }
                } else {
                    inner.requeue_failures.lock().remove(&name);
                }
            }
        }
    });
}

///
/// Reclaims one timed-out dispatched operation: a completed or cache-served operation is
/// finished off, anything else is re-validated and pushed straight back onto the ready queue
/// (no prequeue transform; the QueuedOperation blob already exists).
///
pub(crate) async fn requeue(
    inner: &Arc<InstanceInner>,
    dispatched_operation: &DispatchedOperation,
) -> Result<(), Status> {
    let name = &dispatched_operation.name;
    let entry = &dispatched_operation.queue_entry;

    // A terminal operation needs no requeue, just removal from the dispatched map.
    if let Some(operation) = inner.backplane.get_operation(name).await? {
        if operation.done {
            inner.backplane.complete_operation(name).await?;
            return Ok(());
        }
    }

    // The action may have completed elsewhere since this was dispatched.
    if !entry.execute_entry.skip_cache_lookup {
        if let Some(result) = inner
            .backplane
            .get_action_result(entry.execute_entry.action_digest)
            .await?
        {
            let response = ExecuteResponse {
                result,
                cached_result: true,
                status: Status::ok(),
            };
            let operation = Operation::completed(name.clone(), response);
            inner.backplane.put_operation(&operation).await?;
            log::info!("Completed {name} from the action cache during requeue");
            return Ok(());
        }
    }

    // Re-validate before handing the entry back to workers.
    let bytes = fetch::fetch_blob(inner, entry.queued_operation_digest)
        .await
        .map_err(|status| {
            if status.code == remexec::Code::NotFound {
                Status::missing_blobs([entry.queued_operation_digest])
            } else {
                status
            }
        })?;
    let queued_operation = remexec::decode(&bytes)?;
    validate_queued_operation(&queued_operation)?;

    let requeued = with_retries("requeue_dispatched_operation", || {
        inner.backplane.requeue_dispatched_operation(name)
    })
    .await?;
    if requeued {
        let operation = Operation::new(name.clone()).with_stage(Stage::Queued);
        with_retries("put_operation", || inner.backplane.put_operation(&operation)).await?;
        log::info!("Requeued {name} after its worker went quiet");
    }
    Ok(())
}

///
/// A requeue that keeps failing is not going to succeed; surface a terminal taxonomy error so
/// watchers stop waiting.
///
async fn error_complete_requeue(
    inner: &Arc<InstanceInner>,
    name: &str,
    status: Status,
    attempts: usize,
) {
    inner.requeue_failures.lock().remove(name);
    let error = if matches!(
        status.code,
        remexec::Code::FailedPrecondition | remexec::Code::InvalidArgument
    ) {
        status
    } else {
        Status::internal(format!(
            "Operation could not be requeued after {attempts} attempts: {status}"
        ))
    };
    let operation = Operation::completed_with_error(name, error);
    if let Err(e) =
        with_retries("put_operation", || inner.backplane.put_operation(&operation)).await
    {
        log::error!("Failed to error-complete {name}: {e}");
    }
}
