// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use backplane::{now_millis, with_retries};
use cas_cache::BlobSource;
use hashing::Digest;
use poller::Poller;
use remexec::{
    ActionResult, Code, Directory, ExecuteResponse, ExecutedActionMetadata, Operation,
    QueueEntry, QueuedOperation, Stage, Status,
};

use crate::execute::{collect_outputs, execute_command, ExecutionOutcome};
use crate::{Worker, WorkerInner};

///
/// The unit that travels the pipeline: everything a stage needs to carry an operation forward.
///
pub struct OperationContext {
    pub queue_entry: QueueEntry,
    pub queued_operation: Option<QueuedOperation>,
    pub exec_dir: Option<PathBuf>,
    pub outcome: Option<ExecutionOutcome>,
    pub metadata: ExecutedActionMetadata,
    /// The stage the liveness poll claims; advanced by each stage before publishing.
    pub stage: Arc<Mutex<Stage>>,
    pub poller: Poller,
    /// Set by the poller when the dispatch claim is lost; the pipeline stops acting on the
    /// operation at the next stage boundary.
    pub claim_lost: Arc<std::sync::atomic::AtomicBool>,
}

impl OperationContext {
    pub fn operation_name(&self) -> &str {
        &self.queue_entry.execute_entry.operation_name
    }

    pub fn claim_lost(&self) -> bool {
        self.claim_lost.load(std::sync::atomic::Ordering::SeqCst)
    }
}

///
/// One bounded pipeline stage. A downstream stage must `claim` a slot before the upstream
/// stage will emit into it, which gives explicit backpressure without unbounded queues: the
/// permit is held from the claim until the stage worker releases it after handing the context
/// onward.
///
pub struct PipelineStage {
    name: &'static str,
    slots: Arc<Semaphore>,
    sender: mpsc::UnboundedSender<(OwnedSemaphorePermit, OperationContext)>,
}

pub struct StageReceiver {
    receiver: mpsc::UnboundedReceiver<(OwnedSemaphorePermit, OperationContext)>,
}

impl PipelineStage {
    pub fn new(name: &'static str, width: usize) -> (PipelineStage, StageReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            PipelineStage {
                name,
                slots: Arc::new(Semaphore::new(width)),
                sender,
            },
            StageReceiver { receiver },
        )
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Reserves a slot in this stage, waiting until one of its workers frees up.
    pub async fn claim(&self) -> Result<OwnedSemaphorePermit, Status> {
        self.slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Status::unavailable(format!("Stage {} shut down", self.name)))
    }

    /// Emits a context into the stage under a previously claimed slot.
    pub fn put(&self, permit: OwnedSemaphorePermit, ctx: OperationContext) {
        if self.sender.send((permit, ctx)).is_err() {
            log::warn!("Stage {} receiver is gone; dropping context", self.name);
        }
    }
}

impl StageReceiver {
    /// Takes the next claimed context; the permit releases the slot when dropped.
    pub async fn take(&mut self) -> Option<(OwnedSemaphorePermit, OperationContext)> {
        self.receiver.recv().await
    }
}

///
/// The MatchStage: claims one InputFetch slot, then blocks on the backplane's dispatch. Runs at
/// width 1.
///
pub(crate) async fn match_loop(worker: Arc<WorkerInner>, fetch_stage: Arc<PipelineStage>) {
    let mut stopped = worker.stopped.clone();
    loop {
        if *stopped.borrow() {
            break;
        }
        let permit = match fetch_stage.claim().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let dispatched = tokio::select! {
            _ = stopped.changed() => break,
            dispatched = with_retries("dispatch_operation", || {
                worker.backplane.dispatch_operation()
            }) => dispatched,
        };
        match dispatched {
            Ok(Some(entry)) => {
                let ctx = start_operation(&worker, entry);
                log::debug!("Matched {}", ctx.operation_name());
                fetch_stage.put(permit, ctx);
            }
            Ok(None) => {}
            Err(e) => {
                log::warn!("Dispatch failed: {e}");
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }
}

///
/// Claims an operation: builds its context and starts the liveness poll against the dispatched
/// map, which keeps renewing the requeue deadline until the operation completes or the claim
/// is lost.
///
fn start_operation(worker: &Arc<WorkerInner>, entry: QueueEntry) -> OperationContext {
    let name = entry.execute_entry.operation_name.clone();
    let stage = Arc::new(Mutex::new(Stage::Queued));
    let claim_lost = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let poller = Poller::new(worker.executor.clone());

    let predicate_backplane = worker.backplane.clone();
    let predicate_stage = stage.clone();
    let predicate_name = name.clone();
    let deadline_ms = worker.options.dispatch_deadline.as_millis() as u64;
    let lost = claim_lost.clone();
    let expired = claim_lost.clone();
    let expiration = Instant::now() + worker.options.max_operation_lifetime;
    let poll_result = poller.resume(
        worker.options.poll_period,
        expiration,
        move || {
            let backplane = predicate_backplane.clone();
            let stage = *predicate_stage.lock();
            let name = predicate_name.clone();
            async move {
                backplane
                    .poll_operation(&name, stage, now_millis() + deadline_ms)
                    .await
                    .unwrap_or(false)
            }
        },
        Box::new(move || {
            log::warn!("Lost the dispatch claim");
            lost.store(true, std::sync::atomic::Ordering::SeqCst);
        }),
        Box::new(move || {
            log::warn!("Operation outlived its maximum lifetime");
            expired.store(true, std::sync::atomic::Ordering::SeqCst);
        }),
    );
    if let Err(e) = poll_result {
        log::error!("Failed to start the liveness poll for {name}: {e}");
    }

    let metadata = ExecutedActionMetadata {
        worker: worker.options.name.clone(),
        queued_timestamp_ms: entry.execute_entry.queued_at_ms,
        worker_start_timestamp_ms: now_millis(),
        ..ExecutedActionMetadata::default()
    };

    OperationContext {
        queue_entry: entry,
        queued_operation: None,
        exec_dir: None,
        outcome: None,
        metadata,
        stage,
        poller,
        claim_lost,
    }
}

///
/// The InputFetchStage: fetch and decode the QueuedOperation, stage the exec dir.
///
pub(crate) async fn input_fetch_loop(
    worker: Arc<WorkerInner>,
    receiver: Arc<tokio::sync::Mutex<StageReceiver>>,
    execute_stage: Arc<PipelineStage>,
) {
    loop {
        let taken = receiver.lock().await.take().await;
        let Some((permit, mut ctx)) = taken else {
            break;
        };
        if abandon_if_lost(&worker, &ctx).await {
            continue;
        }
        ctx.metadata.input_fetch_start_timestamp_ms = now_millis();
        let result = fetch_inputs(&worker, &mut ctx).await;
        ctx.metadata.input_fetch_completed_timestamp_ms = now_millis();
        match result {
            Ok(()) => match execute_stage.claim().await {
                Ok(next_permit) => {
                    drop(permit);
                    execute_stage.put(next_permit, ctx);
                }
                Err(_) => break,
            },
            Err(status) => fail_operation(&worker, ctx, status).await,
        }
    }
}

async fn fetch_inputs(worker: &Arc<WorkerInner>, ctx: &mut OperationContext) -> Result<(), Status> {
    let digest = ctx.queue_entry.queued_operation_digest;
    let bytes = match worker.cache.read_blob(digest, 0, None).await {
        Ok(bytes) => bytes,
        Err(status) if status.code == Code::NotFound => {
            worker.remote_source.load(digest).await.map_err(|status| {
                if status.code == Code::NotFound {
                    Status::missing_blobs([digest])
                } else {
                    status
                }
            })?
        }
        Err(status) => return Err(status),
    };
    let queued_operation: QueuedOperation = remexec::decode(&bytes)?;

    let index: HashMap<Digest, Directory> =
        queued_operation.directories.iter().cloned().collect();
    let exec_dir = worker
        .exec_fs
        .create_exec_dir(
            ctx.operation_name(),
            queued_operation.action.input_root_digest,
            &index,
            &queued_operation.command.output_files,
            &queued_operation.command.output_directories,
            worker.remote_source.as_ref(),
        )
        .await
        .map_err(|status| {
            if status.code == Code::NotFound {
                Status::missing_blobs([queued_operation.action.input_root_digest])
            } else {
                status
            }
        })?;

    ctx.queued_operation = Some(queued_operation);
    ctx.exec_dir = Some(exec_dir);
    Ok(())
}

///
/// The ExecuteStage: advance to EXECUTING and run the subprocess under the action timeout.
///
pub(crate) async fn execute_loop(
    worker: Arc<WorkerInner>,
    receiver: Arc<tokio::sync::Mutex<StageReceiver>>,
    report_stage: Arc<PipelineStage>,
) {
    loop {
        let taken = receiver.lock().await.take().await;
        let Some((permit, mut ctx)) = taken else {
            break;
        };
        if abandon_if_lost(&worker, &ctx).await {
            continue;
        }

        *ctx.stage.lock() = Stage::Executing;
        let executing = Operation::new(ctx.operation_name()).with_stage(Stage::Executing);
        if let Err(e) = with_retries("put_operation", || {
            worker.backplane.put_operation(&executing)
        })
        .await
        {
            fail_operation(&worker, ctx, e).await;
            continue;
        }

        let queued_operation = ctx
            .queued_operation
            .as_ref()
            .expect("input fetch populated the queued operation");
        let timeout = queued_operation
            .action
            .timeout
            .unwrap_or(worker.options.default_timeout);
        let exec_dir = ctx.exec_dir.clone().expect("input fetch staged the exec dir");

        ctx.metadata.execution_start_timestamp_ms = now_millis();
        let result = execute_command(&exec_dir, &queued_operation.command, timeout).await;
        ctx.metadata.execution_completed_timestamp_ms = now_millis();

        match result {
            Ok(outcome) => {
                ctx.outcome = Some(outcome);
                match report_stage.claim().await {
                    Ok(next_permit) => {
                        drop(permit);
                        report_stage.put(next_permit, ctx);
                    }
                    Err(_) => break,
                }
            }
            Err(status) => fail_operation(&worker, ctx, status).await,
        }
    }
}

///
/// The ReportResultStage: upload outputs, record the ActionResult, publish the terminal
/// Operation, and tear the exec dir down.
///
pub(crate) async fn report_loop(
    worker: Arc<WorkerInner>,
    receiver: Arc<tokio::sync::Mutex<StageReceiver>>,
) {
    loop {
        let taken = receiver.lock().await.take().await;
        let Some((_permit, mut ctx)) = taken else {
            break;
        };
        if abandon_if_lost(&worker, &ctx).await {
            continue;
        }
        match report_result(&worker, &mut ctx).await {
            Ok(()) => {
                let _ = worker.exec_fs.destroy_exec_dir(ctx.operation_name()).await;
                ctx.poller.pause();
                log::debug!("Completed {}", ctx.operation_name());
            }
            Err(status) => fail_operation(&worker, ctx, status).await,
        }
    }
}

async fn report_result(worker: &Arc<WorkerInner>, ctx: &mut OperationContext) -> Result<(), Status> {
    let exec_dir = ctx.exec_dir.clone().expect("exec dir present at report");
    let queued_operation = ctx
        .queued_operation
        .take()
        .expect("queued operation present at report");
    let outcome = ctx.outcome.take().expect("outcome present at report");

    let command = queued_operation.command;
    let collected = {
        let exec_dir = exec_dir.clone();
        let command = command.clone();
        worker
            .executor
            .spawn_blocking(
                move || collect_outputs(&exec_dir, &command),
                |e| Err(Status::internal(format!("Output collection failed: {e}"))),
            )
            .await?
    };

    // Everything the result references must be resolvable from the CAS before the result is
    // visible to anyone.
    for (digest, bytes) in &collected.blobs {
        worker.store_blob(*digest, bytes.clone()).await?;
    }

    // Mirror the live output onto the operation streams named by the request.
    let execute_entry = &ctx.queue_entry.execute_entry;
    if !outcome.stdout.is_empty() {
        with_retries("append_operation_stream", || {
            worker
                .backplane
                .append_operation_stream(&execute_entry.stdout_stream_name, outcome.stdout.clone())
        })
        .await?;
    }
    if !outcome.stderr.is_empty() {
        with_retries("append_operation_stream", || {
            worker
                .backplane
                .append_operation_stream(&execute_entry.stderr_stream_name, outcome.stderr.clone())
        })
        .await?;
    }

    ctx.metadata.worker_completed_timestamp_ms = now_millis();
    let mut result = ActionResult {
        output_files: collected.output_files,
        output_directories: collected.output_directories,
        exit_code: outcome.exit_code,
        execution_metadata: ctx.metadata.clone(),
        ..ActionResult::default()
    };
    attach_std_stream(worker, &mut result, outcome.stdout, true).await?;
    attach_std_stream(worker, &mut result, outcome.stderr, false).await?;

    if !queued_operation.action.do_not_cache {
        let action_key = ctx.queue_entry.execute_entry.action_digest;
        with_retries("put_action_result", || {
            worker
                .backplane
                .put_action_result(action_key, result.clone())
        })
        .await?;
    }

    let response = ExecuteResponse {
        result,
        cached_result: false,
        status: Status::ok(),
    };
    let operation = Operation::completed(ctx.operation_name(), response);
    *ctx.stage.lock() = Stage::Completed;
    with_retries("put_operation", || worker.backplane.put_operation(&operation)).await?;
    Ok(())
}

/// Inline size limit for stdout/stderr; anything larger goes to the CAS by digest.
const STD_STREAM_INLINE_LIMIT: usize = 4096;

async fn attach_std_stream(
    worker: &Arc<WorkerInner>,
    result: &mut ActionResult,
    content: bytes::Bytes,
    is_stdout: bool,
) -> Result<(), Status> {
    if content.len() <= STD_STREAM_INLINE_LIMIT {
        if is_stdout {
            result.stdout_raw = content.to_vec();
        } else {
            result.stderr_raw = content.to_vec();
        }
        return Ok(());
    }
    let digest = Digest::of_bytes(&content);
    worker.store_blob(digest, content).await?;
    if is_stdout {
        result.stdout_digest = Some(digest);
    } else {
        result.stderr_digest = Some(digest);
    }
    Ok(())
}

///
/// The pipeline's error stage: terminal failures surface through a done Operation; everything
/// else abandons the claim so the DispatchedMonitor requeues the operation promptly.
///
pub(crate) async fn fail_operation(
    worker: &Arc<WorkerInner>,
    ctx: OperationContext,
    status: Status,
) {
    let name = ctx.operation_name().to_owned();
    ctx.poller.pause();
    let _ = worker.exec_fs.destroy_exec_dir(&name).await;

    let terminal = matches!(
        status.code,
        Code::FailedPrecondition | Code::InvalidArgument | Code::DeadlineExceeded
    );
    if terminal {
        log::warn!("Completing {name} with error: {status}");
        let operation = Operation::completed_with_error(name.as_str(), status);
        if let Err(e) =
            with_retries("put_operation", || worker.backplane.put_operation(&operation)).await
        {
            log::error!("Failed to record the terminal error for {name}: {e}");
        }
    } else {
        log::warn!("Requeueing {name} after failure: {status}");
        if let Err(e) = worker
            .backplane
            .reset_dispatched_deadline(&name, now_millis())
            .await
        {
            log::error!("Failed to reset the dispatch deadline of {name}: {e}");
        }
    }
}

///
/// A context whose dispatch claim was lost belongs to someone else now: stop touching the
/// operation, clean up local resources only.
///
async fn abandon_if_lost(worker: &Arc<WorkerInner>, ctx: &OperationContext) -> bool {
    if !ctx.claim_lost() {
        return false;
    }
    log::warn!("Abandoning {}: claim lost", ctx.operation_name());
    ctx.poller.pause();
    let _ = worker.exec_fs.destroy_exec_dir(ctx.operation_name()).await;
    true
}

///
/// Spawns the whole pipeline for a worker.
///
pub(crate) fn spawn_pipeline(worker: &Worker) {
    let inner = worker.inner.clone();
    let (fetch_stage, fetch_receiver) =
        PipelineStage::new("InputFetch", inner.options.input_fetch_width);
    let (execute_stage, execute_receiver) =
        PipelineStage::new("Execute", inner.options.execute_width);
    let (report_stage, report_receiver) =
        PipelineStage::new("ReportResult", inner.options.report_width);

    let fetch_stage = Arc::new(fetch_stage);
    let execute_stage = Arc::new(execute_stage);
    let report_stage = Arc::new(report_stage);
    let fetch_receiver = Arc::new(tokio::sync::Mutex::new(fetch_receiver));
    let execute_receiver = Arc::new(tokio::sync::Mutex::new(execute_receiver));
    let report_receiver = Arc::new(tokio::sync::Mutex::new(report_receiver));

    inner
        .executor
        .native_spawn(match_loop(inner.clone(), fetch_stage.clone()));
    for _ in 0..inner.options.input_fetch_width {
        inner.executor.native_spawn(input_fetch_loop(
            inner.clone(),
            fetch_receiver.clone(),
            execute_stage.clone(),
        ));
    }
    for _ in 0..inner.options.execute_width {
        inner.executor.native_spawn(execute_loop(
            inner.clone(),
            execute_receiver.clone(),
            report_stage.clone(),
        ));
    }
    for _ in 0..inner.options.report_width {
        inner
            .executor
            .native_spawn(report_loop(inner.clone(), report_receiver.clone()));
    }
}
