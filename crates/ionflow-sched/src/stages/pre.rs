//! Pre-processing: expands runs into hardware tasks.

use std::sync::Arc;
use std::time::Duration;

use ionflow_hal::{ParameterSource, SequenceGenerator};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::control::JobController;
use crate::error::{SchedError, SchedResult};
use crate::job::Job;
use crate::queue::TaskQueue;
use crate::run::{JobRun, RunId, RunStatus};
use crate::scan::{combination_map, combinations, Combination};
use crate::snapshot::{ParameterUpdate, RefreshMode, Snapshot};
use crate::stages::{next_task, SHUTDOWN_LOG};
use crate::task::{DataPointArchived, DataPointDone, HardwareTask, PreProcessingTask};

/// How a run left the pre-processing stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// Every data point completed.
    Finished,
    /// The run was cancelled or failed elsewhere.
    Aborted,
    /// The pipeline is shutting down.
    Interrupted,
}

/// Result of waiting for a signal about a data point.
enum Signal<T> {
    Received(T),
    Aborted,
    Interrupted,
}

/// Per-run state owned by the worker while it expands one run.
struct RunContext {
    job: Arc<Job>,
    run: JobRun,
    snapshot: Snapshot,
    done_tx: mpsc::UnboundedSender<DataPointDone>,
    done_rx: mpsc::UnboundedReceiver<DataPointDone>,
    archived_tx: Option<mpsc::UnboundedSender<DataPointArchived>>,
    archived_rx: mpsc::UnboundedReceiver<DataPointArchived>,
    next_index: usize,
}

/// Worker of the pre-processing stage.
pub struct PreProcessingWorker {
    id: usize,
    controller: JobController,
    parameters: Arc<dyn ParameterSource>,
    generator: Arc<dyn SequenceGenerator>,
    input: Arc<TaskQueue<PreProcessingTask>>,
    output: Arc<TaskQueue<HardwareTask>>,
    updates: mpsc::UnboundedReceiver<ParameterUpdate>,
    pipeline_depth: usize,
    poll_timeout: Duration,
}

impl PreProcessingWorker {
    /// Create a worker.
    pub fn new(
        id: usize,
        controller: JobController,
        parameters: Arc<dyn ParameterSource>,
        generator: Arc<dyn SequenceGenerator>,
        input: Arc<TaskQueue<PreProcessingTask>>,
        output: Arc<TaskQueue<HardwareTask>>,
        updates: mpsc::UnboundedReceiver<ParameterUpdate>,
    ) -> Self {
        Self {
            id,
            controller,
            parameters,
            generator,
            input,
            output,
            updates,
            pipeline_depth: 2,
            poll_timeout: Duration::from_millis(200),
        }
    }

    /// Set the number of data points kept in flight.
    pub fn with_pipeline_depth(mut self, depth: usize) -> Self {
        self.pipeline_depth = depth.max(1);
        self
    }

    /// Set how often blocking waits re-check cancellation and shutdown.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Consume runs until shutdown.
    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::debug!(worker = self.id, "Pre-processing worker started");
        while let Some(task) = next_task(&self.input, self.poll_timeout, &shutdown).await {
            self.process(task, &shutdown).await;
        }
        tracing::debug!(worker = self.id, "Pre-processing worker stopped");
    }

    /// Process one run end to end and record its outcome.
    async fn process(&mut self, task: PreProcessingTask, shutdown: &CancellationToken) {
        let PreProcessingTask { job, run } = task;
        let job_id = job.id;
        let run_id = run.id;
        tracing::info!(worker = self.id, job_id = %job_id, run_id = %run_id, "Processing run");

        let result = self.expand(job, run, shutdown).await;

        let recorded = match result {
            Ok(Outcome::Finished) => {
                self.controller
                    .set_run_status(&run_id, RunStatus::Done, None)
                    .await
            }
            Ok(Outcome::Aborted) => Ok(false),
            Ok(Outcome::Interrupted) => {
                self.controller
                    .set_run_status(&run_id, RunStatus::Cancelled, Some(SHUTDOWN_LOG))
                    .await
            }
            Err(e) => {
                tracing::warn!(worker = self.id, run_id = %run_id, "Run failed: {}", e);
                self.controller
                    .set_run_status(&run_id, RunStatus::Failed, Some(e.to_string().as_str()))
                    .await
            }
        };
        if let Err(e) = recorded {
            tracing::error!(run_id = %run_id, "Failed to record run outcome: {}", e);
        }
        if let Err(e) = self.controller.finish_job(&job_id).await {
            tracing::error!(job_id = %job_id, "Failed to mark job processed: {}", e);
        }

        let status = self.controller.run(&run_id).await.map(|r| r.status);
        tracing::info!(worker = self.id, run_id = %run_id, status = ?status.ok(), "Run finished");
    }

    async fn expand(
        &mut self,
        job: Job,
        run: JobRun,
        shutdown: &CancellationToken,
    ) -> SchedResult<Outcome> {
        self.controller
            .set_run_status(&run.id, RunStatus::Processing, None)
            .await?;

        // A re-query requested while idle is covered by the initial
        // resolution below. Calibrations still apply on top of it.
        let pending: Vec<_> = self
            .drain_updates()
            .into_iter()
            .filter(|update| matches!(update, ParameterUpdate::Calibration { .. }))
            .collect();

        if self.controller.is_aborted(&run.id).await? {
            return Ok(Outcome::Aborted);
        }

        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let (archived_tx, archived_rx) = mpsc::unbounded_channel();
        let continuous = job.is_continuous();
        let mut ctx = RunContext {
            job: Arc::new(job),
            run,
            snapshot: Snapshot::empty(),
            done_tx,
            done_rx,
            archived_tx: (!continuous).then_some(archived_tx),
            archived_rx,
            next_index: 0,
        };

        ctx.snapshot
            .refresh(self.parameters.as_ref(), &ctx.job, RefreshMode::default())
            .await?;
        for update in pending {
            self.apply_update(&mut ctx, &update).await?;
        }

        if continuous {
            self.expand_continuous(&mut ctx, shutdown).await
        } else {
            self.expand_regular(&mut ctx, shutdown).await
        }
    }

    /// Regular mode: one task per combination, at most `pipeline_depth` in
    /// flight, then wait until every point is archived.
    async fn expand_regular(
        &mut self,
        ctx: &mut RunContext,
        shutdown: &CancellationToken,
    ) -> SchedResult<Outcome> {
        let combos = combinations(&ctx.job.scan_parameters, ctx.job.repetitions);
        let total = combos.len();
        tracing::debug!(
            run_id = %ctx.run.id,
            data_points = total,
            depth = self.pipeline_depth,
            "Expanding scan"
        );

        let mut remaining = combos.into_iter();
        let mut in_flight = 0;
        loop {
            while in_flight < self.pipeline_depth {
                let Some(combo) = remaining.next() else {
                    break;
                };
                if shutdown.is_cancelled() {
                    return Ok(Outcome::Interrupted);
                }
                self.apply_pending_updates(ctx).await?;
                if self.controller.is_aborted(&ctx.run.id).await? {
                    return Ok(Outcome::Aborted);
                }

                let parameters = ctx.snapshot.with_overrides(&combination_map(&combo));
                let program: Arc<str> = self
                    .generator
                    .generate(&ctx.job.experiment, &parameters)?
                    .into();
                self.push(ctx, combo, program)?;
                in_flight += 1;
            }
            if in_flight == 0 {
                break;
            }

            let done = match self.wait_signal(&mut ctx.done_rx, &ctx.run.id, shutdown).await? {
                Signal::Received(done) => done,
                Signal::Aborted => return Ok(Outcome::Aborted),
                Signal::Interrupted => return Ok(Outcome::Interrupted),
            };
            in_flight -= 1;
            if !done.succeeded {
                return self.point_failed(&ctx.run.id, done.index).await;
            }
        }

        let mut archived = 0;
        while archived < total {
            let receipt =
                match self.wait_signal(&mut ctx.archived_rx, &ctx.run.id, shutdown).await? {
                    Signal::Received(receipt) => receipt,
                    Signal::Aborted => return Ok(Outcome::Aborted),
                    Signal::Interrupted => return Ok(Outcome::Interrupted),
                };
            if !receipt.archived {
                return self.point_failed(&ctx.run.id, receipt.index).await;
            }
            archived += 1;
        }

        Ok(Outcome::Finished)
    }

    /// A data point ended without a result. Normally the stage that lost it
    /// already failed the run.
    async fn point_failed(&self, run_id: &RunId, index: usize) -> SchedResult<Outcome> {
        if self.controller.is_aborted(run_id).await? {
            return Ok(Outcome::Aborted);
        }
        Err(SchedError::DataPointLost {
            run: run_id.to_string(),
            index,
        })
    }

    /// Continuous mode: keep `pipeline_depth` points in flight until stopped.
    async fn expand_continuous(
        &mut self,
        ctx: &mut RunContext,
        shutdown: &CancellationToken,
    ) -> SchedResult<Outcome> {
        let mut current_generation = ctx.snapshot.generation();
        let mut current: Arc<str> = self
            .generator
            .generate(&ctx.job.experiment, ctx.snapshot.values())?
            .into();

        for _ in 0..self.pipeline_depth {
            self.push(ctx, Combination::new(), Arc::clone(&current))?;
        }

        loop {
            self.apply_pending_updates(ctx).await?;

            let done = match self.wait_signal(&mut ctx.done_rx, &ctx.run.id, shutdown).await? {
                Signal::Received(done) => done,
                Signal::Aborted => return Ok(Outcome::Aborted),
                Signal::Interrupted => return Ok(Outcome::Interrupted),
            };
            if !done.succeeded && self.controller.is_aborted(&ctx.run.id).await? {
                return Ok(Outcome::Aborted);
            }

            // Updates that arrived while waiting apply to the next point.
            self.apply_pending_updates(ctx).await?;

            let program = if done.snapshot_generation < ctx.snapshot.generation() {
                if current_generation < ctx.snapshot.generation() {
                    current = self
                        .generator
                        .generate(&ctx.job.experiment, ctx.snapshot.values())?
                        .into();
                    current_generation = ctx.snapshot.generation();
                    tracing::debug!(
                        run_id = %ctx.run.id,
                        generation = current_generation,
                        "Regenerated program"
                    );
                }
                Arc::clone(&current)
            } else {
                done.program
            };

            if shutdown.is_cancelled() {
                return Ok(Outcome::Interrupted);
            }
            if self.controller.is_aborted(&ctx.run.id).await? {
                return Ok(Outcome::Aborted);
            }
            self.push(ctx, Combination::new(), program)?;
        }
    }

    fn push(
        &self,
        ctx: &mut RunContext,
        combination: Combination,
        program: Arc<str>,
    ) -> SchedResult<()> {
        let task = HardwareTask {
            job: Arc::clone(&ctx.job),
            run_id: ctx.run.id,
            scheduled_time: ctx.run.scheduled_time,
            index: ctx.next_index,
            combination,
            snapshot_generation: ctx.snapshot.generation(),
            snapshot_timestamp: ctx.snapshot.resolved_at(),
            program,
            completion: ctx.done_tx.clone(),
            archive_receipt: ctx.archived_tx.clone(),
        };
        self.output.put(task)?;
        ctx.next_index += 1;
        Ok(())
    }

    /// Wait for one signal, re-checking the run between polls.
    async fn wait_signal<T>(
        &self,
        rx: &mut mpsc::UnboundedReceiver<T>,
        run_id: &RunId,
        shutdown: &CancellationToken,
    ) -> SchedResult<Signal<T>> {
        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => return Ok(Signal::Interrupted),
                received = tokio::time::timeout(self.poll_timeout, rx.recv()) => received,
            };

            match received {
                Ok(Some(signal)) => return Ok(Signal::Received(signal)),
                Ok(None) => {
                    return Err(SchedError::ChannelClosed(format!("signals of run {run_id}")));
                }
                Err(_) => {
                    if self.controller.is_aborted(run_id).await? {
                        return Ok(Signal::Aborted);
                    }
                }
            }
        }
    }

    fn drain_updates(&mut self) -> Vec<ParameterUpdate> {
        let mut drained = Vec::new();
        while let Ok(update) = self.updates.try_recv() {
            drained.push(update);
        }
        drained
    }

    async fn apply_pending_updates(&mut self, ctx: &mut RunContext) -> SchedResult<()> {
        for update in self.drain_updates() {
            self.apply_update(ctx, &update).await?;
        }
        Ok(())
    }

    async fn apply_update(&self, ctx: &mut RunContext, update: &ParameterUpdate) -> SchedResult<()> {
        let Some(mode) = update.refresh_for(ctx.job.id) else {
            return Ok(());
        };
        let changed = ctx
            .snapshot
            .refresh(self.parameters.as_ref(), &ctx.job, mode)
            .await?;
        tracing::debug!(
            worker = self.id,
            run_id = %ctx.run.id,
            changed,
            generation = ctx.snapshot.generation(),
            "Applied parameter update"
        );
        Ok(())
    }
}
