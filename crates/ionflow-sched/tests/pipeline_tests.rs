//! End-to-end tests running the full pipeline against simulated collaborators.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ionflow_adapter_sim::{
    InMemoryParameterSource, SimDeviceBank, SimulatedHardware, TemplateSequenceGenerator,
};
use ionflow_hal::{DeviceInfo, HalError, ParameterMap, ParameterValue};
use ionflow_sched::control::{CANCELLED_LOG, RESTARTED_LOG};
use ionflow_sched::{
    Collaborators, DataPoint, EventBus, JobController, JobFilter, JobId, JobRun, JobStatus,
    JobSubmission, JsonlResultStore, Pipeline, PipelineConfig, ResultStore, RunEvent, RunStatus,
    ScanSpec, ScanValues, SchedError, SchedResult, SqliteStore, StateStore,
};
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(10);

/// Result store that takes its time on every append.
struct SlowResults {
    inner: Arc<JsonlResultStore>,
    delay: Duration,
}

#[async_trait]
impl ResultStore for SlowResults {
    async fn append(&self, scheduled_time: DateTime<Utc>, data_point: &DataPoint) -> SchedResult<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.append(scheduled_time, data_point).await
    }

    async fn load(&self, scheduled_time: DateTime<Utc>) -> SchedResult<Vec<DataPoint>> {
        self.inner.load(scheduled_time).await
    }
}

/// Result store whose disk is full.
struct FullDisk;

#[async_trait]
impl ResultStore for FullDisk {
    async fn append(&self, _: DateTime<Utc>, _: &DataPoint) -> SchedResult<()> {
        Err(SchedError::Persistence("disk full".to_string()))
    }

    async fn load(&self, _: DateTime<Utc>) -> SchedResult<Vec<DataPoint>> {
        Ok(Vec::new())
    }
}

struct Lab {
    parameters: Arc<InMemoryParameterSource>,
    devices: Arc<SimDeviceBank>,
    hardware: Arc<SimulatedHardware>,
    generator: Arc<TemplateSequenceGenerator>,
    results: Arc<JsonlResultStore>,
    append_delay: Option<Duration>,
    _results_dir: TempDir,
}

impl Lab {
    async fn new(devices: SimDeviceBank, hardware: SimulatedHardware) -> Self {
        Self::with_generator(devices, hardware, TemplateSequenceGenerator::new()).await
    }

    async fn with_generator(
        devices: SimDeviceBank,
        hardware: SimulatedHardware,
        generator: TemplateSequenceGenerator,
    ) -> Self {
        let results_dir = TempDir::new().unwrap();
        let results = JsonlResultStore::new(results_dir.path()).await.unwrap();
        let parameters = InMemoryParameterSource::new();
        parameters.set_global("amp", 0.5);
        Self {
            parameters: Arc::new(parameters),
            devices: Arc::new(devices),
            hardware: Arc::new(hardware),
            generator: Arc::new(generator),
            results: Arc::new(results),
            append_delay: None,
            _results_dir: results_dir,
        }
    }

    fn with_append_delay(mut self, delay: Duration) -> Self {
        self.append_delay = Some(delay);
        self
    }

    fn collaborators(&self) -> Collaborators {
        let results: Arc<dyn ResultStore> = match self.append_delay {
            Some(delay) => Arc::new(SlowResults {
                inner: self.results.clone(),
                delay,
            }),
            None => self.results.clone(),
        };
        Collaborators {
            parameters: self.parameters.clone(),
            generator: self.generator.clone(),
            registry: self.devices.clone(),
            devices: self.devices.clone(),
            hardware: self.hardware.clone(),
            results,
        }
    }

    async fn start(&self, store: Arc<dyn StateStore>, config: PipelineConfig) -> Pipeline {
        Pipeline::start(config, store, self.collaborators(), EventBus::new())
            .await
            .unwrap()
    }

    fn programs_for(&self, experiment: &str) -> usize {
        let header = format!("# experiment {experiment}\n");
        self.hardware
            .executed_programs()
            .iter()
            .filter(|p| p.starts_with(&header))
            .count()
    }
}

fn fast_config() -> PipelineConfig {
    let mut config = PipelineConfig::default().with_poll_interval(Duration::from_millis(20));
    config.queue_poll_timeout_ms = 20;
    config
}

fn rf() -> DeviceInfo {
    DeviceInfo::new("rf", "tcp://rf").with_retry(3, Duration::from_millis(1))
}

/// Poll until the job's run satisfies `done`.
async fn wait_for_run(
    controller: &JobController,
    job_id: &JobId,
    done: impl Fn(&JobRun) -> bool,
) -> JobRun {
    tokio::time::timeout(WAIT, async {
        loop {
            if let Some(run) = controller.run_for_job(job_id).await.unwrap() {
                if done(&run) {
                    return run;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("run did not reach the expected state")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test]
async fn test_regular_scan_runs_to_completion() {
    let lab = Lab::new(SimDeviceBank::new().with_device(rf()), SimulatedHardware::new())
        .await
        .with_append_delay(Duration::from_millis(20));
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let pipeline = lab.start(store, fast_config()).await;

    let job_id = pipeline
        .submit(
            JobSubmission::new("experiments.Rabi")
                .scan(ScanSpec::on_device(
                    "rf",
                    "freq",
                    ScanValues::Explicit(vec![
                        ParameterValue::Float(1.0),
                        ParameterValue::Float(2.0),
                    ]),
                ))
                .scan(ScanSpec::shared("detuning", ScanValues::linspace(0.0, 1.0, 3)))
                .with_repetitions(2)
                .with_shots(10),
        )
        .await
        .unwrap();

    let run = wait_for_run(pipeline.controller(), &job_id, |r| r.status.is_terminal()).await;
    assert_eq!(run.status, RunStatus::Done, "log: {:?}", run.log);
    assert_eq!(
        pipeline.controller().job(&job_id).await.unwrap().status,
        JobStatus::Processed
    );
    assert_eq!(lab.hardware.execution_count(), 12);
    assert_eq!(lab.devices.write_count(), 12);

    // DONE is only recorded once every point is in the result store.
    let scheduled_time = run.scheduled_time;
    let mut points = lab.results.load(scheduled_time).await.unwrap();
    assert_eq!(points.len(), 12);
    points.sort_by_key(|p| p.index);
    assert_eq!(points[0].index, 0);
    assert_eq!(points[11].index, 11);
    assert!(points.iter().all(|p| p.scan_values.contains_key("rf:freq")));
    assert!(points.iter().all(|p| p.channels.shot_channels["pmt"].len() == 10));

    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_device_mismatch_fails_run() {
    let lab = Lab::new(
        SimDeviceBank::new().with_device(rf()).with_mismatch("rf", "freq"),
        SimulatedHardware::new(),
    )
    .await;
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let pipeline = lab.start(store, fast_config()).await;

    let job_id = pipeline
        .submit(JobSubmission::new("experiments.Rabi").scan(ScanSpec::on_device(
            "rf",
            "freq",
            ScanValues::linspace(1.0, 2.0, 5),
        )))
        .await
        .unwrap();

    let run = wait_for_run(pipeline.controller(), &job_id, |r| r.status.is_terminal()).await;
    assert_eq!(run.status, RunStatus::Failed);
    let log = run.log.unwrap_or_default();
    assert!(log.contains("rf"), "log: {log}");
    assert!(log.contains("freq"), "log: {log}");

    pipeline.shutdown().await.unwrap();

    // The first data point used up its retries; nothing reached the hardware.
    assert!(lab.devices.write_count() >= 3);
    assert_eq!(lab.hardware.execution_count(), 0);
    assert!(lab.results.load(run.scheduled_time).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_continuous_run_applies_calibration_without_requery() {
    let lab = Lab::new(
        SimDeviceBank::new(),
        SimulatedHardware::new().with_delay(Duration::from_millis(5)),
    )
    .await;
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let pipeline = lab.start(store, fast_config()).await;
    let mut events = pipeline.subscribe();

    let job_id = pipeline
        .submit(JobSubmission::new("experiments.Monitor").with_shots(5))
        .await
        .unwrap();

    wait_for_run(pipeline.controller(), &job_id, |r| r.status == RunStatus::Processing).await;
    let hardware = lab.hardware.clone();
    wait_until(|| hardware.execution_count() >= 2).await;
    assert!(hardware.executed_programs()[0].contains("amp = 0.5"));

    let queries = lab.parameters.query_count();
    let mut values = ParameterMap::new();
    values.insert("amp".to_string(), ParameterValue::Float(0.9));
    pipeline.calibrate(values).unwrap();

    wait_until(|| {
        hardware
            .executed_programs()
            .iter()
            .any(|p| p.contains("amp = 0.9"))
    })
    .await;
    assert_eq!(lab.parameters.query_count(), queries);

    assert!(pipeline.cancel(&job_id).await.unwrap());
    assert!(!pipeline.cancel(&job_id).await.unwrap());

    let run = wait_for_run(pipeline.controller(), &job_id, |r| r.status.is_terminal()).await;
    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(run.log.as_deref(), Some(CANCELLED_LOG));

    // Created, processing, cancelled.
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if event.run_id() == run.id {
            seen.push(event);
        }
    }
    assert!(matches!(seen.first(), Some(RunEvent::RunCreated { .. })));
    assert!(seen.iter().any(|e| matches!(
        e,
        RunEvent::RunUpdated { status: RunStatus::Cancelled, .. }
    )));

    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_restart_reconciles_orphaned_runs() {
    let state_dir = TempDir::new().unwrap();
    let db_path = state_dir.path().join("ionflow.db");
    let lab = Lab::new(SimDeviceBank::new(), SimulatedHardware::new()).await;

    // A previous process promoted one job and crashed.
    let (orphan_job, orphan_run, waiting_job) = {
        let store: Arc<dyn StateStore> = Arc::new(SqliteStore::new(&db_path).unwrap());
        let controller = JobController::new(store, EventBus::new());
        let orphan_job = controller
            .submit(
                JobSubmission::new("experiments.Rabi")
                    .scan(ScanSpec::shared("detuning", ScanValues::linspace(0.0, 1.0, 2))),
            )
            .await
            .unwrap();
        let orphan_run = controller
            .promote(&orphan_job, chrono::Utc::now())
            .await
            .unwrap()
            .unwrap();
        let waiting_job = controller
            .submit(
                JobSubmission::new("experiments.Ramsey")
                    .scan(ScanSpec::shared("detuning", ScanValues::linspace(0.0, 1.0, 2))),
            )
            .await
            .unwrap();
        (orphan_job, orphan_run, waiting_job)
    };

    let store = Arc::new(SqliteStore::new(&db_path).unwrap());
    let pipeline = lab.start(store, fast_config()).await;
    let controller = pipeline.controller();

    let orphan = controller.run(&orphan_run.id).await.unwrap();
    assert_eq!(orphan.status, RunStatus::Cancelled);
    assert_eq!(orphan.log.as_deref(), Some(RESTARTED_LOG));
    assert_eq!(
        controller.job(&orphan_job).await.unwrap().status,
        JobStatus::Processed
    );

    let run = wait_for_run(controller, &waiting_job, |r| r.status.is_terminal()).await;
    assert_eq!(run.status, RunStatus::Done);
    assert!(run.scheduled_time > orphan_run.scheduled_time);

    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_invalid_submission_rejected() {
    let lab = Lab::new(SimDeviceBank::new(), SimulatedHardware::new()).await;
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let pipeline = lab.start(store, fast_config()).await;

    let err = pipeline
        .submit(JobSubmission::new("experiments.Rabi").with_priority(21))
        .await
        .unwrap_err();
    assert!(err.is_validation());

    let err = pipeline
        .submit(
            JobSubmission::new("experiments.Rabi")
                .scan(ScanSpec::shared("detuning", ScanValues::Explicit(Vec::new()))),
        )
        .await
        .unwrap_err();
    assert!(err.is_validation());

    let jobs = pipeline
        .controller()
        .list_jobs(&JobFilter::default())
        .await
        .unwrap();
    assert!(jobs.is_empty());

    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_urgent_jobs_run_first() {
    let lab = Lab::new(SimDeviceBank::new(), SimulatedHardware::new()).await;
    let store: Arc<dyn StateStore> = Arc::new(SqliteStore::in_memory().unwrap());

    let controller = JobController::new(Arc::clone(&store), EventBus::new());
    let single_point =
        || ScanSpec::shared("detuning", ScanValues::Explicit(vec![ParameterValue::Float(0.0)]));
    let routine = controller
        .submit(
            JobSubmission::new("experiments.Routine")
                .scan(single_point())
                .with_priority(15),
        )
        .await
        .unwrap();
    let urgent = controller
        .submit(
            JobSubmission::new("experiments.Urgent")
                .scan(single_point())
                .with_priority(1),
        )
        .await
        .unwrap();

    let pipeline = lab
        .start(store, fast_config().with_workers(1, 1, 1))
        .await;

    let urgent_run = wait_for_run(pipeline.controller(), &urgent, |r| r.status.is_terminal()).await;
    let routine_run =
        wait_for_run(pipeline.controller(), &routine, |r| r.status.is_terminal()).await;
    assert_eq!(urgent_run.status, RunStatus::Done);
    assert_eq!(routine_run.status, RunStatus::Done);
    assert!(urgent_run.scheduled_time < routine_run.scheduled_time);
    assert!(lab.hardware.executed_programs()[0].starts_with("# experiment experiments.Urgent"));

    pipeline.shutdown().await.unwrap();
}

fn detuning_scan(points: usize) -> ScanSpec {
    ScanSpec::shared("detuning", ScanValues::linspace(0.0, 1.0, points))
}

#[tokio::test]
async fn test_calibration_reaches_regular_scan_midway() {
    let lab = Lab::new(
        SimDeviceBank::new(),
        SimulatedHardware::new().with_delay(Duration::from_millis(20)),
    )
    .await;
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let pipeline = lab.start(store, fast_config()).await;

    let job_id = pipeline
        .submit(JobSubmission::new("experiments.Scan").scan(detuning_scan(50)))
        .await
        .unwrap();

    let hardware = lab.hardware.clone();
    wait_until(|| hardware.execution_count() >= 2).await;
    // Only a window of points is queued ahead of the hardware.
    assert!(pipeline.queue_depths().1 <= 2);

    let queries = lab.parameters.query_count();
    let mut values = ParameterMap::new();
    values.insert("amp".to_string(), ParameterValue::Float(0.9));
    pipeline.calibrate(values).unwrap();

    let run = wait_for_run(pipeline.controller(), &job_id, |r| r.status.is_terminal()).await;
    assert_eq!(run.status, RunStatus::Done, "log: {:?}", run.log);
    assert_eq!(lab.parameters.query_count(), queries);

    let programs = lab.hardware.executed_programs();
    assert_eq!(programs.len(), 50);
    assert!(programs[0].contains("amp = 0.5"));
    assert!(programs[49].contains("amp = 0.9"));
    let calibrated = programs.iter().filter(|p| p.contains("amp = 0.9")).count();
    assert!(calibrated >= 40, "calibrated programs: {calibrated}");

    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cancel_stops_regular_scan() {
    let lab = Lab::new(
        SimDeviceBank::new(),
        SimulatedHardware::new().with_delay(Duration::from_millis(20)),
    )
    .await;
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let pipeline = lab.start(store, fast_config()).await;

    let job_id = pipeline
        .submit(JobSubmission::new("experiments.Scan").scan(detuning_scan(50)))
        .await
        .unwrap();

    let hardware = lab.hardware.clone();
    wait_until(|| hardware.execution_count() >= 3).await;
    assert!(pipeline.cancel(&job_id).await.unwrap());

    let run = wait_for_run(pipeline.controller(), &job_id, |r| r.status.is_terminal()).await;
    assert_eq!(run.status, RunStatus::Cancelled);
    pipeline.shutdown().await.unwrap();

    let executed = lab.hardware.execution_count();
    assert!(executed < 10, "executed after cancel: {executed}");
}

#[tokio::test]
async fn test_idle_requery_keeps_pinned_locals() {
    let lab = Lab::new(SimDeviceBank::new(), SimulatedHardware::new()).await;
    let pinned = Utc::now() - chrono::Duration::seconds(60);
    lab.parameters.set_local_at(
        "experiments.Rabi",
        "amp",
        0.1,
        pinned - chrono::Duration::seconds(1),
    );
    lab.parameters.set_local("experiments.Rabi", "amp", 0.9);

    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let pipeline = lab.start(store, fast_config()).await;

    // Both arrive while every worker is idle.
    pipeline.update_parameters(None).unwrap();
    let mut values = ParameterMap::new();
    values.insert("offset".to_string(), ParameterValue::Float(0.25));
    pipeline.calibrate(values).unwrap();

    let job_id = pipeline
        .submit(
            JobSubmission::new("experiments.Rabi")
                .scan(detuning_scan(1))
                .with_local_parameters_timestamp(pinned),
        )
        .await
        .unwrap();

    let run = wait_for_run(pipeline.controller(), &job_id, |r| r.status.is_terminal()).await;
    assert_eq!(run.status, RunStatus::Done, "log: {:?}", run.log);

    let programs = lab.hardware.executed_programs();
    assert_eq!(programs.len(), 1);
    assert!(programs[0].contains("amp = 0.1"), "program: {}", programs[0]);
    assert!(programs[0].contains("offset = 0.25"), "program: {}", programs[0]);

    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_disabled_device_fails_run() {
    let lab = Lab::new(
        SimDeviceBank::new().with_device(rf().disabled()),
        SimulatedHardware::new(),
    )
    .await;
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let pipeline = lab.start(store, fast_config()).await;

    let job_id = pipeline
        .submit(JobSubmission::new("experiments.Rabi").scan(ScanSpec::on_device(
            "rf",
            "freq",
            ScanValues::linspace(1.0, 2.0, 3),
        )))
        .await
        .unwrap();

    let run = wait_for_run(pipeline.controller(), &job_id, |r| r.status.is_terminal()).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(
        run.log.as_deref(),
        Some(SchedError::DeviceDisabled("rf".to_string()).to_string().as_str())
    );
    pipeline.shutdown().await.unwrap();

    assert_eq!(lab.devices.write_count(), 0);
    assert_eq!(lab.hardware.execution_count(), 0);
}

#[tokio::test]
async fn test_flaky_device_recovers_within_budget() {
    let lab = Lab::new(
        SimDeviceBank::new()
            .with_device(rf())
            .with_flaky("rf", "freq", 2),
        SimulatedHardware::new(),
    )
    .await;
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let pipeline = lab.start(store, fast_config()).await;

    let job_id = pipeline
        .submit(JobSubmission::new("experiments.Rabi").scan(ScanSpec::on_device(
            "rf",
            "freq",
            ScanValues::linspace(1.0, 2.0, 3),
        )))
        .await
        .unwrap();

    let run = wait_for_run(pipeline.controller(), &job_id, |r| r.status.is_terminal()).await;
    assert_eq!(run.status, RunStatus::Done, "log: {:?}", run.log);
    // Two rejected writes on the first point, then one per point.
    assert_eq!(lab.devices.write_count(), 5);
    assert_eq!(lab.hardware.execution_count(), 3);
    assert_eq!(lab.results.load(run.scheduled_time).await.unwrap().len(), 3);

    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_hardware_error_becomes_run_log() {
    let lab = Lab::new(
        SimDeviceBank::new(),
        SimulatedHardware::new().failing("laser unlocked"),
    )
    .await;
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let pipeline = lab.start(store, fast_config()).await;

    let job_id = pipeline
        .submit(JobSubmission::new("experiments.Rabi").scan(detuning_scan(3)))
        .await
        .unwrap();

    let run = wait_for_run(pipeline.controller(), &job_id, |r| r.status.is_terminal()).await;
    assert_eq!(run.status, RunStatus::Failed);
    let expected = SchedError::from(HalError::Execution("laser unlocked".to_string())).to_string();
    assert_eq!(run.log.as_deref(), Some(expected.as_str()));
    assert!(lab.results.load(run.scheduled_time).await.unwrap().is_empty());

    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_generator_error_becomes_run_log() {
    let lab = Lab::with_generator(
        SimDeviceBank::new(),
        SimulatedHardware::new(),
        TemplateSequenceGenerator::new().failing_for("experiments.Broken"),
    )
    .await;
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let pipeline = lab.start(store, fast_config()).await;

    let job_id = pipeline
        .submit(JobSubmission::new("experiments.Broken").scan(detuning_scan(3)))
        .await
        .unwrap();

    let run = wait_for_run(pipeline.controller(), &job_id, |r| r.status.is_terminal()).await;
    assert_eq!(run.status, RunStatus::Failed);
    let expected = SchedError::from(HalError::SequenceGeneration(
        "no template for experiments.Broken".to_string(),
    ))
    .to_string();
    assert_eq!(run.log.as_deref(), Some(expected.as_str()));
    assert_eq!(
        pipeline.controller().job(&job_id).await.unwrap().status,
        JobStatus::Processed
    );
    pipeline.shutdown().await.unwrap();

    assert_eq!(lab.hardware.execution_count(), 0);
}

#[tokio::test]
async fn test_run_cancelled_while_pending_produces_no_tasks() {
    let lab = Lab::new(
        SimDeviceBank::new(),
        SimulatedHardware::new().with_delay(Duration::from_millis(5)),
    )
    .await;
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let pipeline = lab.start(store, fast_config().with_workers(1, 1, 1)).await;
    let controller = pipeline.controller();

    // A continuous run keeps the only pre-processing worker busy.
    let monitor = pipeline
        .submit(JobSubmission::new("experiments.Monitor").with_shots(5))
        .await
        .unwrap();
    wait_for_run(controller, &monitor, |r| r.status == RunStatus::Processing).await;

    let queued = pipeline
        .submit(JobSubmission::new("experiments.Queued").scan(detuning_scan(2)))
        .await
        .unwrap();
    wait_for_run(controller, &queued, |r| r.status == RunStatus::Pending).await;
    assert!(pipeline.cancel(&queued).await.unwrap());
    assert!(pipeline.cancel(&monitor).await.unwrap());

    // The worker handles the cancelled run before this one.
    let after = pipeline
        .submit(JobSubmission::new("experiments.After").scan(detuning_scan(1)))
        .await
        .unwrap();
    let after_run = wait_for_run(controller, &after, |r| r.status.is_terminal()).await;
    assert_eq!(after_run.status, RunStatus::Done);

    let queued_run = controller.run_for_job(&queued).await.unwrap().unwrap();
    assert_eq!(queued_run.status, RunStatus::Cancelled);
    assert_eq!(queued_run.log.as_deref(), Some(CANCELLED_LOG));
    assert_eq!(lab.programs_for("experiments.Queued"), 0);
    assert_eq!(lab.programs_for("experiments.After"), 1);

    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_continuous_run_reuses_program_without_updates() {
    let lab = Lab::new(
        SimDeviceBank::new(),
        SimulatedHardware::new().with_delay(Duration::from_millis(2)),
    )
    .await;
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let pipeline = lab.start(store, fast_config()).await;

    let job_id = pipeline
        .submit(JobSubmission::new("experiments.Monitor").with_shots(5))
        .await
        .unwrap();

    let hardware = lab.hardware.clone();
    wait_until(|| hardware.execution_count() >= 6).await;
    assert!(pipeline.cancel(&job_id).await.unwrap());
    wait_for_run(pipeline.controller(), &job_id, |r| r.status.is_terminal()).await;
    pipeline.shutdown().await.unwrap();

    assert_eq!(lab.generator.generated_count(), 1);
    let programs = lab.hardware.executed_programs();
    assert!(programs.windows(2).all(|w| w[0] == w[1]));
}

#[tokio::test]
async fn test_dry_run_archives_nothing() {
    let lab = Lab::new(SimDeviceBank::new(), SimulatedHardware::new()).await;
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let pipeline = lab.start(store, fast_config()).await;

    let job_id = pipeline
        .submit(
            JobSubmission::new("experiments.Rabi")
                .scan(detuning_scan(3))
                .debug(),
        )
        .await
        .unwrap();

    let run = wait_for_run(pipeline.controller(), &job_id, |r| r.status.is_terminal()).await;
    assert_eq!(run.status, RunStatus::Done, "log: {:?}", run.log);
    assert_eq!(lab.hardware.execution_count(), 3);
    assert!(lab.results.load(run.scheduled_time).await.unwrap().is_empty());
    assert!(!lab.results.path_for(run.scheduled_time).exists());

    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_archive_error_fails_run() {
    let lab = Lab::new(SimDeviceBank::new(), SimulatedHardware::new()).await;
    let mut collaborators = lab.collaborators();
    collaborators.results = Arc::new(FullDisk);
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let pipeline = Pipeline::start(fast_config(), store, collaborators, EventBus::new())
        .await
        .unwrap();

    let job_id = pipeline
        .submit(JobSubmission::new("experiments.Rabi").scan(detuning_scan(3)))
        .await
        .unwrap();

    let run = wait_for_run(pipeline.controller(), &job_id, |r| r.status.is_terminal()).await;
    assert_eq!(run.status, RunStatus::Failed);
    let expected = SchedError::Persistence("disk full".to_string()).to_string();
    assert_eq!(run.log.as_deref(), Some(expected.as_str()));

    pipeline.shutdown().await.unwrap();
}
