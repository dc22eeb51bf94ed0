//! One job's lifecycle: wait for the pipeline, execute, persist the anchor,
//! release the lock, repeat.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cadence_core::config::RunnerConfig;
use cadence_core::{JobDefinition, JobsConfig};
use chrono::Utc;
use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::anchor::AnchorStore;
use crate::bus::{CompletionBus, CompletionEvent, Outcome};
use crate::lock::LockProvider;
use crate::manual::ManualTriggerRegistry;
use crate::pipeline::{sleep_or_cancel, SignalPipeline};
use crate::registry::{ExecutionInfo, JobSettings, JobTypeRegistry};
use crate::status::StatusBoard;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerState {
    Waiting,
    Executing,
    /// Terminal: the job type could not be resolved or constructed.
    Disabled,
    /// Terminal: the runner was cancelled.
    Cancelled,
}

/// Timing knobs for runners and their pipelines.
#[derive(Debug, Clone, Copy)]
pub struct RunnerTuning {
    /// Wait after a denied lock before the next round.
    pub lock_cooldown: Duration,
    /// Floor between the end of one execution and the next round.
    pub min_spacing: Duration,
    /// Back-off after an anchor store failure.
    pub storage_retry: Duration,
}

impl Default for RunnerTuning {
    fn default() -> Self {
        Self::from(&RunnerConfig::default())
    }
}

/// Lowest `min_spacing` accepted from configuration.
pub const MIN_SPACING_FLOOR: Duration = Duration::from_secs(1);

impl From<&RunnerConfig> for RunnerTuning {
    fn from(cfg: &RunnerConfig) -> Self {
        let mut min_spacing = Duration::from_millis(cfg.min_spacing_ms);
        if min_spacing < MIN_SPACING_FLOOR {
            warn!(
                configured_ms = cfg.min_spacing_ms,
                floor_ms = MIN_SPACING_FLOOR.as_millis() as u64,
                "runner.min_spacing_ms below the floor; raising it"
            );
            min_spacing = MIN_SPACING_FLOOR;
        }
        Self {
            lock_cooldown: Duration::from_secs(cfg.lock_cooldown_secs),
            min_spacing,
            storage_retry: Duration::from_secs(cfg.storage_retry_secs),
        }
    }
}

/// Everything a runner needs from its host. Cheap to clone.
#[derive(Clone)]
pub struct RunnerDeps {
    pub anchors: Arc<dyn AnchorStore>,
    pub locks: Arc<dyn LockProvider>,
    pub job_types: Arc<JobTypeRegistry>,
    pub manual: ManualTriggerRegistry,
    pub bus: CompletionBus,
    /// Latest job configuration, for settings lookups.
    pub settings: watch::Receiver<Arc<JobsConfig>>,
    pub status: StatusBoard,
    pub tuning: RunnerTuning,
}

pub struct JobRunner {
    id: Uuid,
    definition: JobDefinition,
    cancel: CancellationToken,
    disabled: Arc<AtomicBool>,
    state: watch::Receiver<RunnerState>,
    pipeline: Arc<SignalPipeline>,
    task: Option<JoinHandle<()>>,
}

impl JobRunner {
    /// Wire a pipeline for `definition` and spawn the runner loop.
    ///
    /// When `predecessor` is given (the task of the runner this one
    /// replaces), the loop waits for it to finish before its first round.
    pub fn start(
        definition: JobDefinition,
        deps: &RunnerDeps,
        parent: &CancellationToken,
        predecessor: Option<JoinHandle<()>>,
    ) -> Self {
        let id = Uuid::new_v4();
        let cancel = parent.child_token();
        let disabled = Arc::new(AtomicBool::new(false));
        let (state_tx, state_rx) = watch::channel(RunnerState::Waiting);

        let pipeline = Arc::new(SignalPipeline::for_definition(
            &definition,
            deps.anchors.clone(),
            deps.locks.clone(),
            &deps.manual,
            &deps.bus,
            deps.tuning.lock_cooldown,
        ));

        deps.status.register(
            &definition.name,
            &definition.job_type,
            id,
            pipeline.source_kinds(),
        );

        let ctx = LoopContext {
            id,
            definition: definition.clone(),
            deps: deps.clone(),
            pipeline: pipeline.clone(),
            cancel: cancel.clone(),
            disabled: disabled.clone(),
            state: state_tx,
        };
        let span = info_span!("job", job = %definition.name, runner = %id);
        let task = tokio::spawn(
            async move {
                if let Some(prev) = predecessor {
                    let _ = prev.await;
                }
                ctx.run().await;
            }
            .instrument(span),
        );

        Self {
            id,
            definition,
            cancel,
            disabled,
            state: state_rx,
            pipeline,
            task: Some(task),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn definition(&self) -> &JobDefinition {
        &self.definition
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    pub fn state(&self) -> RunnerState {
        *self.state.borrow()
    }

    /// Cancel the loop and drop its trigger registrations. Returns the task
    /// so the caller can track its completion; an executing job is not
    /// interrupted beyond seeing its token cancelled.
    pub fn dispose(mut self) -> Option<JoinHandle<()>> {
        self.cancel.cancel();
        self.pipeline.close();
        self.task.take()
    }
}

impl Drop for JobRunner {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.pipeline.close();
    }
}

// ---- loop ----

struct LoopContext {
    id: Uuid,
    definition: JobDefinition,
    deps: RunnerDeps,
    pipeline: Arc<SignalPipeline>,
    cancel: CancellationToken,
    disabled: Arc<AtomicBool>,
    state: watch::Sender<RunnerState>,
}

impl LoopContext {
    fn set_state(&self, state: RunnerState) {
        self.state.send_replace(state);
        self.deps
            .status
            .set_state(&self.definition.name, self.id, state);
    }

    async fn run(self) {
        let name = self.definition.name.as_str();
        let tuning = self.deps.tuning;
        info!(job_type = %self.definition.job_type, "runner started");

        while !self.cancel.is_cancelled() {
            self.set_state(RunnerState::Waiting);

            let fired = match self.pipeline.next(&self.cancel).await {
                Ok(Some(fired)) => fired,
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, retry_secs = tuning.storage_retry.as_secs(), "round failed");
                    self.deps.status.record_error(name, self.id, e.to_string());
                    if !sleep_or_cancel(tuning.storage_retry, &self.cancel).await {
                        break;
                    }
                    continue;
                }
            };

            self.set_state(RunnerState::Executing);

            let job = match self.deps.job_types.resolve(&self.definition.job_type) {
                Ok(job) => job,
                Err(e) => {
                    error!(error = %e, "cannot activate job; disabling");
                    self.disabled.store(true, Ordering::Release);
                    self.deps.status.record_error(name, self.id, e.to_string());
                    fired.lock.release();
                    self.set_state(RunnerState::Disabled);
                    return;
                }
            };

            info!(trigger = fired.trigger, "executing job");
            let info = ExecutionInfo {
                job_name: name.to_string(),
                settings: JobSettings::new(name, self.deps.settings.clone()),
            };
            let started = Utc::now();
            let result = AssertUnwindSafe(job.execute(&info, self.cancel.clone()))
                .catch_unwind()
                .await;
            drop(job);

            let (outcome, failure) = match result {
                Ok(Ok(())) => (Outcome::Succeeded, None),
                Ok(Err(e)) => {
                    error!(error = %format!("{e:#}"), "job failed");
                    (Outcome::Failed, Some(format!("{e:#}")))
                }
                Err(panic) => {
                    let msg = panic_message(panic.as_ref());
                    error!(panic = %msg, "job panicked");
                    (Outcome::Failed, Some(format!("panicked: {msg}")))
                }
            };
            let elapsed_ms = (Utc::now() - started).num_milliseconds();

            // Anchor first, then release the lock.
            let anchor = self.deps.anchors.drop_anchor(name).await;
            fired.lock.release();

            let backoff = match anchor {
                Ok(at) => {
                    self.deps.status.record_anchor(name, self.id, at);
                    tuning.min_spacing
                }
                Err(e) => {
                    error!(error = %e, "failed to persist anchor");
                    self.deps.status.record_error(name, self.id, e.to_string());
                    tuning.storage_retry.max(tuning.min_spacing)
                }
            };

            self.deps.bus.publish(CompletionEvent {
                job_name: name.to_string(),
                timestamp: Utc::now(),
                outcome,
            });
            self.deps
                .status
                .record_execution(name, self.id, outcome, failure);
            info!(?outcome, elapsed_ms, "execution finished");

            if !sleep_or_cancel(backoff, &self.cancel).await {
                break;
            }
        }

        self.set_state(RunnerState::Cancelled);
        info!("runner stopped");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::MemoryAnchorStore;
    use crate::error::{Result, SchedulerError};
    use crate::lock::{NamedLockProvider, NoopLockProvider};
    use crate::registry::Job;
    use async_trait::async_trait;
    use cadence_core::TriggerSpec;
    use chrono::DateTime;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    struct Counting {
        runs: Arc<AtomicUsize>,
        fail: bool,
        panic: bool,
    }

    #[async_trait]
    impl Job for Counting {
        async fn execute(&self, _info: &ExecutionInfo, _cancel: CancellationToken) -> anyhow::Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.panic {
                panic!("kaboom");
            }
            if self.fail {
                anyhow::bail!("expected failure");
            }
            Ok(())
        }
    }

    /// Anchor store that fails a set number of reads and writes before
    /// behaving like the memory store it wraps.
    struct FlakyAnchors {
        inner: MemoryAnchorStore,
        failing_reads: AtomicUsize,
        failing_writes: AtomicUsize,
    }

    impl FlakyAnchors {
        fn failing(reads: usize, writes: usize) -> Self {
            Self {
                inner: MemoryAnchorStore::new(),
                failing_reads: AtomicUsize::new(reads),
                failing_writes: AtomicUsize::new(writes),
            }
        }

        fn take_failure(counter: &AtomicUsize, job: &str) -> Result<()> {
            let failed = counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                return Err(SchedulerError::AnchorStore {
                    job: job.to_string(),
                    reason: "disk unavailable".to_string(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl AnchorStore for FlakyAnchors {
        async fn get_anchor(&self, job: &str) -> Result<Option<DateTime<Utc>>> {
            Self::take_failure(&self.failing_reads, job)?;
            self.inner.get_anchor(job).await
        }

        async fn drop_anchor(&self, job: &str) -> Result<DateTime<Utc>> {
            Self::take_failure(&self.failing_writes, job)?;
            self.inner.drop_anchor(job).await
        }
    }

    fn deps_with(registry: JobTypeRegistry, anchors: MemoryAnchorStore) -> RunnerDeps {
        deps_from(registry, Arc::new(anchors), Arc::new(NoopLockProvider))
    }

    fn deps_from(
        registry: JobTypeRegistry,
        anchors: Arc<dyn AnchorStore>,
        locks: Arc<dyn LockProvider>,
    ) -> RunnerDeps {
        let (_tx, rx) = watch::channel(Arc::new(JobsConfig::default()));
        RunnerDeps {
            anchors,
            locks,
            job_types: Arc::new(registry),
            manual: ManualTriggerRegistry::new(),
            bus: CompletionBus::new(),
            settings: rx,
            status: StatusBoard::new(),
            tuning: RunnerTuning {
                lock_cooldown: Duration::from_millis(20),
                min_spacing: Duration::from_millis(10),
                storage_retry: Duration::from_millis(20),
            },
        }
    }

    fn counting(runs: &Arc<AtomicUsize>, fail: bool, panic: bool) -> JobTypeRegistry {
        let mut reg = JobTypeRegistry::new();
        let runs = runs.clone();
        reg.register("counting", move || {
            Ok(Box::new(Counting {
                runs: runs.clone(),
                fail,
                panic,
            }) as Box<dyn Job>)
        });
        reg
    }

    async fn wait_for(mut pred: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !pred() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn manual_job(job_type: &str) -> JobDefinition {
        JobDefinition::new("job", job_type, TriggerSpec::default().manual())
    }

    #[tokio::test]
    async fn manual_run_writes_anchor_and_publishes() {
        let runs = Arc::new(AtomicUsize::new(0));
        let anchors = MemoryAnchorStore::new();
        let deps = deps_with(counting(&runs, false, false), anchors.clone());
        let mut completions = deps.bus.subscribe();
        let root = CancellationToken::new();

        let runner = JobRunner::start(manual_job("counting"), &deps, &root, None);
        wait_for(|| deps.manual.names().contains(&"job".to_string())).await;
        assert!(deps.manual.trigger("job"));

        let event = tokio::time::timeout(Duration::from_secs(2), completions.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.job_name, "job");
        assert_eq!(event.outcome, Outcome::Succeeded);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(anchors.get_anchor("job").await.unwrap().is_some());

        let status = deps.status.get("job").unwrap();
        assert_eq!(status.executions, 1);
        assert!(status.last_anchor.is_some());

        let task = runner.dispose().unwrap();
        task.await.unwrap();
        assert!(!deps.manual.names().contains(&"job".to_string()));
    }

    #[tokio::test]
    async fn failures_and_panics_do_not_stop_the_runner() {
        for (fail, panic) in [(true, false), (false, true)] {
            let runs = Arc::new(AtomicUsize::new(0));
            let deps = deps_with(counting(&runs, fail, panic), MemoryAnchorStore::new());
            let mut completions = deps.bus.subscribe();
            let runner = JobRunner::start(manual_job("counting"), &deps, &CancellationToken::new(), None);

            for expected in 1..=2 {
                deps.manual.trigger("job");
                let event = tokio::time::timeout(Duration::from_secs(2), completions.recv())
                    .await
                    .unwrap()
                    .unwrap();
                assert_eq!(event.outcome, Outcome::Failed);
                assert_eq!(runs.load(Ordering::SeqCst), expected);
            }
            assert!(!runner.is_disabled());
            assert_eq!(deps.status.get("job").unwrap().failures, 2);
            runner.dispose().unwrap().await.unwrap();
        }
    }

    #[tokio::test]
    async fn unknown_job_type_disables_runner() {
        let deps = deps_with(JobTypeRegistry::new(), MemoryAnchorStore::new());
        let runner = JobRunner::start(manual_job("missing"), &deps, &CancellationToken::new(), None);

        deps.manual.trigger("job");
        wait_for(|| runner.state() == RunnerState::Disabled).await;
        assert!(runner.is_disabled());
        assert_eq!(deps.anchors.get_anchor("job").await.unwrap(), None);

        // Further triggers are not consumed by anything.
        deps.manual.trigger("job");
        assert_eq!(runner.state(), RunnerState::Disabled);
        runner.dispose().unwrap().await.unwrap();
    }

    #[tokio::test]
    async fn parent_cancellation_stops_runner() {
        let runs = Arc::new(AtomicUsize::new(0));
        let deps = deps_with(counting(&runs, false, false), MemoryAnchorStore::new());
        let root = CancellationToken::new();
        let runner = JobRunner::start(manual_job("counting"), &deps, &root, None);

        root.cancel();
        wait_for(|| runner.state() == RunnerState::Cancelled).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_anchor_read_backs_off_then_recovers() {
        let runs = Arc::new(AtomicUsize::new(0));
        let anchors = Arc::new(FlakyAnchors::failing(2, 0));
        let mut deps = deps_from(counting(&runs, false, false), anchors.clone(), Arc::new(NoopLockProvider));
        deps.tuning.storage_retry = Duration::from_millis(100);

        let started = Instant::now();
        let runner = JobRunner::start(manual_job("counting"), &deps, &CancellationToken::new(), None);
        assert!(deps.manual.trigger("job"));

        wait_for(|| runs.load(Ordering::SeqCst) == 1).await;
        // Two failed rounds, each followed by a full back-off.
        assert!(started.elapsed() >= Duration::from_millis(200), "{:?}", started.elapsed());
        assert_eq!(anchors.failing_reads.load(Ordering::SeqCst), 0);

        let status = deps.status.get("job").unwrap();
        assert!(status.last_error.unwrap().contains("disk unavailable"));
        assert_eq!(status.failures, 0);
        wait_for(|| deps.status.get("job").and_then(|s| s.last_anchor).is_some()).await;
        assert!(!runner.is_disabled());
        runner.dispose().unwrap().await.unwrap();
    }

    #[tokio::test]
    async fn failed_anchor_write_releases_lock_and_backs_off() {
        let runs = Arc::new(AtomicUsize::new(0));
        let anchors = Arc::new(FlakyAnchors::failing(0, 1));
        let locks = Arc::new(NamedLockProvider::new());
        let mut deps = deps_from(counting(&runs, false, false), anchors.clone(), locks.clone());
        deps.tuning.storage_retry = Duration::from_millis(200);
        deps.tuning.min_spacing = Duration::from_millis(10);
        let mut completions = deps.bus.subscribe();

        let runner = JobRunner::start(manual_job("counting"), &deps, &CancellationToken::new(), None);
        assert!(deps.manual.trigger("job"));
        let first = tokio::time::timeout(Duration::from_secs(2), completions.recv())
            .await
            .unwrap()
            .unwrap();
        let finished = Instant::now();

        // The job itself succeeded; only the anchor write failed.
        assert_eq!(first.outcome, Outcome::Succeeded);
        assert!(!locks.is_held("job"));
        assert_eq!(anchors.get_anchor("job").await.unwrap(), None);
        wait_for(|| deps.status.get("job").is_some_and(|s| s.executions == 1)).await;
        let status = deps.status.get("job").unwrap();
        assert!(status.last_error.unwrap().contains("disk unavailable"));

        assert!(deps.manual.trigger("job"));
        tokio::time::timeout(Duration::from_secs(2), completions.recv())
            .await
            .unwrap()
            .unwrap();
        // Back-off is the storage retry, not the much shorter spacing.
        assert!(finished.elapsed() >= Duration::from_millis(180), "{:?}", finished.elapsed());
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert!(anchors.get_anchor("job").await.unwrap().is_some());
        runner.dispose().unwrap().await.unwrap();
    }

    #[tokio::test]
    async fn back_to_back_manual_triggers_respect_min_spacing() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut deps = deps_with(counting(&runs, false, false), MemoryAnchorStore::new());
        deps.tuning.min_spacing = Duration::from_millis(200);
        let mut completions = deps.bus.subscribe();

        let runner = JobRunner::start(manual_job("counting"), &deps, &CancellationToken::new(), None);
        assert!(deps.manual.trigger("job"));
        tokio::time::timeout(Duration::from_secs(2), completions.recv())
            .await
            .unwrap()
            .unwrap();
        let finished = Instant::now();

        assert!(deps.manual.trigger("job"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1, "second run must wait out the spacing");

        tokio::time::timeout(Duration::from_secs(2), completions.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(finished.elapsed() >= Duration::from_millis(180), "{:?}", finished.elapsed());
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        runner.dispose().unwrap().await.unwrap();
    }

    #[test]
    fn tuning_from_config() {
        let t = RunnerTuning::default();
        assert_eq!(t.lock_cooldown, Duration::from_secs(60));
        assert_eq!(t.min_spacing, Duration::from_secs(1));
        assert_eq!(t.storage_retry, Duration::from_secs(30));
    }

    #[test]
    fn configured_spacing_is_clamped_to_floor() {
        let zero = RunnerConfig {
            min_spacing_ms: 0,
            ..RunnerConfig::default()
        };
        assert_eq!(RunnerTuning::from(&zero).min_spacing, MIN_SPACING_FLOOR);

        let slow = RunnerConfig {
            min_spacing_ms: 2_500,
            ..RunnerConfig::default()
        };
        assert_eq!(RunnerTuning::from(&slow).min_spacing, Duration::from_millis(2_500));
    }
}
