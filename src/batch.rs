//! The batch coordinator: bounded per-page fan-out for one stage.
//!
//! Takes the set of eligible pages, dispatches each through a caller-supplied
//! worker future under the stage's semaphore, and records every outcome in
//! the shared run. Page failures are absorbed here — a page that exhausts its
//! retries is marked Failed and its siblings keep going; nothing short of a
//! failed health probe stops a stage mid-batch.
//!
//! Pass/fail for the stage is decided afterwards by [`evaluate`], over the
//! full page set rather than just this batch, so a resumed run is judged by
//! the same law as a fresh one.

use crate::config::{StageKind, StageSpec, StageSpecs};
use crate::error::ErrorRecord;
use crate::progress::ProgressCallback;
use crate::stage::executor::ExhaustedCall;
use crate::state::{PageRecord, PipelineRun, StageResult};
use futures::stream::{self, StreamExt};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// Cooperative cancellation signal shared by every worker in a run.
///
/// Once set it is never cleared; in-flight calls finish, queued pages are
/// left `NotStarted` so a later resume picks them up.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One counting semaphore per stage kind, sized from the stage specs.
///
/// Pools are shared wherever the `StagePools` handle is cloned, so two runs
/// driven by the same orchestrator contend for the same per-stage capacity
/// instead of doubling the load on a service.
#[derive(Clone)]
pub struct StagePools {
    pools: Arc<[(StageKind, Arc<Semaphore>); 5]>,
}

impl StagePools {
    pub fn new(specs: &StageSpecs) -> Self {
        let pools = StageKind::SEQUENCE
            .map(|kind| (kind, Arc::new(Semaphore::new(specs.get(kind).concurrency.max(1)))));
        Self {
            pools: Arc::new(pools),
        }
    }

    pub fn get(&self, kind: StageKind) -> Arc<Semaphore> {
        self.pools
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, s)| s.clone())
            .expect("pool exists for every stage kind")
    }
}

/// The run record under a mutex, shared between the coordinator's workers.
///
/// Locks are short and synchronous and never held across an await; workers
/// lock only to flip a page status or append an error.
#[derive(Clone)]
pub struct SharedRun(Arc<Mutex<PipelineRun>>);

impl SharedRun {
    pub fn new(run: PipelineRun) -> Self {
        Self(Arc::new(Mutex::new(run)))
    }

    /// Run a closure against the locked run record.
    pub fn with<R>(&self, f: impl FnOnce(&mut PipelineRun) -> R) -> R {
        let mut guard = self.0.lock().expect("run mutex poisoned");
        f(&mut guard)
    }

    /// Clone the current record, e.g. for persistence or the final summary.
    pub fn snapshot(&self) -> PipelineRun {
        self.with(|run| run.clone())
    }
}

/// Result of one stage's batch over the whole run.
#[derive(Debug, Clone, Copy)]
pub struct StageOutcome {
    pub stage: StageKind,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Whether the stage met its minimum success fraction.
    pub passed: bool,
}

/// Dispatch every eligible page of `stage` through `worker`, at most
/// `spec.concurrency` in flight, and record each outcome in the run.
///
/// `worker` receives a snapshot of the page record (taken after the page is
/// marked `InProgress`) and returns either the stage's result payload or the
/// final post-retry error. Completion order is arbitrary; all ordering
/// guarantees live in the run record's index-sorted page list, never here.
pub async fn run_stage<F, Fut>(
    stage: StageKind,
    spec: &StageSpec,
    pool: Arc<Semaphore>,
    run: &SharedRun,
    cancel: &CancelFlag,
    progress: &ProgressCallback,
    worker: F,
) -> StageOutcome
where
    F: Fn(PageRecord) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StageResult, ExhaustedCall>> + Send,
{
    let eligible = run.with(|r| r.eligible_pages(stage));
    info!("{stage}: dispatching {} pages", eligible.len());
    progress.on_stage_start(stage, eligible.len());

    let worker = &worker;
    stream::iter(eligible)
        .map(|index| {
            let run = run.clone();
            let pool = pool.clone();
            let cancel = cancel.clone();
            let progress = progress.clone();
            async move {
                if cancel.is_cancelled() {
                    return;
                }
                let _permit = match pool.acquire_owned().await {
                    Ok(permit) => permit,
                    // Closed semaphore means the process is shutting down.
                    Err(_) => return,
                };
                if cancel.is_cancelled() {
                    return;
                }

                let snapshot = run.with(|r| {
                    let page = r.page_mut(index)?;
                    page.begin(stage).then(|| page.clone())
                });
                let Some(snapshot) = snapshot else { return };
                progress.on_page_start(stage, index);

                match worker(snapshot).await {
                    Ok(result) => {
                        run.with(|r| {
                            if let Some(page) = r.page_mut(index) {
                                page.succeed(stage, result);
                            }
                        });
                        progress.on_page_complete(stage, index);
                    }
                    Err(exhausted) => {
                        warn!(
                            "{stage}: page {index} failed after {} retries — {}",
                            exhausted.retries, exhausted.error
                        );
                        run.with(|r| {
                            if let Some(page) = r.page_mut(index) {
                                page.fail(stage, exhausted.error.to_string());
                            }
                            r.record_error(ErrorRecord::from_stage_error(
                                &exhausted.error,
                                Some(index),
                                exhausted.retries,
                            ));
                        });
                        progress.on_page_error(stage, index, &exhausted.error);
                    }
                }
            }
        })
        .buffer_unordered(spec.concurrency.max(1))
        .collect::<Vec<()>>()
        .await;

    let outcome = run.with(|r| evaluate(stage, spec, r));
    progress.on_stage_complete(stage, outcome.succeeded, outcome.failed, outcome.passed);
    info!(
        "{stage}: {} succeeded, {} failed of {} attempted — {}",
        outcome.succeeded,
        outcome.failed,
        outcome.attempted,
        if outcome.passed { "passed" } else { "below threshold" }
    );
    outcome
}

/// Judge a stage against its minimum success fraction.
///
/// Counts every page with a terminal status for the stage, whichever batch
/// produced it, so resumed work accumulates toward the threshold. A stage
/// that attempted nothing passes trivially.
pub fn evaluate(stage: StageKind, spec: &StageSpec, run: &PipelineRun) -> StageOutcome {
    let counts = run.stage_counts(stage);
    let passed = if counts.attempted == 0 {
        true
    } else {
        let ratio = counts.succeeded as f64 / counts.attempted as f64;
        ratio + 1e-9 >= spec.min_success_fraction
    };
    StageOutcome {
        stage,
        attempted: counts.attempted,
        succeeded: counts.succeeded,
        failed: counts.failed,
        passed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::error::StageError;
    use crate::progress::NoopProgressCallback;
    use crate::state::StageStatus;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;

    fn seeded_run(pages: usize) -> SharedRun {
        let config = PipelineConfig::default();
        let mut run = PipelineRun::new(&config, StageKind::SEQUENCE.to_vec());
        run.seed_pages(
            (1..=pages)
                .map(|i| PathBuf::from(format!("/d/page_{i:03}.png")))
                .collect(),
        );
        SharedRun::new(run)
    }

    fn noop_progress() -> ProgressCallback {
        Arc::new(NoopProgressCallback)
    }

    fn analyzed(page: &PageRecord) -> Result<StageResult, ExhaustedCall> {
        let _ = page;
        Ok(StageResult::Analyzed {
            layout: Default::default(),
        })
    }

    fn exhausted() -> ExhaustedCall {
        ExhaustedCall {
            error: StageError::Timeout {
                stage: StageKind::Analyze,
                secs: 30,
            },
            retries: 3,
        }
    }

    #[tokio::test]
    async fn all_pages_succeed() {
        let run = seeded_run(5);
        let spec = PipelineConfig::default().specs.analyze;
        let pool = Arc::new(Semaphore::new(spec.concurrency));

        let outcome = run_stage(
            StageKind::Analyze,
            &spec,
            pool,
            &run,
            &CancelFlag::new(),
            &noop_progress(),
            |page| async move { analyzed(&page) },
        )
        .await;

        assert!(outcome.passed);
        assert_eq!(outcome.succeeded, 5);
        assert_eq!(outcome.failed, 0);
        run.with(|r| {
            for page in &r.pages {
                assert_eq!(page.stage_status(StageKind::Analyze), StageStatus::Succeeded);
            }
        });
    }

    #[tokio::test]
    async fn failures_are_absorbed_and_recorded() {
        let run = seeded_run(4);
        let spec = PipelineConfig::default().specs.analyze;
        let pool = Arc::new(Semaphore::new(spec.concurrency));

        // Odd pages fail, even pages succeed.
        let outcome = run_stage(
            StageKind::Analyze,
            &spec,
            pool,
            &run,
            &CancelFlag::new(),
            &noop_progress(),
            |page| async move {
                if page.index % 2 == 1 {
                    Err(exhausted())
                } else {
                    analyzed(&page)
                }
            },
        )
        .await;

        assert_eq!(outcome.succeeded, 2);
        assert_eq!(outcome.failed, 2);
        // Default analyze threshold is 1.0, so two failures sink the stage.
        assert!(!outcome.passed);
        run.with(|r| {
            assert_eq!(r.errors.len(), 2);
            assert!(r.errors.iter().all(|e| e.retries == 3));
            assert_eq!(
                r.page(1).unwrap().stage_status(StageKind::Analyze),
                StageStatus::Failed
            );
            assert_eq!(
                r.page(2).unwrap().stage_status(StageKind::Analyze),
                StageStatus::Succeeded
            );
        });
    }

    #[tokio::test]
    async fn success_fraction_boundary_is_inclusive() {
        let run = seeded_run(10);
        let mut spec = PipelineConfig::default().specs.extract;
        spec.min_success_fraction = 0.8;
        let pool = Arc::new(Semaphore::new(spec.concurrency));

        // Make Extract eligible by completing Process first.
        run.with(|r| {
            for i in 1..=10 {
                let page = r.page_mut(i).unwrap();
                for prior in [StageKind::Analyze, StageKind::Process] {
                    page.begin(prior);
                    page.succeed(
                        prior,
                        StageResult::Processed {
                            cleaned_path: PathBuf::from(format!("/d/cleaned/page_{i:03}.png")),
                            illustration_paths: vec![],
                        },
                    );
                }
            }
        });

        // Exactly 8 of 10 succeed: 0.8 >= 0.8 must pass.
        let outcome = run_stage(
            StageKind::Extract,
            &spec,
            pool,
            &run,
            &CancelFlag::new(),
            &noop_progress(),
            |page| async move {
                if page.index <= 8 {
                    Ok(StageResult::Extracted {
                        text: "text".into(),
                        confidence: 90.0,
                        word_count: 1,
                        char_count: 4,
                    })
                } else {
                    Err(exhausted())
                }
            },
        )
        .await;

        assert_eq!(outcome.succeeded, 8);
        assert!(outcome.passed);
    }

    #[tokio::test]
    async fn concurrency_is_bounded_by_the_pool() {
        let run = seeded_run(12);
        let mut spec = PipelineConfig::default().specs.analyze;
        spec.concurrency = 3;
        let pool = Arc::new(Semaphore::new(3));

        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let outcome = {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            run_stage(
                StageKind::Analyze,
                &spec,
                pool,
                &run,
                &CancelFlag::new(),
                &noop_progress(),
                move |page| {
                    let in_flight = in_flight.clone();
                    let peak = peak.clone();
                    async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        analyzed(&page)
                    }
                },
            )
            .await
        };

        assert_eq!(outcome.succeeded, 12);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn cancellation_leaves_pending_pages_not_started() {
        let run = seeded_run(6);
        let mut spec = PipelineConfig::default().specs.analyze;
        spec.concurrency = 1;
        let pool = Arc::new(Semaphore::new(1));
        let cancel = CancelFlag::new();

        // Cancel after the second page completes; with width 1 the rest are
        // still queued and must stay NotStarted.
        let seen = Arc::new(AtomicUsize::new(0));
        let outcome = {
            let cancel_inner = cancel.clone();
            let seen = seen.clone();
            run_stage(
                StageKind::Analyze,
                &spec,
                pool,
                &run,
                &cancel,
                &noop_progress(),
                move |page| {
                    let cancel = cancel_inner.clone();
                    let seen = seen.clone();
                    async move {
                        if seen.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
                            cancel.cancel();
                        }
                        analyzed(&page)
                    }
                },
            )
            .await
        };

        assert_eq!(outcome.succeeded + outcome.failed, 2);
        run.with(|r| {
            let untouched = r
                .pages
                .iter()
                .filter(|p| p.stage_status(StageKind::Analyze) == StageStatus::NotStarted)
                .count();
            assert_eq!(untouched, 4);
        });
    }

    #[test]
    fn evaluate_passes_trivially_with_no_attempts() {
        let run = seeded_run(3);
        let spec = PipelineConfig::default().specs.interpret;
        let outcome = run.with(|r| evaluate(StageKind::Interpret, &spec, r));
        assert_eq!(outcome.attempted, 0);
        assert!(outcome.passed);
    }
}
