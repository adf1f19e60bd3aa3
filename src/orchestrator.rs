//! The orchestrator core: stage sequencing and run lifecycle.
//!
//! Drives one [`PipelineRun`] through its stages in canonical order,
//! probing each stage's health before dispatching its batch, persisting the
//! run state at every stage boundary, and deciding pass/fail per stage from
//! its minimum success fraction.
//!
//! Entry points:
//! * [`Orchestrator::run`] — fresh end-to-end run (retrieve onwards)
//! * [`Orchestrator::resume`] — reload a persisted run, reset failed pages,
//!   continue from the first incomplete stage
//! * [`Orchestrator::run_single_stage`] — repair one named stage against an
//!   existing run, with prerequisite validation
//! * [`Orchestrator::check_health`] — probe all five services, change nothing
//!
//! A run that completes with a stage below threshold is not an `Err`: the
//! orchestrator still aggregates what it has and returns the summary with
//! status `Failed`. `Err` is reserved for conditions where there is nothing
//! to summarise (bad config, unwritable output, missing run state).

use crate::aggregate::{self, RunSummary};
use crate::batch::{self, CancelFlag, SharedRun, StageOutcome, StagePools};
use crate::config::{PipelineConfig, StageKind};
use crate::error::{ErrorRecord, PipelineError, StageError};
use crate::progress::{NoopProgressCallback, ProgressCallback};
use crate::stage::client::{HttpStageClient, StageClient};
use crate::stage::contract::{
    HealthResponse, InterpretationRequest, LayoutRequest, OcrRequest, ProcessingRequest,
    RetrievalRequest, StageRequest,
};
use crate::stage::executor::{ExhaustedCall, StageExecutor};
use crate::state::{page_index_from_path, PageRecord, PerStage, PipelineRun, RunStatus, StageResult};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Coordinates a document pipeline across its five stage services.
pub struct Orchestrator {
    config: PipelineConfig,
    clients: PerStage<Arc<dyn StageClient>>,
    pools: StagePools,
    cancel: CancelFlag,
    progress: ProgressCallback,
}

impl Orchestrator {
    /// Build an orchestrator with HTTP clients for the configured endpoints.
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        let make = |kind: StageKind| -> Result<Arc<dyn StageClient>, PipelineError> {
            let endpoint = config.specs.get(kind).endpoint.clone();
            let client = HttpStageClient::new(kind, endpoint)
                .map_err(|e| PipelineError::InvalidConfig(format!("{kind} client: {e}")))?;
            Ok(Arc::new(client))
        };
        let clients = PerStage {
            retrieve: make(StageKind::Retrieve)?,
            analyze: make(StageKind::Analyze)?,
            process: make(StageKind::Process)?,
            extract: make(StageKind::Extract)?,
            interpret: make(StageKind::Interpret)?,
        };
        Ok(Self::with_clients(config, clients))
    }

    /// Build an orchestrator over caller-supplied stage clients.
    ///
    /// This is the seam tests use to drive the full orchestration logic with
    /// scripted in-process services.
    pub fn with_clients(config: PipelineConfig, clients: PerStage<Arc<dyn StageClient>>) -> Self {
        let pools = StagePools::new(&config.specs);
        Self {
            config,
            clients,
            pools,
            cancel: CancelFlag::new(),
            progress: Arc::new(NoopProgressCallback),
        }
    }

    /// Attach a progress observer.
    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = progress;
        self
    }

    /// Handle for cooperative cancellation (e.g. from a ctrl-c handler).
    /// In-flight calls finish; untouched pages stay resumable.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    fn executor(&self, stage: StageKind) -> StageExecutor {
        StageExecutor::new(
            self.clients.get(stage).clone(),
            self.config.specs.get(stage).clone(),
            self.config.health_timeout_secs,
        )
    }

    /// The stages this configuration executes, in order.
    fn planned_stages(&self) -> Vec<StageKind> {
        StageKind::SEQUENCE
            .into_iter()
            .filter(|&k| !(k == StageKind::Retrieve && self.config.skip_retrieval))
            .filter(|&k| !(k == StageKind::Interpret && self.config.skip_interpretation))
            .collect()
    }

    // ── Entry points ─────────────────────────────────────────────────────

    /// Run the full pipeline from scratch.
    pub async fn run(&self) -> Result<RunSummary, PipelineError> {
        if !self.config.skip_retrieval && self.config.book_url.is_none() {
            return Err(PipelineError::SourceUrlMissing);
        }
        self.ensure_output_tree().await?;

        let mut run = PipelineRun::new(&self.config, self.planned_stages());
        if self.config.skip_retrieval {
            let images = self.list_seed_images().await?;
            run.seed_pages(images);
            info!("seeded {} pages from existing images", run.pages.len());
        }
        info!(run_id = %run.run_id, title = %run.title, "starting pipeline run");

        let shared = SharedRun::new(run);
        self.drive(&shared).await
    }

    /// Reload the persisted run in `output_dir` and continue it.
    ///
    /// Pages whose stage status is `Failed` (or `InProgress`, after a crash)
    /// are reset and re-dispatched; succeeded work is never redone. Resuming
    /// a run where nothing failed re-aggregates and returns without any
    /// service calls.
    pub async fn resume(&self) -> Result<RunSummary, PipelineError> {
        let mut run = PipelineRun::load(&self.config.output_dir).await?;
        if run.status == RunStatus::Done {
            info!(run_id = %run.run_id, "run already complete; nothing to resume");
            return Ok(RunSummary::from_run(&run));
        }

        info!(run_id = %run.run_id, status = ?run.status, "resuming run");
        let stages = run.stages.clone();
        for stage in &stages {
            for page in &mut run.pages {
                page.reset_for_resume(*stage);
            }
        }
        // The loaded status may be anything from Failed to a mid-stage active
        // state (a crash or cancellation persists those). Reactivation
        // restarts the forward walk, bypassing the forward-only rule; stages
        // whose pages all succeeded are skipped by eligibility anyway.
        run.status = RunStatus::Pending;

        let shared = SharedRun::new(run);
        self.drive(&shared).await
    }

    /// Execute exactly one named stage against the persisted run.
    ///
    /// Validates that the stage's prerequisite succeeded on every page
    /// unless `skip_prior_validation` is set, in which case only the pages
    /// with a usable prerequisite result are dispatched. Failed pages of the
    /// named stage are reset and retried; succeeded pages are left alone.
    pub async fn run_single_stage(
        &self,
        stage: StageKind,
        skip_prior_validation: bool,
    ) -> Result<RunSummary, PipelineError> {
        // A single-stage Retrieve is a fresh seed, not a repair. Downstream
        // stages stay on the run's plan so a later resume walks them; the
        // settled status reflects how far the pipeline actually got.
        if stage == StageKind::Retrieve {
            if self.config.book_url.is_none() {
                return Err(PipelineError::SourceUrlMissing);
            }
            self.ensure_output_tree().await?;
            let mut run = PipelineRun::new(&self.config, self.planned_stages());
            run.transition(RunStatus::Retrieving)?;
            let shared = SharedRun::new(run);
            self.persist(&shared).await?;

            let outcome = self.execute_stage(&shared, stage).await?;
            self.persist(&shared).await?;
            return self
                .settle_single_stage(&shared, outcome, RunStatus::Retrieving)
                .await;
        }

        let mut run = PipelineRun::load(&self.config.output_dir).await?;

        if let Some(prior) = stage.prerequisite() {
            let total = run.pages.len();
            let missing = run.pages.iter().filter(|p| !p.succeeded_at(prior)).count();
            if missing > 0 && !skip_prior_validation {
                return Err(PipelineError::PrerequisiteMissing {
                    stage,
                    prior,
                    missing,
                    total,
                });
            }
            if missing > 0 {
                warn!(
                    "{stage}: forcing past {missing} of {total} pages without a {prior} result"
                );
            }
        }

        for page in &mut run.pages {
            page.reset_for_resume(stage);
        }
        let prev_status = run.status;
        // Explicit rerun of one stage; bypasses the forward-only status rule.
        run.status = RunStatus::for_stage(stage);

        let shared = SharedRun::new(run);
        self.persist(&shared).await?;

        let outcome = self.execute_stage(&shared, stage).await?;
        self.persist(&shared).await?;

        self.settle_single_stage(&shared, outcome, prev_status).await
    }

    /// Probe every stage service once. Purely observational.
    pub async fn check_health(&self) -> Vec<(StageKind, Result<HealthResponse, StageError>)> {
        let probes = StageKind::SEQUENCE.map(|kind| {
            let exec = self.executor(kind);
            async move { (kind, exec.probe().await) }
        });
        futures::future::join_all(probes).await
    }

    // ── Run lifecycle ────────────────────────────────────────────────────

    /// Walk the run's stages in order, stopping at the first stage that
    /// misses its success threshold.
    async fn drive(&self, run: &SharedRun) -> Result<RunSummary, PipelineError> {
        let stages = run.with(|r| r.stages.clone());
        for stage in stages {
            run.with(|r| r.transition(RunStatus::for_stage(stage)))?;
            self.persist(run).await?;

            let outcome = self.execute_stage(run, stage).await?;
            self.persist(run).await?;

            if self.cancel.is_cancelled() {
                // Park at the active stage: the batch was cut short, so its
                // threshold verdict is meaningless. Resume picks up the
                // untouched pages.
                warn!("{stage}: run cancelled; state saved for resume");
                return self.finish(run, false).await;
            }

            if !outcome.passed {
                error!(
                    "{stage}: {}/{} pages succeeded, below the {:.0}% threshold — run failed",
                    outcome.succeeded,
                    outcome.attempted,
                    self.config.specs.get(stage).min_success_fraction * 100.0
                );
                run.with(|r| r.transition(RunStatus::Failed))?;
                self.persist(run).await?;
                return self.finish(run, false).await;
            }
        }

        run.with(|r| r.transition(RunStatus::Aggregating))?;
        self.persist(run).await?;
        run.with(|r| r.transition(RunStatus::Done))?;
        self.persist(run).await?;
        self.finish(run, true).await
    }

    /// Aggregate, write artifacts, and emit the final summary.
    ///
    /// Runs for failed runs too: a partial book with gap markers is far more
    /// useful than nothing.
    async fn finish(&self, run: &SharedRun, succeeded: bool) -> Result<RunSummary, PipelineError> {
        let snapshot = run.snapshot();
        let summary = aggregate::write_artifacts(&snapshot).await?;
        self.progress.on_run_complete(succeeded);
        info!(
            run_id = %summary.run_id,
            status = ?summary.status,
            pages = summary.page_count,
            words = summary.total_words,
            skipped = summary.skipped_pages.len(),
            "run finished"
        );
        Ok(summary)
    }

    /// Decide the run status after a single-stage repair.
    ///
    /// The whole pipeline is re-judged: if any stage with attempts is below
    /// threshold the run is `Failed`; if every planned stage has passed with
    /// real attempts the run is `Done`; otherwise the prior status stands
    /// (the pipeline simply has not run that far yet).
    async fn settle_single_stage(
        &self,
        run: &SharedRun,
        outcome: StageOutcome,
        prev_status: RunStatus,
    ) -> Result<RunSummary, PipelineError> {
        let (any_failing, complete) = run.with(|r| {
            let mut any_failing = !outcome.passed;
            let mut complete = true;
            for &s in &r.stages {
                let o = batch::evaluate(s, self.config.specs.get(s), r);
                if !o.passed {
                    any_failing = true;
                }
                let ran = o.attempted > 0 || r.pages.is_empty() || s == StageKind::Retrieve;
                if !(o.passed && ran) {
                    complete = false;
                }
            }
            (any_failing, complete)
        });

        run.with(|r| {
            r.status = if any_failing {
                RunStatus::Failed
            } else if complete {
                RunStatus::Done
            } else {
                prev_status
            };
        });
        self.persist(run).await?;
        self.finish(run, !any_failing).await
    }

    // ── Stage execution ──────────────────────────────────────────────────

    /// Probe, then dispatch one stage. `Ok` even when the stage fails its
    /// threshold; `Err` only for fatal conditions (no pages retrieved, etc.).
    async fn execute_stage(
        &self,
        run: &SharedRun,
        stage: StageKind,
    ) -> Result<StageOutcome, PipelineError> {
        if stage == StageKind::Retrieve {
            return self.run_retrieve(run).await;
        }

        let spec = self.config.specs.get(stage).clone();
        let executor = self.executor(stage);

        if let Err(e) = executor.probe().await {
            // The stage never starts: zero attempts, no retry budget spent.
            // A required stage fails the run; a best-effort stage is skipped.
            let passed = spec.min_success_fraction <= 0.0;
            warn!("{stage}: health probe failed, skipping stage — {e}");
            run.with(|r| r.record_error(ErrorRecord::from_stage_error(&e, None, 0)));
            return Ok(StageOutcome {
                stage,
                attempted: 0,
                succeeded: 0,
                failed: 0,
                passed,
            });
        }

        let pool = self.pools.get(stage);
        let config = Arc::new(self.config.clone());
        let outcome = batch::run_stage(
            stage,
            &spec,
            pool,
            run,
            &self.cancel,
            &self.progress,
            move |page| {
                let executor = executor.clone();
                let config = config.clone();
                async move { page_call(stage, &executor, &config, page).await }
            },
        )
        .await;
        Ok(outcome)
    }

    /// Retrieve is a run-level call, not a per-page fan-out: one request
    /// seeds every PageRecord of the run.
    async fn run_retrieve(&self, run: &SharedRun) -> Result<StageOutcome, PipelineError> {
        let stage = StageKind::Retrieve;

        // Resumed runs already have their pages; never re-fetch a book.
        if run.with(|r| !r.pages.is_empty()) {
            let counts = run.with(|r| r.stage_counts(stage));
            return Ok(StageOutcome {
                stage,
                attempted: counts.attempted,
                succeeded: counts.succeeded,
                failed: counts.failed,
                passed: true,
            });
        }

        let executor = self.executor(stage);
        if let Err(e) = executor.probe().await {
            warn!("{stage}: health probe failed — {e}");
            run.with(|r| r.record_error(ErrorRecord::from_stage_error(&e, None, 0)));
            return Ok(StageOutcome {
                stage,
                attempted: 0,
                succeeded: 0,
                failed: 0,
                passed: false,
            });
        }

        let url = self
            .config
            .book_url
            .clone()
            .ok_or(PipelineError::SourceUrlMissing)?;
        let images_dir = self.config.output_dir.join("images");
        let request = StageRequest::Retrieve(RetrievalRequest {
            url,
            strategy: self.config.strategy.as_str().to_string(),
            max_pages: self.config.max_pages,
            output_dir: images_dir.to_string_lossy().into_owned(),
        });

        self.progress.on_stage_start(stage, 1);
        match executor.execute(request).await {
            Ok(response) => {
                let retrieval = response.as_retrieval().cloned().ok_or_else(|| {
                    PipelineError::Internal("retrieve client returned a non-retrieval response".into())
                })?;
                if retrieval.image_paths.is_empty() {
                    return Err(PipelineError::NoPagesFound { dir: images_dir });
                }
                info!("{stage}: {} pages retrieved", retrieval.image_paths.len());
                run.with(|r| {
                    r.seed_pages(retrieval.image_paths.iter().map(PathBuf::from).collect())
                });
                self.progress.on_stage_complete(stage, 1, 0, true);
                Ok(StageOutcome {
                    stage,
                    attempted: 1,
                    succeeded: 1,
                    failed: 0,
                    passed: true,
                })
            }
            Err(exhausted) => {
                error!(
                    "{stage}: failed after {} retries — {}",
                    exhausted.retries, exhausted.error
                );
                run.with(|r| {
                    r.record_error(ErrorRecord::from_stage_error(
                        &exhausted.error,
                        None,
                        exhausted.retries,
                    ))
                });
                self.progress.on_stage_complete(stage, 0, 1, false);
                Ok(StageOutcome {
                    stage,
                    attempted: 1,
                    succeeded: 0,
                    failed: 1,
                    passed: false,
                })
            }
        }
    }

    // ── Filesystem plumbing ──────────────────────────────────────────────

    async fn ensure_output_tree(&self) -> Result<(), PipelineError> {
        for sub in ["images", "cleaned", "illustrations", "text", "metadata"] {
            let dir = self.config.output_dir.join(sub);
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| PipelineError::OutputDirFailed {
                    path: dir.clone(),
                    source: e,
                })?;
        }
        Ok(())
    }

    /// List existing page images for a retrieval-skipping run, lowest page
    /// indices first, capped at `max_pages`.
    async fn list_seed_images(&self) -> Result<Vec<PathBuf>, PipelineError> {
        let dir = self.config.output_dir.join("images");
        let mut reader = match tokio::fs::read_dir(&dir).await {
            Ok(r) => r,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PipelineError::NoPagesFound { dir })
            }
            Err(e) => {
                return Err(PipelineError::OutputDirFailed {
                    path: dir,
                    source: e,
                })
            }
        };

        let mut paths = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| PipelineError::OutputDirFailed {
                path: dir.clone(),
                source: e,
            })?
        {
            let path = entry.path();
            let is_image = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| matches!(e.to_lowercase().as_str(), "png" | "jpg" | "jpeg" | "webp"))
                .unwrap_or(false);
            if is_image {
                paths.push(path);
            }
        }
        if paths.is_empty() {
            return Err(PipelineError::NoPagesFound { dir });
        }

        paths.sort_by_key(|p| page_index_from_path(p).unwrap_or(usize::MAX));
        if let Some(cap) = self.config.max_pages {
            paths.truncate(cap);
        }
        Ok(paths)
    }

    async fn persist(&self, run: &SharedRun) -> Result<(), PipelineError> {
        run.snapshot().save().await
    }
}

/// Build and issue the stage's request for one page, then map the response
/// into the page's [`StageResult`].
async fn page_call(
    stage: StageKind,
    executor: &StageExecutor,
    config: &PipelineConfig,
    page: PageRecord,
) -> Result<StageResult, ExhaustedCall> {
    match stage {
        // Run-level, handled by the orchestrator directly.
        StageKind::Retrieve => unreachable!("retrieve never reaches the per-page path"),

        StageKind::Analyze => {
            let request = StageRequest::Analyze(LayoutRequest {
                image_path: page.source_path.to_string_lossy().into_owned(),
                confidence_threshold: config.layout_confidence,
            });
            let response = executor.execute(request).await?;
            let layout = response
                .as_layout()
                .cloned()
                .ok_or_else(|| wrong_variant(stage))?;
            Ok(StageResult::Analyzed { layout })
        }

        StageKind::Process => {
            // Eligibility guarantees Analyze succeeded, so the layout exists.
            let layout = page.layout().cloned().ok_or_else(|| wrong_variant(stage))?;
            let file_name = page
                .source_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| format!("page_{:03}.png", page.index));
            let cleaned = config.output_dir.join("cleaned").join(file_name);
            let illustrations = config.output_dir.join("illustrations");

            let request = StageRequest::Process(ProcessingRequest {
                image_path: page.source_path.to_string_lossy().into_owned(),
                layout_data: layout,
                output_cleaned_path: cleaned.to_string_lossy().into_owned(),
                output_illustrations_dir: Some(illustrations.to_string_lossy().into_owned()),
            });
            let response = executor.execute(request).await?;
            let processed = response
                .as_processing()
                .cloned()
                .ok_or_else(|| wrong_variant(stage))?;
            Ok(StageResult::Processed {
                cleaned_path: PathBuf::from(processed.cleaned_path),
                illustration_paths: processed
                    .illustration_paths
                    .into_iter()
                    .map(PathBuf::from)
                    .collect(),
            })
        }

        StageKind::Extract => {
            let cleaned = page.cleaned_path().ok_or_else(|| wrong_variant(stage))?;
            let request = StageRequest::Extract(OcrRequest {
                image_path: cleaned.to_string_lossy().into_owned(),
                languages: config.languages.clone(),
                confidence_threshold: config.ocr_confidence,
            });
            let response = executor.execute(request).await?;
            let ocr = response.as_ocr().cloned().ok_or_else(|| wrong_variant(stage))?;
            Ok(StageResult::Extracted {
                text: ocr.text,
                confidence: ocr.confidence,
                word_count: ocr.word_count,
                char_count: ocr.char_count,
            })
        }

        StageKind::Interpret => {
            // One call per illustration; a page with none succeeds with an
            // empty set and never touches the service.
            let mut interpretations = Vec::new();
            for path in page.illustration_paths() {
                let request = StageRequest::Interpret(InterpretationRequest {
                    image_path: path.to_string_lossy().into_owned(),
                    context: Some(config.interpret_context()),
                });
                let response = executor.execute(request).await?;
                let interp = response
                    .as_interpretation()
                    .cloned()
                    .ok_or_else(|| wrong_variant(stage))?;
                interpretations.push(interp.into());
            }
            Ok(StageResult::Interpreted { interpretations })
        }
    }
}

/// A response whose variant does not match its stage: a client bug, never
/// worth a retry.
fn wrong_variant(stage: StageKind) -> ExhaustedCall {
    ExhaustedCall {
        error: StageError::MalformedResponse {
            stage,
            detail: "response variant does not match the stage".into(),
        },
        retries: 0,
    }
}
