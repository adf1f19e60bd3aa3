//! The authoritative record of a pipeline run.
//!
//! [`PipelineRun`] owns every [`PageRecord`] and the append-only error list.
//! It is an explicit owned struct handed by reference to the orchestrator
//! and batch coordinator — there is no ambient or static run state anywhere
//! in the crate.
//!
//! ## Status discipline
//!
//! A page's per-stage status only ever moves
//! `NotStarted → InProgress → {Succeeded, Failed}`. The single sanctioned
//! exception is an explicit resume, which resets `Failed`/`InProgress` back
//! to `NotStarted` for the targeted stage only — `Succeeded` work is never
//! redone. The mutators below enforce this; callers cannot write an
//! arbitrary status.
//!
//! ## Durability
//!
//! The run serialises to `run_state.json` inside its output directory
//! (atomic tmp + rename, so a crash never leaves a torn file). Page results
//! are written into the in-memory record the moment each page completes and
//! the file is flushed at stage boundaries, so a crash mid-stage loses at
//! most the in-flight calls.

use crate::config::{PipelineConfig, StageKind};
use crate::error::{ErrorRecord, PipelineError};
use crate::stage::contract::{InterpretationResponse, PageLayout};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Per-page, per-stage progress marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    NotStarted,
    InProgress,
    Succeeded,
    Failed,
}

/// Run-level state machine position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Retrieving,
    Analyzing,
    Processing,
    Extracting,
    Interpreting,
    Aggregating,
    Done,
    Failed,
}

impl RunStatus {
    /// The active status while a given stage is executing.
    pub fn for_stage(stage: StageKind) -> RunStatus {
        match stage {
            StageKind::Retrieve => RunStatus::Retrieving,
            StageKind::Analyze => RunStatus::Analyzing,
            StageKind::Process => RunStatus::Processing,
            StageKind::Extract => RunStatus::Extracting,
            StageKind::Interpret => RunStatus::Interpreting,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Done | RunStatus::Failed)
    }

    /// Position in the forward chain; `Failed` has no position.
    fn rank(self) -> Option<u8> {
        match self {
            RunStatus::Pending => Some(0),
            RunStatus::Retrieving => Some(1),
            RunStatus::Analyzing => Some(2),
            RunStatus::Processing => Some(3),
            RunStatus::Extracting => Some(4),
            RunStatus::Interpreting => Some(5),
            RunStatus::Aggregating => Some(6),
            RunStatus::Done => Some(7),
            RunStatus::Failed => None,
        }
    }
}

/// One value per stage kind; the shape used for statuses, results, and
/// last-error slots so the serialised run state stays flat and readable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerStage<T> {
    pub retrieve: T,
    pub analyze: T,
    pub process: T,
    pub extract: T,
    pub interpret: T,
}

impl<T> PerStage<T> {
    pub fn get(&self, kind: StageKind) -> &T {
        match kind {
            StageKind::Retrieve => &self.retrieve,
            StageKind::Analyze => &self.analyze,
            StageKind::Process => &self.process,
            StageKind::Extract => &self.extract,
            StageKind::Interpret => &self.interpret,
        }
    }

    pub fn get_mut(&mut self, kind: StageKind) -> &mut T {
        match kind {
            StageKind::Retrieve => &mut self.retrieve,
            StageKind::Analyze => &mut self.analyze,
            StageKind::Process => &mut self.process,
            StageKind::Extract => &mut self.extract,
            StageKind::Interpret => &mut self.interpret,
        }
    }
}

/// Stage-specific payload for one page. Immutable once written; resume
/// clears the slot rather than editing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageResult {
    Retrieved {
        source_path: PathBuf,
    },
    Analyzed {
        layout: PageLayout,
    },
    Processed {
        cleaned_path: PathBuf,
        illustration_paths: Vec<PathBuf>,
    },
    Extracted {
        text: String,
        confidence: f64,
        word_count: usize,
        char_count: usize,
    },
    Interpreted {
        interpretations: Vec<Interpretation>,
    },
}

/// One illustration's interpretation, as stored in the run state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interpretation {
    pub image_path: PathBuf,
    pub caption: String,
    pub description: String,
    pub tags: Vec<String>,
    pub educational_value: String,
    pub related_concepts: Vec<String>,
}

impl From<InterpretationResponse> for Interpretation {
    fn from(r: InterpretationResponse) -> Self {
        Self {
            image_path: PathBuf::from(r.image_path),
            caption: r.caption,
            description: r.description,
            tags: r.tags,
            educational_value: r.educational_value,
            related_concepts: r.related_concepts,
        }
    }
}

/// Attempted/succeeded/failed tallies for one stage over the whole run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounts {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// One page/image unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageRecord {
    /// Canonical position; the aggregate is always ordered by this index,
    /// never by completion order.
    pub index: usize,
    /// The retrieved page image on shared storage.
    pub source_path: PathBuf,
    pub status: PerStage<StageStatus>,
    pub results: PerStage<Option<StageResult>>,
    /// Human-readable text of the most recent failure per stage.
    pub last_error: PerStage<Option<String>>,
}

impl PageRecord {
    pub fn new(index: usize, source_path: PathBuf) -> Self {
        let mut record = Self {
            index,
            source_path: source_path.clone(),
            status: PerStage::default(),
            results: PerStage::default(),
            last_error: PerStage::default(),
        };
        // Retrieval produced this page, so the seed stage is already done.
        record.status.retrieve = StageStatus::Succeeded;
        record.results.retrieve = Some(StageResult::Retrieved { source_path });
        record
    }

    pub fn stage_status(&self, stage: StageKind) -> StageStatus {
        *self.status.get(stage)
    }

    pub fn succeeded_at(&self, stage: StageKind) -> bool {
        self.stage_status(stage) == StageStatus::Succeeded
    }

    /// Move `NotStarted → InProgress`. Returns false (and changes nothing)
    /// from any other state, so a page can never be dispatched twice.
    pub fn begin(&mut self, stage: StageKind) -> bool {
        let slot = self.status.get_mut(stage);
        if *slot == StageStatus::NotStarted {
            *slot = StageStatus::InProgress;
            true
        } else {
            false
        }
    }

    /// Record success: `InProgress → Succeeded`, store the result, clear the
    /// stage's last error.
    pub fn succeed(&mut self, stage: StageKind, result: StageResult) {
        debug_assert_eq!(self.stage_status(stage), StageStatus::InProgress);
        *self.status.get_mut(stage) = StageStatus::Succeeded;
        *self.results.get_mut(stage) = Some(result);
        *self.last_error.get_mut(stage) = None;
    }

    /// Record failure: `InProgress → Failed`, remember the error text.
    pub fn fail(&mut self, stage: StageKind, error: String) {
        debug_assert_eq!(self.stage_status(stage), StageStatus::InProgress);
        *self.status.get_mut(stage) = StageStatus::Failed;
        *self.last_error.get_mut(stage) = Some(error);
    }

    /// Explicit resume/retry reset for one stage: `Failed` and `InProgress`
    /// (a crash artefact) go back to `NotStarted`; `Succeeded` is kept.
    pub fn reset_for_resume(&mut self, stage: StageKind) {
        let slot = self.status.get_mut(stage);
        if matches!(*slot, StageStatus::Failed | StageStatus::InProgress) {
            *slot = StageStatus::NotStarted;
            *self.results.get_mut(stage) = None;
        }
    }

    /// The layout produced by Analyze, if that stage succeeded.
    pub fn layout(&self) -> Option<&PageLayout> {
        match self.results.analyze.as_ref() {
            Some(StageResult::Analyzed { layout }) => Some(layout),
            _ => None,
        }
    }

    /// The cleaned image path produced by Process.
    pub fn cleaned_path(&self) -> Option<&Path> {
        match self.results.process.as_ref() {
            Some(StageResult::Processed { cleaned_path, .. }) => Some(cleaned_path.as_path()),
            _ => None,
        }
    }

    /// Illustrations cropped by Process (empty when none were found).
    pub fn illustration_paths(&self) -> &[PathBuf] {
        match self.results.process.as_ref() {
            Some(StageResult::Processed {
                illustration_paths, ..
            }) => illustration_paths,
            _ => &[],
        }
    }

    /// OCR text from Extract, if it succeeded.
    pub fn extracted_text(&self) -> Option<&str> {
        match self.results.extract.as_ref() {
            Some(StageResult::Extracted { text, .. }) => Some(text.as_str()),
            _ => None,
        }
    }

    /// Interpretations from Interpret (empty when the page had none).
    pub fn interpretations(&self) -> &[Interpretation] {
        match self.results.interpret.as_ref() {
            Some(StageResult::Interpreted { interpretations }) => interpretations,
            _ => &[],
        }
    }
}

/// One book-processing job: identity, status, pages, errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub book_url: Option<String>,
    pub title: String,
    pub output_dir: PathBuf,
    /// The stages this run executes, in order.
    pub stages: Vec<StageKind>,
    pub created_at: DateTime<Utc>,
    pub status: RunStatus,
    pub pages: Vec<PageRecord>,
    /// Append-only; every entry here appears in the run summary.
    pub errors: Vec<ErrorRecord>,
}

impl PipelineRun {
    pub fn new(config: &PipelineConfig, stages: Vec<StageKind>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            book_url: config.book_url.clone(),
            title: config.title.clone(),
            output_dir: config.output_dir.clone(),
            stages,
            created_at: Utc::now(),
            status: RunStatus::Pending,
            pages: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Populate PageRecords from retrieved image paths.
    ///
    /// Canonical page indices come from the number embedded in each file
    /// name (`page_012.png` → 12); files without one fall back to their
    /// position in the listing. Pages are stored sorted by index so every
    /// later read is already in canonical order.
    pub fn seed_pages(&mut self, image_paths: Vec<PathBuf>) {
        let mut pages: Vec<PageRecord> = image_paths
            .into_iter()
            .enumerate()
            .map(|(pos, path)| {
                let index = page_index_from_path(&path).unwrap_or(pos + 1);
                PageRecord::new(index, path)
            })
            .collect();
        pages.sort_by_key(|p| p.index);
        self.pages = pages;
    }

    /// Transition the run-level status.
    ///
    /// `Done` is final. `Failed` is terminal for a run's forward walk but an
    /// explicit resume may reactivate it into a stage-active status. Forward
    /// jumps are legal (single-stage runs skip earlier statuses); silent
    /// regressions are not.
    pub fn transition(&mut self, to: RunStatus) -> Result<(), PipelineError> {
        let ok = match (self.status, to) {
            (a, b) if a == b => true,
            (RunStatus::Done, _) => false,
            (RunStatus::Failed, b) => !matches!(b, RunStatus::Done | RunStatus::Pending),
            (_, RunStatus::Failed) => true,
            (a, b) => match (a.rank(), b.rank()) {
                (Some(ra), Some(rb)) => rb >= ra,
                _ => false,
            },
        };
        if !ok {
            return Err(PipelineError::Internal(format!(
                "illegal run transition {:?} → {:?}",
                self.status, to
            )));
        }
        self.status = to;
        Ok(())
    }

    pub fn record_error(&mut self, record: ErrorRecord) {
        self.errors.push(record);
    }

    /// Pages whose `stage` slot is `NotStarted` and whose prerequisite
    /// stage (if any) succeeded — the dispatch set for a batch.
    pub fn eligible_pages(&self, stage: StageKind) -> Vec<usize> {
        self.pages
            .iter()
            .filter(|p| p.stage_status(stage) == StageStatus::NotStarted)
            .filter(|p| match stage.prerequisite() {
                Some(prior) => p.succeeded_at(prior),
                None => true,
            })
            .map(|p| p.index)
            .collect()
    }

    /// Tallies for one stage over all pages. `attempted` counts pages that
    /// reached a terminal stage status; `NotStarted`/`InProgress` pages are
    /// not attempts.
    pub fn stage_counts(&self, stage: StageKind) -> StageCounts {
        let mut counts = StageCounts::default();
        for page in &self.pages {
            match page.stage_status(stage) {
                StageStatus::Succeeded => {
                    counts.attempted += 1;
                    counts.succeeded += 1;
                }
                StageStatus::Failed => {
                    counts.attempted += 1;
                    counts.failed += 1;
                }
                StageStatus::NotStarted | StageStatus::InProgress => {}
            }
        }
        counts
    }

    pub fn page_mut(&mut self, index: usize) -> Option<&mut PageRecord> {
        self.pages.iter_mut().find(|p| p.index == index)
    }

    pub fn page(&self, index: usize) -> Option<&PageRecord> {
        self.pages.iter().find(|p| p.index == index)
    }

    // ── Persistence ──────────────────────────────────────────────────────

    /// Canonical location of the persisted state inside an output directory.
    pub fn state_path(output_dir: &Path) -> PathBuf {
        output_dir.join("run_state.json")
    }

    /// Persist to `run_state.json` with an atomic tmp-file + rename.
    pub async fn save(&self) -> Result<(), PipelineError> {
        let path = Self::state_path(&self.output_dir);
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| PipelineError::Internal(format!("serialising run state: {e}")))?;

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|e| PipelineError::StatePersistFailed {
                path: path.clone(),
                source: e,
            })?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| PipelineError::StatePersistFailed { path, source: e })
    }

    /// Load a previously persisted run from an output directory.
    pub async fn load(output_dir: &Path) -> Result<Self, PipelineError> {
        let path = Self::state_path(output_dir);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PipelineError::RunStateNotFound { path })
            }
            Err(e) => {
                return Err(PipelineError::RunStateCorrupt {
                    path,
                    detail: e.to_string(),
                })
            }
        };
        serde_json::from_slice(&bytes).map_err(|e| PipelineError::RunStateCorrupt {
            path,
            detail: e.to_string(),
        })
    }
}

static PAGE_NUM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)").expect("valid literal regex"));

/// Extract the page number embedded in an image file name, taking the last
/// run of digits in the stem (`book2_page_014.png` → 14).
pub fn page_index_from_path(path: &Path) -> Option<usize> {
    let stem = path.file_stem()?.to_str()?;
    PAGE_NUM_RE
        .find_iter(stem)
        .last()
        .and_then(|m| m.as_str().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(index: usize) -> PageRecord {
        PageRecord::new(index, PathBuf::from(format!("/data/images/page_{index:03}.png")))
    }

    #[test]
    fn page_index_extraction() {
        assert_eq!(
            page_index_from_path(Path::new("/data/images/page_014.png")),
            Some(14)
        );
        assert_eq!(
            page_index_from_path(Path::new("/data/images/book2_page_7.png")),
            Some(7)
        );
        assert_eq!(page_index_from_path(Path::new("/data/images/cover.png")), None);
    }

    #[test]
    fn seed_orders_by_embedded_index() {
        let config = PipelineConfig::default();
        let mut run = PipelineRun::new(&config, StageKind::SEQUENCE.to_vec());
        run.seed_pages(vec![
            PathBuf::from("/d/page_010.png"),
            PathBuf::from("/d/page_002.png"),
            PathBuf::from("/d/page_001.png"),
        ]);
        let indices: Vec<usize> = run.pages.iter().map(|p| p.index).collect();
        assert_eq!(indices, vec![1, 2, 10]);
        assert!(run.pages[0].succeeded_at(StageKind::Retrieve));
    }

    #[test]
    fn status_only_moves_forward() {
        let mut p = page(1);
        assert!(p.begin(StageKind::Analyze));
        // A second dispatch attempt is refused.
        assert!(!p.begin(StageKind::Analyze));

        p.succeed(
            StageKind::Analyze,
            StageResult::Analyzed {
                layout: PageLayout::default(),
            },
        );
        assert!(p.succeeded_at(StageKind::Analyze));

        // Succeeded pages are not reset by resume.
        p.reset_for_resume(StageKind::Analyze);
        assert!(p.succeeded_at(StageKind::Analyze));
    }

    #[test]
    fn resume_resets_failed_and_in_progress_only() {
        let mut failed = page(1);
        failed.begin(StageKind::Extract);
        failed.fail(StageKind::Extract, "timeout".into());
        failed.reset_for_resume(StageKind::Extract);
        assert_eq!(failed.stage_status(StageKind::Extract), StageStatus::NotStarted);

        let mut stuck = page(2);
        stuck.begin(StageKind::Extract);
        stuck.reset_for_resume(StageKind::Extract);
        assert_eq!(stuck.stage_status(StageKind::Extract), StageStatus::NotStarted);

        let fresh = page(3);
        assert_eq!(fresh.stage_status(StageKind::Extract), StageStatus::NotStarted);
    }

    #[test]
    fn eligible_pages_require_prerequisite_success() {
        let config = PipelineConfig::default();
        let mut run = PipelineRun::new(&config, StageKind::SEQUENCE.to_vec());
        run.seed_pages(vec![
            PathBuf::from("/d/page_001.png"),
            PathBuf::from("/d/page_002.png"),
        ]);

        // Page 1 analyzed, page 2 failed analysis.
        run.page_mut(1).unwrap().begin(StageKind::Analyze);
        run.page_mut(1).unwrap().succeed(
            StageKind::Analyze,
            StageResult::Analyzed {
                layout: PageLayout::default(),
            },
        );
        run.page_mut(2).unwrap().begin(StageKind::Analyze);
        run.page_mut(2).unwrap().fail(StageKind::Analyze, "boom".into());

        assert_eq!(run.eligible_pages(StageKind::Process), vec![1]);
    }

    #[test]
    fn stage_counts_ignore_not_started() {
        let config = PipelineConfig::default();
        let mut run = PipelineRun::new(&config, StageKind::SEQUENCE.to_vec());
        run.seed_pages((1..=3).map(|i| PathBuf::from(format!("/d/page_{i}.png"))).collect());

        run.page_mut(1).unwrap().begin(StageKind::Analyze);
        run.page_mut(1).unwrap().succeed(
            StageKind::Analyze,
            StageResult::Analyzed {
                layout: PageLayout::default(),
            },
        );
        run.page_mut(2).unwrap().begin(StageKind::Analyze);
        run.page_mut(2).unwrap().fail(StageKind::Analyze, "boom".into());

        let counts = run.stage_counts(StageKind::Analyze);
        assert_eq!(
            counts,
            StageCounts {
                attempted: 2,
                succeeded: 1,
                failed: 1
            }
        );
    }

    #[test]
    fn run_transitions() {
        let config = PipelineConfig::default();
        let mut run = PipelineRun::new(&config, StageKind::SEQUENCE.to_vec());

        run.transition(RunStatus::Retrieving).unwrap();
        run.transition(RunStatus::Analyzing).unwrap();
        // Forward jump (single-stage execution) is legal.
        run.transition(RunStatus::Interpreting).unwrap();
        // Regression is not.
        assert!(run.transition(RunStatus::Retrieving).is_err());
        // Failure is reachable from any active state.
        run.transition(RunStatus::Failed).unwrap();
        // Resume reactivates a failed run.
        run.transition(RunStatus::Extracting).unwrap();
        run.transition(RunStatus::Aggregating).unwrap();
        run.transition(RunStatus::Done).unwrap();
        // Done is final.
        assert!(run.transition(RunStatus::Failed).is_err());
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::builder()
            .output_dir(dir.path())
            .title("Round Trip")
            .build()
            .unwrap();
        let mut run = PipelineRun::new(&config, StageKind::SEQUENCE.to_vec());
        run.seed_pages(vec![PathBuf::from("/d/page_001.png")]);
        run.save().await.unwrap();

        let loaded = PipelineRun::load(dir.path()).await.unwrap();
        assert_eq!(loaded.run_id, run.run_id);
        assert_eq!(loaded.pages.len(), 1);
        assert_eq!(loaded.title, "Round Trip");
    }

    #[tokio::test]
    async fn load_missing_state_is_a_distinct_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = PipelineRun::load(dir.path()).await.unwrap_err();
        assert!(matches!(err, PipelineError::RunStateNotFound { .. }));
    }
}
