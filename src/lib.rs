//! # bookpipe
//!
//! Orchestration engine for a five-stage book digitisation pipeline over
//! independent HTTP services: **retrieve** page images, **analyze** their
//! layout, **process** (mask and crop illustrations), **extract** text via
//! OCR, and **interpret** the illustrations with a vision model.
//!
//! The crate owns everything between the services: stage sequencing,
//! per-page fan-out with bounded concurrency, retry and timeout policy,
//! health gating, partial-failure accounting with per-stage success
//! thresholds, durable run state with resume, and deterministic aggregation
//! of whatever survived.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use bookpipe::{Orchestrator, PipelineConfig};
//!
//! # async fn example() -> Result<(), bookpipe::PipelineError> {
//! let config = PipelineConfig::builder()
//!     .book_url("https://viewer.example/book/123")
//!     .title("Georgian History, Grade 9")
//!     .output_dir("output/georgian-history")
//!     .languages(["kat", "eng"])
//!     .build()?;
//!
//! let summary = Orchestrator::new(config)?.run().await?;
//! println!(
//!     "{} pages, {} words, {} skipped",
//!     summary.page_count,
//!     summary.total_words,
//!     summary.skipped_pages.len()
//! );
//! # Ok(())
//! # }
//! ```
//!
//! ## Partial failure
//!
//! A page that fails a stage after its retries are exhausted is recorded and
//! left behind; its siblings continue. Each stage then passes or fails the
//! run against its configured minimum success fraction, and the combined
//! book text carries an explicit gap marker for every missing page. A failed
//! or interrupted run resumes from its persisted `run_state.json` without
//! redoing completed work.
//!
//! ## Feature flags
//!
//! - `cli` *(default)* — the `bookpipe` binary: clap argument parsing,
//!   indicatif progress bars, tracing subscriber setup.

pub mod aggregate;
pub mod batch;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod progress;
pub mod stage;
pub mod state;

pub use aggregate::{combined_text, gap_marker, RunSummary};
pub use batch::{CancelFlag, SharedRun, StageOutcome, StagePools};
pub use config::{
    PipelineConfig, PipelineConfigBuilder, RetrievalStrategy, StageKind, StageSpec, StageSpecs,
};
pub use error::{ErrorKind, ErrorRecord, PipelineError, StageError};
pub use orchestrator::Orchestrator;
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback};
pub use stage::client::{HttpStageClient, StageClient};
pub use stage::contract::{HealthResponse, HealthStatus};
pub use state::{PageRecord, PerStage, PipelineRun, RunStatus, StageResult, StageStatus};
