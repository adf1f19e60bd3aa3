//! Configuration types for a pipeline run.
//!
//! All orchestration behaviour is controlled through [`PipelineConfig`],
//! built via its [`PipelineConfigBuilder`]. Keeping every knob in one struct
//! makes it trivial to share configs across tasks, serialise them for
//! logging, and diff two runs to understand why their outcomes differ.
//!
//! The per-stage policy lives in [`StageSpec`]: endpoint, timeout, retry
//! budget, backoff shape, worker-pool width, and the minimum success
//! fraction a stage must reach to count as passed. Specs are resolved once
//! when a run starts and stay immutable for the run's lifetime, so a stage
//! can never observe a half-updated policy.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// The five pipeline stages, in canonical execution order.
///
/// Each stage is implemented by an independent external service; the
/// orchestrator depends only on the stage's wire contract, never on what the
/// service does internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Fetch page images for a book source (one run-level call).
    Retrieve,
    /// Detect text blocks, illustrations, captions, titles, and tables.
    Analyze,
    /// Mask illustrations out of each page and crop them to separate files.
    Process,
    /// OCR the cleaned page image.
    Extract,
    /// Describe each extracted illustration with a vision model.
    Interpret,
}

impl StageKind {
    /// All stages in canonical order.
    pub const SEQUENCE: [StageKind; 5] = [
        StageKind::Retrieve,
        StageKind::Analyze,
        StageKind::Process,
        StageKind::Extract,
        StageKind::Interpret,
    ];

    /// The stage whose per-page output this stage consumes, if any.
    ///
    /// Interpret reads the illustrations cropped by Process, not the OCR
    /// text, so its prerequisite is Process rather than Extract.
    pub fn prerequisite(self) -> Option<StageKind> {
        match self {
            StageKind::Retrieve => None,
            StageKind::Analyze => Some(StageKind::Retrieve),
            StageKind::Process => Some(StageKind::Analyze),
            StageKind::Extract => Some(StageKind::Process),
            StageKind::Interpret => Some(StageKind::Process),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Retrieve => "retrieve",
            StageKind::Analyze => "analyze",
            StageKind::Process => "process",
            StageKind::Extract => "extract",
            StageKind::Interpret => "interpret",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "retrieve" => Ok(StageKind::Retrieve),
            "analyze" => Ok(StageKind::Analyze),
            "process" => Ok(StageKind::Process),
            "extract" | "ocr" => Ok(StageKind::Extract),
            "interpret" => Ok(StageKind::Interpret),
            other => Err(PipelineError::UnknownStage(other.to_string())),
        }
    }
}

/// How the retrieve service should fetch page images.
///
/// Passed through verbatim; the strategies themselves live in the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalStrategy {
    /// Intercept image responses while the viewer loads (default).
    #[default]
    Intercept,
    /// Screenshot each rendered page.
    Screenshot,
    /// Download image URLs directly.
    Download,
}

impl RetrievalStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            RetrievalStrategy::Intercept => "intercept",
            RetrievalStrategy::Screenshot => "screenshot",
            RetrievalStrategy::Download => "download",
        }
    }
}

/// Static per-stage policy, immutable for the lifetime of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSpec {
    /// Base URL of the stage service, e.g. `http://ocr-engine:8004`.
    pub endpoint: String,

    /// Per-attempt timeout in seconds. Default: 300.
    ///
    /// Generous because a single call may cover an expensive model inference;
    /// the retriever in particular drives a headless browser on the far side.
    pub timeout_secs: u64,

    /// Maximum retry attempts after the first call. Default: 3.
    ///
    /// A stage that always fails transiently is attempted exactly
    /// `max_retries + 1` times per page, then recorded as Failed.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds (exponential backoff). Default: 500.
    ///
    /// Doubles after each attempt: 500 ms → 1 s → 2 s, capped at
    /// [`StageSpec::max_backoff_ms`], with jitter added so N concurrent
    /// workers do not retry in lockstep against a recovering service.
    pub backoff_ms: u64,

    /// Upper bound on a single backoff delay in milliseconds. Default: 8000.
    pub max_backoff_ms: u64,

    /// Fraction of pages (0.0–1.0) that must succeed for the stage to pass.
    ///
    /// 1.0 for stages whose output every downstream page needs; lower for
    /// best-effort stages. Interpret defaults to 0.0: a book with no usable
    /// illustration descriptions is still a valid text extraction.
    pub min_success_fraction: f64,

    /// Worker-pool width for this stage kind. Default: 8.
    ///
    /// Shared across concurrent runs via a per-stage counting semaphore, so
    /// one slow stage cannot starve the others of capacity.
    pub concurrency: usize,
}

impl StageSpec {
    fn new(endpoint: &str, min_success_fraction: f64) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            timeout_secs: 300,
            max_retries: 3,
            backoff_ms: 500,
            max_backoff_ms: 8_000,
            min_success_fraction,
            concurrency: 8,
        }
    }
}

/// The full stage-spec registry, one spec per stage kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSpecs {
    pub retrieve: StageSpec,
    pub analyze: StageSpec,
    pub process: StageSpec,
    pub extract: StageSpec,
    pub interpret: StageSpec,
}

impl Default for StageSpecs {
    fn default() -> Self {
        Self {
            retrieve: StageSpec::new("http://retriever:8001", 1.0),
            analyze: StageSpec::new("http://layout-analyzer:8002", 1.0),
            process: StageSpec::new("http://image-processor:8003", 1.0),
            extract: StageSpec::new("http://ocr-engine:8004", 1.0),
            interpret: StageSpec::new("http://illustration-interpreter:8005", 0.0),
        }
    }
}

impl StageSpecs {
    pub fn get(&self, kind: StageKind) -> &StageSpec {
        match kind {
            StageKind::Retrieve => &self.retrieve,
            StageKind::Analyze => &self.analyze,
            StageKind::Process => &self.process,
            StageKind::Extract => &self.extract,
            StageKind::Interpret => &self.interpret,
        }
    }

    pub fn get_mut(&mut self, kind: StageKind) -> &mut StageSpec {
        match kind {
            StageKind::Retrieve => &mut self.retrieve,
            StageKind::Analyze => &mut self.analyze,
            StageKind::Process => &mut self.process,
            StageKind::Extract => &mut self.extract,
            StageKind::Interpret => &mut self.interpret,
        }
    }
}

/// Configuration for one pipeline run.
///
/// Built via [`PipelineConfig::builder()`] or [`PipelineConfig::default()`].
///
/// # Example
/// ```rust
/// use bookpipe::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .title("Georgian History")
///     .output_dir("output/georgian-history")
///     .languages(["kat", "eng"])
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Book viewer URL handed to the retrieve service. Optional when
    /// retrieval is skipped and pages are seeded from `output_dir/images`.
    pub book_url: Option<String>,

    /// Human-readable book title; also feeds the interpretation context.
    pub title: String,

    /// Root of the run's artifact tree: `images/`, `cleaned/`, `text/`,
    /// `illustrations/`, `metadata/`, and `run_state.json`.
    pub output_dir: PathBuf,

    /// Per-stage endpoints and policy.
    pub specs: StageSpecs,

    /// Retrieval strategy passed to the retrieve service.
    pub strategy: RetrievalStrategy,

    /// Cap on retrieved pages; `None` retrieves the whole book.
    pub max_pages: Option<usize>,

    /// OCR language codes in priority order. Default: `["kat", "eng"]`.
    pub languages: Vec<String>,

    /// Layout-detection confidence threshold (0.0–1.0). Default: 0.5.
    pub layout_confidence: f64,

    /// OCR per-word confidence threshold (0–100). Default: 60.0.
    pub ocr_confidence: f64,

    /// Skip retrieval and seed pages from an existing `output_dir/images`.
    pub skip_retrieval: bool,

    /// Skip the interpret stage entirely (pages pass trivially).
    pub skip_interpretation: bool,

    /// Health-probe timeout in seconds. Default: 5.
    ///
    /// Deliberately much shorter than the call timeout: a probe that cannot
    /// answer within seconds means the stage should fail fast, not burn a
    /// page's entire timeout budget discovering that.
    pub health_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            book_url: None,
            title: "untitled_book".to_string(),
            output_dir: PathBuf::from("output"),
            specs: StageSpecs::default(),
            strategy: RetrievalStrategy::default(),
            max_pages: None,
            languages: vec!["kat".to_string(), "eng".to_string()],
            layout_confidence: 0.5,
            ocr_confidence: 60.0,
            skip_retrieval: false,
            skip_interpretation: false,
            health_timeout_secs: 5,
        }
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Context string given to the interpret service alongside each image.
    pub fn interpret_context(&self) -> String {
        format!("Educational textbook: {}", self.title)
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn book_url(mut self, url: impl Into<String>) -> Self {
        self.config.book_url = Some(url.into());
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.config.title = title.into();
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = dir.into();
        self
    }

    pub fn endpoint(mut self, stage: StageKind, url: impl Into<String>) -> Self {
        self.config.specs.get_mut(stage).endpoint = url.into();
        self
    }

    pub fn timeout_secs(mut self, stage: StageKind, secs: u64) -> Self {
        self.config.specs.get_mut(stage).timeout_secs = secs.max(1);
        self
    }

    pub fn max_retries(mut self, stage: StageKind, n: u32) -> Self {
        self.config.specs.get_mut(stage).max_retries = n;
        self
    }

    pub fn backoff_ms(mut self, stage: StageKind, ms: u64) -> Self {
        self.config.specs.get_mut(stage).backoff_ms = ms.max(1);
        self
    }

    pub fn min_success_fraction(mut self, stage: StageKind, f: f64) -> Self {
        self.config.specs.get_mut(stage).min_success_fraction = f.clamp(0.0, 1.0);
        self
    }

    pub fn concurrency(mut self, stage: StageKind, n: usize) -> Self {
        self.config.specs.get_mut(stage).concurrency = n.max(1);
        self
    }

    /// Apply the same worker-pool width to every stage.
    pub fn concurrency_all(mut self, n: usize) -> Self {
        for kind in StageKind::SEQUENCE {
            self.config.specs.get_mut(kind).concurrency = n.max(1);
        }
        self
    }

    pub fn strategy(mut self, strategy: RetrievalStrategy) -> Self {
        self.config.strategy = strategy;
        self
    }

    pub fn max_pages(mut self, n: usize) -> Self {
        self.config.max_pages = Some(n);
        self
    }

    pub fn languages<I, S>(mut self, langs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.languages = langs.into_iter().map(Into::into).collect();
        self
    }

    pub fn layout_confidence(mut self, t: f64) -> Self {
        self.config.layout_confidence = t.clamp(0.0, 1.0);
        self
    }

    pub fn ocr_confidence(mut self, t: f64) -> Self {
        self.config.ocr_confidence = t.clamp(0.0, 100.0);
        self
    }

    pub fn skip_retrieval(mut self, v: bool) -> Self {
        self.config.skip_retrieval = v;
        self
    }

    pub fn skip_interpretation(mut self, v: bool) -> Self {
        self.config.skip_interpretation = v;
        self
    }

    pub fn health_timeout_secs(mut self, secs: u64) -> Self {
        self.config.health_timeout_secs = secs.max(1);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        for kind in StageKind::SEQUENCE {
            let spec = c.specs.get(kind);
            if spec.endpoint.is_empty() {
                return Err(PipelineError::InvalidConfig(format!(
                    "{kind} endpoint must not be empty"
                )));
            }
            if !(0.0..=1.0).contains(&spec.min_success_fraction) {
                return Err(PipelineError::InvalidConfig(format!(
                    "{kind} min_success_fraction must be 0.0–1.0, got {}",
                    spec.min_success_fraction
                )));
            }
            if spec.concurrency == 0 {
                return Err(PipelineError::InvalidConfig(format!(
                    "{kind} concurrency must be ≥ 1"
                )));
            }
            if spec.max_backoff_ms < spec.backoff_ms {
                return Err(PipelineError::InvalidConfig(format!(
                    "{kind} max_backoff_ms ({}) is below backoff_ms ({})",
                    spec.max_backoff_ms, spec.backoff_ms
                )));
            }
        }
        if c.languages.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "At least one OCR language is required".into(),
            ));
        }
        Ok(self.config)
    }
}
