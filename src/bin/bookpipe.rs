//! CLI binary for bookpipe.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `PipelineConfig`, drives the orchestrator, and prints the run summary.

use anyhow::{Context, Result};
use bookpipe::{
    Orchestrator, PipelineConfig, PipelineProgressCallback, ProgressCallback, RetrievalStrategy,
    RunSummary, StageError, StageKind,
};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: one live bar per stage plus per-page log
/// lines. Handles pages completing out of order (concurrent fan-out).
struct CliProgressCallback {
    bar: ProgressBar,
    /// Per-page wall-clock start times for elapsed reporting.
    start_times: Mutex<HashMap<usize, Instant>>,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(spinner_style);
        bar.set_prefix("Starting");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            errors: AtomicUsize::new(0),
        })
    }

    /// Reset the bar for a new stage with a known page count.
    fn activate_stage(&self, stage: StageKind, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        self.bar.set_length(total as u64);
        self.bar.set_position(0);
        self.bar.set_style(progress_style);
        self.bar.set_prefix(capitalise(stage.as_str()));
        self.bar.reset_eta();
    }
}

/// Trim long error messages to keep the per-page log tidy.
fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max - 1;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\u{2026}", &s[..end])
}

fn capitalise(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

impl PipelineProgressCallback for CliProgressCallback {
    fn on_stage_start(&self, stage: StageKind, total_pages: usize) {
        self.activate_stage(stage, total_pages);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("{stage}: {total_pages} pages"))
        ));
    }

    fn on_page_start(&self, _stage: StageKind, page_index: usize) {
        self.start_times
            .lock()
            .unwrap()
            .insert(page_index, Instant::now());
        self.bar.set_message(format!("page {page_index}"));
    }

    fn on_page_complete(&self, _stage: StageKind, page_index: usize) {
        let elapsed_ms = self
            .start_times
            .lock()
            .unwrap()
            .remove(&page_index)
            .map(|t| t.elapsed().as_millis())
            .unwrap_or(0);
        self.bar.println(format!(
            "  {} page {:>3}  {}",
            green("✓"),
            page_index,
            dim(&format!("{:.1}s", elapsed_ms as f64 / 1000.0)),
        ));
        self.bar.inc(1);
    }

    fn on_page_error(&self, _stage: StageKind, page_index: usize, error: &StageError) {
        let elapsed_ms = self
            .start_times
            .lock()
            .unwrap()
            .remove(&page_index)
            .map(|t| t.elapsed().as_millis())
            .unwrap_or(0);
        self.errors.fetch_add(1, Ordering::SeqCst);

        let msg = truncate(&error.to_string(), 80);
        self.bar.println(format!(
            "  {} page {:>3}  {}  {}",
            red("✗"),
            page_index,
            red(&msg),
            dim(&format!("{:.1}s", elapsed_ms as f64 / 1000.0)),
        ));
        self.bar.inc(1);
    }

    fn on_stage_complete(&self, stage: StageKind, succeeded: usize, failed: usize, passed: bool) {
        if failed == 0 {
            self.bar
                .println(format!("{} {stage}: {succeeded} pages", green("✔")));
        } else {
            self.bar.println(format!(
                "{} {stage}: {succeeded} ok, {} — {}",
                if passed { cyan("⚠") } else { red("✘") },
                red(&format!("{failed} failed")),
                if passed { "within threshold" } else { "below threshold" }
            ));
        }
    }

    fn on_run_complete(&self, _succeeded: bool) {
        self.bar.finish_and_clear();
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Full pipeline for one book
  bookpipe https://viewer.example/book/123 --title "Georgian History" -o output/book123

  # Re-run only OCR after fixing the service, retrying failed pages
  bookpipe --stage extract -o output/book123

  # Resume an interrupted or partially failed run
  bookpipe --resume -o output/book123

  # Work from already-retrieved images, skip illustration descriptions
  bookpipe --skip-retrieval --skip-interpretation -o output/book123

  # Probe all five services and exit
  bookpipe --check-health

EXIT CODES:
  0  run completed, every page of every stage succeeded
  2  run completed above every threshold, but some pages failed (gaps written)
  1  a stage fell below its threshold, or a fatal error occurred

OUTPUT TREE (under --output-dir):
  images/           retrieved page images
  cleaned/          pages with illustrations masked out
  illustrations/    cropped illustrations
  text/             per-page text + book_full.txt (gap markers for missing pages)
  metadata/         summary.json, interpretations.json
  run_state.json    persisted run state (--resume / --stage read this)

ENVIRONMENT VARIABLES:
  BOOKPIPE_RETRIEVER_URL      Retrieve service   (default http://retriever:8001)
  BOOKPIPE_ANALYZER_URL       Analyze service    (default http://layout-analyzer:8002)
  BOOKPIPE_PROCESSOR_URL      Process service    (default http://image-processor:8003)
  BOOKPIPE_OCR_URL            Extract service    (default http://ocr-engine:8004)
  BOOKPIPE_INTERPRETER_URL    Interpret service  (default http://illustration-interpreter:8005)
  RUST_LOG                    Tracing filter (overrides -v / -q)
"#;

/// Orchestrate a book digitisation pipeline across its stage services.
#[derive(Parser, Debug)]
#[command(
    name = "bookpipe",
    version,
    about = "Run a five-stage book digitisation pipeline over HTTP stage services",
    long_about = "Drive a book through retrieve → analyze → process → extract → interpret, \
with bounded per-page concurrency, retries, health gating, durable run state, and \
deterministic aggregation of partial results.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Book viewer URL (omit with --skip-retrieval, --resume, or --stage).
    book_url: Option<String>,

    /// Root directory for the run's artifacts and state.
    #[arg(short, long, env = "BOOKPIPE_OUTPUT", default_value = "output")]
    output_dir: PathBuf,

    /// Human-readable book title (feeds the interpretation context).
    #[arg(short, long, default_value = "untitled_book")]
    title: String,

    /// Run exactly one stage against the existing run state.
    #[arg(long, value_name = "STAGE", conflicts_with = "resume")]
    stage: Option<String>,

    /// With --stage: dispatch eligible pages even when some lack the
    /// prerequisite stage's result.
    #[arg(long, requires = "stage")]
    skip_prior_validation: bool,

    /// Continue a persisted run, retrying failed pages only.
    #[arg(long)]
    resume: bool,

    /// Seed pages from output_dir/images instead of calling the retriever.
    #[arg(long)]
    skip_retrieval: bool,

    /// Skip the interpret stage entirely.
    #[arg(long)]
    skip_interpretation: bool,

    /// Retrieval strategy: intercept, screenshot, download.
    #[arg(long, env = "BOOKPIPE_STRATEGY", value_enum, default_value = "intercept")]
    strategy: StrategyArg,

    /// Cap on retrieved pages.
    #[arg(long)]
    max_pages: Option<usize>,

    /// OCR language codes, priority order.
    #[arg(long, value_delimiter = ',', default_values_t = ["kat".to_string(), "eng".to_string()])]
    languages: Vec<String>,

    /// Layout-detection confidence threshold (0.0–1.0).
    #[arg(long, default_value_t = 0.5)]
    layout_confidence: f64,

    /// OCR per-word confidence threshold (0–100).
    #[arg(long, default_value_t = 60.0)]
    ocr_confidence: f64,

    /// Worker-pool width applied to every stage.
    #[arg(short, long, env = "BOOKPIPE_CONCURRENCY", default_value_t = 8)]
    concurrency: usize,

    /// Retries per call after the first attempt, applied to every stage.
    #[arg(long, env = "BOOKPIPE_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Per-call timeout in seconds, applied to every stage.
    #[arg(long, env = "BOOKPIPE_TIMEOUT", default_value_t = 300)]
    timeout: u64,

    /// Retrieve service URL.
    #[arg(long, env = "BOOKPIPE_RETRIEVER_URL")]
    retriever_url: Option<String>,

    /// Analyze (layout) service URL.
    #[arg(long, env = "BOOKPIPE_ANALYZER_URL")]
    analyzer_url: Option<String>,

    /// Process (image) service URL.
    #[arg(long, env = "BOOKPIPE_PROCESSOR_URL")]
    processor_url: Option<String>,

    /// Extract (OCR) service URL.
    #[arg(long, env = "BOOKPIPE_OCR_URL")]
    ocr_url: Option<String>,

    /// Interpret service URL.
    #[arg(long, env = "BOOKPIPE_INTERPRETER_URL")]
    interpreter_url: Option<String>,

    /// Probe every stage service and exit.
    #[arg(long)]
    check_health: bool,

    /// Print the run summary as JSON.
    #[arg(long)]
    json: bool,

    /// Disable the progress bar.
    #[arg(long)]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long)]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long)]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum StrategyArg {
    Intercept,
    Screenshot,
    Download,
}

impl From<StrategyArg> for RetrievalStrategy {
    fn from(v: StrategyArg) -> Self {
        match v {
            StrategyArg::Intercept => RetrievalStrategy::Intercept,
            StrategyArg::Screenshot => RetrievalStrategy::Screenshot,
            StrategyArg::Download => RetrievalStrategy::Download,
        }
    }
}

fn build_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder()
        .title(cli.title.clone())
        .output_dir(&cli.output_dir)
        .strategy(cli.strategy.clone().into())
        .languages(cli.languages.clone())
        .layout_confidence(cli.layout_confidence)
        .ocr_confidence(cli.ocr_confidence)
        .skip_retrieval(cli.skip_retrieval)
        .skip_interpretation(cli.skip_interpretation)
        .concurrency_all(cli.concurrency);

    if let Some(ref url) = cli.book_url {
        builder = builder.book_url(url.clone());
    }
    if let Some(n) = cli.max_pages {
        builder = builder.max_pages(n);
    }
    for kind in StageKind::SEQUENCE {
        builder = builder
            .max_retries(kind, cli.max_retries)
            .timeout_secs(kind, cli.timeout);
    }
    let overrides = [
        (StageKind::Retrieve, &cli.retriever_url),
        (StageKind::Analyze, &cli.analyzer_url),
        (StageKind::Process, &cli.processor_url),
        (StageKind::Extract, &cli.ocr_url),
        (StageKind::Interpret, &cli.interpreter_url),
    ];
    for (kind, url) in overrides {
        if let Some(url) = url {
            builder = builder.endpoint(kind, url.clone());
        }
    }

    builder.build().context("Invalid configuration")
}

fn print_summary(cli: &Cli, summary: &RunSummary) -> Result<()> {
    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(summary).context("Failed to serialise summary")?
        );
        return Ok(());
    }
    if cli.quiet {
        return Ok(());
    }

    let ok = summary.succeeded();
    eprintln!(
        "{}  {}  {} pages, {} words, {} skipped  →  {}",
        if ok { green("✔") } else { red("✘") },
        bold(&summary.title),
        summary.page_count,
        summary.total_words,
        summary.skipped_pages.len(),
        bold(&cli.output_dir.display().to_string()),
    );
    if !summary.skipped_pages.is_empty() {
        let list: Vec<String> = summary.skipped_pages.iter().map(|i| i.to_string()).collect();
        eprintln!("   {} missing pages: {}", cyan("⚠"), list.join(", "));
    }
    for err in &summary.errors {
        let page = err
            .page_index
            .map(|i| format!("page {i}"))
            .unwrap_or_else(|| "run".into());
        eprintln!(
            "   {} {} {}: {} {}",
            red("✗"),
            err.stage,
            page,
            err.message,
            dim(&format!("({} retries)", err.retries)),
        );
    }
    Ok(())
}

async fn check_health(orchestrator: &Orchestrator) -> i32 {
    let mut all_healthy = true;
    for (stage, result) in orchestrator.check_health().await {
        match result {
            Ok(health) => eprintln!(
                "{} {:<10} {} {}",
                green("✔"),
                stage.to_string(),
                health.service_name,
                dim(&health.version.unwrap_or_default()),
            ),
            Err(e) => {
                all_healthy = false;
                eprintln!("{} {:<10} {}", red("✘"), stage.to_string(), red(&e.to_string()));
            }
        }
    }
    if all_healthy {
        0
    } else {
        1
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Suppress INFO-level library logs while the progress bar is active; the
    // bar is the feedback channel then.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json && !cli.check_health;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let config = build_config(&cli)?;
    let mut orchestrator = Orchestrator::new(config).context("Failed to build orchestrator")?;

    if cli.check_health {
        std::process::exit(check_health(&orchestrator).await);
    }

    if show_progress {
        let cb = CliProgressCallback::new();
        orchestrator = orchestrator.with_progress(cb as ProgressCallback);
    }

    // Ctrl-C cancels cooperatively: in-flight calls finish, the run state is
    // persisted, and --resume picks up the rest.
    let cancel = orchestrator.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}", dim("interrupt received; finishing in-flight pages…"));
            cancel.cancel();
        }
    });

    let summary = if let Some(ref stage_name) = cli.stage {
        let stage: StageKind = stage_name.parse()?;
        orchestrator
            .run_single_stage(stage, cli.skip_prior_validation)
            .await?
    } else if cli.resume {
        orchestrator.resume().await?
    } else {
        orchestrator.run().await?
    };

    print_summary(&cli, &summary)?;
    // 0 clean, 2 partial success (above thresholds, some pages lost),
    // 1 a stage below threshold. Partial success is judged from the final
    // page state, so a run fully repaired by --resume exits 0 even though
    // the earlier errors stay on the record.
    if !summary.succeeded() {
        std::process::exit(1);
    }
    if summary.lost_pages() {
        std::process::exit(2);
    }
    Ok(())
}
