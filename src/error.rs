//! Error types for the bookpipe library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`PipelineError`] — **Fatal**: the run cannot proceed at all (output
//!   directory unwritable, prerequisite stage never ran, corrupt run state).
//!   Returned as `Err(PipelineError)` from the orchestrator entry points.
//!
//! * [`StageError`] — **Non-fatal**: one call to one stage service failed
//!   (timeout, connection refused, service error envelope). Absorbed by the
//!   batch coordinator: the page is marked Failed, an [`ErrorRecord`] is
//!   appended, and sibling pages continue.
//!
//! The separation lets callers decide their own tolerance: abort on the first
//! page failure, log and continue, or collect all errors for the run summary.

use crate::config::StageKind;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the bookpipe library.
///
/// Page-level failures use [`StageError`] and are recorded in the run's
/// error list rather than propagated here.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// No book source URL was supplied and retrieval was not skipped.
    #[error("No book URL provided.\nPass a URL or use --skip-retrieval with an existing image directory.")]
    SourceUrlMissing,

    /// Retrieval was skipped but the image directory holds no pages.
    #[error("No page images found in '{dir}'\nRun the retrieve stage first, or check the directory.")]
    NoPagesFound { dir: PathBuf },

    /// Could not create or write inside the run's output directory.
    #[error("Failed to prepare output directory '{path}': {source}")]
    OutputDirFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Run-state errors ──────────────────────────────────────────────────
    /// `--resume` or a single-stage run needs a prior run state that does not exist.
    #[error("No run state found at '{path}'\nRun the full pipeline first, or check --output-dir.")]
    RunStateNotFound { path: PathBuf },

    /// The persisted run state exists but cannot be parsed.
    #[error("Run state '{path}' is corrupt: {detail}")]
    RunStateCorrupt { path: PathBuf, detail: String },

    /// Writing the persisted run state failed.
    #[error("Failed to persist run state to '{path}': {source}")]
    StatePersistFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Stage-sequencing errors ───────────────────────────────────────────
    /// A named single-stage run was requested for a stage whose prerequisite
    /// never succeeded on one or more pages.
    #[error(
        "Cannot run {stage}: {missing} of {total} pages have no successful {prior} result.\n\
         Run {prior} first, or pass --skip-prior-validation to force."
    )]
    PrerequisiteMissing {
        stage: StageKind,
        prior: StageKind,
        missing: usize,
        total: usize,
    },

    /// The requested stage name is not part of the pipeline.
    #[error("Unknown stage '{0}' (expected: retrieve, analyze, process, extract, interpret)")]
    UnknownStage(String),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for one call to one stage service.
///
/// Produced by the stage executor and absorbed by the batch coordinator.
/// [`StageError::is_retryable`] drives the retry policy; the explicit
/// `retryable` flag from the service's error envelope wins when present.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum StageError {
    /// The call exceeded the stage's configured timeout.
    #[error("{stage} call timed out after {secs}s")]
    Timeout { stage: StageKind, secs: u64 },

    /// TCP/TLS-level failure before any HTTP response arrived.
    #[error("{stage} connection failed: {detail}")]
    Connection { stage: StageKind, detail: String },

    /// The service answered with its standard error envelope.
    #[error("{stage} service error: {summary}")]
    Service {
        stage: StageKind,
        summary: String,
        detail: Option<String>,
        /// HTTP status the envelope arrived with (0 when unknown).
        status: u16,
        /// Explicit transient/fatal flag from the envelope, when the
        /// service provided one.
        retryable: Option<bool>,
    },

    /// The response body did not match the stage's declared schema.
    #[error("{stage} returned a malformed response: {detail}")]
    MalformedResponse { stage: StageKind, detail: String },

    /// The stage's health probe reported it unable to serve requests.
    /// Short-circuits the whole stage without consuming any retry budget.
    #[error("{stage} service is unavailable: {detail}")]
    ServiceUnavailable { stage: StageKind, detail: String },
}

impl StageError {
    /// Whether the retry policy may attempt this call again.
    ///
    /// Timeouts, connection failures, and 5xx-class envelopes are transient;
    /// validation failures (4xx) and schema mismatches are not. An explicit
    /// envelope flag overrides the status-based classification.
    pub fn is_retryable(&self) -> bool {
        match self {
            StageError::Timeout { .. } | StageError::Connection { .. } => true,
            StageError::Service {
                retryable, status, ..
            } => match retryable {
                Some(flag) => *flag,
                None => *status >= 500 || *status == 0,
            },
            StageError::MalformedResponse { .. } => false,
            StageError::ServiceUnavailable { .. } => false,
        }
    }

    /// Map this error to the coarse [`ErrorKind`] recorded in the summary.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::ServiceUnavailable { .. } => ErrorKind::ServiceUnavailable,
            e if e.is_retryable() => ErrorKind::Transient,
            _ => ErrorKind::Fatal,
        }
    }

    /// The stage this error originated from.
    pub fn stage(&self) -> StageKind {
        match self {
            StageError::Timeout { stage, .. }
            | StageError::Connection { stage, .. }
            | StageError::Service { stage, .. }
            | StageError::MalformedResponse { stage, .. }
            | StageError::ServiceUnavailable { stage, .. } => *stage,
        }
    }
}

/// Coarse classification used in [`ErrorRecord`] and the run summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Retryable: timeout, connection failure, 5xx, explicit transient flag.
    Transient,
    /// Not retryable: validation failure, schema mismatch, explicit fatal flag.
    Fatal,
    /// Health probe failed; the stage was never attempted.
    ServiceUnavailable,
}

/// One entry in the run's append-only error list.
///
/// Appended by the batch coordinator when a page exhausts its retries, or by
/// the orchestrator for run-level failures (e.g. a failed health probe).
/// Never mutated after append.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub stage: StageKind,
    /// `None` for run-level errors that are not tied to a single page.
    pub page_index: Option<usize>,
    pub kind: ErrorKind,
    pub message: String,
    /// Retry count at the time of final failure (0 for non-retried errors).
    pub retries: u32,
}

impl ErrorRecord {
    /// Build a record from a final (post-retry) stage error.
    pub fn from_stage_error(err: &StageError, page_index: Option<usize>, retries: u32) -> Self {
        Self {
            stage: err.stage(),
            page_index,
            kind: err.kind(),
            message: err.to_string(),
            retries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_transient() {
        let e = StageError::Timeout {
            stage: StageKind::Extract,
            secs: 30,
        };
        assert!(e.is_retryable());
        assert_eq!(e.kind(), ErrorKind::Transient);
    }

    #[test]
    fn envelope_flag_overrides_status() {
        // 500 would normally retry, but the service said fatal.
        let e = StageError::Service {
            stage: StageKind::Analyze,
            summary: "model crashed".into(),
            detail: None,
            status: 500,
            retryable: Some(false),
        };
        assert!(!e.is_retryable());

        // 422 would normally be fatal, but the service said transient.
        let e = StageError::Service {
            stage: StageKind::Analyze,
            summary: "warming up".into(),
            detail: None,
            status: 422,
            retryable: Some(true),
        };
        assert!(e.is_retryable());
    }

    #[test]
    fn validation_error_is_fatal() {
        let e = StageError::Service {
            stage: StageKind::Process,
            summary: "layout_data missing".into(),
            detail: Some("field required".into()),
            status: 422,
            retryable: None,
        };
        assert!(!e.is_retryable());
        assert_eq!(e.kind(), ErrorKind::Fatal);
    }

    #[test]
    fn unavailable_never_retries() {
        let e = StageError::ServiceUnavailable {
            stage: StageKind::Retrieve,
            detail: "health probe returned unhealthy".into(),
        };
        assert!(!e.is_retryable());
        assert_eq!(e.kind(), ErrorKind::ServiceUnavailable);
    }

    #[test]
    fn prerequisite_missing_display() {
        let e = PipelineError::PrerequisiteMissing {
            stage: StageKind::Interpret,
            prior: StageKind::Process,
            missing: 4,
            total: 10,
        };
        let msg = e.to_string();
        assert!(msg.contains("interpret"), "got: {msg}");
        assert!(msg.contains("4 of 10"), "got: {msg}");
    }

    #[test]
    fn error_record_from_stage_error() {
        let e = StageError::Connection {
            stage: StageKind::Extract,
            detail: "connection refused".into(),
        };
        let rec = ErrorRecord::from_stage_error(&e, Some(7), 3);
        assert_eq!(rec.stage, StageKind::Extract);
        assert_eq!(rec.page_index, Some(7));
        assert_eq!(rec.kind, ErrorKind::Transient);
        assert_eq!(rec.retries, 3);
    }
}
