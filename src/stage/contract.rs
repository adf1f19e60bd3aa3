//! Wire schemas shared by every stage service.
//!
//! Field names follow the services' published JSON contracts verbatim, so a
//! conforming service written in any language interoperates without an
//! adapter layer. The orchestrator never interprets stage payloads beyond
//! these schemas — what a "text block" or "interpretation" means internally
//! is entirely the service's business.
//!
//! Every service exposes the same surface:
//! * `GET /health` → [`HealthResponse`]
//! * one POST route per stage (see [`route`]) taking the stage's request
//!   type and returning its response type, or an [`ErrorEnvelope`] on error.

use crate::config::StageKind;
use serde::{Deserialize, Serialize};

/// Resolve the POST route for a stage's single-item call.
pub fn route(kind: StageKind) -> &'static str {
    match kind {
        StageKind::Retrieve => "/retrieve",
        StageKind::Analyze => "/analyze",
        StageKind::Process => "/process",
        StageKind::Extract => "/extract",
        StageKind::Interpret => "/interpret",
    }
}

// ── Health probe ─────────────────────────────────────────────────────────

/// Service health as reported by the probe endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Serving requests with reduced capability (e.g. fallback model).
    Degraded,
    Unhealthy,
}

/// Standard health check response for all services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub service_name: String,
    #[serde(default)]
    pub version: Option<String>,
    pub status: HealthStatus,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}

// ── Error envelope ───────────────────────────────────────────────────────

/// Standard error response for all services.
///
/// `retryable`, when present, overrides the orchestrator's status-based
/// transient/fatal classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// One-line error summary.
    pub error: String,
    #[serde(default)]
    pub details: Option<String>,
    /// Name of the originating service.
    pub service: String,
    #[serde(default)]
    pub retryable: Option<bool>,
}

// ── Shared geometry ──────────────────────────────────────────────────────

/// A labeled, confidence-scored bounding box from layout analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
    pub label: String,
    pub confidence: f64,
}

// ── Retrieve ─────────────────────────────────────────────────────────────

/// Request to retrieve page images for a book source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalRequest {
    pub url: String,
    /// `intercept`, `screenshot`, or `download`.
    pub strategy: String,
    #[serde(default)]
    pub max_pages: Option<usize>,
    pub output_dir: String,
}

/// Ordered list of retrieved page-image paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResponse {
    pub success: bool,
    pub image_count: usize,
    pub image_paths: Vec<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

// ── Analyze ──────────────────────────────────────────────────────────────

/// Request to analyze one page's layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutRequest {
    pub image_path: String,
    pub confidence_threshold: f64,
}

/// Layout analysis result for a single page.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageLayout {
    pub page_path: String,
    #[serde(default)]
    pub text_blocks: Vec<Region>,
    #[serde(default)]
    pub illustrations: Vec<Region>,
    #[serde(default)]
    pub captions: Vec<Region>,
    #[serde(default)]
    pub titles: Vec<Region>,
    #[serde(default)]
    pub tables: Vec<Region>,
    #[serde(default)]
    pub other: Vec<Region>,
}

// ── Process ──────────────────────────────────────────────────────────────

/// Request to mask illustrations out of one page image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingRequest {
    pub image_path: String,
    pub layout_data: PageLayout,
    pub output_cleaned_path: String,
    #[serde(default)]
    pub output_illustrations_dir: Option<String>,
}

/// Masked page plus the illustrations cropped out of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingResponse {
    pub success: bool,
    pub original_path: String,
    pub cleaned_path: String,
    #[serde(default)]
    pub illustration_paths: Vec<String>,
}

// ── Extract ──────────────────────────────────────────────────────────────

/// Request to OCR one cleaned page image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrRequest {
    pub image_path: String,
    pub languages: Vec<String>,
    pub confidence_threshold: f64,
}

/// OCR result for a single page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrResponse {
    pub success: bool,
    pub page_path: String,
    pub text: String,
    pub confidence: f64,
    pub word_count: usize,
    pub char_count: usize,
    #[serde(default)]
    pub line_data: Vec<serde_json::Value>,
}

// ── Interpret ────────────────────────────────────────────────────────────

/// Request to describe one illustration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterpretationRequest {
    pub image_path: String,
    #[serde(default)]
    pub context: Option<String>,
}

/// Vision-model description of one illustration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterpretationResponse {
    pub success: bool,
    pub image_path: String,
    pub caption: String,
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub educational_value: String,
    #[serde(default)]
    pub related_concepts: Vec<String>,
}

// ── Typed request/response unions ────────────────────────────────────────

/// A request to any stage, tagged by kind so the executor can retry a call
/// without knowing which stage it belongs to.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum StageRequest {
    Retrieve(RetrievalRequest),
    Analyze(LayoutRequest),
    Process(ProcessingRequest),
    Extract(OcrRequest),
    Interpret(InterpretationRequest),
}

impl StageRequest {
    pub fn kind(&self) -> StageKind {
        match self {
            StageRequest::Retrieve(_) => StageKind::Retrieve,
            StageRequest::Analyze(_) => StageKind::Analyze,
            StageRequest::Process(_) => StageKind::Process,
            StageRequest::Extract(_) => StageKind::Extract,
            StageRequest::Interpret(_) => StageKind::Interpret,
        }
    }
}

/// A successful response from any stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StageResponse {
    Retrieve(RetrievalResponse),
    Analyze(PageLayout),
    Process(ProcessingResponse),
    Extract(OcrResponse),
    Interpret(InterpretationResponse),
}

impl StageResponse {
    pub fn as_retrieval(&self) -> Option<&RetrievalResponse> {
        match self {
            StageResponse::Retrieve(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_layout(&self) -> Option<&PageLayout> {
        match self {
            StageResponse::Analyze(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_processing(&self) -> Option<&ProcessingResponse> {
        match self {
            StageResponse::Process(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_ocr(&self) -> Option<&OcrResponse> {
        match self {
            StageResponse::Extract(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_interpretation(&self) -> Option<&InterpretationResponse> {
        match self {
            StageResponse::Interpret(r) => Some(r),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_are_distinct() {
        let mut routes: Vec<&str> = StageKind::SEQUENCE.iter().map(|&k| route(k)).collect();
        routes.sort_unstable();
        routes.dedup();
        assert_eq!(routes.len(), 5);
    }

    #[test]
    fn health_response_parses_minimal_payload() {
        let json = r#"{"service_name": "ocr_engine", "status": "healthy"}"#;
        let health: HealthResponse = serde_json::from_str(json).unwrap();
        assert_eq!(health.status, HealthStatus::Healthy);
        assert!(health.version.is_none());
    }

    #[test]
    fn error_envelope_retryable_flag_is_optional() {
        let json = r#"{"error": "model OOM", "service": "layout_analyzer"}"#;
        let env: ErrorEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(env.retryable, None);

        let json = r#"{"error": "warming up", "service": "ocr_engine", "retryable": true}"#;
        let env: ErrorEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(env.retryable, Some(true));
    }

    #[test]
    fn page_layout_defaults_empty_region_lists() {
        let json = r#"{"page_path": "/data/images/page_001.png"}"#;
        let layout: PageLayout = serde_json::from_str(json).unwrap();
        assert!(layout.illustrations.is_empty());
        assert!(layout.text_blocks.is_empty());
    }

    #[test]
    fn request_kind_matches_variant() {
        let req = StageRequest::Extract(OcrRequest {
            image_path: "/data/cleaned/page_001.png".into(),
            languages: vec!["kat".into(), "eng".into()],
            confidence_threshold: 60.0,
        });
        assert_eq!(req.kind(), StageKind::Extract);
    }
}
