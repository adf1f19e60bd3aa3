//! The stage-client seam: one capability interface per stage service.
//!
//! [`StageClient`] is the only abstraction the rest of the crate sees; the
//! orchestrator, executor, and batch coordinator never name a concrete
//! service. [`HttpStageClient`] is the production implementation; tests
//! substitute scripted in-process clients to exercise orchestration logic
//! without a network.
//!
//! The client normalises every transport- and service-level failure into
//! [`StageError`] so retry classification happens in exactly one place.

use crate::config::StageKind;
use crate::error::StageError;
use crate::stage::contract::{self, ErrorEnvelope, HealthResponse, StageRequest, StageResponse};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::debug;

/// Capability interface for one external stage service.
///
/// Implementations must be cheap to share (`Send + Sync`); the batch
/// coordinator calls them concurrently from many workers.
#[async_trait]
pub trait StageClient: Send + Sync {
    /// Which stage this client serves.
    fn kind(&self) -> StageKind;

    /// Probe the service's health endpoint.
    ///
    /// Transport failures surface as [`StageError`]; the caller decides
    /// whether a degraded status is acceptable.
    async fn health(&self) -> Result<HealthResponse, StageError>;

    /// Issue one logical call. The request's kind must match [`Self::kind`].
    async fn call(&self, request: StageRequest) -> Result<StageResponse, StageError>;
}

/// HTTP implementation of [`StageClient`] over the service's JSON contract.
pub struct HttpStageClient {
    kind: StageKind,
    base_url: String,
    http: reqwest::Client,
}

impl HttpStageClient {
    /// Build a client for one stage endpoint.
    ///
    /// The reqwest client carries no request timeout of its own — the stage
    /// executor owns all deadlines so policy lives in one place.
    pub fn new(kind: StageKind, endpoint: impl Into<String>) -> Result<Self, StageError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| StageError::Connection {
                stage: kind,
                detail: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            kind,
            base_url: endpoint.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    /// Map a reqwest transport error to a [`StageError`].
    fn transport_error(&self, err: reqwest::Error) -> StageError {
        StageError::Connection {
            stage: self.kind,
            detail: err.to_string(),
        }
    }

    /// Decode a success-status body into `T`, or a malformed-response error.
    fn decode<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T, StageError> {
        serde_json::from_slice(body).map_err(|e| StageError::MalformedResponse {
            stage: self.kind,
            detail: e.to_string(),
        })
    }

    /// Turn a non-success HTTP response into a [`StageError::Service`].
    ///
    /// Prefers the standard error envelope; falls back to the raw body when
    /// the service did not (or could not) produce one.
    fn service_error(&self, status: u16, body: &[u8]) -> StageError {
        match serde_json::from_slice::<ErrorEnvelope>(body) {
            Ok(env) => StageError::Service {
                stage: self.kind,
                summary: env.error,
                detail: env.details,
                status,
                retryable: env.retryable,
            },
            Err(_) => {
                let text = String::from_utf8_lossy(body);
                let text = text.trim();
                StageError::Service {
                    stage: self.kind,
                    summary: format!("HTTP {status}"),
                    detail: (!text.is_empty()).then(|| truncate(text, 200)),
                    status,
                    retryable: None,
                }
            }
        }
    }

    /// A response with `success: false` but HTTP 200 is still a failure;
    /// some services report per-item errors this way.
    fn reported_failure(&self, what: &str) -> StageError {
        StageError::Service {
            stage: self.kind,
            summary: format!("{what} reported success=false"),
            detail: None,
            status: 200,
            retryable: None,
        }
    }
}

#[async_trait]
impl StageClient for HttpStageClient {
    fn kind(&self) -> StageKind {
        self.kind
    }

    async fn health(&self) -> Result<HealthResponse, StageError> {
        let url = format!("{}/health", self.base_url);
        debug!("Probing {}", url);

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(|e| self.transport_error(e))?;

        if !(200..300).contains(&status) {
            return Err(self.service_error(status, &body));
        }
        self.decode(&body)
    }

    async fn call(&self, request: StageRequest) -> Result<StageResponse, StageError> {
        debug_assert_eq!(request.kind(), self.kind, "request routed to wrong client");

        let url = format!("{}{}", self.base_url, contract::route(self.kind));
        debug!("POST {}", url);

        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(|e| self.transport_error(e))?;

        if !(200..300).contains(&status) {
            return Err(self.service_error(status, &body));
        }

        // Decode per stage kind; the untagged union cannot disambiguate on
        // its own because several responses share field shapes.
        match self.kind {
            StageKind::Retrieve => {
                let r: contract::RetrievalResponse = self.decode(&body)?;
                if !r.success {
                    return Err(self.reported_failure("retrieval"));
                }
                Ok(StageResponse::Retrieve(r))
            }
            StageKind::Analyze => {
                let r: contract::PageLayout = self.decode(&body)?;
                Ok(StageResponse::Analyze(r))
            }
            StageKind::Process => {
                let r: contract::ProcessingResponse = self.decode(&body)?;
                if !r.success {
                    return Err(self.reported_failure("processing"));
                }
                Ok(StageResponse::Process(r))
            }
            StageKind::Extract => {
                let r: contract::OcrResponse = self.decode(&body)?;
                if !r.success {
                    return Err(self.reported_failure("extraction"));
                }
                Ok(StageResponse::Extract(r))
            }
            StageKind::Interpret => {
                let r: contract::InterpretationResponse = self.decode(&body)?;
                if !r.success {
                    return Err(self.reported_failure("interpretation"));
                }
                Ok(StageResponse::Interpret(r))
            }
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slash_is_stripped() {
        let client = HttpStageClient::new(StageKind::Analyze, "http://localhost:8002/").unwrap();
        assert_eq!(client.base_url, "http://localhost:8002");
    }

    #[test]
    fn envelope_error_is_preferred_over_raw_body() {
        let client = HttpStageClient::new(StageKind::Extract, "http://localhost:8004").unwrap();
        let body = br#"{"error": "tesseract crashed", "service": "ocr_engine", "retryable": true}"#;
        match client.service_error(500, body) {
            StageError::Service {
                summary, retryable, ..
            } => {
                assert_eq!(summary, "tesseract crashed");
                assert_eq!(retryable, Some(true));
            }
            other => panic!("expected Service error, got {other:?}"),
        }
    }

    #[test]
    fn non_envelope_body_falls_back_to_status() {
        let client = HttpStageClient::new(StageKind::Extract, "http://localhost:8004").unwrap();
        match client.service_error(502, b"Bad Gateway") {
            StageError::Service {
                summary,
                detail,
                status,
                ..
            } => {
                assert_eq!(summary, "HTTP 502");
                assert_eq!(detail.as_deref(), Some("Bad Gateway"));
                assert_eq!(status, 502);
            }
            other => panic!("expected Service error, got {other:?}"),
        }
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "ააააააააა"; // multi-byte Georgian letters
        let t = truncate(s, 5);
        assert!(t.ends_with('…'));
    }
}
