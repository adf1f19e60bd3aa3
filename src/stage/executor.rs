//! The stage executor: the only place that talks to the network.
//!
//! Wraps one [`StageClient`] call with the stage's timeout, retry, and
//! health-gating policy. Everything above this layer (batch coordinator,
//! orchestrator) reasons about outcomes; everything below it (client) is a
//! single attempt with no policy at all.
//!
//! ## Retry strategy
//!
//! Transient failures are frequent under concurrent load against model
//! services. Exponential backoff (`backoff_ms * 2^(attempt-1)`, capped at
//! `max_backoff_ms`) with random jitter avoids thundering-herd: with a
//! 500 ms base and 3 retries the wait sequence is ~0.5 s → 1 s → 2 s per
//! page. Fatal errors (validation failures, explicit fatal flag) never
//! consume the retry budget.

use crate::config::StageSpec;
use crate::error::StageError;
use crate::stage::client::StageClient;
use crate::stage::contract::{HealthResponse, HealthStatus, StageRequest, StageResponse};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// A call that failed for good: the final error plus how many retries were
/// spent reaching it. Feeds directly into an
/// [`ErrorRecord`](crate::error::ErrorRecord).
#[derive(Debug, Clone)]
pub struct ExhaustedCall {
    pub error: StageError,
    pub retries: u32,
}

/// Executes calls against one stage service under that stage's policy.
#[derive(Clone)]
pub struct StageExecutor {
    client: Arc<dyn StageClient>,
    spec: StageSpec,
    health_timeout: Duration,
}

impl StageExecutor {
    pub fn new(client: Arc<dyn StageClient>, spec: StageSpec, health_timeout_secs: u64) -> Self {
        Self {
            client,
            spec,
            health_timeout: Duration::from_secs(health_timeout_secs),
        }
    }

    /// Probe the service once before the stage's first real call.
    ///
    /// An unreachable, timed-out, or self-reported `unhealthy` service
    /// short-circuits the whole stage as `ServiceUnavailable` without
    /// consuming any page's retry budget. `degraded` passes with a warning:
    /// the service asked for reduced expectations, not zero traffic.
    pub async fn probe(&self) -> Result<HealthResponse, StageError> {
        let stage = self.client.kind();
        let probed = timeout(self.health_timeout, self.client.health()).await;

        let health = match probed {
            Ok(Ok(health)) => health,
            Ok(Err(e)) => {
                return Err(StageError::ServiceUnavailable {
                    stage,
                    detail: format!("health probe failed: {e}"),
                })
            }
            Err(_) => {
                return Err(StageError::ServiceUnavailable {
                    stage,
                    detail: format!(
                        "health probe timed out after {}s",
                        self.health_timeout.as_secs()
                    ),
                })
            }
        };

        match health.status {
            HealthStatus::Healthy => Ok(health),
            HealthStatus::Degraded => {
                warn!("{stage} service reports degraded: proceeding");
                Ok(health)
            }
            HealthStatus::Unhealthy => Err(StageError::ServiceUnavailable {
                stage,
                detail: format!("{} reports unhealthy", health.service_name),
            }),
        }
    }

    /// Execute one logical call with timeout and retry.
    ///
    /// Retried calls must be safe to repeat; the stage contracts guarantee
    /// idempotence for image and text operations, so the executor never
    /// deduplicates.
    pub async fn execute(&self, request: StageRequest) -> Result<StageResponse, ExhaustedCall> {
        let stage = self.client.kind();
        let call_timeout = Duration::from_secs(self.spec.timeout_secs);
        let mut last_err: Option<StageError> = None;

        for attempt in 0..=self.spec.max_retries {
            if attempt > 0 {
                let delay = self.backoff_delay(attempt);
                warn!(
                    "{stage}: retry {attempt}/{} after {}ms",
                    self.spec.max_retries,
                    delay.as_millis()
                );
                sleep(delay).await;
            }

            let start = Instant::now();
            let outcome = timeout(call_timeout, self.client.call(request.clone())).await;

            match outcome {
                Ok(Ok(response)) => {
                    debug!("{stage}: call succeeded in {:?}", start.elapsed());
                    return Ok(response);
                }
                Ok(Err(e)) => {
                    warn!("{stage}: attempt {} failed — {e}", attempt + 1);
                    if !e.is_retryable() {
                        return Err(ExhaustedCall {
                            error: e,
                            retries: attempt,
                        });
                    }
                    last_err = Some(e);
                }
                Err(_elapsed) => {
                    let e = StageError::Timeout {
                        stage,
                        secs: self.spec.timeout_secs,
                    };
                    warn!("{stage}: attempt {} timed out", attempt + 1);
                    last_err = Some(e);
                }
            }
        }

        // Retry budget exhausted; last_err is always set because the loop
        // body ran at least once and every arm either returned or stored it.
        let error = last_err.unwrap_or_else(|| StageError::Connection {
            stage,
            detail: "no attempt was made".into(),
        });
        Err(ExhaustedCall {
            error,
            retries: self.spec.max_retries,
        })
    }

    /// Exponential backoff capped at `max_backoff_ms`, plus up to 25% jitter.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .spec
            .backoff_ms
            .saturating_mul(2u64.saturating_pow(attempt - 1))
            .min(self.spec.max_backoff_ms);
        let jitter = rand::random::<u64>() % (exp / 4 + 1);
        Duration::from_millis(exp + jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{StageKind, StageSpecs};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Client that fails transiently `failures` times, then succeeds.
    struct FlakyClient {
        calls: AtomicU32,
        failures: u32,
    }

    #[async_trait]
    impl StageClient for FlakyClient {
        fn kind(&self) -> StageKind {
            StageKind::Extract
        }

        async fn health(&self) -> Result<HealthResponse, StageError> {
            Ok(HealthResponse {
                service_name: "ocr_engine".into(),
                version: None,
                status: HealthStatus::Healthy,
                details: None,
            })
        }

        async fn call(&self, _request: StageRequest) -> Result<StageResponse, StageError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(StageError::Connection {
                    stage: StageKind::Extract,
                    detail: "connection refused".into(),
                })
            } else {
                Ok(StageResponse::Extract(crate::stage::contract::OcrResponse {
                    success: true,
                    page_path: "/data/cleaned/page_001.png".into(),
                    text: "გამარჯობა".into(),
                    confidence: 91.0,
                    word_count: 1,
                    char_count: 9,
                    line_data: vec![],
                }))
            }
        }
    }

    fn fast_spec() -> StageSpec {
        let mut spec = StageSpecs::default().extract;
        spec.backoff_ms = 1;
        spec.max_backoff_ms = 2;
        spec.timeout_secs = 5;
        spec
    }

    fn ocr_request() -> StageRequest {
        StageRequest::Extract(crate::stage::contract::OcrRequest {
            image_path: "/data/cleaned/page_001.png".into(),
            languages: vec!["kat".into()],
            confidence_threshold: 60.0,
        })
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let client = Arc::new(FlakyClient {
            calls: AtomicU32::new(0),
            failures: 2,
        });
        let exec = StageExecutor::new(client.clone(), fast_spec(), 5);

        let response = exec.execute(ocr_request()).await.expect("should recover");
        assert!(response.as_ocr().is_some());
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn always_transient_is_attempted_max_retries_plus_one_times() {
        let client = Arc::new(FlakyClient {
            calls: AtomicU32::new(0),
            failures: u32::MAX,
        });
        let mut spec = fast_spec();
        spec.max_retries = 3;
        let exec = StageExecutor::new(client.clone(), spec, 5);

        let failed = exec.execute(ocr_request()).await.unwrap_err();
        assert_eq!(client.calls.load(Ordering::SeqCst), 4);
        assert_eq!(failed.retries, 3);
        assert!(failed.error.is_retryable());
    }

    #[tokio::test]
    async fn fatal_error_fails_immediately() {
        struct FatalClient;

        #[async_trait]
        impl StageClient for FatalClient {
            fn kind(&self) -> StageKind {
                StageKind::Analyze
            }
            async fn health(&self) -> Result<HealthResponse, StageError> {
                unreachable!("not probed in this test")
            }
            async fn call(&self, _request: StageRequest) -> Result<StageResponse, StageError> {
                Err(StageError::Service {
                    stage: StageKind::Analyze,
                    summary: "image_path does not exist".into(),
                    detail: None,
                    status: 422,
                    retryable: None,
                })
            }
        }

        let exec = StageExecutor::new(Arc::new(FatalClient), fast_spec(), 5);
        let failed = exec
            .execute(StageRequest::Analyze(crate::stage::contract::LayoutRequest {
                image_path: "/nope.png".into(),
                confidence_threshold: 0.5,
            }))
            .await
            .unwrap_err();

        assert_eq!(failed.retries, 0);
        assert!(!failed.error.is_retryable());
    }

    #[tokio::test]
    async fn unhealthy_probe_short_circuits() {
        struct UnhealthyClient;

        #[async_trait]
        impl StageClient for UnhealthyClient {
            fn kind(&self) -> StageKind {
                StageKind::Retrieve
            }
            async fn health(&self) -> Result<HealthResponse, StageError> {
                Ok(HealthResponse {
                    service_name: "retriever".into(),
                    version: None,
                    status: HealthStatus::Unhealthy,
                    details: None,
                })
            }
            async fn call(&self, _request: StageRequest) -> Result<StageResponse, StageError> {
                panic!("must not be called when unhealthy");
            }
        }

        let exec = StageExecutor::new(Arc::new(UnhealthyClient), fast_spec(), 5);
        let err = exec.probe().await.unwrap_err();
        assert!(matches!(err, StageError::ServiceUnavailable { .. }));
    }

    #[test]
    fn backoff_is_capped() {
        let client = Arc::new(FlakyClient {
            calls: AtomicU32::new(0),
            failures: 0,
        });
        let mut spec = fast_spec();
        spec.backoff_ms = 500;
        spec.max_backoff_ms = 1_000;
        let exec = StageExecutor::new(client, spec, 5);

        // 2^9 * 500ms would be 256s uncapped; cap plus 25% jitter bounds it.
        let d = exec.backoff_delay(10);
        assert!(d <= Duration::from_millis(1_250));
    }
}
