use std::sync::Arc;
use std::time::{Duration, Instant};

use iris_core::{BiometricError, CancelToken, Extraction, EyeImage, Pipeline, PipelineConfig};

use crate::error::EngineError;

/// Clone-safe handle that runs the pipeline on tokio's blocking pool.
///
/// Every call gets its own [`CancelToken`] carrying the request deadline.
/// When the caller-side timeout fires first the token is cancelled, so the
/// worker stops at its next stage boundary instead of running to the end.
#[derive(Clone)]
pub struct Engine {
    pipeline: Arc<Pipeline>,
    timeout: Duration,
}

impl Engine {
    pub fn new(pipeline: Pipeline, timeout: Duration) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            timeout,
        }
    }

    pub fn from_config(config: PipelineConfig, timeout: Duration) -> Self {
        Self::new(Pipeline::new(config), timeout)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Preprocess, segment, gate and encode one capture.
    pub async fn extract(&self, image: EyeImage) -> Result<Extraction, EngineError> {
        let started = Instant::now();
        let token = match started.checked_add(self.timeout) {
            Some(deadline) => CancelToken::with_deadline(deadline),
            None => CancelToken::new(),
        };

        let pipeline = Arc::clone(&self.pipeline);
        let worker_token = token.clone();
        let task = tokio::task::spawn_blocking(move || pipeline.extract(&image, &worker_token));

        match tokio::time::timeout(self.timeout, task).await {
            Err(_elapsed) => {
                token.cancel();
                tracing::warn!(timeout_ms = self.timeout.as_millis() as u64, "pipeline timed out");
                Err(EngineError::Timeout(self.timeout))
            }
            Ok(Err(join_err)) => {
                tracing::error!(error = %join_err, "pipeline worker failed");
                Err(EngineError::Worker(join_err.to_string()))
            }
            Ok(Ok(Err(BiometricError::Cancelled))) => {
                tracing::warn!(timeout_ms = self.timeout.as_millis() as u64, "pipeline deadline passed");
                Err(EngineError::Timeout(self.timeout))
            }
            Ok(Ok(result)) => {
                let extraction = result?;
                tracing::debug!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    valid_fraction = extraction.template.valid_fraction(),
                    liveness = extraction.liveness.score,
                    "pipeline finished"
                );
                Ok(extraction)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iris_core::synthetic::SyntheticEye;

    #[tokio::test]
    async fn test_extract_on_blocking_pool() {
        let engine = Engine::new(Pipeline::default(), Duration::from_secs(30));
        let out = engine
            .extract(SyntheticEye::new(3).to_eye_image())
            .await
            .unwrap();
        assert!(out.template.valid_fraction() > 0.4);
    }

    #[tokio::test]
    async fn test_zero_budget_times_out() {
        let engine = Engine::new(Pipeline::default(), Duration::ZERO);
        let err = engine
            .extract(SyntheticEye::new(3).to_eye_image())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Timeout(_)));
        assert!(err.retry_may_help());
    }

    #[tokio::test]
    async fn test_pipeline_errors_pass_through() {
        let engine = Engine::new(Pipeline::default(), Duration::from_secs(30));
        let err = engine
            .extract(EyeImage::from_raw(vec![0; 4], 2, 2, 1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Biometric(BiometricError::InvalidImage(_))
        ));
    }
}
