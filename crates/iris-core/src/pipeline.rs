//! Stage chaining with cooperative cancellation.

use crate::cancel::CancelToken;
use crate::error::{BiometricError, Result};
use crate::features::{FeatureConfig, FeatureExtractor};
use crate::liveness::{LivenessConfig, LivenessGate, LivenessReport};
use crate::preprocess::{ImagePreprocessor, PreprocessConfig};
use crate::segment::{IrisSegmenter, SegmentConfig};
use crate::types::{EyeImage, IrisGeometry, Template};

/// Configuration of every stage.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub preprocess: PreprocessConfig,
    pub segment: SegmentConfig,
    pub liveness: LivenessConfig,
    pub features: FeatureConfig,
}

/// Everything one successful pipeline run produces.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub template: Template,
    pub geometry: IrisGeometry,
    pub liveness: LivenessReport,
}

/// Preprocess → segment → liveness gate → feature extraction.
///
/// Stateless after construction; share one instance across threads.
#[derive(Debug, Clone)]
pub struct Pipeline {
    preprocessor: ImagePreprocessor,
    segmenter: IrisSegmenter,
    liveness: LivenessGate,
    extractor: FeatureExtractor,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(PipelineConfig::default())
    }
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            preprocessor: ImagePreprocessor::new(config.preprocess),
            segmenter: IrisSegmenter::new(config.segment),
            liveness: LivenessGate::new(config.liveness),
            extractor: FeatureExtractor::new(config.features),
        }
    }

    pub fn extract(&self, image: &EyeImage, cancel: &CancelToken) -> Result<Extraction> {
        checkpoint(cancel, "preprocess")?;
        let frame = self.preprocessor.normalize(image)?;

        checkpoint(cancel, "segment")?;
        let geometry = self.segmenter.segment(&frame)?;

        checkpoint(cancel, "liveness")?;
        let liveness = self.liveness.check(&frame, &geometry)?;

        checkpoint(cancel, "features")?;
        let template = self.extractor.extract(&frame, &geometry)?;

        Ok(Extraction {
            template,
            geometry,
            liveness,
        })
    }
}

fn checkpoint(cancel: &CancelToken, stage: &'static str) -> Result<()> {
    if cancel.is_cancelled() {
        tracing::debug!(stage, "pipeline: cancelled at stage entry");
        return Err(BiometricError::Cancelled);
    }
    Ok(())
}
