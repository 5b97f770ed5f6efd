//! Iris biometric core.
//!
//! Synchronous, deterministic building blocks of the iris pipeline:
//!
//! ```text
//! EyeImage ─► ImagePreprocessor ─► NormalizedFrame
//!          ─► IrisSegmenter     ─► IrisGeometry
//!          ─► LivenessGate      ─► LivenessReport
//!          ─► FeatureExtractor  ─► Template ─► Matcher ─► MatchResult
//! ```
//!
//! Nothing here does I/O or holds shared mutable state; concurrency and
//! storage live in `iris-engine`.

pub mod cancel;
pub mod codec;
pub mod error;
pub mod features;
pub mod liveness;
pub mod matcher;
pub mod pipeline;
pub mod preprocess;
pub mod segment;
pub mod types;

#[cfg(any(test, feature = "synthetic"))]
pub mod synthetic;

#[cfg(test)]
mod test_utils;

pub use cancel::CancelToken;
pub use error::{BiometricError, ErrorClass, Result};
pub use features::{FeatureConfig, FeatureExtractor};
pub use liveness::{LivenessConfig, LivenessGate, LivenessReport};
pub use matcher::{
    Decision, Distance, GalleryTemplate, HammingMatcher, MatchResult, Matcher,
    DEFAULT_MATCH_THRESHOLD,
};
pub use pipeline::{Extraction, Pipeline, PipelineConfig};
pub use preprocess::{ContrastMode, ImagePreprocessor, PreprocessConfig};
pub use segment::{IrisSegmenter, SegmentConfig};
pub use types::{
    Circle, EyeImage, IrisGeometry, NormalizedFrame, OcclusionMask, Template, UnwrappedIris,
};
