use thiserror::Error;

/// Failure of one pipeline stage.
///
/// Every variant aborts the current request only. No stage retries
/// internally; [`BiometricError::class`] tells the caller what kind of
/// reaction makes sense.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BiometricError {
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("segmentation failed: {0}")]
    SegmentationFailed(String),
    #[error("liveness rejected (score {score:.3} < {threshold:.3})")]
    LivenessRejected { score: f32, threshold: f32 },
    #[error("image quality too low (sharpness {sharpness:.5} < {floor:.5})")]
    LowQuality { sharpness: f32, floor: f32 },
    #[error("insufficient valid iris region ({valid_fraction:.3} < {required:.3})")]
    InsufficientValidRegion { valid_fraction: f32, required: f32 },
    #[error("invalid template: {0}")]
    InvalidTemplate(String),
    #[error("processing cancelled")]
    Cancelled,
}

/// Coarse error taxonomy shared by every layer of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Malformed or out-of-range input. Caller's fault, never retried.
    Input,
    /// Capture did not yield a usable iris; a new capture may succeed.
    Processing,
    /// Suspected spoof; escalate rather than prompt a blind retry.
    Trust,
    /// Enrollment policy or identity lookup failure.
    Storage,
    /// Unexpected fault confined to a single request.
    Internal,
}

impl BiometricError {
    pub fn class(&self) -> ErrorClass {
        match self {
            BiometricError::InvalidImage(_) => ErrorClass::Input,
            BiometricError::SegmentationFailed(_)
            | BiometricError::LowQuality { .. }
            | BiometricError::InsufficientValidRegion { .. } => ErrorClass::Processing,
            BiometricError::LivenessRejected { .. } => ErrorClass::Trust,
            BiometricError::InvalidTemplate(_) | BiometricError::Cancelled => ErrorClass::Internal,
        }
    }

    /// Whether re-capturing the eye is likely to change the outcome.
    pub fn retry_may_help(&self) -> bool {
        self.class() == ErrorClass::Processing
    }

    /// Stable machine-readable code, as reported to clients.
    pub fn code(&self) -> &'static str {
        match self {
            BiometricError::InvalidImage(_) => "InvalidImage",
            BiometricError::SegmentationFailed(_) => "SegmentationFailed",
            BiometricError::LivenessRejected { .. } => "LivenessRejected",
            BiometricError::LowQuality { .. } => "LowQuality",
            BiometricError::InsufficientValidRegion { .. } => "InsufficientValidRegion",
            BiometricError::InvalidTemplate(_) => "InvalidTemplate",
            BiometricError::Cancelled => "Cancelled",
        }
    }
}

pub type Result<T> = std::result::Result<T, BiometricError>;
