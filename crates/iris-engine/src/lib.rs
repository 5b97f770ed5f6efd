//! Iris enrollment and verification.
//!
//! Wraps the synchronous `iris-core` pipeline with tokio-based execution,
//! per-request timeouts, and a [`TemplateStore`] shared by every request.

pub mod config;
pub mod engine;
pub mod error;
pub mod service;
pub mod store;

pub use config::{ConfigError, EngineConfig};
pub use engine::Engine;
pub use error::{validate_identity, EngineError};
pub use service::{EnrollOutcome, EnrollmentService, VerificationService, VerifyMode};
pub use store::{
    EnrollPolicy, IdentityRecord, MemoryTemplateStore, SqliteTemplateStore, StoreError,
    StoredTemplate, TemplateId, TemplateInfo, TemplateStore,
};
