//! Identity → template storage.
//!
//! Two backends share one contract:
//!
//! - [`MemoryTemplateStore`]: per-identity locks, copy-on-write records.
//! - [`SqliteTemplateStore`]: durable, AES-256-GCM encrypted template blobs.
//!
//! Writes to one identity are linearized. Readers observe a record either
//! before or after a write, never in between. An identity exists exactly as
//! long as it holds at least one template.

mod memory;
mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use iris_core::{ErrorClass, Template};
use thiserror::Error;

pub use memory::MemoryTemplateStore;
pub use sqlite::SqliteTemplateStore;

pub type TemplateId = String;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("identity {0:?} is already enrolled")]
    AlreadyEnrolled(String),
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("template encryption failed")]
    EncryptionFailed,
    #[error("template decryption failed: key mismatch or corrupted data")]
    DecryptionFailed,
    #[error("invalid template blob size: {0} bytes")]
    InvalidBlob(usize),
    #[error("corrupt stored template: {0}")]
    CorruptTemplate(#[source] iris_core::BiometricError),
    #[error("corrupt stored record: {0}")]
    CorruptRecord(String),
    #[error("encryption key I/O error: {0}")]
    KeyIo(#[source] std::io::Error),
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::AlreadyEnrolled(_) => ErrorClass::Storage,
            _ => ErrorClass::Internal,
        }
    }
}

/// What to do when the identity already holds templates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollPolicy {
    /// Add another sample next to the existing ones.
    #[default]
    Append,
    /// Fail with [`StoreError::AlreadyEnrolled`] if any template exists.
    Single,
    /// Atomically swap every existing template for the new one.
    Replace,
}

impl std::str::FromStr for EnrollPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "append" => Ok(EnrollPolicy::Append),
            "single" => Ok(EnrollPolicy::Single),
            "replace" => Ok(EnrollPolicy::Replace),
            other => Err(format!("unknown enroll policy {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredTemplate {
    pub id: TemplateId,
    pub template: Template,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdentityRecord {
    pub identity: String,
    /// Oldest first.
    pub templates: Vec<StoredTemplate>,
    pub created_at: DateTime<Utc>,
    pub last_verified_at: Option<DateTime<Utc>>,
}

/// Metadata about an enrolled template (no template data).
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct TemplateInfo {
    pub id: TemplateId,
    pub created_at: DateTime<Utc>,
}

impl IdentityRecord {
    pub fn template_infos(&self) -> Vec<TemplateInfo> {
        self.templates
            .iter()
            .map(|t| TemplateInfo {
                id: t.id.clone(),
                created_at: t.created_at,
            })
            .collect()
    }
}

#[async_trait]
pub trait TemplateStore: Send + Sync {
    /// Store a template for `identity` under `policy`. Returns the new id.
    async fn upsert(
        &self,
        identity: &str,
        template: &Template,
        policy: EnrollPolicy,
    ) -> Result<TemplateId, StoreError>;

    /// All templates of `identity`, oldest first. Empty when unknown.
    async fn get(&self, identity: &str) -> Result<Vec<StoredTemplate>, StoreError>;

    async fn exists(&self, identity: &str) -> Result<bool, StoreError>;

    async fn record(&self, identity: &str) -> Result<Option<IdentityRecord>, StoreError>;

    /// Enrolled identities, sorted.
    async fn identities(&self) -> Result<Vec<String>, StoreError>;

    /// Set the last-verified timestamp. Returns false when the identity is unknown.
    async fn mark_verified(&self, identity: &str, at: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Remove one template, scoped to its identity. Removing the last
    /// template removes the identity.
    async fn remove_template(&self, identity: &str, id: &str) -> Result<bool, StoreError>;

    async fn remove_identity(&self, identity: &str) -> Result<bool, StoreError>;

    async fn count_templates(&self) -> Result<u64, StoreError>;
}

pub(crate) fn new_template_id() -> TemplateId {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
pub(crate) mod testing {
    use iris_core::Template;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    pub fn random_template(seed: u64) -> Template {
        let mut rng = StdRng::seed_from_u64(seed);
        Template::from_fn(|_| (rng.gen_bool(0.5), rng.gen_bool(0.9)))
    }
}
