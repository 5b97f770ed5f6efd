//! Enrollment and verification orchestration.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use iris_core::{EyeImage, GalleryTemplate, HammingMatcher, MatchResult, Matcher};

use crate::engine::Engine;
use crate::error::{validate_identity, EngineError};
use crate::store::{EnrollPolicy, StoredTemplate, TemplateId, TemplateStore};

/// Acknowledgment of a stored enrollment.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EnrollOutcome {
    pub identity: String,
    pub template_id: TemplateId,
    pub policy: EnrollPolicy,
    pub valid_fraction: f32,
    pub liveness_score: f32,
    /// Capture time of the enrolled image.
    pub captured_at: DateTime<Utc>,
}

/// Who to compare a probe against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyMode {
    /// 1:1 against the claimed identity.
    Identity(String),
    /// 1:N against every enrolled identity.
    Identify,
}

pub struct EnrollmentService {
    engine: Engine,
    store: Arc<dyn TemplateStore>,
    default_policy: EnrollPolicy,
}

impl EnrollmentService {
    pub fn new(engine: Engine, store: Arc<dyn TemplateStore>, default_policy: EnrollPolicy) -> Self {
        Self {
            engine,
            store,
            default_policy,
        }
    }

    /// Validate, extract and store. Nothing is written unless every stage passed.
    pub async fn enroll(
        &self,
        identity: &str,
        image: EyeImage,
        policy: Option<EnrollPolicy>,
    ) -> Result<EnrollOutcome, EngineError> {
        let policy = policy.unwrap_or(self.default_policy);
        let captured_at = image.captured_at();
        let result = self.enroll_inner(identity, image, policy).await;
        match &result {
            Ok(outcome) => tracing::info!(
                identity,
                template_id = %outcome.template_id,
                ?policy,
                %captured_at,
                valid_fraction = outcome.valid_fraction,
                liveness = outcome.liveness_score,
                "enrollment stored"
            ),
            Err(e) => log_failure("enroll", identity, e),
        }
        result
    }

    async fn enroll_inner(
        &self,
        identity: &str,
        image: EyeImage,
        policy: EnrollPolicy,
    ) -> Result<EnrollOutcome, EngineError> {
        validate_identity(identity)?;
        let captured_at = image.captured_at();
        let extraction = self.engine.extract(image).await?;
        let template_id = self
            .store
            .upsert(identity, &extraction.template, policy)
            .await?;
        Ok(EnrollOutcome {
            identity: identity.to_string(),
            template_id,
            policy,
            valid_fraction: extraction.template.valid_fraction(),
            liveness_score: extraction.liveness.score,
            captured_at,
        })
    }
}

pub struct VerificationService {
    engine: Engine,
    store: Arc<dyn TemplateStore>,
    matcher: Arc<dyn Matcher>,
    threshold: f32,
}

impl VerificationService {
    pub fn new(
        engine: Engine,
        store: Arc<dyn TemplateStore>,
        matcher: Arc<dyn Matcher>,
        threshold: f32,
    ) -> Self {
        Self {
            engine,
            store,
            matcher,
            threshold,
        }
    }

    /// Verification service using [`HammingMatcher`].
    pub fn hamming(
        engine: Engine,
        store: Arc<dyn TemplateStore>,
        max_shift: i32,
        min_overlap_bits: usize,
        threshold: f32,
    ) -> Self {
        Self::new(
            engine,
            store,
            Arc::new(HammingMatcher::new(max_shift, min_overlap_bits)),
            threshold,
        )
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Compare one capture against the gallery selected by `mode`.
    ///
    /// A rejected comparison is an `Ok` result with [`iris_core::Decision::Reject`].
    /// Errors mean no decision could be reached.
    pub async fn verify(&self, image: EyeImage, mode: VerifyMode) -> Result<MatchResult, EngineError> {
        let label = match &mode {
            VerifyMode::Identity(id) => id.as_str(),
            VerifyMode::Identify => "*",
        };
        let captured_at = image.captured_at();
        let result = self.verify_inner(image, &mode).await;
        match &result {
            Ok(m) if m.is_accept() => tracing::info!(
                identity = label,
                matched = m.matched_identity.as_deref().unwrap_or(""),
                score = m.score,
                shift = m.shift,
                %captured_at,
                "verification accepted"
            ),
            Ok(m) => tracing::warn!(
                identity = label,
                score = m.score,
                %captured_at,
                threshold = self.threshold,
                "verification rejected"
            ),
            Err(e) => log_failure("verify", label, e),
        }
        result
    }

    async fn verify_inner(&self, image: EyeImage, mode: &VerifyMode) -> Result<MatchResult, EngineError> {
        if let VerifyMode::Identity(identity) = mode {
            validate_identity(identity)?;
        }
        let probe = self.engine.extract(image).await?.template;

        match mode {
            VerifyMode::Identity(identity) => {
                let templates = self.store.get(identity).await?;
                if templates.is_empty() {
                    return Err(EngineError::UnknownIdentity(identity.clone()));
                }
                let gallery = gallery_of(identity, &templates);
                let result = self.matcher.compare(&probe, &gallery, self.threshold);
                if result.is_accept() {
                    self.record_verified(identity).await;
                }
                Ok(result)
            }
            VerifyMode::Identify => {
                let mut enrolled = Vec::new();
                for identity in self.store.identities().await? {
                    match self.store.get(&identity).await {
                        // Empty when removed between listing and fetching
                        Ok(templates) if templates.is_empty() => {}
                        Ok(templates) => enrolled.push((identity, templates)),
                        Err(e) => tracing::warn!(
                            identity = %identity,
                            error = %e,
                            "skipping identity with unreadable templates"
                        ),
                    }
                }
                let gallery: Vec<GalleryTemplate<'_>> = enrolled
                    .iter()
                    .flat_map(|(identity, templates)| gallery_of(identity, templates))
                    .collect();
                tracing::debug!(
                    identities = enrolled.len(),
                    templates = gallery.len(),
                    "identification gallery assembled"
                );
                Ok(self.matcher.compare(&probe, &gallery, self.threshold))
            }
        }
    }

    async fn record_verified(&self, identity: &str) {
        match self.store.mark_verified(identity, Utc::now()).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(identity, "identity removed before last-verified update"),
            Err(e) => tracing::error!(identity, error = %e, "failed to record verification time"),
        }
    }
}

fn gallery_of<'a>(identity: &'a str, templates: &'a [StoredTemplate]) -> Vec<GalleryTemplate<'a>> {
    templates
        .iter()
        .map(|t| GalleryTemplate {
            identity,
            template_id: &t.id,
            template: &t.template,
        })
        .collect()
}

fn log_failure(op: &'static str, identity: &str, err: &EngineError) {
    use iris_core::ErrorClass;
    match err.class() {
        ErrorClass::Internal => tracing::error!(
            op,
            identity,
            code = err.code(),
            error = %err,
            "request failed"
        ),
        class => tracing::warn!(
            op,
            identity,
            code = err.code(),
            ?class,
            retry_may_help = err.retry_may_help(),
            error = %err,
            "request rejected"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryTemplateStore;
    use crate::store::{IdentityRecord, StoreError};
    use async_trait::async_trait;
    use iris_core::synthetic::SyntheticEye;
    use iris_core::{Decision, Template, DEFAULT_MATCH_THRESHOLD};
    use std::time::Duration;

    /// Memory store whose reads fail for one identity, as with a corrupt row.
    struct UnreadableIdentity {
        inner: MemoryTemplateStore,
        unreadable: &'static str,
    }

    #[async_trait]
    impl TemplateStore for UnreadableIdentity {
        async fn upsert(
            &self,
            identity: &str,
            template: &Template,
            policy: EnrollPolicy,
        ) -> Result<TemplateId, StoreError> {
            self.inner.upsert(identity, template, policy).await
        }

        async fn get(&self, identity: &str) -> Result<Vec<StoredTemplate>, StoreError> {
            if identity == self.unreadable {
                return Err(StoreError::DecryptionFailed);
            }
            self.inner.get(identity).await
        }

        async fn exists(&self, identity: &str) -> Result<bool, StoreError> {
            self.inner.exists(identity).await
        }

        async fn record(&self, identity: &str) -> Result<Option<IdentityRecord>, StoreError> {
            self.inner.record(identity).await
        }

        async fn identities(&self) -> Result<Vec<String>, StoreError> {
            self.inner.identities().await
        }

        async fn mark_verified(&self, identity: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
            self.inner.mark_verified(identity, at).await
        }

        async fn remove_template(&self, identity: &str, id: &str) -> Result<bool, StoreError> {
            self.inner.remove_template(identity, id).await
        }

        async fn remove_identity(&self, identity: &str) -> Result<bool, StoreError> {
            self.inner.remove_identity(identity).await
        }

        async fn count_templates(&self) -> Result<u64, StoreError> {
            self.inner.count_templates().await
        }
    }

    fn services() -> (EnrollmentService, VerificationService, Arc<MemoryTemplateStore>) {
        let engine = Engine::new(Default::default(), Duration::from_secs(30));
        let store = Arc::new(MemoryTemplateStore::new());
        let enroll = EnrollmentService::new(engine.clone(), store.clone(), EnrollPolicy::Append);
        let verify = VerificationService::new(
            engine,
            store.clone(),
            Arc::new(HammingMatcher::default()),
            DEFAULT_MATCH_THRESHOLD,
        );
        (enroll, verify, store)
    }

    #[tokio::test]
    async fn test_accept_records_last_verified() {
        let (enroll, verify, store) = services();
        enroll
            .enroll("alice", SyntheticEye::new(11).to_eye_image(), None)
            .await
            .unwrap();
        assert!(store.record("alice").await.unwrap().unwrap().last_verified_at.is_none());

        let result = verify
            .verify(
                SyntheticEye::new(11).to_eye_image(),
                VerifyMode::Identity("alice".into()),
            )
            .await
            .unwrap();
        assert_eq!(result.decision, Decision::Accept);
        assert_eq!(result.matched_identity.as_deref(), Some("alice"));
        assert!(store.record("alice").await.unwrap().unwrap().last_verified_at.is_some());
    }

    #[tokio::test]
    async fn test_reject_leaves_store_untouched() {
        let (enroll, verify, store) = services();
        enroll
            .enroll("alice", SyntheticEye::new(11).to_eye_image(), None)
            .await
            .unwrap();
        let before = store.record("alice").await.unwrap();

        let result = verify
            .verify(
                SyntheticEye::new(12).to_eye_image(),
                VerifyMode::Identity("alice".into()),
            )
            .await
            .unwrap();
        assert_eq!(result.decision, Decision::Reject);
        assert!(result.matched_identity.is_none());
        assert_eq!(store.record("alice").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_enroll_reports_capture_time() {
        let (enroll, _, _) = services();
        let at = DateTime::parse_from_rfc3339("2026-03-04T05:06:07Z")
            .unwrap()
            .with_timezone(&Utc);
        let image = SyntheticEye::new(11).to_eye_image().with_capture_time(at);
        let outcome = enroll.enroll("alice", image, None).await.unwrap();
        assert_eq!(outcome.captured_at, at);
    }

    #[tokio::test]
    async fn test_identify_skips_unreadable_identity() {
        let engine = Engine::new(Default::default(), Duration::from_secs(30));
        let store = Arc::new(UnreadableIdentity {
            inner: MemoryTemplateStore::new(),
            unreadable: "alice",
        });
        let enroll = EnrollmentService::new(engine.clone(), store.clone(), EnrollPolicy::Append);
        enroll
            .enroll("alice", SyntheticEye::new(11).to_eye_image(), None)
            .await
            .unwrap();
        enroll
            .enroll("bob", SyntheticEye::new(12).to_eye_image(), None)
            .await
            .unwrap();
        let verify = VerificationService::hamming(
            engine,
            store,
            iris_core::matcher::DEFAULT_MAX_SHIFT,
            iris_core::matcher::DEFAULT_MIN_OVERLAP_BITS,
            DEFAULT_MATCH_THRESHOLD,
        );

        let result = verify
            .verify(SyntheticEye::new(12).to_eye_image(), VerifyMode::Identify)
            .await
            .unwrap();
        assert_eq!(result.decision, Decision::Accept);
        assert_eq!(result.matched_identity.as_deref(), Some("bob"));

        // The unreadable identity is skipped, not matched and not fatal
        let result = verify
            .verify(SyntheticEye::new(11).to_eye_image(), VerifyMode::Identify)
            .await
            .unwrap();
        assert_eq!(result.decision, Decision::Reject);
    }

    #[tokio::test]
    async fn test_failed_enrollment_stores_nothing() {
        let (enroll, _, store) = services();
        let spoof = SyntheticEye::new(11).without_highlights().to_eye_image();
        let err = enroll.enroll("alice", spoof, None).await.unwrap_err();
        assert_eq!(err.code(), "LivenessRejected");
        assert!(!store.exists("alice").await.unwrap());
    }
}
