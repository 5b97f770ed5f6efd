use std::sync::Arc;
use std::time::Duration;

use iris_core::synthetic::SyntheticEye;
use iris_core::{Decision, ErrorClass, HammingMatcher, DEFAULT_MATCH_THRESHOLD};
use iris_engine::{
    Engine, EngineError, EnrollPolicy, EnrollmentService, MemoryTemplateStore, TemplateStore,
    VerificationService, VerifyMode,
};

struct Harness {
    store: Arc<MemoryTemplateStore>,
    enroll: EnrollmentService,
    verify: VerificationService,
}

fn harness() -> Harness {
    let engine = Engine::new(Default::default(), Duration::from_secs(60));
    let store = Arc::new(MemoryTemplateStore::new());
    Harness {
        enroll: EnrollmentService::new(engine.clone(), store.clone(), EnrollPolicy::Append),
        verify: VerificationService::new(
            engine,
            store.clone(),
            Arc::new(HammingMatcher::default()),
            DEFAULT_MATCH_THRESHOLD,
        ),
        store,
    }
}

fn identity(name: &str) -> VerifyMode {
    VerifyMode::Identity(name.to_string())
}

#[tokio::test]
async fn test_same_capture_accepts() {
    let h = harness();
    let outcome = h
        .enroll
        .enroll("alice", SyntheticEye::new(21).to_eye_image(), None)
        .await
        .unwrap();
    assert_eq!(outcome.identity, "alice");
    assert_eq!(outcome.policy, EnrollPolicy::Append);
    assert!(outcome.valid_fraction > 0.4);
    assert!(outcome.liveness_score >= 0.5);

    let result = h
        .verify
        .verify(SyntheticEye::new(21).to_eye_image(), identity("alice"))
        .await
        .unwrap();
    assert_eq!(result.decision, Decision::Accept);
    assert!(result.score < 0.05, "score {}", result.score);
    assert_eq!(result.matched_template.as_deref(), Some(outcome.template_id.as_str()));
}

#[tokio::test]
async fn test_noisy_recapture_accepts() {
    let h = harness();
    h.enroll
        .enroll("alice", SyntheticEye::new(21).to_eye_image(), None)
        .await
        .unwrap();
    let probe = SyntheticEye::new(21).with_noise(77, 4).to_eye_image();
    let result = h.verify.verify(probe, identity("alice")).await.unwrap();
    assert_eq!(result.decision, Decision::Accept, "score {}", result.score);
}

#[tokio::test]
async fn test_rotated_recapture_accepts() {
    let h = harness();
    h.enroll
        .enroll("alice", SyntheticEye::new(21).to_eye_image(), None)
        .await
        .unwrap();
    let probe = SyntheticEye::new(21).rotated_columns(5).to_eye_image();
    let result = h.verify.verify(probe, identity("alice")).await.unwrap();
    assert_eq!(result.decision, Decision::Accept, "score {}", result.score);
    assert_ne!(result.shift, 0);
}

#[tokio::test]
async fn test_unrelated_eye_rejects() {
    let h = harness();
    h.enroll
        .enroll("alice", SyntheticEye::new(21).to_eye_image(), None)
        .await
        .unwrap();
    let result = h
        .verify
        .verify(SyntheticEye::new(22).to_eye_image(), identity("alice"))
        .await
        .unwrap();
    assert_eq!(result.decision, Decision::Reject);
    assert!(result.score > DEFAULT_MATCH_THRESHOLD);
    assert!(result.matched_identity.is_none());
}

#[tokio::test]
async fn test_identify_finds_enrolled_identity() {
    let h = harness();
    for (name, seed) in [("alice", 31), ("bob", 32), ("carol", 33)] {
        h.enroll
            .enroll(name, SyntheticEye::new(seed).to_eye_image(), None)
            .await
            .unwrap();
    }

    let hit = h
        .verify
        .verify(SyntheticEye::new(32).with_noise(5, 3).to_eye_image(), VerifyMode::Identify)
        .await
        .unwrap();
    assert_eq!(hit.decision, Decision::Accept);
    assert_eq!(hit.matched_identity.as_deref(), Some("bob"));

    let miss = h
        .verify
        .verify(SyntheticEye::new(34).to_eye_image(), VerifyMode::Identify)
        .await
        .unwrap();
    assert_eq!(miss.decision, Decision::Reject);
    assert!(miss.matched_identity.is_none());

    // Identification never records a verification time
    let bob = h.store.record("bob").await.unwrap().unwrap();
    assert!(bob.last_verified_at.is_none());
}

#[tokio::test]
async fn test_identify_on_empty_gallery_rejects() {
    let h = harness();
    let result = h
        .verify
        .verify(SyntheticEye::new(40).to_eye_image(), VerifyMode::Identify)
        .await
        .unwrap();
    assert_eq!(result.decision, Decision::Reject);
    assert_eq!(result.score, 1.0);
}

#[tokio::test]
async fn test_unknown_identity() {
    let h = harness();
    let err = h
        .verify
        .verify(SyntheticEye::new(21).to_eye_image(), identity("nobody"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::UnknownIdentity(ref id) if id == "nobody"));
    assert_eq!(err.class(), ErrorClass::Storage);
}

#[tokio::test]
async fn test_invalid_identity_rejected_before_processing() {
    let h = harness();
    let err = h
        .enroll
        .enroll("", SyntheticEye::new(21).to_eye_image(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidIdentity(_)));
    assert_eq!(err.class(), ErrorClass::Input);

    let err = h
        .verify
        .verify(SyntheticEye::new(21).to_eye_image(), identity("bad\u{0}id"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidIdentity(_)));
    assert_eq!(h.store.count_templates().await.unwrap(), 0);
}

#[tokio::test]
async fn test_single_policy_refuses_reenrollment() {
    let h = harness();
    h.enroll
        .enroll("alice", SyntheticEye::new(21).to_eye_image(), Some(EnrollPolicy::Single))
        .await
        .unwrap();
    let err = h
        .enroll
        .enroll("alice", SyntheticEye::new(21).to_eye_image(), Some(EnrollPolicy::Single))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "AlreadyEnrolled");
    assert_eq!(err.class(), ErrorClass::Storage);
    assert_eq!(h.store.get("alice").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_spoof_is_a_trust_failure() {
    let h = harness();
    let err = h
        .enroll
        .enroll("mallory", SyntheticEye::new(21).without_highlights().to_eye_image(), None)
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::Trust);
    assert!(!err.retry_may_help());
    assert!(!h.store.exists("mallory").await.unwrap());
}

#[tokio::test]
async fn test_zero_timeout_reports_timeout() {
    let engine = Engine::new(Default::default(), Duration::ZERO);
    let store = Arc::new(MemoryTemplateStore::new());
    let enroll = EnrollmentService::new(engine, store.clone(), EnrollPolicy::Append);
    let err = enroll
        .enroll("alice", SyntheticEye::new(21).to_eye_image(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Timeout(_)));
    assert_eq!(err.class(), ErrorClass::Processing);
    assert!(!store.exists("alice").await.unwrap());
}
