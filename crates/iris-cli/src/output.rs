use std::io::Write;
use std::process::ExitCode;

use iris_core::{BiometricError, ErrorClass};
use iris_engine::{ConfigError, EngineError, StoreError};
use serde_json::json;

pub const EXIT_INTERNAL: u8 = 1;
pub const EXIT_INPUT: u8 = 2;
pub const EXIT_PROCESSING: u8 = 3;
pub const EXIT_TRUST: u8 = 4;
pub const EXIT_STORAGE: u8 = 5;
/// Comparison completed and did not match.
pub const EXIT_REJECTED: u8 = 6;

pub fn print_json(value: &serde_json::Value) -> std::io::Result<()> {
    let rendered = serde_json::to_string_pretty(value)?;
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(rendered.as_bytes())?;
    stdout.write_all(b"\n")
}

pub fn exit_code_for(class: ErrorClass) -> u8 {
    match class {
        ErrorClass::Input => EXIT_INPUT,
        ErrorClass::Processing => EXIT_PROCESSING,
        ErrorClass::Trust => EXIT_TRUST,
        ErrorClass::Storage => EXIT_STORAGE,
        ErrorClass::Internal => EXIT_INTERNAL,
    }
}

/// Class and stable code of the most specific known error in the chain.
pub fn classify(err: &anyhow::Error) -> (ErrorClass, &'static str, bool) {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<EngineError>() {
            return (e.class(), e.code(), e.retry_may_help());
        }
        if let Some(e) = cause.downcast_ref::<BiometricError>() {
            return (e.class(), e.code(), e.retry_may_help());
        }
        if let Some(e) = cause.downcast_ref::<StoreError>() {
            let code = match e {
                StoreError::AlreadyEnrolled(_) => "AlreadyEnrolled",
                _ => "StorageFailure",
            };
            return (e.class(), code, false);
        }
        if cause.downcast_ref::<ConfigError>().is_some() {
            return (ErrorClass::Input, "InvalidConfig", false);
        }
        if cause.downcast_ref::<std::io::Error>().is_some() {
            return (ErrorClass::Input, "Io", false);
        }
    }
    (ErrorClass::Internal, "Internal", false)
}

/// Print the error as JSON on stdout and a one-line summary on stderr.
pub fn render_error(err: &anyhow::Error) -> ExitCode {
    let (class, code, retry_may_help) = classify(err);
    let payload = json!({
        "status": "error",
        "code": code,
        "class": class,
        "retry_may_help": retry_may_help,
        "error": format!("{err:#}"),
    });
    eprintln!("error: {err:#}");
    if print_json(&payload).is_err() {
        return ExitCode::from(EXIT_INTERNAL);
    }
    ExitCode::from(exit_code_for(class))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_classifies_through_context() {
        let err = Err::<(), _>(EngineError::UnknownIdentity("bob".into()))
            .context("verify failed")
            .unwrap_err();
        let (class, code, _) = classify(&err);
        assert_eq!(class, ErrorClass::Storage);
        assert_eq!(code, "UnknownIdentity");
        assert_eq!(exit_code_for(class), EXIT_STORAGE);
    }

    #[test]
    fn test_liveness_maps_to_trust_exit() {
        let err = anyhow::Error::from(EngineError::from(BiometricError::LivenessRejected {
            score: 0.1,
            threshold: 0.5,
        }));
        let (class, code, retry) = classify(&err);
        assert_eq!(exit_code_for(class), EXIT_TRUST);
        assert_eq!(code, "LivenessRejected");
        assert!(!retry);
    }

    #[test]
    fn test_missing_file_is_input_error() {
        let err = std::fs::read("/nonexistent/eye.png")
            .context("reading image")
            .unwrap_err();
        assert_eq!(classify(&err).0, ErrorClass::Input);
    }

    #[test]
    fn test_unknown_errors_are_internal() {
        let err = anyhow::anyhow!("something odd");
        assert_eq!(classify(&err), (ErrorClass::Internal, "Internal", false));
    }
}
