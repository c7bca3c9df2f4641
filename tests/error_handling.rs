// tests/error_handling.rs

mod common;
use crate::common::init_tracing;

use bundlectl::errors::{aggregate, BundleError, ErrorKind};
use bundlectl::types::ResultStatus;

#[test]
fn exit_codes_follow_error_kind() {
    init_tracing();
    assert_eq!(BundleError::not_found("installation dev/x").exit_code(), 3);
    assert_eq!(BundleError::Conflict("busy".into()).exit_code(), 3);
    assert_eq!(BundleError::InvariantViolated("bug".into()).exit_code(), 2);
    assert_eq!(BundleError::invalid_manifest("bad").exit_code(), 1);
    assert_eq!(
        BundleError::DriverFailed {
            code: 7,
            stderr_tail: "oops".into()
        }
        .exit_code(),
        1
    );
    assert_eq!(BundleError::Canceled("ctrl-c".into()).exit_code(), 1);
}

#[test]
fn aggregate_lists_every_error() {
    init_tracing();
    assert!(aggregate(Vec::new()).is_none());

    let single = aggregate(vec![BundleError::not_found("a")]).unwrap();
    assert_eq!(single.kind(), ErrorKind::NotFound);

    let many = aggregate(vec![
        BundleError::invalid_manifest("first"),
        BundleError::MissingSource("second".into()),
    ])
    .unwrap();
    assert_eq!(many.kind(), ErrorKind::InvalidManifest);
    let msg = many.to_string();
    assert!(msg.contains("2 errors occurred:"), "{msg}");
    assert!(msg.contains("first"), "{msg}");
    assert!(msg.contains("second"), "{msg}");
}

#[test]
fn for_installation_prefixes_user_facing_errors() {
    init_tracing();
    let e = BundleError::not_found("output x").for_installation("dev", "wordpress");
    assert_eq!(e.to_string(), "not found: dev/wordpress: output x");

    let e = BundleError::DriverFailed {
        code: 2,
        stderr_tail: "no space left".into(),
    }
    .for_installation("", "mysql");
    match e {
        BundleError::DriverFailed { code, stderr_tail } => {
            assert_eq!(code, 2);
            assert_eq!(stderr_tail, "mysql: no space left");
        }
        other => panic!("unexpected {other:?}"),
    }

    // Kinds that are not about one installation pass through unchanged.
    let e = BundleError::Canceled("stop".into()).for_installation("dev", "x");
    assert_eq!(e.to_string(), "canceled: stop");
}

#[test]
fn result_status_accepts_legacy_spellings() {
    init_tracing();
    assert_eq!("success".parse::<ResultStatus>(), Ok(ResultStatus::Succeeded));
    assert_eq!("failure".parse::<ResultStatus>(), Ok(ResultStatus::Failed));
    assert_eq!("cancelled".parse::<ResultStatus>(), Ok(ResultStatus::Canceled));
    assert_eq!(" Running ".parse::<ResultStatus>(), Ok(ResultStatus::Running));
    assert!("pending".parse::<ResultStatus>().is_err());
    assert_eq!(ResultStatus::Canceled.to_string(), "canceled");
    assert!(ResultStatus::Canceled.is_failure());
    assert!(!ResultStatus::Running.is_terminal());
}
