// tests/reconciliation.rs

mod common;
use crate::common::builders::{BundleBuilder, InstallationBuilder};
use crate::common::{Harness, NAMESPACE, init_tracing};

use std::error::Error;

use bundlectl::exec::ExecuteOptions;
use bundlectl::reconcile::{ReconcileOptions, Reconciler};
use bundlectl::secrets::SecretStrategy;
use bundlectl::storage::{CredentialSet, InstallationSpec};
use bundlectl::types::ResultStatus;

type TestResult = Result<(), Box<dyn Error>>;

fn publish(h: &Harness) {
    for version in ["1.0.0", "1.1.0"] {
        h.publish(
            &format!("example.com/cache:v{version}"),
            BundleBuilder::new("cache", version)
                .with_default_param("size", "small")
                .with_sensitive_param("token")
                .with_credential("kubeconfig", false)
                .with_action("status", false)
                .build(),
        );
    }
}

fn spec(version: &str) -> InstallationSpec {
    InstallationBuilder::new(NAMESPACE, "cache")
        .with_reference(&format!("example.com/cache:v{version}"))
        .with_param("token", "t0k3n")
        .build()
}

fn reconciler(h: &Harness) -> Reconciler {
    Reconciler::new(h.app.executor().clone())
}

fn options(spec: InstallationSpec) -> ReconcileOptions {
    ReconcileOptions {
        installation: spec,
        ..Default::default()
    }
}

/// Reconcile and return `(action, reason)`, empty action when in sync.
async fn reconcile(h: &Harness, opts: &ReconcileOptions) -> Result<(String, String), Box<dyn Error>> {
    let outcome = reconciler(h).reconcile(&h.ctx(), opts).await?;
    Ok((
        outcome.decision.planned_action().to_string(),
        outcome.decision.reason,
    ))
}

#[tokio::test]
async fn missing_installation_is_installed() -> TestResult {
    init_tracing();
    let h = Harness::new();
    publish(&h);

    let outcome = reconciler(&h)
        .reconcile(&h.ctx(), &options(spec("1.0.0")))
        .await?;

    assert!(!outcome.decision.in_sync);
    assert_eq!(outcome.decision.action.as_deref(), Some("install"));
    assert_eq!(outcome.decision.reason, "installation does not exist");
    assert_eq!(outcome.status, ResultStatus::Succeeded);
    let record = outcome.record.ok_or("install should have run")?;
    assert_eq!(outcome.run_id, record.run.id);
    assert_eq!(h.driver.installations("install"), vec!["cache"]);
    Ok(())
}

#[tokio::test]
async fn unchanged_installation_is_in_sync() -> TestResult {
    init_tracing();
    let h = Harness::new();
    publish(&h);
    let ctx = h.ctx();
    reconciler(&h).reconcile(&ctx, &options(spec("1.0.0"))).await?;
    let installed = h.storage.get_installation(&ctx, NAMESPACE, "cache").await?;

    let outcome = reconciler(&h).reconcile(&ctx, &options(spec("1.0.0"))).await?;

    assert!(outcome.decision.in_sync);
    assert!(outcome.decision.action.is_none());
    assert_eq!(outcome.decision.reason, "installation is up to date");
    assert!(outcome.record.is_none());
    assert_eq!(outcome.run_id, installed.status.last_run_id);
    assert_eq!(outcome.result_id, installed.status.last_result_id);
    assert_eq!(h.driver.calls().len(), 1);
    Ok(())
}

#[tokio::test]
async fn changed_parameter_triggers_upgrade() -> TestResult {
    init_tracing();
    let h = Harness::new();
    publish(&h);
    reconcile(&h, &options(spec("1.0.0"))).await?;

    let mut changed = spec("1.0.0");
    changed.parameters.push(SecretStrategy::value("size", "large"));
    let (action, reason) = reconcile(&h, &options(changed)).await?;

    assert_eq!(action, "upgrade");
    assert_eq!(reason, "parameters changed: size");
    assert_eq!(h.driver.installations("upgrade"), vec!["cache"]);
    Ok(())
}

#[tokio::test]
async fn changed_sensitive_parameter_triggers_upgrade() -> TestResult {
    init_tracing();
    let h = Harness::new();
    publish(&h);
    reconcile(&h, &options(spec("1.0.0"))).await?;

    let rotated = InstallationBuilder::new(NAMESPACE, "cache")
        .with_reference("example.com/cache:v1.0.0")
        .with_param("token", "r0tated")
        .build();
    let (action, reason) = reconcile(&h, &options(rotated)).await?;

    assert_eq!(action, "upgrade");
    assert_eq!(reason, "parameters changed: token");
    Ok(())
}

#[tokio::test]
async fn changed_bundle_triggers_upgrade() -> TestResult {
    init_tracing();
    let h = Harness::new();
    publish(&h);
    reconcile(&h, &options(spec("1.0.0"))).await?;

    let (action, reason) = reconcile(&h, &options(spec("1.1.0"))).await?;

    assert_eq!(action, "upgrade");
    assert!(reason.starts_with("bundle changed from"), "{reason}");
    let inst = h.storage.get_installation(&h.ctx(), NAMESPACE, "cache").await?;
    assert_eq!(inst.status.bundle_version, "1.1.0");
    Ok(())
}

#[tokio::test]
async fn changed_credential_sets_trigger_upgrade() -> TestResult {
    init_tracing();
    let h = Harness::new();
    publish(&h);
    let ctx = h.ctx();
    h.app
        .apply_credential_set(
            &ctx,
            CredentialSet {
                namespace: NAMESPACE.to_string(),
                name: "cluster".to_string(),
                credentials: vec![SecretStrategy::value("kubeconfig", "apiVersion: v1")],
                ..Default::default()
            },
        )
        .await?;
    reconcile(&h, &options(spec("1.0.0"))).await?;

    let with_set = InstallationBuilder::new(NAMESPACE, "cache")
        .with_reference("example.com/cache:v1.0.0")
        .with_param("token", "t0k3n")
        .with_credential_set("cluster")
        .build();
    let (action, reason) = reconcile(&h, &options(with_set.clone())).await?;
    assert_eq!(action, "upgrade");
    assert_eq!(reason, "credential sets changed");

    let (action, _) = reconcile(&h, &options(with_set)).await?;
    assert_eq!(action, "");
    Ok(())
}

#[tokio::test]
async fn install_only_parameters_do_not_drift() -> TestResult {
    init_tracing();
    let h = Harness::new();
    h.publish(
        "example.com/seeded:v1.0.0",
        BundleBuilder::new("seeded", "1.0.0")
            .with_default_param("size", "small")
            .with_param_for("seed", &["install"])
            .build(),
    );
    let seeded = InstallationBuilder::new(NAMESPACE, "seeded")
        .with_reference("example.com/seeded:v1.0.0")
        .with_param("seed", "42")
        .build();

    let (action, _) = reconcile(&h, &options(seeded.clone())).await?;
    assert_eq!(action, "install");
    let (action, reason) = reconcile(&h, &options(seeded.clone())).await?;
    assert_eq!(action, "", "{reason}");
    assert_eq!(reason, "installation is up to date");

    let mut resized = seeded;
    resized.parameters.push(SecretStrategy::value("size", "large"));
    let (action, reason) = reconcile(&h, &options(resized)).await?;
    assert_eq!(action, "upgrade");
    assert_eq!(reason, "parameters changed: size");
    assert_eq!(h.driver.calls().len(), 2);
    Ok(())
}

#[tokio::test]
async fn forced_reconcile_upgrades_in_sync_installation() -> TestResult {
    init_tracing();
    let h = Harness::new();
    publish(&h);
    reconcile(&h, &options(spec("1.0.0"))).await?;

    let forced = ReconcileOptions {
        force: true,
        ..options(spec("1.0.0"))
    };
    let (action, reason) = reconcile(&h, &forced).await?;

    assert_eq!(action, "upgrade");
    assert_eq!(reason, "forced");
    Ok(())
}

#[tokio::test]
async fn failed_upgrade_is_retried() -> TestResult {
    init_tracing();
    let h = Harness::new();
    publish(&h);
    reconcile(&h, &options(spec("1.0.0"))).await?;

    h.driver.fail("cache", "upgrade", 1, "disk full");
    let outcome = reconciler(&h)
        .reconcile(&h.ctx(), &options(spec("1.1.0")))
        .await?;
    assert_eq!(outcome.status, ResultStatus::Failed);
    assert!(outcome.into_result().is_err());

    h.driver.clear("cache", "upgrade");
    let (action, reason) = reconcile(&h, &options(spec("1.1.0"))).await?;
    assert_eq!(action, "upgrade");
    assert_eq!(reason, "last upgrade did not succeed");
    let (action, _) = reconcile(&h, &options(spec("1.1.0"))).await?;
    assert_eq!(action, "");
    Ok(())
}

#[tokio::test]
async fn failed_install_is_installed_again() -> TestResult {
    init_tracing();
    let h = Harness::new();
    publish(&h);
    h.driver.fail("cache", "install", 1, "quota");
    reconcile(&h, &options(spec("1.0.0"))).await?;

    h.driver.clear("cache", "install");
    let (action, reason) = reconcile(&h, &options(spec("1.0.0"))).await?;

    assert_eq!(action, "install");
    assert_eq!(reason, "install has never completed");
    assert_eq!(h.driver.installations("install").len(), 2);
    Ok(())
}

#[tokio::test]
async fn non_modifying_actions_do_not_affect_the_verdict() -> TestResult {
    init_tracing();
    let h = Harness::new();
    publish(&h);
    let ctx = h.ctx();
    reconcile(&h, &options(spec("1.0.0"))).await?;

    h.driver.fail("cache", "status", 3, "unreachable");
    h.app
        .executor()
        .execute(&ctx, &spec("1.0.0"), "status", &ExecuteOptions::default())
        .await?;

    let (action, reason) = reconcile(&h, &options(spec("1.0.0"))).await?;
    assert_eq!(action, "");
    assert_eq!(reason, "installation is up to date");
    Ok(())
}

#[tokio::test]
async fn uninstalled_spec_uninstalls_once() -> TestResult {
    init_tracing();
    let h = Harness::new();
    publish(&h);
    reconcile(&h, &options(spec("1.0.0"))).await?;

    let mut gone = spec("1.0.0");
    gone.uninstalled = true;
    let (action, reason) = reconcile(&h, &options(gone.clone())).await?;
    assert_eq!(action, "uninstall");
    assert_eq!(reason, "installation should be uninstalled");

    let (action, reason) = reconcile(&h, &options(gone)).await?;
    assert_eq!(action, "");
    assert_eq!(reason, "installation is not installed");

    // Asking for it back installs it again.
    let (action, reason) = reconcile(&h, &options(spec("1.0.0"))).await?;
    assert_eq!(action, "install");
    assert_eq!(reason, "installation was uninstalled");
    assert_eq!(
        h.driver.actions(),
        vec![
            ("cache".to_string(), "install".to_string()),
            ("cache".to_string(), "uninstall".to_string()),
            ("cache".to_string(), "install".to_string()),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn uninstalled_spec_for_unknown_installation_is_noop() -> TestResult {
    init_tracing();
    let h = Harness::new();
    publish(&h);
    let mut gone = spec("1.0.0");
    gone.uninstalled = true;

    let outcome = reconciler(&h).reconcile(&h.ctx(), &options(gone)).await?;

    assert!(outcome.decision.in_sync);
    assert!(outcome.run_id.is_empty());
    assert!(h.driver.calls().is_empty());
    Ok(())
}

#[tokio::test]
async fn dry_run_decides_without_running() -> TestResult {
    init_tracing();
    let h = Harness::new();
    publish(&h);
    reconcile(&h, &options(spec("1.0.0"))).await?;

    let dry = ReconcileOptions {
        dry_run: true,
        ..options(spec("1.1.0"))
    };
    let outcome = reconciler(&h).reconcile(&h.ctx(), &dry).await?;

    assert!(!outcome.decision.in_sync);
    assert_eq!(outcome.decision.planned_action(), "upgrade");
    assert!(outcome.record.is_none());
    assert_eq!(h.driver.calls().len(), 1);
    let inst = h.storage.get_installation(&h.ctx(), NAMESPACE, "cache").await?;
    assert_eq!(inst.status.bundle_version, "1.0.0");
    Ok(())
}
