// tests/workflow_planning.rs

mod common;
use crate::common::builders::{BundleBuilder, DependencyBuilder, InstallationBuilder};
use crate::common::{Harness, NAMESPACE, expect_err, init_tracing};

use std::error::Error;

use bundlectl::bundle::Bundle;
use bundlectl::errors::{self, ErrorKind};
use bundlectl::resolver::ResolveOptions;
use bundlectl::secrets::SecretStrategy;
use bundlectl::storage::{Installation, InstallationSpec};
use bundlectl::workflow::{ACTION_NONE, Job, PlanOptions, Planner, SHARING_GROUP_LABEL, Workflow};
use chrono::Utc;

type TestResult = Result<(), Box<dyn Error>>;

async fn plan(h: &Harness, spec: &InstallationSpec, opts: &PlanOptions) -> errors::Result<Workflow> {
    let ctx = h.ctx();
    let reference = spec.bundle.to_reference()?;
    let bundle = h
        .resolver
        .resolve(&ctx, &reference, ResolveOptions::default())
        .await?;
    Planner::new(h.storage.clone(), h.resolver.clone())
        .plan(&ctx, spec, &bundle, opts)
        .await
}

fn job<'a>(wf: &'a Workflow, key: &str) -> &'a Job {
    wf.get_job(key)
        .unwrap_or_else(|| panic!("workflow has no job {key}"))
}

fn source<'a>(strategies: &'a [SecretStrategy], name: &str) -> &'a str {
    strategies
        .iter()
        .find(|s| s.name == name)
        .map(|s| s.source.value.as_str())
        .unwrap_or_else(|| panic!("no strategy {name}"))
}

/// wordpress -> {mysql (~5.7) -> backup, migrator <- mysql.connstr}
fn publish_wordpress(h: &Harness) {
    h.publish(
        "example.com/wordpress:v1.0.0",
        BundleBuilder::new("wordpress", "1.0.0")
            .with_credential("dbpass", true)
            .with_dependency(
                DependencyBuilder::new("mysql", "example.com/mysql")
                    .with_version("~5.7")
                    .with_parameter("database", "wordpress")
                    .with_parameter("password", "bundle.credentials.dbpass")
                    .build(),
            )
            .with_dependency(
                DependencyBuilder::new("migrator", "example.com/migrator:v2.0.0")
                    .with_parameter("connstr", "${bundle.dependencies.mysql.outputs.connstr}")
                    .build(),
            )
            .build(),
    );
    let mysql = |version: &str| -> Bundle {
        BundleBuilder::new("mysql", version)
            .with_string_param("database")
            .with_sensitive_param("password")
            .with_output("connstr")
            .with_dependency(DependencyBuilder::new("backup", "example.com/backup:v1.0.0").build())
            .build()
    };
    h.publish("example.com/mysql:v5.7.1", mysql("5.7.1"));
    h.publish("example.com/mysql:v5.7.9", mysql("5.7.9"));
    h.publish("example.com/mysql:v8.0.0", mysql("8.0.0"));
    h.publish(
        "example.com/migrator:v2.0.0",
        BundleBuilder::new("migrator", "2.0.0")
            .with_string_param("connstr")
            .build(),
    );
    h.publish(
        "example.com/backup:v1.0.0",
        BundleBuilder::new("backup", "1.0.0").build(),
    );
}

fn wordpress() -> InstallationBuilder {
    InstallationBuilder::new(NAMESPACE, "wordpress").with_reference("example.com/wordpress:v1.0.0")
}

#[tokio::test]
async fn dependencies_become_ordered_jobs() -> TestResult {
    init_tracing();
    let h = Harness::new();
    publish_wordpress(&h);

    let wf = plan(&h, &wordpress().build(), &PlanOptions::default()).await?;
    assert_eq!(wf.namespace, NAMESPACE);
    assert_eq!(wf.installation, "wordpress");
    assert_eq!(wf.spec.stages.len(), 1);
    let keys: Vec<&str> = wf.jobs().map(|j| j.key.as_str()).collect();
    assert_eq!(keys, vec!["migrator", "mysql", "mysql/backup", "root"]);

    let root = job(&wf, "root");
    assert_eq!(root.action, "install");
    assert_eq!(root.depends, vec!["mysql", "migrator"]);

    let mysql = job(&wf, "mysql");
    assert_eq!(mysql.installation.name, "wordpress/mysql");
    assert_eq!(mysql.installation.namespace, NAMESPACE);
    assert_eq!(mysql.depends, vec!["mysql/backup"]);
    assert_eq!(mysql.installation.bundle.tag, "v5.7.9");
    assert_eq!(mysql.installation.bundle.version, "5.7.9");

    let backup = job(&wf, "mysql/backup");
    assert_eq!(backup.installation.name, "wordpress/mysql/backup");
    assert!(backup.depends.is_empty());

    assert_eq!(job(&wf, "migrator").depends, vec!["mysql"]);
    Ok(())
}

#[tokio::test]
async fn wiring_is_lowered_to_workflow_references() -> TestResult {
    init_tracing();
    let h = Harness::new();
    publish_wordpress(&h);

    let wf = plan(&h, &wordpress().build(), &PlanOptions::default()).await?;
    let mysql = &job(&wf, "mysql").installation;
    let database = mysql
        .parameters
        .iter()
        .find(|s| s.name == "database")
        .expect("database wired");
    assert_eq!(database.source.key, "value");
    assert_eq!(database.source.value, "wordpress");
    assert_eq!(
        source(&mysql.parameters, "password"),
        "workflow.${WFID}.jobs.root.credentials.dbpass"
    );
    assert_eq!(
        source(&job(&wf, "migrator").installation.parameters, "connstr"),
        "workflow.${WFID}.jobs.mysql.outputs.connstr"
    );
    Ok(())
}

#[tokio::test]
async fn uninstall_reverses_the_order() -> TestResult {
    init_tracing();
    let h = Harness::new();
    publish_wordpress(&h);

    let wf = plan(&h, &wordpress().uninstalled().build(), &PlanOptions::default()).await?;
    assert!(wf.jobs().all(|j| j.action == "uninstall"));
    assert!(wf.jobs().all(|j| j.installation.uninstalled));
    assert!(job(&wf, "root").depends.is_empty());
    assert_eq!(job(&wf, "migrator").depends, vec!["root"]);
    assert_eq!(job(&wf, "mysql").depends, vec!["migrator", "root"]);
    assert_eq!(job(&wf, "mysql/backup").depends, vec!["mysql"]);
    Ok(())
}

#[tokio::test]
async fn installed_dependencies_are_upgraded() -> TestResult {
    init_tracing();
    let h = Harness::new();
    let ctx = h.ctx();
    publish_wordpress(&h);

    let mut existing = Installation::new(InstallationBuilder::new(NAMESPACE, "wordpress/mysql").build());
    existing.status.installed = Some(Utc::now());
    existing.status.installation_completed = true;
    h.storage.insert_installation(&ctx, &mut existing).await?;

    let opts = PlanOptions {
        action: Some("upgrade".into()),
        debug_mode: true,
        max_parallel: 8,
        ..Default::default()
    };
    let wf = plan(&h, &wordpress().build(), &opts).await?;
    assert_eq!(job(&wf, "root").action, "upgrade");
    assert_eq!(job(&wf, "mysql").action, "upgrade");
    assert_eq!(job(&wf, "migrator").action, "install");
    assert_eq!(wf.spec.max_parallel, 1);
    assert!(wf.spec.debug_mode);
    Ok(())
}

fn publish_shared(h: &Harness) {
    h.publish(
        "example.com/app:v1.0.0",
        BundleBuilder::new("app", "1.0.0")
            .with_dependency(
                DependencyBuilder::new("cache", "example.com/redis")
                    .with_version("^7")
                    .shared("infra")
                    .build(),
            )
            .build(),
    );
    h.publish("example.com/redis:v7.2.0", BundleBuilder::new("redis", "7.2.0").build());
}

fn app() -> InstallationSpec {
    InstallationBuilder::new(NAMESPACE, "app")
        .with_reference("example.com/app:v1.0.0")
        .build()
}

#[tokio::test]
async fn shared_dependencies_get_a_group_installation() -> TestResult {
    init_tracing();
    let h = Harness::new();
    publish_shared(&h);

    let wf = plan(&h, &app(), &PlanOptions::default()).await?;
    let cache = job(&wf, "cache");
    assert_eq!(cache.action, "install");
    assert_eq!(cache.installation.name, "infra-cache");
    assert_eq!(
        cache.installation.labels.get(SHARING_GROUP_LABEL).map(String::as_str),
        Some("infra")
    );
    Ok(())
}

#[tokio::test]
async fn installed_group_members_are_reused() -> TestResult {
    init_tracing();
    let h = Harness::new();
    let ctx = h.ctx();
    publish_shared(&h);

    let mut existing = Installation::new(
        InstallationBuilder::new(NAMESPACE, "prod-redis")
            .with_reference("example.com/redis:v7.2.0")
            .with_label(SHARING_GROUP_LABEL, "infra")
            .build(),
    );
    existing.status.installed = Some(Utc::now());
    existing.status.installation_completed = true;
    existing.status.bundle_version = "7.2.0".into();
    h.storage.insert_installation(&ctx, &mut existing).await?;

    let wf = plan(&h, &app(), &PlanOptions::default()).await?;
    let cache = job(&wf, "cache");
    assert_eq!(cache.action, ACTION_NONE);
    assert_eq!(cache.installation.name, "prod-redis");
    Ok(())
}

#[tokio::test]
async fn group_members_outside_the_version_range_are_not_reused() -> TestResult {
    init_tracing();
    let h = Harness::new();
    let ctx = h.ctx();
    publish_shared(&h);

    let mut old = Installation::new(
        InstallationBuilder::new(NAMESPACE, "old-redis")
            .with_reference("example.com/redis:v6.0.0")
            .with_label(SHARING_GROUP_LABEL, "infra")
            .build(),
    );
    old.status.installed = Some(Utc::now());
    old.status.bundle_version = "6.0.0".into();
    h.storage.insert_installation(&ctx, &mut old).await?;

    let wf = plan(&h, &app(), &PlanOptions::default()).await?;
    assert_eq!(job(&wf, "cache").installation.name, "infra-cache");
    Ok(())
}

#[tokio::test]
async fn untagged_dependencies_use_latest() -> TestResult {
    init_tracing();
    let h = Harness::new();
    h.publish(
        "example.com/site:v1.0.0",
        BundleBuilder::new("site", "1.0.0")
            .with_dependency(DependencyBuilder::new("cdn", "example.com/cdn").build())
            .build(),
    );
    h.publish("example.com/cdn:latest", BundleBuilder::new("cdn", "3.1.0").build());

    let spec = InstallationBuilder::new(NAMESPACE, "site")
        .with_reference("example.com/site:v1.0.0")
        .build();
    let wf = plan(&h, &spec, &PlanOptions::default()).await?;
    assert_eq!(job(&wf, "cdn").installation.bundle.tag, "latest");
    Ok(())
}

#[tokio::test]
async fn a_bundle_depending_on_itself_is_cyclic() {
    init_tracing();
    let h = Harness::new();
    h.publish(
        "example.com/loop:v1.0.0",
        BundleBuilder::new("loop", "1.0.0")
            .with_dependency(DependencyBuilder::new("again", "example.com/loop:v1.0.0").build())
            .build(),
    );
    let spec = InstallationBuilder::new(NAMESPACE, "loop")
        .with_reference("example.com/loop:v1.0.0")
        .build();
    let err = expect_err(plan(&h, &spec, &PlanOptions::default()).await);
    assert_eq!(err.kind(), ErrorKind::CyclicDependency);
    assert_eq!(
        err.to_string(),
        "cyclic dependency: example.com/loop -> example.com/loop"
    );
}

#[tokio::test]
async fn dependencies_may_not_be_named_root() {
    init_tracing();
    let h = Harness::new();
    h.publish(
        "example.com/odd:v1.0.0",
        BundleBuilder::new("odd", "1.0.0")
            .with_dependency(DependencyBuilder::new("root", "example.com/backup:v1.0.0").build())
            .build(),
    );
    h.publish("example.com/backup:v1.0.0", BundleBuilder::new("backup", "1.0.0").build());
    let spec = InstallationBuilder::new(NAMESPACE, "odd")
        .with_reference("example.com/odd:v1.0.0")
        .build();
    let err = expect_err(plan(&h, &spec, &PlanOptions::default()).await);
    assert_eq!(err.kind(), ErrorKind::InvalidManifest);
}

#[tokio::test]
async fn unsatisfiable_versions_fail_the_plan() {
    init_tracing();
    let h = Harness::new();
    h.publish(
        "example.com/pinned:v1.0.0",
        BundleBuilder::new("pinned", "1.0.0")
            .with_dependency(
                DependencyBuilder::new("db", "example.com/mysql")
                    .with_version(">=10")
                    .build(),
            )
            .build(),
    );
    h.publish("example.com/mysql:v5.7.9", BundleBuilder::new("mysql", "5.7.9").build());
    let spec = InstallationBuilder::new(NAMESPACE, "pinned")
        .with_reference("example.com/pinned:v1.0.0")
        .build();
    let err = expect_err(plan(&h, &spec, &PlanOptions::default()).await);
    assert!(err.is_not_found(), "{err}");
}
