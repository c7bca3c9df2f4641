// tests/secret_resolution.rs

mod common;
use crate::common::builders::{BundleBuilder, InstallationBuilder};
use crate::common::init_tracing;

use std::collections::BTreeMap;
use std::error::Error;
use std::sync::Arc;

use bundlectl::context::Context;
use bundlectl::errors::ErrorKind;
use bundlectl::secrets::filesystem::FilesystemSecretStore;
use bundlectl::secrets::memory::MemorySecretStore;
use bundlectl::secrets::resolver::{WiringKind, WorkflowReference};
use bundlectl::secrets::{SecretResolver, SecretStore, SecretStrategy, Source};
use bundlectl::storage::memory::MemoryDocumentStore;
use bundlectl::storage::{Installation, Output, ParameterSet, Run, Sanitizer, Storage};
use bundlectl::types::ResultStatus;
use bundlectl::workflow::{Job, Stage, Workflow, WorkflowSpec};

type TestResult = Result<(), Box<dyn Error>>;

fn resolver() -> (SecretResolver, Storage, Arc<MemorySecretStore>) {
    let secrets = Arc::new(MemorySecretStore::default());
    let storage = Storage::new(
        Arc::new(MemoryDocumentStore::new()),
        Sanitizer::new(secrets.clone()),
    );
    (SecretResolver::new(storage.clone()), storage, secrets)
}

fn porter(name: &str, job: &str, kind: WiringKind, target: &str) -> SecretStrategy {
    SecretStrategy::new(name, Source::new("porter", WorkflowReference::format(job, kind, target)))
}

#[test]
fn workflow_references_parse_and_format() -> TestResult {
    init_tracing();
    let wiring = WorkflowReference::format("mysql", WiringKind::Outputs, "connstr");
    assert_eq!(wiring, "workflow.${WFID}.jobs.mysql.outputs.connstr");

    let parsed = WorkflowReference::parse("workflow.abc.jobs.root.parameters.region")?;
    assert_eq!(parsed.workflow_id, "abc");
    assert_eq!(parsed.job, "root");
    assert_eq!(parsed.kind, WiringKind::Parameters);
    assert_eq!(parsed.name, "region");

    let err = WorkflowReference::parse("workflow.abc.jobs.root.labels.x").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidReference);
    Ok(())
}

#[tokio::test]
async fn host_sources_resolve_in_process() -> TestResult {
    init_tracing();
    let (resolver, _, _) = resolver();
    let ctx = Context::default();

    let literal = resolver
        .resolve(&ctx, &SecretStrategy::value("name", "wordpress"))
        .await?;
    assert_eq!(literal.as_deref(), Some("wordpress"));

    let path_var = resolver
        .resolve(&ctx, &SecretStrategy::new("p", Source::new("env", "PATH")))
        .await?;
    assert_eq!(path_var, std::env::var("PATH").ok());

    let unset = resolver
        .resolve(
            &ctx,
            &SecretStrategy::new("u", Source::new("env", "BUNDLECTL_TEST_SURELY_UNSET_VAR")),
        )
        .await?;
    assert_eq!(unset, None);

    let dir = tempfile::tempdir()?;
    let file = dir.path().join("kubeconfig");
    std::fs::write(&file, "apiVersion: v1\n")?;
    let from_file = resolver
        .resolve(
            &ctx,
            &SecretStrategy::new("kubeconfig", Source::new("path", file.display().to_string())),
        )
        .await?;
    assert_eq!(from_file.as_deref(), Some("apiVersion: v1\n"));

    let err = resolver
        .resolve(
            &ctx,
            &SecretStrategy::new("k", Source::new("path", dir.path().join("missing").display().to_string())),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MissingSource);
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn command_sources_capture_trimmed_stdout() -> TestResult {
    init_tracing();
    let (resolver, _, _) = resolver();
    let ctx = Context::default();

    let out = resolver
        .resolve(&ctx, &SecretStrategy::new("c", Source::new("command", "echo '  token  '")))
        .await?;
    assert_eq!(out.as_deref(), Some("token"));

    let err = resolver
        .resolve(&ctx, &SecretStrategy::new("c", Source::new("command", "echo nope >&2; exit 3")))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MissingSource);
    assert!(err.to_string().contains("exited with 3"), "{err}");
    Ok(())
}

#[tokio::test]
async fn secret_sources_go_to_the_store() -> TestResult {
    init_tracing();
    let (resolver, _, secrets) = resolver();
    let ctx = Context::default();
    secrets.create(&ctx, "secret", "db-password", "hunter2").await?;

    let value = resolver
        .resolve(&ctx, &SecretStrategy::new("password", Source::new("secret", "db-password")))
        .await?;
    assert_eq!(value.as_deref(), Some("hunter2"));

    let err = resolver
        .resolve(&ctx, &SecretStrategy::new("password", Source::new("secret", "absent")))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MissingSource);

    let err = resolver
        .resolve(&ctx, &SecretStrategy::new("x", Source::new("vault", "a/b")))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidReference);
    assert!(err.to_string().contains("unknown source"), "{err}");
    Ok(())
}

#[tokio::test]
async fn resolve_all_fills_resolved_values() -> TestResult {
    init_tracing();
    let (resolver, _, _) = resolver();
    let ctx = Context::default();
    let resolved = resolver
        .resolve_all(
            &ctx,
            &[SecretStrategy::value("a", "1"), SecretStrategy::value("b", "2")],
        )
        .await?;
    let values: Vec<Option<&str>> = resolved.iter().map(|s| s.resolved_value.as_deref()).collect();
    assert_eq!(values, vec![Some("1"), Some("2")]);
    Ok(())
}

#[tokio::test]
async fn filesystem_store_keeps_one_file_per_secret() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let store = FilesystemSecretStore::new(dir.path().join("secrets"));
    let ctx = Context::default();

    store.create(&ctx, "secret", "run-1-password", "p@ss").await?;
    assert_eq!(store.resolve(&ctx, "secret", "run-1-password").await?, "p@ss");
    assert!(dir.path().join("secrets").join("secret").join("run-1-password").is_file());

    let err = store.resolve(&ctx, "secret", "nope").await.unwrap_err();
    assert!(err.is_not_found());
    Ok(())
}

/// A workflow with a finished `mysql` job that produced outputs, and a
/// `root` job whose installation carries inline values and a parameter set.
async fn seeded_workflow(storage: &Storage, ctx: &Context) -> Result<Workflow, Box<dyn Error>> {
    let bundle = BundleBuilder::new("mysql", "0.1.0")
        .with_output("connstr")
        .with_sensitive_output("password")
        .build();
    let mut inst = Installation::new(InstallationBuilder::new("dev", "wordpress/mysql").build());
    storage.insert_installation(ctx, &mut inst).await?;
    let run = storage
        .insert_run(ctx, Run::new(&inst, "install", bundle, "example.com/mysql:v0.1.0")?)
        .await?;
    let result = run.new_result(ResultStatus::Succeeded, "");
    storage.insert_result(ctx, &result).await?;
    storage
        .insert_output(ctx, Output::new(&result, "connstr", b"mysql://db:3306".to_vec()))
        .await?;
    let mut password = Output::new(&result, "password", b"s3cret".to_vec());
    password.sensitive = true;
    storage.insert_output(ctx, password).await?;

    let mut set = ParameterSet {
        namespace: "dev".into(),
        name: "regional".into(),
        parameters: vec![SecretStrategy::value("region", "eu-west-1")],
        ..Default::default()
    };
    storage.upsert_parameter_set(ctx, &mut set).await?;

    let mut mysql = Job {
        key: "mysql".into(),
        action: "install".into(),
        installation: inst.spec.clone(),
        ..Default::default()
    };
    mysql.status.last_run_id = run.id.clone();
    mysql.status.last_result_id = result.id.clone();
    mysql.status.status = Some(ResultStatus::Succeeded);

    let root = Job {
        key: "root".into(),
        action: "install".into(),
        installation: InstallationBuilder::new("dev", "wordpress")
            .with_param("tier", "gold")
            .with_credential("token", "abc123")
            .with_parameter_set("regional")
            .build(),
        depends: vec!["mysql".into()],
        ..Default::default()
    };
    let pending = Job {
        key: "redis".into(),
        action: "install".into(),
        installation: InstallationBuilder::new("dev", "wordpress/redis").build(),
        ..Default::default()
    };

    let jobs: BTreeMap<String, Job> = [mysql, root, pending]
        .into_iter()
        .map(|j| (j.key.clone(), j))
        .collect();
    let mut wf = Workflow::new(
        "dev",
        "wordpress",
        WorkflowSpec {
            stages: vec![Stage { jobs }],
            ..Default::default()
        },
    );
    storage.upsert_workflow(ctx, &mut wf).await?;
    Ok(wf)
}

#[tokio::test]
async fn porter_wiring_reads_dependency_outputs() -> TestResult {
    init_tracing();
    let (resolver, storage, _) = resolver();
    let ctx = Context::default();
    let wf = seeded_workflow(&storage, &ctx).await?;
    let wctx = ctx.with_workflow(wf.id.clone());

    let connstr = resolver
        .resolve(&wctx, &porter("db", "mysql", WiringKind::Outputs, "connstr"))
        .await?;
    assert_eq!(connstr.as_deref(), Some("mysql://db:3306"));

    // Sensitive outputs are restored from the secret store.
    let password = resolver
        .resolve(&wctx, &porter("pw", "mysql", WiringKind::Outputs, "password"))
        .await?;
    assert_eq!(password.as_deref(), Some("s3cret"));

    let err = resolver
        .resolve(&wctx, &porter("x", "mysql", WiringKind::Outputs, "port"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutputNotReady);

    let err = resolver
        .resolve(&wctx, &porter("x", "redis", WiringKind::Outputs, "host"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutputNotReady);
    Ok(())
}

#[tokio::test]
async fn porter_wiring_falls_back_to_installation_outputs_before_the_job_runs() -> TestResult {
    init_tracing();
    let (resolver, storage, _) = resolver();
    let ctx = Context::default();
    let seeded = seeded_workflow(&storage, &ctx).await?;

    // Same installation, planned again for an uninstall that has not
    // reached it yet.
    let mut mysql = seeded.get_job("mysql").ok_or("no mysql job")?.clone();
    mysql.action = "uninstall".into();
    mysql.status = Default::default();
    let mut wf = Workflow::new(
        "dev",
        "wordpress",
        WorkflowSpec {
            stages: vec![Stage {
                jobs: [(mysql.key.clone(), mysql)].into_iter().collect(),
            }],
            ..Default::default()
        },
    );
    storage.upsert_workflow(&ctx, &mut wf).await?;
    let wctx = ctx.with_workflow(wf.id.clone());

    let connstr = resolver
        .resolve(&wctx, &porter("db", "mysql", WiringKind::Outputs, "connstr"))
        .await?;
    assert_eq!(connstr.as_deref(), Some("mysql://db:3306"));

    let err = resolver
        .resolve(&wctx, &porter("x", "mysql", WiringKind::Outputs, "port"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutputNotReady);
    Ok(())
}

#[tokio::test]
async fn porter_wiring_reads_parent_parameters_and_credentials() -> TestResult {
    init_tracing();
    let (resolver, storage, _) = resolver();
    let ctx = Context::default();
    let wf = seeded_workflow(&storage, &ctx).await?;
    let wctx = ctx.with_workflow(wf.id.clone());

    let tier = resolver
        .resolve(&wctx, &porter("tier", "root", WiringKind::Parameters, "tier"))
        .await?;
    assert_eq!(tier.as_deref(), Some("gold"));

    let region = resolver
        .resolve(&wctx, &porter("region", "root", WiringKind::Parameters, "region"))
        .await?;
    assert_eq!(region.as_deref(), Some("eu-west-1"));

    // An unwired parameter leaves the consumer's default in charge.
    let unwired = resolver
        .resolve(&wctx, &porter("size", "root", WiringKind::Parameters, "size"))
        .await?;
    assert_eq!(unwired, None);

    let token = resolver
        .resolve(&wctx, &porter("token", "root", WiringKind::Credentials, "token"))
        .await?;
    assert_eq!(token.as_deref(), Some("abc123"));

    let err = resolver
        .resolve(&wctx, &porter("kube", "root", WiringKind::Credentials, "kubeconfig"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MissingSource);
    Ok(())
}

#[tokio::test]
async fn porter_wiring_needs_a_known_workflow_and_job() -> TestResult {
    init_tracing();
    let (resolver, storage, _) = resolver();
    let ctx = Context::default();
    let wf = seeded_workflow(&storage, &ctx).await?;

    // No workflow on the context for the placeholder.
    let err = resolver
        .resolve(&ctx, &porter("db", "mysql", WiringKind::Outputs, "connstr"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidReference);

    let wctx = ctx.with_workflow(wf.id.clone());
    let err = resolver
        .resolve(&wctx, &porter("db", "postgres", WiringKind::Outputs, "connstr"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidReference);

    // A concrete workflow id works without a context workflow.
    let explicit = SecretStrategy::new(
        "db",
        Source::new("porter", format!("workflow.{}.jobs.mysql.outputs.connstr", wf.id)),
    );
    assert_eq!(
        resolver.resolve(&ctx, &explicit).await?.as_deref(),
        Some("mysql://db:3306")
    );
    Ok(())
}

#[tokio::test]
async fn cancelled_context_stops_resolution() {
    init_tracing();
    let (resolver, _, _) = resolver();
    let ctx = Context::default();
    ctx.cancel();
    let err = resolver
        .resolve(&ctx, &SecretStrategy::value("a", "1"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Canceled);
}
