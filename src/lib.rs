pub mod app;
pub mod bundle;
pub mod cli;
pub mod config;
pub mod context;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod fs;
pub mod logging;
pub mod output;
pub mod patterns;
pub mod reconcile;
pub mod resolver;
pub mod secrets;
pub mod storage;
pub mod types;
pub mod workflow;

use std::io::Write as _;
use std::path::Path;

use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::app::{App, ApplyOptions, InstallationChanges};
use crate::cli::{
    ActionFlags, BundleFlags, CliArgs, Command, InstallationCommand, SetCommand, StorageCommand,
    WorkflowCommand,
};
use crate::config::{Config, Home};
use crate::context::Context;
use crate::errors::{BundleError, Result};
use crate::exec::ExecuteOptions;
use crate::exec::parameters::parse_overrides;
use crate::resolver::ResolveOptions;
use crate::storage::documents::{CredentialSet, InstallationSpec, ParameterSet};
use crate::types::OutputFormat;

/// High-level entry point used by `main.rs`.
///
/// Opens the configured storage, secrets and registry under `home` and
/// dispatches the parsed command.
pub async fn run(ctx: Context, home: Home, config: Config, args: CliArgs) -> Result<()> {
    let format: OutputFormat = args.output.into();
    let app = App::open(home, config)?;
    let ns = app.namespace_or_default(args.namespace.as_deref()).to_string();
    debug!(namespace = %ns, home = %app.home().root().display(), "dispatching command");

    match args.command {
        Command::Install(a) => {
            let mut spec = InstallationSpec::new(ns.as_str(), a.name.as_str());
            changes(&a.bundle)?.apply_to(&mut spec)?;
            if spec.bundle.is_empty() && spec.bundle_dir.is_none() {
                return Err(BundleError::invalid_manifest(
                    "install needs --reference or --dir",
                ));
            }
            let opts = apply_options(&a.action, a.force)?;
            let wf = app.install(&ctx, spec, &opts).await?;
            output::print(format, &wf, |out| output::workflow(out, &wf))?;
        }
        Command::Upgrade(a) => {
            let mut opts = apply_options(&a.action, false)?;
            opts.exec.force = a.force;
            let wf = app
                .upgrade(&ctx, &ns, &a.name, &changes(&a.bundle)?, &opts)
                .await?;
            output::print(format, &wf, |out| output::workflow(out, &wf))?;
        }
        Command::Invoke(a) => {
            let mut opts = apply_options(&a.flags, false)?;
            opts.exec.force = a.force;
            let record = app.invoke(&ctx, &ns, &a.name, &a.action, &opts).await?;
            info!(run_id = %record.run.id, status = %record.status(), "action finished");
            output::print(format, &record.result, |out| {
                writeln!(out, "{} {}: {}", a.action, a.name, record.status())
            })?;
        }
        Command::Uninstall(a) => {
            let mut opts = apply_options(&a.action, false)?;
            opts.exec.force = a.force;
            opts.exec.delete = a.delete;
            opts.exec.force_delete = a.force_delete;
            let wf = app.uninstall(&ctx, &ns, &a.name, &opts).await?;
            output::print(format, &wf, |out| output::workflow(out, &wf))?;
        }
        Command::Installation(cmd) => installation(&ctx, &app, &ns, format, cmd).await?,
        Command::Workflow(cmd) => workflow(&ctx, &app, &ns, format, cmd).await?,
        Command::Parameters(cmd) => parameter_sets(&ctx, &app, &ns, format, cmd).await?,
        Command::Credentials(cmd) => credential_sets(&ctx, &app, &ns, format, cmd).await?,
        Command::Storage(StorageCommand::Migrate) => {
            let log = app.migrate(&ctx).await?;
            println!("migration log: {}", log.display());
        }
    }
    Ok(())
}

async fn installation(
    ctx: &Context,
    app: &App,
    ns: &str,
    format: OutputFormat,
    cmd: InstallationCommand,
) -> Result<()> {
    match cmd {
        InstallationCommand::Apply {
            file,
            dry_run,
            force,
            action,
        } => {
            let mut spec: InstallationSpec = read_document(&file)?;
            if spec.namespace.is_empty() {
                spec.namespace = ns.to_string();
            }
            let opts = apply_options(&action, force)?;
            if dry_run {
                let plan = app.apply_dry_run(ctx, spec, &opts).await?;
                output::print(format, &plan, |out| output::plan(out, &plan))
            } else {
                let wf = app.apply(ctx, spec, &opts).await?;
                output::print(format, &wf, |out| output::workflow(out, &wf))
            }
        }
        InstallationCommand::List { all_namespaces } => {
            let items = app
                .list_installations(ctx, (!all_namespaces).then_some(ns))
                .await?;
            output::print(format, &items, |out| output::installations(out, &items))
        }
        InstallationCommand::Show { name } => {
            let inst = app.show_installation(ctx, ns, &name).await?;
            output::print(format, &inst, |out| output::installation(out, &inst))
        }
        InstallationCommand::Runs { name } => {
            let runs = app.list_runs(ctx, ns, &name).await?;
            output::print(format, &runs, |out| output::runs(out, &runs))
        }
        InstallationCommand::Outputs { name, show_secrets } => {
            let outputs = app.list_outputs(ctx, ns, &name, show_secrets).await?;
            output::print(format, &outputs, |out| output::outputs(out, &outputs))
        }
        InstallationCommand::Output { name, output: wanted } => {
            let value = app.read_output(ctx, ns, &name, &wanted).await?.value_string();
            output::print(format, &value, |out| writeln!(out, "{value}"))
        }
        InstallationCommand::Logs { name } => {
            let logs = app.show_logs(ctx, ns, &name).await?;
            output::print(format, &logs, |out| out.write_all(logs.as_bytes()))
        }
    }
}

async fn workflow(
    ctx: &Context,
    app: &App,
    ns: &str,
    format: OutputFormat,
    cmd: WorkflowCommand,
) -> Result<()> {
    let wf = match cmd {
        WorkflowCommand::List { all_namespaces } => {
            let items = app
                .list_workflows(ctx, (!all_namespaces).then_some(ns))
                .await?;
            return output::print(format, &items, |out| output::workflows(out, &items));
        }
        WorkflowCommand::Show { id } => app.show_workflow(ctx, &id).await?,
        WorkflowCommand::Retry { id, action } => {
            app.retry_workflow(ctx, &id, &execute_options(&action)?).await?
        }
        WorkflowCommand::Cancel { id } => app.cancel_workflow(ctx, &id).await?,
        WorkflowCommand::Step { id, job, action } => {
            app.step_workflow(ctx, &id, &job, &execute_options(&action)?)
                .await?
        }
    };
    output::print(format, &wf, |out| output::workflow(out, &wf))
}

async fn parameter_sets(
    ctx: &Context,
    app: &App,
    ns: &str,
    format: OutputFormat,
    cmd: SetCommand,
) -> Result<()> {
    match cmd {
        SetCommand::Apply { file } => {
            let mut set: ParameterSet = read_document(&file)?;
            if set.namespace.is_empty() {
                set.namespace = ns.to_string();
            }
            let set = app.apply_parameter_set(ctx, set).await?;
            info!(namespace = %set.namespace, name = %set.name, "applied parameter set");
            Ok(())
        }
        SetCommand::List { all_namespaces } => {
            let items = app
                .list_parameter_sets(ctx, (!all_namespaces).then_some(ns))
                .await?;
            output::print(format, &items, |out| output::parameter_sets(out, &items))
        }
        SetCommand::Show { name } => {
            let set = app.show_parameter_set(ctx, ns, &name).await?;
            output::print(format, &set, |out| output::strategies(out, &set.parameters))
        }
        SetCommand::Delete { name } => app.remove_parameter_set(ctx, ns, &name).await,
    }
}

async fn credential_sets(
    ctx: &Context,
    app: &App,
    ns: &str,
    format: OutputFormat,
    cmd: SetCommand,
) -> Result<()> {
    match cmd {
        SetCommand::Apply { file } => {
            let mut set: CredentialSet = read_document(&file)?;
            if set.namespace.is_empty() {
                set.namespace = ns.to_string();
            }
            let set = app.apply_credential_set(ctx, set).await?;
            info!(namespace = %set.namespace, name = %set.name, "applied credential set");
            Ok(())
        }
        SetCommand::List { all_namespaces } => {
            let items = app
                .list_credential_sets(ctx, (!all_namespaces).then_some(ns))
                .await?;
            output::print(format, &items, |out| output::credential_sets(out, &items))
        }
        SetCommand::Show { name } => {
            let set = app.show_credential_set(ctx, ns, &name).await?;
            output::print(format, &set, |out| output::strategies(out, &set.credentials))
        }
        SetCommand::Delete { name } => app.remove_credential_set(ctx, ns, &name).await,
    }
}

/// Parse a YAML or JSON document; YAML is a superset so one parser serves
/// both.
pub fn read_document<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read_existing(path)?;
    Ok(serde_yaml::from_slice(&bytes)?)
}

fn changes(flags: &BundleFlags) -> Result<InstallationChanges> {
    Ok(InstallationChanges {
        reference: flags.reference.clone(),
        bundle_dir: flags.dir.clone(),
        parameter_sets: flags.parameter_sets.clone(),
        credential_sets: flags.credential_sets.clone(),
        labels: parse_overrides(&flags.labels)?,
    })
}

fn execute_options(flags: &ActionFlags) -> Result<ExecuteOptions> {
    Ok(ExecuteOptions {
        driver: flags.driver.clone(),
        params: parse_overrides(&flags.params)?,
        resolve: ResolveOptions {
            insecure: flags.insecure_registry,
            force: flags.force_pull,
        },
        allow_docker_host_access: flags.allow_docker_host_access,
        ..Default::default()
    })
}

fn apply_options(flags: &ActionFlags, force: bool) -> Result<ApplyOptions> {
    Ok(ApplyOptions {
        force,
        max_parallel: flags.max_parallel,
        debug_mode: flags.debug,
        exec: execute_options(flags)?,
    })
}
