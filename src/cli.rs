//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Command-line arguments for `bundlectl`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "bundlectl",
    version,
    about = "Install, upgrade and uninstall CNAB bundles and their dependencies.",
    long_about = None
)]
pub struct CliArgs {
    /// Home directory holding storage, secrets and the bundle cache.
    ///
    /// Default: `$BUNDLECTL_HOME`, or `~/.bundlectl`.
    #[arg(long, global = true, value_name = "DIR", env = "BUNDLECTL_HOME")]
    pub home: Option<PathBuf>,

    /// Namespace for unqualified names; defaults to the configured one.
    #[arg(long, short = 'n', global = true, value_name = "NS")]
    pub namespace: Option<String>,

    /// Output format for inspection commands.
    #[arg(long, short = 'o', global = true, value_enum, default_value = "plain")]
    pub output: Format,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `BUNDLECTL_LOG`, the configured verbosity or `info` is used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, ValueEnum)]
pub enum Format {
    #[default]
    Plain,
    Json,
    Yaml,
}

impl From<Format> for crate::types::OutputFormat {
    fn from(f: Format) -> Self {
        match f {
            Format::Plain => crate::types::OutputFormat::Plain,
            Format::Json => crate::types::OutputFormat::Json,
            Format::Yaml => crate::types::OutputFormat::Yaml,
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Install a bundle as a new installation.
    Install(InstallArgs),
    /// Upgrade an existing installation.
    Upgrade(UpgradeArgs),
    /// Run an action, usually a custom one, against an installation.
    Invoke(InvokeArgs),
    /// Uninstall an installation and its dependencies.
    Uninstall(UninstallArgs),
    /// Manage installations.
    #[command(subcommand, alias = "installations")]
    Installation(InstallationCommand),
    /// Inspect and control workflows.
    #[command(subcommand, alias = "workflows")]
    Workflow(WorkflowCommand),
    /// Manage named parameter sets.
    #[command(subcommand, alias = "parameter")]
    Parameters(SetCommand),
    /// Manage named credential sets.
    #[command(subcommand, alias = "credential")]
    Credentials(SetCommand),
    /// Storage maintenance.
    #[command(subcommand)]
    Storage(StorageCommand),
}

/// Options shared by every command that runs a bundle action.
#[derive(Debug, Clone, Default, Args)]
pub struct ActionFlags {
    /// Parameter override, NAME=VALUE. May be repeated.
    #[arg(long = "param", value_name = "NAME=VALUE")]
    pub params: Vec<String>,

    /// Runtime driver; defaults to the configured one.
    #[arg(long, value_name = "NAME")]
    pub driver: Option<String>,

    /// Allow the invocation image to use the host's Docker daemon.
    #[arg(long)]
    pub allow_docker_host_access: bool,

    /// Pull bundles from registries without TLS verification.
    #[arg(long)]
    pub insecure_registry: bool,

    /// Pull bundles again even when cached.
    #[arg(long)]
    pub force_pull: bool,

    /// Maximum concurrent jobs; defaults to the configured value.
    #[arg(long, value_name = "N")]
    pub max_parallel: Option<usize>,

    /// Run workflow jobs one at a time.
    #[arg(long)]
    pub debug: bool,
}

/// Where the bundle of an installation comes from.
#[derive(Debug, Clone, Default, Args)]
pub struct BundleFlags {
    /// Bundle reference, `[REGISTRY/]NAME[:TAG][@DIGEST]`.
    #[arg(long, short = 'r', value_name = "REF")]
    pub reference: Option<String>,

    /// Bundle directory containing `.cnab/bundle.json`.
    #[arg(long, value_name = "DIR", conflicts_with = "reference")]
    pub dir: Option<PathBuf>,

    /// Named parameter set. May be repeated; later sets win.
    #[arg(long = "parameter-set", short = 'p', value_name = "NAME")]
    pub parameter_sets: Vec<String>,

    /// Named credential set. May be repeated; later sets win.
    #[arg(long = "credential-set", short = 'c', value_name = "NAME")]
    pub credential_sets: Vec<String>,

    /// Label, KEY=VALUE. May be repeated.
    #[arg(long = "label", short = 'l', value_name = "KEY=VALUE")]
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Args)]
pub struct InstallArgs {
    pub name: String,
    #[command(flatten)]
    pub bundle: BundleFlags,
    #[command(flatten)]
    pub action: ActionFlags,
    /// Reinstall even when already installed.
    #[arg(long)]
    pub force: bool,
}

#[derive(Debug, Clone, Args)]
pub struct UpgradeArgs {
    pub name: String,
    #[command(flatten)]
    pub bundle: BundleFlags,
    #[command(flatten)]
    pub action: ActionFlags,
    /// Run even when another action appears to be in progress.
    #[arg(long)]
    pub force: bool,
}

#[derive(Debug, Clone, Args)]
pub struct InvokeArgs {
    pub name: String,
    /// Action to run.
    #[arg(long)]
    pub action: String,
    #[command(flatten)]
    pub flags: ActionFlags,
    /// Run even when another action appears to be in progress.
    #[arg(long)]
    pub force: bool,
}

#[derive(Debug, Clone, Args)]
pub struct UninstallArgs {
    pub name: String,
    #[command(flatten)]
    pub action: ActionFlags,
    /// Remove the installation record after a successful uninstall.
    #[arg(long)]
    pub delete: bool,
    /// Remove the installation record even when the uninstall fails.
    #[arg(long)]
    pub force_delete: bool,
    /// Run even when another action appears to be in progress.
    #[arg(long)]
    pub force: bool,
}

#[derive(Debug, Clone, Subcommand)]
pub enum InstallationCommand {
    /// Apply an installation document (YAML or JSON).
    Apply {
        file: PathBuf,
        /// Show what would run without running it.
        #[arg(long)]
        dry_run: bool,
        /// Upgrade even when the installation is in sync.
        #[arg(long)]
        force: bool,
        #[command(flatten)]
        action: ActionFlags,
    },
    /// List installations.
    #[command(alias = "ls")]
    List {
        /// List installations in every namespace.
        #[arg(long)]
        all_namespaces: bool,
    },
    /// Show one installation.
    Show { name: String },
    /// List the runs of an installation.
    Runs { name: String },
    /// List the latest outputs of an installation.
    Outputs {
        name: String,
        /// Show sensitive values.
        #[arg(long)]
        show_secrets: bool,
    },
    /// Print one output value.
    Output { name: String, output: String },
    /// Print the logs of the installation's last run.
    Logs { name: String },
}

#[derive(Debug, Clone, Subcommand)]
pub enum WorkflowCommand {
    /// List workflows.
    #[command(alias = "ls")]
    List {
        #[arg(long)]
        all_namespaces: bool,
    },
    /// Show a workflow and its jobs.
    Show { id: String },
    /// Run the failed jobs of a workflow again.
    Retry {
        id: String,
        #[command(flatten)]
        action: ActionFlags,
    },
    /// Stop a workflow from running further jobs.
    Cancel { id: String },
    /// Run a single job of a workflow.
    Step {
        id: String,
        job: String,
        #[command(flatten)]
        action: ActionFlags,
    },
}

#[derive(Debug, Clone, Subcommand)]
pub enum SetCommand {
    /// Create or replace a set from a file (YAML or JSON).
    Apply { file: PathBuf },
    /// List sets.
    #[command(alias = "ls")]
    List {
        #[arg(long)]
        all_namespaces: bool,
    },
    /// Show a set.
    Show { name: String },
    /// Delete a set.
    #[command(alias = "rm")]
    Delete { name: String },
}

#[derive(Debug, Clone, Subcommand)]
pub enum StorageCommand {
    /// Upgrade a home directory written by an older version.
    Migrate,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
