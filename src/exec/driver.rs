//! Runtime drivers: the things that actually run a bundle action.
//!
//! `debug` is built in. Any other name `NAME` is the executable
//! `cnab-NAME` on `PATH`, which receives the action arguments as JSON on
//! stdin, runs in a directory holding the bundle's `.cnab/` tree and writes
//! one file per output into `$CNAB_OUTPUTS_DIR`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::bundle::definition::Bundle;
use crate::bundle::RelocationMap;
use crate::context::Context;
use crate::errors::{BundleError, Result};
use crate::fs;

pub const DRIVER_DEBUG: &str = "debug";
pub const DRIVER_EXECUTABLE_PREFIX: &str = "cnab-";
pub const OUTPUTS_DIR_ENV: &str = "CNAB_OUTPUTS_DIR";

/// Bytes of stderr kept for error messages.
pub const STDERR_TAIL_BYTES: usize = 1024;

/// Everything a driver needs to run one action.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionArguments {
    pub namespace: String,
    pub installation: String,
    pub run_id: String,
    pub action: String,
    pub bundle: Bundle,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle_path: Option<PathBuf>,
    pub params: BTreeMap<String, Value>,
    pub credentials: BTreeMap<String, String>,
    pub driver: String,
    pub relocation_map: RelocationMap,
    pub allow_docker_host_access: bool,
}

impl std::fmt::Debug for ActionArguments {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionArguments")
            .field("namespace", &self.namespace)
            .field("installation", &self.installation)
            .field("run_id", &self.run_id)
            .field("action", &self.action)
            .field("bundle", &self.bundle.name)
            .field("params", &self.params.keys().collect::<Vec<_>>())
            .field("credentials", &self.credentials.keys().collect::<Vec<_>>())
            .field("driver", &self.driver)
            .finish_non_exhaustive()
    }
}

/// What a driver hands back once the action has stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverOutput {
    pub exit_code: i32,
    /// Output name -> raw bytes as written by the bundle.
    pub outputs: BTreeMap<String, Vec<u8>>,
    /// Combined log stream of the action.
    pub logs: String,
    pub stderr_tail: String,
}

impl DriverOutput {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }

    /// `DriverFailed` for a non-zero exit.
    pub fn error(&self) -> Option<BundleError> {
        (!self.succeeded()).then(|| BundleError::DriverFailed {
            code: self.exit_code,
            stderr_tail: self.stderr_tail.clone(),
        })
    }
}

#[async_trait]
pub trait RuntimeDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Run the action. Must stop promptly once `ctx` is cancelled and
    /// report `Canceled`.
    async fn run(&self, ctx: &Context, args: &ActionArguments) -> Result<DriverOutput>;
}

/// Logs the arguments and succeeds without producing outputs.
#[derive(Debug, Default, Clone, Copy)]
pub struct DebugDriver;

#[async_trait]
impl RuntimeDriver for DebugDriver {
    fn name(&self) -> &str {
        DRIVER_DEBUG
    }

    async fn run(&self, ctx: &Context, args: &ActionArguments) -> Result<DriverOutput> {
        ctx.check("debug driver")?;
        info!(
            namespace = %args.namespace,
            installation = %args.installation,
            run_id = %args.run_id,
            action = %args.action,
            bundle = %args.bundle.name,
            version = %args.bundle.version,
            "debug driver invoked"
        );
        for (name, value) in &args.params {
            if args.bundle.is_sensitive_parameter(name) {
                debug!(parameter = %name, "******");
            } else {
                debug!(parameter = %name, %value);
            }
        }
        for name in args.credentials.keys() {
            debug!(credential = %name, "******");
        }
        Ok(DriverOutput::success())
    }
}

/// Runs `cnab-NAME` as a child process.
#[derive(Debug, Clone)]
pub struct CommandDriver {
    name: String,
    program: PathBuf,
}

impl CommandDriver {
    /// Find `cnab-NAME` on `PATH`.
    pub fn locate(name: &str) -> Result<Self> {
        let exe = format!("{DRIVER_EXECUTABLE_PREFIX}{name}");
        let program = which::which(&exe).map_err(|e| {
            BundleError::not_found(format!("runtime driver {name:?}: {exe} is not on PATH ({e})"))
        })?;
        Ok(Self::new(name, program))
    }

    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
        }
    }
}

#[async_trait]
impl RuntimeDriver for CommandDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &Context, args: &ActionArguments) -> Result<DriverOutput> {
        let work = tempfile::Builder::new().prefix("bundlectl-run-").tempdir()?;
        let cnab_dir = work.path().join(".cnab");
        let outputs_dir = work.path().join("outputs");
        fs::create_private_dir(&cnab_dir)?;
        fs::create_private_dir(&outputs_dir)?;
        fs::write_private(&cnab_dir.join("bundle.json"), &args.bundle.to_json()?)?;
        fs::write_private(
            &cnab_dir.join("relocation-mapping.json"),
            &serde_json::to_vec_pretty(&args.relocation_map)?,
        )?;

        info!(
            driver = %self.name,
            program = %self.program.display(),
            installation = %args.installation,
            run_id = %args.run_id,
            action = %args.action,
            "starting driver process"
        );

        let mut child = Command::new(&self.program)
            .current_dir(work.path())
            .env(OUTPUTS_DIR_ENV, &outputs_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BundleError::Other(anyhow::anyhow!(
                    "spawning driver {}: {e}",
                    self.program.display()
                ))
            })?;

        let logs = Arc::new(Mutex::new(LogCapture::default()));
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            let logs = Arc::clone(&logs);
            let run_id = args.run_id.clone();
            readers.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(%run_id, "stdout: {}", line);
                    if let Ok(mut capture) = logs.lock() {
                        capture.push(&line, false);
                    }
                }
            }));
        }
        if let Some(stderr) = child.stderr.take() {
            let logs = Arc::clone(&logs);
            let run_id = args.run_id.clone();
            readers.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(%run_id, "stderr: {}", line);
                    if let Ok(mut capture) = logs.lock() {
                        capture.push(&line, true);
                    }
                }
            }));
        }

        if let Some(mut stdin) = child.stdin.take() {
            let payload = serde_json::to_vec(args)?;
            let written = async {
                stdin.write_all(&payload).await?;
                stdin.shutdown().await
            };
            if let Err(e) = written.await {
                // The driver may exit without reading its arguments.
                warn!(driver = %self.name, error = %e, "could not write action arguments");
            }
        }

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = ctx.cancelled() => {
                warn!(driver = %self.name, run_id = %args.run_id, "cancelled, stopping driver process");
                if let Err(e) = child.start_kill() {
                    warn!(error = %e, "failed to signal driver process");
                }
                let _ = tokio::time::timeout(ctx.shutdown_timeout(), child.wait()).await;
                return Err(BundleError::Canceled(format!(
                    "{} of {} was cancelled",
                    args.action, args.installation
                )));
            }
        };
        for reader in readers {
            let _ = reader.await;
        }

        let code = status.code().unwrap_or(-1);
        info!(
            driver = %self.name,
            run_id = %args.run_id,
            exit_code = code,
            success = status.success(),
            "driver process exited"
        );

        let mut outputs = BTreeMap::new();
        for path in list_outputs(&outputs_dir)? {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            outputs.insert(name.to_string(), fs::read_existing(&path)?);
        }

        let capture = logs
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default();
        Ok(DriverOutput {
            exit_code: code,
            outputs,
            logs: capture.logs,
            stderr_tail: capture.stderr_tail,
        })
    }
}

fn list_outputs(dir: &std::path::Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[derive(Debug, Clone, Default)]
struct LogCapture {
    logs: String,
    stderr_tail: String,
}

impl LogCapture {
    fn push(&mut self, line: &str, stderr: bool) {
        self.logs.push_str(line);
        self.logs.push('\n');
        if stderr {
            self.stderr_tail.push_str(line);
            self.stderr_tail.push('\n');
            self.stderr_tail = tail(&self.stderr_tail, STDERR_TAIL_BYTES).to_string();
        }
    }
}

/// The last `max` bytes of `s`, cut on a char boundary.
pub fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

/// Named drivers plus the fallback lookup for `debug` and `cnab-NAME`.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    registered: BTreeMap<String, Arc<dyn RuntimeDriver>>,
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("registered", &self.registered.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, driver: Arc<dyn RuntimeDriver>) {
        self.registered.insert(driver.name().to_string(), driver);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn RuntimeDriver>> {
        if let Some(driver) = self.registered.get(name) {
            return Ok(Arc::clone(driver));
        }
        if name == DRIVER_DEBUG {
            return Ok(Arc::new(DebugDriver));
        }
        Ok(Arc::new(CommandDriver::locate(name)?))
    }
}

