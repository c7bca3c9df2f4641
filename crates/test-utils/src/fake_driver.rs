use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bundlectl::context::Context;
use bundlectl::errors::{BundleError, Result};
use bundlectl::exec::{ActionArguments, DriverOutput, RuntimeDriver};

pub const FAKE_DRIVER: &str = "fake";

/// Scripted behaviour of one action.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub exit_code: i32,
    pub outputs: BTreeMap<String, Vec<u8>>,
    pub logs: String,
    pub stderr: String,
}

#[derive(Default)]
struct Inner {
    /// (installation, action) -> script; `None` matches every action.
    scripts: BTreeMap<(String, Option<String>), Script>,
    calls: Vec<ActionArguments>,
}

/// Runtime driver that never starts a container.
///
/// Records every invocation and answers with scripted outputs and exit
/// codes. Unscripted actions succeed with a one-line log.
#[derive(Clone, Default)]
pub struct FakeDriver {
    inner: Arc<Mutex<Inner>>,
    delay: Option<Duration>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long in every run, stopping early on cancellation.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Outputs produced by every action of `installation`.
    pub fn outputs(&self, installation: &str, outputs: &[(&str, &str)]) {
        let mut inner = self.inner.lock().unwrap();
        let script = inner
            .scripts
            .entry((installation.to_string(), None))
            .or_default();
        for (name, value) in outputs {
            script
                .outputs
                .insert(name.to_string(), value.as_bytes().to_vec());
        }
    }

    /// Make `action` on `installation` exit with `code`.
    pub fn fail(&self, installation: &str, action: &str, code: i32, stderr: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.scripts.insert(
            (installation.to_string(), Some(action.to_string())),
            Script {
                exit_code: code,
                stderr: stderr.to_string(),
                ..Default::default()
            },
        );
    }

    /// Remove scripts registered for `action` on `installation`.
    pub fn clear(&self, installation: &str, action: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .scripts
            .remove(&(installation.to_string(), Some(action.to_string())));
    }

    pub fn calls(&self) -> Vec<ActionArguments> {
        self.inner.lock().unwrap().calls.clone()
    }

    /// `(installation, action)` of every run, in call order.
    pub fn actions(&self) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .map(|a| (a.installation, a.action))
            .collect()
    }

    /// Installations an action ran against, in call order.
    pub fn installations(&self, action: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|a| a.action == action)
            .map(|a| a.installation)
            .collect()
    }

    fn script_for(&self, args: &ActionArguments) -> Script {
        let inner = self.inner.lock().unwrap();
        let specific = inner
            .scripts
            .get(&(args.installation.clone(), Some(args.action.clone())));
        let general = inner.scripts.get(&(args.installation.clone(), None));
        match (specific, general) {
            (Some(s), _) => s.clone(),
            (None, Some(s)) => s.clone(),
            (None, None) => Script::default(),
        }
    }
}

#[async_trait]
impl RuntimeDriver for FakeDriver {
    fn name(&self) -> &str {
        FAKE_DRIVER
    }

    async fn run(&self, ctx: &Context, args: &ActionArguments) -> Result<DriverOutput> {
        self.inner.lock().unwrap().calls.push(args.clone());
        tracing::info!(installation = %args.installation, action = %args.action, "fake driver: run");

        if let Some(delay) = self.delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = ctx.cancelled() => {
                    return Err(BundleError::Canceled(format!(
                        "{} of {} interrupted",
                        args.action, args.installation
                    )));
                }
            }
        }

        let script = self.script_for(args);
        let logs = if script.logs.is_empty() {
            format!("{} {}\n", args.action, args.installation)
        } else {
            script.logs
        };
        Ok(DriverOutput {
            exit_code: script.exit_code,
            outputs: script.outputs,
            logs,
            stderr_tail: script.stderr,
        })
    }
}
