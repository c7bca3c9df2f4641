//! Client for out-of-process secret plugins.
//!
//! A plugin is an executable named `bundlectl-plugin-<key>` on PATH. It is
//! started lazily on first use and speaks length-prefixed JSON frames over
//! stdio: a 4-byte big-endian length followed by that many bytes of JSON.
//! The first exchange negotiates the interface name and major version; any
//! skew fails the connection.

use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

use crate::context::Context;
use crate::errors::{BundleError, Result};
use crate::secrets::SecretStore;

pub const PLUGIN_EXECUTABLE_PREFIX: &str = "bundlectl-plugin-";
pub const SECRETS_INTERFACE: &str = "secrets";
pub const SECRETS_PROTOCOL_MAJOR: u64 = 1;

/// Frames larger than this are rejected rather than allocated.
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

#[derive(Debug, Serialize)]
struct Request<'a> {
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct Response {
    #[serde(default)]
    id: u64,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    code: String,
    message: String,
}

struct Connection {
    _child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    next_id: u64,
}

impl Connection {
    async fn call(&mut self, method: &str, params: Value) -> Result<Value> {
        self.next_id += 1;
        let id = self.next_id;
        let req = serde_json::to_vec(&Request { id, method, params })?;
        write_frame(&mut self.stdin, &req).await?;

        let resp: Response = serde_json::from_slice(&read_frame(&mut self.stdout).await?)?;
        if resp.id != id {
            return Err(BundleError::InvariantViolated(format!(
                "plugin answered request {} while {id} was pending",
                resp.id
            )));
        }
        if let Some(err) = resp.error {
            return Err(match err.code.as_str() {
                "not_found" => BundleError::NotFound(err.message),
                _ => BundleError::Other(anyhow::anyhow!("plugin error: {}", err.message)),
            });
        }
        Ok(resp.result.unwrap_or(Value::Null))
    }
}

async fn write_frame(w: &mut ChildStdin, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|l| *l <= MAX_FRAME_LEN)
        .ok_or_else(|| BundleError::invalid_reference("plugin request frame too large"))?;
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(payload).await?;
    w.flush().await?;
    Ok(())
}

async fn read_frame(r: &mut BufReader<ChildStdout>) -> Result<Vec<u8>> {
    let len = r.read_u32().await?;
    if len > MAX_FRAME_LEN {
        return Err(BundleError::IntegrityError(format!(
            "plugin frame of {len} bytes exceeds the limit"
        )));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Secret store backed by an external plugin process.
pub struct PluginSecretStore {
    key: String,
    config: Value,
    conn: OnceCell<Mutex<Connection>>,
}

impl std::fmt::Debug for PluginSecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginSecretStore")
            .field("key", &self.key)
            .field("connected", &self.conn.initialized())
            .finish()
    }
}

impl PluginSecretStore {
    pub fn new(key: impl Into<String>, config: Value) -> Self {
        Self {
            key: key.into(),
            config,
            conn: OnceCell::new(),
        }
    }

    pub fn executable(&self) -> String {
        format!("{PLUGIN_EXECUTABLE_PREFIX}{}", self.key)
    }

    async fn connection(&self) -> Result<&Mutex<Connection>> {
        self.conn
            .get_or_try_init(|| async { self.connect().await.map(Mutex::new) })
            .await
    }

    async fn connect(&self) -> Result<Connection> {
        let exe = which::which(self.executable()).map_err(|_| {
            BundleError::not_found(format!(
                "secrets plugin {:?}: {} is not on PATH",
                self.key,
                self.executable()
            ))
        })?;
        info!(plugin = %self.key, path = %exe.display(), "starting secrets plugin");

        let mut child = Command::new(&exe)
            .arg("run")
            .arg(SECRETS_INTERFACE)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BundleError::InvariantViolated("plugin stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BundleError::InvariantViolated("plugin stdout not captured".into()))?;

        let mut conn = Connection {
            _child: child,
            stdin,
            stdout: BufReader::new(stdout),
            next_id: 0,
        };

        let negotiated = conn
            .call(
                "negotiate",
                json!({
                    "interface": SECRETS_INTERFACE,
                    "version": format!("{SECRETS_PROTOCOL_MAJOR}.0"),
                    "config": self.config,
                }),
            )
            .await?;
        check_version(&self.key, &negotiated)?;
        debug!(plugin = %self.key, "secrets plugin connected");
        Ok(conn)
    }

    async fn call(&self, ctx: &Context, method: &str, params: Value) -> Result<Value> {
        let conn = self.connection().await?;
        let mut guard = conn.lock().await;
        tokio::select! {
            res = guard.call(method, params) => res,
            _ = ctx.cancelled() => Err(BundleError::Canceled(format!("secrets plugin {method}"))),
        }
    }
}

fn check_version(key: &str, negotiated: &Value) -> Result<()> {
    let version = negotiated
        .get("version")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let major = version
        .split('.')
        .next()
        .and_then(|m| m.parse::<u64>().ok());
    match major {
        Some(SECRETS_PROTOCOL_MAJOR) => Ok(()),
        _ => Err(BundleError::Conflict(format!(
            "secrets plugin {key:?} speaks protocol version {version:?}, expected {SECRETS_PROTOCOL_MAJOR}.x"
        ))),
    }
}

#[async_trait]
impl SecretStore for PluginSecretStore {
    async fn resolve(&self, ctx: &Context, key_name: &str, key_value: &str) -> Result<String> {
        let result = self
            .call(
                ctx,
                "resolve",
                json!({ "keyName": key_name, "keyValue": key_value }),
            )
            .await?;
        result.as_str().map(str::to_string).ok_or_else(|| {
            BundleError::IntegrityError(format!(
                "secrets plugin {:?} returned a non-string value for {key_value}",
                self.key
            ))
        })
    }

    async fn create(
        &self,
        ctx: &Context,
        key_name: &str,
        key_value: &str,
        value: &str,
    ) -> Result<()> {
        self.call(
            ctx,
            "create",
            json!({ "keyName": key_name, "keyValue": key_value, "value": value }),
        )
        .await?;
        Ok(())
    }
}
