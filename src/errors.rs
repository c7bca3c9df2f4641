//! Crate-wide error type, error kinds and exit-code classification.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BundleError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("cyclic dependency: {path}")]
    CyclicDependency { path: String },

    #[error("integrity error: {0}")]
    IntegrityError(String),

    #[error("driver failed with exit code {code}: {stderr_tail}")]
    DriverFailed { code: i32, stderr_tail: String },

    #[error("missing source: {0}")]
    MissingSource(String),

    #[error("output not ready: {0}")]
    OutputNotReady(String),

    #[error("invalid reference: {0}")]
    InvalidReference(String),

    #[error("invariant violated: {0}")]
    InvariantViolated(String),

    #[error("canceled: {0}")]
    Canceled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Coarse classification of a [`BundleError`], used by callers that branch
/// on the kind of failure rather than its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InvalidManifest,
    CyclicDependency,
    IntegrityError,
    DriverFailed,
    MissingSource,
    OutputNotReady,
    InvalidReference,
    InvariantViolated,
    Canceled,
    Io,
    Encoding,
    Other,
}

impl BundleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BundleError::NotFound(_) => ErrorKind::NotFound,
            BundleError::Conflict(_) => ErrorKind::Conflict,
            BundleError::InvalidManifest(_) => ErrorKind::InvalidManifest,
            BundleError::CyclicDependency { .. } => ErrorKind::CyclicDependency,
            BundleError::IntegrityError(_) => ErrorKind::IntegrityError,
            BundleError::DriverFailed { .. } => ErrorKind::DriverFailed,
            BundleError::MissingSource(_) => ErrorKind::MissingSource,
            BundleError::OutputNotReady(_) => ErrorKind::OutputNotReady,
            BundleError::InvalidReference(_) => ErrorKind::InvalidReference,
            BundleError::InvariantViolated(_) => ErrorKind::InvariantViolated,
            BundleError::Canceled(_) => ErrorKind::Canceled,
            BundleError::Io(_) => ErrorKind::Io,
            BundleError::Json(_) | BundleError::Toml(_) | BundleError::Yaml(_) => {
                ErrorKind::Encoding
            }
            BundleError::Other(_) => ErrorKind::Other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Process exit code for this error.
    ///
    /// `NotFound` and `Conflict` are non-fatal (3), a violated invariant is a
    /// bug (2), everything else is a plain failure (1).
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::NotFound | ErrorKind::Conflict => 3,
            ErrorKind::InvariantViolated => 2,
            _ => 1,
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        BundleError::NotFound(what.into())
    }

    pub fn invalid_manifest(msg: impl Into<String>) -> Self {
        BundleError::InvalidManifest(msg.into())
    }

    pub fn invalid_reference(msg: impl Into<String>) -> Self {
        BundleError::InvalidReference(msg.into())
    }

    /// Prefix the message with the installation it concerns, keeping the kind.
    pub fn for_installation(self, namespace: &str, name: &str) -> Self {
        let who = if namespace.is_empty() {
            name.to_string()
        } else {
            format!("{namespace}/{name}")
        };
        match self {
            BundleError::NotFound(m) => BundleError::NotFound(format!("{who}: {m}")),
            BundleError::Conflict(m) => BundleError::Conflict(format!("{who}: {m}")),
            BundleError::InvalidManifest(m) => {
                BundleError::InvalidManifest(format!("{who}: {m}"))
            }
            BundleError::MissingSource(m) => BundleError::MissingSource(format!("{who}: {m}")),
            BundleError::DriverFailed { code, stderr_tail } => BundleError::DriverFailed {
                code,
                stderr_tail: format!("{who}: {stderr_tail}"),
            },
            other => other,
        }
    }
}

/// Join several errors into a single `InvalidManifest`, listing every issue.
pub fn aggregate(errors: Vec<BundleError>) -> Option<BundleError> {
    match errors.len() {
        0 => None,
        1 => errors.into_iter().next(),
        n => {
            let mut msg = format!("{n} errors occurred:");
            for e in &errors {
                msg.push_str("\n\t* ");
                msg.push_str(&e.to_string());
            }
            Some(BundleError::InvalidManifest(msg))
        }
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, BundleError>;
