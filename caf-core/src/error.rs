use std::path::PathBuf;

/// Errors surfaced by caf-core.
///
/// Per-file verification outcomes (mismatch, missing) are not errors; they are
/// collected into [`crate::verify::VerificationReport`]. Budget exhaustion is
/// not an error either: [`crate::budget::BudgetTracker::reserve`] returning
/// `false` is how a generation run ends.
#[derive(Debug, thiserror::Error)]
pub enum CafError {
    /// Malformed size or disk-usage specification.
    #[error("invalid size spec {spec:?}: {reason}")]
    InvalidSizeSpec { spec: String, reason: String },

    /// A generation request with no effective stopping condition.
    #[error("unbounded run: {0}")]
    UnboundedRun(&'static str),

    /// Verification requested on a directory without a manifest.
    #[error("no manifest found at {0}")]
    ManifestMissing(PathBuf),

    /// Generation would clobber an existing manifest.
    #[error("manifest already exists at {0} (pass --append to add to it)")]
    ManifestExists(PathBuf),

    /// Another process holds the manifest lock.
    #[error("manifest {0} is locked by another run")]
    ManifestLocked(PathBuf),

    /// A complete manifest line could not be parsed.
    #[error("corrupt manifest at line {line}: {reason}")]
    ManifestCorrupt { line: usize, reason: String },

    /// Writing one generated file failed.
    #[error("write failed for {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Every candidate name for a digest is already taken.
    #[error("duplicate content identity {0}")]
    DuplicateIdentity(String),

    /// Run metadata names a hash algorithm this build does not implement.
    #[error("unsupported hash algorithm {0:?}")]
    UnsupportedHash(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("run metadata: {0}")]
    Meta(#[from] serde_json::Error),

    #[error("worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

impl CafError {
    pub(crate) fn size_spec(spec: &str, reason: impl Into<String>) -> Self {
        CafError::InvalidSizeSpec { spec: spec.to_string(), reason: reason.into() }
    }

    /// Structural errors abort a whole run; everything else is scoped to one file.
    pub fn is_structural(&self) -> bool {
        !matches!(self, CafError::Write { .. } | CafError::DuplicateIdentity(_))
    }
}

pub type Result<T> = std::result::Result<T, CafError>;
