use std::fs;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum FingerprintError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("catalog error: {0}")]
    Catalog(#[from] rusqlite::Error),

    #[error("consistency violation: {0}")]
    Consistency(String),

    #[error("invalid filter pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("process exited with code {0}")]
    Subprocess(i32),

    #[error("no volume UUID for {0}")]
    NoVolumeUuid(PathBuf),

    #[error("invalid timestamp: {0}")]
    Timestamp(String),
}

pub type Result<T> = std::result::Result<T, FingerprintError>;

/// Canonicalizes a path, returning the original if canonicalization fails.
pub fn canonicalize_existing_path(path: PathBuf) -> PathBuf {
    fs::canonicalize(&path).unwrap_or(path)
}
