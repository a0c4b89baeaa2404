//! Shared types for the fingerprinting engine and the backup catalog.

use std::path::PathBuf;

use chrono::NaiveDateTime;

/// Render/parse format for all user-visible and persisted timestamps.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One file found during enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// The filename (not the full path).
    pub name: String,
    /// The folder containing the file.
    pub folder: PathBuf,
    /// The full path.
    pub path: PathBuf,
    /// Content size in bytes.
    pub size: u64,
}

/// A registered backup volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backup {
    pub id: String,
    /// Mount point at registration time.
    pub base_path: PathBuf,
    /// Unique human-assigned name.
    pub label: String,
    /// Filesystem-assigned volume UUID.
    pub volume_id: String,
    /// Whether the items live inside an encrypted container.
    pub encrypted: bool,
    /// Volume creation time.
    pub creation_date: NaiveDateTime,
    pub registration_date: NaiveDateTime,
    /// Set only by a successful verification.
    pub latest_check_date: Option<NaiveDateTime>,
}

/// Outcome of hashing one file's content.
///
/// A failed read is still recorded in the catalog: the `error` sentinel takes
/// the place of the algorithm token and the OS error text the place of the
/// digest, so the integrity history keeps track of unreadable files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashResult {
    /// A successfully computed digest.
    Digest {
        /// Short lowercase token identifying the digest family.
        algorithm: String,
        /// Lowercase hex, no separators.
        value: String,
    },
    /// The file could not be read; carries the OS error text.
    Failed(String),
}

impl HashResult {
    /// The algorithm token as stored in the catalog (`"error"` for failures).
    pub fn algorithm(&self) -> &str {
        match self {
            Self::Digest { algorithm, .. } => algorithm,
            Self::Failed(_) => "error",
        }
    }

    /// The digest column value as stored in the catalog.
    pub fn value(&self) -> &str {
        match self {
            Self::Digest { value, .. } => value,
            Self::Failed(message) => message,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}
