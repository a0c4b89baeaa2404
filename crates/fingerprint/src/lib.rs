//! File fingerprinting and backup catalog library.
//!
//! This crate implements the core of a personal data-integrity manager:
//! - Stable per-file identities bound through extended attributes
//! - A durable history of content fingerprints in a relational catalog
//! - Registration and verification of cold-storage backup volumes,
//!   including encrypted container volumes burned to optical media

pub mod catalog;
pub mod engine;
pub mod error;
pub mod filesystem;
pub mod hasher;
pub mod namehint;
pub mod observer;
pub mod process;
pub mod stats;
pub mod types;

// Re-export main types
pub use catalog::Catalog;
pub use engine::{Config, Engine};
pub use error::{FingerprintError, Result};
pub use filesystem::{FileSystemPort, LocalFileSystem};
pub use observer::{NullObserver, Observer};
pub use stats::{format_bytes, Stats};
pub use types::{Backup, FileInfo, HashResult};
