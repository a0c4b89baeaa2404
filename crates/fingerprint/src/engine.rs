//! The fingerprinting and backup workflows.
//!
//! One engine instance drives all workflows against a filesystem port and an
//! observer. Each workflow runs on a single worker and opens its own catalog
//! connection, closed when the workflow ends; there is never more than one
//! writer.

mod backup;
mod encrypted;
mod scan;

#[cfg(test)]
pub(crate) mod testkit;

use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDateTime};
use regex::{Regex, RegexBuilder};

use crate::catalog::Catalog;
use crate::error::Result;
use crate::filesystem::{FileSystemPort, XATTR_ID};
use crate::observer::Observer;
use crate::stats::format_bytes;
use crate::types::{Backup, FileInfo};

/// Values the outer shell supplies; the core performs no config loading.
#[derive(Debug, Clone)]
pub struct Config {
    /// Application state folder housing the catalog database.
    pub database_folder: PathBuf,
    /// Scratch area used while producing encrypted backups.
    pub working_folder: PathBuf,
    /// Key file unlocking encrypted containers.
    pub key_file: PathBuf,
    /// Where encrypted containers get mounted during register/verify.
    pub encrypted_volumes_mount_folder: PathBuf,
}

/// Pluggable time source; tests substitute a fixed clock.
pub type Clock = Box<dyn Fn() -> NaiveDateTime>;

/// Orchestrates scan, register-backup, verify-backup and
/// produce-encrypted-backup.
pub struct Engine<F: FileSystemPort, O: Observer> {
    fs: F,
    observer: O,
    config: Config,
    clock: Clock,
}

impl<F: FileSystemPort, O: Observer> Engine<F, O> {
    pub fn new(fs: F, observer: O, config: Config) -> Self {
        Self {
            fs,
            observer,
            config,
            clock: Box::new(|| Local::now().naive_local()),
        }
    }

    /// Replaces the time source; tests use a fixed clock.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// All registered backups, ordered by label.
    pub fn backups(&self) -> Result<Vec<Backup>> {
        self.open_catalog()?.all_backups()
    }

    /// Currently mounted volumes, keeping those already registered as backups
    /// or those not yet registered depending on `registered`.
    pub fn mounted_backup_volumes(&self, registered: bool) -> Result<Vec<(PathBuf, String)>> {
        let catalog = self.open_catalog()?;
        let mut result = Vec::new();

        for mount_point in self.fs.mounted_volumes()? {
            let volume_name = mount_point
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            let backup = match self.fs.volume_uuid(&mount_point)? {
                Some(volume_id) => catalog.backup_by_volume_id(&volume_id)?,
                None => None,
            };

            match backup {
                Some(backup) if registered => result.push((mount_point, backup.label)),
                None if !registered => result.push((mount_point, volume_name)),
                _ => {}
            }
        }

        result.sort();
        Ok(result)
    }

    fn now(&self) -> NaiveDateTime {
        (self.clock)()
    }

    fn open_catalog(&self) -> Result<Catalog> {
        Catalog::open(&self.config.database_folder)
    }

    /// Enumerates and sorts the files to work on, reporting the count.
    fn count_files(&self, folders: &[PathBuf], filter: &Regex) -> Result<Vec<FileInfo>> {
        self.observer.counting();
        self.observer
            .message(&format!("Counting files in {}...", display_folders(folders)));

        let mut files = self.fs.enumerate(folders, filter)?;
        files.sort_by(|a, b| a.path.cmp(&b.path));

        self.observer.file_count(files.len());
        let total_size: u64 = files.iter().map(|file| file.size).sum();
        self.observer.message(&format!(
            "Found {} files ({})",
            files.len(),
            format_bytes(total_size)
        ));

        Ok(files)
    }

    /// Resolves a path to its file id: identity xattr first, then the
    /// basename lookup recovering files that lost the xattr.
    fn find_file_id(&self, catalog: &Catalog, path: &Path) -> Result<Option<String>> {
        if let Some(file_id) = self.fs.attribute(path, XATTR_ID)? {
            return Ok(Some(file_id));
        }

        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        catalog.file_id_by_name(&name)
    }
}

/// Builds the case-insensitive basename filter for an enumeration.
pub fn build_filter(pattern: &str) -> Result<Regex> {
    Ok(RegexBuilder::new(pattern).case_insensitive(true).build()?)
}

fn match_all() -> Regex {
    Regex::new(".*").expect("literal pattern")
}

fn display_folders(folders: &[PathBuf]) -> String {
    folders
        .iter()
        .map(|folder| folder.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn display_path(path: &Path) -> String {
    path.display().to_string()
}

/// A path made relative to the backup root, as stored in backup items.
fn relative_to(path: &Path, root: &Path) -> String {
    match path.strip_prefix(root) {
        Ok(relative) => relative.display().to_string(),
        Err(_) => path.display().to_string(),
    }
}
