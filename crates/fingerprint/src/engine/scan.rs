//! The scan workflow: identity assignment and fingerprint history updates.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use regex::Regex;

use super::{build_filter, display_path, Engine};
use crate::catalog::{self, Catalog};
use crate::error::Result;
use crate::filesystem::{
    FileSystemPort, XATTR_FINGERPRINT, XATTR_FINGERPRINT_TIMESTAMP, XATTR_ID,
};
use crate::observer::Observer;
use crate::stats::format_bytes;
use crate::types::{HashResult, TIMESTAMP_FORMAT};

impl<F: FileSystemPort, O: Observer> Engine<F, O> {
    /// Scans a folder: assigns identities, computes fingerprints, records
    /// them in the catalog and mirrors them into xattrs, detecting moves and
    /// content mismatches on the way.
    ///
    /// With `only_new_files`, files that already carry an identity are
    /// skipped after being counted into the progress.
    pub fn scan(&self, folder: &Path, file_filter: &str, only_new_files: bool) -> Result<()> {
        let filter = build_filter(file_filter)?;
        let stats = self.fs.stats();
        stats.reset();

        let result = self
            .open_catalog()
            .and_then(|catalog| self.scan_files(&catalog, folder, &filter, only_new_files));

        stats.stop();
        let total_read = stats.total_read_bytes();
        let elapsed = stats.elapsed().as_secs_f64();
        let speed = total_read as f64 / elapsed.max(f64::EPSILON);
        self.observer.message(&format!(
            "{} files ({}) processed in {} seconds ({}/sec)",
            stats.files_processed(),
            format_bytes(total_read),
            elapsed.round() as u64,
            format_bytes(speed as u64)
        ));
        self.observer.message(&format!(
            "{} in plain I/O, {} in memory mapped I/O",
            format_bytes(stats.direct_read_bytes()),
            format_bytes(stats.mapped_read_bytes())
        ));

        result
    }

    fn scan_files(
        &self,
        catalog: &Catalog,
        folder: &Path,
        filter: &Regex,
        only_new_files: bool,
    ) -> Result<()> {
        let files = self.count_files(&[folder.to_path_buf()], filter)?;
        let mut path_by_id: HashMap<String, PathBuf> = catalog.mappings()?.into_iter().collect();

        if only_new_files {
            self.observer.message("Scanning only new files");
        }

        let timestamp = self.now();
        let timestamp_text = timestamp.format(TIMESTAMP_FORMAT).to_string();
        let total_progress: u64 = files.iter().map(|file| file.size).sum();
        let mut current_progress = 0u64;

        for file in &files {
            let path = &file.path;
            let path_text = display_path(path);
            let previous_fingerprint = self.fs.attribute(path, XATTR_FINGERPRINT)?;

            let (file_id, known) = match self.fs.attribute(path, XATTR_ID)? {
                Some(file_id) => (file_id, true),
                None => match catalog.file_id_by_name(&file.name)? {
                    Some(file_id) => {
                        // The identity xattr was lost; re-bind it.
                        self.fs.set_attribute(path, XATTR_ID, &file_id)?;
                        (file_id, true)
                    }
                    None => {
                        let file_id = catalog::generate_id();
                        self.fs.set_attribute(path, XATTR_ID, &file_id)?;
                        catalog.add_file(&file_id, path, true)?;
                        path_by_id.insert(file_id.clone(), path.clone());
                        (file_id, false)
                    }
                },
            };

            if known {
                if only_new_files {
                    self.observer.file(&path_text, false);
                    current_progress += file.size;
                    self.observer.progress(current_progress, total_progress);
                    continue;
                }

                match path_by_id.get(&file_id) {
                    Some(previous_path) if previous_path != path => {
                        self.observer
                            .file_moved(&display_path(previous_path), &path_text);
                        catalog.update_file_path(&file_id, path, true)?;
                        path_by_id.insert(file_id.clone(), path.clone());
                    }
                    Some(_) => {}
                    None => {
                        // Identity xattr present but unknown to the catalog
                        // (e.g. a copy restored from a backup): re-insert the
                        // mapping to keep xattr and catalog in sync.
                        catalog.add_file(&file_id, path, true)?;
                        path_by_id.insert(file_id.clone(), path.clone());
                    }
                }
            }

            let result = self.fs.compute_fingerprint(path);
            catalog.add_fingerprint(
                &file_id,
                &file.name,
                result.algorithm(),
                result.value(),
                timestamp,
                true,
            )?;

            match &result {
                HashResult::Failed(message) => {
                    self.observer
                        .error(&format!("Error for {path_text}: {message}"));
                }
                HashResult::Digest { value, .. } => {
                    self.fs.set_attribute(path, XATTR_FINGERPRINT, value)?;
                    self.fs
                        .set_attribute(path, XATTR_FINGERPRINT_TIMESTAMP, &timestamp_text)?;
                    self.observer
                        .file(&path_text, previous_fingerprint.is_none());

                    if let Some(previous) = &previous_fingerprint {
                        if previous != value {
                            self.observer.error(&format!(
                                "Mismatch for {path_text}: found {value} expected {previous}"
                            ));
                        }
                    }
                }
            }

            current_progress += file.size;
            self.observer.progress(current_progress, total_progress);
        }

        Ok(())
    }
}
