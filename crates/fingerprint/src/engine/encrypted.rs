//! Production of encrypted backups: container creation, staging, optical
//! image assembly, burn and post-burn registration.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

use regex::Regex;

use super::Engine;
use crate::error::{FingerprintError, Result};
use crate::filesystem::{FileSystemPort, ENCRYPTED_CONTAINER_SUFFIX, VOLUMES_FOLDER};
use crate::observer::Observer;
use crate::stats::format_bytes;

/// How long to wait between checks for the burned medium to mount.
const MOUNT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Per-file filesystem overhead budgeted inside the container.
const PER_FILE_OVERHEAD: u64 = 10 * 1024;

/// Container size for a payload: 2% slack plus per-file overhead. There is
/// no pre-flight check that the target medium fits.
fn container_size(total_size: u64, file_count: usize) -> u64 {
    ((total_size + file_count as u64 * PER_FILE_OVERHEAD) as f64 * 1.02).round() as u64
}

impl<F: FileSystemPort, O: Observer> Engine<F, O> {
    /// Stages the given folders into a fresh encrypted container, wraps it
    /// into a hybrid optical image and optionally burns it, registering and
    /// verifying the burned medium afterwards.
    ///
    /// Failures are reported through the observer; in `burn` mode the
    /// working area is cleaned whatever the outcome.
    pub fn create_encrypted_backup(
        &self,
        backup_name: &str,
        algorithm: &str,
        hash_algorithm: &str,
        folders: &[PathBuf],
        burn: bool,
    ) -> Result<()> {
        let result = self.build_encrypted_backup(backup_name, algorithm, hash_algorithm, folders, burn);

        if let Err(e) = result {
            self.observer.error(&format!("Procedure failed: {e}"));
        }

        if burn {
            let working_folder = &self.config.working_folder;
            self.observer.message(&format!(
                "Cleaning up working area ({})...",
                working_folder.display()
            ));

            if let Err(e) = self.fs.remove_tree(working_folder) {
                self.observer
                    .error(&format!("Cleaning up the working area failed: {e}"));
            }
        }

        Ok(())
    }

    fn build_encrypted_backup(
        &self,
        backup_name: &str,
        algorithm: &str,
        hash_algorithm: &str,
        folders: &[PathBuf],
        burn: bool,
    ) -> Result<()> {
        let working_folder = &self.config.working_folder;
        let image_folder = working_folder.join(format!("{backup_name}_contents"));
        let image_file =
            image_folder.join(format!("{backup_name}{ENCRYPTED_CONTAINER_SUFFIX}"));
        let container_mount = Path::new(VOLUMES_FOLDER).join(backup_name);
        let optical_image = working_folder.join(backup_name);
        let optical_image_with_ext = working_folder.join(format!("{backup_name}.dmg"));
        let key_file = &self.config.key_file;

        let files = self.count_files(folders, &super::match_all())?;
        let total_size: u64 = files.iter().map(|file| file.size).sum();
        let size = container_size(total_size, files.len());

        self.observer.message(&format!(
            "Cleaning up working area ({})...",
            working_folder.display()
        ));
        self.fs.remove_tree(working_folder)?;
        self.fs.make_dirs(&image_folder)?;
        self.fs.create_encrypted_image(
            algorithm,
            hash_algorithm,
            key_file,
            size,
            &image_file,
            &mut |line| self.veracrypt_output(line),
        )?;
        self.observer.message(&format!(
            "Veracrypt image size is {}",
            format_bytes(self.fs.size(&image_file)?)
        ));

        self.observer.message("Mounting encrypted image...");
        self.fs
            .mount_encrypted(&image_file, &container_mount, key_file)?;
        let mut staged = StagingGuard {
            fs: &self.fs,
            mount_point: Some(container_mount.clone()),
        };

        self.observer.message("Copying files...");
        self.observer.secondary_progress(0.0);
        let mut copied = 0u64;

        for file in &files {
            let parent = folders
                .iter()
                .find(|folder| file.folder.starts_with(folder))
                .and_then(|folder| folder.file_name())
                .ok_or_else(|| {
                    FingerprintError::Consistency(format!(
                        "{} belongs to no source folder",
                        file.path.display()
                    ))
                })?;
            let target_folder = container_mount.join(parent);
            self.fs.make_dirs(&target_folder)?;
            self.observer.file(&file.name, false);
            self.fs
                .copy_with_attributes(&file.path, &target_folder.join(&file.name))?;
            copied += file.size;
            self.observer
                .secondary_progress(copied as f64 / total_size.max(1) as f64);
        }

        self.observer.message("Unmounting encrypted image...");
        self.fs.unmount_encrypted(&container_mount)?;
        staged.disarm();

        self.fs
            .build_hybrid_image(backup_name, &optical_image, &image_folder)?;
        self.observer.message(&format!(
            "Burn image size is {}",
            format_bytes(self.fs.size(&optical_image_with_ext)?)
        ));

        if burn {
            let optical_mount = Path::new(VOLUMES_FOLDER).join(backup_name);
            self.fs
                .burn(&optical_image_with_ext, &mut |line| self.drutil_output(line))?;

            while !self.fs.exists(&optical_mount) {
                self.observer
                    .message("Optical disk not mounted, please close the tray.");
                thread::sleep(MOUNT_POLL_INTERVAL);
            }

            self.register_backup(backup_name, &optical_mount, false)?;
            self.verify_backup(&optical_mount, false)?;
            self.fs.detach(&optical_mount)?;
            self.fs.eject(&optical_mount)?;
        }

        Ok(())
    }

    /// Routes VeraCrypt's repainted progress output to the observer.
    fn veracrypt_output(&self, line: &str) {
        static PROGRESS: OnceLock<Regex> = OnceLock::new();
        static SPURIOUS: OnceLock<Regex> = OnceLock::new();
        let progress_pattern = PROGRESS.get_or_init(|| {
            Regex::new("Done: *([0-9.]+)% *Speed: *([0-9].+) *MiB/s *Left: *([0-9]+) *(s|minutes)")
                .expect("literal pattern")
        });
        let spurious_pattern = SPURIOUS.get_or_init(|| {
            Regex::new("Done: *([0-9.-]+)% *Speed: *Left:$").expect("literal pattern")
        });

        let line = line.trim();

        if spurious_pattern.is_match(line) {
            return;
        }

        let percent = progress_pattern
            .captures(line)
            .and_then(|captures| captures[1].parse::<f64>().ok());

        if let Some(percent) = percent {
            self.observer.secondary_progress(percent / 100.0);
        }

        if !line.is_empty() {
            if line.contains("Error") {
                self.observer.error(line);
            } else if percent.is_none() {
                self.observer.message(line);
            }

            self.observer.file(line, false);
        }
    }

    /// Routes drutil's burn progress output to the observer.
    fn drutil_output(&self, line: &str) {
        static PROGRESS: OnceLock<Regex> = OnceLock::new();
        static ANY_PERCENT: OnceLock<Regex> = OnceLock::new();
        let progress_pattern = PROGRESS
            .get_or_init(|| Regex::new("^.*] ([0-9]+)%.*$").expect("literal pattern"));
        let any_percent_pattern = ANY_PERCENT
            .get_or_init(|| Regex::new("^.*([0-9]+)%.*$").expect("literal pattern"));

        let line = line.trim();

        if line.is_empty() {
            return;
        }

        if let Some(captures) = progress_pattern.captures(line) {
            if let Ok(percent) = captures[1].parse::<f64>() {
                self.observer.secondary_progress(percent / 100.0);
            }
        } else if line.contains("Closing") {
            self.observer.message("Finalising...");
        } else if !any_percent_pattern.is_match(line) {
            self.observer.message(line);
        }
    }
}

/// Unmounts the staging container if the workflow bails out mid-copy.
struct StagingGuard<'a, F: FileSystemPort> {
    fs: &'a F,
    mount_point: Option<PathBuf>,
}

impl<F: FileSystemPort> StagingGuard<'_, F> {
    fn disarm(&mut self) {
        self.mount_point = None;
    }
}

impl<F: FileSystemPort> Drop for StagingGuard<'_, F> {
    fn drop(&mut self) {
        if let Some(mount_point) = self.mount_point.take() {
            if let Err(e) = self.fs.unmount_encrypted(&mount_point) {
                log::debug!("unmounting {} failed: {e}", mount_point.display());
            }
        }
    }
}
