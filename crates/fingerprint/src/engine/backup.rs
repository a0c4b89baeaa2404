//! Backup registration and verification.

use std::path::{Path, PathBuf};

use super::{display_path, match_all, relative_to, Engine};
use crate::error::{FingerprintError, Result};
use crate::filesystem::{FileSystemPort, ENCRYPTED_CONTAINER_SUFFIX};
use crate::observer::Observer;
use crate::types::{HashResult, TIMESTAMP_FORMAT};

impl<F: FileSystemPort, O: Observer> Engine<F, O> {
    /// Registers the volume mounted at `mount_point` as a new backup.
    ///
    /// An encrypted backup (a single `.veracrypt` container at the volume
    /// root) is mounted first and indexed through its inner volume; the
    /// volume UUID is always the outer one. Duplicate volume ids or labels
    /// are reported and leave the catalog untouched.
    pub fn register_backup(
        &self,
        label: &str,
        mount_point: &Path,
        eject_after: bool,
    ) -> Result<()> {
        let container = self.mount_encrypted_backup(mount_point)?;
        let _guard = MountGuard::new(&self.fs, &self.observer, &container);
        let actual_root = container.actual_root(mount_point);

        let catalog = self.open_catalog()?;
        let volume_id = self
            .fs
            .volume_uuid(mount_point)?
            .ok_or_else(|| FingerprintError::NoVolumeUuid(mount_point.to_path_buf()))?;
        let creation_date = self.fs.creation_date(actual_root)?;
        self.observer.message(&format!(
            "Volume UUID {volume_id} created on {}",
            creation_date.format(TIMESTAMP_FORMAT)
        ));

        if catalog.backup_by_volume_id(&volume_id)?.is_some() {
            self.observer
                .error("Backup with the same volume id already registered");
            return Ok(());
        }

        if catalog.backup_by_label(label)?.is_some() {
            self.observer
                .error("Backup with the same label already registered");
            return Ok(());
        }

        let files = self.count_files(&[actual_root.to_path_buf()], &match_all())?;
        let registration_date = self.now();
        let backup_id = catalog.add_backup(
            actual_root,
            label,
            &volume_id,
            creation_date,
            registration_date,
            container.is_mounted(),
            false,
        )?;

        for (index, file) in files.iter().enumerate() {
            if let Some(file_id) = self.find_file_id(&catalog, &file.path)? {
                let relative_path = relative_to(&file.path, actual_root);
                catalog.add_backup_item(&backup_id, &file_id, &relative_path, false)?;
                self.observer.file(&relative_path, true);
            }

            self.observer.progress(index as u64 + 1, files.len() as u64);
        }

        catalog.commit()?;

        if eject_after {
            self.fs.eject(mount_point)?;
        }

        Ok(())
    }

    /// Verifies the backup mounted at `mount_point` against the catalog.
    ///
    /// Every resolvable file is re-hashed and compared against its latest
    /// recorded fingerprint; the observation is recorded against the backup
    /// item, building a per-medium history. Unresolvable files are skipped
    /// (the volume may carry foreign files); missing backup items are
    /// reported and re-inserted.
    pub fn verify_backup(&self, mount_point: &Path, eject_after: bool) -> Result<()> {
        let container = self.mount_encrypted_backup(mount_point)?;
        let _guard = MountGuard::new(&self.fs, &self.observer, &container);
        let actual_root = container.actual_root(mount_point);
        let fingerprint_timestamp = self.now();

        let catalog = self.open_catalog()?;
        let volume_id = self
            .fs
            .volume_uuid(mount_point)?
            .ok_or_else(|| FingerprintError::NoVolumeUuid(mount_point.to_path_buf()))?;

        let Some(backup) = catalog.backup_by_volume_id(&volume_id)? else {
            self.observer.error(&format!(
                "{} is not a registered backup",
                display_path(mount_point)
            ));
            return Ok(());
        };

        let files = self.count_files(&[actual_root.to_path_buf()], &match_all())?;
        let check_timestamp = self.now();
        let total_progress: u64 = files.iter().map(|file| file.size).sum();
        let mut current_progress = 0u64;

        for file in &files {
            let relative_path = relative_to(&file.path, actual_root);

            if let Some(file_id) = self.find_file_id(&catalog, &file.path)? {
                self.observer.file(&relative_path, false);
                let recorded = catalog.latest_fingerprint(&file_id)?;
                let result = self.fs.compute_fingerprint(&file.path);

                let item_id = match catalog.backup_item_id(&backup.id, &file_id)? {
                    Some(item_id) => item_id,
                    None => {
                        self.observer.error(&format!(
                            "File was not registered as part of the backup: {relative_path} - registering now"
                        ));
                        catalog.add_backup_item(&backup.id, &file_id, &relative_path, false)?
                    }
                };

                // Keyed to the backup item: one history per medium.
                catalog.add_fingerprint(
                    &item_id,
                    &file.name,
                    result.algorithm(),
                    result.value(),
                    fingerprint_timestamp,
                    false,
                )?;

                match &result {
                    HashResult::Failed(message) => {
                        self.observer
                            .error(&format!("Error for {relative_path}: {message}"));
                    }
                    HashResult::Digest { value, .. } => {
                        let recorded_value = recorded.as_ref().map(|(digest, _)| digest.as_str());

                        if recorded_value != Some(value.as_str()) {
                            self.observer.error(&format!(
                                "Mismatch for {relative_path}: found {value} expected {}",
                                recorded_value.unwrap_or("none")
                            ));
                        }
                    }
                }
            }

            current_progress += file.size;
            self.observer.progress(current_progress, total_progress);
        }

        catalog.set_latest_check(&backup.id, check_timestamp)?;
        catalog.commit()?;

        if eject_after {
            self.fs.eject(mount_point)?;
        }

        Ok(())
    }

    /// Detects an encrypted backup and mounts its container.
    ///
    /// A volume carrying exactly one file whose name ends with the container
    /// suffix is encrypted: the container is mounted under the configured
    /// mount folder and the inner volume becomes the actual root.
    pub(super) fn mount_encrypted_backup(&self, mount_point: &Path) -> Result<Container> {
        let files = self.fs.enumerate(&[mount_point.to_path_buf()], &match_all())?;

        let [container_file] = files.as_slice() else {
            return Ok(Container::Plain);
        };

        let Some(label) = container_file.name.strip_suffix(ENCRYPTED_CONTAINER_SUFFIX) else {
            return Ok(Container::Plain);
        };

        let mount_folder = &self.config.encrypted_volumes_mount_folder;
        self.fs.make_dirs(mount_folder)?;
        let container_mount = mount_folder.join(label);
        self.observer.message(&format!(
            "Detected a VeraCrypt backup, mounting image at \"{}\" ...",
            container_mount.display()
        ));
        self.fs
            .mount_encrypted(&container_file.path, &container_mount, &self.config.key_file)?;

        Ok(Container::Mounted(container_mount))
    }
}

/// Whether a backup volume carries its files directly or inside a mounted
/// encrypted container.
pub(super) enum Container {
    Plain,
    Mounted(PathBuf),
}

impl Container {
    pub(super) fn is_mounted(&self) -> bool {
        matches!(self, Self::Mounted(_))
    }

    /// The root to enumerate: the inner volume for an encrypted backup, the
    /// outer mount point otherwise.
    pub(super) fn actual_root<'a>(&'a self, mount_point: &'a Path) -> &'a Path {
        match self {
            Self::Plain => mount_point,
            Self::Mounted(inner) => inner,
        }
    }
}

/// Releases a mounted container on every exit path of a workflow.
pub(super) struct MountGuard<'a, F: FileSystemPort, O: Observer> {
    fs: &'a F,
    observer: &'a O,
    mount_point: Option<PathBuf>,
}

impl<'a, F: FileSystemPort, O: Observer> MountGuard<'a, F, O> {
    pub(super) fn new(fs: &'a F, observer: &'a O, container: &Container) -> Self {
        let mount_point = match container {
            Container::Plain => None,
            Container::Mounted(path) => Some(path.clone()),
        };
        Self {
            fs,
            observer,
            mount_point,
        }
    }
}

impl<F: FileSystemPort, O: Observer> Drop for MountGuard<'_, F, O> {
    fn drop(&mut self) {
        if let Some(mount_point) = self.mount_point.take() {
            self.observer.message(&format!(
                "Unmounting VeraCrypt image at \"{}\" ...",
                mount_point.display()
            ));

            if let Err(e) = self.fs.unmount_encrypted(&mount_point) {
                self.observer
                    .error(&format!("Unmounting {} failed: {e}", mount_point.display()));
            }
        }
    }
}
