//! Filesystem access and native-tool dispatch.
//!
//! [`FileSystemPort`] is the seam between the engine and the outside world:
//! plain file I/O, extended attributes, volume metadata, and the external
//! encryption/optical tools. [`LocalFileSystem`] is the production
//! implementation; engine tests substitute an in-memory fake.

use std::ffi::{OsStr, OsString};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDateTime, TimeZone};
use regex::Regex;

use crate::error::{canonicalize_existing_path, FingerprintError, Result};
use crate::hasher;
use crate::process::{Executor, OutputEncoding};
use crate::stats::Stats;
use crate::types::{FileInfo, HashResult};

/// Extended attribute carrying the stable file identity.
pub const XATTR_ID: &str = "it.tidalwave.datamanager.id";
/// Extended attribute carrying the latest fingerprint value.
pub const XATTR_FINGERPRINT: &str = "it.tidalwave.datamanager.fingerprint.md5";
/// Extended attribute carrying the latest fingerprint timestamp.
pub const XATTR_FINGERPRINT_TIMESTAMP: &str = "it.tidalwave.datamanager.fingerprint.md5.timestamp";

/// An encrypted backup volume is recognized by a single file at the volume
/// root carrying this suffix.
pub const ENCRYPTED_CONTAINER_SUFFIX: &str = ".veracrypt";

/// Where the operating system mounts removable volumes.
pub const VOLUMES_FOLDER: &str = "/Volumes";

const VERACRYPT: &str = "/Applications/VeraCrypt.app/Contents/MacOS/VeraCrypt";

/// Facade over the local filesystem and the native tools.
pub trait FileSystemPort {
    /// The per-run counters fed by the hashing pipeline.
    fn stats(&self) -> &Stats;

    /// Recursively enumerates regular files under `folders`, following
    /// symlinks, keeping basenames matched by `filter`. Order is unspecified;
    /// callers sort by path where determinism matters.
    fn enumerate(&self, folders: &[PathBuf], filter: &Regex) -> Result<Vec<FileInfo>>;

    /// Reads an extended attribute; a missing attribute is `None`.
    fn attribute(&self, path: &Path, name: &str) -> Result<Option<String>>;

    /// Writes an extended attribute as a UTF-8 byte string.
    fn set_attribute(&self, path: &Path, name: &str, value: &str) -> Result<()>;

    /// Computes the content digest of one file (see [`crate::hasher`]).
    fn compute_fingerprint(&self, path: &Path) -> HashResult;

    /// The filesystem-assigned UUID of the volume mounted at `mount_point`.
    fn volume_uuid(&self, mount_point: &Path) -> Result<Option<String>>;

    /// Creation timestamp of the given path.
    fn creation_date(&self, path: &Path) -> Result<NaiveDateTime>;

    fn size(&self, path: &Path) -> Result<u64>;

    fn exists(&self, path: &Path) -> bool;

    /// Creates a directory and all its parents.
    fn make_dirs(&self, path: &Path) -> Result<()>;

    /// Removes a folder recursively; absent folders are fine.
    fn remove_tree(&self, path: &Path) -> Result<()>;

    /// Copies preserving extended attributes, so the identity travels with
    /// the file. A plain content copy is insufficient.
    fn copy_with_attributes(&self, source: &Path, target: &Path) -> Result<()>;

    /// Entries of the volumes folder.
    fn mounted_volumes(&self) -> Result<Vec<PathBuf>>;

    fn mount_encrypted(&self, image: &Path, mount_point: &Path, key_file: &Path) -> Result<()>;

    fn unmount_encrypted(&self, mount_point: &Path) -> Result<()>;

    /// Creates a new encrypted container of at least `size` bytes, streaming
    /// the tool's progress output to `output`.
    fn create_encrypted_image(
        &self,
        algorithm: &str,
        hash_algorithm: &str,
        key_file: &Path,
        size: u64,
        image: &Path,
        output: &mut dyn FnMut(&str),
    ) -> Result<()>;

    /// Assembles an optical-disc image from `source_folder`.
    fn build_hybrid_image(&self, label: &str, image: &Path, source_folder: &Path) -> Result<()>;

    /// Writes an image to optical media, streaming progress to `output`.
    fn burn(&self, image: &Path, output: &mut dyn FnMut(&str)) -> Result<()>;

    /// Detaches a mounted optical disc.
    fn detach(&self, mount_point: &Path) -> Result<()>;

    /// Ejects the optical tray.
    fn eject(&self, mount_point: &Path) -> Result<()>;
}

/// Production [`FileSystemPort`] backed by the local filesystem, `diskutil`,
/// VeraCrypt, `hdiutil` and `drutil`.
#[derive(Debug, Default)]
pub struct LocalFileSystem {
    stats: Stats,
    executor: Executor,
}

impl LocalFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    fn run_logged<S: AsRef<OsStr>>(&self, program: &str, args: &[S]) -> Result<()> {
        self.executor.execute(
            program,
            args,
            OutputEncoding::Utf8,
            &mut |line| log::debug!("{program}: {line}"),
            true,
        )?;
        Ok(())
    }
}

impl FileSystemPort for LocalFileSystem {
    fn stats(&self) -> &Stats {
        &self.stats
    }

    fn enumerate(&self, folders: &[PathBuf], filter: &Regex) -> Result<Vec<FileInfo>> {
        let mut result = Vec::new();

        for folder in folders {
            for entry in walkdir::WalkDir::new(folder).follow_links(true) {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        log::debug!("skipping unreadable entry: {e}");
                        continue;
                    }
                };

                if !entry.file_type().is_file() {
                    continue;
                }

                let name = entry.file_name().to_string_lossy().into_owned();

                if !filter.is_match(&name) {
                    continue;
                }

                let metadata = match entry.metadata() {
                    Ok(metadata) => metadata,
                    Err(e) => {
                        log::debug!("skipping unreadable entry: {e}");
                        continue;
                    }
                };

                let path = entry.path().to_path_buf();
                let folder = path.parent().map(Path::to_path_buf).unwrap_or_default();
                result.push(FileInfo {
                    name,
                    folder,
                    path,
                    size: metadata.len(),
                });
            }
        }

        Ok(result)
    }

    fn attribute(&self, path: &Path, name: &str) -> Result<Option<String>> {
        match xattr::get(path, name)? {
            Some(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            None => Ok(None),
        }
    }

    fn set_attribute(&self, path: &Path, name: &str, value: &str) -> Result<()> {
        xattr::set(path, name, value.as_bytes())?;
        Ok(())
    }

    fn compute_fingerprint(&self, path: &Path) -> HashResult {
        hasher::compute_fingerprint(path, &self.stats)
    }

    fn volume_uuid(&self, mount_point: &Path) -> Result<Option<String>> {
        let pattern = Regex::new("Volume UUID: *([0-9A-F-]+)")?;
        let mut uuid = None;

        self.executor.execute(
            "diskutil",
            &["info".as_ref(), mount_point.as_os_str()],
            OutputEncoding::Utf8,
            &mut |line| {
                if uuid.is_none() {
                    if let Some(captures) = pattern.captures(line) {
                        uuid = Some(captures[1].to_owned());
                    }
                }
            },
            false,
        )?;

        Ok(uuid)
    }

    fn creation_date(&self, path: &Path) -> Result<NaiveDateTime> {
        let metadata = fs::metadata(path)?;
        let seconds = metadata.ctime();

        Local
            .timestamp_opt(seconds, 0)
            .single()
            .map(|date_time| date_time.naive_local())
            .ok_or_else(|| FingerprintError::Timestamp(seconds.to_string()))
    }

    fn size(&self, path: &Path) -> Result<u64> {
        Ok(fs::metadata(path)?.len())
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn make_dirs(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)?;
        Ok(())
    }

    fn remove_tree(&self, path: &Path) -> Result<()> {
        if path.exists() {
            fs::remove_dir_all(path)?;
        }
        Ok(())
    }

    fn copy_with_attributes(&self, source: &Path, target: &Path) -> Result<()> {
        // std::fs::copy does not preserve extended attributes.
        self.run_logged(
            "cp",
            &["-p".as_ref(), source.as_os_str(), target.as_os_str()],
        )
    }

    fn mounted_volumes(&self) -> Result<Vec<PathBuf>> {
        let mut volumes: Vec<PathBuf> = fs::read_dir(VOLUMES_FOLDER)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .collect();
        volumes.sort();
        Ok(volumes)
    }

    fn mount_encrypted(&self, image: &Path, mount_point: &Path, key_file: &Path) -> Result<()> {
        let mount_point = canonicalize_existing_path(mount_point.to_path_buf());
        self.run_logged(
            VERACRYPT,
            &[
                "--text".as_ref(),
                "--non-interactive".as_ref(),
                "--keyfiles".as_ref(),
                key_file.as_os_str(),
                image.as_os_str(),
                mount_point.as_os_str(),
            ],
        )
    }

    fn unmount_encrypted(&self, mount_point: &Path) -> Result<()> {
        let mount_point = canonicalize_existing_path(mount_point.to_path_buf());
        self.run_logged(
            VERACRYPT,
            &[
                "--text".as_ref(),
                "--non-interactive".as_ref(),
                "--force".as_ref(),
                "--dismount".as_ref(),
                mount_point.as_os_str(),
            ],
        )
    }

    fn create_encrypted_image(
        &self,
        algorithm: &str,
        hash_algorithm: &str,
        key_file: &Path,
        size: u64,
        image: &Path,
        output: &mut dyn FnMut(&str),
    ) -> Result<()> {
        let args: Vec<OsString> = vec![
            "--text".into(),
            "--non-interactive".into(),
            "--create".into(),
            image.as_os_str().to_owned(),
            "--volume-type=normal".into(),
            format!("--size={size}").into(),
            format!("--encryption={algorithm}").into(),
            format!("--hash={hash_algorithm}").into(),
            "--filesystem=hfs".into(),
            "--keyfiles".into(),
            key_file.as_os_str().to_owned(),
            "--quick".into(),
            "--random-source=/dev/urandom".into(),
        ];

        self.executor
            .execute(VERACRYPT, &args, OutputEncoding::Utf8, output, true)?;
        Ok(())
    }

    fn build_hybrid_image(&self, label: &str, image: &Path, source_folder: &Path) -> Result<()> {
        // -hfs: udf/joliet volumes expose no stable UUID to register against.
        self.run_logged(
            "hdiutil",
            &[
                "makehybrid".as_ref(),
                "-o".as_ref(),
                image.as_os_str(),
                source_folder.as_os_str(),
                "-ov".as_ref(),
                "-hfs".as_ref(),
                "-default-volume-name".as_ref(),
                OsStr::new(label),
            ],
        )
    }

    fn burn(&self, image: &Path, output: &mut dyn FnMut(&str)) -> Result<()> {
        // drutil always ejects the media once the burn completes.
        self.executor.execute(
            "drutil",
            &[
                "burn".as_ref(),
                "-noverify".as_ref(),
                "-speed".as_ref(),
                OsStr::new("6"),
                image.as_os_str(),
            ],
            OutputEncoding::Utf8,
            output,
            true,
        )?;
        Ok(())
    }

    fn detach(&self, mount_point: &Path) -> Result<()> {
        self.run_logged("hdiutil", &["detach".as_ref(), mount_point.as_os_str()])
    }

    fn eject(&self, _mount_point: &Path) -> Result<()> {
        self.executor.execute(
            "drutil",
            &["tray", "eject"],
            OutputEncoding::Utf8,
            &mut |line| log::debug!("drutil: {line}"),
            false,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::RegexBuilder;
    use std::fs::File;
    use std::io::Write;
    use tempfile::TempDir;

    fn any() -> Regex {
        Regex::new(".*").unwrap()
    }

    fn touch(path: &Path, content: &[u8]) {
        let mut file = File::create(path).unwrap();
        file.write_all(content).unwrap();
    }

    #[test]
    fn enumerate_recurses_and_reports_sizes() {
        let temp = TempDir::new().unwrap();
        fs::create_dir(temp.path().join("sub")).unwrap();
        touch(&temp.path().join("a.bin"), b"12345");
        touch(&temp.path().join("sub/b.bin"), b"123");

        let fs_port = LocalFileSystem::new();
        let mut files = fs_port
            .enumerate(&[temp.path().to_path_buf()], &any())
            .unwrap();
        files.sort_by(|a, b| a.path.cmp(&b.path));

        assert_eq!(files.len(), 2);
        assert_eq!(files[0].name, "a.bin");
        assert_eq!(files[0].size, 5);
        assert_eq!(files[0].folder, temp.path());
        assert_eq!(files[1].name, "b.bin");
        assert_eq!(files[1].path, temp.path().join("sub/b.bin"));
    }

    #[test]
    fn enumerate_filters_by_basename_case_insensitively() {
        let temp = TempDir::new().unwrap();
        touch(&temp.path().join("PHOTO.JPG"), b"x");
        touch(&temp.path().join("notes.txt"), b"x");

        let filter = RegexBuilder::new(r"\.jpg$")
            .case_insensitive(true)
            .build()
            .unwrap();
        let files = LocalFileSystem::new()
            .enumerate(&[temp.path().to_path_buf()], &filter)
            .unwrap();

        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "PHOTO.JPG");
    }

    #[test]
    fn enumerate_follows_symlinked_folders() {
        let temp = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        touch(&outside.path().join("linked.bin"), b"x");
        std::os::unix::fs::symlink(outside.path(), temp.path().join("link")).unwrap();

        let files = LocalFileSystem::new()
            .enumerate(&[temp.path().to_path_buf()], &any())
            .unwrap();

        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "linked.bin");
    }

    #[test]
    fn enumerate_skips_directories() {
        let temp = TempDir::new().unwrap();
        fs::create_dir(temp.path().join("folder.bin")).unwrap();

        let files = LocalFileSystem::new()
            .enumerate(&[temp.path().to_path_buf()], &any())
            .unwrap();
        assert!(files.is_empty());
    }

    #[test]
    fn make_dirs_and_remove_tree() {
        let temp = TempDir::new().unwrap();
        let nested = temp.path().join("a/b/c");

        let fs_port = LocalFileSystem::new();
        fs_port.make_dirs(&nested).unwrap();
        assert!(fs_port.exists(&nested));

        fs_port.remove_tree(&temp.path().join("a")).unwrap();
        assert!(!fs_port.exists(&nested));

        // Removing an absent tree is fine.
        fs_port.remove_tree(&temp.path().join("a")).unwrap();
    }

    #[test]
    fn size_of_file() {
        let temp = TempDir::new().unwrap();
        touch(&temp.path().join("f"), b"1234567");
        assert_eq!(LocalFileSystem::new().size(&temp.path().join("f")).unwrap(), 7);
    }

    #[test]
    fn creation_date_is_plausible() {
        let temp = TempDir::new().unwrap();
        touch(&temp.path().join("f"), b"x");

        let created = LocalFileSystem::new()
            .creation_date(&temp.path().join("f"))
            .unwrap();
        let now = Local::now().naive_local();
        assert!((now - created).num_seconds() < 60);
    }

    #[cfg(target_os = "macos")]
    mod macos_tests {
        use super::*;

        #[test]
        fn attribute_round_trip() {
            let temp = TempDir::new().unwrap();
            let path = temp.path().join("f");
            touch(&path, b"x");

            let fs_port = LocalFileSystem::new();
            assert_eq!(fs_port.attribute(&path, XATTR_ID).unwrap(), None);

            fs_port.set_attribute(&path, XATTR_ID, "some-id").unwrap();
            assert_eq!(
                fs_port.attribute(&path, XATTR_ID).unwrap(),
                Some("some-id".to_owned())
            );
        }

        #[test]
        fn attributes_are_independent() {
            let temp = TempDir::new().unwrap();
            let path = temp.path().join("f");
            touch(&path, b"x");

            let fs_port = LocalFileSystem::new();
            fs_port.set_attribute(&path, XATTR_FINGERPRINT, "abc").unwrap();
            assert_eq!(fs_port.attribute(&path, XATTR_ID).unwrap(), None);
            assert_eq!(
                fs_port
                    .attribute(&path, XATTR_FINGERPRINT_TIMESTAMP)
                    .unwrap(),
                None
            );
        }
    }
}
