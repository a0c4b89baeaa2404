//! In-memory test doubles for the engine workflows: a fake filesystem port
//! and a recording observer, plus a bench wiring them to a real catalog in a
//! temporary folder.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use md5::{Digest, Md5};
use parking_lot::Mutex;
use regex::Regex;
use tempfile::TempDir;

use super::{Config, Engine};
use crate::catalog::{Catalog, DATABASE_NAME};
use crate::error::Result;
use crate::filesystem::FileSystemPort;
use crate::observer::Observer;
use crate::stats::Stats;
use crate::types::{FileInfo, HashResult};

pub(crate) fn md5_hex(content: &[u8]) -> String {
    hex::encode(Md5::digest(content))
}

fn fixed_timestamp() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2020, 5, 17)
        .unwrap()
        .and_hms_opt(10, 30, 0)
        .unwrap()
}

fn not_found(path: &Path) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("no such file: {}", path.display()),
    )
}

#[derive(Debug, Clone, Default)]
struct FakeFile {
    content: Vec<u8>,
    xattrs: HashMap<String, String>,
}

#[derive(Debug, Default)]
struct FakeState {
    files: BTreeMap<PathBuf, FakeFile>,
    dirs: BTreeSet<PathBuf>,
    volume_uuids: HashMap<PathBuf, String>,
    creation_dates: HashMap<PathBuf, NaiveDateTime>,
    actions: Vec<String>,
    failing_reads: HashSet<PathBuf>,
    failing_tools: HashSet<String>,
}

/// An in-memory [`FileSystemPort`]: files, xattrs and volume metadata live in
/// shared state, native-tool dispatch is recorded as an action log.
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeFileSystem {
    state: Arc<Mutex<FakeState>>,
    stats: Arc<Stats>,
}

impl FakeFileSystem {
    pub fn add_file(&self, path: &str, content: &[u8]) {
        self.state.lock().files.insert(
            PathBuf::from(path),
            FakeFile {
                content: content.to_vec(),
                xattrs: HashMap::new(),
            },
        );
    }

    pub fn set_content(&self, path: &str, content: &[u8]) {
        self.state
            .lock()
            .files
            .get_mut(Path::new(path))
            .expect("file exists")
            .content = content.to_vec();
    }

    pub fn move_file(&self, from: &str, to: &str) {
        let mut state = self.state.lock();
        let file = state.files.remove(Path::new(from)).expect("file exists");
        state.files.insert(PathBuf::from(to), file);
    }

    pub fn remove_file(&self, path: &str) {
        self.state.lock().files.remove(Path::new(path));
    }

    pub fn clone_file(&self, from: &str, to: &str) {
        let mut state = self.state.lock();
        let file = state.files.get(Path::new(from)).expect("file exists").clone();
        state.files.insert(PathBuf::from(to), file);
    }

    pub fn content(&self, path: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .files
            .get(Path::new(path))
            .map(|file| file.content.clone())
    }

    pub fn xattr(&self, path: &str, name: &str) -> Option<String> {
        self.state
            .lock()
            .files
            .get(Path::new(path))
            .and_then(|file| file.xattrs.get(name).cloned())
    }

    pub fn remove_xattr(&self, path: &str, name: &str) {
        self.state
            .lock()
            .files
            .get_mut(Path::new(path))
            .expect("file exists")
            .xattrs
            .remove(name);
    }

    pub fn set_volume_uuid(&self, mount_point: &str, volume_id: &str) {
        self.state
            .lock()
            .volume_uuids
            .insert(PathBuf::from(mount_point), volume_id.to_owned());
    }

    pub fn fail_reads_of(&self, path: &str) {
        self.state.lock().failing_reads.insert(PathBuf::from(path));
    }

    /// Makes the named tool action (`create-image`, `hybrid-image`, `copy`,
    /// `mount`, `burn`) fail with an injected I/O error.
    pub fn fail_tool(&self, tool: &str) {
        self.state.lock().failing_tools.insert(tool.to_owned());
    }

    pub fn actions(&self) -> Vec<String> {
        self.state.lock().actions.clone()
    }

    fn act(&self, action: String) {
        self.state.lock().actions.push(action);
    }

    fn check_tool(&self, tool: &str) -> Result<()> {
        if self.state.lock().failing_tools.contains(tool) {
            return Err(std::io::Error::other(format!("injected {tool} failure")).into());
        }
        Ok(())
    }
}

impl FileSystemPort for FakeFileSystem {
    fn stats(&self) -> &Stats {
        &self.stats
    }

    fn enumerate(&self, folders: &[PathBuf], filter: &Regex) -> Result<Vec<FileInfo>> {
        let state = self.state.lock();
        let mut result = Vec::new();

        for (path, file) in &state.files {
            if !folders.iter().any(|folder| path.starts_with(folder)) {
                continue;
            }

            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();

            if !filter.is_match(&name) {
                continue;
            }

            result.push(FileInfo {
                name,
                folder: path.parent().map(Path::to_path_buf).unwrap_or_default(),
                path: path.clone(),
                size: file.content.len() as u64,
            });
        }

        Ok(result)
    }

    fn attribute(&self, path: &Path, name: &str) -> Result<Option<String>> {
        let state = self.state.lock();
        let file = state.files.get(path).ok_or_else(|| not_found(path))?;
        Ok(file.xattrs.get(name).cloned())
    }

    fn set_attribute(&self, path: &Path, name: &str, value: &str) -> Result<()> {
        let mut state = self.state.lock();
        let file = state.files.get_mut(path).ok_or_else(|| not_found(path))?;
        file.xattrs.insert(name.to_owned(), value.to_owned());
        Ok(())
    }

    fn compute_fingerprint(&self, path: &Path) -> HashResult {
        let state = self.state.lock();

        if state.failing_reads.contains(path) {
            return HashResult::Failed("injected read failure".to_owned());
        }

        match state.files.get(path) {
            Some(file) => {
                self.stats.record_direct_read(file.content.len() as u64);
                self.stats.count_file();
                HashResult::Digest {
                    algorithm: "md5".to_owned(),
                    value: md5_hex(&file.content),
                }
            }
            None => HashResult::Failed(not_found(path).to_string()),
        }
    }

    fn volume_uuid(&self, mount_point: &Path) -> Result<Option<String>> {
        Ok(self.state.lock().volume_uuids.get(mount_point).cloned())
    }

    fn creation_date(&self, path: &Path) -> Result<NaiveDateTime> {
        Ok(self
            .state
            .lock()
            .creation_dates
            .get(path)
            .copied()
            .unwrap_or_else(|| {
                NaiveDate::from_ymd_opt(2020, 1, 1)
                    .unwrap()
                    .and_hms_opt(0, 0, 0)
                    .unwrap()
            }))
    }

    fn size(&self, path: &Path) -> Result<u64> {
        let state = self.state.lock();
        let file = state.files.get(path).ok_or_else(|| not_found(path))?;
        Ok(file.content.len() as u64)
    }

    fn exists(&self, path: &Path) -> bool {
        let state = self.state.lock();
        state.files.contains_key(path)
            || state.files.keys().any(|existing| existing.starts_with(path))
            || state.dirs.iter().any(|dir| dir.starts_with(path))
    }

    fn make_dirs(&self, path: &Path) -> Result<()> {
        self.state.lock().dirs.insert(path.to_path_buf());
        Ok(())
    }

    fn remove_tree(&self, path: &Path) -> Result<()> {
        self.act(format!("remove-tree {}", path.display()));
        let mut state = self.state.lock();
        state.files.retain(|existing, _| !existing.starts_with(path));
        state.dirs.retain(|dir| !dir.starts_with(path));
        Ok(())
    }

    fn copy_with_attributes(&self, source: &Path, target: &Path) -> Result<()> {
        self.check_tool("copy")?;
        self.act(format!("copy {} -> {}", source.display(), target.display()));
        let mut state = self.state.lock();
        let file = state.files.get(source).ok_or_else(|| not_found(source))?.clone();
        state.files.insert(target.to_path_buf(), file);
        Ok(())
    }

    fn mounted_volumes(&self) -> Result<Vec<PathBuf>> {
        let state = self.state.lock();
        let volumes_root = Path::new(crate::filesystem::VOLUMES_FOLDER);
        let mut volumes = BTreeSet::new();

        for path in state.files.keys().chain(state.volume_uuids.keys()) {
            if let Ok(relative) = path.strip_prefix(volumes_root) {
                if let Some(name) = relative.components().next() {
                    volumes.insert(volumes_root.join(name.as_os_str()));
                }
            }
        }

        Ok(volumes.into_iter().collect())
    }

    fn mount_encrypted(&self, image: &Path, mount_point: &Path, _key_file: &Path) -> Result<()> {
        self.check_tool("mount")?;
        self.act(format!("mount {} -> {}", image.display(), mount_point.display()));
        Ok(())
    }

    fn unmount_encrypted(&self, mount_point: &Path) -> Result<()> {
        self.act(format!("unmount {}", mount_point.display()));
        Ok(())
    }

    fn create_encrypted_image(
        &self,
        algorithm: &str,
        hash_algorithm: &str,
        _key_file: &Path,
        size: u64,
        image: &Path,
        output: &mut dyn FnMut(&str),
    ) -> Result<()> {
        self.check_tool("create-image")?;
        output("Volume created.");
        self.act(format!(
            "create-image {} size={size} {algorithm} {hash_algorithm}",
            image.display()
        ));
        self.state.lock().files.insert(
            image.to_path_buf(),
            FakeFile {
                content: vec![0; 16],
                xattrs: HashMap::new(),
            },
        );
        Ok(())
    }

    fn build_hybrid_image(&self, label: &str, image: &Path, source_folder: &Path) -> Result<()> {
        self.check_tool("hybrid-image")?;
        self.act(format!(
            "hybrid-image {label} {} <- {}",
            image.display(),
            source_folder.display()
        ));
        let mut with_ext = image.as_os_str().to_owned();
        with_ext.push(".dmg");
        self.state.lock().files.insert(
            PathBuf::from(with_ext),
            FakeFile {
                content: vec![0; 32],
                xattrs: HashMap::new(),
            },
        );
        Ok(())
    }

    fn burn(&self, image: &Path, output: &mut dyn FnMut(&str)) -> Result<()> {
        self.check_tool("burn")?;
        output("[==========          ] 50%");
        self.act(format!("burn {}", image.display()));
        Ok(())
    }

    fn detach(&self, mount_point: &Path) -> Result<()> {
        self.act(format!("detach {}", mount_point.display()));
        Ok(())
    }

    fn eject(&self, mount_point: &Path) -> Result<()> {
        self.act(format!("eject {}", mount_point.display()));
        Ok(())
    }
}

/// One observed engine notification.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Event {
    Counting,
    FileCount(usize),
    Progress(u64, u64),
    SecondaryProgress(f64),
    File(String, bool),
    FileMoved(String, String),
    Message(String),
    Error(String),
}

/// Records every notification for later assertions.
#[derive(Debug, Clone, Default)]
pub(crate) struct SpyObserver {
    events: Arc<Mutex<Vec<Event>>>,
}

impl SpyObserver {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Message(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Error(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl Observer for SpyObserver {
    fn counting(&self) {
        self.events.lock().push(Event::Counting);
    }

    fn file_count(&self, count: usize) {
        self.events.lock().push(Event::FileCount(count));
    }

    fn progress(&self, partial: u64, total: u64) {
        self.events.lock().push(Event::Progress(partial, total));
    }

    fn secondary_progress(&self, fraction: f64) {
        self.events.lock().push(Event::SecondaryProgress(fraction));
    }

    fn file(&self, path: &str, is_new: bool) {
        self.events.lock().push(Event::File(path.to_owned(), is_new));
    }

    fn file_moved(&self, old_path: &str, new_path: &str) {
        self.events
            .lock()
            .push(Event::FileMoved(old_path.to_owned(), new_path.to_owned()));
    }

    fn message(&self, text: &str) {
        self.events.lock().push(Event::Message(text.to_owned()));
    }

    fn error(&self, text: &str) {
        self.events.lock().push(Event::Error(text.to_owned()));
    }
}

/// Fake filesystem + spy observer wired to a real catalog in a temp folder.
pub(crate) struct TestBench {
    pub fs: FakeFileSystem,
    pub observer: SpyObserver,
    pub state_dir: TempDir,
}

impl TestBench {
    pub fn new() -> Self {
        Self {
            fs: FakeFileSystem::default(),
            observer: SpyObserver::default(),
            state_dir: TempDir::new().expect("temp state folder"),
        }
    }

    pub fn config(&self) -> Config {
        Config {
            database_folder: self.state_dir.path().to_path_buf(),
            working_folder: PathBuf::from("/work"),
            key_file: PathBuf::from("/keys/backup.key"),
            encrypted_volumes_mount_folder: PathBuf::from("/mounts"),
        }
    }

    pub fn engine(&self) -> Engine<FakeFileSystem, SpyObserver> {
        Engine::new(self.fs.clone(), self.observer.clone(), self.config())
            .with_clock(Box::new(|| fixed_timestamp()))
    }

    pub fn catalog(&self) -> Catalog {
        Catalog::open(self.state_dir.path()).expect("open catalog")
    }

    pub fn database_path(&self) -> PathBuf {
        self.state_dir.path().join(DATABASE_NAME)
    }
}
