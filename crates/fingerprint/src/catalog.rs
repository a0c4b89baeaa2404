//! Durable relational store of files, fingerprints, backups and backup items.
//!
//! The schema is created idempotently on open. A connection is only valid on
//! the thread that opened it, so the engine opens and closes a catalog around
//! each workflow. Writes are grouped into transactions ended by explicit
//! [`Catalog::commit`] calls; per-row writes take a `commit` flag so long
//! scans can commit after each file and bound data loss on a crash. Dropping
//! the catalog rolls back whatever was not committed.

use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use rusqlite::Connection;
use uuid::Uuid;

use crate::error::{FingerprintError, Result};
use crate::types::{Backup, TIMESTAMP_FORMAT};

/// Database filename under the application state folder.
pub const DATABASE_NAME: &str = "fingerprints.db";

/// Pluggable id source; tests substitute a deterministic sequence.
pub type IdGenerator = Box<dyn Fn() -> String>;

pub struct Catalog {
    conn: Connection,
    generate_id: IdGenerator,
}

impl Catalog {
    /// Opens (creating if needed) the catalog in `database_folder`.
    pub fn open(database_folder: &Path) -> Result<Self> {
        Self::open_with_id_generator(database_folder, Box::new(generate_id))
    }

    /// Opens with a custom id generator; tests use deterministic ids.
    pub fn open_with_id_generator(database_folder: &Path, generate_id: IdGenerator) -> Result<Self> {
        let database_file = database_folder.join(DATABASE_NAME);
        log::debug!("opening db connection: {}", database_file.display());
        Self::initialize(Connection::open(database_file)?, generate_id)
    }

    /// In-memory catalog for tests.
    pub fn open_in_memory(generate_id: IdGenerator) -> Result<Self> {
        Self::initialize(Connection::open_in_memory()?, generate_id)
    }

    fn initialize(conn: Connection, generate_id: IdGenerator) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS files (
                 id TEXT PRIMARY KEY,
                 path TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS fingerprints (
                 id TEXT PRIMARY KEY,
                 name TEXT NOT NULL,
                 file_id TEXT NOT NULL,
                 algorithm TEXT NOT NULL,
                 fingerprint TEXT NOT NULL,
                 timestamp TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS files__path ON files (path);
             CREATE INDEX IF NOT EXISTS fingerprints__name ON fingerprints (name);
             CREATE INDEX IF NOT EXISTS fingerprints__file_id ON fingerprints (file_id);
             CREATE INDEX IF NOT EXISTS fingerprints__timestamp ON fingerprints (timestamp);
             CREATE TABLE IF NOT EXISTS backups (
                 id TEXT PRIMARY KEY,
                 base_path TEXT NOT NULL,
                 label TEXT NOT NULL UNIQUE,
                 volume_id TEXT NOT NULL UNIQUE,
                 encrypted INTEGER NOT NULL,
                 creation_date TEXT NOT NULL,
                 registration_date TEXT NOT NULL,
                 latest_check_date TEXT
             );
             CREATE INDEX IF NOT EXISTS backups__volume_id ON backups (volume_id);
             CREATE TABLE IF NOT EXISTS backup_files (
                 id TEXT PRIMARY KEY,
                 backup_id TEXT NOT NULL,
                 file_id TEXT NOT NULL,
                 path TEXT NOT NULL
             );",
        )?;
        conn.execute_batch("BEGIN")?;

        Ok(Self { conn, generate_id })
    }

    /// Commits the current transaction and opens the next one.
    pub fn commit(&self) -> Result<()> {
        log::debug!("committing...");
        self.conn.execute_batch("COMMIT; BEGIN")?;
        Ok(())
    }

    fn maybe_commit(&self, commit: bool) -> Result<()> {
        if commit {
            self.commit()?;
        }
        Ok(())
    }

    /// Returns all `(file_id, path)` mappings, ordered by path.
    pub fn mappings(&self) -> Result<Vec<(String, PathBuf)>> {
        let mut statement = self.conn.prepare("SELECT id, path FROM files ORDER BY path")?;
        let rows = statement
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, PathBuf::from(row.get::<_, String>(1)?)))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Adds a new file mapping.
    pub fn add_file(&self, file_id: &str, path: &Path, commit: bool) -> Result<()> {
        log::debug!("add_file({file_id}, {})", path.display());
        self.conn.execute(
            "INSERT INTO files(id, path) VALUES(?1, ?2)",
            (file_id, path_text(path)),
        )?;
        self.maybe_commit(commit)
    }

    /// Updates the current path of a known file.
    pub fn update_file_path(&self, file_id: &str, path: &Path, commit: bool) -> Result<()> {
        log::debug!("update_file_path({file_id}, {})", path.display());
        self.conn.execute(
            "UPDATE files SET path = ?1 WHERE id = ?2",
            (path_text(path), file_id),
        )?;
        self.maybe_commit(commit)
    }

    /// Looks a file id up by basename.
    ///
    /// More than one match is a consistency violation: basenames are the
    /// rename-recovery key and must identify at most one file.
    pub fn file_id_by_name(&self, file_name: &str) -> Result<Option<String>> {
        let mut statement = self.conn.prepare("SELECT id FROM files WHERE path LIKE ?1")?;
        let rows = statement
            .query_map([format!("%/{file_name}")], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        single(rows, &format!("file named {file_name}"))
    }

    /// Inserts one fingerprint observation; insert-only history.
    pub fn add_fingerprint(
        &self,
        file_id: &str,
        file_name: &str,
        algorithm: &str,
        fingerprint: &str,
        timestamp: NaiveDateTime,
        commit: bool,
    ) -> Result<String> {
        if file_id.is_empty() {
            return Err(FingerprintError::Consistency(
                "fingerprint requires a file id".into(),
            ));
        }

        let id = (self.generate_id)();
        self.conn.execute(
            "INSERT INTO fingerprints(id, file_id, name, algorithm, fingerprint, timestamp)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
            (&id, file_id, file_name, algorithm, fingerprint, format_timestamp(timestamp)),
        )?;
        self.maybe_commit(commit)?;
        Ok(id)
    }

    pub fn delete_fingerprint(&self, fingerprint_id: &str, commit: bool) -> Result<()> {
        self.conn.execute(
            "DELETE FROM fingerprints WHERE id = ?1",
            [fingerprint_id],
        )?;
        self.maybe_commit(commit)
    }

    /// The `(digest, timestamp)` history for a file, oldest first.
    pub fn fingerprints_for_file(&self, file_id: &str) -> Result<Vec<(String, NaiveDateTime)>> {
        let mut statement = self.conn.prepare(
            "SELECT fingerprint, timestamp FROM fingerprints
             WHERE file_id = ?1 ORDER BY timestamp, rowid",
        )?;
        let rows = statement
            .query_map([file_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(digest, timestamp)| Ok((digest, parse_timestamp(&timestamp)?)))
            .collect()
    }

    /// The most recent `(digest, timestamp)` observation for a file.
    pub fn latest_fingerprint(&self, file_id: &str) -> Result<Option<(String, NaiveDateTime)>> {
        Ok(self.fingerprints_for_file(file_id)?.pop())
    }

    /// Registers a backup volume. Returns the backup id.
    #[allow(clippy::too_many_arguments)]
    pub fn add_backup(
        &self,
        base_path: &Path,
        label: &str,
        volume_id: &str,
        creation_date: NaiveDateTime,
        registration_date: NaiveDateTime,
        encrypted: bool,
        commit: bool,
    ) -> Result<String> {
        let id = (self.generate_id)();
        self.conn.execute(
            "INSERT INTO backups(id, base_path, label, volume_id, creation_date, registration_date, encrypted)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            (
                &id,
                path_text(base_path),
                label,
                volume_id,
                format_timestamp(creation_date),
                format_timestamp(registration_date),
                encrypted,
            ),
        )?;
        self.maybe_commit(commit)?;
        Ok(id)
    }

    pub fn backup_by_volume_id(&self, volume_id: &str) -> Result<Option<Backup>> {
        self.backup_where("volume_id = ?1", volume_id)
    }

    pub fn backup_by_label(&self, label: &str) -> Result<Option<Backup>> {
        self.backup_where("label = ?1", label)
    }

    pub fn backup_by_mount_point(&self, mount_point: &Path) -> Result<Option<Backup>> {
        self.backup_where("base_path = ?1", &path_text(mount_point))
    }

    fn backup_where(&self, condition: &str, argument: &str) -> Result<Option<Backup>> {
        let rows = self.query_backups(
            &format!("{} WHERE {condition}", BACKUP_SELECT),
            [argument],
        )?;
        single(rows, &format!("backup with {condition}"))
    }

    /// All registered backups, ordered by label.
    pub fn all_backups(&self) -> Result<Vec<Backup>> {
        self.query_backups(&format!("{} ORDER BY label", BACKUP_SELECT), [])
    }

    fn query_backups<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<Backup>> {
        let mut statement = self.conn.prepare(sql)?;
        let rows = statement
            .query_map(params, |row| {
                Ok(RawBackup {
                    id: row.get(0)?,
                    base_path: row.get(1)?,
                    label: row.get(2)?,
                    volume_id: row.get(3)?,
                    encrypted: row.get(4)?,
                    creation_date: row.get(5)?,
                    registration_date: row.get(6)?,
                    latest_check_date: row.get(7)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter().map(RawBackup::into_backup).collect()
    }

    /// Records a successful verification.
    pub fn set_latest_check(&self, backup_id: &str, timestamp: NaiveDateTime) -> Result<()> {
        self.conn.execute(
            "UPDATE backups SET latest_check_date = ?1 WHERE id = ?2",
            (format_timestamp(timestamp), backup_id),
        )?;
        Ok(())
    }

    /// The backup-item id for `(backup_id, file_id)`, if registered.
    pub fn backup_item_id(&self, backup_id: &str, file_id: &str) -> Result<Option<String>> {
        let mut statement = self
            .conn
            .prepare("SELECT id FROM backup_files WHERE backup_id = ?1 AND file_id = ?2")?;
        let rows = statement
            .query_map([backup_id, file_id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        single(rows, "backup item per (backup, file)")
    }

    /// Records a file copy present in a backup. Returns the item id.
    pub fn add_backup_item(
        &self,
        backup_id: &str,
        file_id: &str,
        relative_path: &str,
        commit: bool,
    ) -> Result<String> {
        let id = (self.generate_id)();
        self.conn.execute(
            "INSERT INTO backup_files(id, backup_id, file_id, path) VALUES(?1, ?2, ?3, ?4)",
            (&id, backup_id, file_id, relative_path),
        )?;
        self.maybe_commit(commit)?;
        Ok(id)
    }
}

impl Drop for Catalog {
    fn drop(&mut self) {
        log::debug!("closing db connection...");
    }
}

const BACKUP_SELECT: &str =
    "SELECT id, base_path, label, volume_id, encrypted, creation_date, registration_date, latest_check_date
     FROM backups";

struct RawBackup {
    id: String,
    base_path: String,
    label: String,
    volume_id: String,
    encrypted: bool,
    creation_date: String,
    registration_date: String,
    latest_check_date: Option<String>,
}

impl RawBackup {
    fn into_backup(self) -> Result<Backup> {
        Ok(Backup {
            id: self.id,
            base_path: PathBuf::from(self.base_path),
            label: self.label,
            volume_id: self.volume_id,
            encrypted: self.encrypted,
            creation_date: parse_timestamp(&self.creation_date)?,
            registration_date: parse_timestamp(&self.registration_date)?,
            latest_check_date: self
                .latest_check_date
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
        })
    }
}

/// Generates a new unique id in canonical lowercase hyphenated form.
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

fn single<T>(mut rows: Vec<T>, what: &str) -> Result<Option<T>> {
    match rows.len() {
        0 => Ok(None),
        1 => Ok(rows.pop()),
        count => Err(FingerprintError::Consistency(format!(
            "expected at most one {what}, found {count}"
        ))),
    }
}

fn format_timestamp(timestamp: NaiveDateTime) -> String {
    timestamp.format(TIMESTAMP_FORMAT).to_string()
}

fn parse_timestamp(text: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT)
        .map_err(|_| FingerprintError::Timestamp(text.to_owned()))
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
