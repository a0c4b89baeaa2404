//! Terminal front end for the fingerprinting engine.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;

use clap::{Args, Parser, Subcommand};

use fingerprint::engine::{Config, Engine};
use fingerprint::filesystem::LocalFileSystem;
use fingerprint::namehint::backup_name_hint;
use fingerprint::observer::Observer;
use fingerprint::types::TIMESTAMP_FORMAT;

fn main() -> ExitCode {
    env_logger::init();
    let args = ToplevelArgs::parse();

    match args.exec() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("ERROR: {e}");
            ExitCode::FAILURE
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "datakeeper", about = "Personal data-integrity manager", version)]
struct ToplevelArgs {
    #[command(flatten)]
    paths: FolderArgs,

    #[command(subcommand)]
    action: Action,
}

impl ToplevelArgs {
    fn exec(self) -> fingerprint::Result<()> {
        let config = self.paths.into_config();
        std::fs::create_dir_all(&config.database_folder)?;
        let engine = Engine::new(LocalFileSystem::new(), TerminalObserver::default(), config);

        match self.action {
            Action::Scan(a) => engine.scan(&a.folder, &a.filter, a.only_new),
            Action::Register(a) => engine.register_backup(&a.label, &a.mount_point, a.eject),
            Action::Verify(a) => engine.verify_backup(&a.mount_point, a.eject),
            Action::CreateBackup(a) => {
                engine.create_encrypted_backup(&a.name, &a.encryption, &a.hash, &a.folders, a.burn)
            }
            Action::Backups => {
                for backup in engine.backups()? {
                    let latest_check = backup
                        .latest_check_date
                        .map(|date| date.format(TIMESTAMP_FORMAT).to_string())
                        .unwrap_or_else(|| "never checked".to_owned());
                    println!(
                        "{}  {}  registered {}  {}{}",
                        backup.label,
                        backup.volume_id,
                        backup.registration_date.format(TIMESTAMP_FORMAT),
                        latest_check,
                        if backup.encrypted { "  (encrypted)" } else { "" },
                    );
                }
                Ok(())
            }
            Action::Volumes(a) => {
                for (mount_point, label) in engine.mounted_backup_volumes(!a.unregistered)? {
                    println!("{}  {label}", mount_point.display());
                }
                Ok(())
            }
            Action::NameHint(a) => {
                match backup_name_hint(&a.folders) {
                    Some(hint) => println!("{hint}"),
                    None => println!("(no hint)"),
                }
                Ok(())
            }
        }
    }
}

#[derive(Args, Debug)]
struct FolderArgs {
    /// Application state folder housing the catalog database.
    #[arg(long, global = true)]
    state_folder: Option<PathBuf>,

    /// Scratch area used while producing encrypted backups.
    #[arg(long, global = true)]
    working_folder: Option<PathBuf>,

    /// Key file unlocking encrypted backup containers.
    #[arg(long, global = true)]
    key_file: Option<PathBuf>,

    /// Where encrypted containers get mounted during register/verify.
    #[arg(long, global = true)]
    mount_folder: Option<PathBuf>,
}

impl FolderArgs {
    fn into_config(self) -> Config {
        let app_folder = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("DataKeeper");

        Config {
            database_folder: self.state_folder.unwrap_or_else(|| app_folder.join("db")),
            working_folder: self
                .working_folder
                .unwrap_or_else(|| std::env::temp_dir().join("DataKeeper")),
            key_file: self.key_file.unwrap_or_else(|| app_folder.join("backup.key")),
            encrypted_volumes_mount_folder: self
                .mount_folder
                .unwrap_or_else(|| app_folder.join("var/EncryptedBackups")),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Action {
    /// Scan a folder, assigning identities and recording fingerprints.
    Scan(ScanArgs),
    /// Register a mounted volume as a new backup.
    Register(RegisterArgs),
    /// Verify a registered backup against the catalog.
    Verify(VerifyArgs),
    /// Stage folders into an encrypted container and optionally burn it.
    CreateBackup(CreateBackupArgs),
    /// List registered backups.
    Backups,
    /// List mounted volumes by registration state.
    Volumes(VolumesArgs),
    /// Suggest a backup label for a set of folders.
    NameHint(NameHintArgs),
}

#[derive(Args, Debug)]
struct ScanArgs {
    /// The folder to scan.
    folder: PathBuf,

    /// Filename filter, matched case-insensitively against basenames.
    #[arg(long, default_value = ".*")]
    filter: String,

    /// Skip files that already carry an identity.
    #[arg(long)]
    only_new: bool,
}

#[derive(Args, Debug)]
struct RegisterArgs {
    /// Unique label for the new backup.
    label: String,

    /// Mount point of the backup volume.
    mount_point: PathBuf,

    /// Eject the medium when done.
    #[arg(long)]
    eject: bool,
}

#[derive(Args, Debug)]
struct VerifyArgs {
    /// Mount point of the backup volume.
    mount_point: PathBuf,

    /// Eject the medium when done.
    #[arg(long)]
    eject: bool,
}

#[derive(Args, Debug)]
struct CreateBackupArgs {
    /// Name (and label) of the new backup.
    name: String,

    /// Source folders to back up.
    #[arg(required = true)]
    folders: Vec<PathBuf>,

    /// Encryption algorithm for the container.
    #[arg(long, default_value = "aes-twofish-serpent")]
    encryption: String,

    /// Hash algorithm for the container.
    #[arg(long, default_value = "whirlpool")]
    hash: String,

    /// Burn the resulting image to optical media.
    #[arg(long)]
    burn: bool,
}

#[derive(Args, Debug)]
struct VolumesArgs {
    /// List volumes not yet registered instead.
    #[arg(long)]
    unregistered: bool,
}

#[derive(Args, Debug)]
struct NameHintArgs {
    #[arg(required = true)]
    folders: Vec<PathBuf>,
}

/// Prints engine notifications to the terminal, repainting progress in place.
#[derive(Debug, Default)]
struct TerminalObserver {
    progress: Mutex<String>,
}

impl Observer for TerminalObserver {
    fn counting(&self) {
        println!("Counting files...");
    }

    fn file_count(&self, count: usize) {
        println!("{count} files to process");
    }

    fn progress(&self, partial: u64, total: u64) {
        let percent = 100.0 * partial as f64 / total.max(1) as f64;
        *self.progress.lock().unwrap() = format!("{partial}/{total} {percent:.1}%");
    }

    fn file(&self, path: &str, is_new: bool) {
        if is_new {
            println!("{path}");
        } else {
            print!(" {}\r", self.progress.lock().unwrap());
            let _ = std::io::stdout().flush();
        }
    }

    fn file_moved(&self, old_path: &str, new_path: &str) {
        println!("{old_path}\n    ↳ {new_path}");
    }

    fn message(&self, text: &str) {
        println!("{text}");
    }

    fn error(&self, text: &str) {
        println!("ERROR: {text}");
    }
}
