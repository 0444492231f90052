use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use flate2::write::GzEncoder;
use flate2::Compression;

use super::{backup_dir, backup_file_name, validate_database_name};
use super::{BackupArtifact, Dump, DumpError, DumpRequest};

pub const DEFAULT_DUMP_COMMAND: &str = "mariadb-dump";
pub const USER_ENV: &str = "MYSQL_USER";
pub const PASSWORD_ENV: &str = "MYSQL_PASSWORD";

/// Database account the dump is taken with.
#[derive(Clone)]
pub struct DbCredentials {
    pub user: String,
    pub password: String,
}

impl std::fmt::Debug for DbCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbCredentials")
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

impl DbCredentials {
    /// Reads [USER_ENV] and [PASSWORD_ENV].
    pub fn from_env() -> Result<Self, DumpError> {
        let user = std::env::var(USER_ENV).map_err(|_| DumpError::MissingEnv(USER_ENV))?;
        let password =
            std::env::var(PASSWORD_ENV).map_err(|_| DumpError::MissingEnv(PASSWORD_ENV))?;
        Ok(Self { user, password })
    }
}

/// Dumps MariaDB/MySQL databases with `mariadb-dump`.
#[derive(Debug, Clone)]
pub struct MariaDbDump {
    backup_root: PathBuf,
    command: String,
    credentials: DbCredentials,
}

impl MariaDbDump {
    pub fn new(backup_root: &Path, credentials: DbCredentials) -> Self {
        if backup_root.is_relative() {
            log::warn!(target: "dump::mariadb", "backup_root is relative: {}", backup_root.display());
        }

        Self {
            backup_root: backup_root.to_path_buf(),
            command: DEFAULT_DUMP_COMMAND.to_string(),
            credentials,
        }
    }

    /// Use another executable than [DEFAULT_DUMP_COMMAND], e.g. `mysqldump`.
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    fn dump_command(&self, database: &str) -> Command {
        let mut command = Command::new(&self.command);
        command
            .arg("--opt") // sensible dump defaults
            .arg("--single-transaction")
            .arg(format!("--user={}", self.credentials.user))
            .arg(database)
            // keeps the password out of the process list
            .env("MYSQL_PWD", &self.credentials.password)
            .stdout(Stdio::piped());
        command
    }
}

impl Dump for MariaDbDump {
    fn dump(&self, request: &DumpRequest, dry_run: bool) -> Result<BackupArtifact, DumpError> {
        let database = request.database.as_str();
        validate_database_name(database)?;
        log::info!(target: "dump::mariadb", "Create database dump of: {database}");
        log::trace!(target: "dump::mariadb", "Using user '{}' for the dump", self.credentials.user);

        let dump_dir = backup_dir(&self.backup_root, request.periodicity);
        if !dry_run {
            fs::create_dir_all(&dump_dir).map_err(|source| DumpError::Destination {
                path: dump_dir.clone(),
                source,
            })?;
        }
        let file_name = backup_file_name(database, &request.requested_at, request.compress);
        let file_path = dump_dir.join(&file_name);
        log::debug!(target: "dump::mariadb", "Save database dump at: {}", file_path.display());

        let mut dump_process =
            self.dump_command(database)
                .spawn()
                .map_err(|source| DumpError::Spawn {
                    command: self.command.clone(),
                    source,
                })?;
        log::trace!(target: "dump::mariadb", "Started {} process.", self.command);

        let stdout = dump_process
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("dump process has no stdout"))?;
        let mut reader = BufReader::new(stdout);
        let written = if dry_run {
            log::trace!(target: "dump::mariadb", "Discarding output of {} on dry-run", self.command);
            io::copy(&mut reader, &mut io::sink())
        } else {
            // a dump of the same day and periodicity is replaced
            File::create(&file_path).and_then(|file| {
                if request.compress {
                    let mut encoder = GzEncoder::new(file, Compression::default());
                    let written = io::copy(&mut reader, &mut encoder)?;
                    encoder.finish()?;
                    Ok(written)
                } else {
                    let mut file = file;
                    io::copy(&mut reader, &mut file)
                }
            })
        };

        if written.is_err() {
            // the tool would block forever on a full pipe nobody reads
            drop(reader);
            if let Err(e) = dump_process.kill() {
                log::warn!(target: "dump::mariadb", "Killing {} failed: {e}", self.command);
            }
        }
        let exit_status = dump_process.wait()?;
        let outcome = match written {
            Err(e) => Err(DumpError::Io(e)),
            Ok(_) if !exit_status.success() => Err(DumpError::Failed {
                database: database.to_string(),
                status: exit_status,
            }),
            Ok(bytes) => Ok(bytes),
        };

        let bytes = match outcome {
            Ok(bytes) => bytes,
            Err(e) => {
                if !dry_run {
                    if let Err(rm) = fs::remove_file(&file_path) {
                        log::warn!(target: "dump::mariadb", "Removing partial dump {} failed: {rm}", file_path.display());
                    }
                }
                return Err(e);
            }
        };

        log::info!(
            target: "dump::mariadb",
            "Finished dump of database {database} ({bytes} bytes) as {file_name} at {}",
            dump_dir.display()
        );

        Ok(BackupArtifact {
            file_path,
            file_name,
            created_at: request.requested_at,
        })
    }
}
