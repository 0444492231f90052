//! Producers of local database dumps.
//!
//! Currently the following producers are implemented:
//!
//! - [MariaDbDump]: Plain or gzip compressed `mariadb-dump` of one database.

use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::LazyLock;

use chrono::DateTime;
use chrono_tz::Tz;
use derive_more::{Display, Error, From};
use regex::Regex;

use crate::scheduler::Periodicity;

pub mod mariadb;

pub use mariadb::MariaDbDump;

static DATABASE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_$-]+$").expect("database name pattern is valid"));

/// Generic database dump producer.
pub trait Dump {
    /// Dumps the database named in the [DumpRequest] into a local file.
    ///
    /// # Dry Run
    ///
    /// On a dry run (`dry_run=true`) the dump is performed but its output is
    /// discarded, no file is created.
    fn dump(&self, request: &DumpRequest, dry_run: bool) -> Result<BackupArtifact, DumpError>;
}

/// What to dump and when the dump was requested.
#[derive(Debug, Clone)]
pub struct DumpRequest {
    pub database: String,
    pub periodicity: Periodicity,
    /// Local time of the request, its date ends up in the file name.
    pub requested_at: DateTime<Tz>,
    pub compress: bool,
}

/// A dump on local disk, ready to be uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupArtifact {
    pub file_path: PathBuf,
    pub file_name: String,
    pub created_at: DateTime<Tz>,
}

/// Mime type a dump named `file_name` is uploaded with.
pub(crate) fn mime_type_for(file_name: &str) -> &'static str {
    if file_name.ends_with(".gz") {
        "application/gzip"
    } else {
        "application/sql"
    }
}

#[derive(Debug, Display, Error, From)]
/// Errors on dumping a database.
pub enum DumpError {
    /// The database name is unfit for a file name or command argument.
    #[display("Invalid database name: {_0:?}")]
    InvalidDatabaseName(#[error(ignore)] String),
    /// A required environment variable is not set.
    #[display("Environment variable {_0} is not set")]
    MissingEnv(#[error(ignore)] &'static str),
    /// The dump destination can't be created.
    #[display("Unable to create dump destination {}: {source}", path.display())]
    Destination { path: PathBuf, source: io::Error },
    /// The dump utility could not be started.
    #[display("Unable to run {command}: {source}")]
    Spawn { command: String, source: io::Error },
    /// The dump utility exited unsuccessfully.
    #[display("Dump of database {database} failed with {status}")]
    Failed {
        database: String,
        status: ExitStatus,
    },
    /// Writing the dump failed.
    #[from]
    Io(io::Error),
}

/// Checks that `database` can be used as part of a file name and as argument.
pub fn validate_database_name(database: &str) -> Result<(), DumpError> {
    if DATABASE_NAME.is_match(database) {
        Ok(())
    } else {
        Err(DumpError::InvalidDatabaseName(database.to_string()))
    }
}

/// File name of a dump of `database` taken at `at`.
///
/// The date is rendered day first: `prueba-18-10-2026.sql`.
pub fn backup_file_name(database: &str, at: &DateTime<Tz>, compress: bool) -> String {
    let date = at.format("%d-%m-%Y");
    if compress {
        format!("{database}-{date}.sql.gz")
    } else {
        format!("{database}-{date}.sql")
    }
}

/// Directory dumps of the given [Periodicity] are written to.
pub fn backup_dir(backup_root: &Path, periodicity: Periodicity) -> PathBuf {
    backup_root.join(periodicity.to_string())
}
