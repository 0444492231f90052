//! Configuration file of the backup jobs.
//!
//! The configuration is a TOML file. A missing file is created with the
//! [Default] configuration: a daily backup of the `prueba` database into the
//! folder `Backups` of the shared drive `UAPA`.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono_tz::Tz;
use derive_more::{Display, Error};

use crate::dump::mariadb::DEFAULT_DUMP_COMMAND;
use crate::dump::{validate_database_name, DumpError};
use crate::scheduler::Periodicity;

pub const DEFAULT_CONFIG_PATH: &str = "drive_backup.toml";

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
/// Configuration of the credential files, the dumps and all backup jobs.
pub struct Config {
    /// File the OAuth refresh token is saved to.
    pub token_path: PathBuf,

    /// OAuth client credentials downloaded from the Google Cloud console.
    pub credentials_path: PathBuf,

    /// Local directory dumps are written to, one sub folder per periodicity.
    pub backup_root: PathBuf,

    /// Time zone jobs are scheduled in and dump file names are dated in.
    pub time_zone: Tz,

    /// Dump executable, e.g. `mysqldump` on older installations.
    pub dump_command: String,

    /// Upper bound of a single HTTP request in seconds.
    ///
    /// With `0` requests never time out once connected.
    pub request_timeout_secs: u64,

    pub drive: DriveConfig,

    pub jobs: Vec<JobConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            token_path: PathBuf::from("token.json"),
            credentials_path: PathBuf::from("credentials.json"),
            backup_root: PathBuf::from("backups"),
            time_zone: chrono_tz::America::Bogota,
            dump_command: DEFAULT_DUMP_COMMAND.to_string(),
            request_timeout_secs: 300,
            drive: DriveConfig::default(),
            jobs: vec![JobConfig {
                database: "prueba".to_string(),
                periodicity: Periodicity::Daily,
                folder: "Backups".to_string(),
                compress: false,
            }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
/// Destination of all uploads.
pub struct DriveConfig {
    /// Name of the shared drive.
    pub shared_drive: String,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            shared_drive: "UAPA".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
/// A database backed up on a fixed cadence into one folder.
pub struct JobConfig {
    pub database: String,
    pub periodicity: Periodicity,
    /// Name of the folder inside the shared drive.
    pub folder: String,
    /// Gzip the dump before the upload.
    #[serde(default)]
    pub compress: bool,
}

impl JobConfig {
    /// Name the job is logged and scheduled under.
    pub fn name(&self) -> String {
        format!("{}-{}", self.database, self.periodicity)
    }
}

#[derive(Debug, Display, Error)]
/// Errors on loading the configuration.
pub enum ConfigError {
    #[display("Reading the config file {} failed: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[display("Parsing the config file {} failed: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[display("No backup jobs configured")]
    NoJobs,
    #[display("Job {database} ({periodicity}) is configured more than once")]
    DuplicateJob {
        database: String,
        periodicity: Periodicity,
    },
    #[display("Job {database} is invalid: {source}")]
    InvalidJob { database: String, source: DumpError },
}

impl Config {
    /// Reads the configuration at `path`.
    ///
    /// A missing file is replaced by the default configuration, which is
    /// also written to `path` for later editing.
    pub fn load_or_init(path: &Path) -> Result<Self, ConfigError> {
        let config = match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!(
                    "Writing default config to {} because it doesn't exist yet",
                    path.display()
                );
                let default_config = Self::default();
                match toml::to_string_pretty(&default_config) {
                    Ok(content) => {
                        if let Err(e) = std::fs::write(path, content) {
                            log::warn!("Writing default config to {} failed {e}", path.display());
                        }
                    }
                    Err(e) => log::warn!("Serializing the default config failed: {e}"),
                }

                default_config
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Checks the jobs for consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.jobs.is_empty() {
            return Err(ConfigError::NoJobs);
        }

        let mut seen = HashSet::new();
        for job in &self.jobs {
            validate_database_name(&job.database).map_err(|source| ConfigError::InvalidJob {
                database: job.database.clone(),
                source,
            })?;
            if !seen.insert((job.database.as_str(), job.periodicity)) {
                return Err(ConfigError::DuplicateJob {
                    database: job.database.clone(),
                    periodicity: job.periodicity,
                });
            }
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        match self.request_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Jobs matching `database` and `periodicity`, a missing filter matches all.
    pub fn jobs_for<'a>(
        &'a self,
        database: Option<&'a str>,
        periodicity: Option<Periodicity>,
    ) -> impl Iterator<Item = &'a JobConfig> {
        self.jobs.iter().filter(move |job| {
            database.is_none_or(|database| job.database == database)
                && periodicity.is_none_or(|periodicity| job.periodicity == periodicity)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_initialized_with_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(DEFAULT_CONFIG_PATH);

        let config = Config::load_or_init(&path).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.jobs[0].name(), "prueba-daily");

        // the written file reads back to the same configuration
        assert!(path.exists());
        assert_eq!(Config::load_or_init(&path).unwrap(), config);
    }

    #[test]
    fn jobs_are_read_from_toml() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("backup.toml");
        std::fs::write(
            &path,
            r#"
            time_zone = "Europe/Berlin"

            [drive]
            shared_drive = "Archive"

            [[jobs]]
            database = "prueba"
            periodicity = "weekly"
            folder = "Weekly"

            [[jobs]]
            database = "prueba"
            periodicity = "monthly"
            folder = "Monthly"
            compress = true
            "#,
        )
        .unwrap();

        let config = Config::load_or_init(&path).unwrap();
        assert_eq!(config.time_zone, chrono_tz::Europe::Berlin);
        assert_eq!(config.drive.shared_drive, "Archive");
        assert_eq!(config.token_path, PathBuf::from("token.json"));
        assert_eq!(config.jobs.len(), 2);
        assert_eq!(config.jobs[0].periodicity, Periodicity::Weekly);
        assert!(!config.jobs[0].compress);
        assert!(config.jobs[1].compress);
    }

    #[test]
    fn zero_request_timeout_disables_it() {
        let mut config: Config = toml::from_str("").unwrap();
        assert_eq!(config.request_timeout(), Some(Duration::from_secs(300)));

        config = toml::from_str("request_timeout_secs = 0").unwrap();
        assert_eq!(config.request_timeout(), None);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("backup.toml");
        std::fs::write(&path, "[[jobs]]\ndatabase = \"prueba\"\nperiodicity = \"hourly\"\n").unwrap();

        let err = Config::load_or_init(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }), "{err}");
    }

    #[test]
    fn duplicate_jobs_are_rejected() {
        let mut config = Config::default();
        config.jobs.push(config.jobs[0].clone());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateJob { .. })
        ));
    }

    #[test]
    fn jobs_need_valid_database_names() {
        let mut config = Config::default();
        config.jobs[0].database = "prueba; rm -rf /".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidJob { .. })));

        config.jobs.clear();
        assert!(matches!(config.validate(), Err(ConfigError::NoJobs)));
    }

    #[test]
    fn jobs_are_filtered_by_database() {
        let mut config = Config::default();
        config.jobs.push(JobConfig {
            database: "ventas".to_string(),
            periodicity: Periodicity::Weekly,
            folder: "Backups".to_string(),
            compress: true,
        });

        assert_eq!(config.jobs_for(None, None).count(), 2);
        let ventas: Vec<_> = config.jobs_for(Some("ventas"), None).collect();
        assert_eq!(ventas.len(), 1);
        assert_eq!(ventas[0].periodicity, Periodicity::Weekly);
        assert_eq!(config.jobs_for(Some("missing"), None).count(), 0);

        let weekly: Vec<_> = config.jobs_for(None, Some(Periodicity::Weekly)).collect();
        assert_eq!(weekly.len(), 1);
        assert_eq!(weekly[0].database, "ventas");
        assert_eq!(config.jobs_for(Some("prueba"), Some(Periodicity::Monthly)).count(), 0);
    }
}
