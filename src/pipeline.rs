//! One backup run of a configured job.
//!
//! The destination is resolved before anything is dumped: a missing shared
//! drive or folder fails the run without touching the database.

use std::sync::Arc;

use chrono_tz::Tz;
use derive_more::{Display, Error, From};
use tokio::task::JoinError;

use crate::auth::{AuthError, CredentialStore};
use crate::config::JobConfig;
use crate::drive::{DriveClient, DriveError, Retryability, UploadedFile, DEFAULT_API_BASE};
use crate::dump::{BackupArtifact, Dump, DumpError, DumpRequest};
use crate::scheduler::{Clock, Periodicity, SystemClock};

#[derive(Debug, Display, Error, From)]
/// Errors on a backup run, one variant per stage.
pub enum PipelineError {
    #[from]
    #[display("Authorization failed: {_0}")]
    Auth(AuthError),
    #[display("Looking up the upload destination failed: {_0}")]
    Lookup(DriveError),
    #[display("Shared drive {_0} not found")]
    DriveNotFound(#[error(ignore)] String),
    #[display("Folder {folder} not found in shared drive {drive}")]
    FolderNotFound { drive: String, folder: String },
    #[from]
    #[display("Dump failed: {_0}")]
    Dump(DumpError),
    #[display("Upload failed: {_0}")]
    Upload(DriveError),
    #[from]
    #[display("Dump task failed: {_0}")]
    Task(JoinError),
}

impl PipelineError {
    pub fn retryability(&self) -> Retryability {
        match self {
            Self::Auth(e) => e.retryability(),
            Self::Lookup(e) | Self::Upload(e) => e.retryability(),
            // the database may be down or the disk full for a moment
            Self::Dump(DumpError::Failed { .. } | DumpError::Io(_)) => Retryability::Retryable,
            Self::DriveNotFound(_) | Self::FolderNotFound { .. } | Self::Dump(_) | Self::Task(_) => {
                Retryability::Fatal
            }
        }
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub database: String,
    pub periodicity: Periodicity,
    pub artifact: BackupArtifact,
    /// [None] on a dry run.
    pub uploaded: Option<UploadedFile>,
}

/// Dumps databases with `D` and uploads the dumps to a shared drive.
pub struct Pipeline<D> {
    store: CredentialStore,
    http: reqwest::Client,
    api_base: String,
    shared_drive: String,
    dump: Arc<D>,
    tz: Tz,
    clock: Arc<dyn Clock>,
}

impl<D: Dump + Send + Sync + 'static> Pipeline<D> {
    pub fn new(
        store: CredentialStore,
        http: reqwest::Client,
        shared_drive: impl Into<String>,
        dump: D,
        tz: Tz,
    ) -> Self {
        Self {
            store,
            http,
            api_base: DEFAULT_API_BASE.to_string(),
            shared_drive: shared_drive.into(),
            dump: Arc::new(dump),
            tz,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub fn with_clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Backs up the database of `job`.
    ///
    /// # Dry Run
    ///
    /// On a dry run (`dry_run=true`) the destination is resolved and the dump
    /// is taken but discarded, nothing is uploaded.
    pub async fn run(&self, job: &JobConfig, dry_run: bool) -> Result<RunReport, PipelineError> {
        log::info!(target: "pipeline", "Starting {} backup of {}", job.periodicity, job.database);

        let credential = self.store.authorize(&self.http).await?;
        let client = DriveClient::new(
            self.http.clone(),
            self.store.clone(),
            credential,
            self.api_base.as_str(),
        );

        let drive = client
            .find_shared_drive(&self.shared_drive)
            .await
            .map_err(PipelineError::Lookup)?
            .ok_or_else(|| PipelineError::DriveNotFound(self.shared_drive.clone()))?;
        let folder = client
            .find_folder(&drive.id, &job.folder)
            .await
            .map_err(PipelineError::Lookup)?
            .ok_or_else(|| PipelineError::FolderNotFound {
                drive: drive.name.clone(),
                folder: job.folder.clone(),
            })?;
        log::debug!(target: "pipeline", "Uploading to folder {} ({}) of {}", folder.name, folder.id, drive.name);

        let request = DumpRequest {
            database: job.database.clone(),
            periodicity: job.periodicity,
            requested_at: self.clock.now().with_timezone(&self.tz),
            compress: job.compress,
        };
        let dump = Arc::clone(&self.dump);
        let artifact = tokio::task::spawn_blocking(move || dump.dump(&request, dry_run)).await??;

        let uploaded = if dry_run {
            log::info!(target: "pipeline", "Skipping upload of {} on dry-run", artifact.file_name);
            None
        } else {
            let uploaded = client
                .upload(&drive, &folder, &artifact.file_path, &artifact.file_name)
                .await
                .map_err(PipelineError::Upload)?;
            Some(uploaded)
        };

        Ok(RunReport {
            database: job.database.clone(),
            periodicity: job.periodicity,
            artifact,
            uploaded,
        })
    }
}
