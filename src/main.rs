use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use drive_backup_lib::auth::CredentialStore;
use drive_backup_lib::cli::{Action, Cli, RunArgs};
use drive_backup_lib::config::Config;
use drive_backup_lib::drive;
use drive_backup_lib::dump::mariadb::{DbCredentials, MariaDbDump};
use drive_backup_lib::pipeline::Pipeline;
use drive_backup_lib::scheduler::Scheduler;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    dotenv::dotenv().ok();

    // init logger
    let mut env_logger = env_logger::builder();
    if let Some(level) = cli.verbose {
        env_logger.filter_level(level);
    }
    if let Err(e) = env_logger.try_init() {
        eprintln!("Initializing the logger failed: {e}");
    }

    let config = match Config::load_or_init(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            log::error!("Loading the config failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    let dry_run = cli.dry_run;
    if dry_run {
        log::warn!("Running in dry-run mode");
    }

    let http = match drive::http_client(config.request_timeout()) {
        Ok(http) => http,
        Err(e) => {
            log::error!("Building the HTTP client failed: {e}");
            return ExitCode::FAILURE;
        }
    };
    let store = CredentialStore::new(&config.token_path, &config.credentials_path);

    match cli.action.unwrap_or_default() {
        Action::Authorize => authorize(&store, &http).await,
        Action::Run(args) => match pipeline(&config, store, http) {
            Some(pipeline) => run(&config, &pipeline, args, dry_run).await,
            None => ExitCode::FAILURE,
        },
        Action::Schedule => match pipeline(&config, store, http) {
            Some(pipeline) => schedule(&config, Arc::new(pipeline), dry_run).await,
            None => ExitCode::FAILURE,
        },
    }
}

fn pipeline(
    config: &Config,
    store: CredentialStore,
    http: reqwest::Client,
) -> Option<Pipeline<MariaDbDump>> {
    let credentials = match DbCredentials::from_env() {
        Ok(credentials) => credentials,
        Err(e) => {
            log::error!(target: "dump::mariadb", "{e}");
            return None;
        }
    };
    let dump = MariaDbDump::new(&config.backup_root, credentials).with_command(&config.dump_command);

    Some(Pipeline::new(
        store,
        http,
        &config.drive.shared_drive,
        dump,
        config.time_zone,
    ))
}

async fn authorize(store: &CredentialStore, http: &reqwest::Client) -> ExitCode {
    let result = match store.authorize(http).await {
        // a refresh proves the saved token was not revoked
        Ok(mut credential) => store.bearer(&mut credential, http).await.map(|_| ()),
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => {
            log::info!(target: "auth", "Access to Google Drive is authorized");
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!(target: "auth", "Authorization failed ({}): {e}", e.retryability());
            ExitCode::FAILURE
        }
    }
}

async fn run(
    config: &Config,
    pipeline: &Pipeline<MariaDbDump>,
    args: RunArgs,
    dry_run: bool,
) -> ExitCode {
    let jobs: Vec<_> = config
        .jobs_for(args.database.as_deref(), args.periodicity)
        .collect();
    if jobs.is_empty() {
        log::error!("No job configured matching {args:?}");
        return ExitCode::FAILURE;
    }

    let mut failed = 0;
    for job in jobs {
        match pipeline.run(job, dry_run).await {
            Ok(report) => {
                log::info!(target: "pipeline", "Backup {} of {} completed", report.artifact.file_name, report.database)
            }
            Err(e) => {
                failed += 1;
                log::error!(
                    target: "pipeline",
                    "Backup of {} resulted in a fatal error ({}): {e}",
                    job.name(),
                    e.retryability()
                );
            }
        }
    }

    if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn schedule(config: &Config, pipeline: Arc<Pipeline<MariaDbDump>>, dry_run: bool) -> ExitCode {
    let scheduler = Scheduler::new(config.time_zone);

    let handles: Vec<_> = config
        .jobs
        .iter()
        .map(|job| {
            let pipeline = Arc::clone(&pipeline);
            let job = job.clone();
            scheduler.schedule(job.name(), job.periodicity, move || {
                let pipeline = Arc::clone(&pipeline);
                let job = job.clone();
                async move {
                    pipeline
                        .run(&job, dry_run)
                        .await
                        .map(|_| ())
                        .map_err(|e| format!("{e} ({})", e.retryability()))
                }
            })
        })
        .collect();

    let exit = match tokio::signal::ctrl_c().await {
        Ok(()) => {
            log::info!(target: "scheduler", "Interrupted, stopping {} jobs", handles.len());
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!(target: "scheduler", "Waiting for the interrupt signal failed: {e}");
            ExitCode::FAILURE
        }
    };

    for handle in handles {
        handle.stop().await;
    }

    exit
}
