use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use log::LevelFilter;

use crate::config::DEFAULT_CONFIG_PATH;
use crate::scheduler::Periodicity;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Verbosity of the command output.
    #[arg(long)]
    pub verbose: Option<LevelFilter>,

    /// Configuration file, created with defaults if missing.
    #[arg(long, short = 'c', env = "DRIVE_BACKUP_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Simulative backup run: dumps are discarded, nothing is uploaded.
    #[arg(long)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub action: Option<Action>,
}

#[derive(Subcommand, Debug)]
pub enum Action {
    /// Backup the configured databases once. (Default)
    Run(RunArgs),
    /// Backup the configured databases on their schedule until interrupted.
    Schedule,
    /// Obtain and save the Google Drive token.
    Authorize,
}

impl Default for Action {
    fn default() -> Self {
        Self::Run(RunArgs::default())
    }
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Only backup the jobs of this database.
    #[arg(long, short = 'd')]
    pub database: Option<String>,

    /// Only backup the jobs of this periodicity.
    #[arg(long, short = 'p', value_enum)]
    pub periodicity: Option<Periodicity>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_is_the_default_action() {
        let cli = Cli::try_parse_from(["drive_backup"]).unwrap();
        assert!(matches!(
            cli.action.unwrap_or_default(),
            Action::Run(RunArgs {
                database: None,
                periodicity: None
            })
        ));
        assert!(!cli.dry_run);
    }

    #[test]
    fn run_accepts_a_database() {
        let cli = Cli::try_parse_from([
            "drive_backup",
            "--dry-run",
            "--verbose",
            "debug",
            "run",
            "--database",
            "prueba",
            "--periodicity",
            "weekly",
        ])
        .unwrap();

        assert!(cli.dry_run);
        assert_eq!(cli.verbose, Some(LevelFilter::Debug));
        assert!(matches!(
            cli.action,
            Some(Action::Run(RunArgs {
                database: Some(ref db),
                periodicity: Some(Periodicity::Weekly)
            })) if db == "prueba"
        ));
    }

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
