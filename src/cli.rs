use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "cutover",
    version,
    about = "Release cutover and database migration orchestrator"
)]
pub struct Cli {
    /// Config file (defaults to $CUTOVER_CONFIG, then /etc/cutover/config.json)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    Release(ReleaseArgs),
    Migrate(MigrateArgs),
    /// Probe the liveness endpoint once with the configured policy
    Health(HealthArgs),
}

#[derive(Args)]
pub struct ReleaseArgs {
    #[command(subcommand)]
    pub command: ReleaseCommands,
}

#[derive(Subcommand)]
pub enum ReleaseCommands {
    /// Back up, fetch, build, swap, start and health-gate a new artifact
    Deploy(DeployArgs),
    /// Snapshot the live release directory
    Backup,
    /// Put a backup back in place and restart
    Restore(ReleaseRestoreArgs),
    /// List release backups, newest first
    Backups(ListArgs),
    /// Show the recorded deployment state
    Status,
    /// Print the effective configuration with secrets redacted
    Config(ConfigArgs),
}

#[derive(Args)]
pub struct DeployArgs {
    /// s3://, http(s):// or local path to the artifact
    pub reference: String,
}

#[derive(Args)]
pub struct ReleaseRestoreArgs {
    pub backup_id: String,
}

#[derive(Args)]
pub struct ConfigArgs {
    /// Write the effective configuration back to the config file
    #[arg(long, default_value_t = false)]
    pub write: bool,
}

#[derive(Args)]
pub struct ListArgs {
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args)]
pub struct MigrateArgs {
    #[command(subcommand)]
    pub command: MigrateCommands,
}

#[derive(Subcommand)]
pub enum MigrateCommands {
    /// Move a database from one host to another
    Run(MigrateRunArgs),
    /// Report per-collection counts on a host, optionally against a source
    Verify(MigrateVerifyArgs),
    /// Re-import a database snapshot on its host
    Restore(MigrateRestoreArgs),
}

#[derive(Args)]
pub struct MigrateRunArgs {
    pub source: String,
    pub target: String,
    pub database: String,
    /// Fail the job when collection counts differ
    #[arg(long, default_value_t = false)]
    pub strict_verify: bool,
}

#[derive(Args)]
pub struct MigrateVerifyArgs {
    pub target: String,
    pub database: String,
    #[arg(long)]
    pub source: Option<String>,
    #[arg(long, default_value_t = false)]
    pub strict_verify: bool,
}

#[derive(Args)]
pub struct MigrateRestoreArgs {
    pub host: String,
    pub backup_id: String,
}

#[derive(Args)]
pub struct HealthArgs {
    #[arg(long)]
    pub url: Option<String>,
    #[arg(long, default_value_t = false)]
    pub json: bool,
}
