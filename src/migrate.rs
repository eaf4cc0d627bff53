//! Host-to-host database migration: preflight, export, transfer, import, verify and
//! an unconditional cleanup.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tracing::{error, info, warn};

use crate::backoff::{retry, Sleeper, ThreadSleeper};
use crate::backup::{Backup, DatabaseBackups};
use crate::cancel::CancelToken;
use crate::channel::{router_for, shell_quote, RemoteChannel, RemoteHost};
use crate::cli::{MigrateArgs, MigrateCommands};
use crate::config::{load_config, CutoverConfig};
use crate::error::{ChannelError, CutoverError};
use crate::lock::{database_lock_key, migration_lock_key, LeaseLock, LockOptions};
use crate::paths::{lock_root, staging_root};
use crate::utils::{render_template, validate_identifier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Preflight,
    Exporting,
    Transferring,
    Importing,
    Verifying,
    Complete,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionMismatch {
    pub collection: String,
    pub expected: Option<u64>,
    pub actual: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationJob {
    pub id: String,
    pub source: String,
    pub target: String,
    pub database: String,
    pub archive: Option<String>,
    pub status: MigrationStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub source_counts: BTreeMap<String, u64>,
    pub target_counts: BTreeMap<String, u64>,
    pub target_backup: Option<String>,
    pub mismatches: Vec<CollectionMismatch>,
}

impl MigrationJob {
    fn transition(&mut self, status: MigrationStatus) {
        info!(
            job = %self.id,
            database = %self.database,
            stage = ?status,
            outcome = "started",
            "migration stage"
        );
        self.status = status;
    }
}

/// Output of the configured count command.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DatabaseCounts {
    pub exists: bool,
    #[serde(default)]
    pub collections: BTreeMap<String, u64>,
}

#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub host: String,
    pub database: String,
    pub counts: BTreeMap<String, u64>,
    pub expected: Option<BTreeMap<String, u64>>,
    pub mismatches: Vec<CollectionMismatch>,
}

/// Collections whose counts differ, including ones present on only one side.
pub fn compare_counts(
    expected: &BTreeMap<String, u64>,
    actual: &BTreeMap<String, u64>,
) -> Vec<CollectionMismatch> {
    let names: BTreeSet<&String> = expected.keys().chain(actual.keys()).collect();
    names
        .into_iter()
        .filter_map(|name| {
            let expected = expected.get(name).copied();
            let actual = actual.get(name).copied();
            (expected != actual).then(|| CollectionMismatch {
                collection: name.clone(),
                expected,
                actual,
            })
        })
        .collect()
}

fn parse_counts(stdout: &str) -> Result<DatabaseCounts> {
    let line = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| line.starts_with('{'))
        .with_context(|| format!("Count command printed no JSON: {}", stdout.trim()))?;
    serde_json::from_str(line).with_context(|| format!("Invalid count output: {line}"))
}

/// Scratch locations of one run. Names carry the run timestamp and a prefix of the job
/// id, so runs of one database to different targets never share a file.
struct RunPaths {
    export_dir: String,
    source_archive: String,
    target_archive: String,
    import_dir: String,
    file_name: String,
}

impl RunPaths {
    fn new(
        source: &RemoteHost,
        target: &RemoteHost,
        database: &str,
        stamp: &str,
        job_id: &str,
    ) -> Self {
        let source_work = source.work_dir.trim_end_matches('/');
        let target_work = target.work_dir.trim_end_matches('/');
        let run = format!("{stamp}_{}", &job_id[..job_id.len().min(8)]);
        let file_name = format!("export_{database}_{run}.tar.gz");
        Self {
            export_dir: format!("{source_work}/export-{database}-{run}"),
            source_archive: format!("{source_work}/{file_name}"),
            target_archive: format!("{target_work}/import_{database}_{run}.tar.gz"),
            import_dir: format!("{target_work}/import-{database}-{run}"),
            file_name,
        }
    }
}

pub struct MigrationOrchestrator<'a, C: RemoteChannel + ?Sized> {
    config: &'a CutoverConfig,
    channel: &'a C,
    cancel: CancelToken,
    sleeper: Arc<dyn Sleeper + Send + Sync>,
}

impl<'a, C: RemoteChannel + ?Sized> MigrationOrchestrator<'a, C> {
    pub fn new(config: &'a CutoverConfig, channel: &'a C, cancel: CancelToken) -> Self {
        Self {
            config,
            channel,
            cancel,
            sleeper: Arc::new(ThreadSleeper),
        }
    }

    #[cfg(test)]
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper + Send + Sync>) -> Self {
        self.sleeper = sleeper;
        self
    }

    fn lock_options(&self) -> LockOptions {
        LockOptions {
            wait: Duration::from_secs(self.config.lock_wait_seconds),
            stale_after: Duration::from_secs(self.config.lock_stale_seconds),
        }
    }

    fn backups(&self) -> DatabaseBackups<'_, C> {
        DatabaseBackups::new(self.channel, self.config)
    }

    pub fn counts(&self, host: &RemoteHost, database: &str) -> Result<DatabaseCounts> {
        let command = render_template(
            &self.config.migration.count_command,
            &[("uri", &shell_quote(&host.mongo_uri)), ("db", database)],
        );
        let output = self
            .channel
            .exec_checked(host, &command, self.config.command_timeout())?;
        parse_counts(&output.stdout)
    }

    /// Moves `database` from `source` to `target`. Verification mismatches are
    /// warnings unless `strict_verify` is set.
    pub fn run(
        &self,
        source: &str,
        target: &str,
        database: &str,
        strict_verify: bool,
    ) -> Result<MigrationJob> {
        validate_identifier("database", database)?;
        let source = self.config.resolve_host(source)?;
        let target = self.config.resolve_host(target)?;
        let options = self.lock_options();
        let lease = LeaseLock::acquire(
            &lock_root(self.config),
            &migration_lock_key(&source.key(), &target.key(), database),
            "migrate run",
            &options,
        )?;
        let _target_lease = LeaseLock::acquire(
            &lock_root(self.config),
            &database_lock_key(&target.key(), database),
            "migrate run",
            &options,
        )?;

        let mut job = MigrationJob {
            id: uuid::Uuid::new_v4().to_string(),
            source: source.name.clone(),
            target: target.name.clone(),
            database: database.to_string(),
            archive: None,
            status: MigrationStatus::Preflight,
            started_at: Utc::now(),
            finished_at: None,
            source_counts: BTreeMap::new(),
            target_counts: BTreeMap::new(),
            target_backup: None,
            mismatches: Vec::new(),
        };
        let stamp = job.started_at.format("%Y%m%d_%H%M%S").to_string();
        let paths = RunPaths::new(&source, &target, database, &stamp, &job.id);
        let staging_parent = staging_root(self.config);
        fs::create_dir_all(&staging_parent)
            .with_context(|| format!("Failed to create {}", staging_parent.display()))?;
        let staging = tempfile::Builder::new()
            .prefix(&format!("migrate-{database}-"))
            .tempdir_in(&staging_parent)
            .with_context(|| {
                format!("Failed to create staging dir in {}", staging_parent.display())
            })?;

        info!(
            job = %job.id,
            source = %source.name,
            target = %target.name,
            database,
            lease = lease.key(),
            "migration started"
        );

        let outcome = self.run_stages(
            &mut job,
            &source,
            &target,
            &paths,
            staging.path(),
            strict_verify,
        );
        self.cleanup(&job, &source, &target, &paths, staging);
        job.finished_at = Some(Utc::now());

        match outcome {
            Ok(()) => {
                job.status = MigrationStatus::Complete;
                info!(
                    job = %job.id,
                    stage = "Complete",
                    outcome = "ok",
                    warnings = job.mismatches.len(),
                    "migration complete"
                );
                Ok(job)
            }
            Err(err) => {
                error!(
                    job = %job.id,
                    stage = ?job.status,
                    outcome = "failed",
                    error = %format!("{err:#}"),
                    "migration failed"
                );
                job.status = MigrationStatus::Failed;
                Err(err)
            }
        }
    }

    fn run_stages(
        &self,
        job: &mut MigrationJob,
        source: &RemoteHost,
        target: &RemoteHost,
        paths: &RunPaths,
        staging: &Path,
        strict_verify: bool,
    ) -> Result<()> {
        let database = job.database.clone();
        let timeout = self.config.command_timeout();

        self.cancel.check("Preflight")?;
        job.transition(MigrationStatus::Preflight);
        let source_counts = self.counts(source, &database).map_err(|err| {
            CutoverError::SourceUnavailable {
                host: source.name.clone(),
                reason: format!("{err:#}"),
            }
        })?;
        if !source_counts.exists {
            return Err(CutoverError::DatabaseNotFound {
                host: source.name.clone(),
                database,
            }
            .into());
        }
        self.channel
            .exec_checked(target, "true", timeout)
            .with_context(|| format!("Target {} is not reachable", target.name))?;

        self.cancel.check("Exporting")?;
        job.transition(MigrationStatus::Exporting);
        let dump = render_template(
            &self.config.migration.dump_command,
            &[
                ("uri", &shell_quote(&source.mongo_uri)),
                ("db", &database),
                ("dir", &shell_quote(&paths.export_dir)),
            ],
        );
        let pack = render_template(
            &self.config.migration.archive_command,
            &[
                ("archive", &shell_quote(&paths.source_archive)),
                ("dir", &shell_quote(&paths.export_dir)),
            ],
        );
        let export = format!(
            "mkdir -p {work} && {dump} && {pack} && test -s {archive}",
            work = shell_quote(&source.work_dir),
            archive = shell_quote(&paths.source_archive),
        );
        self.channel
            .exec_checked(source, &export, timeout)
            .with_context(|| format!("Export of {database} on {} failed", source.name))?;
        job.archive = Some(paths.source_archive.clone());
        // Verify compares against what was dumped, not what existed at preflight.
        let exported = self.counts(source, &database).map_err(|err| {
            CutoverError::SourceUnavailable {
                host: source.name.clone(),
                reason: format!("{err:#}"),
            }
        })?;
        job.source_counts = exported.collections;

        self.cancel.check("Transferring")?;
        job.transition(MigrationStatus::Transferring);
        let local_archive = staging.join(&paths.file_name);
        let policy = self.config.transfer_backoff();
        retry(&policy, self.sleeper.as_ref(), ChannelError::is_transient, |attempt| {
            if attempt > 1 {
                warn!(job = %job.id, attempt, "retrying archive download");
            }
            self.channel.fetch(source, &paths.source_archive, &local_archive)
        })
        .with_context(|| format!("Failed to fetch archive from {}", source.name))?;
        retry(&policy, self.sleeper.as_ref(), ChannelError::is_transient, |attempt| {
            if attempt > 1 {
                warn!(job = %job.id, attempt, "retrying archive upload");
            }
            self.channel.copy(&local_archive, target, &paths.target_archive)
        })
        .with_context(|| format!("Failed to copy archive to {}", target.name))?;

        self.cancel.check("Importing")?;
        job.transition(MigrationStatus::Importing);
        let existing = self.counts(target, &database)?;
        if existing.exists && !self.config.migration.backup_before_import {
            bail!(
                "{database} already exists on {} and backup_before_import is off; \
                 refusing to drop it without a snapshot",
                target.name
            );
        }
        let safety = self.backups().import_archive(
            target,
            &database,
            &paths.target_archive,
            &paths.import_dir,
            existing.exists,
        )?;
        job.target_backup = safety.map(|backup| backup.id);

        self.cancel.check("Verifying")?;
        job.transition(MigrationStatus::Verifying);
        let imported = self.counts(target, &database)?;
        job.target_counts = imported.collections;
        job.mismatches = compare_counts(&job.source_counts, &job.target_counts);
        for mismatch in &job.mismatches {
            warn!(
                job = %job.id,
                collection = %mismatch.collection,
                expected = ?mismatch.expected,
                actual = ?mismatch.actual,
                "document count mismatch"
            );
        }
        if strict_verify && !job.mismatches.is_empty() {
            return Err(CutoverError::VerifyMismatch(job.mismatches.len()).into());
        }
        Ok(())
    }

    /// Removes every scratch file of the run. Failures are logged and swallowed.
    fn cleanup(
        &self,
        job: &MigrationJob,
        source: &RemoteHost,
        target: &RemoteHost,
        paths: &RunPaths,
        staging: TempDir,
    ) {
        info!(job = %job.id, stage = "Cleanup", outcome = "started", "migration stage");
        let timeout = self.config.command_timeout();
        let remote = [
            (
                source,
                format!(
                    "rm -rf {} {}",
                    shell_quote(&paths.export_dir),
                    shell_quote(&paths.source_archive)
                ),
            ),
            (
                target,
                format!(
                    "rm -rf {} {}",
                    shell_quote(&paths.target_archive),
                    shell_quote(&paths.import_dir)
                ),
            ),
        ];
        for (host, command) in remote {
            if let Err(err) = self.channel.exec_checked(host, &command, timeout) {
                warn!(job = %job.id, host = %host.name, error = %err, "cleanup failed");
            }
        }
        let staging_path = staging.path().to_path_buf();
        if let Err(err) = staging.close() {
            warn!(
                job = %job.id,
                path = %staging_path.display(),
                error = %err,
                "failed to remove local staging"
            );
        }
    }

    /// Counts on `target`, compared against `source` when given.
    pub fn verify(
        &self,
        target: &str,
        database: &str,
        source: Option<&str>,
    ) -> Result<VerifyReport> {
        validate_identifier("database", database)?;
        let target = self.config.resolve_host(target)?;
        let counts = self.counts(&target, database)?;
        if !counts.exists {
            return Err(CutoverError::DatabaseNotFound {
                host: target.name.clone(),
                database: database.to_string(),
            }
            .into());
        }
        let expected = match source {
            Some(source) => {
                let source = self.config.resolve_host(source)?;
                let source_counts = self.counts(&source, database).map_err(|err| {
                    CutoverError::SourceUnavailable {
                        host: source.name.clone(),
                        reason: format!("{err:#}"),
                    }
                })?;
                Some(source_counts.collections)
            }
            None => None,
        };
        let mismatches = expected
            .as_ref()
            .map(|expected| compare_counts(expected, &counts.collections))
            .unwrap_or_default();
        for mismatch in &mismatches {
            warn!(
                collection = %mismatch.collection,
                expected = ?mismatch.expected,
                actual = ?mismatch.actual,
                "document count mismatch"
            );
        }
        Ok(VerifyReport {
            host: target.name,
            database: database.to_string(),
            counts: counts.collections,
            expected,
            mismatches,
        })
    }

    /// Re-imports a database snapshot on `host`, snapshotting the current data first.
    pub fn restore(&self, host: &str, backup_id: &str) -> Result<(Backup, Option<Backup>)> {
        let host = self.config.resolve_host(host)?;
        let backups = self.backups();
        let backup = backups.find(&host, backup_id)?;
        let _lease = LeaseLock::acquire(
            &lock_root(self.config),
            &database_lock_key(&host.key(), &backup.target),
            "migrate restore",
            &self.lock_options(),
        )?;
        self.cancel.check("Importing")?;
        let existing = self.counts(&host, &backup.target)?;
        if !existing.exists {
            warn!(
                host = %host.name,
                database = %backup.target,
                "database absent; restoring without a safety snapshot"
            );
        }
        let safety = backups.restore(&host, &backup, existing.exists)?;
        Ok((backup, safety))
    }
}

fn print_mismatches(mismatches: &[CollectionMismatch]) {
    for mismatch in mismatches {
        let show = |count: Option<u64>| {
            count
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string())
        };
        println!(
            "  {}: expected {}, found {}",
            mismatch.collection,
            show(mismatch.expected),
            show(mismatch.actual)
        );
    }
}

pub fn handle(args: MigrateArgs, config_path: &Path, cancel: CancelToken) -> Result<()> {
    let config = load_config(config_path)?;
    let channel = router_for(&config);
    let orchestrator = MigrationOrchestrator::new(&config, &channel, cancel);
    match args.command {
        MigrateCommands::Run(args) => {
            let strict = args.strict_verify || config.migration.strict_verify;
            let job = orchestrator.run(&args.source, &args.target, &args.database, strict)?;
            println!(
                "Migrated {} from {} to {} (job {})",
                job.database, job.source, job.target, job.id
            );
            for (collection, count) in &job.target_counts {
                println!("  {collection}: {count}");
            }
            if let Some(backup) = job.target_backup.as_deref() {
                println!("Previous target data saved as {backup}");
            }
            if !job.mismatches.is_empty() {
                println!("Warning: {} collection(s) differ:", job.mismatches.len());
                print_mismatches(&job.mismatches);
            }
        }
        MigrateCommands::Verify(args) => {
            let strict = args.strict_verify || config.migration.strict_verify;
            let report = orchestrator.verify(&args.target, &args.database, args.source.as_deref())?;
            println!("{} on {}:", report.database, report.host);
            for (collection, count) in &report.counts {
                println!("  {collection}: {count}");
            }
            if report.expected.is_some() {
                if report.mismatches.is_empty() {
                    println!("All collection counts match the source");
                } else {
                    println!("Warning: {} collection(s) differ:", report.mismatches.len());
                    print_mismatches(&report.mismatches);
                    if strict {
                        return Err(CutoverError::VerifyMismatch(report.mismatches.len()).into());
                    }
                }
            }
        }
        MigrateCommands::Restore(args) => {
            let (backup, safety) = orchestrator.restore(&args.host, &args.backup_id)?;
            println!("Restored {} on {}", backup.id, args.host);
            if let Some(safety) = safety {
                println!("Replaced data saved as {}", safety.id);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::RecordingSleeper;
    use crate::channel::{ExecOutput, LocalChannel};
    use crate::config::{default_config, HostConfig};
    use crate::test_support::{fake_db_host, seed_collection, use_fake_db_tools};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Fixture {
        _dir: tempfile::TempDir,
        config: CutoverConfig,
        old: HostConfig,
        new: HostConfig,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = default_config();
        config.state_root = dir.path().join("state").display().to_string();
        config.command_timeout_seconds = 30;
        config.migration.transfer_initial_delay_ms = 10;
        use_fake_db_tools(&mut config);
        let old = fake_db_host(dir.path(), "db-old");
        let new = fake_db_host(dir.path(), "db-new");
        config.hosts.insert("db-old".to_string(), old.clone());
        config.hosts.insert("db-new".to_string(), new.clone());
        Fixture {
            _dir: dir,
            config,
            old,
            new,
        }
    }

    fn mismatch(
        collection: &str,
        expected: Option<u64>,
        actual: Option<u64>,
    ) -> CollectionMismatch {
        CollectionMismatch {
            collection: collection.to_string(),
            expected,
            actual,
        }
    }

    fn counts(entries: &[(&str, u64)]) -> BTreeMap<String, u64> {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn dir_entries(path: &str) -> Vec<String> {
        match fs::read_dir(path) {
            Ok(entries) => entries
                .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Local channel whose first transfers fail as if the host dropped off.
    struct FlakyChannel {
        inner: LocalChannel,
        fetch_failures: AtomicU32,
    }

    impl RemoteChannel for FlakyChannel {
        fn copy(&self, local: &Path, host: &RemoteHost, remote: &str) -> Result<(), ChannelError> {
            self.inner.copy(local, host, remote)
        }

        fn fetch(&self, host: &RemoteHost, remote: &str, local: &Path) -> Result<(), ChannelError> {
            if self.fetch_failures.load(Ordering::SeqCst) > 0 {
                self.fetch_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(ChannelError::Unreachable {
                    host: host.name.clone(),
                    reason: "connection reset".to_string(),
                });
            }
            self.inner.fetch(host, remote, local)
        }

        fn exec(
            &self,
            host: &RemoteHost,
            command: &str,
            timeout: Duration,
        ) -> Result<ExecOutput, ChannelError> {
            if host.name == "db-down" {
                return Err(ChannelError::Unreachable {
                    host: host.name.clone(),
                    reason: "connection refused".to_string(),
                });
            }
            self.inner.exec(host, command, timeout)
        }
    }

    #[test]
    fn compare_counts_reports_differences_and_missing_collections() {
        let expected = counts(&[("users", 10), ("books", 3)]);
        assert!(compare_counts(&expected, &expected).is_empty());

        let actual = counts(&[("users", 9), ("loans", 1)]);
        let mismatches = compare_counts(&expected, &actual);
        assert_eq!(
            mismatches,
            vec![
                mismatch("books", Some(3), None),
                mismatch("loans", None, Some(1)),
                mismatch("users", Some(10), Some(9)),
            ]
        );
    }

    #[test]
    fn count_output_tolerates_leading_noise() {
        let parsed = parse_counts(concat!(
            "Current Mongosh Log ID: 1\n",
            "{\"exists\":true,\"collections\":{\"users\":2}}\n"
        ))
        .unwrap();
        assert!(parsed.exists);
        assert_eq!(parsed.collections, counts(&[("users", 2)]));
        assert!(parse_counts("nothing here").is_err());
    }

    #[test]
    fn database_moves_with_matching_counts_and_leaves_no_scratch_files() {
        let fx = fixture();
        seed_collection(&fx.old, "library", "users", 10);
        seed_collection(&fx.old, "library", "books", 3);
        let channel = LocalChannel::new();

        let job = MigrationOrchestrator::new(&fx.config, &channel, CancelToken::new())
            .run("db-old", "db-new", "library", false)
            .unwrap();

        assert_eq!(job.status, MigrationStatus::Complete);
        assert_eq!(job.source_counts, counts(&[("users", 10), ("books", 3)]));
        assert_eq!(job.target_counts, job.source_counts);
        assert!(job.mismatches.is_empty());
        assert!(job.target_backup.is_none());
        assert!(dir_entries(&fx.old.work_dir).is_empty(), "{:?}", dir_entries(&fx.old.work_dir));
        assert!(dir_entries(&fx.new.work_dir).is_empty(), "{:?}", dir_entries(&fx.new.work_dir));
        assert!(dir_entries(&staging_root(&fx.config).display().to_string()).is_empty());
    }

    #[test]
    fn runs_started_in_the_same_second_use_separate_scratch_paths() {
        let fx = fixture();
        let source = fx.config.resolve_host("db-old").unwrap();
        let target = fx.config.resolve_host("db-new").unwrap();
        let stamp = "20260101_120000";
        let first = RunPaths::new(&source, &target, "library", stamp, "0f2c9a1e-aaaa");
        let second = RunPaths::new(&source, &target, "library", stamp, "7b41d003-bbbb");
        assert_ne!(first.export_dir, second.export_dir);
        assert_ne!(first.source_archive, second.source_archive);
        assert_ne!(first.target_archive, second.target_archive);
        assert_ne!(first.import_dir, second.import_dir);
        assert_eq!(first.file_name, "export_library_20260101_120000_0f2c9a1e.tar.gz");
    }

    #[test]
    fn verify_baseline_is_taken_after_the_dump() {
        let mut fx = fixture();
        seed_collection(&fx.old, "library", "users", 10);
        // A write lands between preflight and the dump.
        fx.config.migration.dump_command = format!(
            "echo '{{\"_id\":10}}' >> {{uri}}/{{db}}/users.bson && {}",
            fx.config.migration.dump_command
        );
        let channel = LocalChannel::new();

        let job = MigrationOrchestrator::new(&fx.config, &channel, CancelToken::new())
            .run("db-old", "db-new", "library", true)
            .unwrap();
        assert_eq!(job.source_counts, counts(&[("users", 11)]));
        assert_eq!(job.target_counts, job.source_counts);
        assert!(job.archive.unwrap().contains(&job.id[..8]));
    }

    #[test]
    fn existing_target_is_not_dropped_without_a_snapshot() {
        let mut fx = fixture();
        fx.config.migration.backup_before_import = false;
        seed_collection(&fx.old, "library", "users", 10);
        seed_collection(&fx.new, "library", "users", 4);
        let channel = LocalChannel::new();

        let err = MigrationOrchestrator::new(&fx.config, &channel, CancelToken::new())
            .run("db-old", "db-new", "library", false)
            .unwrap_err();
        assert!(format!("{err:#}").contains("backup_before_import is off"), "{err:#}");
        let users =
            fs::read_to_string(Path::new(&fx.new.mongo_uri).join("library/users.bson")).unwrap();
        assert_eq!(users.lines().count(), 4);
        assert!(dir_entries(&fx.new.work_dir).is_empty(), "{:?}", dir_entries(&fx.new.work_dir));

        // An empty target needs no snapshot.
        fs::remove_dir_all(Path::new(&fx.new.mongo_uri).join("library")).unwrap();
        let job = MigrationOrchestrator::new(&fx.config, &channel, CancelToken::new())
            .run("db-old", "db-new", "library", false)
            .unwrap();
        assert_eq!(job.target_counts, counts(&[("users", 10)]));
    }

    #[test]
    fn count_mismatch_is_a_warning_unless_strict() {
        let mut fx = fixture();
        seed_collection(&fx.old, "library", "users", 10);
        seed_collection(&fx.old, "library", "books", 3);
        fx.config.migration.restore_command = format!(
            concat!(
                "{} && head -n 9 {{uri}}/{{db}}/users.bson > {{uri}}/{{db}}/users.tmp ",
                "&& mv {{uri}}/{{db}}/users.tmp {{uri}}/{{db}}/users.bson"
            ),
            fx.config.migration.restore_command
        );
        let channel = LocalChannel::new();
        let orchestrator = MigrationOrchestrator::new(&fx.config, &channel, CancelToken::new());

        let job = orchestrator.run("db-old", "db-new", "library", false).unwrap();
        assert_eq!(job.status, MigrationStatus::Complete);
        assert_eq!(
            job.mismatches,
            vec![mismatch("users", Some(10), Some(9))]
        );

        let err = orchestrator.run("db-old", "db-new", "library", true).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CutoverError>(),
            Some(CutoverError::VerifyMismatch(1))
        ));
        let target = fx.config.resolve_host("db-new").unwrap();
        let snapshots = DatabaseBackups::new(&channel, &fx.config)
            .list(&target, "library")
            .unwrap();
        assert_eq!(snapshots.len(), 1);

        let report = orchestrator.verify("db-new", "library", Some("db-old")).unwrap();
        assert_eq!(report.counts, counts(&[("users", 9), ("books", 3)]));
        assert_eq!(report.mismatches.len(), 1);
    }

    #[test]
    fn import_failure_still_cleans_up_everywhere() {
        let mut fx = fixture();
        seed_collection(&fx.old, "library", "users", 10);
        fx.config.migration.restore_command = "exit 3".to_string();
        let channel = LocalChannel::new();

        let err = MigrationOrchestrator::new(&fx.config, &channel, CancelToken::new())
            .run("db-old", "db-new", "library", false)
            .unwrap_err();

        assert!(format!("{err:#}").contains("Restore of library"));
        assert!(dir_entries(&fx.old.work_dir).is_empty(), "{:?}", dir_entries(&fx.old.work_dir));
        assert!(dir_entries(&fx.new.work_dir).is_empty(), "{:?}", dir_entries(&fx.new.work_dir));
        assert!(dir_entries(&staging_root(&fx.config).display().to_string()).is_empty());
        assert!(!Path::new(&fx.new.mongo_uri).join("library").exists());
    }

    #[test]
    fn missing_database_and_unreachable_source_fail_preflight() {
        let mut fx = fixture();
        let channel = FlakyChannel {
            inner: LocalChannel::new(),
            fetch_failures: AtomicU32::new(0),
        };
        let err = MigrationOrchestrator::new(&fx.config, &channel, CancelToken::new())
            .run("db-old", "db-new", "library", false)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CutoverError>(),
            Some(CutoverError::DatabaseNotFound { .. })
        ));

        let mut down = fx.old.clone();
        down.work_dir = format!("{}-down", fx.old.work_dir);
        fx.config.hosts.insert("db-down".to_string(), down);
        let err = MigrationOrchestrator::new(&fx.config, &channel, CancelToken::new())
            .run("db-down", "db-new", "library", false)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CutoverError>(),
            Some(CutoverError::SourceUnavailable { .. })
        ));
    }

    #[test]
    fn transient_transfer_failures_are_retried_with_backoff() {
        let fx = fixture();
        seed_collection(&fx.old, "library", "users", 2);
        let channel = FlakyChannel {
            inner: LocalChannel::new(),
            fetch_failures: AtomicU32::new(2),
        };
        let sleeper = Arc::new(RecordingSleeper::default());

        let job = MigrationOrchestrator::new(&fx.config, &channel, CancelToken::new())
            .with_sleeper(sleeper.clone())
            .run("db-old", "db-new", "library", false)
            .unwrap();

        assert_eq!(job.status, MigrationStatus::Complete);
        assert_eq!(
            sleeper.delays(),
            vec![Duration::from_millis(10), Duration::from_millis(20)]
        );
    }

    #[test]
    fn interrupted_migration_reports_cancelled() {
        let fx = fixture();
        seed_collection(&fx.old, "library", "users", 2);
        let channel = LocalChannel::new();
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = MigrationOrchestrator::new(&fx.config, &channel, cancel)
            .run("db-old", "db-new", "library", false)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CutoverError>(),
            Some(CutoverError::Cancelled { .. })
        ));
        assert!(dir_entries(&staging_root(&fx.config).display().to_string()).is_empty());
    }

    #[test]
    fn restore_reimports_a_database_snapshot() {
        let fx = fixture();
        seed_collection(&fx.new, "library", "users", 5);
        let channel = LocalChannel::new();
        let host = fx.config.resolve_host("db-new").unwrap();
        let snapshot = DatabaseBackups::new(&channel, &fx.config)
            .snapshot(&host, "library")
            .unwrap();
        seed_collection(&fx.new, "library", "users", 1);

        let (restored, safety) =
            MigrationOrchestrator::new(&fx.config, &channel, CancelToken::new())
                .restore("db-new", &snapshot.id)
            .unwrap();
        assert_eq!(restored.id, snapshot.id);
        assert!(safety.is_some());
        let users =
            fs::read_to_string(Path::new(&fx.new.mongo_uri).join("library/users.bson")).unwrap();
        assert_eq!(users.lines().count(), 5);
    }
}
