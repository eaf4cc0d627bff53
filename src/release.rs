//! Single-host release cutover:
//! `Idle → BackingUp → Fetching → Building → Stopping → Swapping → Starting →
//! HealthGating → {Active | RollingBack} → Idle`.
//!
//! Nothing on the host is mutated before `Stopping`. From `Stopping` on, any failure
//! (including an operator interrupt) restores the pre-deploy backup and restarts it.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tracing::{error, info, warn};

use crate::artifact::{Artifact, ArtifactFetcher};
use crate::backup::{Backup, BackupManager};
use crate::cancel::CancelToken;
use crate::channel::{shell_quote, LocalChannel, RemoteChannel, RemoteHost};
use crate::cli::{ReleaseArgs, ReleaseCommands};
use crate::config::{load_config, redacted_json, save_config, CutoverConfig};
use crate::constants::MAX_STATE_HISTORY;
use crate::error::CutoverError;
use crate::health::{status_predicate, HealthCheckResult, HealthProber};
use crate::lock::{release_lock_key, LeaseLock, LockOptions};
use crate::paths::{live_dir, lock_root, previous_dir, state_path};
use crate::utils::remove_path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseStage {
    Idle,
    BackingUp,
    Fetching,
    Building,
    Stopping,
    Swapping,
    Starting,
    HealthGating,
    Active,
    RollingBack,
}

impl fmt::Display for ReleaseStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReleaseStage::Idle => "Idle",
            ReleaseStage::BackingUp => "BackingUp",
            ReleaseStage::Fetching => "Fetching",
            ReleaseStage::Building => "Building",
            ReleaseStage::Stopping => "Stopping",
            ReleaseStage::Swapping => "Swapping",
            ReleaseStage::Starting => "Starting",
            ReleaseStage::HealthGating => "HealthGating",
            ReleaseStage::Active => "Active",
            ReleaseStage::RollingBack => "RollingBack",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    Pending,
    Active,
    Failed,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub artifact: Artifact,
    pub host: String,
    pub state: DeploymentState,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub backup_id: Option<String>,
    #[serde(default)]
    pub health: Option<HealthCheckResult>,
    #[serde(default)]
    pub detail: Option<String>,
}

/// On-disk record of what runs on this host. Backups and the lease stay authoritative.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReleaseState {
    #[serde(default)]
    pub current: Option<Deployment>,
    #[serde(default)]
    pub previous: Option<Deployment>,
    #[serde(default)]
    pub in_flight: Option<Deployment>,
    #[serde(default)]
    pub history: Vec<Deployment>,
}

impl ReleaseState {
    fn begin(&mut self, deployment: &Deployment) {
        self.in_flight = Some(deployment.clone());
    }

    fn finish(&mut self, deployment: &Deployment) {
        self.in_flight = None;
        if deployment.state == DeploymentState::Active {
            self.previous = self.current.take();
            self.current = Some(deployment.clone());
        }
        self.history.push(deployment.clone());
        if self.history.len() > MAX_STATE_HISTORY {
            let excess = self.history.len() - MAX_STATE_HISTORY;
            self.history.drain(..excess);
        }
    }
}

pub fn load_state(path: &Path) -> Result<ReleaseState> {
    if !path.exists() {
        return Ok(ReleaseState::default());
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read release state at {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse release state at {}", path.display()))
}

fn save_state(path: &Path, state: &ReleaseState) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let contents = serde_json::to_string_pretty(state)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, contents)
        .with_context(|| format!("Failed to write release state at {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("Failed to write release state at {}", path.display()))?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct RestoreReport {
    pub backup: Backup,
    pub safety: Option<Backup>,
    pub health: HealthCheckResult,
}

pub struct ReleaseManager<'a, C: RemoteChannel + ?Sized> {
    config: &'a CutoverConfig,
    channel: &'a C,
    host: RemoteHost,
    backups: BackupManager,
    prober: HealthProber,
    cancel: CancelToken,
}

impl<'a, C: RemoteChannel + ?Sized> ReleaseManager<'a, C> {
    pub fn new(config: &'a CutoverConfig, channel: &'a C, cancel: CancelToken) -> Result<Self> {
        let host = config.resolve_host(&config.release.host)?;
        if !host.is_local() {
            bail!(
                "Release host '{}' is not this machine; run cutover on the host being released",
                config.release.host
            );
        }
        let prober = HealthProber::new(config.release.health.attempt_timeout())?;
        Ok(Self {
            config,
            channel,
            host,
            backups: BackupManager::from_config(config),
            prober,
            cancel,
        })
    }

    fn target(&self) -> &str {
        &self.config.release.name
    }

    fn lock(&self, purpose: &str) -> Result<LeaseLock> {
        LeaseLock::acquire(
            &lock_root(self.config),
            &release_lock_key(&self.host.key()),
            purpose,
            &LockOptions {
                wait: Duration::from_secs(self.config.lock_wait_seconds),
                stale_after: Duration::from_secs(self.config.lock_stale_seconds),
            },
        )
    }

    fn stage(&self, stage: ReleaseStage) {
        info!(stage = %stage, host = %self.host.name, outcome = "started", "release stage");
    }

    fn run(&self, command: &str, cwd: Option<&Path>, timeout: Duration) -> Result<()> {
        let command = match cwd {
            Some(dir) => format!("cd {} && {command}", shell_quote(&dir.display().to_string())),
            None => command.to_string(),
        };
        self.channel.exec_checked(&self.host, &command, timeout)?;
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let timeout = self.config.command_timeout();
        self.run(&self.config.release.stop_command, None, timeout)
    }

    fn start(&self, live: &Path) -> Result<()> {
        let timeout = self.config.command_timeout();
        self.run(&self.config.release.start_command, Some(live), timeout)
    }

    fn probe(&self) -> HealthCheckResult {
        let health = &self.config.release.health;
        self.prober.probe(
            &health.url,
            &health.backoff(),
            status_predicate(&health.expected_status),
        )
    }

    pub fn deploy(&self, reference: &str) -> Result<Deployment> {
        let _lease = self.lock("release deploy")?;
        let live = live_dir(self.config);
        let previous = previous_dir(self.config);
        let staging = self.staging_dir(&live)?;

        self.cancel.check("BackingUp")?;
        self.stage(ReleaseStage::BackingUp);
        let backup = if live.is_dir() {
            Some(self.backups.snapshot_dir(self.target(), &live)?)
        } else {
            info!(
                stage = %ReleaseStage::BackingUp,
                live = %live.display(),
                outcome = "skipped",
                "no live release; first deploy"
            );
            None
        };

        self.cancel.check("Fetching")?;
        self.stage(ReleaseStage::Fetching);
        let fetcher = ArtifactFetcher::new(
            self.channel,
            &self.host,
            &self.config.release.fetch_command,
            self.config.command_timeout(),
        );
        let (artifact, bundle_root) = fetcher.fetch(reference, staging.path())?;
        info!(
            stage = %ReleaseStage::Fetching,
            artifact = %artifact.id,
            outcome = "ok",
            "artifact fetched"
        );

        let state_file = state_path(self.config);
        let mut state = load_state(&state_file)?;
        let mut deployment = Deployment {
            artifact,
            host: self.host.name.clone(),
            state: DeploymentState::Pending,
            started_at: Utc::now(),
            finished_at: None,
            backup_id: backup.as_ref().map(|b| b.id.clone()),
            health: None,
            detail: None,
        };
        state.begin(&deployment);
        save_state(&state_file, &state)?;

        let prepared = self
            .cancel
            .check("Building")
            .and_then(|()| self.build(&bundle_root))
            .and_then(|()| self.cancel.check("Stopping"))
            .and_then(|()| match &backup {
                Some(backup) => self.backups.verify_present(backup),
                None => Ok(()),
            });
        if let Err(err) = prepared {
            error!(
                outcome = "aborted",
                error = %format!("{err:#}"),
                "release aborted before any change"
            );
            deployment.state = DeploymentState::Failed;
            deployment.detail = Some(format!("{err:#}"));
            deployment.finished_at = Some(Utc::now());
            state.finish(&deployment);
            save_state(&state_file, &state)?;
            return Err(err);
        }

        let outcome = self.cut_over(&bundle_root, &live, &previous, backup.is_none());
        let failure = match outcome {
            Ok(health) if health.passed => {
                deployment.health = Some(health);
                self.commit(&mut deployment, &previous);
                state.finish(&deployment);
                save_state(&state_file, &state)?;
                return Ok(deployment);
            }
            Ok(health) => {
                let err = anyhow::Error::new(CutoverError::HealthGateFailed {
                    attempts: health.attempts,
                    detail: health.summary(),
                });
                deployment.health = Some(health);
                err
            }
            Err(err) => err,
        };

        error!(
            outcome = "failed",
            error = %format!("{failure:#}"),
            "release failed after stop; rolling back"
        );
        let result = self.roll_back(backup.as_ref(), &live, &previous, &failure);
        deployment.finished_at = Some(Utc::now());
        deployment.detail = Some(format!("{failure:#}"));
        deployment.state = match &result {
            Ok(()) => DeploymentState::RolledBack,
            Err(_) => DeploymentState::Failed,
        };
        state.finish(&deployment);
        save_state(&state_file, &state)?;
        drop(staging);

        result?;
        if let Some(CutoverError::Cancelled { stage }) = failure.downcast_ref::<CutoverError>() {
            return Err(CutoverError::Cancelled {
                stage: stage.clone(),
            }
            .into());
        }
        Err(CutoverError::RolledBack(format!("{failure:#}")).into())
    }

    /// Scratch dir beside the live dir so the swap is a same-filesystem rename.
    fn staging_dir(&self, live: &Path) -> Result<TempDir> {
        let parent = live
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));
        fs::create_dir_all(&parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
        let name = live
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "live".to_string());
        tempfile::Builder::new()
            .prefix(&format!(".{name}.staging-"))
            .tempdir_in(&parent)
            .with_context(|| format!("Failed to create staging dir in {}", parent.display()))
    }

    fn build(&self, bundle_root: &Path) -> Result<()> {
        self.stage(ReleaseStage::Building);
        for command in &self.config.release.build_commands {
            info!(stage = %ReleaseStage::Building, command = %command, "running build step");
            self.run(command, Some(bundle_root), self.config.build_timeout())
                .with_context(|| format!("Build step failed: {command}"))?;
        }
        Ok(())
    }

    /// Stop, swap, start and probe. Returns the gate result; errors mean the
    /// sequence broke before the gate.
    fn cut_over(
        &self,
        bundle_root: &Path,
        live: &Path,
        previous: &Path,
        first_deploy: bool,
    ) -> Result<HealthCheckResult> {
        self.stage(ReleaseStage::Stopping);
        if let Err(err) = self.stop() {
            if !first_deploy {
                return Err(err.context("Stop command failed"));
            }
            warn!(
                stage = %ReleaseStage::Stopping,
                error = %err,
                "stop failed on first deploy; continuing"
            );
        }

        self.cancel.check("Swapping")?;
        self.stage(ReleaseStage::Swapping);
        remove_path(previous).with_context(|| format!("Failed to clear {}", previous.display()))?;
        if live.exists() {
            fs::rename(live, previous)
                .with_context(|| format!("Failed to move {} aside", live.display()))?;
        }
        if let Err(err) = fs::rename(bundle_root, live) {
            if previous.exists() {
                let _ = fs::rename(previous, live);
            }
            return Err(err)
                .with_context(|| format!("Failed to move new release into {}", live.display()));
        }

        self.cancel.check("Starting")?;
        self.stage(ReleaseStage::Starting);
        self.start(live).context("Start command failed")?;

        self.cancel.check("HealthGating")?;
        self.stage(ReleaseStage::HealthGating);
        let health = self.probe();
        let outcome = if health.passed { "passed" } else { "failed" };
        info!(
            stage = %ReleaseStage::HealthGating,
            outcome,
            attempts = health.attempts,
            "health gate"
        );
        Ok(health)
    }

    fn commit(&self, deployment: &mut Deployment, previous: &Path) {
        deployment.state = DeploymentState::Active;
        deployment.finished_at = Some(Utc::now());
        if let Err(err) = remove_path(previous) {
            warn!(path = %previous.display(), error = %err, "failed to remove previous release");
        }
        self.backups.prune(self.target());
        info!(
            stage = %ReleaseStage::Active,
            artifact = %deployment.artifact.id,
            outcome = "committed",
            "release active"
        );
    }

    fn roll_back(
        &self,
        backup: Option<&Backup>,
        live: &Path,
        previous: &Path,
        cause: &anyhow::Error,
    ) -> Result<()> {
        self.stage(ReleaseStage::RollingBack);
        let Some(backup) = backup else {
            error!(
                stage = %ReleaseStage::RollingBack,
                outcome = "skipped",
                "first deploy has no backup; new release left in place"
            );
            bail!("Release failed with no backup to roll back to: {cause:#}");
        };

        if let Err(err) = self.stop() {
            warn!(stage = %ReleaseStage::RollingBack, error = %err, "stop before restore failed");
        }
        self.backups
            .restore_dir(backup, live)
            .context("Rollback restore failed; manual intervention required")?;
        if let Err(err) = remove_path(previous) {
            warn!(path = %previous.display(), error = %err, "failed to remove previous release");
        }
        self.start(live)
            .context("Restart after rollback failed; manual intervention required")?;

        let health = self.probe();
        if health.passed {
            info!(
                stage = %ReleaseStage::RollingBack,
                backup = %backup.id,
                outcome = "restored",
                "{}",
                health.summary()
            );
        } else {
            error!(
                stage = %ReleaseStage::RollingBack,
                backup = %backup.id,
                outcome = "restored-unhealthy",
                "{}",
                health.summary()
            );
        }
        Ok(())
    }

    pub fn backup(&self) -> Result<Backup> {
        let _lease = self.lock("release backup")?;
        let live = live_dir(self.config);
        if !live.is_dir() {
            bail!("No live release at {}", live.display());
        }
        self.backups.snapshot_dir(self.target(), &live)
    }

    pub fn backups(&self) -> Result<Vec<Backup>> {
        self.backups.list(self.target())
    }

    /// Puts a backup back in place: stop, restore (with safety snapshot), start, probe.
    pub fn restore(&self, backup_id: &str) -> Result<RestoreReport> {
        let _lease = self.lock("release restore")?;
        let backup = self.backups.find(backup_id)?;
        if backup.target != self.target() {
            bail!(
                "Backup {} belongs to '{}', not '{}'",
                backup.id,
                backup.target,
                self.target()
            );
        }
        self.backups.verify_present(&backup)?;
        let live = live_dir(self.config);

        self.cancel.check("Stopping")?;
        self.stop().context("Stop command failed; nothing restored")?;
        let safety = self.backups.restore_dir(&backup, &live)?;
        self.start(&live).context("Start after restore failed")?;
        let health = self.probe();
        if !health.passed {
            return Err(CutoverError::HealthGateFailed {
                attempts: health.attempts,
                detail: health.summary(),
            }
            .into());
        }
        info!(backup = %backup.id, outcome = "restored", "release restored from backup");
        Ok(RestoreReport {
            backup,
            safety,
            health,
        })
    }

    pub fn status(&self) -> Result<ReleaseState> {
        load_state(&state_path(self.config))
    }
}

pub fn handle(args: ReleaseArgs, config_path: &Path, cancel: CancelToken) -> Result<()> {
    let config = load_config(config_path)?;
    let channel = LocalChannel::new();
    match args.command {
        ReleaseCommands::Deploy(args) => {
            let manager = ReleaseManager::new(&config, &channel, cancel)?;
            let deployment = manager.deploy(&args.reference)?;
            println!(
                "Deployed {} ({}) on {}",
                deployment.artifact.id, deployment.artifact.reference, deployment.host
            );
            if let Some(health) = deployment.health.as_ref() {
                println!("Health: {}", health.summary());
            }
            match deployment.backup_id.as_deref() {
                Some(id) => println!("Pre-deploy backup: {id}"),
                None => println!("Pre-deploy backup: none (first deploy)"),
            }
        }
        ReleaseCommands::Backup => {
            let manager = ReleaseManager::new(&config, &channel, cancel)?;
            let backup = manager.backup()?;
            println!("Created backup {} at {}", backup.id, backup.location);
        }
        ReleaseCommands::Restore(args) => {
            let manager = ReleaseManager::new(&config, &channel, cancel)?;
            let report = manager.restore(&args.backup_id)?;
            println!("Restored {} ({})", report.backup.id, report.health.summary());
            if let Some(safety) = report.safety {
                println!("Replaced release saved as {}", safety.id);
            }
        }
        ReleaseCommands::Backups(args) => {
            let manager = ReleaseManager::new(&config, &channel, cancel)?;
            let backups = manager.backups()?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&backups)?);
            } else if backups.is_empty() {
                println!("No backups for {}", config.release.name);
            } else {
                for backup in backups {
                    let marker = if backup.retention_eligible { "  (next prune)" } else { "" };
                    println!("{}  {}{marker}", backup.id, backup.location);
                }
            }
        }
        ReleaseCommands::Status => {
            let state = load_state(&state_path(&config))?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        ReleaseCommands::Config(args) => {
            if args.write {
                save_config(config_path, &config)?;
                println!("Wrote {}", config_path.display());
            }
            println!("{}", redacted_json(&config)?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::LocalChannel;
    use crate::test_support::{spawn_health_server, test_config};
    use std::collections::BTreeMap;
    use walkdir::WalkDir;

    const HEALTHY: &str = r#"{"status":"healthy"}"#;
    const UNHEALTHY: &str = r#"{"status":"unhealthy"}"#;

    fn tree(dir: &Path) -> BTreeMap<String, Vec<u8>> {
        WalkDir::new(dir)
            .into_iter()
            .map(|entry| entry.unwrap())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| {
                let rel = entry.path().strip_prefix(dir).unwrap().display().to_string();
                (rel, fs::read(entry.path()).unwrap())
            })
            .collect()
    }

    fn write_release(root: &Path, name: &str, body: &str) -> String {
        let dir = root.join("artifacts").join(name);
        fs::create_dir_all(dir.join("public")).unwrap();
        fs::write(dir.join("index.js"), body).unwrap();
        fs::write(dir.join("public/style.css"), format!("/* {name} */")).unwrap();
        dir.display().to_string()
    }

    fn process_log(root: &Path) -> Vec<String> {
        fs::read_to_string(root.join("process.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn staging_remnants(live: &Path) -> Vec<String> {
        let parent = live.parent().unwrap();
        fs::read_dir(parent)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
            .filter(|name| name != "current")
            .collect()
    }

    #[test]
    fn first_deploy_activates_without_backup() {
        let dir = tempfile::tempdir().unwrap();
        let server = spawn_health_server(vec![(200, HEALTHY)]);
        let config = test_config(dir.path(), &server.url("/health"));
        let channel = LocalChannel::new();
        let manager = ReleaseManager::new(&config, &channel, CancelToken::new()).unwrap();

        let v1 = write_release(dir.path(), "v1", "console.log('v1')\n");
        let deployment = manager.deploy(&v1).unwrap();

        assert_eq!(deployment.state, DeploymentState::Active);
        assert!(deployment.backup_id.is_none());
        assert!(deployment.health.as_ref().unwrap().passed);
        let live = live_dir(&config);
        assert_eq!(fs::read_to_string(live.join("index.js")).unwrap(), "console.log('v1')\n");
        assert_eq!(process_log(dir.path()), vec!["stop", "start"]);
        assert!(manager.backups().unwrap().is_empty());

        let state = manager.status().unwrap();
        assert_eq!(state.current.unwrap().artifact.id, deployment.artifact.id);
        assert!(state.in_flight.is_none());
    }

    #[test]
    fn each_successful_release_leaves_one_backup_and_retention_caps_them() {
        let dir = tempfile::tempdir().unwrap();
        let server = spawn_health_server(vec![(200, HEALTHY)]);
        let config = test_config(dir.path(), &server.url("/health"));
        let channel = LocalChannel::new();
        let manager = ReleaseManager::new(&config, &channel, CancelToken::new()).unwrap();

        manager
            .deploy(&write_release(dir.path(), "v0", "console.log('v0')\n"))
            .unwrap();
        let mut backup_ids = Vec::new();
        for i in 1..=6 {
            let reference = write_release(
                dir.path(),
                &format!("v{i}"),
                &format!("console.log('v{i}')\n"),
            );
            let deployment = manager.deploy(&reference).unwrap();
            backup_ids.push(deployment.backup_id.unwrap());
            assert_eq!(manager.backups().unwrap().len(), i.min(5));
        }

        let remaining: Vec<String> = manager.backups().unwrap().into_iter().map(|b| b.id).collect();
        assert!(!remaining.contains(&backup_ids[0]));
        assert_eq!(remaining[0], backup_ids[5]);
        assert!(staging_remnants(&live_dir(&config)).is_empty());

        let state = manager.status().unwrap();
        assert_eq!(state.history.len(), 7);
        assert!(state.previous.is_some());
    }

    #[test]
    fn failed_health_gate_restores_previous_release_and_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let good = spawn_health_server(vec![(200, HEALTHY)]);
        let mut config = test_config(dir.path(), &good.url("/health"));
        let channel = LocalChannel::new();
        ReleaseManager::new(&config, &channel, CancelToken::new())
            .unwrap()
            .deploy(&write_release(dir.path(), "v1", "console.log('v1')\n"))
            .unwrap();
        let live = live_dir(&config);
        let before = tree(&live);

        let bad = spawn_health_server(vec![(503, UNHEALTHY)]);
        config.release.health.url = bad.url("/health");
        let manager = ReleaseManager::new(&config, &channel, CancelToken::new()).unwrap();
        let err = manager
            .deploy(&write_release(dir.path(), "v2", "console.log('v2')\n"))
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<CutoverError>(),
            Some(CutoverError::RolledBack(_))
        ));
        assert_eq!(tree(&live), before);
        assert_eq!(
            process_log(dir.path()),
            vec!["stop", "start", "stop", "start", "stop", "start"]
        );
        assert!(staging_remnants(&live).is_empty());
        // gate attempts plus the re-probe after restart
        assert_eq!(bad.hits(), 6);

        let state = manager.status().unwrap();
        let last = state.history.last().unwrap();
        assert_eq!(last.state, DeploymentState::RolledBack);
        assert!(!last.health.as_ref().unwrap().passed);
        assert_eq!(state.current.unwrap().artifact.reference, before_reference(dir.path()));
    }

    fn before_reference(root: &Path) -> String {
        root.join("artifacts/v1").display().to_string()
    }

    #[test]
    fn build_or_fetch_failure_leaves_live_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let server = spawn_health_server(vec![(200, HEALTHY)]);
        let mut config = test_config(dir.path(), &server.url("/health"));
        let channel = LocalChannel::new();
        ReleaseManager::new(&config, &channel, CancelToken::new())
            .unwrap()
            .deploy(&write_release(dir.path(), "v1", "console.log('v1')\n"))
            .unwrap();
        let live = live_dir(&config);
        let before = tree(&live);
        let log_before = process_log(dir.path());

        let missing = dir.path().join("artifacts/absent").display().to_string();
        let manager = ReleaseManager::new(&config, &channel, CancelToken::new()).unwrap();
        let err = manager.deploy(&missing).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CutoverError>(),
            Some(CutoverError::ArtifactMissing { .. })
        ));

        config.release.build_commands = vec!["exit 7".to_string()];
        let manager = ReleaseManager::new(&config, &channel, CancelToken::new()).unwrap();
        let err = manager
            .deploy(&write_release(dir.path(), "v2", "console.log('v2')\n"))
            .unwrap_err();
        assert!(format!("{err:#}").contains("Build step failed"));

        assert_eq!(tree(&live), before);
        assert_eq!(process_log(dir.path()), log_before);
        assert!(staging_remnants(&live).is_empty());
        let state = manager.status().unwrap();
        assert_eq!(state.history.last().unwrap().state, DeploymentState::Failed);
        assert!(state.in_flight.is_none());
    }

    #[test]
    fn concurrent_deploy_on_same_host_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let server = spawn_health_server(vec![(200, HEALTHY)]);
        let mut config = test_config(dir.path(), &server.url("/health"));
        config.release.build_commands = vec!["sleep 1".to_string()];
        let channel = LocalChannel::new();
        let v1 = write_release(dir.path(), "v1", "console.log('v1')\n");
        let v2 = write_release(dir.path(), "v2", "console.log('v2')\n");

        let (first, second) = std::thread::scope(|scope| {
            let first = scope.spawn(|| {
                ReleaseManager::new(&config, &channel, CancelToken::new())
                    .unwrap()
                    .deploy(&v1)
            });
            std::thread::sleep(Duration::from_millis(300));
            let second = ReleaseManager::new(&config, &channel, CancelToken::new())
                .unwrap()
                .deploy(&v2);
            (first.join().unwrap(), second)
        });

        assert!(first.is_ok());
        let err = second.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CutoverError>(),
            Some(CutoverError::LockHeld { .. })
        ));
        assert_eq!(
            fs::read_to_string(live_dir(&config).join("index.js")).unwrap(),
            "console.log('v1')\n"
        );
    }

    #[test]
    fn interrupt_before_stopping_aborts_without_changes() {
        let dir = tempfile::tempdir().unwrap();
        let server = spawn_health_server(vec![(200, HEALTHY)]);
        let config = test_config(dir.path(), &server.url("/health"));
        let channel = LocalChannel::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let manager = ReleaseManager::new(&config, &channel, cancel).unwrap();

        let err = manager
            .deploy(&write_release(dir.path(), "v1", "console.log('v1')\n"))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CutoverError>(),
            Some(CutoverError::Cancelled { .. })
        ));
        assert!(!live_dir(&config).exists());
        assert!(process_log(dir.path()).is_empty());
    }

    #[test]
    fn interrupt_after_stopping_rolls_back_and_reports_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let server = spawn_health_server(vec![(200, HEALTHY)]);
        let mut config = test_config(dir.path(), &server.url("/health"));
        let channel = LocalChannel::new();
        ReleaseManager::new(&config, &channel, CancelToken::new())
            .unwrap()
            .deploy(&write_release(dir.path(), "v1", "console.log('v1')\n"))
            .unwrap();
        let live = live_dir(&config);
        let before = tree(&live);

        // The stop command raises a marker; a watcher turns it into an operator interrupt
        // while the service is down.
        let marker = dir.path().join("stopped.marker");
        config.release.stop_command = format!(
            "{} && touch {} && sleep 0.5",
            config.release.stop_command,
            marker.display()
        );
        let cancel = CancelToken::new();
        let watcher = {
            let cancel = cancel.clone();
            let marker = marker.clone();
            std::thread::spawn(move || {
                for _ in 0..500 {
                    if marker.exists() {
                        cancel.cancel();
                        return;
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
            })
        };
        let manager = ReleaseManager::new(&config, &channel, cancel).unwrap();
        let err = manager
            .deploy(&write_release(dir.path(), "v2", "console.log('v2')\n"))
            .unwrap_err();
        watcher.join().unwrap();

        assert!(matches!(
            err.downcast_ref::<CutoverError>(),
            Some(CutoverError::Cancelled { .. })
        ));
        assert_eq!(crate::error::exit_code_for(&err), 130);
        assert_eq!(tree(&live), before);
        assert_eq!(
            process_log(dir.path()),
            vec!["stop", "start", "stop", "stop", "start"]
        );
        assert!(staging_remnants(&live).is_empty());
        let state = manager.status().unwrap();
        assert_eq!(state.history.last().unwrap().state, DeploymentState::RolledBack);
    }

    #[test]
    fn start_failure_after_swap_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let server = spawn_health_server(vec![(200, HEALTHY)]);
        let mut config = test_config(dir.path(), &server.url("/health"));
        config.release.start_command = format!(
            "if grep -q v2 index.js; then exit 1; fi; echo start >> {}",
            dir.path().join("process.log").display()
        );
        let channel = LocalChannel::new();
        let manager = ReleaseManager::new(&config, &channel, CancelToken::new()).unwrap();
        manager
            .deploy(&write_release(dir.path(), "v1", "console.log('v1')\n"))
            .unwrap();
        let live = live_dir(&config);
        let before = tree(&live);

        let err = manager
            .deploy(&write_release(dir.path(), "v2", "console.log('v2')\n"))
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<CutoverError>(),
            Some(CutoverError::RolledBack(detail)) if detail.contains("Start command failed")
        ));
        assert_eq!(crate::error::exit_code_for(&err), 2);
        assert_eq!(tree(&live), before);
        // The failed start logs nothing; the rollback stops and starts v1 again.
        assert_eq!(
            process_log(dir.path()),
            vec!["stop", "start", "stop", "stop", "start"]
        );
        assert!(!previous_dir(&config).exists());
        let state = manager.status().unwrap();
        let last = state.history.last().unwrap();
        assert_eq!(last.state, DeploymentState::RolledBack);
        assert!(last.health.is_none());
    }

    #[test]
    fn restore_puts_backup_back_and_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let server = spawn_health_server(vec![(200, HEALTHY)]);
        let config = test_config(dir.path(), &server.url("/health"));
        let channel = LocalChannel::new();
        let manager = ReleaseManager::new(&config, &channel, CancelToken::new()).unwrap();
        manager
            .deploy(&write_release(dir.path(), "v1", "console.log('v1')\n"))
            .unwrap();
        let live = live_dir(&config);
        let v1_tree = tree(&live);
        let backup = manager.backup().unwrap();
        manager
            .deploy(&write_release(dir.path(), "v2", "console.log('v2')\n"))
            .unwrap();

        let report = manager.restore(&backup.id).unwrap();
        assert_eq!(tree(&live), v1_tree);
        assert!(report.safety.is_some());
        assert!(report.health.passed);
        assert_eq!(process_log(dir.path()).last().map(String::as_str), Some("start"));
        assert!(manager.restore("web_20000101_000000_000").is_err());
    }
}
