//! Timestamped `<target>_<YYYYMMDD_HHMMSS_mmm>.tar.gz` snapshots of application
//! directories (on this host) and databases (on their host), with restore and
//! newest-N retention.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use crate::channel::{shell_quote, RemoteChannel, RemoteHost};
use crate::config::{CutoverConfig, MigrationConfig};
use crate::constants::{BACKUP_EXT, BACKUP_TIMESTAMP_FORMAT};
use crate::error::CutoverError;
use crate::paths::sibling;
use crate::utils::{
    create_tar_gz, extract_tar_gz, remove_path, render_template, validate_identifier,
};

const TIMESTAMP_LEN: usize = 19;

static LAST_TIMESTAMP: Mutex<String> = Mutex::new(String::new());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    Directory,
    Database,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backup {
    pub id: String,
    pub target: String,
    pub timestamp: String,
    pub kind: BackupKind,
    pub location: String,
    pub host: Option<String>,
    /// True when the next prune would delete this snapshot.
    pub retention_eligible: bool,
}

pub fn backup_id(target: &str, timestamp: &str) -> String {
    format!("{target}_{timestamp}")
}

pub fn backup_file_name(id: &str) -> String {
    format!("{id}.{BACKUP_EXT}")
}

fn is_timestamp(value: &str) -> bool {
    value.len() == TIMESTAMP_LEN
        && value.char_indices().all(|(idx, c)| match idx {
            8 | 15 => c == '_',
            _ => c.is_ascii_digit(),
        })
}

/// Splits `<target>_<timestamp>` into its parts.
pub fn parse_backup_id(id: &str) -> Option<(&str, &str)> {
    if id.len() < TIMESTAMP_LEN + 2 {
        return None;
    }
    let split = id.len() - TIMESTAMP_LEN;
    if !id.is_char_boundary(split) {
        return None;
    }
    let (head, timestamp) = id.split_at(split);
    let target = head.strip_suffix('_')?;
    if target.is_empty() || !is_timestamp(timestamp) {
        return None;
    }
    Some((target, timestamp))
}

fn parse_backup_file(name: &str) -> Option<(&str, &str)> {
    let id = name.strip_suffix(&format!(".{BACKUP_EXT}"))?;
    parse_backup_id(id)
}

/// Ids of `target`'s snapshots beyond the newest `keep`, oldest last.
pub fn select_expired(file_names: &[String], target: &str, keep: usize) -> Vec<String> {
    let mut ids: Vec<(&str, &str)> = file_names
        .iter()
        .filter_map(|name| parse_backup_file(name))
        .filter(|(candidate, _)| *candidate == target)
        .collect();
    ids.sort_by(|a, b| b.1.cmp(a.1));
    ids.into_iter()
        .skip(keep)
        .map(|(target, timestamp)| backup_id(target, timestamp))
        .collect()
}

/// Millisecond timestamp, strictly increasing within this process.
fn next_timestamp() -> String {
    loop {
        let candidate = Utc::now().format(BACKUP_TIMESTAMP_FORMAT).to_string();
        match LAST_TIMESTAMP.lock() {
            Ok(mut last) => {
                if candidate > *last {
                    last.clone_from(&candidate);
                    return candidate;
                }
            }
            Err(_) => return candidate,
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn sorted_backups(
    file_names: &[String],
    target: &str,
    retention: usize,
    to_backup: impl Fn(&str, &str) -> Backup,
) -> Vec<Backup> {
    let mut found: Vec<(&str, &str)> = file_names
        .iter()
        .filter_map(|name| parse_backup_file(name))
        .filter(|(candidate, _)| *candidate == target)
        .collect();
    found.sort_by(|a, b| b.1.cmp(a.1));
    found
        .into_iter()
        .enumerate()
        .map(|(idx, (target, timestamp))| {
            let mut backup = to_backup(target, timestamp);
            backup.retention_eligible = idx >= retention;
            backup
        })
        .collect()
}

/// Directory snapshots stored on this host.
#[derive(Debug, Clone)]
pub struct BackupManager {
    root: PathBuf,
    retention: usize,
}

impl BackupManager {
    pub fn new(root: impl Into<PathBuf>, retention: usize) -> Self {
        Self {
            root: root.into(),
            retention: retention.max(1),
        }
    }

    pub fn from_config(config: &CutoverConfig) -> Self {
        Self::new(crate::paths::backup_root(config), config.retention_count)
    }

    fn directory_backup(&self, target: &str, timestamp: &str) -> Backup {
        let id = backup_id(target, timestamp);
        Backup {
            location: self.root.join(backup_file_name(&id)).display().to_string(),
            id,
            target: target.to_string(),
            timestamp: timestamp.to_string(),
            kind: BackupKind::Directory,
            host: None,
            retention_eligible: false,
        }
    }

    pub fn snapshot_dir(&self, target: &str, dir: &Path) -> Result<Backup> {
        validate_identifier("backup target", target)?;
        if !dir.is_dir() {
            bail!("Cannot snapshot {}: not a directory", dir.display());
        }
        fs::create_dir_all(&self.root)
            .with_context(|| format!("Failed to create backup dir {}", self.root.display()))?;

        let mut backup = self.directory_backup(target, &next_timestamp());
        while Path::new(&backup.location).exists() {
            backup = self.directory_backup(target, &next_timestamp());
        }
        let location = PathBuf::from(&backup.location);
        let partial = location.with_file_name(format!(".{}.partial", backup.id));
        if let Err(err) = create_tar_gz(dir, &partial) {
            let _ = fs::remove_file(&partial);
            return Err(err);
        }
        fs::rename(&partial, &location)
            .with_context(|| format!("Failed to finalize backup {}", location.display()))?;
        self.verify_present(&backup)?;
        tracing::info!(resource = target, backup = %backup.id, "directory snapshot created");

        self.prune(target);
        Ok(backup)
    }

    fn file_names(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to list {}", self.root.display()))
            }
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        Ok(names)
    }

    /// Snapshots of `target`, newest first.
    pub fn list(&self, target: &str) -> Result<Vec<Backup>> {
        let names = self.file_names()?;
        Ok(sorted_backups(&names, target, self.retention, |target, ts| {
            self.directory_backup(target, ts)
        }))
    }

    pub fn find(&self, id: &str) -> Result<Backup> {
        let id = id.trim().trim_end_matches(&format!(".{BACKUP_EXT}"));
        let Some((target, _)) = parse_backup_id(id) else {
            bail!("'{id}' is not a backup id (expected <target>_YYYYMMDD_HHMMSS_mmm)");
        };
        self.list(target)?
            .into_iter()
            .find(|backup| backup.id == id)
            .ok_or_else(|| CutoverError::BackupMissing(id.to_string()).into())
    }

    pub fn verify_present(&self, backup: &Backup) -> Result<()> {
        match fs::metadata(&backup.location) {
            Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(()),
            _ => Err(CutoverError::BackupMissing(backup.id.clone()).into()),
        }
    }

    /// Deletes all but the newest snapshots of `target`. Failures are only logged.
    pub fn prune(&self, target: &str) -> Vec<String> {
        let names = match self.file_names() {
            Ok(names) => names,
            Err(err) => {
                tracing::warn!(resource = target, error = %err, "backup prune skipped");
                return Vec::new();
            }
        };
        let mut deleted = Vec::new();
        for id in select_expired(&names, target, self.retention) {
            let path = self.root.join(backup_file_name(&id));
            match fs::remove_file(&path) {
                Ok(()) => {
                    tracing::info!(resource = target, backup = %id, "pruned backup");
                    deleted.push(id);
                }
                Err(err) => {
                    tracing::warn!(
                        resource = target,
                        backup = %id,
                        error = %err,
                        "failed to prune backup"
                    )
                }
            }
        }
        deleted
    }

    /// Replaces `dir` with the contents of `backup`. The current contents are
    /// snapshotted first; that safety snapshot is returned.
    pub fn restore_dir(&self, backup: &Backup, dir: &Path) -> Result<Option<Backup>> {
        self.verify_present(backup)?;
        let staged = sibling(dir, "restore");
        remove_path(&staged)
            .with_context(|| format!("Failed to clear {}", staged.display()))?;
        if let Err(err) = extract_tar_gz(Path::new(&backup.location), &staged) {
            let _ = remove_path(&staged);
            return Err(err);
        }

        let safety = if dir.is_dir() {
            match self.snapshot_dir(&backup.target, dir) {
                Ok(safety) => Some(safety),
                Err(err) => {
                    let _ = remove_path(&staged);
                    return Err(err.context("Safety snapshot before restore failed"));
                }
            }
        } else {
            None
        };

        swap_into_place(&staged, dir)?;
        tracing::info!(backup = %backup.id, dir = %dir.display(), "directory restored");
        Ok(safety)
    }
}

/// Renames `staged` onto `live`, keeping the old `live` aside until the rename lands.
pub fn swap_into_place(staged: &Path, live: &Path) -> Result<()> {
    let displaced = sibling(live, "displaced");
    remove_path(&displaced).with_context(|| format!("Failed to clear {}", displaced.display()))?;
    let had_live = fs::symlink_metadata(live).is_ok();
    if had_live {
        fs::rename(live, &displaced)
            .with_context(|| format!("Failed to move {} aside", live.display()))?;
    }
    if let Err(err) = fs::rename(staged, live) {
        if had_live {
            let _ = fs::rename(&displaced, live);
        }
        return Err(err).with_context(|| format!("Failed to move {} into place", staged.display()));
    }
    if let Err(err) = remove_path(&displaced) {
        tracing::warn!(path = %displaced.display(), error = %err, "failed to remove displaced dir");
    }
    Ok(())
}

/// Database snapshots kept in each database host's backup root.
pub struct DatabaseBackups<'a, C: RemoteChannel + ?Sized> {
    channel: &'a C,
    tools: &'a MigrationConfig,
    timeout: Duration,
    retention: usize,
}

impl<'a, C: RemoteChannel + ?Sized> DatabaseBackups<'a, C> {
    pub fn new(channel: &'a C, config: &'a CutoverConfig) -> Self {
        Self {
            channel,
            tools: &config.migration,
            timeout: config.command_timeout(),
            retention: config.retention_count.max(1),
        }
    }

    fn database_backup(&self, host: &RemoteHost, database: &str, timestamp: &str) -> Backup {
        let id = backup_id(database, timestamp);
        Backup {
            location: format!(
                "{}/{}",
                host.backup_root.trim_end_matches('/'),
                backup_file_name(&id)
            ),
            id,
            target: database.to_string(),
            timestamp: timestamp.to_string(),
            kind: BackupKind::Database,
            host: Some(host.name.clone()),
            retention_eligible: false,
        }
    }

    /// Dumps `database` into a scratch dir on its host, archives it into the
    /// backup root and removes the scratch dir.
    pub fn snapshot(&self, host: &RemoteHost, database: &str) -> Result<Backup> {
        validate_identifier("database", database)?;
        let backup = self.database_backup(host, database, &next_timestamp());
        let dump_dir = format!("{}/backup-{}", host.work_dir.trim_end_matches('/'), backup.id);
        let partial = format!("{}.partial", backup.location);

        let dump = render_template(
            &self.tools.dump_command,
            &[
                ("uri", &shell_quote(&host.mongo_uri)),
                ("db", database),
                ("dir", &shell_quote(&dump_dir)),
            ],
        );
        let pack = render_template(
            &self.tools.archive_command,
            &[
                ("archive", &shell_quote(&partial)),
                ("dir", &shell_quote(&dump_dir)),
            ],
        );
        let command = format!(
            concat!(
                "mkdir -p {root} {work} && {{ {dump} && {pack} && mv {partial} {archive}; }}; ",
                "rc=$?; rm -rf {dump_dir} {partial}; exit $rc"
            ),
            root = shell_quote(&host.backup_root),
            work = shell_quote(&host.work_dir),
            partial = shell_quote(&partial),
            archive = shell_quote(&backup.location),
            dump_dir = shell_quote(&dump_dir),
            dump = dump,
            pack = pack,
        );
        self.channel
            .exec_checked(host, &command, self.timeout)
            .with_context(|| format!("Snapshot of {database} on {} failed", host.name))?;
        self.verify_present(host, &backup)?;
        tracing::info!(
            host = %host.name,
            resource = database,
            backup = %backup.id,
            "database snapshot created"
        );

        self.prune(host, database);
        Ok(backup)
    }

    fn file_names(&self, host: &RemoteHost) -> Result<Vec<String>> {
        let command = format!("ls -1 {} 2>/dev/null || true", shell_quote(&host.backup_root));
        let output = self
            .channel
            .exec_checked(host, &command, self.timeout)
            .with_context(|| format!("Failed to list backups on {}", host.name))?;
        Ok(output
            .stdout
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect())
    }

    pub fn list(&self, host: &RemoteHost, database: &str) -> Result<Vec<Backup>> {
        let names = self.file_names(host)?;
        Ok(sorted_backups(&names, database, self.retention, |target, ts| {
            self.database_backup(host, target, ts)
        }))
    }

    pub fn find(&self, host: &RemoteHost, id: &str) -> Result<Backup> {
        let id = id.trim().trim_end_matches(&format!(".{BACKUP_EXT}"));
        let Some((database, _)) = parse_backup_id(id) else {
            bail!("'{id}' is not a backup id (expected <database>_YYYYMMDD_HHMMSS_mmm)");
        };
        self.list(host, database)?
            .into_iter()
            .find(|backup| backup.id == id)
            .ok_or_else(|| CutoverError::BackupMissing(id.to_string()).into())
    }

    pub fn verify_present(&self, host: &RemoteHost, backup: &Backup) -> Result<()> {
        let command = format!("test -s {}", shell_quote(&backup.location));
        let output = self.channel.exec(host, &command, self.timeout)?;
        if !output.success() {
            return Err(CutoverError::BackupMissing(backup.id.clone()).into());
        }
        Ok(())
    }

    pub fn prune(&self, host: &RemoteHost, database: &str) -> Vec<String> {
        let names = match self.file_names(host) {
            Ok(names) => names,
            Err(err) => {
                tracing::warn!(
                    host = %host.name,
                    resource = database,
                    error = %err,
                    "backup prune skipped"
                );
                return Vec::new();
            }
        };
        let mut deleted = Vec::new();
        for id in select_expired(&names, database, self.retention) {
            let path = format!(
                "{}/{}",
                host.backup_root.trim_end_matches('/'),
                backup_file_name(&id)
            );
            let command = format!("rm -f {}", shell_quote(&path));
            match self.channel.exec_checked(host, &command, self.timeout) {
                Ok(_) => {
                    tracing::info!(
                        host = %host.name,
                        resource = database,
                        backup = %id,
                        "pruned backup"
                    );
                    deleted.push(id);
                }
                Err(err) => {
                    tracing::warn!(
                        host = %host.name,
                        backup = %id,
                        error = %err,
                        "failed to prune backup"
                    )
                }
            }
        }
        deleted
    }

    /// Extracts `archive` into `extract_dir` on `host` and restores `database` from it
    /// with drop. With `snapshot_current`, the existing database is snapshotted after
    /// extraction and before the destructive restore. `extract_dir` is removed on every
    /// path.
    pub fn import_archive(
        &self,
        host: &RemoteHost,
        database: &str,
        archive: &str,
        extract_dir: &str,
        snapshot_current: bool,
    ) -> Result<Option<Backup>> {
        validate_identifier("database", database)?;
        let outcome = self.import_inner(host, database, archive, extract_dir, snapshot_current);
        let command = format!("rm -rf {}", shell_quote(extract_dir));
        if let Err(err) = self.channel.exec_checked(host, &command, self.timeout) {
            tracing::warn!(
                host = %host.name,
                dir = extract_dir,
                error = %err,
                "failed to remove extract dir"
            );
        }
        outcome
    }

    fn import_inner(
        &self,
        host: &RemoteHost,
        database: &str,
        archive: &str,
        extract_dir: &str,
        snapshot_current: bool,
    ) -> Result<Option<Backup>> {
        let extract = render_template(
            &self.tools.extract_command,
            &[
                ("archive", &shell_quote(archive)),
                ("dir", &shell_quote(extract_dir)),
            ],
        );
        self.channel
            .exec_checked(host, &extract, self.timeout)
            .with_context(|| format!("Failed to extract {archive} on {}", host.name))?;

        let safety = if snapshot_current {
            let backup = self
                .snapshot(host, database)
                .context("Snapshot before import failed; target left untouched")?;
            Some(backup)
        } else {
            None
        };

        tracing::warn!(
            host = %host.name,
            database,
            "restoring with drop; existing collections are replaced"
        );
        let restore = render_template(
            &self.tools.restore_command,
            &[
                ("uri", &shell_quote(&host.mongo_uri)),
                ("db", database),
                ("dir", &shell_quote(extract_dir)),
            ],
        );
        self.channel
            .exec_checked(host, &restore, self.timeout)
            .with_context(|| format!("Restore of {database} on {} failed", host.name))?;
        Ok(safety)
    }

    /// Re-imports `backup` into its database, snapshotting the current state first.
    pub fn restore(
        &self,
        host: &RemoteHost,
        backup: &Backup,
        snapshot_current: bool,
    ) -> Result<Option<Backup>> {
        self.verify_present(host, backup)?;
        let extract_dir = format!(
            "{}/restore-{}",
            host.work_dir.trim_end_matches('/'),
            backup.id
        );
        let safety = self.import_archive(
            host,
            &backup.target,
            &backup.location,
            &extract_dir,
            snapshot_current,
        )?;
        tracing::info!(host = %host.name, backup = %backup.id, "database restored");
        Ok(safety)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::LocalChannel;
    use crate::config::default_config;
    use crate::test_support::{fake_db_host, seed_collection, use_fake_db_tools};
    use std::collections::BTreeMap;
    use walkdir::WalkDir;

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

    fn app_dir(root: &Path) -> PathBuf {
        let dir = root.join("srv/current");
        fs::create_dir_all(dir.join("public")).unwrap();
        fs::write(dir.join("index.js"), "console.log('v1')\n").unwrap();
        fs::write(dir.join("public/app.css"), "body {}\n").unwrap();
        dir
    }

    #[test]
    fn backup_ids_round_trip_through_file_names() {
        let name = backup_file_name(&backup_id("web_v2", "20240102_030405_006"));
        assert_eq!(name, "web_v2_20240102_030405_006.tar.gz");
        assert_eq!(
            parse_backup_file(&name),
            Some(("web_v2", "20240102_030405_006"))
        );
        assert_eq!(parse_backup_file("web_latest.tar.gz"), None);
        assert_eq!(parse_backup_file("web_20240102_030405.tar.gz"), None);
    }

    #[test]
    fn select_expired_keeps_newest_per_target() {
        let names: Vec<String> = [
            "web_20240101_000000_000.tar.gz",
            "web_20240103_000000_000.tar.gz",
            "web_20240102_000000_000.tar.gz",
            "web_v2_20230101_000000_000.tar.gz",
            "notes.txt",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(
            select_expired(&names, "web", 2),
            vec!["web_20240101_000000_000".to_string()]
        );
        assert!(select_expired(&names, "web_v2", 1).is_empty());
    }

    #[test]
    fn sixth_snapshot_prunes_the_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let live = app_dir(dir.path());
        let manager = BackupManager::new(dir.path().join("backups"), 5);

        let mut created = Vec::new();
        for _ in 0..6 {
            created.push(manager.snapshot_dir("web", &live).unwrap());
        }

        let remaining = manager.list("web").unwrap();
        assert_eq!(remaining.len(), 5);
        assert!(remaining.iter().all(|b| b.id != created[0].id));
        assert_eq!(remaining[0].id, created[5].id);
        assert!(!Path::new(&created[0].location).exists());
    }

    #[test]
    fn restore_is_byte_identical_and_keeps_a_safety_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let live = app_dir(dir.path());
        let manager = BackupManager::new(dir.path().join("backups"), 5);
        let before = tree(&live);
        let backup = manager.snapshot_dir("web", &live).unwrap();

        fs::write(live.join("index.js"), "console.log('v2')\n").unwrap();
        fs::remove_file(live.join("public/app.css")).unwrap();
        fs::write(live.join("extra.txt"), "new").unwrap();

        let safety = manager.restore_dir(&backup, &live).unwrap().unwrap();
        assert_eq!(tree(&live), before);
        assert_ne!(safety.id, backup.id);
        assert_eq!(manager.list("web").unwrap().len(), 2);
        assert!(!sibling(&live, "restore").exists());
        assert!(!sibling(&live, "displaced").exists());
    }

    #[test]
    fn unknown_or_empty_backups_are_missing() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BackupManager::new(dir.path(), 5);
        let err = manager.find("web_20240101_000000_000").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CutoverError>(),
            Some(CutoverError::BackupMissing(_))
        ));

        fs::write(dir.path().join("web_20240101_000000_000.tar.gz"), "").unwrap();
        let empty = manager.find("web_20240101_000000_000").unwrap();
        assert!(manager.verify_present(&empty).is_err());
        assert!(manager.find("not-an-id").is_err());
    }

    #[test]
    fn database_snapshot_and_restore_through_channel() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = default_config();
        use_fake_db_tools(&mut config);
        config.retention_count = 5;
        let host_config = fake_db_host(dir.path(), "db1");
        let host = RemoteHost::from_config("db1", &host_config);
        seed_collection(&host_config, "library", "users", 4);

        let channel = LocalChannel::new();
        let backups = DatabaseBackups::new(&channel, &config);
        let backup = backups.snapshot(&host, "library").unwrap();
        assert!(Path::new(&backup.location).exists());
        assert!(!Path::new(&host.work_dir)
            .join(format!("backup-{}", backup.id))
            .exists());

        seed_collection(&host_config, "library", "users", 1);
        let safety = backups.restore(&host, &backup, true).unwrap().unwrap();

        let users =
            fs::read_to_string(Path::new(&host.mongo_uri).join("library/users.bson")).unwrap();
        assert_eq!(users.lines().count(), 4);
        let listed = backups.list(&host, "library").unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, safety.id);
        assert_eq!(backups.find(&host, &backup.id).unwrap().id, backup.id);
        assert!(!Path::new(&host.work_dir)
            .join(format!("restore-{}", backup.id))
            .exists());
    }
}
