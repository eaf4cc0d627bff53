//! Lease files guarding the mutating regions of a release (per host) and a
//! migration (per source, target and database).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::CutoverError;

const POLL_INTERVAL: Duration = Duration::from_millis(250);
const RECLAIM_GUARD: &str = ".reclaim.guard";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub key: String,
    pub pid: i32,
    pub purpose: String,
    pub acquired_at: DateTime<Utc>,
}

impl LeaseRecord {
    fn describe(&self) -> String {
        format!(
            "pid {} ({}) since {}",
            self.pid,
            self.purpose,
            self.acquired_at.to_rfc3339()
        )
    }
}

#[derive(Debug, Clone)]
pub struct LockOptions {
    pub wait: Duration,
    pub stale_after: Duration,
}

/// Held lease. Dropping it removes the lease file.
#[derive(Debug)]
pub struct LeaseLock {
    path: PathBuf,
    key: String,
}

pub fn release_lock_key(host_key: &str) -> String {
    format!("release-{host_key}")
}

pub fn migration_lock_key(source_key: &str, target_key: &str, database: &str) -> String {
    format!("migrate-{source_key}-{target_key}-{database}")
}

/// Guards one database on one host against concurrent imports and restores.
pub fn database_lock_key(host_key: &str, database: &str) -> String {
    format!("database-{host_key}-{database}")
}

fn lease_file_name(key: &str) -> String {
    let sanitized: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{sanitized}.lock")
}

fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn read_lease(path: &Path) -> Option<LeaseRecord> {
    let contents = fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}

fn lease_is_stale(path: &Path, record: Option<&LeaseRecord>, stale_after: Duration) -> bool {
    match record {
        Some(record) => {
            if !process_alive(record.pid) {
                return true;
            }
            let age = Utc::now().signed_duration_since(record.acquired_at);
            age.to_std().map(|age| age > stale_after).unwrap_or(false)
        }
        None => fs::metadata(path)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .map(|age| age > stale_after)
            .unwrap_or(false),
    }
}

/// Serialises stale checks across processes. The guard file is never removed, so the
/// advisory lock always refers to the same inode.
struct ReclaimGuard(fs::File);

impl ReclaimGuard {
    fn acquire(lock_root: &Path) -> Result<Self> {
        let path = lock_root.join(RECLAIM_GUARD);
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } != 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("Failed to lock {}", path.display()));
        }
        Ok(Self(file))
    }
}

impl Drop for ReclaimGuard {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.0.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

/// Removes the lease at `path` if it is stale. The record is re-read under the guard, so
/// a lease another process just created is never mistaken for the one judged stale.
/// Returns true when the caller should retry creating the lease.
fn reclaim_if_stale(
    lock_root: &Path,
    path: &Path,
    key: &str,
    stale_after: Duration,
) -> Result<bool> {
    let _guard = ReclaimGuard::acquire(lock_root)?;
    if !path.exists() {
        return Ok(true);
    }
    let record = read_lease(path);
    if !lease_is_stale(path, record.as_ref(), stale_after) {
        return Ok(false);
    }
    tracing::warn!(
        key,
        holder = %record.as_ref().map(LeaseRecord::describe).unwrap_or_default(),
        "reclaiming stale lease"
    );
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(true),
        Err(err) => Err(err)
            .with_context(|| format!("Failed to remove stale lease {}", path.display())),
    }
}

impl LeaseLock {
    pub fn acquire(
        lock_root: &Path,
        key: &str,
        purpose: &str,
        options: &LockOptions,
    ) -> Result<Self> {
        fs::create_dir_all(lock_root)
            .with_context(|| format!("Failed to create lock dir {}", lock_root.display()))?;
        let path = lock_root.join(lease_file_name(key));
        let started = Instant::now();

        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut file) => {
                    let record = LeaseRecord {
                        key: key.to_string(),
                        pid: std::process::id() as i32,
                        purpose: purpose.to_string(),
                        acquired_at: Utc::now(),
                    };
                    let lock = LeaseLock {
                        path: path.clone(),
                        key: key.to_string(),
                    };
                    file.write_all(serde_json::to_string_pretty(&record)?.as_bytes())
                        .with_context(|| format!("Failed to write lease {}", path.display()))?;
                    tracing::debug!(key, path = %path.display(), "lease acquired");
                    return Ok(lock);
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if reclaim_if_stale(lock_root, &path, key, options.stale_after)? {
                        continue;
                    }
                    let record = read_lease(&path);
                    if started.elapsed() >= options.wait {
                        let holder = record
                            .as_ref()
                            .map(LeaseRecord::describe)
                            .unwrap_or_else(|| "unknown holder".to_string());
                        return Err(CutoverError::LockHeld {
                            key: key.to_string(),
                            holder,
                        }
                        .into());
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("Failed to create lease {}", path.display()))
                }
            }
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LeaseLock {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(key = %self.key, "lease released"),
            Err(err) => tracing::warn!(key = %self.key, error = %err, "failed to release lease"),
        }
    }
}
