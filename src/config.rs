use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::channel::RemoteHost;
use crate::constants::{
    CONFIG_PATH_ENV, DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_BACKUP_ROOT,
    DEFAULT_COMMAND_TIMEOUT_SECONDS, DEFAULT_CONFIG_PATH, DEFAULT_CONNECT_TIMEOUT_SECONDS,
    DEFAULT_HEALTH_ATTEMPT_TIMEOUT_MS, DEFAULT_HEALTH_INITIAL_DELAY_MS,
    DEFAULT_HEALTH_MAX_ATTEMPTS, DEFAULT_HEALTH_MAX_DELAY_MS, DEFAULT_HEALTH_URL,
    DEFAULT_LOCK_STALE_SECONDS, DEFAULT_REMOTE_BACKUP_ROOT, DEFAULT_REMOTE_WORK_DIR,
    DEFAULT_RETENTION_COUNT, DEFAULT_STATE_ROOT, LOCAL_HOST_NAMES, STRICT_VERIFY_ENV,
};

pub fn default_config_path() -> PathBuf {
    std::env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}

pub fn resolve_config_path(path: Option<PathBuf>) -> PathBuf {
    path.unwrap_or_else(default_config_path)
}

fn default_state_root() -> String {
    DEFAULT_STATE_ROOT.to_string()
}

fn default_backup_root() -> String {
    DEFAULT_BACKUP_ROOT.to_string()
}

fn default_retention_count() -> usize {
    DEFAULT_RETENTION_COUNT
}

fn default_command_timeout_seconds() -> u64 {
    DEFAULT_COMMAND_TIMEOUT_SECONDS
}

fn default_connect_timeout_seconds() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECONDS
}

fn default_lock_stale_seconds() -> u64 {
    DEFAULT_LOCK_STALE_SECONDS
}

fn default_app_name() -> String {
    "app".to_string()
}

fn default_release_host() -> String {
    "local".to_string()
}

fn default_live_dir() -> String {
    "/srv/app/current".to_string()
}

fn default_fetch_command() -> String {
    "aws s3 cp {reference} {dest}".to_string()
}

fn default_build_commands() -> Vec<String> {
    vec!["npm ci".to_string(), "npm run build".to_string()]
}

fn default_stop_command() -> String {
    "pm2 stop app".to_string()
}

fn default_start_command() -> String {
    "pm2 start ecosystem.config.js --update-env".to_string()
}

fn default_health_url() -> String {
    DEFAULT_HEALTH_URL.to_string()
}

fn default_health_max_attempts() -> u32 {
    DEFAULT_HEALTH_MAX_ATTEMPTS
}

fn default_health_initial_delay_ms() -> u64 {
    DEFAULT_HEALTH_INITIAL_DELAY_MS
}

fn default_backoff_multiplier() -> f64 {
    DEFAULT_BACKOFF_MULTIPLIER
}

fn default_health_max_delay_ms() -> u64 {
    DEFAULT_HEALTH_MAX_DELAY_MS
}

fn default_health_attempt_timeout_ms() -> u64 {
    DEFAULT_HEALTH_ATTEMPT_TIMEOUT_MS
}

fn default_expected_status() -> String {
    "healthy".to_string()
}

fn default_true() -> bool {
    true
}

fn default_transfer_attempts() -> u32 {
    3
}

fn default_transfer_initial_delay_ms() -> u64 {
    2_000
}

fn default_count_command() -> String {
    concat!(
        "mongosh {uri} --quiet --eval '",
        "const names = db.getMongo().getDBNames(); ",
        "const d = db.getSiblingDB(\"{db}\"); ",
        "const c = {}; ",
        "if (names.includes(\"{db}\")) { d.getCollectionNames().forEach(n => { ",
        "c[n] = d.getCollection(n).countDocuments({}); }); } ",
        "print(JSON.stringify({exists: names.includes(\"{db}\"), collections: c}));'"
    )
    .to_string()
}

fn default_dump_command() -> String {
    "mongodump --uri={uri} --db={db} --out={dir}".to_string()
}

fn default_archive_command() -> String {
    "tar -czf {archive} -C {dir} .".to_string()
}

fn default_extract_command() -> String {
    "mkdir -p {dir} && tar -xzf {archive} -C {dir}".to_string()
}

fn default_restore_command() -> String {
    "mongorestore --uri={uri} --drop --db={db} {dir}/{db}".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_user() -> String {
    "ubuntu".to_string()
}

fn default_work_dir() -> String {
    DEFAULT_REMOTE_WORK_DIR.to_string()
}

fn default_remote_backup_root() -> String {
    DEFAULT_REMOTE_BACKUP_ROOT.to_string()
}

fn default_mongo_uri() -> String {
    "mongodb://127.0.0.1:27017".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CutoverConfig {
    #[serde(default = "default_state_root")]
    pub state_root: String,
    #[serde(default = "default_backup_root")]
    pub backup_root: String,
    #[serde(default = "default_retention_count")]
    pub retention_count: usize,
    #[serde(default = "default_command_timeout_seconds")]
    pub command_timeout_seconds: u64,
    #[serde(default = "default_connect_timeout_seconds")]
    pub connect_timeout_seconds: u64,
    /// How long to wait for a held lease before giving up. Zero rejects immediately.
    #[serde(default)]
    pub lock_wait_seconds: u64,
    #[serde(default = "default_lock_stale_seconds")]
    pub lock_stale_seconds: u64,
    #[serde(default)]
    pub known_hosts_path: Option<String>,
    #[serde(default)]
    pub release: ReleaseConfig,
    #[serde(default)]
    pub migration: MigrationConfig,
    #[serde(default)]
    pub hosts: BTreeMap<String, HostConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseConfig {
    #[serde(default = "default_app_name")]
    pub name: String,
    #[serde(default = "default_release_host")]
    pub host: String,
    #[serde(default = "default_live_dir")]
    pub live_dir: String,
    /// Used for `s3://` references; `{reference}` and `{dest}` are substituted.
    #[serde(default = "default_fetch_command")]
    pub fetch_command: String,
    #[serde(default = "default_build_commands")]
    pub build_commands: Vec<String>,
    #[serde(default)]
    pub build_timeout_seconds: u64,
    #[serde(default = "default_stop_command")]
    pub stop_command: String,
    #[serde(default = "default_start_command")]
    pub start_command: String,
    #[serde(default)]
    pub health: HealthConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_url")]
    pub url: String,
    #[serde(default = "default_health_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_health_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_health_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_health_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
    #[serde(default = "default_expected_status")]
    pub expected_status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationConfig {
    #[serde(default)]
    pub strict_verify: bool,
    #[serde(default = "default_true")]
    pub backup_before_import: bool,
    #[serde(default = "default_transfer_attempts")]
    pub transfer_attempts: u32,
    #[serde(default = "default_transfer_initial_delay_ms")]
    pub transfer_initial_delay_ms: u64,
    /// Must print `{"exists": bool, "collections": {"name": count}}` on stdout.
    #[serde(default = "default_count_command")]
    pub count_command: String,
    #[serde(default = "default_dump_command")]
    pub dump_command: String,
    #[serde(default = "default_archive_command")]
    pub archive_command: String,
    #[serde(default = "default_extract_command")]
    pub extract_command: String,
    #[serde(default = "default_restore_command")]
    pub restore_command: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    pub address: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default = "default_ssh_user")]
    pub user: String,
    #[serde(default)]
    pub identity_file: Option<String>,
    /// Name of the environment variable holding the SSH password.
    #[serde(default)]
    pub password_env: Option<String>,
    #[serde(default)]
    pub host_key_fingerprint: Option<String>,
    #[serde(default = "default_work_dir")]
    pub work_dir: String,
    #[serde(default = "default_remote_backup_root")]
    pub backup_root: String,
    #[serde(default = "default_mongo_uri")]
    pub mongo_uri: String,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            host: default_release_host(),
            live_dir: default_live_dir(),
            fetch_command: default_fetch_command(),
            build_commands: default_build_commands(),
            build_timeout_seconds: 0,
            stop_command: default_stop_command(),
            start_command: default_start_command(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            url: default_health_url(),
            max_attempts: default_health_max_attempts(),
            initial_delay_ms: default_health_initial_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_health_max_delay_ms(),
            attempt_timeout_ms: default_health_attempt_timeout_ms(),
            expected_status: default_expected_status(),
        }
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            strict_verify: false,
            backup_before_import: true,
            transfer_attempts: default_transfer_attempts(),
            transfer_initial_delay_ms: default_transfer_initial_delay_ms(),
            count_command: default_count_command(),
            dump_command: default_dump_command(),
            archive_command: default_archive_command(),
            extract_command: default_extract_command(),
            restore_command: default_restore_command(),
        }
    }
}

impl HealthConfig {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            multiplier: self.backoff_multiplier,
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

impl CutoverConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }

    pub fn build_timeout(&self) -> Duration {
        if self.release.build_timeout_seconds == 0 {
            self.command_timeout()
        } else {
            Duration::from_secs(self.release.build_timeout_seconds)
        }
    }

    pub fn transfer_backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.migration.transfer_attempts,
            initial_delay: Duration::from_millis(self.migration.transfer_initial_delay_ms),
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_delay: Duration::from_secs(30),
        }
    }

    /// Resolves a host argument: a configured host name, a local alias, or
    /// `[user@]address[:port]`.
    pub fn resolve_host(&self, name: &str) -> Result<RemoteHost> {
        let name = name.trim();
        if name.is_empty() {
            bail!("Host name is empty");
        }
        if let Some(host) = self.hosts.get(name) {
            return Ok(RemoteHost::from_config(name, host));
        }
        if LOCAL_HOST_NAMES.contains(&name) {
            return Ok(RemoteHost::local(name));
        }
        let (user, rest) = match name.split_once('@') {
            Some((user, rest)) => (user.to_string(), rest),
            None => (default_ssh_user(), name),
        };
        let (address, port) = match rest.rsplit_once(':') {
            Some((address, port)) => (
                address.to_string(),
                port.parse::<u16>()
                    .with_context(|| format!("Invalid port in host {name}"))?,
            ),
            None => (rest.to_string(), default_ssh_port()),
        };
        let config = HostConfig {
            address,
            port,
            user,
            identity_file: None,
            password_env: None,
            host_key_fingerprint: None,
            work_dir: default_work_dir(),
            backup_root: default_remote_backup_root(),
            mongo_uri: default_mongo_uri(),
        };
        Ok(RemoteHost::from_config(name, &config))
    }
}

pub fn default_config() -> CutoverConfig {
    CutoverConfig {
        state_root: default_state_root(),
        backup_root: default_backup_root(),
        retention_count: default_retention_count(),
        command_timeout_seconds: default_command_timeout_seconds(),
        connect_timeout_seconds: default_connect_timeout_seconds(),
        lock_wait_seconds: 0,
        lock_stale_seconds: default_lock_stale_seconds(),
        known_hosts_path: None,
        release: ReleaseConfig::default(),
        migration: MigrationConfig::default(),
        hosts: BTreeMap::new(),
    }
}

pub fn load_config(path: &Path) -> Result<CutoverConfig> {
    if !path.exists() {
        let mut config = default_config();
        apply_env_overrides(&mut config);
        return Ok(config);
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config at {}", path.display()))?;
    let mut config: CutoverConfig = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse config at {}", path.display()))?;
    normalize_config(&mut config);
    apply_env_overrides(&mut config);
    Ok(config)
}

pub fn save_config(path: &Path, config: &CutoverConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config dir {}", parent.display()))?;
    }
    let contents = serde_json::to_string_pretty(config)?;
    fs::write(path, contents)
        .with_context(|| format!("Failed to write config at {}", path.display()))?;
    Ok(())
}

fn normalize_config(config: &mut CutoverConfig) {
    if config.retention_count == 0 {
        config.retention_count = default_retention_count();
    }
    if config.command_timeout_seconds == 0 {
        config.command_timeout_seconds = default_command_timeout_seconds();
    }
    if config.connect_timeout_seconds == 0 {
        config.connect_timeout_seconds = default_connect_timeout_seconds();
    }
    if config.lock_stale_seconds == 0 {
        config.lock_stale_seconds = default_lock_stale_seconds();
    }
    if config.release.name.trim().is_empty() {
        config.release.name = default_app_name();
    }
    if config.release.host.trim().is_empty() {
        config.release.host = default_release_host();
    }
    let health = &mut config.release.health;
    if health.max_attempts == 0 {
        health.max_attempts = default_health_max_attempts();
    }
    if health.backoff_multiplier < 1.0 {
        health.backoff_multiplier = default_backoff_multiplier();
    }
    if health.attempt_timeout_ms == 0 {
        health.attempt_timeout_ms = default_health_attempt_timeout_ms();
    }
    if health.max_delay_ms < health.initial_delay_ms {
        health.max_delay_ms = health.initial_delay_ms;
    }
    if config.migration.transfer_attempts == 0 {
        config.migration.transfer_attempts = default_transfer_attempts();
    }
}

fn apply_env_overrides(config: &mut CutoverConfig) {
    if env_flag(STRICT_VERIFY_ENV) {
        config.migration.strict_verify = true;
    }
}

pub fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).as_deref(),
        Ok("1") | Ok("true") | Ok("TRUE") | Ok("yes") | Ok("YES")
    )
}

/// Pretty JSON of the effective config with credential references masked.
pub fn redacted_json(config: &CutoverConfig) -> Result<String> {
    let mut redacted = config.clone();
    for host in redacted.hosts.values_mut() {
        if host.password_env.is_some() {
            host.password_env = Some("REDACTED".to_string());
        }
        if host.mongo_uri.contains('@') {
            host.mongo_uri = redact_uri_credentials(&host.mongo_uri);
        }
    }
    Ok(serde_json::to_string_pretty(&redacted)?)
}

fn redact_uri_credentials(uri: &str) -> String {
    let Some((scheme, rest)) = uri.split_once("://") else {
        return uri.to_string();
    };
    match rest.rsplit_once('@') {
        Some((_, host)) => format!("{scheme}://REDACTED@{host}"),
        None => uri.to_string(),
    }
}
