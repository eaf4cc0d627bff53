//! Remote execution channel: copy a file to a host, fetch one back, run a command
//! and capture its output. No retries happen here; callers pick their own policy.

mod local;
mod ssh;

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::HostConfig;
use crate::error::ChannelError;

pub use local::LocalChannel;
pub use ssh::SshChannel;

#[derive(Debug, Clone, PartialEq)]
pub enum Credential {
    Agent,
    IdentityFile(PathBuf),
    PasswordEnv(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteHost {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub user: String,
    pub credential: Credential,
    pub host_key_fingerprint: Option<String>,
    pub work_dir: String,
    pub backup_root: String,
    pub mongo_uri: String,
    local: bool,
}

impl RemoteHost {
    pub fn from_config(name: &str, config: &HostConfig) -> Self {
        let credential = if let Some(path) = config.identity_file.as_ref() {
            Credential::IdentityFile(PathBuf::from(path))
        } else if let Some(var) = config.password_env.as_ref() {
            Credential::PasswordEnv(var.clone())
        } else {
            Credential::Agent
        };
        let local = crate::constants::LOCAL_HOST_NAMES.contains(&config.address.as_str());
        Self {
            name: name.to_string(),
            address: config.address.clone(),
            port: config.port,
            user: config.user.clone(),
            credential,
            host_key_fingerprint: config.host_key_fingerprint.clone(),
            work_dir: config.work_dir.clone(),
            backup_root: config.backup_root.clone(),
            mongo_uri: config.mongo_uri.clone(),
            local,
        }
    }

    pub fn local(name: &str) -> Self {
        Self {
            name: name.to_string(),
            address: "127.0.0.1".to_string(),
            port: 22,
            user: std::env::var("USER").unwrap_or_else(|_| "root".to_string()),
            credential: Credential::Agent,
            host_key_fingerprint: None,
            work_dir: crate::constants::DEFAULT_REMOTE_WORK_DIR.to_string(),
            backup_root: crate::constants::DEFAULT_REMOTE_BACKUP_ROOT.to_string(),
            mongo_uri: "mongodb://127.0.0.1:27017".to_string(),
            local: true,
        }
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    /// Stable identity used in lock keys and logs.
    pub fn key(&self) -> String {
        if self.local {
            "local".to_string()
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

pub trait RemoteChannel {
    fn copy(&self, local: &Path, host: &RemoteHost, remote: &str) -> Result<(), ChannelError>;

    fn fetch(&self, host: &RemoteHost, remote: &str, local: &Path) -> Result<(), ChannelError>;

    fn exec(
        &self,
        host: &RemoteHost,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, ChannelError>;

    /// Like `exec`, but a non-zero exit becomes `RemoteCommandFailed`.
    fn exec_checked(
        &self,
        host: &RemoteHost,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, ChannelError> {
        let output = self.exec(host, command, timeout)?;
        if !output.success() {
            return Err(ChannelError::RemoteCommandFailed {
                host: host.name.clone(),
                command: command.to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }
}

/// Sends local hosts to the subprocess channel and everything else over SSH.
pub struct ChannelRouter {
    local: LocalChannel,
    ssh: SshChannel,
}

impl ChannelRouter {
    pub fn new(local: LocalChannel, ssh: SshChannel) -> Self {
        Self { local, ssh }
    }

    fn route(&self, host: &RemoteHost) -> &dyn RemoteChannel {
        if host.is_local() {
            &self.local
        } else {
            &self.ssh
        }
    }
}

impl RemoteChannel for ChannelRouter {
    fn copy(&self, local: &Path, host: &RemoteHost, remote: &str) -> Result<(), ChannelError> {
        self.route(host).copy(local, host, remote)
    }

    fn fetch(&self, host: &RemoteHost, remote: &str, local: &Path) -> Result<(), ChannelError> {
        self.route(host).fetch(host, remote, local)
    }

    fn exec(
        &self,
        host: &RemoteHost,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, ChannelError> {
        self.route(host).exec(host, command, timeout)
    }
}

pub fn router_for(config: &crate::config::CutoverConfig) -> ChannelRouter {
    ChannelRouter::new(
        LocalChannel::new(),
        SshChannel::new(
            Duration::from_secs(config.connect_timeout_seconds),
            config.known_hosts_path.as_ref().map(PathBuf::from),
        ),
    )
}

pub fn shell_quote(value: &str) -> String {
    if value.is_empty() {
        return "''".to_string();
    }
    let escaped = value.replace('\'', "'\"'\"'");
    format!("'{escaped}'")
}
