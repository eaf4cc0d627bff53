use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};
use ssh2::{CheckResult, KnownHostFileKind, Session};
use std::fs;
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use super::{shell_quote, Credential, ExecOutput, RemoteChannel, RemoteHost};
use crate::error::ChannelError;

// libssh2 LIBSSH2_ERROR_TIMEOUT
const SSH_ERROR_TIMEOUT: i32 = -9;
const READ_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// libssh2-backed channel. Each call opens its own session.
#[derive(Debug, Clone)]
pub struct SshChannel {
    connect_timeout: Duration,
    known_hosts_path: Option<PathBuf>,
}

impl SshChannel {
    pub fn new(connect_timeout: Duration, known_hosts_path: Option<PathBuf>) -> Self {
        let known_hosts_path = known_hosts_path.or_else(|| {
            std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".ssh/known_hosts"))
        });
        Self {
            connect_timeout,
            known_hosts_path,
        }
    }

    fn connect(&self, host: &RemoteHost) -> Result<Session, ChannelError> {
        let unreachable = |reason: String| ChannelError::Unreachable {
            host: host.name.clone(),
            reason,
        };
        let addr = (host.address.as_str(), host.port)
            .to_socket_addrs()
            .map_err(|err| unreachable(format!("resolve {}: {err}", host.address)))?
            .next()
            .ok_or_else(|| unreachable(format!("no address for {}", host.address)))?;
        let tcp = TcpStream::connect_timeout(&addr, self.connect_timeout)
            .map_err(|err| unreachable(format!("connect {addr}: {err}")))?;
        tcp.set_read_timeout(Some(self.connect_timeout)).ok();
        tcp.set_write_timeout(Some(self.connect_timeout)).ok();

        let mut session =
            Session::new().map_err(|err| unreachable(format!("create session: {err}")))?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|err| unreachable(format!("handshake: {err}")))?;

        self.verify_host_key(&session, host)?;
        authenticate(&session, host)?;
        Ok(session)
    }

    fn verify_host_key(&self, session: &Session, host: &RemoteHost) -> Result<(), ChannelError> {
        let rejected = |reason: String| ChannelError::AuthFailed {
            host: host.name.clone(),
            reason,
        };
        let (key, _) = session
            .host_key()
            .ok_or_else(|| rejected("host key unavailable".to_string()))?;
        let fingerprint = fingerprint_sha256(key);

        if let Some(pinned) = host.host_key_fingerprint.as_deref() {
            if pinned.trim() != fingerprint {
                return Err(rejected(format!(
                    "host key fingerprint mismatch (expected {}, got {fingerprint})",
                    pinned.trim()
                )));
            }
            return Ok(());
        }

        let Some(path) = self.known_hosts_path.as_deref().filter(|p| p.exists()) else {
            return Err(rejected(format!(
                "host key not trusted; pin host_key_fingerprint = {fingerprint}"
            )));
        };
        let mut known_hosts = session
            .known_hosts()
            .map_err(|err| rejected(format!("known_hosts unavailable: {err}")))?;
        known_hosts
            .read_file(path, KnownHostFileKind::OpenSSH)
            .map_err(|err| rejected(format!("read {}: {err}", path.display())))?;
        match known_hosts.check_port(&host.address, host.port, key) {
            CheckResult::Match => Ok(()),
            CheckResult::NotFound => Err(rejected(format!(
                "host key not in {}; fingerprint {fingerprint}",
                path.display()
            ))),
            CheckResult::Mismatch => Err(rejected(format!(
                "host key mismatch against {}; refusing to connect",
                path.display()
            ))),
            CheckResult::Failure => Err(rejected(format!(
                "unable to verify host key against {}",
                path.display()
            ))),
        }
    }

    fn ensure_remote_parent(
        &self,
        session: &Session,
        host: &RemoteHost,
        remote: &str,
    ) -> Result<(), ChannelError> {
        let Some(parent) = Path::new(remote).parent() else {
            return Ok(());
        };
        if parent.as_os_str().is_empty() {
            return Ok(());
        }
        let command = format!("mkdir -p {}", shell_quote(&parent.to_string_lossy()));
        let output = run_command(session, host, &command, self.connect_timeout)?;
        if !output.success() {
            return Err(ChannelError::Transfer {
                host: host.name.clone(),
                reason: format!("{command}: {}", output.stderr.trim()),
            });
        }
        Ok(())
    }
}

fn authenticate(session: &Session, host: &RemoteHost) -> Result<(), ChannelError> {
    let auth_failed = |reason: String| ChannelError::AuthFailed {
        host: host.name.clone(),
        reason,
    };
    let result = match &host.credential {
        Credential::IdentityFile(path) => {
            session.userauth_pubkey_file(&host.user, None, path, None)
        }
        Credential::PasswordEnv(var) => {
            let password = std::env::var(var)
                .map_err(|_| auth_failed(format!("password variable {var} is not set")))?;
            session.userauth_password(&host.user, &password)
        }
        Credential::Agent => session.userauth_agent(&host.user),
    };
    result.map_err(|err| auth_failed(err.to_string()))?;
    if !session.authenticated() {
        return Err(auth_failed("server rejected credentials".to_string()));
    }
    Ok(())
}

pub(crate) fn fingerprint_sha256(key: &[u8]) -> String {
    let digest = Sha256::digest(key);
    let b64 = STANDARD_NO_PAD.encode(digest);
    format!("SHA256:{b64}")
}

fn is_timeout(err: &ssh2::Error) -> bool {
    matches!(err.code(), ssh2::ErrorCode::Session(SSH_ERROR_TIMEOUT))
}

fn run_command(
    session: &Session,
    host: &RemoteHost,
    command: &str,
    timeout: Duration,
) -> Result<ExecOutput, ChannelError> {
    let timed_out = || ChannelError::Timeout {
        host: host.name.clone(),
        command: command.to_string(),
        timeout,
    };
    let unreachable = |reason: String| ChannelError::Unreachable {
        host: host.name.clone(),
        reason,
    };
    session.set_timeout(timeout.as_millis().min(u128::from(u32::MAX)) as u32);
    let mut channel = session.channel_session().map_err(|err| {
        if is_timeout(&err) {
            timed_out()
        } else {
            unreachable(format!("open channel: {err}"))
        }
    })?;
    channel.exec(command).map_err(|err| {
        if is_timeout(&err) {
            timed_out()
        } else {
            unreachable(format!("exec: {err}"))
        }
    })?;

    // Drain both streams in one loop; unread stderr stalls the channel window.
    session.set_blocking(false);
    let deadline = Instant::now() + timeout;
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut buffer = [0u8; 8192];
    loop {
        let mut progressed = false;
        match read_available(&mut channel, &mut buffer, &mut stdout) {
            Ok(read) => progressed |= read,
            Err(err) => return Err(unreachable(format!("read stdout: {err}"))),
        }
        match read_available(&mut channel.stderr(), &mut buffer, &mut stderr) {
            Ok(read) => progressed |= read,
            Err(err) => return Err(unreachable(format!("read stderr: {err}"))),
        }
        if !progressed && channel.eof() {
            break;
        }
        if Instant::now() >= deadline {
            return Err(timed_out());
        }
        if !progressed {
            std::thread::sleep(READ_POLL_INTERVAL);
        }
    }
    session.set_blocking(true);
    channel.wait_close().ok();
    let stdout = String::from_utf8_lossy(&stdout).to_string();
    let stderr = String::from_utf8_lossy(&stderr).to_string();
    let exit_code = channel.exit_status().unwrap_or(-1);
    Ok(ExecOutput {
        exit_code,
        stdout,
        stderr,
    })
}

/// Reads what is buffered without blocking. Returns whether anything arrived.
fn read_available(
    reader: &mut impl Read,
    buffer: &mut [u8],
    sink: &mut Vec<u8>,
) -> std::io::Result<bool> {
    match reader.read(buffer) {
        Ok(0) => Ok(false),
        Ok(n) => {
            sink.extend_from_slice(&buffer[..n]);
            Ok(true)
        }
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(false),
        Err(err) => Err(err),
    }
}

impl RemoteChannel for SshChannel {
    fn copy(&self, local: &Path, host: &RemoteHost, remote: &str) -> Result<(), ChannelError> {
        let transfer_err = |reason: String| ChannelError::Transfer {
            host: host.name.clone(),
            reason,
        };
        let session = self.connect(host)?;
        self.ensure_remote_parent(&session, host, remote)?;
        let sftp = session
            .sftp()
            .map_err(|err| transfer_err(format!("sftp unavailable: {err}")))?;
        let mut source = fs::File::open(local)
            .map_err(|err| transfer_err(format!("open {}: {err}", local.display())))?;
        let mut dest = sftp
            .create(Path::new(remote))
            .map_err(|err| transfer_err(format!("create {remote}: {err}")))?;
        std::io::copy(&mut source, &mut dest)
            .map_err(|err| transfer_err(format!("upload {remote}: {err}")))?;
        Ok(())
    }

    fn fetch(&self, host: &RemoteHost, remote: &str, local: &Path) -> Result<(), ChannelError> {
        let transfer_err = |reason: String| ChannelError::Transfer {
            host: host.name.clone(),
            reason,
        };
        let session = self.connect(host)?;
        let sftp = session
            .sftp()
            .map_err(|err| transfer_err(format!("sftp unavailable: {err}")))?;
        let mut source = sftp
            .open(Path::new(remote))
            .map_err(|err| transfer_err(format!("open {remote}: {err}")))?;
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| transfer_err(format!("create {}: {err}", parent.display())))?;
        }
        let mut dest = fs::File::create(local)
            .map_err(|err| transfer_err(format!("create {}: {err}", local.display())))?;
        std::io::copy(&mut source, &mut dest)
            .map_err(|err| transfer_err(format!("download {remote}: {err}")))?;
        Ok(())
    }

    fn exec(
        &self,
        host: &RemoteHost,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, ChannelError> {
        let session = self.connect(host)?;
        run_command(&session, host, command, timeout)
    }
}
