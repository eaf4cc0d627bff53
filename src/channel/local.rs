use std::fs;
use std::io::{ErrorKind, Read};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use super::{ExecOutput, RemoteChannel, RemoteHost};
use crate::error::ChannelError;

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const OUTPUT_GRACE: Duration = Duration::from_millis(250);

/// Runs commands as `sh -c` subprocesses on the machine the tool runs on.
#[derive(Debug, Clone, Default)]
pub struct LocalChannel;

impl LocalChannel {
    pub fn new() -> Self {
        Self
    }
}

#[derive(Debug, Clone, Copy)]
enum Pipe {
    Stdout,
    Stderr,
}

/// `None` marks end of stream.
type Chunk = (Pipe, Option<Vec<u8>>);

fn pump<R: Read + Send + 'static>(reader: Option<R>, pipe: Pipe, tx: Sender<Chunk>) {
    std::thread::spawn(move || {
        if let Some(mut reader) = reader {
            let mut buffer = [0u8; 8192];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send((pipe, Some(buffer[..n].to_vec()))).is_err() {
                            return;
                        }
                    }
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
        }
        let _ = tx.send((pipe, None));
    });
}

#[derive(Default)]
struct Captured {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    closed: usize,
}

impl Captured {
    fn open(&self) -> bool {
        self.closed < 2
    }

    /// Takes whatever the pumps deliver until both pipes close or `until` passes.
    fn collect_until(&mut self, rx: &Receiver<Chunk>, until: Instant) {
        while self.open() {
            let now = Instant::now();
            if now >= until {
                return;
            }
            match rx.recv_timeout(until - now) {
                Ok((Pipe::Stdout, Some(bytes))) => self.stdout.extend_from_slice(&bytes),
                Ok((Pipe::Stderr, Some(bytes))) => self.stderr.extend_from_slice(&bytes),
                Ok((_, None)) => self.closed += 1,
                Err(RecvTimeoutError::Timeout) => return,
                Err(RecvTimeoutError::Disconnected) => {
                    self.closed = 2;
                    return;
                }
            }
        }
    }

    fn into_strings(self) -> (String, String) {
        (
            String::from_utf8_lossy(&self.stdout).to_string(),
            String::from_utf8_lossy(&self.stderr).to_string(),
        )
    }
}

/// Waits for `sh` itself, collecting output meanwhile. On the deadline the whole process
/// group is killed and `None` is returned.
fn wait_with_deadline(
    child: &mut Child,
    rx: &Receiver<Chunk>,
    captured: &mut Captured,
    deadline: Instant,
) -> std::io::Result<Option<i32>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status.code().unwrap_or(-1)));
        }
        let now = Instant::now();
        if now >= deadline {
            unsafe {
                libc::kill(-(child.id() as i32), libc::SIGKILL);
            }
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
        let tick = (now + POLL_INTERVAL).min(deadline);
        if captured.open() {
            captured.collect_until(rx, tick);
        } else {
            std::thread::sleep(tick - now);
        }
    }
}

fn copy_file(from: &Path, to: &Path, host: &RemoteHost) -> Result<(), ChannelError> {
    let transfer_err = |reason: String| ChannelError::Transfer {
        host: host.name.clone(),
        reason,
    };
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| transfer_err(format!("create {}: {err}", parent.display())))?;
    }
    if from == to {
        return Ok(());
    }
    fs::copy(from, to).map_err(|err| {
        transfer_err(format!(
            "copy {} -> {}: {err}",
            from.display(),
            to.display()
        ))
    })?;
    Ok(())
}

impl RemoteChannel for LocalChannel {
    fn copy(&self, local: &Path, host: &RemoteHost, remote: &str) -> Result<(), ChannelError> {
        copy_file(local, Path::new(remote), host)
    }

    fn fetch(&self, host: &RemoteHost, remote: &str, local: &Path) -> Result<(), ChannelError> {
        copy_file(Path::new(remote), local, host)
    }

    fn exec(
        &self,
        host: &RemoteHost,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, ChannelError> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(|err| ChannelError::Unreachable {
                host: host.name.clone(),
                reason: format!("failed to spawn sh: {err}"),
            })?;

        let deadline = Instant::now() + timeout;
        let (tx, rx) = mpsc::channel();
        pump(child.stdout.take(), Pipe::Stdout, tx.clone());
        pump(child.stderr.take(), Pipe::Stderr, tx);
        let mut captured = Captured::default();
        let exit = wait_with_deadline(&mut child, &rx, &mut captured, deadline).map_err(|err| {
            ChannelError::Unreachable {
                host: host.name.clone(),
                reason: format!("failed to wait for command: {err}"),
            }
        })?;
        // A backgrounded process (a started service) may hold the pipes open for good.
        // It is left running; only the output written so far is kept.
        captured.collect_until(&rx, Instant::now() + OUTPUT_GRACE);
        if captured.open() {
            tracing::debug!(
                host = %host.name,
                command,
                "output still open after exit, not waiting for background processes"
            );
        }
        let (stdout, stderr) = captured.into_strings();

        match exit {
            Some(exit_code) => Ok(ExecOutput {
                exit_code,
                stdout,
                stderr,
            }),
            None => Err(ChannelError::Timeout {
                host: host.name.clone(),
                command: command.to_string(),
                timeout,
            }),
        }
    }
}
