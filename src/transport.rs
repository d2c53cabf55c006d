//! Connections to a compute host.
//!
//! A `Connector` opens one authenticated `Connection`; the connection offers
//! the handful of file and command primitives a `RemoteSession` is built from.
//! Production connections go through the `openssh` crate; tests plug in fakes.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use colored::ColoredString;
use colourado::Color;
use futures::future::join;
use openssh::{KnownHosts, Session as SSHSession, SessionBuilder, Stdio};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use crate::error::MonitorError;
use crate::host::Host;

/// How a connection proves who we are.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMode {
    /// Whatever the system ssh finds on its own: agent, `~/.ssh` keys, config.
    Agent,
    /// A keypair generated for this tool.
    Keypair(PathBuf),
    /// Ask for the password on the terminal, every time.
    Password,
}

/// What a remote command left behind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutput {
    /// Exit code, if the command exited normally.
    pub status: Option<i32>,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

#[async_trait]
pub trait Connection: Send + Sync {
    async fn exists(&self, path: &str) -> Result<bool, MonitorError>;
    /// Creates a single directory. Fails if it cannot be created, including
    /// when it already exists.
    async fn mkdir(&self, path: &str) -> Result<(), MonitorError>;
    async fn put(&self, local: &Path, remote: &str) -> Result<(), MonitorError>;
    async fn append(&self, remote: &str, contents: &[u8]) -> Result<(), MonitorError>;
    async fn chmod(&self, path: &str, mode: u32) -> Result<(), MonitorError>;
    async fn get(&self, remote: &str, local: &Path) -> Result<(), MonitorError>;
    /// Runs `command` in the remote shell. With `echo`, every output line is
    /// also printed behind the host prefix as it arrives.
    async fn exec(&self, command: &str, echo: bool) -> Result<RunOutput, MonitorError>;
    async fn close(self: Box<Self>);
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &Host, auth: &AuthMode)
        -> Result<Box<dyn Connection>, MonitorError>;
}

/// Connects through the system `ssh` binary using a multiplexed master.
pub struct OpenSshConnector {
    colorhost: ColoredString,
}

impl OpenSshConnector {
    pub fn new(host: &Host, color: Color) -> Self {
        Self {
            colorhost: host.prettify(color),
        }
    }
}

#[async_trait]
impl Connector for OpenSshConnector {
    async fn connect(
        &self,
        host: &Host,
        auth: &AuthMode,
    ) -> Result<Box<dyn Connection>, MonitorError> {
        let mut builder = SessionBuilder::default();
        builder
            .user(host.user.clone())
            .known_hosts_check(KnownHosts::Add);
        let (session, control_dir) = match auth {
            AuthMode::Agent => (builder.connect_mux(&host.hostname).await?, None),
            AuthMode::Keypair(keyfile) => {
                builder.keyfile(keyfile);
                (builder.connect_mux(&host.hostname).await?, None)
            }
            AuthMode::Password => {
                let (session, control_dir) = interactive_master(host).await?;
                (session, Some(control_dir))
            }
        };
        debug!("Connected to {} ({:?})", host, auth);
        Ok(Box::new(OpenSshConnection {
            session,
            colorhost: self.colorhost.clone(),
            _control_dir: control_dir,
        }))
    }
}

/// Starts a control master with plain `ssh`, which prompts for the password
/// on the terminal, and attaches to it.
async fn interactive_master(host: &Host) -> Result<(SSHSession, TempDir), MonitorError> {
    let control_dir = tempfile::Builder::new()
        .prefix(".esm-monitor-")
        .tempdir()?;
    let ctl = control_dir.path().join("master");
    info!("ssh will ask for the password of {}", host);
    let status = tokio::process::Command::new("ssh")
        .args(["-M", "-f", "-N"])
        .arg("-S")
        .arg(&ctl)
        .args(["-o", "ControlPersist=yes"])
        .args(["-o", "StrictHostKeyChecking=accept-new"])
        .arg("-l")
        .arg(&host.user)
        .arg(&host.hostname)
        .status()
        .await?;
    if !status.success() {
        return Err(MonitorError::Authentication {
            user: host.user.clone(),
            host: host.hostname.clone(),
            reason: format!("password login failed ({})", status),
        });
    }
    Ok((SSHSession::resume_mux(ctl.into_boxed_path(), None), control_dir))
}

pub struct OpenSshConnection {
    session: SSHSession,
    colorhost: ColoredString,
    // Holds the control socket of an interactive master.
    _control_dir: Option<TempDir>,
}

impl OpenSshConnection {
    async fn write_remote(
        &self,
        remote: &str,
        contents: &[u8],
        append: bool,
    ) -> Result<(), MonitorError> {
        let script = if append { "cat >> \"$0\"" } else { "cat > \"$0\"" };
        let mut child = self
            .session
            .command("sh")
            .arg("-c")
            .arg(script)
            .arg(remote)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .await?;
        if let Some(mut stdin) = child.stdin().take() {
            stdin.write_all(contents).await?;
            stdin.shutdown().await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(MonitorError::transfer(
                remote,
                String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            ));
        }
        Ok(())
    }

    async fn read_lines<B: AsyncRead + Unpin>(
        &self,
        stream: B,
        tag: &str,
        echo: bool,
    ) -> Vec<String> {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::with_capacity(reader.buffer().len());
        let mut lines = Vec::new();
        let mut after_cr = false;
        loop {
            // Read into the buffer until either \r or \n is met.
            if let Err(e) = read_until2(&mut reader, b'\r', b'\n', &mut buf).await {
                warn!("{} Couldn't read {}: {}", self.colorhost, tag, e);
                break;
            }
            // An empty buffer means that EOF was reached.
            if buf.is_empty() {
                break;
            }
            // The \n of a \r\n pair.
            if after_cr && buf == b"\n" {
                after_cr = false;
                buf.clear();
                continue;
            }
            after_cr = buf.last() == Some(&b'\r');
            let line = String::from_utf8_lossy(&buf)
                .trim_end_matches(['\r', '\n'])
                .to_owned();
            if echo {
                println!("{} {}", self.colorhost, line);
            }
            lines.push(line);
            buf.clear();
        }
        lines
    }
}

#[async_trait]
impl Connection for OpenSshConnection {
    async fn exists(&self, path: &str) -> Result<bool, MonitorError> {
        let status = self
            .session
            .command("test")
            .arg("-e")
            .arg(path)
            .status()
            .await?;
        Ok(status.success())
    }

    async fn mkdir(&self, path: &str) -> Result<(), MonitorError> {
        let output = self
            .session
            .command("mkdir")
            .arg(path)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await?;
        if !output.status.success() {
            return Err(MonitorError::transfer(
                path,
                String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            ));
        }
        Ok(())
    }

    async fn put(&self, local: &Path, remote: &str) -> Result<(), MonitorError> {
        let contents = tokio::fs::read(local).await?;
        self.write_remote(remote, &contents, false).await
    }

    async fn append(&self, remote: &str, contents: &[u8]) -> Result<(), MonitorError> {
        self.write_remote(remote, contents, true).await
    }

    async fn chmod(&self, path: &str, mode: u32) -> Result<(), MonitorError> {
        let status = self
            .session
            .command("chmod")
            .arg(format!("{:o}", mode))
            .arg(path)
            .status()
            .await?;
        if !status.success() {
            return Err(MonitorError::transfer(path, format!("chmod exited with {}", status)));
        }
        Ok(())
    }

    async fn get(&self, remote: &str, local: &Path) -> Result<(), MonitorError> {
        let output = self
            .session
            .command("cat")
            .arg(remote)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        if !output.status.success() {
            return Err(MonitorError::transfer(
                remote,
                String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            ));
        }
        tokio::fs::write(local, output.stdout).await?;
        Ok(())
    }

    async fn exec(&self, command: &str, echo: bool) -> Result<RunOutput, MonitorError> {
        let mut process = self
            .session
            .raw_command(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .await?;
        let (stdout, stderr) = match (process.stdout().take(), process.stderr().take()) {
            (Some(stdout), Some(stderr)) => {
                join(
                    self.read_lines(stdout, "stdout", echo),
                    self.read_lines(stderr, "stderr", echo),
                )
                .await
            }
            _ => {
                warn!("{} Output streams were not available", self.colorhost);
                (Vec::new(), Vec::new())
            }
        };
        let status = process.wait().await?;
        Ok(RunOutput {
            status: status.code(),
            stdout,
            stderr,
        })
    }

    async fn close(self: Box<Self>) {
        debug!("{} Terminating connection.", self.colorhost);
        if let Err(e) = self.session.close().await {
            warn!("{} Error while terminating: {}", self.colorhost, e);
        }
    }
}

/// Like `read_until`, but stops at whichever of the two delimiters comes first.
/// The delimiter is kept in `buf`.
async fn read_until2<B: AsyncRead + Unpin>(
    reader: &mut BufReader<B>,
    delimiter1: u8,
    delimiter2: u8,
    buf: &mut Vec<u8>,
) -> std::io::Result<()> {
    loop {
        let (done, used) = {
            let available = reader.fill_buf().await?;
            if let Some(i) = memchr::memchr2(delimiter1, delimiter2, available) {
                buf.extend_from_slice(&available[..=i]);
                (true, i + 1)
            } else {
                buf.extend_from_slice(available);
                (false, available.len())
            }
        };
        reader.consume(used);
        if done || used == 0 {
            return Ok(());
        }
    }
}
