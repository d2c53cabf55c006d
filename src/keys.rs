//! Keypairs generated for hosts that refuse password-less login.
//!
//! Keys live under `<config dir>/esm_monitor/keys/<user>_<host>`, with the
//! public half next to it as `<user>_<host>.pub`.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use crate::config::platform_dir;
use crate::error::MonitorError;
use crate::host::Host;
use crate::sync::LockFile;

#[async_trait]
pub trait KeyGenerator: Send + Sync {
    /// Writes a new keypair to `private_key` and `private_key` + `.pub`.
    async fn generate(&self, private_key: &Path, comment: &str) -> Result<(), MonitorError>;
}

/// 2048-bit RSA keys in OpenSSH encoding, produced by `ssh-keygen`.
pub struct SshKeygen;

#[async_trait]
impl KeyGenerator for SshKeygen {
    async fn generate(&self, private_key: &Path, comment: &str) -> Result<(), MonitorError> {
        let status = Command::new("ssh-keygen")
            .arg("-q")
            .args(["-t", "rsa", "-b", "2048", "-N", ""])
            .arg("-C")
            .arg(comment)
            .arg("-f")
            .arg(private_key)
            .stdin(Stdio::null())
            .status()
            .await?;
        if !status.success() {
            return Err(MonitorError::LocalCommandError(std::io::Error::other(
                format!("ssh-keygen exited with {}", status),
            )));
        }
        Ok(())
    }
}

pub struct KeyStore {
    dir: PathBuf,
    generator: Box<dyn KeyGenerator>,
}

impl KeyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_generator(dir, Box::new(SshKeygen))
    }

    pub fn with_generator(dir: impl Into<PathBuf>, generator: Box<dyn KeyGenerator>) -> Self {
        Self {
            dir: dir.into(),
            generator,
        }
    }

    /// `<config dir>/esm_monitor/keys`.
    pub fn default_dir() -> Result<PathBuf, MonitorError> {
        Ok(platform_dir(dirs::config_dir(), "configuration")?
            .join("esm_monitor")
            .join("keys"))
    }

    pub fn private_key(&self, host: &Host) -> PathBuf {
        self.dir.join(host.key_id())
    }

    pub fn public_key(&self, host: &Host) -> PathBuf {
        let mut path = OsString::from(self.private_key(host));
        path.push(".pub");
        PathBuf::from(path)
    }

    pub fn has_keypair(&self, host: &Host) -> bool {
        self.private_key(host).is_file() && self.public_key(host).is_file()
    }

    /// Makes sure a keypair exists for `host`. Returns whether one had to be
    /// generated. Safe against other instances doing the same at the same time.
    pub async fn ensure_keypair(&self, host: &Host) -> Result<bool, MonitorError> {
        if self.has_keypair(host) {
            return Ok(false);
        }
        tokio::fs::create_dir_all(&self.dir).await?;
        let _lock = LockFile::acquire(self.dir.join(format!("{}.lock", host.key_id()))).await?;
        // Someone else may have finished while we waited for the lock.
        if self.has_keypair(host) {
            return Ok(false);
        }
        info!("Generating a specific key for esm-monitor to use for {}", host);
        let private_key = self.private_key(host);
        // A half-written pair from an interrupted run makes ssh-keygen ask
        // whether to overwrite.
        for stale in [private_key.clone(), self.public_key(host)] {
            if stale.exists() {
                tokio::fs::remove_file(&stale).await?;
            }
        }
        let comment = format!("esm-monitor {}@{}", host.user, host.hostname);
        self.generator.generate(&private_key, &comment).await?;
        Ok(true)
    }
}
