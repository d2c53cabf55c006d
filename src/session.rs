//! Remote session for one `(user, host)`.
//!
//! Every public operation authenticates, opens its own connection, does its
//! work and closes the connection again. Nothing is kept between operations.

use std::path::Path;

use async_trait::async_trait;
use itertools::Itertools;
use tracing::{debug, info, warn};

use crate::error::MonitorError;
use crate::host::Host;
use crate::keys::KeyStore;
use crate::queue::CommandExecutor;
use crate::transport::{AuthMode, Connection, Connector, RunOutput};

/// Permissions of deployed scripts: rwxr-xr-x.
pub const SCRIPT_MODE: u32 = 0o755;

/// The operations the deployment pipeline needs from a compute host.
#[async_trait]
pub trait Session: Send + Sync {
    /// Creates `remote_dir` if needed, uploads `local` as `remote_name` unless
    /// a file of that name is already there, and makes it executable.
    /// Returns the remote path.
    async fn upload_if_absent(
        &self,
        local: &Path,
        remote_dir: &str,
        remote_name: &str,
    ) -> Result<String, MonitorError>;

    /// Runs `./executable args...` inside `remote_dir` in a login shell.
    async fn run(
        &self,
        remote_dir: &str,
        executable: &str,
        args: &[String],
    ) -> Result<RunOutput, MonitorError>;

    async fn download(&self, remote: &str, local: &Path) -> Result<(), MonitorError>;
}

pub struct RemoteSession {
    host: Host,
    connector: Box<dyn Connector>,
    keys: KeyStore,
    interactive: bool,
    required_modules: Vec<String>,
}

impl RemoteSession {
    pub fn new(host: Host, connector: Box<dyn Connector>, keys: KeyStore) -> Self {
        Self {
            host,
            connector,
            keys,
            interactive: false,
            required_modules: Vec::new(),
        }
    }

    /// Prompt for a password on every connection instead of using keys.
    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    /// Environment modules loaded before analysis scripts run.
    pub fn required_modules(mut self, modules: Vec<String>) -> Self {
        self.required_modules = modules;
        self
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    /// Finds a way to log in, setting up a tool keypair if nothing else works.
    pub async fn ensure_authenticated(&self) -> Result<AuthMode, MonitorError> {
        let (auth, connection) = self.open().await?;
        connection.close().await;
        Ok(auth)
    }

    async fn open(&self) -> Result<(AuthMode, Box<dyn Connection>), MonitorError> {
        if self.interactive {
            let connection = self
                .connector
                .connect(&self.host, &AuthMode::Password)
                .await
                .map_err(|e| self.auth_error("password login failed", e))?;
            return Ok((AuthMode::Password, connection));
        }

        match self.connector.connect(&self.host, &AuthMode::Agent).await {
            Ok(connection) => return Ok((AuthMode::Agent, connection)),
            Err(e) => debug!("Password-less login to {} failed: {}", self.host, e),
        }

        let keypair = AuthMode::Keypair(self.keys.private_key(&self.host));
        if self.keys.has_keypair(&self.host) {
            match self.connector.connect(&self.host, &keypair).await {
                Ok(connection) => return Ok((keypair, connection)),
                Err(e) => warn!(
                    "The esm-monitor key for {} was rejected ({}), deploying it again",
                    self.host, e
                ),
            }
        } else {
            self.keys.ensure_keypair(&self.host).await?;
        }

        self.deploy_public_key().await?;
        let connection = self
            .connector
            .connect(&self.host, &keypair)
            .await
            .map_err(|e| self.auth_error("deployed key was not accepted", e))?;
        info!("Using esm-monitor specific keys for {}", self.host);
        Ok((keypair, connection))
    }

    /// Appends our public key to `~/.ssh/authorized_keys`, logging in with
    /// the password once.
    async fn deploy_public_key(&self) -> Result<(), MonitorError> {
        let public_key = tokio::fs::read(self.keys.public_key(&self.host)).await?;
        info!("Copying the esm-monitor public key to {}", self.host);
        let connection = self
            .connector
            .connect(&self.host, &AuthMode::Password)
            .await
            .map_err(|e| self.auth_error("password login failed", e))?;
        let result = append_authorized_key(connection.as_ref(), &public_key).await;
        connection.close().await;
        result
    }

    /// Turns a failed connection attempt into an authentication error,
    /// leaving ones that already are as they are.
    fn auth_error(&self, context: &str, error: MonitorError) -> MonitorError {
        match error {
            MonitorError::Authentication { .. } => error,
            other => MonitorError::Authentication {
                user: self.host.user.clone(),
                host: self.host.hostname.clone(),
                reason: format!("{}: {}", context, other),
            },
        }
    }

    /// Runs an arbitrary command string on the host and collects its output
    /// without printing it.
    pub async fn command(&self, command: &str) -> Result<RunOutput, MonitorError> {
        self.exec(command, false).await
    }

    async fn exec(&self, command: &str, echo: bool) -> Result<RunOutput, MonitorError> {
        let (_, connection) = self.open().await?;
        debug!("{} $ {}", self.host, command);
        let result = connection.exec(command, echo).await;
        connection.close().await;
        result
    }
}

async fn append_authorized_key(
    connection: &dyn Connection,
    public_key: &[u8],
) -> Result<(), MonitorError> {
    let home = connection.exec("echo $HOME", false).await?;
    let home = home
        .stdout
        .first()
        .map(|line| line.trim().to_owned())
        .filter(|line| !line.is_empty())
        .ok_or_else(|| MonitorError::transfer("$HOME", "could not determine remote home"))?;
    let ssh_dir = format!("{}/.ssh", home);
    if !connection.exists(&ssh_dir).await? {
        connection.mkdir(&ssh_dir).await?;
        connection.chmod(&ssh_dir, 0o700).await?;
    }
    let mut line = public_key.to_vec();
    if line.last() != Some(&b'\n') {
        line.push(b'\n');
    }
    connection
        .append(&format!("{}/authorized_keys", ssh_dir), &line)
        .await
}

#[async_trait]
impl Session for RemoteSession {
    async fn upload_if_absent(
        &self,
        local: &Path,
        remote_dir: &str,
        remote_name: &str,
    ) -> Result<String, MonitorError> {
        let remote_path = remote_join(remote_dir, remote_name);
        let (_, connection) = self.open().await?;
        let result = upload(connection.as_ref(), local, remote_dir, &remote_path).await;
        connection.close().await;
        result.map(|()| remote_path)
    }

    async fn run(
        &self,
        remote_dir: &str,
        executable: &str,
        args: &[String],
    ) -> Result<RunOutput, MonitorError> {
        info!("Executing {} in {}", executable, remote_dir);
        if !self.required_modules.is_empty() {
            info!("Loading modules {}", self.required_modules.join(" "));
        }
        let command = analysis_command(&self.required_modules, remote_dir, executable, args);
        let output = self.exec(&command, true).await?;
        if !output.success() {
            warn!(
                "{} ./{} finished with status {:?}",
                self.host, executable, output.status
            );
        }
        Ok(output)
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<(), MonitorError> {
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let (_, connection) = self.open().await?;
        info!("Copying from {} to {}", remote, local.display());
        let result = match connection.exists(remote).await {
            Ok(true) => connection.get(remote, local).await,
            Ok(false) => Err(MonitorError::transfer(remote, "no such remote file")),
            Err(e) => Err(e),
        };
        connection.close().await;
        result
    }
}

#[async_trait]
impl CommandExecutor for RemoteSession {
    async fn execute(&self, command: &str) -> Result<RunOutput, MonitorError> {
        self.command(command).await
    }
}

async fn upload(
    connection: &dyn Connection,
    local: &Path,
    remote_dir: &str,
    remote_path: &str,
) -> Result<(), MonitorError> {
    mkdir_p(connection, remote_dir).await?;
    if connection.exists(remote_path).await? {
        debug!("{} is already deployed", remote_path);
    } else {
        info!("Copying {} to {}", local.display(), remote_path);
        connection.put(local, remote_path).await?;
    }
    connection.chmod(remote_path, SCRIPT_MODE).await
}

/// Creates `dir` and any missing parents, root to leaf.
async fn mkdir_p(connection: &dyn Connection, dir: &str) -> Result<(), MonitorError> {
    for prefix in path_prefixes(dir) {
        if connection.exists(&prefix).await? {
            continue;
        }
        if let Err(e) = connection.mkdir(&prefix).await {
            // Another process may have created it in the meantime.
            if !connection.exists(&prefix).await? {
                return Err(e);
            }
        }
    }
    Ok(())
}

/// `/a/b/c` yields `/a`, `/a/b`, `/a/b/c`.
pub fn path_prefixes(dir: &str) -> Vec<String> {
    let mut prefix = String::with_capacity(dir.len());
    if dir.starts_with('/') {
        prefix.push('/');
    }
    let mut prefixes = Vec::new();
    for segment in dir.split('/').filter(|segment| !segment.is_empty()) {
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }
        prefix.push_str(segment);
        prefixes.push(prefix.clone());
    }
    prefixes
}

pub fn remote_join(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

/// Keeps the remote shell from expanding variables in an argument.
pub fn escape_arg(arg: &str) -> String {
    let mut escaped = String::with_capacity(arg.len());
    for c in arg.chars() {
        if matches!(c, '$' | '{' | '}') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// `bash -l -c '[module purge; module load <mods>; ]cd <dir>; ./<exe> <args>'`
pub fn analysis_command(
    required_modules: &[String],
    remote_dir: &str,
    executable: &str,
    args: &[String],
) -> String {
    let modules = if required_modules.is_empty() {
        String::new()
    } else {
        format!("module purge; module load {}; ", required_modules.join(" "))
    };
    let invocation = std::iter::once(format!("./{}", executable))
        .chain(args.iter().map(|arg| escape_arg(arg)))
        .join(" ");
    format!("bash -l -c '{}cd {}; {}'", modules, remote_dir, invocation)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_arg() {
        assert_eq!(escape_arg("${HOME}/foo"), "\\$\\{HOME\\}/foo");
        assert_eq!(escape_arg("*.nc"), "*.nc");
    }

    #[test]
    fn test_analysis_command_without_modules() {
        let command = analysis_command(
            &[],
            "/work/x/foo/analysis/echam",
            "monitoring_echam_global_timeseries.sh",
            &["temp2".to_string(), "*.nc".to_string()],
        );
        assert_eq!(
            command,
            "bash -l -c 'cd /work/x/foo/analysis/echam; ./monitoring_echam_global_timeseries.sh temp2 *.nc'"
        );
    }

    #[test]
    fn test_analysis_command_with_modules() {
        let command = analysis_command(
            &["cdo".to_string(), "nco".to_string()],
            "/dir",
            "run.sh",
            &[],
        );
        assert_eq!(
            command,
            "bash -l -c 'module purge; module load cdo nco; cd /dir; ./run.sh'"
        );
    }

    #[test]
    fn test_path_prefixes() {
        assert_eq!(path_prefixes("/a/b/c"), vec!["/a", "/a/b", "/a/b/c"]);
        assert_eq!(path_prefixes("/a//b/"), vec!["/a", "/a/b"]);
        assert_eq!(path_prefixes("rel/dir"), vec!["rel", "rel/dir"]);
        assert!(path_prefixes("/").is_empty());
    }

    #[test]
    fn test_remote_join() {
        assert_eq!(remote_join("/a/b/", "c.sh"), "/a/b/c.sh");
        assert_eq!(remote_join("/a/b", "c.sh"), "/a/b/c.sh");
    }
}
