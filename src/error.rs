use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Could not authenticate as {user}@{host}: {reason}")]
    Authentication {
        user: String,
        host: String,
        reason: String,
    },
    #[error("The analysis script {} does not exist", .0.display())]
    ScriptNotFound(PathBuf),
    #[error("No setup of the coupled setup '{coupling}' contains the component '{component}'")]
    UnknownComponent { coupling: String, component: String },
    #[error("Transfer of {path} failed: {reason}")]
    Transfer { path: String, reason: String },
    #[error("Malformed queue output: {0}")]
    QueueParse(String),
    #[error("No scheduler is configured for host {0}")]
    UnknownHost(String),
    #[error("Unknown model {0}")]
    UnknownModel(String),
    #[error("This platform has no {0} directory, pass the path explicitly")]
    NoPlatformDir(&'static str),
    #[error("Failed to open configuration {}: {source}", .path.display())]
    ConfigFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse configuration {}: {source}", .path.display())]
    Config {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("Failed to render command template: {0}")]
    Template(#[from] handlebars::RenderError),
    #[error("Failed to connect SSH session or execute SSH command: {0}")]
    SshError(#[from] openssh::Error),
    #[error("Failed to execute local command: {0}")]
    LocalCommandError(#[from] std::io::Error),
}

impl MonitorError {
    pub(crate) fn transfer(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Transfer {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
