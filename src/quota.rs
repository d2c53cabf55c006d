//! Disk usage of an experiment and, where the site offers a way to ask,
//! the storage quota around it.
//!
//! Quota tools are free-text and site specific. Parsing is best effort:
//! anything unexpected means "unknown", never an error.

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::MonitorError;
use crate::host::HostEntry;
use crate::queue::CommandExecutor;

const TERABYTE: f64 = 1e12;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quota {
    /// Bytes in use.
    pub used: f64,
    /// Bytes granted.
    pub available: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaParser {
    /// `sudo quota.sh` on the AWI ollie cluster.
    Ollie,
}

impl QuotaParser {
    pub fn parse(&self, output: &[String]) -> Option<Quota> {
        match self {
            QuotaParser::Ollie => parse_ollie(output),
        }
    }
}

// The second line reads like `...: <used> TB used of <available> TB`.
fn parse_ollie(output: &[String]) -> Option<Quota> {
    let line = output.get(1)?;
    let fields: Vec<&str> = line.rsplit(':').next()?.trim().split(' ').collect();
    let used: f64 = fields.first()?.parse().ok()?;
    let available: f64 = fields.get(4)?.parse().ok()?;
    Some(Quota {
        used: used * TERABYTE,
        available: available * TERABYTE,
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiskUsage {
    /// Bytes under the experiment's base directory.
    pub experiment: u64,
    pub quota: Option<Quota>,
}

pub async fn disk_usage(
    executor: &dyn CommandExecutor,
    basedir: &str,
    host: &HostEntry,
) -> Result<DiskUsage, MonitorError> {
    let output = executor.execute(&format!("cd {}; du -sb", basedir)).await?;
    let experiment = output
        .stdout
        .first()
        .and_then(|line| line.split_whitespace().next())
        .and_then(|size| size.parse().ok())
        .ok_or_else(|| {
            MonitorError::transfer(
                basedir,
                format!("unexpected `du -sb` output: {:?}", output.stdout),
            )
        })?;
    let quota = match (&host.quota_command, &host.quota_parser) {
        (Some(command), Some(parser)) => quota(executor, command, *parser).await,
        _ => None,
    };
    Ok(DiskUsage { experiment, quota })
}

async fn quota(
    executor: &dyn CommandExecutor,
    command: &str,
    parser: QuotaParser,
) -> Option<Quota> {
    let output = match executor.execute(command).await {
        Ok(output) => output,
        Err(e) => {
            warn!("Could not run `{}`: {}", command, e);
            return None;
        }
    };
    // Login shells chatter about environment modules on stderr.
    let errors: Vec<&String> = output
        .stderr
        .iter()
        .filter(|line| !line.to_lowercase().contains("module"))
        .filter(|line| !line.trim().is_empty())
        .collect();
    if !errors.is_empty() {
        warn!("`{}` reported errors: {:?}", command, errors);
        return None;
    }
    let quota = parser.parse(&output.stdout);
    if quota.is_none() {
        debug!("Could not make sense of `{}`: {:?}", command, output.stdout);
    }
    quota
}

/// `1536` becomes `1.500K`; anything below a kibibyte stays in bytes.
pub fn bytes_to_human(n: u64) -> String {
    const SYMBOLS: [char; 8] = ['K', 'M', 'G', 'T', 'P', 'E', 'Z', 'Y'];
    for (i, symbol) in SYMBOLS.iter().enumerate().rev() {
        let prefix = 2f64.powi(10 * (i as i32 + 1));
        if n as f64 >= prefix {
            return format!("{:.3}{}", n as f64 / prefix, symbol);
        }
    }
    format!("{}B", n)
}
