//! Compute hosts.
//!
//! A `Host` is the `(user, hostname)` pair one `RemoteSession` talks to. The
//! `HostTable` carries what differs between sites: which batch scheduler runs
//! there, how its queue is listed and how the storage quota can be read.

use std::collections::HashMap;
use std::fmt;

use colored::*;
use colourado::Color;
use serde::Deserialize;

use crate::queue::SchedulerKind;
use crate::quota::QuotaParser;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    /// Remote username.
    pub user: String,
    /// SSH hostname to connect to.
    pub hostname: String,
}

impl Host {
    pub fn new(user: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            hostname: hostname.into(),
        }
    }

    /// Key under which per-host local state (generated keys) is stored.
    pub fn key_id(&self) -> String {
        format!("{}_{}", self.user, self.hostname)
    }

    /// For pretty-printing the host name.
    /// Surrounds with brackets and colors it with the given color.
    pub fn prettify(&self, color: Color) -> ColoredString {
        let r = (color.red * 255.0) as u8;
        let g = (color.green * 255.0) as u8;
        let b = (color.blue * 255.0) as u8;
        format!("{}", self).truecolor(r, g, b)
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}@{}]", self.user, self.hostname)
    }
}

/// Site-specific facts about one compute host.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HostEntry {
    pub scheduler: SchedulerKind,
    /// Handlebars template; `{{user}}` and `{{host}}` are filled in.
    /// Falls back to the scheduler's default command.
    #[serde(default)]
    pub queue_command: Option<String>,
    #[serde(default)]
    pub quota_command: Option<String>,
    #[serde(default)]
    pub quota_parser: Option<QuotaParser>,
}

impl HostEntry {
    fn scheduler(scheduler: SchedulerKind) -> Self {
        Self {
            scheduler,
            queue_command: None,
            quota_command: None,
            quota_parser: None,
        }
    }

    fn with_quota(mut self, command: &str, parser: QuotaParser) -> Self {
        self.quota_command = Some(command.to_owned());
        self.quota_parser = Some(parser);
        self
    }

    pub fn queue_command(&self) -> &str {
        self.queue_command
            .as_deref()
            .unwrap_or_else(|| self.scheduler.default_queue_command())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct HostTable(HashMap<String, HostEntry>);

impl HostTable {
    /// Hosts known out of the box.
    pub fn builtin() -> Self {
        let mut hosts = HashMap::new();
        for slurm_host in ["mistral.dkrz.de", "juwels.fz-juelich.de"] {
            hosts.insert(
                slurm_host.to_owned(),
                HostEntry::scheduler(SchedulerKind::Slurm),
            );
        }
        for ollie in ["ollie0.awi.de", "ollie1.awi.de"] {
            hosts.insert(
                ollie.to_owned(),
                HostEntry::scheduler(SchedulerKind::Slurm)
                    .with_quota("sudo quota.sh", QuotaParser::Ollie),
            );
        }
        for stan in ["stan0.awi.de", "stan1.awi.de"] {
            hosts.insert(stan.to_owned(), HostEntry::scheduler(SchedulerKind::Pbs));
        }
        Self(hosts)
    }

    /// Entries of `other` replace entries of the same host.
    pub fn merged(mut self, other: HostTable) -> Self {
        self.0.extend(other.0);
        self
    }

    pub fn get(&self, hostname: &str) -> Option<&HostEntry> {
        self.0.get(hostname)
    }
}
