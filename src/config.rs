//! Configuration for esm-monitor.
//!
//! Holds the clap structs for command line arguments and the per-experiment
//! YAML file, which lives at `<config dir>/monitoring/<expid>.yaml` unless
//! `--config` points elsewhere.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use clap::{Args, Parser, Subcommand};
use itertools::Itertools;
use serde::Deserialize;
use void::Void;

use crate::deploy::{Coupling, Simulation};
use crate::error::MonitorError;
use crate::host::{Host, HostEntry, HostTable};
use crate::job::{model_components, AnalysisJob, ScriptRef, MONITORING_PARTS};
use crate::serde::{false_or_string, ordered_map, string_or_sequence};

#[derive(Parser)]
#[command(version, author, about)]
pub struct Cli {
    /// Only print errors
    #[arg(long, short, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Copy the analysis scripts to the compute host, run them and fetch the results
    Deploy {
        #[command(flatten)]
        experiment: ExperimentArgs,

        /// Where the conventional monitoring scripts live.
        /// Defaults to `<config dir>/esm_monitor/analysis`
        #[arg(long)]
        analysis_root: Option<PathBuf>,
    },
    /// Show the batch scheduler queue of the experiment's user
    Queue {
        #[command(flatten)]
        experiment: ExperimentArgs,

        /// Run the queue command on this machine instead of the compute host
        #[arg(long)]
        local: bool,
    },
    /// Show the disk usage of the experiment and the storage quota
    Usage {
        #[command(flatten)]
        experiment: ExperimentArgs,
    },
    /// Show wall time, queue time and throughput statistics from the run log
    Throughput {
        #[command(flatten)]
        experiment: ExperimentArgs,
    },
    /// Set up password-less login to the compute host
    Auth {
        #[command(flatten)]
        experiment: ExperimentArgs,
    },
}

impl Command {
    pub fn experiment(&self) -> &ExperimentArgs {
        match self {
            Command::Deploy { experiment, .. }
            | Command::Queue { experiment, .. }
            | Command::Usage { experiment }
            | Command::Throughput { experiment }
            | Command::Auth { experiment } => experiment,
        }
    }
}

#[derive(Args)]
pub struct ExperimentArgs {
    /// Experiment whose configuration file to use
    #[arg(long, default_value = "example")]
    pub expid: String,

    /// Configuration file to use. Defaults to `<config dir>/monitoring/<expid>.yaml`
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl ExperimentArgs {
    pub fn config_path(&self) -> Result<PathBuf, MonitorError> {
        match &self.config {
            Some(path) => Ok(path.clone()),
            None => Ok(platform_dir(dirs::config_dir(), "configuration")?
                .join("monitoring")
                .join(format!("{}.yaml", self.expid))),
        }
    }
}

/// A directory from `dirs`, or an error if the platform does not have one.
pub fn platform_dir(dir: Option<PathBuf>, kind: &'static str) -> Result<PathBuf, MonitorError> {
    dir.ok_or(MonitorError::NoPlatformDir(kind))
}

/// Coupled setups known out of the box.
const COUPLED_SETUPS: [(&str, &[&str]); 1] = [("AWICM_PISM", &["awicm", "pism"])];

#[derive(Debug, Clone, Deserialize)]
pub struct ExperimentConfig {
    pub user: String,
    pub host: String,
    pub basedir: String,
    pub model: String,
    /// Name of the coupled setup, `false` if the experiment is not coupled.
    #[serde(default, deserialize_with = "false_or_string")]
    pub coupling: Option<String>,
    /// Prefix under which experiment trees are mirrored locally.
    #[serde(default)]
    pub storagedir: Option<PathBuf>,
    #[serde(default)]
    pub required_modules: Vec<String>,
    #[serde(default)]
    pub use_password: bool,
    #[serde(default)]
    pub analysis_scripts: Option<PathBuf>,
    #[serde(default)]
    pub hosts: HostTable,
    #[serde(default)]
    pub coupled_setups: HashMap<String, Vec<String>>,
    /// Component sections (`echam:`, `fesom:`, ...) and anything else.
    #[serde(flatten)]
    sections: HashMap<String, serde_yaml::Value>,
    #[serde(skip)]
    path: PathBuf,
}

/// Monitoring part name to its variables.
type ComponentSection = HashMap<String, Variables>;

/// Variables in the order they were written.
#[derive(Debug, Clone, Deserialize)]
struct Variables(#[serde(deserialize_with = "ordered_map")] Vec<(String, VariableConfig)>);

#[derive(Debug, Clone, Deserialize)]
struct VariableConfig {
    #[serde(rename = "file pattern")]
    file_pattern: String,
    /// A script path, optionally followed by extra arguments.
    #[serde(rename = "analysis script", default)]
    analysis_script: Option<ScriptSpec>,
}

#[derive(Debug, Clone, Deserialize)]
struct ScriptSpec(#[serde(deserialize_with = "string_or_sequence")] ScriptSpecInner);

#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
struct ScriptSpecInner(Vec<String>);

impl FromStr for ScriptSpecInner {
    type Err = Void;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(vec![s.to_string()]))
    }
}

impl ExperimentConfig {
    pub fn load(path: &Path) -> Result<Self, MonitorError> {
        let file = File::open(path).map_err(|source| MonitorError::ConfigFile {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self =
            serde_yaml::from_reader(file).map_err(|source| MonitorError::Config {
                path: path.to_path_buf(),
                source,
            })?;
        config.path = path.to_path_buf();
        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, MonitorError> {
        serde_yaml::from_str(yaml).map_err(|source| MonitorError::Config {
            path: PathBuf::new(),
            source,
        })
    }

    pub fn host(&self) -> Host {
        Host::new(&self.user, &self.host)
    }

    /// Built-in hosts, overridden by the `hosts:` section.
    pub fn host_entry(&self) -> Result<HostEntry, MonitorError> {
        HostTable::builtin()
            .merged(self.hosts.clone())
            .get(&self.host)
            .cloned()
            .ok_or_else(|| MonitorError::UnknownHost(self.host.clone()))
    }

    pub fn expid(&self) -> &str {
        self.basedir
            .split('/')
            .filter(|segment| !segment.is_empty())
            .last()
            .unwrap_or_default()
    }

    pub fn storage_prefix(&self) -> Result<PathBuf, MonitorError> {
        match &self.storagedir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(platform_dir(dirs::data_dir(), "data")?.join("esm_monitor")),
        }
    }

    pub fn coupling(&self) -> Result<Option<Coupling>, MonitorError> {
        let name = match &self.coupling {
            Some(name) => name,
            None => return Ok(None),
        };
        let setups = match self.coupled_setups.get(name) {
            Some(setups) => setups.clone(),
            None => COUPLED_SETUPS
                .iter()
                .find(|(builtin, _)| builtin.eq_ignore_ascii_case(name))
                .map(|(_, setups)| setups.iter().map(|s| s.to_string()).collect())
                .ok_or_else(|| MonitorError::UnknownModel(name.clone()))?,
        };
        Coupling::from_setup_names(name, &setups).map(Some)
    }

    pub fn simulation(&self) -> Result<Simulation, MonitorError> {
        let simulation = Simulation::new(&self.basedir, &self.user, self.storage_prefix()?);
        Ok(match self.coupling()? {
            Some(coupling) => simulation.with_coupling(coupling),
            None => simulation,
        })
    }

    /// Components that may have monitoring sections: those of every coupled
    /// setup, or those of the model.
    pub fn components(&self) -> Result<Vec<String>, MonitorError> {
        match self.coupling()? {
            Some(coupling) => Ok(coupling
                .setups
                .into_iter()
                .flat_map(|(_, components)| components)
                .unique()
                .collect()),
            None => model_components(&self.model)
                .map(|components| components.iter().map(|c| c.to_string()).collect())
                .ok_or_else(|| MonitorError::UnknownModel(self.model.clone())),
        }
    }

    /// Expands the component sections into jobs, component by component, in
    /// monitoring part order, with variables in the order they were written.
    pub fn jobs(&self) -> Result<Vec<AnalysisJob>, MonitorError> {
        let mut jobs = Vec::new();
        for component in self.components()? {
            let section = match self.sections.get(&component) {
                Some(section) => section,
                None => continue,
            };
            let section: ComponentSection = serde_yaml::from_value(section.clone())
                .map_err(|source| MonitorError::Config {
                    path: self.path.clone(),
                    source,
                })?;
            for part in MONITORING_PARTS {
                let variables = match section.get(part) {
                    Some(variables) => variables,
                    None => continue,
                };
                for (variable, config) in &variables.0 {
                    let mut args = vec![variable.clone(), config.file_pattern.clone()];
                    let script = match &config.analysis_script {
                        Some(ScriptSpec(ScriptSpecInner(spec))) if !spec.is_empty() => {
                            args.extend(spec[1..].iter().cloned());
                            ScriptRef::Explicit(PathBuf::from(&spec[0]))
                        }
                        _ => ScriptRef::Convention,
                    };
                    jobs.push(AnalysisJob {
                        component: component.clone(),
                        monitoring_part: part.to_string(),
                        variable: variable.clone(),
                        script,
                        args,
                    });
                }
            }
        }
        Ok(jobs)
    }

    /// `<basedir>/scripts/<expid>_<model>_compute.log`
    pub fn run_log_path(&self) -> String {
        format!(
            "{}/scripts/{}_{}_compute.log",
            self.basedir.trim_end_matches('/'),
            self.expid(),
            self.model.to_lowercase()
        )
    }
}
