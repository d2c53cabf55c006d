//! esm-monitor: deploy, run and collect monitoring scripts for climate-model
//! experiments on remote HPC hosts.

// Serde helper module.
mod serde;
// Command line arguments and the experiment configuration file.
pub mod config;
// How to parse and represent compute hosts.
pub mod host;
// Analysis jobs and the model table.
pub mod job;
// The copy, run, fetch pipeline.
pub mod deploy;
// SSH session wrapper.
pub mod session;
// Connections to a host, and the openssh implementation of them.
pub mod transport;
// Tool-specific SSH keypairs.
pub mod keys;
// Batch scheduler queue status.
pub mod queue;
// Disk usage and storage quota.
pub mod quota;
// Experiment run logs and throughput.
pub mod logfile;
// Synchronization primitives.
pub mod sync;
// Error handling.
pub mod error;

pub use config::{Cli, Command, ExperimentConfig};
pub use deploy::{BatchReport, Coupling, DeploymentCoordinator, Simulation};
pub use error::MonitorError;
pub use host::{Host, HostEntry, HostTable};
pub use job::{AnalysisJob, FailedJob, ScriptRef};
pub use keys::{KeyGenerator, KeyStore, SshKeygen};
pub use queue::{CommandExecutor, LocalExecutor, QueueStatus, QueueStatusReader, QueueTable, SchedulerKind};
pub use session::{RemoteSession, Session};
pub use sync::LockFile;
pub use transport::{AuthMode, Connection, Connector, OpenSshConnector, RunOutput};
