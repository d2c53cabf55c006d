use std::path::Path;

use clap::Parser;
use colourado::{Color, ColorPalette, PaletteType};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use esm_monitor::config::{platform_dir, Cli, Command};
use esm_monitor::deploy::DeploymentCoordinator;
use esm_monitor::logfile::{Hms, RunLog};
use esm_monitor::quota::{bytes_to_human, disk_usage};
use esm_monitor::{
    CommandExecutor, ExperimentConfig, KeyStore, LocalExecutor, MonitorError, OpenSshConnector,
    QueueStatus, QueueStatusReader, RemoteSession,
};

/// Columns of the queue table worth showing in a terminal.
const QUEUE_COLUMNS: [&str; 13] = [
    // Slurm squeue
    "JOBID",
    "PARTITION",
    "USER",
    "NAME",
    "STATE",
    "TIME",
    "START_TIME",
    // PBS qstat
    "Job ID",
    "Queue",
    "Jobname",
    "S",
    "Req'd Time",
    "Elap Time",
];

fn init_logging(quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn session(config: &ExperimentConfig) -> Result<RemoteSession, MonitorError> {
    let host = config.host();
    let color = ColorPalette::new(1, PaletteType::Pastel, false)
        .colors
        .into_iter()
        .next()
        .unwrap_or(Color {
            red: 1.0,
            green: 1.0,
            blue: 1.0,
        });
    let connector = OpenSshConnector::new(&host, color);
    let keys = KeyStore::new(KeyStore::default_dir()?);
    Ok(RemoteSession::new(host, Box::new(connector), keys)
        .interactive(config.use_password)
        .required_modules(config.required_modules.clone()))
}

async fn run_deploy(
    config: &ExperimentConfig,
    analysis_root: Option<&Path>,
) -> Result<(), MonitorError> {
    // The command line wins over the configuration file.
    let analysis_root = match (analysis_root, &config.analysis_scripts) {
        (Some(root), _) => root.to_path_buf(),
        (None, Some(root)) => root.clone(),
        (None, None) => platform_dir(dirs::config_dir(), "configuration")?
            .join("esm_monitor")
            .join("analysis"),
    };
    let jobs = config.jobs()?;
    info!(
        "Deploying {} analysis jobs of {} to {}",
        jobs.len(),
        config.expid(),
        config.host()
    );
    let coordinator =
        DeploymentCoordinator::new(config.simulation()?, session(config)?, analysis_root);
    let report = coordinator.run_batch(&jobs).await?;
    for local in &report.fetched {
        println!("{}", local.display());
    }
    if !report.failed.is_empty() {
        error!("Failed jobs: {:#?}", report.failed);
    }
    Ok(())
}

async fn run_queue(config: &ExperimentConfig, local: bool) -> Result<(), MonitorError> {
    let entry = config.host_entry()?;
    let reader = QueueStatusReader::for_host(&entry, &config.user, &config.host)?;
    let status = if local {
        reader.read(&LocalExecutor).await?
    } else {
        reader.read(&session(config)?).await?
    };
    match status {
        QueueStatus::Empty => println!("No jobs"),
        QueueStatus::Jobs(table) => {
            let shown: Vec<&str> = QUEUE_COLUMNS
                .iter()
                .copied()
                .filter(|column| table.column_index(column).is_some())
                .collect();
            if shown.is_empty() {
                print!("{}", table);
            } else {
                print!("{}", table.select(&shown));
            }
        }
    }
    Ok(())
}

async fn run_usage(config: &ExperimentConfig) -> Result<(), MonitorError> {
    let entry = config.host_entry()?;
    let session = session(config)?;
    let usage = disk_usage(&session, &config.basedir, &entry).await?;
    println!(
        "{}: {}",
        config.expid(),
        bytes_to_human(usage.experiment)
    );
    match usage.quota {
        Some(quota) => println!(
            "Quota: {} used of {}",
            bytes_to_human(quota.used as u64),
            bytes_to_human(quota.available as u64)
        ),
        None => println!("Quota: unknown"),
    }
    Ok(())
}

async fn run_throughput(config: &ExperimentConfig) -> Result<(), MonitorError> {
    let path = config.run_log_path();
    let output = session(config)?
        .execute(&format!("cat {}", path))
        .await?;
    if !output.success() {
        return Err(MonitorError::Transfer {
            path,
            reason: output.stderr.join(" "),
        });
    }
    let log = RunLog::parse(&output.stdout);
    for times in log.run_times() {
        println!(
            "run {:>5}  wall {:>10}  queue {:>10}",
            times.run,
            Hms(times.wall).to_string(),
            Hms(times.queue).to_string()
        );
    }
    match log.run_stats() {
        Some(stats) => {
            println!("Mean wall time:     {}", Hms(stats.mean_wall));
            println!("Mean queue time:    {}", Hms(stats.mean_queue));
            println!("Optimal throughput: {:.2} runs/day", stats.optimal_throughput);
            println!("Actual throughput:  {:.2} runs/day", stats.actual_throughput);
            println!("Efficiency:         {:.1}%", stats.efficiency);
        }
        None => println!("No finished runs yet"),
    }
    Ok(())
}

async fn run_auth(config: &ExperimentConfig) -> Result<(), MonitorError> {
    let session = session(config)?;
    let auth = session.ensure_authenticated().await?;
    println!("{} {:?}", session.host(), auth);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), MonitorError> {
    let cli = Cli::parse();
    init_logging(cli.quiet);

    let config = ExperimentConfig::load(&cli.command.experiment().config_path()?)?;

    match &cli.command {
        Command::Deploy { analysis_root, .. } => {
            run_deploy(&config, analysis_root.as_deref()).await?
        }
        Command::Queue { local, .. } => run_queue(&config, *local).await?,
        Command::Usage { .. } => run_usage(&config).await?,
        Command::Throughput { .. } => run_throughput(&config).await?,
        Command::Auth { .. } => run_auth(&config).await?,
    };

    Ok(())
}
