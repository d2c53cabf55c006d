//! The copy, run, fetch pipeline.
//!
//! Analysis scripts live on the compute host under
//! `<basedir>/analysis/<component>` (or `<basedir>/<setup>/analysis/<component>`
//! for coupled setups). They are expected to leave their results next to
//! themselves as `<expid>_<component>_<variable>_<tag>.nc`, which is copied to
//! the mirrored directory on this machine.

use std::path::{Path, PathBuf};

use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

use crate::error::MonitorError;
use crate::job::{model_components, snake_tag, AnalysisJob, FailedJob};
use crate::session::{remote_join, Session};
use crate::transport::RunOutput;

/// Pause between two jobs, so the login nodes don't see a burst of connections.
pub const JOB_DELAY: Duration = Duration::from_secs(1);

/// An iteratively coupled experiment: each setup has its own subdirectory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coupling {
    pub name: String,
    /// Setup name and the components it runs, searched in order.
    pub setups: Vec<(String, Vec<String>)>,
}

impl Coupling {
    /// Takes each setup's components from the model table.
    pub fn from_setup_names(name: &str, setups: &[String]) -> Result<Self, MonitorError> {
        let setups = setups
            .iter()
            .map(|setup| {
                let components = model_components(setup)
                    .ok_or_else(|| MonitorError::UnknownModel(setup.clone()))?;
                Ok((
                    setup.clone(),
                    components.iter().map(|c| c.to_string()).collect(),
                ))
            })
            .collect::<Result<_, MonitorError>>()?;
        Ok(Self {
            name: name.to_owned(),
            setups,
        })
    }

    pub fn setup_of(&self, component: &str) -> Option<&str> {
        self.setups
            .iter()
            .find(|(_, components)| components.iter().any(|c| c == component))
            .map(|(setup, _)| setup.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Simulation {
    /// Top of the experiment on the compute host.
    pub basedir: String,
    pub user: String,
    /// Where experiment trees are mirrored on this machine.
    pub storage_prefix: PathBuf,
    pub coupling: Option<Coupling>,
}

impl Simulation {
    pub fn new(basedir: impl Into<String>, user: impl Into<String>, storage_prefix: impl Into<PathBuf>) -> Self {
        Self {
            basedir: basedir.into(),
            user: user.into(),
            storage_prefix: storage_prefix.into(),
            coupling: None,
        }
    }

    pub fn with_coupling(mut self, coupling: Coupling) -> Self {
        self.coupling = Some(coupling);
        self
    }

    fn segments(&self) -> impl Iterator<Item = &str> {
        self.basedir.split('/').filter(|s| !s.is_empty())
    }

    /// Last segment of the base directory.
    pub fn expid(&self) -> &str {
        self.segments().last().unwrap_or_default()
    }

    /// The storage prefix followed by the part of `basedir` below the user's
    /// directory, e.g. `/work/ollie/pgierz/AWICM/PI` with prefix `/scratch`
    /// gives `/scratch/AWICM/PI`.
    pub fn storage_dir(&self) -> PathBuf {
        let segments: Vec<&str> = self.segments().collect();
        let tail = match segments.iter().position(|s| *s == self.user) {
            Some(index) => &segments[index + 1..],
            None => &segments[segments.len().saturating_sub(1)..],
        };
        tail.iter()
            .fold(self.storage_prefix.clone(), |dir, segment| dir.join(segment))
    }

    pub fn remote_analysis_dir(&self, component: &str) -> Result<String, MonitorError> {
        let basedir = self.basedir.trim_end_matches('/');
        match &self.coupling {
            Some(coupling) => {
                info!("Determining which setup {} belongs to", component);
                let setup = coupling.setup_of(component).ok_or_else(|| {
                    MonitorError::UnknownComponent {
                        coupling: coupling.name.clone(),
                        component: component.to_owned(),
                    }
                })?;
                Ok(format!("{}/{}/analysis/{}", basedir, setup, component))
            }
            None => Ok(format!("{}/analysis/{}", basedir, component)),
        }
    }

    /// `<expid>_<component>_<variable>_<tag>.nc`
    pub fn result_file_name(&self, component: &str, variable: &str, tag: &str) -> String {
        format!(
            "{}_{}_{}_{}.nc",
            self.expid(),
            component,
            variable,
            snake_tag(tag)
        )
    }
}

#[derive(Debug, Default)]
pub struct BatchReport {
    /// Local paths of the fetched results.
    pub fetched: Vec<PathBuf>,
    pub failed: Vec<FailedJob>,
}

pub struct DeploymentCoordinator<S> {
    simulation: Simulation,
    session: S,
    analysis_root: PathBuf,
    delay: Duration,
}

impl<S: Session> DeploymentCoordinator<S> {
    pub fn new(simulation: Simulation, session: S, analysis_root: impl Into<PathBuf>) -> Self {
        Self {
            simulation,
            session,
            analysis_root: analysis_root.into(),
            delay: JOB_DELAY,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn simulation(&self) -> &Simulation {
        &self.simulation
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn remote_analysis_dir(&self, component: &str) -> Result<String, MonitorError> {
        self.simulation.remote_analysis_dir(component)
    }

    /// Copies `script` to the component's analysis directory and runs it there.
    pub async fn deploy_and_run(
        &self,
        component: &str,
        script: &Path,
        args: &[String],
    ) -> Result<RunOutput, MonitorError> {
        if !script.is_file() {
            return Err(MonitorError::ScriptNotFound(script.to_path_buf()));
        }
        let name = script
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| MonitorError::ScriptNotFound(script.to_path_buf()))?;
        let remote_dir = self.remote_analysis_dir(component)?;
        self.session
            .upload_if_absent(script, &remote_dir, name)
            .await?;
        self.session.run(&remote_dir, name, args).await
    }

    /// Copies the result file of `variable` back. Returns its local path.
    pub async fn fetch_result(
        &self,
        component: &str,
        variable: &str,
        tag: &str,
    ) -> Result<PathBuf, MonitorError> {
        let file_name = self.simulation.result_file_name(component, variable, tag);
        let destination = self.simulation.storage_dir().join("analysis").join(component);
        tokio::fs::create_dir_all(&destination).await?;
        let remote = remote_join(&self.remote_analysis_dir(component)?, &file_name);
        let local = destination.join(&file_name);
        self.session.download(&remote, &local).await?;
        Ok(local)
    }

    /// Runs all jobs one after the other. A missing local script stops the
    /// whole batch; any other failure is recorded and the batch moves on.
    pub async fn run_batch(&self, jobs: &[AnalysisJob]) -> Result<BatchReport, MonitorError> {
        let mut report = BatchReport::default();
        for (index, job) in jobs.iter().enumerate() {
            if index > 0 && !self.delay.is_zero() {
                sleep(self.delay).await;
            }
            let script = job
                .script
                .resolve(&self.analysis_root, &job.component, &job.monitoring_part);
            if !script.is_file() {
                error!(
                    "The analysis script for {} does not exist: {}",
                    job,
                    script.display()
                );
                return Err(MonitorError::ScriptNotFound(script));
            }
            info!("=== {} ===", job);
            match self.run_job(job, &script).await {
                Ok(local) => report.fetched.push(local),
                Err(e) => {
                    warn!("{} failed: {}", job, e);
                    report.failed.push(FailedJob::new(job.to_string(), e.to_string()));
                }
            }
        }
        Ok(report)
    }

    async fn run_job(&self, job: &AnalysisJob, script: &Path) -> Result<PathBuf, MonitorError> {
        let output = self.deploy_and_run(&job.component, script, &job.args).await?;
        if !output.success() {
            warn!(
                "{} exited with status {:?}, fetching whatever it left behind",
                job, output.status
            );
        }
        self.fetch_result(&job.component, &job.variable, &job.monitoring_part)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simulation() -> Simulation {
        Simulation::new("/work/ollie/pgierz/AWICM/PI", "pgierz", "/scratch/work/pgierz")
    }

    fn coupled() -> Simulation {
        let coupling =
            Coupling::from_setup_names("AWICM_PISM", &["awicm".to_string(), "pism".to_string()])
                .unwrap();
        simulation().with_coupling(coupling)
    }

    #[test]
    fn test_expid() {
        assert_eq!(simulation().expid(), "PI");
        assert_eq!(Simulation::new("/work/x/foo/", "x", "/s").expid(), "foo");
    }

    #[test]
    fn test_storage_dir() {
        assert_eq!(
            simulation().storage_dir(),
            PathBuf::from("/scratch/work/pgierz/AWICM/PI")
        );
        assert_eq!(
            Simulation::new("/work/shared/exp1", "pgierz", "/scratch").storage_dir(),
            PathBuf::from("/scratch/exp1")
        );
    }

    #[test]
    fn test_remote_analysis_dir() {
        assert_eq!(
            simulation().remote_analysis_dir("echam").unwrap(),
            "/work/ollie/pgierz/AWICM/PI/analysis/echam"
        );
        assert_eq!(
            coupled().remote_analysis_dir("fesom").unwrap(),
            "/work/ollie/pgierz/AWICM/PI/awicm/analysis/fesom"
        );
        assert_eq!(
            coupled().remote_analysis_dir("pism").unwrap(),
            "/work/ollie/pgierz/AWICM/PI/pism/analysis/pism"
        );
    }

    #[test]
    fn test_unknown_component_in_coupled_setup() {
        for component in ["mpiom", "icon", ""] {
            assert!(matches!(
                coupled().remote_analysis_dir(component),
                Err(MonitorError::UnknownComponent { .. })
            ));
        }
    }

    #[test]
    fn test_unknown_setup_model() {
        assert!(matches!(
            Coupling::from_setup_names("X", &["icon".to_string()]),
            Err(MonitorError::UnknownModel(_))
        ));
    }

    #[test]
    fn test_result_file_name() {
        let simulation = Simulation::new("/work/x/foo", "x", "/s");
        assert_eq!(
            simulation.result_file_name("echam", "temp2", "Global Timeseries"),
            "foo_echam_temp2_global_timeseries.nc"
        );
    }
}
