use std::fmt;
use std::path::{Path, PathBuf};

/// Monitoring parts, in the order they are deployed.
pub const MONITORING_PARTS: [&str; 2] = ["Global Timeseries", "Global Climatology"];

/// Components of each model the tool knows about.
pub const MODEL_COMPONENTS: [(&str, &[&str]); 4] = [
    ("AWICM", &["echam", "jsbach", "hdmodel", "fesom"]),
    ("MPIESM", &["echam", "jsbach", "hdmodel", "mpiom"]),
    ("COSMOS", &["echam", "jsbach", "hdmodel", "mpiom"]),
    ("PISM", &["pism"]),
];

pub fn model_components(model: &str) -> Option<&'static [&'static str]> {
    let model = model.to_uppercase();
    MODEL_COMPONENTS
        .iter()
        .find(|(name, _)| *name == model)
        .map(|(_, components)| *components)
}

/// `Global Timeseries` becomes `global_timeseries`.
pub fn snake_tag(tag: &str) -> String {
    tag.to_lowercase().replace(' ', "_")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptRef {
    Explicit(PathBuf),
    /// `<analysis root>/<component>/monitoring_<component>_<part>.sh`
    Convention,
}

impl ScriptRef {
    pub fn resolve(&self, analysis_root: &Path, component: &str, monitoring_part: &str) -> PathBuf {
        match self {
            ScriptRef::Explicit(path) => path.clone(),
            ScriptRef::Convention => analysis_root.join(component).join(format!(
                "monitoring_{}_{}.sh",
                component,
                snake_tag(monitoring_part)
            )),
        }
    }
}

/// One script run for one variable of one component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisJob {
    pub component: String,
    pub monitoring_part: String,
    pub variable: String,
    pub script: ScriptRef,
    pub args: Vec<String>,
}

impl fmt::Display for AnalysisJob {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.component, self.monitoring_part, self.variable
        )
    }
}

/// A job that did not make it through the pipeline.
pub struct FailedJob {
    job: String,
    error: String,
}

impl FailedJob {
    pub fn new(job: String, error: String) -> Self {
        Self { job, error }
    }
}

impl fmt::Debug for FailedJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.job, self.error)
    }
}
