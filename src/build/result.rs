use std::path::PathBuf;

use serde::Serialize;

use crate::pm::PackageInfo;

/// Outcome of building one source package.
#[derive(Debug, Clone, Serialize)]
pub struct BuildResult {
    pub id: String,
    pub source_id: String,
    pub package: PackageInfo,
    pub success: bool,
    pub timed_out: bool,
    /// Why the build did not produce packages, when it failed before or
    /// around the build step itself.
    pub failure: Option<String>,
    /// Host paths of the collected packages.
    pub artifacts: Vec<PathBuf>,
}

impl BuildResult {
    pub fn failed(id: &str, source_id: &str, package: PackageInfo, reason: String) -> Self {
        Self {
            id: id.to_string(),
            source_id: source_id.to_string(),
            package,
            success: false,
            timed_out: false,
            failure: Some(reason),
            artifacts: Vec::new(),
        }
    }
}

/// Everything one `build` call produced.
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub id: String,
    pub results: Vec<BuildResult>,
    pub delivery: PathBuf,
}

impl BatchReport {
    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(|r| r.success)
    }

    pub fn failures(&self) -> impl Iterator<Item = &BuildResult> {
        self.results.iter().filter(|r| !r.success)
    }
}
