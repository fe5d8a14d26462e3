use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// rpmbuild `-b<stage>` letters.
const STAGES: &str = "pcilabstf";

/// A package build phase to stop at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildStage(char);

impl BuildStage {
    pub fn letter(self) -> char {
        self.0
    }

    pub fn as_flag(self) -> String {
        format!("-b{}", self.0)
    }
}

impl FromStr for BuildStage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) if STAGES.contains(c) => Ok(Self(c)),
            _ => Err(Error::Config(format!(
                "invalid build stage: {s} (one of: {})",
                STAGES.chars().map(String::from).collect::<Vec<_>>().join(", ")
            ))),
        }
    }
}

impl fmt::Display for BuildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
