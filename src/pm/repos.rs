//! Repository configuration for urpmi targets.
//!
//! `repos` is either `use-repositories-from-system`, in which case the host's
//! media list is read with `urpmq --list-url`, or a `|`-separated list of
//! `name url` media and `--distrib url` entries.

use anyhow::Result;
use regex::Regex;

use crate::error::Error;
use crate::util::run_command;

pub const USE_FROM_SYSTEM: &str = "use-repositories-from-system";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repos {
    /// Arguments for `urpmi.addmedia`, one list per media.
    pub medias: Vec<Vec<String>>,
    pub distribs: Vec<String>,
}

impl Repos {
    pub fn parse(line: &str) -> Self {
        let mut medias = Vec::new();
        let mut distribs = Vec::new();
        for entry in line.split('|').map(str::trim).filter(|e| !e.is_empty()) {
            let Some((first, rest)) = entry.split_once(char::is_whitespace) else {
                log::warn!("suspiciously small number of fields in urpmi media configuration: {entry}");
                continue;
            };
            let rest = rest.trim();
            if first == "--distrib" {
                distribs.push(rest.to_string());
            } else {
                medias.push(vec![first.to_string(), rest.to_string()]);
            }
        }
        Self { medias, distribs }
    }

    /// Resolves the configured line, asking the host for its medias when
    /// told to.
    pub fn resolve(line: &str, list_cmd: &[String], ignore: &Regex) -> Result<Self> {
        if line.trim() != USE_FROM_SYSTEM {
            return Ok(Self::parse(line));
        }
        log::debug!("no medias configured, reading them from the system");
        let output = run_command(list_cmd).map_err(|e| {
            Error::package_manager(
                format!("failed to discover repository information from the system: {e:#}"),
                None,
            )
        })?;
        Ok(Self {
            medias: system_medias(&output, ignore),
            distribs: Vec::new(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.medias.is_empty() && self.distribs.is_empty()
    }
}

fn system_medias(output: &str, ignore: &Regex) -> Vec<Vec<String>> {
    let mut found = Vec::new();
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        if ignore.is_match(line) {
            log::debug!("ignoring system media {line:?}");
            continue;
        }
        match shlex::split(line) {
            Some(words) => found.push(words),
            None => log::warn!("cannot parse media line {line:?}"),
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config_line() {
        let repos = Repos::parse(
            "main http://mirror/main | --distrib http://mirror/cooker |bogus| contrib http://mirror/contrib",
        );
        assert_eq!(
            repos.medias,
            vec![
                vec!["main".to_string(), "http://mirror/main".to_string()],
                vec!["contrib".to_string(), "http://mirror/contrib".to_string()],
            ]
        );
        assert_eq!(repos.distribs, vec!["http://mirror/cooker"]);
        assert!(Repos::parse("").is_empty());
    }

    #[test]
    fn test_system_medias_filtered() {
        let ignore = Regex::new("(debug|testing|backports)").unwrap();
        let out = "\"Main Release\" http://mirror/main/release\nMain Debug http://mirror/debug\n\n";
        assert_eq!(
            system_medias(out, &ignore),
            vec![vec!["Main Release".to_string(), "http://mirror/main/release".to_string()]]
        );
    }
}
