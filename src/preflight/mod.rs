//! Preflight checks for `jurt check`.
//!
//! Validates that the host has the tools a target's configuration refers
//! to before anything is built. This prevents cryptic errors halfway
//! through creating a root.

use anyhow::Result;

use crate::config::TargetConfig;
use crate::error::Error;

/// Check if a command exists on the host system.
///
/// Absolute paths are checked as-is, bare names are looked up in `PATH`.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Program a command setting runs, looking through `env` wrappers.
fn program_of(command: &[String]) -> Option<&String> {
    command.iter().find(|arg| {
        !(arg.starts_with('-') || arg.contains('=') || arg.rsplit('/').next() == Some("env"))
    })
}

/// Programs a target runs on the host, each with the package providing
/// it. Empty command settings are skipped.
pub fn target_tools(cfg: &TargetConfig) -> Vec<(String, &'static str)> {
    let commands: [(&[String], &'static str); 9] = [
        (&cfg.sudo_command, "sudo"),
        (&cfg.root_command, "jurt"),
        (&cfg.chroot_command, "coreutils"),
        (&cfg.mount_command, "util-linux"),
        (&cfg.umount_command, "util-linux"),
        (&cfg.timeout_command, "coreutils"),
        (&cfg.rpm_query_command, "rpm"),
        (&cfg.urpmi_command, "urpmi"),
        (&cfg.genhdlist_command, "genhdlist2"),
    ];
    let mut tools: Vec<(String, &'static str)> = Vec::new();
    for (command, package) in commands {
        if let Some(program) = program_of(command) {
            if !tools.iter().any(|(t, _)| t == program) {
                tools.push((program.clone(), package));
            }
        }
    }
    tools
}

/// Check that specific tools are available.
///
/// # Returns
///
/// * `Ok(())` if all tools are found
/// * `Err` with list of missing tools and their packages
pub fn check_required_tools<S: AsRef<str>>(tools: &[(S, &str)]) -> Result<()> {
    let missing: Vec<String> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool.as_ref()))
        .map(|(tool, package)| format!("  {} (install: {})", tool.as_ref(), package))
        .collect();

    if !missing.is_empty() {
        return Err(Error::Setup(format!(
            "Missing required host tools:\n{}",
            missing.join("\n")
        ))
        .into());
    }
    Ok(())
}

pub fn check_target_tools(cfg: &TargetConfig) -> Result<()> {
    log::debug!("checking host tools for target {}", cfg.name);
    check_required_tools(&target_tools(cfg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_command_exists() {
        assert!(command_exists("sh"));
        assert!(command_exists("/bin/sh"));
        assert!(!command_exists("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn test_check_required_tools() {
        assert!(check_required_tools(&[("sh", "dash"), ("cat", "coreutils")]).is_ok());
        let err = check_required_tools(&[("nonexistent_command_xyz", "fake-package")]).unwrap_err();
        assert!(err.to_string().contains("fake-package"));
    }

    #[test]
    fn test_target_tools_from_config() {
        let mut config = Config::new().unwrap();
        config.merge_str("[target.x]\nchroot-command = []\n").unwrap();
        let cfg = config.target("x").unwrap();
        let tools = target_tools(&cfg);
        let names: Vec<&str> = tools.iter().map(|(t, _)| t.as_str()).collect();
        assert!(names.contains(&"/usr/bin/sudo"));
        assert!(names.contains(&"timeout"));
        assert!(names.contains(&"/usr/sbin/urpmi"));
        assert!(!names.contains(&"/usr/bin/env"));
        assert!(!names.contains(&"/usr/sbin/chroot"));
    }
}
