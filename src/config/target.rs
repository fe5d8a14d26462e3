//! Typed per-target configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::root::RootState;

/// A filesystem mounted inside every active root, in list order.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct MountPoint {
    /// Device or, for bind mounts, the host directory.
    pub device: String,
    /// Mount point relative to the root.
    pub path: String,
    #[serde(default)]
    pub fstype: Option<String>,
    #[serde(default)]
    pub options: Option<String>,
    #[serde(default)]
    pub bind: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceKind {
    Char,
    Block,
}

/// A device node created inside fresh roots.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct DeviceNode {
    pub path: String,
    pub kind: DeviceKind,
    pub major: u64,
    pub minor: u64,
    pub mode: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct TargetConfig {
    #[serde(skip)]
    pub name: String,

    pub arch: String,
    #[serde(default)]
    pub arch_map: BTreeMap<String, Vec<String>>,
    pub root_type: String,
    pub pm_type: String,
    pub su_type: String,
    pub repos: String,
    pub base_packages: Vec<String>,
    pub interactive_packages: Vec<String>,

    pub jurt_base_dir: PathBuf,
    pub roots_path: PathBuf,
    pub builds_dir: PathBuf,
    pub spool_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub failure_dir: PathBuf,
    pub success_dir: PathBuf,
    pub chroot_cache_dir: PathBuf,
    pub chroot_cache_ext: String,

    pub build_user: String,
    pub builder_home: String,
    pub builder_uid: u32,
    pub chroot_spool_dir: String,
    pub built_dir_name: String,
    pub delivery_dir: String,
    pub delivery_log_file_ext: String,
    pub log_compress_level: i32,
    pub logs_dir_name: String,
    pub packages_dir_name: String,
    pub latest_link_name: String,
    pub buildid_timefmt: String,

    pub chroot_target_file: String,
    pub chroot_interactive_file: String,
    pub chroot_keep_file: String,
    pub latest_build_suffix: String,
    pub latest_interactive_suffix: String,
    pub old_roots_max_age_days: u64,

    pub root_copy_files: Vec<PathBuf>,
    pub root_post_command: String,
    pub allow_interactive_shell: bool,
    pub interactive: bool,
    #[serde(default)]
    pub mountpoints: Vec<MountPoint>,
    #[serde(default)]
    pub devices: Vec<DeviceNode>,

    pub sudo_command: Vec<String>,
    pub root_command: Vec<String>,
    pub command_poll_time: f64,
    pub jurt_group: String,
    pub adduser_command: Vec<String>,
    pub chroot_command: Vec<String>,
    pub su_command: Vec<String>,
    pub su_for_post_command: Vec<String>,
    pub timeout_command: Vec<String>,
    pub remount_command: Vec<String>,
    pub mount_command: Vec<String>,
    pub umount_command: Vec<String>,
    pub tmpfs_mount_command: Vec<String>,
    pub tmpfs_umount_command: Vec<String>,
    pub sudo_interactive_shell_command: Vec<String>,
    pub interactive_shell_command: Vec<String>,
    pub sudo_pm_allow_format: String,
    pub sudoers: PathBuf,
    pub btrfs_create_subvol_command: Vec<String>,
    pub btrfs_snapshot_subvol_command: Vec<String>,
    pub btrfs_delete_subvol_command: Vec<String>,

    pub urpmi_command: Vec<String>,
    pub urpmiaddmedia_command: Vec<String>,
    pub urpmi_update_command: Vec<String>,
    pub urpmi_extra_options: Vec<String>,
    pub urpmi_valid_options: Vec<String>,
    pub urpmi_list_medias_command: Vec<String>,
    pub urpmi_ignore_system_medias: String,
    pub urpmi_fatal_output: String,
    pub interactive_allowed_urpmi_commands: Vec<String>,
    pub genhdlist_command: Vec<String>,

    pub rpm_query_command: Vec<String>,
    pub rpm_install_source_command: Vec<String>,
    pub rpm_build_source_command: Vec<String>,
    pub rpm_collect_glob: Vec<String>,
    pub rpm_get_arch_command: Vec<String>,
    pub rpm_get_packager_command: Vec<String>,
    pub rpm_packager: String,
    pub rpm_packager_default: String,
    pub rpm_topdir: String,
    pub rpm_topdir_subdirs: Vec<String>,
    pub rpm_macros_file: String,
    #[serde(default)]
    pub rpm_build_macros: BTreeMap<String, String>,
}

impl TargetConfig {
    pub fn state_dir(&self, state: RootState) -> PathBuf {
        self.roots_path.join(state.dir_name())
    }

    pub fn builder_home_for(&self, username: &str) -> String {
        self.builder_home.replace("${username}", username)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.command_poll_time.max(0.01))
    }

    /// Host directory holding the cached template for one creation mode.
    pub fn template_cache_path(&self, interactive: bool) -> PathBuf {
        self.chroot_cache_dir.join(format!(
            "{}-{}{}",
            self.name,
            mode_name(interactive),
            self.chroot_cache_ext
        ))
    }

    pub fn template_snapshot_path(&self, interactive: bool) -> PathBuf {
        self.roots_path
            .join(format!("{}-{}", self.name, mode_name(interactive)))
    }

    pub fn template_lock_path(&self, interactive: bool) -> PathBuf {
        self.roots_path
            .join(format!(".{}-{}.lock", self.name, mode_name(interactive)))
    }

    pub fn max_old_root_age(&self) -> Duration {
        Duration::from_secs(self.old_roots_max_age_days * 24 * 3600)
    }

    pub fn delivery_path(&self) -> PathBuf {
        crate::util::expand_home(&self.delivery_dir)
    }

    pub fn is_under_roots(&self, path: &Path) -> bool {
        crate::util::fs::is_below(&self.roots_path, path).unwrap_or(false)
    }
}

pub fn mode_name(interactive: bool) -> &'static str {
    if interactive {
        "interactive"
    } else {
        "build"
    }
}
