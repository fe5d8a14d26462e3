//! Built-in configuration, always loaded first.
//!
//! String values may reference other keys of the same table with `${key}`.

pub const DEFAULT_CONFIG: &str = r#"
[jurt]
default-target = "undefined"
check-permissions = true

[conf]
path-environment = "JURT_CONF"
user-file = "~/.jurt.toml"
system-file = "/etc/jurt/jurt.toml"

[any-target]
arch = "host"
arch-map = { i586 = ["/usr/bin/setarch", "i586"] }
root-type = "chroot-with-cache"
pm-type = "urpmi"
su-type = "jurt-root-wrapper"
repos = "use-repositories-from-system"
base-packages = ["basesystem-minimal", "rpm-build", "rpm-mandriva-setup", "urpmi", "rsync", "bzip2"]
interactive-packages = ["sudo"]

jurt-base-dir = "/var/spool/jurt"
roots-path = "${jurt-base-dir}/chroots"
builds-dir = "${jurt-base-dir}/builds"
spool-dir = "${builds-dir}/spools"
logs-dir = "${builds-dir}/logs"
failure-dir = "${builds-dir}/fail"
success-dir = "${builds-dir}/success"
chroot-cache-dir = "${jurt-base-dir}/chroots/cached"
chroot-cache-ext = ".tar.zst"

build-user = "builder"
builder-home = "/home/${username}"
builder-uid = 65555
chroot-spool-dir = "/build-spool"
built-dir-name = "packages"
delivery-dir = "~/jurt"
delivery-log-file-ext = ".zst"
log-compress-level = 19
logs-dir-name = "logs"
packages-dir-name = "packages"
latest-link-name = "latest"
buildid-timefmt = "[year].[month].[day].[hour][minute][second]"

chroot-target-file = "/.jurt-target"
chroot-interactive-file = "/.jurt-interactive"
chroot-keep-file = "/.jurt-keep"
latest-build-suffix = "-build-latest"
latest-interactive-suffix = "-interactive-latest"
old-roots-max-age-days = 14

root-copy-files = ["/etc/hosts", "/etc/resolv.conf"]
root-post-command = "passwd -l root; touch /jurt-root"
allow-interactive-shell = true
interactive = false

sudo-command = ["/usr/bin/sudo", "-n"]
root-command = ["/usr/sbin/jurt-root-command"]
command-poll-time = 0.5
jurt-group = "jurt"

adduser-command = ["/usr/sbin/adduser"]
chroot-command = ["/usr/bin/env", "-i", "/usr/sbin/chroot"]
su-command = ["/bin/su", "-l"]
su-for-post-command = ["/bin/su", "-l", "-c"]
timeout-command = ["timeout"]
remount-command = []
mount-command = ["mount"]
umount-command = ["umount"]
tmpfs-mount-command = ["mount", "-t", "tmpfs", "-o", "mode=0755", "none"]
tmpfs-umount-command = ["umount"]
sudo-interactive-shell-command = ["sudo", "-i"]
interactive-shell-command = ["/usr/bin/env", "PS1=\\u@${target} \\w> ", "TERM=xterm", "/bin/bash"]
sudo-pm-allow-format = "${user} ALL=(ALL) NOPASSWD: ${commands}"
sudoers = "/etc/sudoers"

btrfs-create-subvol-command = ["/sbin/btrfs", "subvolume", "create"]
btrfs-snapshot-subvol-command = ["/sbin/btrfs", "subvolume", "snapshot"]
btrfs-delete-subvol-command = ["/sbin/btrfs", "subvolume", "delete"]

urpmi-command = ["/usr/bin/env", "-i", "/usr/sbin/urpmi"]
urpmiaddmedia-command = ["/usr/sbin/urpmi.addmedia", "--no-md5sum"]
urpmi-update-command = ["/usr/sbin/urpmi.update", "-a"]
urpmi-extra-options = ["--no-suggests", "--excludedocs"]
urpmi-valid-options = [
    "root=", "auto", "no-suggests", "excludedocs", "auto-select", "proxy=",
    "use-distrib=", "urpmi-root=", "distrib=", "buildrequires", "searchmedia=",
    "sortmedia=", "update", "synthesis=", "auto-update", "no-md5sum", "force-key",
    "no-uninstall", "no-install", "keep", "split-level=", "split-length=", "clean",
    "quiet", "debug", "allow-suggests", "justdb", "replacepkgs", "allow-nodeps",
    "allow-force", "parallel=", "download-all=", "downloader=", "limit-rate=",
    "resume", "retry=", "verify-rpm", "no-verify-rpm", "excludepath=", "ignorearch",
    "ignoresize", "noscripts", "nolock",
]
urpmi-list-medias-command = ["/usr/sbin/urpmq", "--list-url"]
urpmi-ignore-system-medias = "(debug|testing|backports)"
urpmi-fatal-output = "(No space left on device|A requested package cannot be installed)"
interactive-allowed-urpmi-commands = [
    "/bin/rpm", "/usr/sbin/urpmi", "/usr/sbin/urpme", "/usr/sbin/urpmi.addmedia",
    "/usr/sbin/urpmi.update", "/usr/sbin/urpmi.removemedia",
]
genhdlist-command = ["/usr/bin/genhdlist2", "--allow-empty-media"]

rpm-query-command = ["/bin/rpm", "-q", "-p", "--qf"]
rpm-install-source-command = ["/bin/rpm", "--nodeps", "-i"]
rpm-build-source-command = ["/usr/bin/rpmbuild"]
rpm-collect-glob = ["RPMS/*/*.rpm", "SRPMS/*.src.rpm"]
rpm-get-arch-command = ["/bin/rpm", "--eval", "%{mandriva_arch}"]
rpm-get-packager-command = ["/bin/rpm", "--eval", "%{?packager}%{?!packager:PACKAGER_UNDEFINED}"]
rpm-packager = "undefined"
rpm-packager-default = "Jurt Build Bot <root@mandriva.org>"
rpm-topdir = "~"
rpm-topdir-subdirs = ["BUILD", "BUILDROOT", "RPMS", "SOURCES", "SPECS", "SRPMS"]
rpm-macros-file = "~/.rpmmacros"
rpm-build-macros = {}

[[any-target.mountpoints]]
device = "none"
path = "/proc"
fstype = "proc"

[[any-target.mountpoints]]
device = "none"
path = "/sys"
fstype = "sysfs"

[[any-target.mountpoints]]
device = "none"
path = "/dev/pts"
fstype = "devpts"
options = "gid=5,mode=620"

[[any-target.mountpoints]]
device = "none"
path = "/dev/shm"
fstype = "tmpfs"

[[any-target.devices]]
path = "/dev/null"
kind = "char"
major = 1
minor = 3
mode = 0o666

[[any-target.devices]]
path = "/dev/zero"
kind = "char"
major = 1
minor = 5
mode = 0o666

[[any-target.devices]]
path = "/dev/random"
kind = "char"
major = 1
minor = 8
mode = 0o666

[[any-target.devices]]
path = "/dev/urandom"
kind = "char"
major = 1
minor = 9
mode = 0o666

[[any-target.devices]]
path = "/dev/tty"
kind = "char"
major = 5
minor = 0
mode = 0o666

[[any-target.devices]]
path = "/dev/ptmx"
kind = "char"
major = 5
minor = 2
mode = 0o666

[target]
"#;
